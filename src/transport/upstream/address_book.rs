//! Telegram DC address book

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Telegram runs five production datacenters.
pub const KNOWN_DCS: i16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferIp {
    PreferIpv4,
    PreferIpv6,
    OnlyIpv4,
    OnlyIpv6,
}

impl FromStr for PreferIp {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "prefer-ipv4" => Ok(Self::PreferIpv4),
            "prefer-ipv6" => Ok(Self::PreferIpv6),
            "only-ipv4" => Ok(Self::OnlyIpv4),
            "only-ipv6" => Ok(Self::OnlyIpv6),
            other => Err(ProxyError::InvalidConfig(format!(
                "unknown ip preference {other:?}"
            ))),
        }
    }
}

/// One generation of the address table: per-DC endpoint lists for each
/// address family. Replaced atomically on refresh.
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    v4: [Vec<SocketAddr>; KNOWN_DCS as usize],
    v6: [Vec<SocketAddr>; KNOWN_DCS as usize],
}

impl AddressTable {
    fn get(list: &[Vec<SocketAddr>; KNOWN_DCS as usize], dc: i16) -> Vec<SocketAddr> {
        // Out-of-range DCs (hostile scans use 203, 999, ...) resolve to an
        // empty list, never an error.
        if !(1..=KNOWN_DCS).contains(&dc) {
            return Vec::new();
        }

        let mut addrs = list[(dc - 1) as usize].clone();
        if addrs.len() > 1 {
            addrs.shuffle(&mut rand::thread_rng());
        }
        addrs
    }

    fn v4(&self, dc: i16) -> Vec<SocketAddr> {
        Self::get(&self.v4, dc)
    }

    fn v6(&self, dc: i16) -> Vec<SocketAddr> {
        Self::get(&self.v6, dc)
    }
}

/// Hard-coded production endpoints; never overwritten by refresh.
pub fn production_table() -> AddressTable {
    AddressTable {
        v4: [
            vec!["149.154.175.50:443".parse().expect("static addr")],
            vec![
                "149.154.167.51:443".parse().expect("static addr"),
                "95.161.76.100:443".parse().expect("static addr"),
            ],
            vec!["149.154.175.100:443".parse().expect("static addr")],
            vec!["149.154.167.91:443".parse().expect("static addr")],
            vec!["149.154.171.5:443".parse().expect("static addr")],
        ],
        v6: [
            vec!["[2001:b28:f23d:f001::a]:443".parse().expect("static addr")],
            vec!["[2001:67c:4e8:f002::a]:443".parse().expect("static addr")],
            vec!["[2001:b28:f23d:f003::a]:443".parse().expect("static addr")],
            vec!["[2001:67c:4e8:f004::a]:443".parse().expect("static addr")],
            vec!["[2001:b28:f23f:f005::a]:443".parse().expect("static addr")],
        ],
    }
}

/// Staging endpoints (DC 1-3 only).
pub fn test_table() -> AddressTable {
    AddressTable {
        v4: [
            vec!["149.154.175.10:443".parse().expect("static addr")],
            vec!["149.154.167.40:443".parse().expect("static addr")],
            vec!["149.154.175.117:443".parse().expect("static addr")],
            Vec::new(),
            Vec::new(),
        ],
        v6: [
            vec!["[2001:b28:f23d:f001::e]:443".parse().expect("static addr")],
            vec!["[2001:67c:4e8:f002::e]:443".parse().expect("static addr")],
            vec!["[2001:b28:f23d:f003::e]:443".parse().expect("static addr")],
            Vec::new(),
            Vec::new(),
        ],
    }
}

/// JSON shape of the optional DC address file:
/// `{"v4": {"1": ["149.154.175.50:443"], ...}, "v6": {...}}`.
#[derive(Debug, Deserialize)]
struct DcConfigFile {
    #[serde(default)]
    v4: HashMap<String, Vec<String>>,
    #[serde(default)]
    v6: HashMap<String, Vec<String>>,
}

/// Parse the refresh file. Unknown DC keys and unparseable endpoints are
/// skipped; at least one valid IPv4 entry for DC 1-5 is required so a
/// truncated file cannot empty the table.
pub fn parse_dc_config(data: &[u8]) -> Result<AddressTable> {
    let config: DcConfigFile = serde_json::from_slice(data)
        .map_err(|e| ProxyError::InvalidConfig(format!("cannot parse DC config: {e}")))?;

    let mut table = AddressTable::default();

    fill_family(&config.v4, &mut table.v4);
    fill_family(&config.v6, &mut table.v6);

    if table.v4.iter().all(|addrs| addrs.is_empty()) {
        return Err(ProxyError::InvalidConfig(
            "DC config must contain at least one valid v4 address for DC 1-5".into(),
        ));
    }

    Ok(table)
}

fn fill_family(
    source: &HashMap<String, Vec<String>>,
    target: &mut [Vec<SocketAddr>; KNOWN_DCS as usize],
) {
    for (dc_key, addrs) in source {
        let Ok(dc) = dc_key.parse::<i16>() else {
            continue;
        };
        if !(1..=KNOWN_DCS).contains(&dc) {
            continue;
        }

        target[(dc - 1) as usize] = addrs
            .iter()
            .filter_map(|addr| addr.parse().ok())
            .collect();
    }
}

/// Refreshable address book: reads take the lock per dial, writes happen
/// only on refresh.
pub struct AddressBook {
    table: RwLock<AddressTable>,
    prefer: PreferIp,
}

impl AddressBook {
    pub fn new(table: AddressTable, prefer: PreferIp) -> Self {
        Self {
            table: RwLock::new(table),
            prefer,
        }
    }

    /// Endpoints for `dc`, ordered by the configured family preference and
    /// shuffled within each family.
    pub fn addresses(&self, dc: i16) -> Vec<SocketAddr> {
        let table = self.table.read();

        match self.prefer {
            PreferIp::OnlyIpv4 => table.v4(dc),
            PreferIp::OnlyIpv6 => table.v6(dc),
            PreferIp::PreferIpv4 => {
                let mut addrs = table.v4(dc);
                addrs.extend(table.v6(dc));
                addrs
            }
            PreferIp::PreferIpv6 => {
                let mut addrs = table.v6(dc);
                addrs.extend(table.v4(dc));
                addrs
            }
        }
    }

    pub fn is_known_dc(&self, dc: i16) -> bool {
        (1..=KNOWN_DCS).contains(&dc) && !self.addresses(dc).is_empty()
    }

    /// Any known DC; every Telegram DC can serve any account, only latency
    /// differs.
    pub fn random_dc(&self) -> i16 {
        let candidates: Vec<i16> = (1..=KNOWN_DCS).filter(|&dc| self.is_known_dc(dc)).collect();
        if candidates.is_empty() {
            return 1;
        }
        candidates[rand::thread_rng().gen_range(0..candidates.len())]
    }

    pub fn random_dc_excluding(&self, exclude: i16) -> i16 {
        let candidates: Vec<i16> = (1..=KNOWN_DCS)
            .filter(|&dc| dc != exclude && self.is_known_dc(dc))
            .collect();
        if candidates.is_empty() {
            return self.random_dc();
        }
        candidates[rand::thread_rng().gen_range(0..candidates.len())]
    }

    /// Swap in a freshly parsed table.
    pub fn update(&self, table: AddressTable) {
        *self.table.write() = table;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> AddressBook {
        AddressBook::new(production_table(), PreferIp::PreferIpv4)
    }

    #[test]
    fn test_known_dc_range() {
        let book = book();
        for dc in 1..=5 {
            assert!(book.is_known_dc(dc), "dc {dc}");
        }
        assert!(!book.is_known_dc(0));
        assert!(!book.is_known_dc(6));
        assert!(!book.is_known_dc(203));
        assert!(!book.is_known_dc(-1));
    }

    #[test]
    fn test_out_of_range_dc_yields_empty_list() {
        let book = book();
        assert!(book.addresses(203).is_empty());
        assert!(book.addresses(0).is_empty());
        assert!(book.addresses(-2).is_empty());
    }

    #[test]
    fn test_prefer_ipv4_order() {
        let book = book();
        let addrs = book.addresses(1);
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
    }

    #[test]
    fn test_only_ipv6() {
        let book = AddressBook::new(production_table(), PreferIp::OnlyIpv6);
        let addrs = book.addresses(2);
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
    }

    #[test]
    fn test_parse_dc_config() {
        let json = br#"{
            "v4": {
                "1": ["10.0.0.1:443"],
                "2": ["10.0.0.2:443", "10.0.0.3:443"],
                "9": ["10.9.9.9:443"],
                "bogus": ["10.8.8.8:443"]
            },
            "v6": {
                "1": ["[2001:db8::1]:443"]
            }
        }"#;

        let table = parse_dc_config(json).unwrap();
        assert_eq!(table.v4(1).len(), 1);
        assert_eq!(table.v4(2).len(), 2);
        assert!(table.v4(3).is_empty());
        assert_eq!(table.v6(1).len(), 1);
    }

    #[test]
    fn test_parse_dc_config_requires_v4() {
        assert!(parse_dc_config(b"{}").is_err());
        assert!(parse_dc_config(br#"{"v6": {"1": ["[2001:db8::1]:443"]}}"#).is_err());
        assert!(parse_dc_config(b"not json at all").is_err());
    }

    #[test]
    fn test_update_swaps_table() {
        let book = book();
        let json = br#"{"v4": {"1": ["10.0.0.1:443"]}}"#;
        book.update(parse_dc_config(json).unwrap());

        assert_eq!(
            book.addresses(1),
            vec!["10.0.0.1:443".parse().unwrap()]
        );
        assert!(!book.is_known_dc(2));
    }

    #[test]
    fn test_random_dc_excluding() {
        let book = book();
        for _ in 0..50 {
            assert_ne!(book.random_dc_excluding(3), 3);
        }
    }

    #[test]
    fn test_test_table_has_three_dcs() {
        let book = AddressBook::new(test_table(), PreferIp::OnlyIpv4);
        assert!(book.is_known_dc(1));
        assert!(book.is_known_dc(3));
        assert!(!book.is_known_dc(4));
    }
}
