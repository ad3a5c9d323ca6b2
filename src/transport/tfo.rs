//! TCP Fast Open support probe

/// Kernel TFO mode bits from `/proc/sys/net/ipv4/tcp_fastopen`.
#[cfg(target_os = "linux")]
mod mode {
    pub const CLIENT: i32 = 0x1;
}

/// Whether outbound TFO is worth asking for: the kernel advertises client
/// mode. Cached after the first probe; a kernel does not change its mind
/// mid-process.
#[cfg(target_os = "linux")]
pub fn client_enabled() -> bool {
    use std::sync::OnceLock;

    static ENABLED: OnceLock<bool> = OnceLock::new();

    *ENABLED.get_or_init(|| {
        std::fs::read_to_string("/proc/sys/net/ipv4/tcp_fastopen")
            .ok()
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .map(|value| value & mode::CLIENT != 0)
            .unwrap_or(false)
    })
}

#[cfg(not(target_os = "linux"))]
pub fn client_enabled() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_is_stable() {
        // Whatever the kernel says, the cached answer must not flap.
        assert_eq!(client_enabled(), client_enabled());
    }
}
