//! Client handler

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::crypto::SecureRandom;
use crate::error::{ProxyError, Result};
use crate::events::{Event, EventBus, StreamId};
use crate::protocol::constants::HANDSHAKE_LEN;
use crate::protocol::obfuscated2::{self, CipherPair};
use crate::protocol::tls::{self, build_welcome_packet, ClientHello, TlsRecord};
use crate::protocol::Secret;
use crate::proxy::admission::RateLimiter;
use crate::proxy::masking::{self, FrontingTarget};
use crate::proxy::relay::relay_bidirectional;
use crate::stats::{Counter, ReplayChecker, Stats};
use crate::stream::{BufferPool, CryptoReader, CryptoWriter, FakeTlsReader, FakeTlsWriter};
use crate::transport::dns::Resolver;
use crate::transport::upstream::{LeasedConn, UpstreamManager};
use crate::transport::{configure_client_socket, sockopts};
use crate::util::IpHasher;

/// TCP_USER_TIMEOUT for both relay sockets.
const RELAY_USER_TIMEOUT_MS: u32 = 30_000;

/// TCP_NOTSENT_LOWAT for the client (downstream) socket.
const NOTSENT_LOWAT: u32 = 131_072;

/// Records below this size cannot hold a FakeTLS ClientHello.
const MIN_CLIENT_HELLO_LEN: usize = 512;

const MAX_CLIENT_HELLO_LEN: usize = tls::MAX_RECORD_PAYLOAD + 2048;

pub struct ClientHandler;

pub struct RunningClientHandler {
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    secret: Arc<Secret>,
    stats: Arc<Stats>,
    replay_checker: Arc<ReplayChecker>,
    upstream: Arc<UpstreamManager>,
    buffer_pool: Arc<BufferPool>,
    rng: Arc<SecureRandom>,
    events: EventBus,
    resolver: Arc<Resolver>,
    ip_hasher: Arc<IpHasher>,
    rate_limiter: Option<Arc<RateLimiter>>,
    cancel: watch::Receiver<bool>,
}

impl ClientHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<ProxyConfig>,
        secret: Arc<Secret>,
        stats: Arc<Stats>,
        replay_checker: Arc<ReplayChecker>,
        upstream: Arc<UpstreamManager>,
        buffer_pool: Arc<BufferPool>,
        rng: Arc<SecureRandom>,
        events: EventBus,
        resolver: Arc<Resolver>,
        ip_hasher: Arc<IpHasher>,
        rate_limiter: Option<Arc<RateLimiter>>,
        cancel: watch::Receiver<bool>,
    ) -> RunningClientHandler {
        RunningClientHandler {
            stream,
            peer,
            config,
            secret,
            stats,
            replay_checker,
            upstream,
            buffer_pool,
            rng,
            events,
            resolver,
            ip_hasher,
            rate_limiter,
            cancel,
        }
    }
}

/// What the handshake phase decided to do with the connection.
enum Disposition {
    /// Both handshakes succeeded; relay between the wrapped endpoints.
    Relay {
        client_reader: CryptoReader<FakeTlsReader<OwnedReadHalf>>,
        client_writer: CryptoWriter<FakeTlsWriter<OwnedWriteHalf>>,
        tg: TcpStream,
        tg_ciphers: CipherPair,
        dc: i16,
    },
    /// FakeTLS failed; splice to the fronting domain, replaying `prefix`.
    Front {
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        prefix: Vec<u8>,
    },
    /// Obfuscated2 or DC selection failed; just drop the socket.
    Close,
}

impl RunningClientHandler {
    pub async fn run(self) -> Result<()> {
        let peer = self.peer;
        let ip_tag = self.ip_hasher.hash(peer.ip());

        // Admission runs before any crypto work so a flood costs us one
        // map lookup per connection, not an HMAC.
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(peer.ip()) {
                info!(ip = %ip_tag, "rate limited");
                self.events.send(Event::ConcurrencyLimited).await;
                return Ok(());
            }
        }

        self.stats.count(Counter::Connects);

        let stream_id = StreamId::generate(&self.rng);
        debug!(stream_id = %stream_id, ip = %ip_tag, "stream started");

        self.events
            .send(Event::Start {
                stream_id,
                remote_ip: peer.ip(),
            })
            .await;

        configure_client_socket(&self.stream);
        sockopts::tune_for_relay(&self.stream, RELAY_USER_TIMEOUT_MS);
        // Downstream-only tuning; the Telegram socket never gets these.
        sockopts::set_quickack(&self.stream);
        sockopts::set_notsent_lowat(&self.stream, NOTSENT_LOWAT);

        let events = self.events.clone();
        let result = self.process(stream_id, &ip_tag).await;

        events.send(Event::Finish { stream_id }).await;

        match &result {
            Ok(()) => debug!(stream_id = %stream_id, "stream finished"),
            Err(e) => debug!(stream_id = %stream_id, error = %e, "stream finished with error"),
        }

        result
    }

    async fn process(self, stream_id: StreamId, ip_tag: &str) -> Result<()> {
        let RunningClientHandler {
            stream,
            peer: _,
            config,
            secret,
            stats,
            replay_checker,
            upstream,
            buffer_pool,
            rng,
            events,
            resolver,
            ip_hasher: _,
            rate_limiter: _,
            cancel,
        } = self;

        let handshake = handshake_phase(
            stream,
            stream_id,
            &config,
            &secret,
            &stats,
            &replay_checker,
            &upstream,
            &buffer_pool,
            &rng,
            &events,
        );

        let disposition = match timeout(config.handshake_timeout(), handshake).await {
            Ok(Ok(disposition)) => disposition,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                stats.count(Counter::HandshakeTimeouts);
                debug!(stream_id = %stream_id, ip = %ip_tag, "handshake timed out");
                return Err(ProxyError::HandshakeTimeout);
            }
        };

        match disposition {
            Disposition::Close => Ok(()),
            Disposition::Front {
                reader,
                writer,
                prefix,
            } => {
                let target = FrontingTarget {
                    host: secret.host.clone(),
                    port: config.fronting.port,
                    dial_timeout: Duration::from_secs(config.timeouts.dc_dial_secs),
                    fastopen: config.telegram.enable_tfo,
                };

                masking::handle_bad_client(
                    reader,
                    writer,
                    &prefix,
                    &target,
                    &resolver,
                    stream_id,
                    stats,
                    events,
                    buffer_pool,
                    cancel,
                )
                .await;

                Ok(())
            }
            Disposition::Relay {
                client_reader,
                client_writer,
                tg,
                tg_ciphers,
                dc,
            } => {
                let session = stats.begin_dc_session(dc);

                sockopts::tune_for_relay(&tg, RELAY_USER_TIMEOUT_MS);

                let (tg_read, tg_write) = tg.into_split();
                let tg_reader = CryptoReader::new(tg_read, tg_ciphers.decryptor);
                let tg_writer =
                    CryptoWriter::new(tg_write, tg_ciphers.encryptor, buffer_pool.clone());

                relay_bidirectional(
                    client_reader,
                    client_writer,
                    tg_reader,
                    tg_writer,
                    stream_id,
                    Some(dc),
                    stats.clone(),
                    events,
                    buffer_pool,
                    cancel,
                )
                .await;

                drop(session);
                Ok(())
            }
        }
    }
}

/// FakeTLS validation, Obfuscated2 on both legs and the DC dial. Runs
/// under the handshake deadline; the relay and fronting phases do not.
#[allow(clippy::too_many_arguments)]
async fn handshake_phase(
    mut stream: TcpStream,
    stream_id: StreamId,
    config: &ProxyConfig,
    secret: &Secret,
    stats: &Stats,
    replay_checker: &ReplayChecker,
    upstream: &UpstreamManager,
    buffer_pool: &Arc<BufferPool>,
    rng: &SecureRandom,
    events: &EventBus,
) -> Result<Disposition> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;

    if !tls::looks_like_tls_handshake(&header[..3]) {
        debug!(stream_id = %stream_id, "first bytes are not a TLS handshake");
        return front(stream, header.to_vec(), stream_id, stats, events).await;
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if !(MIN_CLIENT_HELLO_LEN..=MAX_CLIENT_HELLO_LEN).contains(&record_len) {
        debug!(stream_id = %stream_id, record_len = record_len, "implausible client hello length");
        return front(stream, header.to_vec(), stream_id, stats, events).await;
    }

    // The sniff above already pinned type and version, so errors here are
    // transport errors, not protocol ones.
    let record = TlsRecord::read_body(&mut stream, &header).await?;

    let mut consumed = header.to_vec();
    consumed.extend_from_slice(&record.payload);

    let hello = match ClientHello::parse(&secret.key, &record.payload) {
        Ok(hello) => hello,
        Err(e) => {
            debug!(stream_id = %stream_id, error = %e, "cannot parse client hello");
            return front(stream, consumed, stream_id, stats, events).await;
        }
    };

    if let Err(e) = hello.valid(&secret.host, config.tolerate_time_skew()) {
        debug!(
            stream_id = %stream_id,
            hostname = %hello.host,
            error = %e,
            "invalid faketls client hello"
        );
        return front(stream, consumed, stream_id, stats, events).await;
    }

    if replay_checker.seen_before(&hello.session_id) {
        info!(stream_id = %stream_id, "replay attack detected");
        events.send(Event::ReplayAttack { stream_id }).await;
        return front(stream, consumed, stream_id, stats, events).await;
    }

    let welcome = build_welcome_packet(&secret.key, &hello, rng);
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(&welcome).await?;
    write_half.flush().await?;

    let mut tls_reader = FakeTlsReader::new(read_half);
    let tls_writer = FakeTlsWriter::new(write_half, buffer_pool.clone());

    let mut frame = [0u8; HANDSHAKE_LEN];
    tls_reader.read_exact(&mut frame).await?;

    let client_hs = match obfuscated2::client_handshake(&secret.key, &frame) {
        Ok(hs) => hs,
        Err(e) => {
            stats.count(Counter::BadClients);
            info!(stream_id = %stream_id, error = %e, "obfuscated2 handshake failed");
            return Ok(Disposition::Close);
        }
    };

    let requested_dc = client_hs.dc;
    let dc = if upstream.is_known_dc(requested_dc) {
        requested_dc
    } else if config.telegram.allow_fallback_on_unknown_dc {
        let fallback = upstream.fallback_dc();
        warn!(stream_id = %stream_id, dc = requested_dc, fallback_dc = fallback, "unknown DC, falling back");
        fallback
    } else {
        // Hostile scans ask for DC 203 and friends; keep the logs quiet.
        debug!(stream_id = %stream_id, dc = requested_dc, "unsupported DC requested");
        return Ok(Disposition::Close);
    };

    let (tg, tg_ciphers) =
        telegram_handshake(upstream, dc, requested_dc, stream_id, config, rng).await?;

    events
        .send(Event::ConnectedToDc {
            stream_id,
            remote_ip: tg.peer_addr()?.ip(),
            dc,
        })
        .await;
    debug!(stream_id = %stream_id, dc = dc, "connected to telegram");

    Ok(Disposition::Relay {
        client_reader: CryptoReader::new(tls_reader, client_hs.ciphers.decryptor),
        client_writer: CryptoWriter::new(
            tls_writer,
            client_hs.ciphers.encryptor,
            buffer_pool.clone(),
        ),
        tg,
        tg_ciphers,
        dc,
    })
}

async fn front(
    stream: TcpStream,
    prefix: Vec<u8>,
    stream_id: StreamId,
    stats: &Stats,
    events: &EventBus,
) -> Result<Disposition> {
    stats.count(Counter::BadClients);
    events.send(Event::DomainFronting { stream_id }).await;

    let (reader, writer) = stream.into_split();
    Ok(Disposition::Front {
        reader,
        writer,
        prefix,
    })
}

/// Dial the DC (through the pool) and run the Obfuscated2 server
/// handshake. A stale pooled connection surfaces as broken pipe on the
/// first write; retry exactly once with a fresh direct dial.
async fn telegram_handshake(
    upstream: &UpstreamManager,
    dc: i16,
    requested_dc: i16,
    stream_id: StreamId,
    config: &ProxyConfig,
    rng: &SecureRandom,
) -> Result<(TcpStream, CipherPair)> {
    let leased = match upstream.connect(dc).await {
        Ok(leased) => leased,
        Err(e) if config.telegram.fallback_on_dial_error => {
            let fallback = upstream.fallback_dc_excluding(dc);
            warn!(
                stream_id = %stream_id,
                original_dc = requested_dc,
                fallback_dc = fallback,
                error = %e,
                "DC unavailable, trying fallback"
            );
            upstream.connect(fallback).await?
        }
        Err(e) => {
            warn!(stream_id = %stream_id, dc = dc, error = %e, "cannot dial to telegram");
            return Err(e);
        }
    };

    match send_server_frame(leased, rng).await {
        Ok(result) => Ok(result),
        Err(e) if e.is_broken_pipe() => {
            debug!(stream_id = %stream_id, dc = dc, "broken pipe on pooled connection, retrying with a fresh dial");
            let leased = upstream.connect_direct(dc).await?;
            send_server_frame(leased, rng).await
        }
        Err(e) => Err(e),
    }
}

async fn send_server_frame(
    mut leased: LeasedConn,
    rng: &SecureRandom,
) -> Result<(TcpStream, CipherPair)> {
    // A fresh frame per attempt: the cipher state already consumed the
    // previous frame, so nothing here is reusable.
    let (wire, ciphers) = obfuscated2::server_handshake(rng)?;

    let write_result = async {
        leased.stream_mut().write_all(&wire).await?;
        leased.stream_mut().flush().await
    }
    .await;

    match write_result {
        Ok(()) => Ok((leased.unwrap(), ciphers)),
        Err(e) => {
            // Never return a half-written connection to the pool.
            leased.force_close();
            Err(e.into())
        }
    }
}
