//! Relay socket tuning
//!
//! All setters are best effort: a missing option on an old kernel or a
//! foreign platform degrades latency, not correctness. Everything except
//! TCP_NODELAY is Linux-only.

use tokio::net::{TcpSocket, TcpStream};

/// Disable Nagle batching; Telegram traffic is many small messages.
pub fn set_nodelay(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}

/// Close the connection when outstanding data stays unacknowledged for
/// this long. Without it a dead peer pins the descriptor until the TCP
/// retransmission timeout, around 15 minutes.
#[cfg(target_os = "linux")]
pub fn set_user_timeout(stream: &TcpStream, timeout_ms: u32) {
    use std::os::fd::AsRawFd;

    set_tcp_option(stream.as_raw_fd(), linux::TCP_USER_TIMEOUT, timeout_ms as libc::c_int);
}

#[cfg(not(target_os = "linux"))]
pub fn set_user_timeout(_stream: &TcpStream, _timeout_ms: u32) {}

/// Send ACKs immediately instead of delaying them. Applied to the
/// downstream client socket only.
#[cfg(target_os = "linux")]
pub fn set_quickack(stream: &TcpStream) {
    use std::os::fd::AsRawFd;

    set_tcp_option(stream.as_raw_fd(), linux::TCP_QUICKACK, 1);
}

#[cfg(not(target_os = "linux"))]
pub fn set_quickack(_stream: &TcpStream) {}

/// Wake the writer only when the unsent backlog drops below `threshold`
/// bytes. 131072 is the production value Cloudflare published, matching a
/// 256 KiB pipe.
#[cfg(target_os = "linux")]
pub fn set_notsent_lowat(stream: &TcpStream, threshold: u32) {
    use std::os::fd::AsRawFd;

    set_tcp_option(stream.as_raw_fd(), linux::TCP_NOTSENT_LOWAT, threshold as libc::c_int);
}

#[cfg(not(target_os = "linux"))]
pub fn set_notsent_lowat(_stream: &TcpStream, _threshold: u32) {}

/// Enable TCP Fast Open on an outbound socket, so connect() can carry
/// data in the SYN. Must run before the connect call.
#[cfg(target_os = "linux")]
pub fn set_fastopen_connect(socket: &TcpSocket) {
    use std::os::fd::AsRawFd;

    set_tcp_option(socket.as_raw_fd(), linux::TCP_FASTOPEN_CONNECT, 1);
}

#[cfg(not(target_os = "linux"))]
pub fn set_fastopen_connect(_socket: &TcpSocket) {}

#[cfg(target_os = "linux")]
mod linux {
    // Not exported by libc for every target; values are ABI-stable.
    pub const TCP_QUICKACK: libc::c_int = 12;
    pub const TCP_USER_TIMEOUT: libc::c_int = 18;
    pub const TCP_NOTSENT_LOWAT: libc::c_int = 25;
    pub const TCP_FASTOPEN_CONNECT: libc::c_int = 30;
}

#[cfg(target_os = "linux")]
fn set_tcp_option(fd: std::os::fd::RawFd, option: libc::c_int, value: libc::c_int) {
    // Best effort; the return value is deliberately ignored.
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Tuning applied to both relay sockets. TCP_QUICKACK and
/// TCP_NOTSENT_LOWAT are not part of this set: they belong to the
/// downstream client socket only.
pub fn tune_for_relay(stream: &TcpStream, user_timeout_ms: u32) {
    set_nodelay(stream);
    set_user_timeout(stream, user_timeout_ms);
}
