//! Listener setup and outbound dialing

pub mod dns;
pub mod proxy_dialer;
pub mod sockopts;
pub mod tfo;
pub mod upstream;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub ipv6_only: bool,
    pub reuse_port: bool,
    pub backlog: i32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            ipv6_only: false,
            reuse_port: true,
            backlog: 1024,
        }
    }
}

/// Build a listening socket with SO_REUSEADDR (and SO_REUSEPORT where the
/// platform has it) so restarts and multi-process setups do not fight over
/// the address.
pub fn create_listener(addr: SocketAddr, options: &ListenOptions) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;

    #[cfg(all(unix, not(target_os = "solaris")))]
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }

    if addr.is_ipv6() {
        socket.set_only_v6(options.ipv6_only)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.backlog)?;

    Ok(socket.into())
}

/// Per-connection client socket setup right after accept. Failures are
/// advisory: a socket we cannot tune still carries traffic.
pub fn configure_client_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "cannot set TCP_NODELAY on client socket");
    }
}

/// Outbound dial with a deadline and TCP_NODELAY applied. With `fastopen`
/// the socket asks for TCP Fast Open before connecting, provided the
/// kernel advertises client-mode TFO; refusal downgrades to a normal
/// connect.
pub async fn dial(addr: SocketAddr, deadline: Duration, fastopen: bool) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if fastopen && tfo::client_enabled() {
        sockopts::set_fastopen_connect(&socket);
    }

    let stream = tokio::time::timeout(deadline, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "cannot set TCP_NODELAY on outbound socket");
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_listener_and_dial() {
        let listener =
            create_listener("127.0.0.1:0".parse().unwrap(), &ListenOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = dial(addr, Duration::from_secs(5), false).await.unwrap();
        accept.await.unwrap();

        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_with_fastopen_request() {
        let listener =
            create_listener("127.0.0.1:0".parse().unwrap(), &ListenOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        // Works whether or not the kernel grants TFO.
        let stream = dial(addr, Duration::from_secs(5), true).await.unwrap();
        accept.await.unwrap();

        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        // RFC 5737 TEST-NET-1 address drops SYNs in most environments; the
        // timeout fires either way.
        let result =
            dial("192.0.2.1:443".parse().unwrap(), Duration::from_millis(50), false).await;
        assert!(result.is_err());
    }
}
