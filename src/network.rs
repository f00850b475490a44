//! TCP connection setup with socket tuning
//!
//! Resolves the server host, tries each address in turn within the connect
//! timeout, and applies keepalive and `TCP_NODELAY` via socket2 so small
//! protocol lines are not delayed by Nagle's algorithm.

use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::constants::socket::{KEEPALIVE_INTERVAL, KEEPALIVE_TIME};
use crate::error::{NatsError, Result};
use crate::pool::ServerUrl;

/// Apply keepalive and nodelay to a connected stream
pub fn tune_socket(stream: &TcpStream) -> io::Result<()> {
    use socket2::SockRef;

    let sock_ref = SockRef::from(stream);
    sock_ref.set_keepalive(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    sock_ref.set_tcp_keepalive(&keepalive)?;
    sock_ref.set_nodelay(true)?;
    Ok(())
}

/// Open a tuned TCP connection to `url` within `timeout`
pub async fn connect_tcp(url: &ServerUrl, timeout: Duration) -> Result<TcpStream> {
    let target = url.socket_addr();
    let connect = async {
        let addrs: Vec<_> = tokio::net::lookup_host(&target).await?.collect();
        let mut last_err = io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {target}"),
        );
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} ({}) failed: {}", target, addr, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    };

    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| NatsError::Timeout)?
        .map_err(|e| NatsError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    // Tuning is best effort; the connection is usable without it
    if let Err(e) = tune_socket(&stream) {
        debug!("Socket tuning failed for {}: {}", url, e);
    }
    Ok(stream)
}
