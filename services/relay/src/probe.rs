//! Outbound connects and the one-shot reachability check.

use std::io;
use std::time::{Duration, Instant};

use shroud_header::Address;
use tokio::net::TcpStream;
use tracing::debug;

/// Connect to `addr` within `timeout`.
///
/// Domain addresses are resolved by the runtime.
pub async fn connect(addr: &Address, timeout: Duration) -> io::Result<TcpStream> {
    let attempt = async {
        match addr.socket_addr() {
            Some(socket_addr) => TcpStream::connect(socket_addr).await,
            None => {
                let host = addr.host();
                TcpStream::connect((host.as_str(), addr.port())).await
            }
        }
    };

    let stream = tokio::time::timeout(timeout, attempt).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", addr),
        )
    })??;

    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Open and close one connection to `addr`, returning how long it took.
pub async fn reachability(addr: &Address, timeout: Duration) -> io::Result<Duration> {
    let started = Instant::now();
    let stream = connect(addr, timeout).await?;
    let elapsed = started.elapsed();
    drop(stream);

    debug!(addr = %addr, latency_ms = elapsed.as_millis() as u64, "Probe connected");
    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachability_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::from(listener.local_addr().unwrap());

        let latency = reachability(&addr, Duration::from_secs(2)).await.unwrap();
        assert!(latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_reachability_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::from(listener.local_addr().unwrap());
        drop(listener);

        assert!(reachability(&addr, Duration::from_secs(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = Address::domain("localhost", port).unwrap();

        // localhost may resolve to ::1 first; only require that resolution works
        let result = connect(&addr, Duration::from_secs(2)).await;
        if let Err(e) = result {
            assert_ne!(e.kind(), io::ErrorKind::TimedOut);
        }
    }
}
