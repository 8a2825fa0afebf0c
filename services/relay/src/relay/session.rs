//! Relay sessions: what a worker does with an adopted connection.
//!
//! [`Session`] is the seam between the dispatcher and the data plane. The
//! cipher engine plugs in here; the dispatcher only knows that a session
//! consumes the stream and eventually returns.
//!
//! [`PlainSession`] forwards bytes without transforming them:
//! - server mode: decode the destination header, connect, forward
//! - local mode: connect to the configured server, forward everything

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shroud_header::{decode, Address, Decoded, HeaderError, KeyedSha256, MAX_HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{EventSink, HandleId, RelayError, RelayParams};
use crate::ban::BanList;
use crate::probe;

/// Default timeout for connecting upstream.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of the forwarding buffer per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// What a session knows about the connection it is driving.
pub struct SessionContext<'a> {
    pub id: HandleId,
    pub peer: SocketAddr,
    /// Index of the worker running this session.
    pub worker: usize,
    pub params: &'a RelayParams,
    pub events: &'a EventSink,
}

/// Data plane for one connection.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Run the connection until it ends.
    ///
    /// An idle timeout is a normal end and should return `Ok`.
    async fn run(&self, stream: TcpStream, ctx: SessionContext<'_>) -> Result<(), RelayError>;
}

/// Forwards bytes untransformed.
pub struct PlainSession {
    /// Peers sending bad headers are banned here when auto-ban is on.
    bans: Option<Arc<BanList>>,
    connect_timeout: Duration,
}

impl PlainSession {
    pub fn new() -> Self {
        Self {
            bans: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Ban list to add misbehaving peers to.
    pub fn with_ban_list(mut self, bans: Arc<BanList>) -> Self {
        self.bans = Some(bans);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Remote endpoint: read the header, then forward to its address.
    async fn run_remote(
        &self,
        mut client: TcpStream,
        ctx: &SessionContext<'_>,
    ) -> Result<(), RelayError> {
        let mut buf = Vec::with_capacity(RELAY_BUFFER_SIZE);
        let mut chunk = vec![0u8; RELAY_BUFFER_SIZE];

        let decoded = loop {
            match decode(&buf) {
                Ok(decoded) => break decoded,
                Err(HeaderError::Truncated { .. }) if buf.len() < MAX_HEADER_LEN => {
                    let n = match read_idle(&mut client, &mut chunk, ctx.params.timeout).await {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                            ctx.events.debug(format!("{} idle before header", ctx.peer));
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if n == 0 {
                        // Closed before a full header arrived; treat like garbage
                        if buf.is_empty() {
                            return Ok(());
                        }
                        let error = RelayError::MalformedHeader(decode_err(&buf));
                        return self.reject(client, &buf, error, ctx).await;
                    }
                    ctx.events.bytes_read(n as u64);
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) => return self.reject(client, &buf, e.into(), ctx).await,
            }
        };

        if ctx.params.auth && !self.verify(&buf, &decoded, ctx.params) {
            return self.reject(client, &buf, RelayError::AuthFailed, ctx).await;
        }

        ctx.events
            .debug(format!("{} requested {}", ctx.peer, decoded.address));

        let mut upstream = self.connect_upstream(&decoded.address, ctx).await?;

        let payload = &buf[decoded.consumed..];
        if !payload.is_empty() {
            upstream.write_all(payload).await?;
        }

        pump(&mut client, &mut upstream, ctx).await;
        Ok(())
    }

    /// Local endpoint: forward everything to the configured server.
    async fn run_local(
        &self,
        mut client: TcpStream,
        ctx: &SessionContext<'_>,
    ) -> Result<(), RelayError> {
        let mut upstream = self.connect_upstream(&ctx.params.server_addr, ctx).await?;
        pump(&mut client, &mut upstream, ctx).await;
        Ok(())
    }

    fn verify(&self, buf: &[u8], decoded: &Decoded, params: &RelayParams) -> bool {
        let auth = KeyedSha256::new(params.cipher.password.as_bytes());
        decoded.auth_flag() && decoded.verify(buf, &auth)
    }

    /// Deal with a peer whose header was unusable.
    ///
    /// Bans the peer when auto-ban is on. With a redirect target the bytes
    /// already read are replayed there and the connection is forwarded;
    /// otherwise the connection is dropped without a reply.
    async fn reject(
        &self,
        mut client: TcpStream,
        buf: &[u8],
        error: RelayError,
        ctx: &SessionContext<'_>,
    ) -> Result<(), RelayError> {
        ctx.events
            .info(format!("rejecting {}: {}", ctx.peer, error));

        if ctx.params.auto_ban {
            if let Some(bans) = &self.bans {
                bans.ban(ctx.peer.ip());
                ctx.events.info(format!("banned {}", ctx.peer.ip()));
            }
        }

        let Some(redirect) = &ctx.params.redirect else {
            return Err(error);
        };

        debug!(handle = %ctx.id, redirect = %redirect, "Redirecting malformed connection");
        let mut upstream = self.connect_upstream(redirect, ctx).await?;
        if !buf.is_empty() {
            upstream.write_all(buf).await?;
        }
        pump(&mut client, &mut upstream, ctx).await;
        Ok(())
    }

    async fn connect_upstream(
        &self,
        addr: &Address,
        ctx: &SessionContext<'_>,
    ) -> Result<TcpStream, RelayError> {
        let started = Instant::now();
        let stream = probe::connect(addr, self.connect_timeout)
            .await
            .map_err(|source| RelayError::Connect {
                addr: addr.clone(),
                source,
            })?;
        ctx.events.latency(started.elapsed());
        Ok(stream)
    }
}

impl Default for PlainSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for PlainSession {
    async fn run(&self, stream: TcpStream, ctx: SessionContext<'_>) -> Result<(), RelayError> {
        if ctx.params.is_local {
            self.run_local(stream, &ctx).await
        } else {
            self.run_remote(stream, &ctx).await
        }
    }
}

/// The error a partial header decodes to.
fn decode_err(buf: &[u8]) -> HeaderError {
    match decode(buf) {
        Err(e) => e,
        Ok(_) => HeaderError::Truncated {
            needed: buf.len() + 1,
            available: buf.len(),
        },
    }
}

/// Read with an idle deadline; expiry surfaces as `TimedOut`.
async fn read_idle(stream: &mut TcpStream, buf: &mut [u8], idle: Duration) -> io::Result<usize> {
    match tokio::time::timeout(idle, stream.read(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
    }
}

/// Last time either direction of a connection moved data.
struct Activity {
    started: Instant,
    /// Milliseconds after `started`.
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Resolve once nothing has moved for `idle`.
    async fn expired(&self, idle: Duration) {
        loop {
            let quiet = self.quiet_for();
            if quiet >= idle {
                return;
            }
            tokio::time::sleep(idle - quiet).await;
        }
    }
}

/// Forward bytes both ways until each direction ends, or until the
/// connection as a whole has been idle for the handle's timeout.
///
/// A silent direction keeps waiting as long as the other one is moving.
/// Byte counts on the client side are reported as they happen.
async fn pump(client: &mut TcpStream, upstream: &mut TcpStream, ctx: &SessionContext<'_>) {
    let events = ctx.events;
    let activity = Activity::new();
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let client_to_upstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            activity.touch();
            events.bytes_read(n as u64);
            upstream_write.write_all(&buf[..n]).await?;
        }
        upstream_write.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            activity.touch();
            client_write.write_all(&buf[..n]).await?;
            events.bytes_sent(n as u64);
        }
        client_write.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    let (up, down) = tokio::select! {
        results = async { tokio::join!(client_to_upstream, upstream_to_client) } => results,
        _ = activity.expired(ctx.params.timeout) => {
            events.debug(format!("{} idle timeout", ctx.id));
            return;
        }
    };

    for result in [up, down] {
        if let Err(e) = result {
            warn!(handle = %ctx.id, error = %e, "Relay direction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_err_reports_truncation() {
        assert_eq!(
            decode_err(&[0x03, 10, b'a']),
            HeaderError::Truncated {
                needed: 14,
                available: 3
            }
        );
        assert_eq!(decode_err(&[0x7F]), HeaderError::UnknownAddressType(0x7F));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_expires_only_after_quiet_period() {
        let activity = Activity::new();
        let idle = Duration::from_millis(300);

        // Touched every 100ms: never quiet long enough
        let touching = async {
            for _ in 0..6 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                activity.touch();
            }
        };
        tokio::select! {
            _ = touching => {}
            _ = activity.expired(idle) => panic!("expired while active"),
        }

        let before = Instant::now();
        activity.expired(idle).await;
        assert!(before.elapsed() >= Duration::from_millis(300));
        assert!(activity.quiet_for() >= idle);
    }

    #[test]
    fn test_builder() {
        let session = PlainSession::new().with_connect_timeout(Duration::from_millis(250));
        assert_eq!(session.connect_timeout, Duration::from_millis(250));
        assert!(session.bans.is_none());
    }
}
