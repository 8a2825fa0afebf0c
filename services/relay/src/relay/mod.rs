//! Relay handles: one per accepted connection.
//!
//! A handle owns the accepted socket and the parameters the connection runs
//! with. The dispatcher builds it, then hands it to exactly one worker, which
//! drives it through a [`Session`] until the connection ends.
//!
//! ## Lifecycle
//!
//! ```text
//! accepted socket
//!     -> RelayHandle::new (socket switched to non-blocking)
//!     -> moved into a worker mailbox
//!     -> RelayHandle::run on the worker (socket registered with the worker runtime)
//!     -> session ends, or the worker aborts it on shutdown
//!     -> handle dropped: socket closed, Finished emitted
//! ```
//!
//! Every event a handle emits goes to one channel owned by the dispatcher, in
//! emission order.

mod session;

pub use session::{PlainSession, Session, SessionContext, DEFAULT_CONNECT_TIMEOUT};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shroud_header::{Address, HeaderError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

static HANDLE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a relay handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Allocate the next handle ID.
    pub fn next() -> Self {
        Self(HANDLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay-{}", self.0)
    }
}

/// Cipher configuration handed to every session unchanged.
///
/// The dispatcher never looks inside.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherParams {
    pub method: String,
    pub password: String,
}

impl CipherParams {
    pub fn new(method: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for CipherParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherParams")
            .field("method", &self.method)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-connection parameters, fixed when the handle is built.
#[derive(Debug, Clone)]
pub struct RelayParams {
    /// Idle timeout for every read on the connection.
    pub timeout: Duration,
    /// Configured remote endpoint.
    pub server_addr: Address,
    pub cipher: CipherParams,
    /// Whether this process is the local endpoint.
    pub is_local: bool,
    pub auto_ban: bool,
    /// Whether headers must carry a verified auth trailer.
    pub auth: bool,
    /// Where to send connections whose header does not decode.
    pub redirect: Option<Address>,
}

/// Lifecycle and telemetry events emitted by a relay handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Informational message.
    Info(String),
    /// Debug message.
    Debug(String),
    /// Bytes read from the accepted socket since the last report.
    BytesRead(u64),
    /// Bytes written to the accepted socket since the last report.
    BytesSent(u64),
    /// Time taken to connect upstream.
    Latency(Duration),
    /// The handle is gone and its socket closed.
    Finished,
}

/// Sending half of a handle's event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: HandleId,
    tx: mpsc::UnboundedSender<(HandleId, RelayEvent)>,
}

impl EventSink {
    pub(crate) fn new(id: HandleId, tx: mpsc::UnboundedSender<(HandleId, RelayEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(RelayEvent::Info(message.into()));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(RelayEvent::Debug(message.into()));
    }

    pub fn bytes_read(&self, n: u64) {
        self.emit(RelayEvent::BytesRead(n));
    }

    pub fn bytes_sent(&self, n: u64) {
        self.emit(RelayEvent::BytesSent(n));
    }

    pub fn latency(&self, elapsed: Duration) {
        self.emit(RelayEvent::Latency(elapsed));
    }

    fn emit(&self, event: RelayEvent) {
        // The dispatcher going away first is fine; nobody is listening.
        let _ = self.tx.send((self.id, event));
    }
}

/// Emits `Finished` when the handle is dropped, whichever way that happens,
/// unless disarmed first.
#[derive(Debug)]
struct FinishGuard(Option<EventSink>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(events) = self.0.take() {
            events.emit(RelayEvent::Finished);
        }
    }
}

/// Errors that end a single relay connection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The peer's header did not decode.
    #[error("malformed header: {0}")]
    MalformedHeader(#[from] HeaderError),

    /// The header's auth trailer was missing or wrong.
    #[error("header authentication failed")]
    AuthFailed,

    /// The accepted socket could not be prepared.
    #[error("failed to construct relay handle: {0}")]
    HandleConstruction(#[source] io::Error),

    /// Connecting upstream failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: Address,
        #[source]
        source: io::Error,
    },

    /// Socket I/O failed mid-connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One accepted connection, waiting for or running on its worker.
#[derive(Debug)]
pub struct RelayHandle {
    id: HandleId,
    peer: SocketAddr,
    socket: std::net::TcpStream,
    params: RelayParams,
    events: EventSink,
    finish: FinishGuard,
}

impl RelayHandle {
    /// Wrap an accepted socket.
    ///
    /// The socket is switched to non-blocking so any worker runtime can adopt
    /// it. Nothing is emitted if this fails.
    pub fn new(
        id: HandleId,
        socket: std::net::TcpStream,
        peer: SocketAddr,
        params: RelayParams,
        events: EventSink,
    ) -> Result<Self, RelayError> {
        socket
            .set_nonblocking(true)
            .map_err(RelayError::HandleConstruction)?;

        Ok(Self {
            id,
            peer,
            socket,
            params,
            finish: FinishGuard(Some(events.clone())),
            events,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn params(&self) -> &RelayParams {
        &self.params
    }

    /// Close the socket without reporting `Finished`.
    ///
    /// For handles that were never tracked as live.
    pub(crate) fn discard(mut self) {
        self.finish.0 = None;
    }

    /// Drive the connection to completion on the calling worker.
    ///
    /// Must run inside the worker's runtime. Consumes the handle; the socket
    /// is closed and `Finished` emitted when this returns or is aborted.
    pub(crate) async fn run(self, worker: usize, session: Arc<dyn Session>) {
        let RelayHandle {
            id,
            peer,
            socket,
            params,
            events,
            finish,
        } = self;
        let _finish = finish;

        let stream = match TcpStream::from_std(socket) {
            Ok(stream) => stream,
            Err(e) => {
                events.debug(format!("failed to adopt socket from {}: {}", peer, e));
                return;
            }
        };

        let ctx = SessionContext {
            id,
            peer,
            worker,
            params: &params,
            events: &events,
        };

        match session.run(stream, ctx).await {
            Ok(()) => {
                debug!(handle = %id, "Relay completed");
            }
            Err(e) => {
                debug!(handle = %id, error = %e, "Relay ended with error");
                events.debug(format!("{} ({}): {}", id, peer, e));
            }
        }
    }
}
