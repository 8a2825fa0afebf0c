//! Connection dispatcher.
//!
//! Owns the listening socket and a fixed pool of workers. Each accepted
//! connection is checked against the ban registry, wrapped in a
//! [`RelayHandle`] and moved to the next worker in round-robin order. The
//! dispatcher keeps only bookkeeping for dispatched handles; the worker owns
//! them outright.
//!
//! ```text
//!             accept loop (caller's runtime)
//!                  │ ban check, handle construction
//!        ┌─────────┼─────────┐
//!        ▼         ▼         ▼
//!    worker-0  worker-1  worker-N-1     (one thread + runtime each)
//!        │         │         │
//!        └────── relay events ──────▶ event pump ──▶ observers
//! ```
//!
//! State machine: `Idle -> Listening -> Draining -> Stopped`. `Stopped` is
//! terminal.

mod live;
mod worker;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use shroud_header::Address;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ban::BanRegistry;
use crate::relay::{
    CipherParams, EventSink, HandleId, RelayEvent, RelayHandle, RelayParams, Session,
};
use live::LiveSet;
use worker::Worker;

/// Default drain window for running relays on stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default extra time `stop` waits for worker threads beyond the drain
/// window.
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Back-off after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Everything the dispatcher needs to build handles and size its pool.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Idle timeout passed to every handle.
    pub timeout: Duration,
    pub server_addr: Address,
    pub cipher: CipherParams,
    pub is_local: bool,
    pub auto_ban: bool,
    pub auth: bool,
    /// Initial redirect target; see [`Dispatcher::set_redirect_target`].
    pub redirect: Option<Address>,
    /// Pool size. Zero is treated as one.
    pub workers: usize,
    /// How long workers let running relays finish on stop.
    pub drain_timeout: Duration,
    /// How much longer `stop` waits for worker threads after the drain
    /// window before giving up on them.
    pub join_grace: Duration,
}

impl DispatchSettings {
    /// Worker count matching the host's available parallelism, at least 1.
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Listening,
    Draining,
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Listening => "listening",
            DispatcherState::Draining => "draining",
            DispatcherState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Errors surfaced to the dispatcher's caller.
///
/// Per-connection failures never show up here.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("operation not allowed while {state}")]
    InvalidState { state: DispatcherState },

    #[error("failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    /// Some workers were still running at the deadline. Their bookkeeping
    /// was released anyway.
    #[error("{stuck} worker(s) did not stop within {timeout:?}")]
    ShutdownTimeout { stuck: usize, timeout: Duration },
}

/// What dispatcher observers receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A handle's own event, in that handle's emission order.
    Relay { handle: HandleId, event: RelayEvent },
    /// A banned peer was turned away before any handle existed.
    Banned { peer: SocketAddr },
    /// A connection was dropped before it could be dispatched.
    Rejected { peer: SocketAddr, reason: String },
}

/// State shared with the accept loop and the event pump.
struct Inner {
    settings: DispatchSettings,
    pool_size: usize,
    redirect: ArcSwapOption<Address>,
    bans: Arc<dyn BanRegistry>,
    session: Arc<dyn Session>,
    /// Worker mailboxes, indexed like the pool. Empty unless listening.
    mailboxes: ArcSwap<Vec<mpsc::UnboundedSender<RelayHandle>>>,
    /// Live handles and the round-robin index, under one lock.
    live: Mutex<LiveSet>,
    relay_tx: mpsc::UnboundedSender<(HandleId, RelayEvent)>,
    /// Subscribers; dropped once their receiver is gone.
    observers: Mutex<Vec<mpsc::UnboundedSender<DispatchEvent>>>,
    state: Mutex<DispatcherState>,
}

impl Inner {
    fn live(&self) -> MutexGuard<'_, LiveSet> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: DispatchEvent) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn on_accepted(&self, socket: std::net::TcpStream, peer: SocketAddr) {
        let state = *self.state();
        if state != DispatcherState::Listening {
            debug!(peer = %peer, %state, "Not listening, dropping connection");
            drop(socket);
            self.publish(DispatchEvent::Rejected {
                peer,
                reason: format!("dispatcher is {}", state),
            });
            return;
        }

        if !self.settings.is_local && self.settings.auto_ban && self.bans.is_banned(peer.ip()) {
            debug!(peer = %peer, "Banned address attempted to connect");
            drop(socket);
            self.publish(DispatchEvent::Banned { peer });
            return;
        }

        let params = RelayParams {
            timeout: self.settings.timeout,
            server_addr: self.settings.server_addr.clone(),
            cipher: self.settings.cipher.clone(),
            is_local: self.settings.is_local,
            auto_ban: self.settings.auto_ban,
            auth: self.settings.auth,
            redirect: self.redirect.load_full().map(|addr| Address::clone(&addr)),
        };

        let id = HandleId::next();
        let events = EventSink::new(id, self.relay_tx.clone());
        match RelayHandle::new(id, socket, peer, params, events) {
            Ok(handle) => self.dispatch(handle),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping connection");
                self.publish(DispatchEvent::Rejected {
                    peer,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn dispatch(&self, handle: RelayHandle) {
        let state = *self.state();
        let mailboxes = self.mailboxes.load();
        if state != DispatcherState::Listening || mailboxes.is_empty() {
            // Never tracked, so nothing may report it finished later
            debug!(handle = %handle.id(), %state, "Not listening, discarding handle");
            handle.discard();
            return;
        }

        let worker = self.live().assign(handle.id(), handle.peer());
        let Some(mailbox) = mailboxes.get(worker) else {
            error!(worker, pool_size = mailboxes.len(), "Worker index out of range");
            return;
        };

        debug!(handle = %handle.id(), peer = %handle.peer(), worker, "Dispatched connection");

        // A closed mailbox hands the handle back; dropping it emits Finished,
        // which clears the entry just made.
        if let Err(mpsc::error::SendError(handle)) = mailbox.send(handle) {
            warn!(handle = %handle.id(), worker, "Worker mailbox closed, dropping connection");
        }
    }

    fn on_handle_finished(&self, id: HandleId) -> bool {
        let removed = self.live().remove(id);
        match removed {
            Some(entry) => {
                debug!(handle = %id, worker = entry.worker, peer = %entry.peer, "Relay finished");
                true
            }
            None => false,
        }
    }

    fn on_relay_event(&self, id: HandleId, event: RelayEvent) {
        if event == RelayEvent::Finished {
            self.on_handle_finished(id);
        }
        self.publish(DispatchEvent::Relay { handle: id, event });
    }
}

/// Accepts connections and spreads them over a fixed worker pool.
pub struct Dispatcher {
    inner: Arc<Inner>,
    workers: Vec<Worker>,
    /// Taken by the event pump on start.
    relay_rx: Option<mpsc::UnboundedReceiver<(HandleId, RelayEvent)>>,
    accept_stop: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<TcpListener>>,
    pump_stop: Option<oneshot::Sender<()>>,
    pump_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Dispatcher {
    /// Create an idle dispatcher. Nothing is bound or spawned yet.
    pub fn new(
        settings: DispatchSettings,
        bans: Arc<dyn BanRegistry>,
        session: Arc<dyn Session>,
    ) -> Self {
        let pool_size = settings.workers.max(1);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            redirect: ArcSwapOption::from(settings.redirect.clone().map(Arc::new)),
            pool_size,
            settings,
            bans,
            session,
            mailboxes: ArcSwap::from_pointee(Vec::new()),
            live: Mutex::new(LiveSet::new(pool_size)),
            relay_tx,
            observers: Mutex::new(Vec::new()),
            state: Mutex::new(DispatcherState::Idle),
        };

        Self {
            inner: Arc::new(inner),
            workers: Vec::new(),
            relay_rx: Some(relay_rx),
            accept_stop: None,
            accept_task: None,
            pump_stop: None,
            pump_task: None,
            local_addr: None,
        }
    }

    /// Bind `addr`, start every worker and begin accepting.
    ///
    /// Only valid from `Idle`. On failure the dispatcher stays `Idle`.
    /// Returns the bound address.
    pub async fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr, DispatcherError> {
        let state = *self.inner.state();
        if state != DispatcherState::Idle {
            return Err(DispatcherError::InvalidState { state });
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DispatcherError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| DispatcherError::Bind { addr, source })?;

        let drain_timeout = self.inner.settings.drain_timeout;
        let join_grace = self.inner.settings.join_grace;
        let mut workers = Vec::with_capacity(self.inner.pool_size);
        let mut mailboxes = Vec::with_capacity(self.inner.pool_size);

        for index in 0..self.inner.pool_size {
            let (mut worker, mailbox) = Worker::new(index);
            if let Err(source) = worker.start(Arc::clone(&self.inner.session), drain_timeout) {
                error!(worker = index, error = %source, "Failed to spawn worker");
                shutdown_workers(&mut workers, drain_timeout, join_grace).await;
                return Err(DispatcherError::WorkerSpawn { index, source });
            }
            workers.push(worker);
            mailboxes.push(mailbox);
        }

        self.inner.mailboxes.store(Arc::new(mailboxes));
        self.workers = workers;

        if let Some(relay_rx) = self.relay_rx.take() {
            let (pump_stop, stop_rx) = oneshot::channel();
            self.pump_task = Some(tokio::spawn(pump_events(
                Arc::clone(&self.inner),
                relay_rx,
                stop_rx,
            )));
            self.pump_stop = Some(pump_stop);
        }

        let (accept_stop, stop_rx) = watch::channel(false);
        self.accept_task = Some(tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            stop_rx,
        )));
        self.accept_stop = Some(accept_stop);
        self.local_addr = Some(local_addr);

        *self.inner.state() = DispatcherState::Listening;

        info!(
            bind_addr = %local_addr,
            workers = self.inner.pool_size,
            local = self.inner.settings.is_local,
            "Dispatcher listening"
        );

        Ok(local_addr)
    }

    /// Take an accepted connection: ban check, build a handle, dispatch it.
    ///
    /// Outside `Listening` the socket is closed and a `Rejected` event
    /// published instead.
    pub fn on_accepted(&self, socket: std::net::TcpStream, peer: SocketAddr) {
        self.inner.on_accepted(socket, peer);
    }

    /// Move `handle` to the next worker in round-robin order.
    ///
    /// Only while listening. Otherwise the handle is discarded: its socket
    /// is closed and it never reports `Finished`.
    pub fn dispatch(&self, handle: RelayHandle) {
        self.inner.dispatch(handle);
    }

    /// Forget a finished handle. Returns whether it was still live; repeated
    /// calls for the same handle are no-ops.
    pub fn on_handle_finished(&self, id: HandleId) -> bool {
        self.inner.on_handle_finished(id)
    }

    /// Stop accepting, quiesce and join every worker, then close the socket.
    ///
    /// Safe to call in any state; calling it again once `Stopped` does
    /// nothing. Stopping an `Idle` dispatcher moves it straight to
    /// `Stopped`.
    pub async fn stop(&mut self) -> Result<(), DispatcherError> {
        {
            let mut state = self.inner.state();
            match *state {
                DispatcherState::Stopped => return Ok(()),
                DispatcherState::Idle => {
                    *state = DispatcherState::Stopped;
                    return Ok(());
                }
                DispatcherState::Listening | DispatcherState::Draining => {
                    *state = DispatcherState::Draining;
                }
            }
        }

        info!(workers = self.workers.len(), "Dispatcher draining");

        // Stop accepting; the listener comes back so it can be closed last
        if let Some(accept_stop) = self.accept_stop.take() {
            let _ = accept_stop.send(true);
        }
        let listener = match self.accept_task.take() {
            Some(task) => match task.await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!(error = %e, "Accept loop failed");
                    None
                }
            },
            None => None,
        };

        let drain_timeout = self.inner.settings.drain_timeout;
        let join_grace = self.inner.settings.join_grace;
        let stuck = shutdown_workers(&mut self.workers, drain_timeout, join_grace).await;
        self.inner.mailboxes.store(Arc::new(Vec::new()));

        // Every joined worker has dropped its handles, so their Finished
        // events are already queued for the pump.
        if let Some(pump_stop) = self.pump_stop.take() {
            let _ = pump_stop.send(());
        }
        if let Some(task) = self.pump_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Event pump failed");
            }
        }

        let leftover = self.inner.live().drain();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Releasing handles still marked live");
        }

        drop(listener);
        self.local_addr = None;
        self.workers.clear();
        *self.inner.state() = DispatcherState::Stopped;

        info!("Dispatcher stopped");

        if stuck > 0 {
            return Err(DispatcherError::ShutdownTimeout {
                stuck,
                timeout: drain_timeout + join_grace,
            });
        }
        Ok(())
    }

    /// Redirect target for handles created from now on.
    pub fn set_redirect_target(&self, target: Option<Address>) {
        match &target {
            Some(addr) => info!(redirect = %addr, "Redirect target updated"),
            None => info!("Redirect target cleared"),
        }
        self.inner.redirect.store(target.map(Arc::new));
    }

    /// Receive lifecycle events from now on.
    ///
    /// Delivery is unbounded: a slow subscriber gets every event, in order,
    /// however far behind it falls. The stream ends once the dispatcher and
    /// its background tasks are gone.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DispatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn state(&self) -> DispatcherState {
        *self.inner.state()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == DispatcherState::Listening
    }

    /// Handles dispatched and not yet finished.
    pub fn live_count(&self) -> usize {
        self.inner.live().len()
    }

    /// Live handle count per worker index.
    pub fn live_per_worker(&self) -> Vec<usize> {
        self.inner.live().per_worker()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Dropped without stop(): let the threads drain on their own
        if let Some(accept_stop) = self.accept_stop.take() {
            let _ = accept_stop.send(true);
        }
        for worker in &self.workers {
            worker.quiesce();
        }
    }
}

/// Quiesce every worker and wait for them. Returns how many missed the
/// deadline.
async fn shutdown_workers(
    workers: &mut [Worker],
    drain_timeout: Duration,
    join_grace: Duration,
) -> usize {
    for worker in workers.iter() {
        worker.quiesce();
    }

    let deadline = tokio::time::Instant::now() + drain_timeout + join_grace;
    let mut stuck = 0;
    for worker in workers.iter_mut() {
        if !worker.join(deadline).await {
            warn!(worker = worker.index(), "Worker still running after deadline");
            stuck += 1;
        }
    }
    stuck
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
) -> TcpListener {
    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match stream.into_std() {
                    Ok(socket) => inner.on_accepted(socket, peer),
                    Err(e) => warn!(peer = %peer, error = %e, "Failed to detach accepted socket"),
                },
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    debug!("Accept loop stopped");
    listener
}

/// Forward handle events to observers, clearing finished handles first.
async fn pump_events(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<(HandleId, RelayEvent)>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            Some((id, event)) = rx.recv() => inner.on_relay_event(id, event),

            _ = &mut stop => break,
        }
    }

    while let Ok((id, event)) = rx.try_recv() {
        inner.on_relay_event(id, event);
    }
}
