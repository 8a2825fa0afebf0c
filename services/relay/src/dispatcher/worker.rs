//! Dispatch workers.
//!
//! A worker is an OS thread driving a single-threaded runtime. Handles
//! arrive through its mailbox and run as local tasks, so a handle and its
//! socket never leave the thread that adopted them.
//!
//! Shutdown is two-phase: [`Worker::quiesce`] tells the loop to stop taking
//! handles and drain, [`Worker::join`] waits for the thread with a deadline.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::relay::{RelayHandle, Session};

/// One worker in the dispatch pool.
pub(crate) struct Worker {
    index: usize,
    /// Taken by the thread on start.
    mailbox: Option<mpsc::UnboundedReceiver<RelayHandle>>,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<thread::JoinHandle<()>>,
    /// Fires when the thread is about to exit.
    done: Option<oneshot::Receiver<()>>,
}

impl Worker {
    /// Create a stopped worker and the sender for its mailbox.
    pub(crate) fn new(index: usize) -> (Self, mpsc::UnboundedSender<RelayHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let worker = Self {
            index,
            mailbox: Some(rx),
            shutdown_tx,
            thread: None,
            done: None,
        };
        (worker, tx)
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Spawn the worker thread. Does nothing if already started.
    pub(crate) fn start(
        &mut self,
        session: Arc<dyn Session>,
        drain_timeout: Duration,
    ) -> io::Result<()> {
        let Some(mailbox) = self.mailbox.take() else {
            return Ok(());
        };

        let index = self.index;
        let shutdown = self.shutdown_tx.subscribe();
        let (done_tx, done_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(format!("relay-worker-{}", index))
            .spawn(move || {
                // Dropped last, after the runtime and every handle
                let _done = DoneSignal(Some(done_tx));

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker = index, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };

                let local = LocalSet::new();
                local.block_on(
                    &runtime,
                    run_worker_loop(index, mailbox, shutdown, session, drain_timeout),
                );
            })?;

        self.thread = Some(thread);
        self.done = Some(done_rx);
        Ok(())
    }

    /// Ask the worker to stop taking handles and drain.
    pub(crate) fn quiesce(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the worker thread is alive.
    pub(crate) fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the worker thread to exit, until `deadline`.
    ///
    /// Returns `false` if the thread was still running at the deadline. A
    /// worker that never started counts as stopped.
    pub(crate) async fn join(&mut self, deadline: tokio::time::Instant) -> bool {
        let Some(done) = self.done.take() else {
            return true;
        };

        // Err means the signal was dropped without sending, which only
        // happens while the thread exits.
        if tokio::time::timeout_at(deadline, done).await.is_err() {
            warn!(worker = self.index, "Worker did not stop before deadline");
            return false;
        }

        if let Some(thread) = self.thread.take() {
            let index = self.index;
            // The thread is past its runtime at this point; the join is short.
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!(worker = index, "Worker thread panicked"),
                Err(e) => error!(worker = index, error = %e, "Failed to join worker thread"),
            }
        }

        debug!(worker = self.index, "Worker joined");
        true
    }
}

/// Sends on drop so panics in the thread still count as "exited".
struct DoneSignal(Option<oneshot::Sender<()>>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

async fn run_worker_loop(
    index: usize,
    mut mailbox: mpsc::UnboundedReceiver<RelayHandle>,
    mut shutdown: watch::Receiver<bool>,
    session: Arc<dyn Session>,
    drain_timeout: Duration,
) {
    let mut tasks = JoinSet::new();
    let mut mailbox_open = true;

    debug!(worker = index, "Worker started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            handle = mailbox.recv(), if mailbox_open => {
                match handle {
                    Some(handle) => {
                        let span = info_span!(
                            "relay",
                            handle = %handle.id(),
                            peer = %handle.peer(),
                            worker = index,
                        );
                        tasks.spawn_local(handle.run(index, Arc::clone(&session)).instrument(span));
                    }
                    None => {
                        debug!(worker = index, "Worker mailbox closed");
                        mailbox_open = false;
                    }
                }
            }

            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(worker = index, "Relay task panicked");
                    }
                }
            }
        }
    }

    // No new handles from here on. Queued ones never started; dropping
    // them closes their sockets.
    mailbox.close();
    let mut discarded = 0usize;
    while let Ok(handle) = mailbox.try_recv() {
        drop(handle);
        discarded += 1;
    }

    let running = tasks.len();
    info!(worker = index, running, discarded, "Worker quiescing");

    if !tasks.is_empty() {
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            warn!(
                worker = index,
                remaining = tasks.len(),
                "Drain timeout elapsed, aborting relays"
            );
            tasks.shutdown().await;
        }
    }

    debug!(worker = index, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio::net::TcpStream;

    use crate::relay::{
        CipherParams, EventSink, HandleId, RelayError, RelayEvent, RelayParams, SessionContext,
    };

    /// Holds every connection open until the peer closes it.
    struct HoldSession;

    #[async_trait]
    impl Session for HoldSession {
        async fn run(
            &self,
            mut stream: TcpStream,
            ctx: SessionContext<'_>,
        ) -> Result<(), RelayError> {
            use tokio::io::AsyncReadExt;
            ctx.events.info(format!("worker {}", ctx.worker));
            let mut buf = [0u8; 64];
            while stream.read(&mut buf).await? > 0 {}
            Ok(())
        }
    }

    fn params() -> RelayParams {
        RelayParams {
            timeout: Duration::from_secs(30),
            server_addr: "127.0.0.1:1".parse().unwrap(),
            cipher: CipherParams::new("none", ""),
            is_local: false,
            auto_ban: false,
            auth: false,
            redirect: None,
        }
    }

    fn accepted() -> (std::net::TcpStream, std::net::TcpStream, std::net::SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (server, client, peer)
    }

    #[tokio::test]
    async fn test_worker_runs_handle_and_stops() {
        let (mut worker, tx) = Worker::new(3);
        worker
            .start(Arc::new(HoldSession), Duration::from_millis(100))
            .unwrap();
        assert!(worker.is_running());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let id = HandleId::next();
        let (server, client, peer) = accepted();
        let handle =
            RelayHandle::new(id, server, peer, params(), EventSink::new(id, events_tx)).unwrap();
        tx.send(handle).unwrap();

        let (_, first) = events_rx.recv().await.unwrap();
        assert_eq!(first, RelayEvent::Info("worker 3".into()));

        // Client stays open, so the drain timeout has to abort the relay
        worker.quiesce();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        assert!(worker.join(deadline).await);
        assert!(!worker.is_running());

        let (_, last) = events_rx.recv().await.unwrap();
        assert_eq!(last, RelayEvent::Finished);
        drop(client);
    }

    #[tokio::test]
    async fn test_send_after_stop_returns_handle() {
        let (mut worker, tx) = Worker::new(0);
        worker
            .start(Arc::new(HoldSession), Duration::from_millis(10))
            .unwrap();
        worker.quiesce();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        assert!(worker.join(deadline).await);

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let id = HandleId::next();
        let (server, _client, peer) = accepted();
        let handle =
            RelayHandle::new(id, server, peer, params(), EventSink::new(id, events_tx)).unwrap();
        assert!(tx.send(handle).is_err());
    }

    #[tokio::test]
    async fn test_unstarted_worker_joins_immediately() {
        let (mut worker, _tx) = Worker::new(1);
        assert!(!worker.is_running());
        assert!(worker.join(tokio::time::Instant::now()).await);
    }
}
