//! Multi-worker orchestrator: owns `workerCount` [`AsyncWorkerHost`]s, starts
//! them in parallel against the same start data, and aggregates their
//! lifecycle into one state machine (spec §4.9, component C10).

use crate::config::StartData;
use crate::host::{AsyncWorkerHost, HostState};
use crate::signal::Signal;
use crate::worker::ServerWorker;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Default)]
pub struct ServerSignals {
    pub started: Signal<()>,
    pub failed: Signal<String>,
    pub stopped: Signal<()>,
}

/// Each worker binds its own `SO_REUSEPORT` socket on the same address; the
/// kernel load-balances accepts across them (spec §4.9). A worker that
/// crashes or fails mid-start never touches another — this type's own job
/// is purely lifecycle aggregation, polled once per [`Server::poll_events`]
/// call the way Kourier's `processStartingServerWorkers`/
/// `processStoppingServerWorkers` poll every worker's state rather than
/// maintaining a separate completion counter.
pub struct Server {
    workers: Vec<AsyncWorkerHost>,
    state: Cell<ServerState>,
    stop_deferred: Cell<bool>,
    failing: Cell<bool>,
    first_error: Rc<RefCell<Option<String>>>,
    pub signals: ServerSignals,
}

impl Server {
    /// Spawns `worker_count` [`AsyncWorkerHost`]s, each invoking
    /// `make_worker` on its own thread to build its [`ServerWorker`].
    /// Blocks (transitively, through each host's own constructor) until
    /// every worker has been constructed.
    pub fn new<F>(worker_count: usize, make_worker: F) -> Self
    where
        F: Fn() -> Rc<ServerWorker> + Send + Sync + 'static,
    {
        let make_worker = Arc::new(make_worker);
        let first_error = Rc::new(RefCell::new(None));
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let make_worker = make_worker.clone();
            let mut host = AsyncWorkerHost::new(move || make_worker());
            let first_error = first_error.clone();
            host.signals.failed.connect(move |msg| {
                let mut slot = first_error.borrow_mut();
                if slot.is_none() {
                    *slot = Some(msg.clone());
                }
            });
            workers.push(host);
        }
        Self {
            workers,
            state: Cell::new(ServerState::Stopped),
            stop_deferred: Cell::new(false),
            failing: Cell::new(false),
            first_error,
            signals: ServerSignals::default(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Sum of every worker's live connection count, for observation only
    /// (spec §5: "Connection counts are per-worker atomics only because the
    /// Server aggregates them for observation, not for correctness
    /// decisions").
    pub fn current_connections(&self) -> usize {
        self.workers.iter().map(AsyncWorkerHost::current_connections).sum()
    }

    /// Starts every worker in parallel with the same `data` (spec §4.9).
    pub fn start(&mut self, data: StartData) {
        if self.state.get() != ServerState::Stopped {
            warn!(state = ?self.state.get(), "start() called while not Stopped, ignoring");
            return;
        }
        self.state.set(ServerState::Starting);
        self.stop_deferred.set(false);
        self.failing.set(false);
        *self.first_error.borrow_mut() = None;
        for host in &mut self.workers {
            host.start(data.clone());
        }
    }

    /// Requests every worker to stop. A `stop()` received while `Starting`
    /// is deferred until startup resolves (spec §4.9).
    pub fn stop(&mut self) {
        match self.state.get() {
            ServerState::Starting => self.stop_deferred.set(true),
            ServerState::Started => {
                self.state.set(ServerState::Stopping);
                for host in &mut self.workers {
                    host.stop();
                }
            }
            ServerState::Stopping | ServerState::Stopped => {}
        }
    }

    /// Drains every worker host's forwarded events, then re-evaluates the
    /// aggregate state. Callers should call this once per iteration of
    /// their own event loop.
    pub fn poll_events(&mut self) {
        for host in &mut self.workers {
            host.poll_events();
        }
        match self.state.get() {
            ServerState::Starting => self.poll_starting(),
            ServerState::Stopping => self.poll_stopping(),
            ServerState::Started | ServerState::Stopped => {}
        }
    }

    fn poll_starting(&mut self) {
        if self.workers.iter().any(|h| h.state() == HostState::Stopped) {
            let msg = self.first_error.borrow().clone().unwrap_or_else(|| "worker failed to start".into());
            warn!(error = %msg, "a worker failed during startup, stopping the rest");
            self.failing.set(true);
            self.state.set(ServerState::Stopping);
            for host in &mut self.workers {
                if matches!(host.state(), HostState::Starting | HostState::Started) {
                    host.stop();
                }
            }
            // Re-check immediately: a host that was already Stopped before
            // any other started contributes nothing further to wait for.
            self.poll_stopping();
            return;
        }
        if self.workers.iter().all(|h| h.state() == HostState::Started) {
            self.state.set(ServerState::Started);
            info!(workers = self.workers.len(), "server started");
            self.signals.started.emit(&());
            if self.stop_deferred.get() {
                self.stop_deferred.set(false);
                self.stop();
            }
        }
    }

    fn poll_stopping(&mut self) {
        if self.workers.iter().all(|h| h.state() == HostState::Stopped) {
            self.state.set(ServerState::Stopped);
            if self.failing.get() {
                self.failing.set(false);
                let msg = self.first_error.borrow_mut().take().unwrap_or_else(|| "worker failed to start".into());
                warn!(error = %msg, "server failed to start");
                self.signals.failed.emit(&msg);
            } else {
                info!("server stopped");
                self.signals.stopped.emit(&());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_stopped_with_no_workers() {
        let server = Server::new(0, || unreachable!("never invoked"));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.worker_count(), 0);
        assert_eq!(server.current_connections(), 0);
    }
}
