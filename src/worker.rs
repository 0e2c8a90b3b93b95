//! Single-threaded per-worker orchestrator: owns a listener, a handler
//! factory, and a repository, and enforces the connection cap (spec §4.7,
//! component C8).

use crate::config::StartData;
use crate::handler::{ConnectionHandlerFactory, Repository};
use crate::listener::ConnectionListener;
use crate::reactor::Reactor;
use crate::signal::Signal;
use socket2::Socket;
use std::cell::Cell;
use std::os::unix::io::{FromRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Picked because spec §4.7 describes it only as "handler-repository
/// default" without a number; nothing else in this codebase pins one
/// either, so this is a documented decision (see `DESIGN.md`) rather than
/// a value carried over from a teacher file.
const DEFAULT_MAX_CONNECTIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Default)]
pub struct WorkerSignals {
    pub started: Signal<()>,
    pub failed: Signal<String>,
    pub stopped: Signal<()>,
}

/// Owns one listener, one handler factory, and one repository, all on a
/// single thread (spec §4.7). `maxConnections` is enforced here, not by
/// the repository: the worker reads `current_connections` before
/// constructing a handler and simply closes any fd over the cap.
pub struct ServerWorker {
    listener: Rc<ConnectionListener>,
    factory: Box<dyn ConnectionHandlerFactory>,
    repository: Rc<Repository>,
    max_connections: Cell<usize>,
    current_connections: Arc<AtomicUsize>,
    state: Cell<WorkerState>,
    stop_deferred: Cell<bool>,
    pub signals: WorkerSignals,
}

impl ServerWorker {
    pub fn new(factory: Box<dyn ConnectionHandlerFactory>) -> Rc<Self> {
        let listener = ConnectionListener::new();
        let repository = Repository::new();
        let worker = Rc::new_cyclic(|weak| {
            let weak_for_accept = weak.clone();
            listener.set_on_accept(move |reactor, fd| {
                if let Some(this) = weak_for_accept.upgrade() {
                    Self::handle_accept(&this, reactor, fd);
                } else {
                    unsafe { drop(Socket::from_raw_fd(fd)) };
                }
            });
            let weak_for_stop = weak.clone();
            repository.last_removed.connect(move |_| {
                if let Some(this) = weak_for_stop.upgrade() {
                    if this.state.get() == WorkerState::Stopping {
                        this.finish_stop();
                    }
                }
            });
            Self {
                listener,
                factory,
                repository,
                max_connections: Cell::new(DEFAULT_MAX_CONNECTIONS),
                current_connections: Arc::new(AtomicUsize::new(0)),
                state: Cell::new(WorkerState::Stopped),
                stop_deferred: Cell::new(false),
                signals: WorkerSignals::default(),
            }
        });
        worker
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn set_max_connections(&self, max: usize) {
        self.max_connections.set(max);
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.get()
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::Relaxed)
    }

    /// A cross-thread-readable handle to the live connection count, for an
    /// owning [`crate::server::Server`] to read for observability (spec
    /// §5: "Connection counts are per-worker atomics only because the
    /// Server aggregates them for observation, not for correctness
    /// decisions").
    pub fn connection_counter(&self) -> Arc<AtomicUsize> {
        self.current_connections.clone()
    }

    /// Starts the listener. Emits `started` on success or `failed(msg)` on
    /// failure, returning to `Stopped` either way the listener itself
    /// didn't start (spec §4.7).
    pub fn start(this: &Rc<Self>, reactor: &Reactor, data: StartData) {
        if this.state.get() != WorkerState::Stopped {
            warn!(state = ?this.state.get(), "start() called while not Stopped, ignoring");
            return;
        }
        this.state.set(WorkerState::Starting);
        this.stop_deferred.set(false);
        match ConnectionListener::start(&this.listener, reactor, &data) {
            Ok(()) => {
                this.state.set(WorkerState::Started);
                info!("worker started");
                this.signals.started.emit(&());
                if this.stop_deferred.get() {
                    Self::stop(this, reactor);
                }
            }
            Err(e) => {
                this.state.set(WorkerState::Stopped);
                let msg = e.to_string();
                warn!(error = %msg, "worker failed to start");
                this.signals.failed.emit(&msg);
            }
        }
    }

    /// Stops accepting, asks every live handler to disconnect, and waits
    /// for the repository to empty before emitting `stopped`. A `stop()`
    /// received while `Starting` is deferred until `start` resolves (spec
    /// §4.7).
    pub fn stop(this: &Rc<Self>, reactor: &Reactor) {
        match this.state.get() {
            WorkerState::Starting => {
                this.stop_deferred.set(true);
            }
            WorkerState::Started => {
                this.state.set(WorkerState::Stopping);
                this.listener.stop(reactor);
                this.repository.disconnect_all(reactor);
                if this.repository.is_empty() {
                    this.finish_stop();
                }
            }
            WorkerState::Stopping | WorkerState::Stopped => {}
        }
    }

    fn finish_stop(&self) {
        self.state.set(WorkerState::Stopped);
        info!("worker stopped");
        self.signals.stopped.emit(&());
    }

    fn handle_accept(this: &Rc<Self>, reactor: &Reactor, fd: RawFd) {
        if this.state.get() != WorkerState::Started {
            unsafe { drop(Socket::from_raw_fd(fd)) };
            return;
        }
        if this.current_connections.load(Ordering::Relaxed) >= this.max_connections.get() {
            warn!(fd, max = this.max_connections.get(), "rejecting connection: worker at capacity");
            unsafe { drop(Socket::from_raw_fd(fd)) };
            return;
        }
        let handler = this.factory.create(reactor, fd);
        let counter = this.current_connections.clone();
        handler.disconnected().connect(move |_| {
            counter.fetch_sub(1, Ordering::Relaxed);
        });
        this.current_connections.fetch_add(1, Ordering::Relaxed);
        Repository::add(&this.repository, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ConnectionHandler;
    use std::cell::RefCell;

    struct NullHandler {
        disconnected: Signal<()>,
    }

    impl ConnectionHandler for NullHandler {
        fn disconnected(&self) -> &Signal<()> {
            &self.disconnected
        }
        fn request_disconnect(&self, _reactor: &Reactor) {
            self.disconnected.emit(&());
        }
    }

    struct NullFactory {
        created: RefCell<Vec<RawFd>>,
    }

    impl ConnectionHandlerFactory for NullFactory {
        fn create(&self, _reactor: &Reactor, fd: RawFd) -> Rc<dyn ConnectionHandler> {
            self.created.borrow_mut().push(fd);
            Rc::new(NullHandler { disconnected: Signal::new() })
        }
    }

    #[test]
    fn starts_stopped() {
        let worker = ServerWorker::new(Box::new(NullFactory { created: RefCell::new(Vec::new()) }));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.current_connections(), 0);
    }

    #[test]
    fn rejects_accept_over_cap_without_constructing_a_handler() {
        let reactor = Reactor::new().unwrap();
        let worker = ServerWorker::new(Box::new(NullFactory { created: RefCell::new(Vec::new()) }));
        worker.set_max_connections(0);
        worker.state.set(WorkerState::Started);
        let sock = socket2::Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None).unwrap();
        let fd = std::os::unix::io::IntoRawFd::into_raw_fd(sock);
        ServerWorker::handle_accept(&worker, &reactor, fd);
        assert_eq!(worker.current_connections(), 0);
    }
}
