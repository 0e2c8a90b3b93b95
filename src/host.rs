//! Hosts a [`ServerWorker`] on its own dedicated OS thread with its own
//! [`Reactor`], forwarding lifecycle calls and signals across the thread
//! boundary (spec §4.8, component C9).
//!
//! Cross-thread traffic goes through `crossbeam_channel`, not the
//! intra-thread [`crate::signal::Signal`] substrate: the design notes
//! (spec §9) ask for "cross-thread queued invocations that marshal
//! arguments by value", which is exactly what a channel plus a dedicated
//! wakeup gives us, the same separation `reactor.rs`'s doc comment draws
//! between [`crate::signal::LocalQueue`] (intra-thread) and this module
//! (cross-thread).

use crate::config::StartData;
use crate::reactor::Reactor;
use crate::signal::Signal;
use crate::worker::ServerWorker;
use crossbeam_channel::{Receiver, Sender};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::debug;

/// A message sent from the owning thread to the worker's thread.
enum HostCommand {
    Start(StartData),
    Stop,
    Quit,
}

/// A message sent from the worker's thread back to the owning thread.
enum HostEvent {
    Started,
    Failed(String),
    Stopped,
}

#[derive(Default)]
pub struct HostSignals {
    pub started: Signal<()>,
    pub failed: Signal<String>,
    pub stopped: Signal<()>,
}

/// Mirrors [`crate::worker::WorkerState`] on the owning-thread side.
/// `pub(crate)` rather than private: [`crate::server::Server`] polls every
/// host's state each turn instead of counting completions, matching how the
/// worker's own stop-while-Starting deferral reads `WorkerState` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Owns a worker thread for the lifetime of this value. Constructing one
/// blocks the calling thread until the worker has been constructed *on
/// its own thread* (spec §4.8); dropping one quits the worker's loop,
/// joins the thread, and only then drops the worker value — on the
/// worker's own thread, so its destructors run there.
pub struct AsyncWorkerHost {
    commands: Sender<HostCommand>,
    waker: Arc<mio::Waker>,
    events: Receiver<HostEvent>,
    join_handle: Option<JoinHandle<()>>,
    state: HostState,
    stop_deferred: bool,
    connection_counter: Arc<AtomicUsize>,
    pub signals: HostSignals,
}

impl AsyncWorkerHost {
    /// `build_worker` runs on the new thread, not the caller's; it is the
    /// factory-closure shape the design notes describe (spec §9 /
    /// SPEC_FULL §10): `AsyncWorkerHost::new(move || MyWorker::new(opts))`.
    pub fn new<F>(build_worker: F) -> Self
    where
        F: FnOnce() -> Rc<ServerWorker> + Send + 'static,
    {
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<HostCommand>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<HostEvent>();
        let (ready_tx, ready_rx) = mpsc::channel::<(Arc<AtomicUsize>, Arc<mio::Waker>)>();

        let join_handle = std::thread::Builder::new()
            .name("kourier-worker".into())
            .spawn(move || {
                let reactor = Reactor::new().expect("failed to create worker reactor");
                let waker = Arc::new(reactor.make_waker().expect("failed to create cross-thread waker"));
                let worker = build_worker();
                ready_tx
                    .send((worker.connection_counter(), waker))
                    .expect("owning thread dropped before handoff completed");

                {
                    let event_tx = event_tx.clone();
                    worker.signals.started.connect(move |_| {
                        let _ = event_tx.send(HostEvent::Started);
                    });
                }
                {
                    let event_tx = event_tx.clone();
                    worker.signals.failed.connect(move |msg| {
                        let _ = event_tx.send(HostEvent::Failed(msg.clone()));
                    });
                }
                {
                    let event_tx = event_tx.clone();
                    worker.signals.stopped.connect(move |_| {
                        let _ = event_tx.send(HostEvent::Stopped);
                    });
                }

                'pump: loop {
                    reactor.turn().expect("reactor turn failed");
                    while let Ok(command) = command_rx.try_recv() {
                        match command {
                            HostCommand::Start(data) => ServerWorker::start(&worker, &reactor, data),
                            HostCommand::Stop => ServerWorker::stop(&worker, &reactor),
                            HostCommand::Quit => break 'pump,
                        }
                    }
                }
                debug!("worker thread quitting");
                // Dropped here, on the worker's own thread, not the host's.
                drop(worker);
            })
            .expect("failed to spawn worker thread");

        let (connection_counter, waker) = ready_rx.recv().expect("worker thread died before handoff");

        Self {
            commands: command_tx,
            waker,
            events: event_rx,
            join_handle: Some(join_handle),
            state: HostState::Stopped,
            stop_deferred: false,
            connection_counter,
            signals: HostSignals::default(),
        }
    }

    pub fn current_connections(&self) -> usize {
        self.connection_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> HostState {
        self.state
    }

    /// Queues a `start` on the worker thread. Non-blocking; outcome
    /// arrives later through `signals.started`/`signals.failed`, surfaced
    /// by [`AsyncWorkerHost::poll_events`].
    pub fn start(&mut self, data: StartData) {
        if self.state != HostState::Stopped {
            return;
        }
        self.state = HostState::Starting;
        self.stop_deferred = false;
        let _ = self.commands.send(HostCommand::Start(data));
        let _ = self.waker.wake();
    }

    /// Queues a `stop`. If the host is still `Starting`, this defers until
    /// the worker's `started` arrives, then issues the cross-thread stop
    /// immediately instead of completing the `started`→`Started`
    /// transition (spec §4.8).
    pub fn stop(&mut self) {
        match self.state {
            HostState::Starting => self.stop_deferred = true,
            HostState::Started => {
                self.state = HostState::Stopping;
                let _ = self.commands.send(HostCommand::Stop);
                let _ = self.waker.wake();
            }
            HostState::Stopping | HostState::Stopped => {}
        }
    }

    /// Drains events forwarded from the worker thread and updates local
    /// state, emitting `started`/`failed`/`stopped` on this (the owning)
    /// thread. Callers on the owning thread's own event loop should call
    /// this periodically (e.g. once per turn), mirroring how
    /// [`crate::tcp::TcpSocket::pump`] is swept for DNS resolution.
    pub fn poll_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                HostEvent::Started => {
                    if self.stop_deferred {
                        self.state = HostState::Stopping;
                        let _ = self.commands.send(HostCommand::Stop);
                        let _ = self.waker.wake();
                    } else {
                        self.state = HostState::Started;
                        self.signals.started.emit(&());
                    }
                }
                HostEvent::Failed(msg) => {
                    self.state = HostState::Stopped;
                    self.signals.failed.emit(&msg);
                }
                HostEvent::Stopped => {
                    self.state = HostState::Stopped;
                    self.signals.stopped.emit(&());
                }
            }
        }
    }
}

impl Drop for AsyncWorkerHost {
    fn drop(&mut self) {
        let _ = self.commands.send(HostCommand::Quit);
        let _ = self.waker.wake();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}
