//! Readiness-driven event loop core (spec §4.2/§9, part of component C11).
//!
//! One [`Reactor`] per worker thread. It owns the `mio::Poll` instance, a
//! token-to-handler map, the [`LocalQueue`] deferred-task/reap substrate,
//! and the [`Timers`] registry used for connect/handshake deadlines. This
//! plays the role the teacher's `reactor.rs` plays for Cyclone, trimmed to
//! the single I/O model (epoll via `mio`) this spec requires — no
//! io_uring fallback, no NUMA-aware task scheduler.

use crate::signal::LocalQueue;
use crate::timer::{TimerToken, Timers};
use mio::{Events, Interest, Poll, Token};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::trace;

type TimerCallback = Box<dyn FnOnce(&Reactor)>;

/// Readiness edges a registered source wants to hear about.
pub trait IoSource {
    fn readable(&self, reactor: &Reactor);
    fn writable(&self, reactor: &Reactor);
    /// Hang-up/error condition observed directly on the mio event, distinct
    /// from an error surfaced by a `read`/`write` syscall.
    fn hangup(&self, reactor: &Reactor);
}

struct Registration {
    source: Rc<dyn IoSource>,
}

/// The per-worker-thread event loop.
pub struct Reactor {
    poll: RefCell<Poll>,
    registrations: RefCell<HashMap<Token, Registration>>,
    next_token: RefCell<usize>,
    queue: LocalQueue,
    timers: RefCell<Timers>,
    timer_callbacks: RefCell<HashMap<TimerToken, TimerCallback>>,
    running: RefCell<bool>,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: RefCell::new(Poll::new()?),
            registrations: RefCell::new(HashMap::new()),
            next_token: RefCell::new(0),
            queue: LocalQueue::new(),
            timers: RefCell::new(Timers::new()),
            timer_callbacks: RefCell::new(HashMap::new()),
            running: RefCell::new(true),
        })
    }

    /// Handle to this reactor's deferred-task/reap substrate.
    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    /// Registers an I/O source and returns the token it was assigned.
    pub fn register<S>(&self, mio_source: &mut dyn mio::event::Source, interest: Interest, sink: Rc<S>) -> std::io::Result<Token>
    where
        S: IoSource + 'static,
    {
        let token = Token(*self.next_token.borrow());
        *self.next_token.borrow_mut() += 1;
        self.poll.borrow_mut().registry().register(mio_source, token, interest)?;
        self.registrations.borrow_mut().insert(token, Registration { source: sink });
        Ok(token)
    }

    pub fn reregister(&self, mio_source: &mut dyn mio::event::Source, token: Token, interest: Interest) -> std::io::Result<()> {
        self.poll.borrow_mut().registry().reregister(mio_source, token, interest)
    }

    pub fn deregister(&self, mio_source: &mut dyn mio::event::Source, token: Token) -> std::io::Result<()> {
        self.registrations.borrow_mut().remove(&token);
        self.poll.borrow_mut().registry().deregister(mio_source)
    }

    /// Creates a [`mio::Waker`] that can interrupt a blocked `poll()` from
    /// another thread. [`crate::host::AsyncWorkerHost`] uses this so a
    /// command queued from the owning thread is picked up promptly rather
    /// than waiting out the current poll timeout.
    pub fn make_waker(&self) -> std::io::Result<mio::Waker> {
        let token = Token(*self.next_token.borrow());
        *self.next_token.borrow_mut() += 1;
        mio::Waker::new(self.poll.borrow().registry(), token)
    }

    /// Drops the bookkeeping for `token` without a matching `mio::event::Source`
    /// handle in hand. Used to abandon an in-flight attempt (e.g. a
    /// [`crate::tcp::TcpSocket`] connect probe) whose registering object
    /// closes its own fd on drop; closing an fd removes it from epoll's
    /// interest list automatically, so no explicit `registry().deregister`
    /// call is needed here.
    pub fn forget(&self, token: Token) {
        self.registrations.borrow_mut().remove(&token);
    }

    /// Schedules `callback` to run once, `delay` from now, on this same
    /// thread during a future `turn()`. The callback receives this
    /// `Reactor` so it can deregister a still-pending fd on timeout.
    pub fn schedule_timer<F: FnOnce(&Reactor) + 'static>(&self, delay: Duration, callback: F) -> TimerToken {
        let token = self.timers.borrow_mut().schedule(delay);
        self.timer_callbacks.borrow_mut().insert(token, Box::new(callback));
        token
    }

    /// Cancels a timer before it fires. Returns `true` if it was pending.
    pub fn cancel_timer(&self, token: TimerToken) -> bool {
        self.timer_callbacks.borrow_mut().remove(&token);
        self.timers.borrow_mut().cancel(token)
    }

    /// Stops [`Reactor::run`] after the current turn.
    pub fn stop(&self) {
        *self.running.borrow_mut() = false;
    }

    /// Runs one iteration: poll for readiness (bounded by the nearest
    /// timer deadline), dispatch readable/writable/hangup callbacks, fire
    /// expired timers, then drain the deferred-task/reap queue. Returns
    /// the set of timer tokens that fired this turn so the caller can
    /// react (timers don't carry their own callback — callers check
    /// whether a token they're holding is in the returned set).
    pub fn turn(&self) -> std::io::Result<()> {
        let timeout = self.timers.borrow().next_deadline().or(Some(Duration::from_millis(250)));
        let mut events = Events::with_capacity(256);
        match self.poll.borrow_mut().poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        for event in events.iter() {
            let token = event.token();
            let source = self.registrations.borrow().get(&token).map(|r| r.source.clone());
            let Some(source) = source else {
                trace!(?token, "event for unregistered token, dropping");
                continue;
            };
            if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
                source.hangup(self);
            }
            if event.is_readable() {
                source.readable(self);
            }
            if event.is_writable() {
                source.writable(self);
            }
        }
        let fired = self.timers.borrow_mut().poll_expired();
        for token in fired {
            if let Some(callback) = self.timer_callbacks.borrow_mut().remove(&token) {
                callback(self);
            }
        }
        self.queue.drain_turn(self);
        Ok(())
    }

    /// Runs turns until [`Reactor::stop`] is called.
    pub fn run(&self) -> std::io::Result<()> {
        while *self.running.borrow() {
            self.turn()?;
        }
        Ok(())
    }
}
