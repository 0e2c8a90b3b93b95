//! Intra-thread signal/slot substrate and the "reap list" used for
//! self-destruction from within a callback (spec §9, component C11).
//!
//! Everything here is single-threaded: a [`Signal`] is only ever emitted
//! and subscribed to from the thread that owns it. Cross-thread delivery
//! (start/stop/started/stopped/failed between a [`crate::server::Server`]
//! and its [`crate::host::AsyncWorkerHost`]s) goes through
//! [`crate::host::LoopHandle`] instead, which marshals by value over a
//! channel and wakes the target loop's `mio::Poll`.

use crate::reactor::Reactor;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// An intra-thread observer list. Slots are plain closures; there is no
/// QObject-style connection lifetime tracking, so callers that need to stop
/// observing should drop the `Signal` itself or guard state inside the
/// closure (the repository does this by checking handler liveness before
/// acting on a late `disconnected` delivery).
///
/// Slots live behind a `RefCell` so `connect`/`emit` both take `&self`:
/// several components in this crate (e.g. [`crate::tls::socket::TlsSocket`],
/// [`crate::listener::ConnectionListener`]) are driven through a bare `Rc`
/// rather than `Rc<RefCell<_>>`, and still need to emit from `&self`
/// methods invoked by the reactor.
pub struct Signal<Args> {
    slots: RefCell<Vec<Box<dyn FnMut(&Args)>>>,
}

impl<Args> Signal<Args> {
    pub fn new() -> Self {
        Self { slots: RefCell::new(Vec::new()) }
    }

    pub fn connect<F: FnMut(&Args) + 'static>(&self, slot: F) {
        self.slots.borrow_mut().push(Box::new(slot));
    }

    /// Panics if called reentrantly (a slot emitting the same signal it's
    /// handling) — this crate never does that; every deferred re-entry goes
    /// through [`LocalQueue::post`] instead.
    pub fn emit(&self, args: &Args) {
        for slot in self.slots.borrow_mut().iter_mut() {
            slot(args);
        }
    }
}

impl<Args> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread queue of closures to run at the top of the next event-loop
/// turn, plus a "reap list" of values to drop at that same point.
///
/// This is the direct analogue of Qt's queued connections and
/// `deleteLater()`: [`LocalQueue::post`] defers a call so it never runs
/// inside the current callback frame, and [`LocalQueue::schedule_for_deletion`]
/// defers a drop the same way, so an object can safely request its own
/// destruction from one of its own callbacks. The reactor drains both at
/// the start of every `poll()` iteration.
///
/// Posted tasks receive the `&Reactor` draining them — the same reasoning
/// as [`crate::reactor::Reactor::schedule_timer`]'s callback type: a task
/// deferred here (e.g. [`crate::listener::ConnectionListener`]'s batched
/// accept drain) typically exists to hand a freshly accepted fd to code
/// that needs to register it, which needs a reactor reference to do.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Rc<RefCell<LocalQueueInner>>,
}

#[derive(Default)]
struct LocalQueueInner {
    tasks: VecDeque<Box<dyn FnOnce(&Reactor)>>,
    reap_list: Vec<Box<dyn std::any::Any>>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(LocalQueueInner::default())),
        }
    }

    /// Defers `task` to the next turn.
    pub fn post<F: FnOnce(&Reactor) + 'static>(&self, task: F) {
        self.inner.borrow_mut().tasks.push_back(Box::new(task));
    }

    /// Defers the drop of `value` to the next turn. The value stays alive
    /// (and callable, if the caller still holds another handle to it) for
    /// the remainder of the current callback.
    pub fn schedule_for_deletion<T: 'static>(&self, value: T) {
        self.inner.borrow_mut().reap_list.push(Box::new(value));
    }

    /// Runs every queued task, then drops everything in the reap list.
    /// Tasks posted by a task run in this same drain are run in the next
    /// `drain_turn`, not this one, matching "delivered in order in the
    /// next event-loop turn" (spec §5 Ordering).
    pub fn drain_turn(&self, reactor: &Reactor) {
        let tasks: Vec<_> = std::mem::take(&mut self.inner.borrow_mut().tasks).into();
        for task in tasks {
            task(reactor);
        }
        self.inner.borrow_mut().reap_list.clear();
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.borrow();
        inner.tasks.is_empty() && inner.reap_list.is_empty()
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn signal_emits_to_all_slots_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let signal: Signal<()> = Signal::new();
        {
            let order = order.clone();
            signal.connect(move |_| order.borrow_mut().push(1));
        }
        {
            let order = order.clone();
            signal.connect(move |_| order.borrow_mut().push(2));
        }
        signal.emit(&());
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn posted_task_does_not_run_until_drain() {
        let reactor = Reactor::new().unwrap();
        let queue = LocalQueue::new();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        queue.post(move |_| ran2.set(true));
        assert!(!ran.get());
        queue.drain_turn(&reactor);
        assert!(ran.get());
    }

    #[test]
    fn reaped_value_drops_only_after_drain() {
        struct DropFlag(Rc<Cell<bool>>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }
        let reactor = Reactor::new().unwrap();
        let queue = LocalQueue::new();
        let dropped = Rc::new(Cell::new(false));
        queue.schedule_for_deletion(DropFlag(dropped.clone()));
        assert!(!dropped.get());
        queue.drain_turn(&reactor);
        assert!(dropped.get());
    }

    #[test]
    fn task_posted_during_drain_runs_next_turn() {
        let reactor = Reactor::new().unwrap();
        let queue = LocalQueue::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let queue2 = queue.clone();
        queue.post(move |_| {
            count2.set(count2.get() + 1);
            let count3 = count2.clone();
            queue2.post(move |_| count3.set(count3.get() + 10));
        });
        queue.drain_turn(&reactor);
        assert_eq!(count.get(), 1);
        queue.drain_turn(&reactor);
        assert_eq!(count.get(), 11);
    }
}
