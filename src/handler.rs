//! Opaque per-connection handler, its factory, and the repository that
//! tracks live handlers for a worker (spec §4.6, component C7).

use crate::reactor::Reactor;
use crate::signal::Signal;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// A per-connection object constructed from one accepted fd.
///
/// The only contract a worker needs from a handler: it owns the fd for the
/// duration of the connection, and it exposes a `disconnected` signal the
/// repository can subscribe to in order to remove it. Everything else
/// (what the handler actually does with the bytes it sees) is up to
/// whatever higher layer supplies the factory — out of scope here (spec
/// §1 Non-goals: no application-protocol parsing).
pub trait ConnectionHandler {
    /// Fires exactly once, when this handler's connection has fully torn
    /// down. The repository removes the handler on this signal; it is not
    /// valid for a handler to fire it more than once.
    fn disconnected(&self) -> &Signal<()>;

    /// Asks the handler to start a graceful disconnect of its connection.
    /// Called by a stopping worker on every live handler; the handler is
    /// expected to eventually fire `disconnected`, at its own pace (e.g.
    /// after flushing buffered writes).
    fn request_disconnect(&self, reactor: &Reactor);
}

/// Builds one [`ConnectionHandler`] per accepted fd. The worker injects
/// whatever per-worker configuration the concrete handler type needs (TLS
/// context, options, application state) at factory-construction time —
/// `create` itself takes only what varies per connection.
pub trait ConnectionHandlerFactory {
    fn create(&self, reactor: &Reactor, fd: RawFd) -> Rc<dyn ConnectionHandler>;
}

/// Tracks every live handler for one worker and removes it once its
/// `disconnected` signal fires (spec §4.6).
///
/// The repository enforces no cap of its own — the worker reads
/// [`Repository::count`] before accepting and decides whether to construct
/// a handler at all. `last_removed` fires once the repository transitions
/// from non-empty to empty, the signal a stopping worker waits on to know
/// every handler has torn down.
pub struct Repository {
    handlers: RefCell<HashMap<u64, Rc<dyn ConnectionHandler>>>,
    next_id: RefCell<u64>,
    self_weak: Weak<Self>,
    pub last_removed: Signal<()>,
}

impl Repository {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            handlers: RefCell::new(HashMap::new()),
            next_id: RefCell::new(0),
            self_weak: weak.clone(),
            last_removed: Signal::new(),
        })
    }

    pub fn count(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Adds `handler` and wires its `disconnected` signal to a removal.
    /// Removal happens from within the signal's own emit call, which is
    /// safe here since `Signal::emit` only ever iterates its slot list —
    /// it does not itself hold a borrow across the call into `remove`.
    pub fn add(this: &Rc<Self>, handler: Rc<dyn ConnectionHandler>) {
        let id = {
            let mut next_id = this.next_id.borrow_mut();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let weak_repo = this.self_weak.clone();
        handler.disconnected().connect(move |_| {
            if let Some(repo) = weak_repo.upgrade() {
                repo.remove(id);
            }
        });
        this.handlers.borrow_mut().insert(id, handler);
    }

    fn remove(&self, id: u64) {
        if self.handlers.borrow_mut().remove(&id).is_some() && self.is_empty() {
            self.last_removed.emit(&());
        }
    }

    /// Requests a graceful disconnect of every handler currently tracked.
    /// Snapshots the handler list first since a handler's own
    /// `request_disconnect` may synchronously tear it down and remove it
    /// from this repository, which would otherwise invalidate an
    /// in-progress borrow of `handlers`.
    pub fn disconnect_all(&self, reactor: &Reactor) {
        let snapshot: Vec<Rc<dyn ConnectionHandler>> = self.handlers.borrow().values().cloned().collect();
        for handler in snapshot {
            handler.request_disconnect(reactor);
        }
    }
}
