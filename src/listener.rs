//! Listening socket: binds (or adopts an inherited fd) and surfaces
//! accepted connections as raw fds (spec §4.5, component C6).

use crate::config::StartData;
use crate::error::{Error, Result};
use crate::reactor::{IoSource, Reactor};
use crate::signal::LocalQueue;
use mio::net::TcpListener as MioTcpListener;
use mio::{Interest, Token};
use socket2::{Domain, Socket, Type};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const BIND_RETRY_DEADLINE: Duration = Duration::from_secs(20);
const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Binds once, listens once. A second `start()` always fails — this is a
/// one-shot object, like every other start-stop component in this crate
/// (spec §4.5/§8).
///
/// Accepted fds are delivered through [`ConnectionListener::set_on_accept`]
/// rather than the [`crate::signal::Signal`] substrate used elsewhere:
/// every consumer of this event ([`crate::worker::ServerWorker`]) needs a
/// `&Reactor` in hand to register the accepted fd, and `Signal::emit`
/// only ever passes its `Args` — the same reason timer callbacks
/// ([`crate::reactor::Reactor::schedule_timer`]) bypass `Signal` too.
pub struct ConnectionListener {
    listener: RefCell<Option<MioTcpListener>>,
    token: RefCell<Option<Token>>,
    started: Cell<bool>,
    pending: RefCell<VecDeque<RawFd>>,
    queue: RefCell<Option<LocalQueue>>,
    self_weak: Weak<Self>,
    on_accept: RefCell<Option<Box<dyn Fn(&Reactor, RawFd)>>>,
}

impl ConnectionListener {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            listener: RefCell::new(None),
            token: RefCell::new(None),
            started: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
            queue: RefCell::new(None),
            self_weak: weak.clone(),
            on_accept: RefCell::new(None),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    /// Registers the callback invoked once per accepted fd, in arrival
    /// order, from a deferred drain (spec §4.5: batched rather than
    /// synchronous inside the readiness handler, to bound recursion under
    /// a connection storm). Only one callback is supported at a time —
    /// this crate has exactly one consumer per listener, the worker that
    /// started it.
    pub fn set_on_accept<F: Fn(&Reactor, RawFd) + 'static>(&self, f: F) {
        *self.on_accept.borrow_mut() = Some(Box::new(f));
    }

    /// Starts listening per `data` (spec §6 table / §4.5 validation order).
    pub fn start(this: &Rc<Self>, reactor: &Reactor, data: &StartData) -> Result<()> {
        if this.started.get() {
            return Err(Error::configuration("Failed to start connection listener. Listener has already been started."));
        }
        let validated = data.validate()?;

        let mio_listener = match validated.socket_descriptor {
            Some(fd) => {
                let socket = unsafe { Socket::from_raw_fd(fd) };
                socket.set_nonblocking(true).map_err(Error::from)?;
                MioTcpListener::from_std(socket.into())
            }
            None => {
                let address = validated.address.as_deref().expect("validated by StartData::validate");
                let port = validated.port.expect("validated by StartData::validate");
                let addr: SocketAddr = format!("{address}:{port}").parse().map_err(|_| {
                    Error::configuration("Failed to start connection listener. Given address is not valid.")
                })?;
                Self::bind_with_retry(addr, validated.backlog_size)?
            }
        };

        let mut mio_listener = mio_listener;
        let token = reactor
            .register(&mut mio_listener, Interest::READABLE, this.clone())
            .map_err(|e| Error::transport(Error::format_posix(&e)))?;
        *this.listener.borrow_mut() = Some(mio_listener);
        *this.token.borrow_mut() = Some(token);
        *this.queue.borrow_mut() = Some(reactor.queue().clone());
        this.started.set(true);
        debug!("connection listener started");
        Ok(())
    }

    /// Creates, binds, and listens on a fresh `SO_REUSEPORT` socket,
    /// retrying `bind()` for up to ~20s to ride out `TIME_WAIT` (spec §10).
    fn bind_with_retry(addr: SocketAddr, backlog: i32) -> Result<MioTcpListener> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let deadline = Instant::now() + BIND_RETRY_DEADLINE;
        let mut last_err = None;
        loop {
            let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::from)?;
            socket.set_reuse_address(true).map_err(Error::from)?;
            #[cfg(target_os = "linux")]
            socket.set_reuse_port(true).map_err(Error::from)?;
            match socket.bind(&addr.into()) {
                Ok(()) => {
                    socket.listen(backlog).map_err(Error::from)?;
                    socket.set_nonblocking(true).map_err(Error::from)?;
                    let std_listener: std::net::TcpListener = socket.into();
                    return Ok(MioTcpListener::from_std(std_listener));
                }
                Err(e) => {
                    last_err = Some(e);
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(BIND_RETRY_INTERVAL);
                }
            }
        }
        Err(Error::transport(Error::format_posix(&last_err.expect("loop always sets this before breaking"))))
    }

    /// Stops accepting and closes the listening fd. Already-accepted,
    /// not-yet-drained fds in `pending` are dropped (closed) along with it.
    pub fn stop(&self, reactor: &Reactor) {
        if let (Some(mut listener), Some(token)) = (self.listener.borrow_mut().take(), self.token.borrow_mut().take()) {
            let _ = reactor.deregister(&mut listener, token);
        }
        for fd in self.pending.borrow_mut().drain(..) {
            unsafe { drop(Socket::from_raw_fd(fd)) };
        }
    }

    fn accept_all(&self) {
        loop {
            let accepted = {
                let listener_ref = self.listener.borrow();
                let Some(listener) = listener_ref.as_ref() else { break };
                listener.accept()
            };
            match accepted {
                Ok((stream, _peer)) => {
                    let was_empty = self.pending.borrow().is_empty();
                    self.pending.borrow_mut().push_back(stream.into_raw_fd());
                    if was_empty {
                        self.schedule_drain();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept() failed");
                    break;
                }
            }
        }
    }

    fn schedule_drain(&self) {
        let Some(queue) = self.queue.borrow().clone() else { return };
        let Some(this) = self.self_weak.upgrade() else { return };
        queue.post(move |reactor| {
            let fds: Vec<RawFd> = this.pending.borrow_mut().drain(..).collect();
            let handler = this.on_accept.borrow();
            for fd in fds {
                if let Some(handler) = handler.as_ref() {
                    handler(reactor, fd);
                } else {
                    unsafe { drop(Socket::from_raw_fd(fd)) };
                }
            }
        });
    }
}

impl IoSource for ConnectionListener {
    fn readable(&self, _reactor: &Reactor) {
        self.accept_all();
    }
    fn writable(&self, _reactor: &Reactor) {}
    fn hangup(&self, reactor: &Reactor) {
        warn!("connection listener fd reported hangup");
        self.stop(reactor);
    }
}
