//! Non-blocking readiness-driven I/O core (spec §3/§4.2, component C2).
//!
//! `IoChannel` owns an fd wrapped as an `mio::net::TcpStream`, a read
//! [`RingBuffer`] and a write [`RingBuffer`], and the state machine common
//! to every stream socket in this crate. [`crate::tcp::TcpSocket`] and
//! [`crate::tls::socket::TlsSocket`] both drive one of these; TLS layers
//! encrypt-on-write/decrypt-on-read on top rather than duplicating the
//! read/write-loop logic.

use crate::buffer::RingBuffer;
use crate::error::Error;
use crate::reactor::{IoSource, Reactor};
use crate::signal::Signal;
use mio::net::TcpStream;
use mio::Interest;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Lifecycle state of a channel (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Events an [`IoChannel`] emits. Subscribers connect to the `Signal`
/// fields directly; there is no trait-object callback interface since
/// everything here is intra-thread.
#[derive(Default)]
pub struct ChannelSignals {
    /// Fired after a read cycle produced at least one byte.
    pub data_received: Signal<()>,
    /// Fired after a non-zero write-buffer drain.
    pub data_sent: Signal<()>,
    /// Fired once per fatal error, always followed by `disconnected`.
    pub error: Signal<String>,
    /// Terminal event for one connected cycle; fires at most once.
    pub disconnected: Signal<()>,
}

/// The non-blocking stream-socket core. Always used behind
/// `Rc<RefCell<IoChannel>>` ([`SharedChannel`]) so the reactor can hold a
/// registration and the owning socket can drive it at the same time.
pub struct IoChannel {
    stream: Option<TcpStream>,
    token: Option<mio::Token>,
    pub read_buf: RingBuffer,
    pub write_buf: RingBuffer,
    read_buf_cap: usize,
    state: ChannelState,
    last_error: String,
    pending_write_close_after_drain: bool,
    /// Set once readable-readiness has been suppressed because the read
    /// buffer is full; cleared (and re-armed) once the handler drains it.
    read_paused: bool,
    pub signals: ChannelSignals,
}

impl IoChannel {
    pub fn new() -> Self {
        Self {
            stream: None,
            token: None,
            read_buf: RingBuffer::new(0),
            write_buf: RingBuffer::new(0),
            read_buf_cap: 0,
            state: ChannelState::Unconnected,
            last_error: String::new(),
            pending_write_close_after_drain: false,
            read_paused: false,
            signals: ChannelSignals::default(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Sets the read-buffer capacity cap. `0` means unbounded (default).
    pub fn set_read_buffer_capacity(&mut self, cap: usize) {
        self.read_buf_cap = cap;
        let _ = self.read_buf.set_capacity(cap);
    }

    pub fn read_buffer_capacity(&self) -> usize {
        self.read_buf_cap
    }

    /// Registers `stream` with `reactor`, moving the channel to
    /// `Connected` (the caller is responsible for having already performed
    /// any connect/accept syscall — this just wires up readiness).
    pub fn attach(this: &SharedChannel, reactor: &Reactor, mut stream: TcpStream, interest: Interest) -> std::io::Result<()> {
        let token = reactor.register(&mut stream, interest, this.clone())?;
        let mut ch = this.borrow_mut();
        ch.stream = Some(stream);
        ch.token = Some(token);
        ch.state = ChannelState::Connected;
        Ok(())
    }

    /// Deregisters and drops the fd without emitting any events (caller's
    /// responsibility to emit `disconnected` if required).
    pub fn detach(&mut self, reactor: &Reactor) {
        if let (Some(mut stream), Some(token)) = (self.stream.take(), self.token.take()) {
            let _ = reactor.deregister(&mut stream, token);
        }
        self.read_buf.clear();
        self.write_buf.clear();
        self.pending_write_close_after_drain = false;
        self.read_paused = false;
        self.state = ChannelState::Unconnected;
    }

    /// Deregisters the fd and hands it back to the caller instead of
    /// dropping it, for when ownership of an already-connected stream
    /// moves to a different `IoSource` (e.g. [`crate::tls::socket::TlsSocket`]
    /// taking over a freshly connected `TcpSocket`'s stream to start a TLS
    /// handshake on the same fd).
    pub fn take_stream(&mut self, reactor: &Reactor) -> Option<TcpStream> {
        if let (Some(mut stream), Some(token)) = (self.stream.take(), self.token.take()) {
            let _ = reactor.deregister(&mut stream, token);
            self.read_buf.clear();
            self.write_buf.clear();
            self.pending_write_close_after_drain = false;
            self.read_paused = false;
            self.state = ChannelState::Unconnected;
            Some(stream)
        } else {
            None
        }
    }

    /// Enqueues `src` for sending and attempts an immediate non-blocking
    /// drain. Arms write-readiness if the drain was partial.
    pub fn write(&mut self, src: &[u8], reactor: &Reactor) -> crate::error::Result<()> {
        self.write_buf.write(src)?;
        self.drain_write(reactor);
        Ok(())
    }

    /// Requests a graceful close: the fd is shut down for writes once the
    /// write buffer empties (spec §4.2).
    pub fn disconnect_from_peer(&mut self, reactor: &Reactor) {
        if self.state != ChannelState::Connected {
            return;
        }
        self.state = ChannelState::Disconnecting;
        self.pending_write_close_after_drain = true;
        if self.write_buf.is_empty() {
            self.shutdown_write_half();
            self.detach(reactor);
            self.signals.disconnected.emit(&());
        }
    }

    /// Immediately closes the fd, drops both buffers, and emits
    /// `disconnected` without an `error`.
    pub fn abort(&mut self, reactor: &Reactor) {
        if self.stream.is_none() {
            return;
        }
        self.detach(reactor);
        self.signals.disconnected.emit(&());
    }

    fn shutdown_write_half(&mut self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
        self.pending_write_close_after_drain = false;
    }

    /// Reads from the fd in a loop until EAGAIN, buffer-capacity
    /// exhaustion, EOF, or a fatal error. Emits `data_received` when at
    /// least one byte was produced, and handles the
    /// read-EOF-plus-empty-write-buffer disconnect transition.
    pub fn read_into_buffer(&mut self, reactor: &Reactor) {
        if self.read_paused || self.stream.is_none() {
            return;
        }
        let mut produced = 0usize;
        let mut saw_eof = false;
        loop {
            let remaining = self.read_buf.remaining_capacity();
            if remaining == 0 {
                self.read_paused = true;
                break;
            }
            let chunk = remaining.min(64 * 1024);
            let stream = self.stream.as_mut().expect("checked above");
            match self.read_buf.write_from(stream, chunk) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => {
                    produced += n;
                    if n < chunk {
                        // A short read off a non-blocking socket without an
                        // explicit WouldBlock means the kernel buffer is
                        // drained for now.
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(Error::format_posix(&e), reactor);
                    return;
                }
            }
        }
        if produced > 0 {
            self.signals.data_received.emit(&());
        }
        if saw_eof {
            self.handle_eof(reactor);
        }
    }

    fn handle_eof(&mut self, reactor: &Reactor) {
        if self.write_buf.is_empty() {
            self.detach(reactor);
            self.signals.disconnected.emit(&());
        } else {
            // Peer half-closed reads but we still have outbound data
            // queued; keep draining writes, the next write-readiness or
            // a later local close finishes teardown.
            self.state = ChannelState::Disconnecting;
        }
    }

    /// Drains as much of the write buffer as possible without blocking.
    /// Arms write-readiness if more remains; disarms when empty. Finishes
    /// a pending graceful close once the buffer empties.
    pub fn drain_write(&mut self, reactor: &Reactor) {
        if self.stream.is_none() {
            return;
        }
        let mut sent_any = false;
        loop {
            let chunk = self.write_buf.peek_all();
            if chunk.is_empty() {
                break;
            }
            let stream = self.stream.as_mut().expect("checked above");
            match stream.write(chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_buf.discard(n);
                    sent_any = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.arm_write_interest(reactor);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(Error::format_posix(&e), reactor);
                    return;
                }
            }
        }
        if sent_any {
            self.signals.data_sent.emit(&());
        }
        if self.write_buf.is_empty() {
            self.disarm_write_interest(reactor);
            if self.pending_write_close_after_drain {
                self.shutdown_write_half();
                if self.state == ChannelState::Disconnecting {
                    self.detach(reactor);
                    self.signals.disconnected.emit(&());
                }
            }
        }
    }

    fn arm_write_interest(&mut self, reactor: &Reactor) {
        if let (Some(stream), Some(token)) = (self.stream.as_mut(), self.token) {
            let _ = reactor.reregister(stream, token, Interest::READABLE | Interest::WRITABLE);
        }
    }

    fn disarm_write_interest(&mut self, reactor: &Reactor) {
        if let (Some(stream), Some(token)) = (self.stream.as_mut(), self.token) {
            let _ = reactor.reregister(stream, token, Interest::READABLE);
        }
    }

    /// Resumes reading after the handler has drained the read buffer below
    /// capacity, re-arming readiness that `read_into_buffer` paused.
    pub fn resume_reading(&mut self, reactor: &Reactor) {
        if self.read_paused {
            self.read_paused = false;
            self.read_into_buffer(reactor);
        }
    }

    /// Discards `n` bytes a handler has consumed from the front of
    /// `read_buf` (after a `peek_all`/copy) and resumes reading if that
    /// drain brought the buffer back under capacity (spec §3: "the channel
    /// must stop reading from the fd when the buffer would overflow and
    /// resume only after the handler has drained bytes"). Handlers should
    /// call this instead of `read_buf.discard` directly so a paused
    /// channel is never left stuck.
    pub fn discard_read(&mut self, n: usize, reactor: &Reactor) {
        self.read_buf.discard(n);
        self.resume_reading(reactor);
    }

    fn fail(&mut self, message: String, reactor: &Reactor) {
        self.last_error = message.clone();
        self.signals.error.emit(&message);
        self.detach(reactor);
        self.signals.disconnected.emit(&());
    }
}

impl Default for IoChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to an [`IoChannel`]; this is what gets registered with
/// the reactor and handed to the socket types that drive it.
pub type SharedChannel = Rc<RefCell<IoChannel>>;

pub fn new_shared_channel() -> SharedChannel {
    Rc::new(RefCell::new(IoChannel::new()))
}

impl IoSource for RefCell<IoChannel> {
    fn readable(&self, reactor: &Reactor) {
        self.borrow_mut().read_into_buffer(reactor);
    }
    fn writable(&self, reactor: &Reactor) {
        self.borrow_mut().drain_write(reactor);
    }
    fn hangup(&self, reactor: &Reactor) {
        let mut ch = self.borrow_mut();
        if ch.state != ChannelState::Unconnected {
            ch.detach(reactor);
            ch.signals.disconnected.emit(&());
        }
    }
}
