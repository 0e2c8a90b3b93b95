//! Plaintext stream socket: connect/bind/accept/read/write with hostname
//! resolution and connect-timeout (spec §3/§4.3, component C3).

use crate::channel::{new_shared_channel, ChannelState, IoChannel, SharedChannel};
use crate::config::SocketOption;
use crate::error::Result;
use crate::reactor::{IoSource, Reactor};
use crate::resolver::{self, ResolveOutcome};
use crate::signal::Signal;
use crate::timer::TimerToken;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Token};
use socket2::{Domain, Socket, Type};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Events specific to [`TcpSocket`] itself, layered above the
/// [`crate::channel::IoChannel`] read/write/error/disconnected events it
/// owns (those stay reachable via [`TcpSocket::channel`]).
#[derive(Default)]
pub struct TcpSignals {
    pub connected: Signal<()>,
    pub error: Signal<String>,
    pub disconnected: Signal<()>,
}

/// Watches a non-blocking `connect()` in progress. Registered with the
/// reactor in place of the channel until the connect resolves, since
/// `IoChannel`'s own writable handler only knows how to drain a write
/// buffer, not interpret `SO_ERROR` (spec §4.3).
struct ConnectProbe {
    stream: RefCell<Option<MioTcpStream>>,
    owner: Weak<RefCell<TcpSocket>>,
    addr: SocketAddr,
}

impl IoSource for ConnectProbe {
    fn readable(&self, reactor: &Reactor) {
        self.resolve(reactor);
    }
    fn writable(&self, reactor: &Reactor) {
        self.resolve(reactor);
    }
    fn hangup(&self, reactor: &Reactor) {
        self.resolve(reactor);
    }
}

impl ConnectProbe {
    fn resolve(&self, reactor: &Reactor) {
        let Some(owner) = self.owner.upgrade() else { return };
        let Some(stream) = self.stream.borrow_mut().take() else { return };
        let err = socket2::SockRef::from(&stream).take_error().ok().flatten();
        match err {
            Some(_) => TcpSocket::on_connect_failed(&owner, reactor, self.addr),
            None => TcpSocket::on_connect_succeeded(&owner, reactor, stream, self.addr),
        }
    }
}

/// Plaintext TCP stream socket (spec component C3).
pub struct TcpSocket {
    channel: SharedChannel,
    bind_address: Option<IpAddr>,
    bind_port: Option<u16>,
    peer_address: Option<IpAddr>,
    peer_port: Option<u16>,
    local_address: Option<IpAddr>,
    local_port: Option<u16>,
    low_delay: bool,
    keep_alive: bool,
    error_message: String,
    connecting_host: Option<String>,
    connecting_is_literal_address: bool,
    addr_queue: VecDeque<IpAddr>,
    connecting_port: u16,
    last_attempt_addr: Option<SocketAddr>,
    connect_deadline_timer: Option<TimerToken>,
    pending_resolve: Option<resolver::Pending>,
    connect_probe_token: Option<Token>,
    pub signals: TcpSignals,
}

impl TcpSocket {
    /// Constructs an unconnected socket. `LowDelay` is on and `KeepAlive`
    /// is off by construction (spec §3).
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            channel: new_shared_channel(),
            bind_address: None,
            bind_port: None,
            peer_address: None,
            peer_port: None,
            local_address: None,
            local_port: None,
            low_delay: true,
            keep_alive: false,
            error_message: String::new(),
            connecting_host: None,
            connecting_is_literal_address: false,
            addr_queue: VecDeque::new(),
            connecting_port: 0,
            last_attempt_addr: None,
            connect_deadline_timer: None,
            pending_resolve: None,
            connect_probe_token: None,
            signals: TcpSignals::default(),
        }))
    }

    /// Wraps a pre-accepted fd. If it isn't a valid connected stream
    /// socket, the socket stays `Unconnected` rather than failing
    /// construction (spec §9, preserved as observed in the original).
    pub fn from_accepted_fd(reactor: &Reactor, fd: RawFd) -> Rc<RefCell<Self>> {
        let socket = Self::new();
        let raw = unsafe { Socket::from_raw_fd(fd) };
        if raw.set_nonblocking(true).is_err() {
            return socket;
        }
        let std_stream: std::net::TcpStream = raw.into();
        let (peer, local) = match (std_stream.peer_addr(), std_stream.local_addr()) {
            (Ok(p), Ok(l)) => (p, l),
            _ => return socket,
        };
        let mio_stream = MioTcpStream::from_std(std_stream);
        {
            let mut s = socket.borrow_mut();
            s.peer_address = Some(peer.ip());
            s.peer_port = Some(peer.port());
            s.local_address = Some(local.ip());
            s.local_port = Some(local.port());
        }
        let channel = socket.borrow().channel.clone();
        if IoChannel::attach(&channel, reactor, mio_stream, Interest::READABLE).is_err() {
            socket.borrow_mut().channel.borrow_mut().set_state(ChannelState::Unconnected);
        }
        socket
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    pub fn state(&self) -> ChannelState {
        self.channel.borrow().state()
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn peer_address(&self) -> Option<IpAddr> {
        self.peer_address
    }
    pub fn peer_port(&self) -> Option<u16> {
        self.peer_port
    }
    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn set_bind_address_and_port(&mut self, addr: IpAddr, port: u16) {
        self.bind_address = Some(addr);
        self.bind_port = Some(port);
    }

    /// Sets a socket option. Nonzero values for boolean options coerce to
    /// exactly `1` (spec §6/§8).
    pub fn set_option(&mut self, option: SocketOption, value: i32) -> Result<()> {
        match option {
            SocketOption::LowDelay => {
                self.low_delay = value != 0;
                if let Some(stream) = self.channel.borrow().stream() {
                    socket2::SockRef::from(stream).set_nodelay(self.low_delay)?;
                }
            }
            SocketOption::KeepAlive => {
                self.keep_alive = value != 0;
                if let Some(stream) = self.channel.borrow().stream() {
                    socket2::SockRef::from(stream).set_keepalive(self.keep_alive)?;
                }
            }
            SocketOption::SendBufferSize => {
                if let Some(stream) = self.channel.borrow().stream() {
                    socket2::SockRef::from(stream).set_send_buffer_size(value.max(0) as usize)?;
                }
            }
            SocketOption::ReceiveBufferSize => {
                if let Some(stream) = self.channel.borrow().stream() {
                    socket2::SockRef::from(stream).set_recv_buffer_size(value.max(0) as usize)?;
                }
            }
        }
        Ok(())
    }

    /// Reads the current value. `SendBufferSize`/`ReceiveBufferSize`
    /// return the kernel-doubled value verbatim (spec §6/§8/§9) — this
    /// crate does not halve it back.
    pub fn option(&self, option: SocketOption) -> Result<i32> {
        let channel = self.channel.borrow();
        let Some(stream) = channel.stream() else {
            return Ok(match option {
                SocketOption::LowDelay => i32::from(self.low_delay),
                SocketOption::KeepAlive => i32::from(self.keep_alive),
                _ => 0,
            });
        };
        let sock = socket2::SockRef::from(stream);
        Ok(match option {
            SocketOption::LowDelay => i32::from(sock.nodelay()?),
            SocketOption::KeepAlive => i32::from(sock.keepalive()?),
            SocketOption::SendBufferSize => sock.send_buffer_size()? as i32,
            SocketOption::ReceiveBufferSize => sock.recv_buffer_size()? as i32,
        })
    }

    /// Connects to `host_or_ip:port`. Literal IPv4/IPv6 addresses connect
    /// directly; hostnames resolve asynchronously off-thread, trying
    /// addresses in the order returned until one succeeds (spec §4.3).
    pub fn connect(this: &Rc<RefCell<Self>>, reactor: &Reactor, host_or_ip: &str, port: u16) {
        {
            let s = this.borrow();
            if s.channel.borrow().state() != ChannelState::Unconnected {
                return;
            }
        }
        let literal = host_or_ip.parse::<IpAddr>().ok();
        {
            let mut s = this.borrow_mut();
            s.connecting_host = Some(host_or_ip.to_string());
            s.connecting_is_literal_address = literal.is_some();
            s.connecting_port = port;
            s.last_attempt_addr = None;
            s.channel.borrow_mut().set_state(ChannelState::Connecting);
        }
        Self::arm_connect_deadline(this, reactor);

        if let Some(ip) = literal {
            this.borrow_mut().addr_queue.push_back(ip);
            Self::try_next_address(this, reactor);
            return;
        }

        let pending = resolver::resolve(host_or_ip, port);
        this.borrow_mut().pending_resolve = Some(pending);
    }

    /// Advances DNS polling for any socket still waiting on a resolution;
    /// callers (the worker's per-turn sweep) invoke this once per reactor
    /// turn for every live socket in `Connecting` state, since a
    /// `crossbeam_channel::Receiver` isn't itself a readiness source this
    /// reactor's `mio::Poll` can watch directly.
    pub fn pump(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        let outcome = {
            let s = this.borrow();
            match &s.pending_resolve {
                Some(p) => p.try_recv(),
                None => return,
            }
        };
        match outcome {
            Some(ResolveOutcome::Addresses(addrs)) => {
                this.borrow_mut().pending_resolve = None;
                this.borrow_mut().addr_queue.extend(addrs);
                Self::try_next_address(this, reactor);
            }
            Some(ResolveOutcome::NotFound) => {
                let host = this.borrow().connecting_host.clone().unwrap_or_default();
                let msg = format!("Failed to connect to {host}. Could not fetch any address for domain.");
                Self::fail(this, reactor, msg);
            }
            None => {}
        }
    }

    fn arm_connect_deadline(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        let weak = Rc::downgrade(this);
        let token = reactor.schedule_timer(DEFAULT_CONNECT_TIMEOUT, move |reactor| {
            if let Some(strong) = weak.upgrade() {
                let still_connecting = strong.borrow().channel.borrow().state() == ChannelState::Connecting;
                if still_connecting {
                    strong.borrow_mut().connect_deadline_timer = None;
                    let host = strong.borrow().connecting_host.clone().unwrap_or_default();
                    let msg = format!("Failed to connect to {host}.");
                    Self::abandon_in_flight_attempt(&strong, reactor);
                    Self::fail(&strong, reactor, msg);
                }
            }
        });
        this.borrow_mut().connect_deadline_timer = Some(token);
    }

    /// Drops whatever connection attempt is currently in flight (a
    /// registered [`ConnectProbe`] or a live channel) without emitting any
    /// further events; used when the connect deadline fires out from under
    /// an attempt that never resolved on its own.
    fn abandon_in_flight_attempt(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        let token = this.borrow_mut().connect_probe_token.take();
        if let Some(token) = token {
            reactor.forget(token);
        }
        if this.borrow().channel.borrow().is_attached() {
            this.borrow_mut().channel.borrow_mut().detach(reactor);
        }
    }

    fn disarm_connect_deadline(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        if let Some(token) = this.borrow_mut().connect_deadline_timer.take() {
            reactor.cancel_timer(token);
        }
    }

    fn fail(this: &Rc<RefCell<Self>>, reactor: &Reactor, message: String) {
        Self::disarm_connect_deadline(this, reactor);
        let mut s = this.borrow_mut();
        s.addr_queue.clear();
        s.pending_resolve = None;
        s.channel.borrow_mut().set_state(ChannelState::Unconnected);
        s.error_message = message.clone();
        s.signals.error.emit(&message);
    }

    /// Builds the `"Failed to connect to <host> at <ip>:<port>."` (or the
    /// bare `"Failed to connect to <ip>:<port>."` form for a literal
    /// address) message for a resolved-but-unreachable endpoint (spec:
    /// "a resolved-but-unreachable host").
    fn endpoint_failure_message(this: &Rc<RefCell<Self>>, addr: SocketAddr) -> String {
        let s = this.borrow();
        if s.connecting_is_literal_address {
            format!("Failed to connect to {}:{}.", addr.ip(), addr.port())
        } else {
            let host = s.connecting_host.clone().unwrap_or_default();
            format!("Failed to connect to {host} at {}:{}.", addr.ip(), addr.port())
        }
    }

    fn try_next_address(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        let next = this.borrow_mut().addr_queue.pop_front();
        let Some(ip) = next else {
            let msg = match this.borrow().last_attempt_addr {
                Some(addr) => Self::endpoint_failure_message(this, addr),
                None => {
                    let host = this.borrow().connecting_host.clone().unwrap_or_default();
                    format!("Failed to connect to {host}.")
                }
            };
            Self::fail(this, reactor, msg);
            return;
        };
        let port = this.borrow().connecting_port;
        let addr = SocketAddr::new(ip, port);
        if Self::begin_connect(this, reactor, addr).is_err() {
            Self::try_next_address(this, reactor);
        }
    }

    fn begin_connect(this: &Rc<RefCell<Self>>, reactor: &Reactor, addr: SocketAddr) -> std::io::Result<()> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        {
            let s = this.borrow();
            if let (Some(bind_addr), Some(bind_port)) = (s.bind_address, s.bind_port) {
                socket.bind(&SocketAddr::new(bind_addr, bind_port).into())?;
            }
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        let std_stream: std::net::TcpStream = socket.into();
        let mut mio_stream = MioTcpStream::from_std(std_stream);
        let probe = Rc::new(ConnectProbe {
            stream: RefCell::new(None),
            owner: Rc::downgrade(this),
            addr,
        });
        let token = reactor.register(&mut mio_stream, Interest::READABLE | Interest::WRITABLE, probe.clone())?;
        *probe.stream.borrow_mut() = Some(mio_stream);
        this.borrow_mut().connect_probe_token = Some(token);
        Ok(())
    }

    fn on_connect_failed(this: &Rc<RefCell<Self>>, reactor: &Reactor, addr: SocketAddr) {
        this.borrow_mut().connect_probe_token = None;
        this.borrow_mut().last_attempt_addr = Some(addr);
        debug!(%addr, "connect attempt failed");
        Self::try_next_address(this, reactor);
    }

    fn on_connect_succeeded(this: &Rc<RefCell<Self>>, reactor: &Reactor, stream: MioTcpStream, addr: SocketAddr) {
        this.borrow_mut().connect_probe_token = None;
        this.borrow_mut().addr_queue.clear();
        this.borrow_mut().pending_resolve = None;
        Self::disarm_connect_deadline(this, reactor);

        let local = stream.local_addr().ok();
        let channel = this.borrow().channel.clone();
        if IoChannel::attach(&channel, reactor, stream, Interest::READABLE).is_err() {
            let msg = Self::endpoint_failure_message(this, addr);
            Self::fail(this, reactor, msg);
            return;
        }

        {
            let mut s = this.borrow_mut();
            s.peer_address = Some(addr.ip());
            s.peer_port = Some(addr.port());
            if let Some(local) = local {
                s.local_address = Some(local.ip());
                s.local_port = Some(local.port());
            }
        }
        if let Some(stream) = channel.borrow().stream() {
            let sock = socket2::SockRef::from(stream);
            let low_delay = this.borrow().low_delay;
            let keep_alive = this.borrow().keep_alive;
            let _ = sock.set_nodelay(low_delay);
            let _ = sock.set_keepalive(keep_alive);
        }
        debug!(%addr, "tcp connect completed");
        this.borrow_mut().signals.connected.emit(&());
    }

    pub fn write(&mut self, reactor: &Reactor, data: &[u8]) -> Result<()> {
        self.channel.borrow_mut().write(data, reactor)
    }

    pub fn disconnect_from_peer(&mut self, reactor: &Reactor) {
        self.channel.borrow_mut().disconnect_from_peer(reactor);
    }

    pub fn abort(&mut self, reactor: &Reactor) {
        self.channel.borrow_mut().abort(reactor);
    }

    pub fn set_read_buffer_capacity(&mut self, cap: usize) {
        self.channel.borrow_mut().set_read_buffer_capacity(cap);
    }
}

impl AsRawFd for TcpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.channel.borrow().stream().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }
}
