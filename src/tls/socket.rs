//! Encrypt-on-write/decrypt-on-read stream socket built on `rustls` (spec
//! §3/§4.4, component C5).
//!
//! Unlike [`TcpSocket`], a `TlsSocket` implements
//! [`IoSource`] itself rather than delegating to
//! [`crate::channel::IoChannel`]: `rustls::ClientConnection`/`ServerConnection`
//! already buffer ciphertext internally (`read_tls`/`write_tls` read and
//! write straight from/to the raw stream), so there's no ciphertext ring
//! buffer to share with the plaintext socket's machinery. The plaintext
//! side still gets a [`RingBuffer`] for decrypted application bytes and
//! for writes queued before the handshake finishes.

use crate::buffer::RingBuffer;
use crate::error::{Error, Result};
use crate::reactor::{IoSource, Reactor};
use crate::signal::Signal;
use crate::tcp::TcpSocket;
use crate::timer::TimerToken;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Token};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;

use super::config::TlsContext;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

enum Conn {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Conn {
    fn wants_read(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_read(),
            Conn::Server(s) => s.wants_read(),
        }
    }
    fn wants_write(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_write(),
            Conn::Server(s) => s.wants_write(),
        }
    }
    fn is_handshaking(&self) -> bool {
        match self {
            Conn::Client(c) => c.is_handshaking(),
            Conn::Server(s) => s.is_handshaking(),
        }
    }
    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match self {
            Conn::Client(c) => c.read_tls(rd),
            Conn::Server(s) => s.read_tls(rd),
        }
    }
    fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
        match self {
            Conn::Client(c) => c.write_tls(wr),
            Conn::Server(s) => s.write_tls(wr),
        }
    }
    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        match self {
            Conn::Client(c) => c.process_new_packets(),
            Conn::Server(s) => s.process_new_packets(),
        }
    }
    fn reader_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Conn::Client(c) => c.reader().read(buf),
            Conn::Server(s) => s.reader().read(buf),
        }
    }
    fn write_plain(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Conn::Client(c) => c.writer().write(buf),
            Conn::Server(s) => s.writer().write(buf),
        }
    }
    fn send_close_notify(&mut self) {
        match self {
            Conn::Client(c) => c.send_close_notify(),
            Conn::Server(s) => s.send_close_notify(),
        }
    }
    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Conn::Client(c) => c.alpn_protocol(),
            Conn::Server(s) => s.alpn_protocol(),
        }
    }
}

#[derive(Default)]
pub struct TlsSignals {
    /// Fired once the underlying TCP connection is up, before the TLS
    /// handshake starts (`is_encrypted()` is still `false`). Mirrors
    /// `TcpSocket::signals.connected` (spec §4.4: "Client handshake: on TCP
    /// connect completion, emit connected (isEncrypted=false), then drive
    /// the TLS engine").
    pub connected: Signal<()>,
    /// Fired once, after the handshake completes successfully.
    pub encrypted: Signal<()>,
    /// Decrypted application bytes are available in `TlsSocket::read_buf`.
    pub data_received: Signal<()>,
    pub data_sent: Signal<()>,
    pub error: Signal<String>,
    pub disconnected: Signal<()>,
}

/// TLS stream socket overlaying a connected plaintext fd (spec component
/// C5). Always used behind `Rc` since it registers itself with the
/// reactor as an [`IoSource`].
pub struct TlsSocket {
    stream: RefCell<Option<MioTcpStream>>,
    token: RefCell<Option<Token>>,
    conn: RefCell<Conn>,
    role: TlsRole,
    encrypted: Cell<bool>,
    closed: Cell<bool>,
    handshake_timer: RefCell<Option<TimerToken>>,
    pub read_buf: RefCell<RingBuffer>,
    pending_writes: RefCell<RingBuffer>,
    peer_address: Cell<Option<IpAddr>>,
    peer_port: Cell<Option<u16>>,
    local_address: Cell<Option<IpAddr>>,
    local_port: Cell<Option<u16>>,
    error_message: RefCell<String>,
    /// The hostname passed to `connect_client`/`TlsSocket::connect`, kept
    /// around only to build the handshake-timeout message; `None` for the
    /// server role.
    connecting_host: Option<String>,
    pub signals: TlsSignals,
}

impl TlsSocket {
    /// Wraps an already-connected stream as a TLS client, immediately
    /// starting the handshake (the `ClientHello` rustls queues at
    /// construction is flushed on the first `pump`).
    pub fn connect_client(
        reactor: &Reactor,
        ctx: &TlsContext,
        server_name: &str,
        stream: MioTcpStream,
    ) -> Result<Rc<Self>> {
        let TlsContext::Client(config) = ctx else {
            return Err(Error::configuration(
                "Failed to start TLS handshake. Given TLS context is not a client context.",
            ));
        };
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::configuration(format!("Failed to start TLS handshake. \"{server_name}\" is not a valid server name.")))?;
        let conn = ClientConnection::new(config.clone(), name)
            .map_err(|e| Error::tls_handshake(format!("Failed to start TLS handshake: {e}.")))?;
        Ok(Self::new(reactor, TlsRole::Client, Conn::Client(conn), stream, Some(server_name.to_string())))
    }

    /// Wraps an already-accepted stream as a TLS server, waiting for the
    /// peer's `ClientHello`.
    pub fn accept_server(reactor: &Reactor, ctx: &TlsContext, stream: MioTcpStream) -> Result<Rc<Self>> {
        let TlsContext::Server(config) = ctx else {
            return Err(Error::configuration(
                "Failed to start TLS handshake. Given TLS context is not a server context.",
            ));
        };
        let conn = ServerConnection::new(config.clone())
            .map_err(|e| Error::tls_handshake(format!("Failed to start TLS handshake: {e}.")))?;
        Ok(Self::new(reactor, TlsRole::Server, Conn::Server(conn), stream, None))
    }

    fn new(reactor: &Reactor, role: TlsRole, conn: Conn, mut stream: MioTcpStream, connecting_host: Option<String>) -> Rc<Self> {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let socket = Rc::new(Self {
            stream: RefCell::new(None),
            token: RefCell::new(None),
            conn: RefCell::new(conn),
            role,
            encrypted: Cell::new(false),
            closed: Cell::new(false),
            handshake_timer: RefCell::new(None),
            read_buf: RefCell::new(RingBuffer::new(0)),
            pending_writes: RefCell::new(RingBuffer::new(0)),
            peer_address: Cell::new(peer.map(|a: SocketAddr| a.ip())),
            peer_port: Cell::new(peer.map(|a| a.port())),
            local_address: Cell::new(local.map(|a: SocketAddr| a.ip())),
            local_port: Cell::new(local.map(|a| a.port())),
            error_message: RefCell::new(String::new()),
            connecting_host,
            signals: TlsSignals::default(),
        });
        if let Ok(token) = reactor.register(&mut stream, Interest::READABLE | Interest::WRITABLE, socket.clone()) {
            *socket.token.borrow_mut() = Some(token);
        }
        *socket.stream.borrow_mut() = Some(stream);
        if role == TlsRole::Client {
            // The TCP connection is already established by the time a
            // `TlsSocket` wraps it; spec §4.4 wants `connected` to fire
            // before the handshake starts, not after it finishes.
            socket.signals.connected.emit(&());
        }
        Self::arm_handshake_timeout(&socket, reactor);
        socket.pump(reactor);
        socket
    }

    fn arm_handshake_timeout(this: &Rc<Self>, reactor: &Reactor) {
        let weak: Weak<Self> = Rc::downgrade(this);
        let token = reactor.schedule_timer(DEFAULT_HANDSHAKE_TIMEOUT, move |reactor| {
            if let Some(strong) = weak.upgrade() {
                if !strong.encrypted.get() && !strong.closed.get() {
                    strong.handshake_timer.borrow_mut().take();
                    let msg = strong.handshake_timeout_message();
                    strong.fail(reactor, msg);
                }
            }
        });
        *this.handshake_timer.borrow_mut() = Some(token);
    }

    /// Builds the handshake-timeout failure message (spec §4.4): the
    /// client form includes the original hostname plus the resolved peer
    /// endpoint, `"Failed to connect to <host> at <ip>:<port>. TLS
    /// handshake timed out."`; the server form reports the peer endpoint
    /// it accepted from instead, since there is no "host" to name.
    fn handshake_timeout_message(&self) -> String {
        let peer = match (self.peer_address.get(), self.peer_port.get()) {
            (Some(ip), Some(port)) => Some(format!("{ip}:{port}")),
            _ => None,
        };
        match self.role {
            TlsRole::Client => {
                let host = self.connecting_host.clone().unwrap_or_default();
                match peer {
                    Some(endpoint) => format!("Failed to connect to {host} at {endpoint}. TLS handshake timed out."),
                    None => format!("Failed to connect to {host}. TLS handshake timed out."),
                }
            }
            TlsRole::Server => match peer {
                Some(endpoint) => format!("Failed to accept connection from {endpoint}. TLS handshake timed out."),
                None => "Failed to accept connection. TLS handshake timed out.".to_string(),
            },
        }
    }

    fn disarm_handshake_timeout(&self, reactor: &Reactor) {
        if let Some(token) = self.handshake_timer.borrow_mut().take() {
            reactor.cancel_timer(token);
        }
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.get()
    }

    pub fn error_message(&self) -> String {
        self.error_message.borrow().clone()
    }

    pub fn peer_address(&self) -> Option<IpAddr> {
        self.peer_address.get()
    }
    pub fn peer_port(&self) -> Option<u16> {
        self.peer_port.get()
    }
    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address.get()
    }
    pub fn local_port(&self) -> Option<u16> {
        self.local_port.get()
    }

    /// Negotiated ALPN protocol, available only once `is_encrypted()`.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.conn.borrow().alpn_protocol().map(|p| p.to_vec())
    }

    /// Queues `data` for encrypted delivery. Writes submitted before the
    /// handshake completes are queued and flushed once it does (spec §4.4
    /// "queued pre-handshake writes").
    pub fn write(&self, reactor: &Reactor, data: &[u8]) -> Result<()> {
        if self.closed.get() {
            return Ok(());
        }
        if !self.encrypted.get() {
            self.pending_writes.borrow_mut().write(data)?;
            return Ok(());
        }
        self.write_plaintext_now(data)?;
        self.flush_tls(reactor);
        Ok(())
    }

    fn write_plaintext_now(&self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let n = self
                .conn
                .borrow_mut()
                .write_plain(remaining)
                .map_err(|e| Error::tls_protocol(format!("Failed to write encrypted data: {e}.")))?;
            if n == 0 {
                break;
            }
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Sends a TLS `close_notify` and stops accepting further writes; the
    /// underlying fd closes once it has flushed (spec §4.4).
    pub fn disconnect_from_peer(&self, reactor: &Reactor) {
        if self.closed.get() {
            return;
        }
        self.conn.borrow_mut().send_close_notify();
        self.flush_tls(reactor);
        self.teardown(reactor, true);
    }

    /// Immediately closes the fd without attempting a clean shutdown.
    pub fn abort(&self, reactor: &Reactor) {
        self.teardown(reactor, true);
    }

    fn teardown(&self, reactor: &Reactor, emit_disconnected: bool) {
        if self.closed.get() {
            return;
        }
        self.closed.set(true);
        self.disarm_handshake_timeout(reactor);
        if let (Some(mut stream), Some(token)) = (self.stream.borrow_mut().take(), self.token.borrow_mut().take()) {
            let _ = reactor.deregister(&mut stream, token);
        }
        if emit_disconnected {
            self.signals.disconnected.emit(&());
        }
    }

    fn fail(&self, reactor: &Reactor, message: String) {
        *self.error_message.borrow_mut() = message.clone();
        self.signals.error.emit(&message);
        self.teardown(reactor, true);
    }

    /// Drives handshake/record processing. Called from `readable`/`writable`
    /// and once immediately after construction to flush the initial
    /// `ClientHello` (client role).
    fn pump(&self, reactor: &Reactor) {
        if self.closed.get() {
            return;
        }
        if self.conn.borrow().wants_read() {
            if let Err(eof_or_err) = self.pull_ciphertext(reactor) {
                if eof_or_err {
                    self.teardown(reactor, true);
                }
                return;
            }
        }

        let was_handshaking = self.conn.borrow().is_handshaking();
        if !was_handshaking && !self.encrypted.get() {
            self.encrypted.set(true);
            self.disarm_handshake_timeout(reactor);
            debug!(role = ?self.role, "tls handshake complete");
            self.signals.encrypted.emit(&());
            let mut queued = std::mem::take(&mut *self.pending_writes.borrow_mut());
            let bytes = queued.peek_all().to_vec();
            if !bytes.is_empty() {
                let _ = self.write_plaintext_now(&bytes);
            }
        }

        if self.encrypted.get() {
            self.drain_plaintext();
        }

        self.flush_tls(reactor);
        self.rearm_interest(reactor);
    }

    /// Returns `Err(true)` on a clean EOF that should tear the connection
    /// down, `Err(false)` on a fatal protocol error already reported.
    fn pull_ciphertext(&self, reactor: &Reactor) -> std::result::Result<(), bool> {
        loop {
            let mut stream_ref = self.stream.borrow_mut();
            let Some(stream) = stream_ref.as_mut() else { return Ok(()) };
            match self.conn.borrow_mut().read_tls(stream) {
                Ok(0) => return Err(true),
                Ok(_) => {
                    drop(stream_ref);
                    if let Err(e) = self.conn.borrow_mut().process_new_packets() {
                        self.fail(reactor, format!("TLS protocol error: {e}."));
                        return Err(false);
                    }
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(stream_ref);
                    self.fail(reactor, Error::format_posix(&e));
                    return Err(false);
                }
            }
        }
    }

    fn drain_plaintext(&self) {
        let mut buf = [0u8; 16 * 1024];
        let mut produced = false;
        loop {
            match self.conn.borrow_mut().reader_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if self.read_buf.borrow_mut().write(&buf[..n]).is_err() {
                        break;
                    }
                    produced = true;
                }
                Err(_) => break,
            }
        }
        if produced {
            self.signals.data_received.emit(&());
        }
    }

    fn flush_tls(&self, reactor: &Reactor) {
        let mut sent_any = false;
        while self.conn.borrow().wants_write() {
            let mut stream_ref = self.stream.borrow_mut();
            let Some(stream) = stream_ref.as_mut() else { break };
            match self.conn.borrow_mut().write_tls(stream) {
                Ok(0) => break,
                Ok(_) => sent_any = true,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(stream_ref);
                    self.fail(reactor, Error::format_posix(&e));
                    return;
                }
            }
        }
        if sent_any {
            self.signals.data_sent.emit(&());
        }
    }

    fn rearm_interest(&self, reactor: &Reactor) {
        let interest = if self.conn.borrow().wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let (Some(stream), Some(token)) = (self.stream.borrow_mut().as_mut(), *self.token.borrow()) {
            let _ = reactor.reregister(stream, token, interest);
        }
    }
}

impl IoSource for TlsSocket {
    fn readable(&self, reactor: &Reactor) {
        self.pump(reactor);
    }
    fn writable(&self, reactor: &Reactor) {
        self.pump(reactor);
    }
    fn hangup(&self, reactor: &Reactor) {
        self.teardown(reactor, true);
    }
}

/// Drives a DNS-resolve-then-TCP-connect-then-TLS-handshake sequence,
/// mirroring `TcpSocket::connect` the way spec §4.4 asks ("Operations
/// mirror TcpSocket plus isEncrypted()"). `TlsSocket::connect_client` only
/// wraps an already-connected stream; this is the entry point for callers
/// that start from a bare hostname.
///
/// Exposes the same [`TlsSignals`] shape so a caller can treat it exactly
/// like a `TlsSocket` once `connected` has fired; before that, `inner()`
/// returns `None`.
pub struct TlsConnector {
    tcp: Rc<RefCell<TcpSocket>>,
    tcp_connected: Rc<Cell<bool>>,
    ctx: TlsContext,
    server_name: String,
    handed_off: Cell<bool>,
    inner: RefCell<Option<Rc<TlsSocket>>>,
    pub signals: TlsSignals,
}

impl TlsConnector {
    /// Starts resolving and connecting to `host:port`. The returned handle
    /// must be swept once per reactor turn with [`TlsConnector::pump`]
    /// until `inner()` is populated or `signals.error` fires, the same way
    /// `TcpSocket::pump` is swept while a DNS resolution is pending.
    pub fn connect(reactor: &Reactor, ctx: TlsContext, host: &str, port: u16) -> Rc<Self> {
        let tcp = TcpSocket::new();
        let tcp_connected = Rc::new(Cell::new(false));
        {
            let flag = tcp_connected.clone();
            tcp.borrow().signals.connected.connect(move |_| flag.set(true));
        }
        let this = Rc::new(Self {
            tcp: tcp.clone(),
            tcp_connected,
            ctx,
            server_name: host.to_string(),
            handed_off: Cell::new(false),
            inner: RefCell::new(None),
            signals: TlsSignals::default(),
        });
        {
            let weak = Rc::downgrade(&this);
            tcp.borrow().signals.error.connect(move |msg| {
                if let Some(strong) = weak.upgrade() {
                    if !strong.handed_off.replace(true) {
                        strong.signals.error.emit(msg);
                        strong.signals.disconnected.emit(&());
                    }
                }
            });
        }
        TcpSocket::connect(&tcp, reactor, host, port);
        this
    }

    /// The established `TlsSocket`, once the TCP connect has completed and
    /// the handshake has been started (not necessarily finished — use
    /// `signals.encrypted`/`inner().is_encrypted()` for that).
    pub fn inner(&self) -> Option<Rc<TlsSocket>> {
        self.inner.borrow().clone()
    }

    /// Advances the pending DNS/TCP connect; once it completes, hands the
    /// connected stream off to a fresh [`TlsSocket`] and forwards its
    /// signals. Safe to call every turn even after the handoff — it's a
    /// no-op once `inner()` is populated.
    pub fn pump(this: &Rc<Self>, reactor: &Reactor) {
        if this.handed_off.get() {
            return;
        }
        TcpSocket::pump(&this.tcp, reactor);
        if !this.tcp_connected.get() {
            return;
        }
        this.handed_off.set(true);

        let channel = this.tcp.borrow().channel().clone();
        let stream = channel.borrow_mut().take_stream(reactor);
        let Some(stream) = stream else {
            let msg = "Failed to start TLS handshake. TCP stream unavailable after connect.".to_string();
            this.signals.error.emit(&msg);
            this.signals.disconnected.emit(&());
            return;
        };

        this.signals.connected.emit(&());
        match TlsSocket::connect_client(reactor, &this.ctx, &this.server_name, stream) {
            Ok(inner) => {
                Self::forward_signals(this, &inner);
                *this.inner.borrow_mut() = Some(inner);
            }
            Err(e) => {
                let msg = e.to_string();
                this.signals.error.emit(&msg);
                this.signals.disconnected.emit(&());
            }
        }
    }

    fn forward_signals(this: &Rc<Self>, inner: &Rc<TlsSocket>) {
        macro_rules! forward {
            ($field:ident, $arg:ty) => {{
                let weak = Rc::downgrade(this);
                inner.signals.$field.connect(move |arg: &$arg| {
                    if let Some(strong) = weak.upgrade() {
                        strong.signals.$field.emit(arg);
                    }
                });
            }};
        }
        forward!(encrypted, ());
        forward!(data_received, ());
        forward!(data_sent, ());
        forward!(error, String);
        forward!(disconnected, ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfigurationData;
    use rcgen::{CertificateParams, KeyPair};

    fn loopback_pair() -> (MioTcpStream, MioTcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (MioTcpStream::from_std(client), MioTcpStream::from_std(server))
    }

    #[test]
    fn handshake_timeout_message_for_client_includes_host_and_peer() {
        let data = TlsConfigurationData { verify_peer: false, ..Default::default() };
        let ctx = TlsContext::client(&data).expect("build client TLS context");
        let reactor = Reactor::new().unwrap();
        let (client_stream, _server_stream) = loopback_pair();
        let socket = TlsSocket::connect_client(&reactor, &ctx, "example.invalid", client_stream).expect("start client handshake");

        let peer = socket.peer_address().expect("peer address");
        let port = socket.peer_port().expect("peer port");
        assert_eq!(
            socket.handshake_timeout_message(),
            format!("Failed to connect to example.invalid at {peer}:{port}. TLS handshake timed out.")
        );
    }

    #[test]
    fn handshake_timeout_message_for_server_uses_peer_endpoint() {
        let key = KeyPair::generate().expect("generate key");
        let params = CertificateParams::new(vec!["localhost".to_string()]).expect("cert params");
        let cert = params.self_signed(&key).expect("self-sign cert");
        let data = TlsConfigurationData {
            certificate_chain_pem: Some(cert.pem().into_bytes()),
            private_key_pem: Some(key.serialize_pem().into_bytes()),
            ..Default::default()
        };
        let ctx = TlsContext::server(&data).expect("build server TLS context");
        let reactor = Reactor::new().unwrap();
        let (_client_stream, server_stream) = loopback_pair();
        let socket = TlsSocket::accept_server(&reactor, &ctx, server_stream).expect("start server handshake");

        let peer = socket.peer_address().expect("peer address");
        let port = socket.peer_port().expect("peer port");
        assert_eq!(socket.handshake_timeout_message(), format!("Failed to accept connection from {peer}:{port}. TLS handshake timed out."));
    }
}
