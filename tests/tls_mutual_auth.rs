//! TLS client-authentication path (spec §8 scenario 4): a server that
//! requires a client certificate accepts a client presenting one signed by
//! the trusted CA, completes the handshake on both sides, and round-trips
//! application data afterward.
#![cfg(feature = "tls")]

use kourier_net::config::TlsConfigurationData;
use kourier_net::reactor::Reactor;
use kourier_net::tls::{TlsConnector, TlsContext, TlsSocket};
use mio::net::TcpStream as MioTcpStream;
use rcgen::{CertificateParams, KeyPair};
use std::cell::{Cell, RefCell};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

struct IssuedCert {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

fn issue_ca() -> (rcgen::Certificate, KeyPair, IssuedCert) {
    let key = KeyPair::generate().expect("generate CA key");
    let mut params = CertificateParams::new(Vec::new()).expect("CA params");
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let cert = params.self_signed(&key).expect("self-sign CA cert");
    let issued = IssuedCert { cert_pem: cert.pem().into_bytes(), key_pem: key.serialize_pem().into_bytes() };
    (cert, key, issued)
}

fn issue_leaf(san: &str, ca_cert: &rcgen::Certificate, ca_key: &KeyPair) -> IssuedCert {
    let key = KeyPair::generate().expect("generate leaf key");
    let params = if san.is_empty() {
        CertificateParams::new(Vec::new()).expect("leaf params")
    } else {
        CertificateParams::new(vec![san.to_string()]).expect("leaf params")
    };
    let cert = params.signed_by(&key, ca_cert, ca_key).expect("sign leaf cert");
    IssuedCert { cert_pem: cert.pem().into_bytes(), key_pem: key.serialize_pem().into_bytes() }
}

/// Drives `reactor.turn()` until `done()` returns true or `budget` elapses,
/// always performing at least one turn before the first check (mirrors
/// `tests/integration.rs`'s `drive_until`: some signals fire synchronously).
fn drive_until(reactor: &Reactor, budget: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + budget;
    loop {
        reactor.turn().expect("reactor turn failed");
        if done() || Instant::now() >= deadline {
            break;
        }
    }
}

fn connected_pair() -> (MioTcpStream, MioTcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("local_addr");
    let client = TcpStream::connect(addr).expect("connect loopback client");
    let (server, _) = listener.accept().expect("accept loopback server");
    client.set_nonblocking(true).expect("client set_nonblocking");
    server.set_nonblocking(true).expect("server set_nonblocking");
    (MioTcpStream::from_std(client), MioTcpStream::from_std(server))
}

#[test]
fn mutual_tls_handshake_and_round_trip() {
    let (ca_cert, ca_key, ca_issued) = issue_ca();
    let server_cert = issue_leaf("localhost", &ca_cert, &ca_key);
    let client_cert = issue_leaf("", &ca_cert, &ca_key);

    let server_data = TlsConfigurationData {
        certificate_chain_pem: Some(server_cert.cert_pem.clone()),
        private_key_pem: Some(server_cert.key_pem.clone()),
        ca_bundle_pem: Some(ca_issued.cert_pem.clone()),
        verify_peer: true,
        ..Default::default()
    };
    let client_data = TlsConfigurationData {
        certificate_chain_pem: Some(client_cert.cert_pem.clone()),
        private_key_pem: Some(client_cert.key_pem.clone()),
        ca_bundle_pem: Some(ca_issued.cert_pem.clone()),
        verify_peer: true,
        ..Default::default()
    };

    let server_ctx = TlsContext::server(&server_data).expect("build server TLS context");
    let client_ctx = TlsContext::client(&client_data).expect("build client TLS context");

    let reactor = Reactor::new().unwrap();
    let (client_stream, server_stream) = connected_pair();

    let server_socket = TlsSocket::accept_server(&reactor, &server_ctx, server_stream).expect("start server handshake");
    let client_socket =
        TlsSocket::connect_client(&reactor, &client_ctx, "localhost", client_stream).expect("start client handshake");

    let server_encrypted = Rc::new(Cell::new(false));
    let client_encrypted = Rc::new(Cell::new(false));
    let server_error: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let client_error: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    {
        let flag = server_encrypted.clone();
        server_socket.signals.encrypted.connect(move |_| flag.set(true));
    }
    {
        let flag = client_encrypted.clone();
        client_socket.signals.encrypted.connect(move |_| flag.set(true));
    }
    {
        let slot = server_error.clone();
        server_socket.signals.error.connect(move |msg| *slot.borrow_mut() = Some(msg.clone()));
    }
    {
        let slot = client_error.clone();
        client_socket.signals.error.connect(move |msg| *slot.borrow_mut() = Some(msg.clone()));
    }

    drive_until(&reactor, Duration::from_secs(5), || server_encrypted.get() && client_encrypted.get());

    assert!(server_error.borrow().is_none(), "server reported an error: {:?}", server_error.borrow());
    assert!(client_error.borrow().is_none(), "client reported an error: {:?}", client_error.borrow());
    assert!(server_socket.is_encrypted(), "server never completed the handshake");
    assert!(client_socket.is_encrypted(), "client never completed the handshake");

    let server_received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let received = server_received.clone();
        let server_socket = server_socket.clone();
        server_socket.signals.data_received.connect(move |_| {
            let mut buf = server_socket.read_buf.borrow_mut();
            let bytes = buf.peek_all().to_vec();
            buf.discard(bytes.len());
            drop(buf);
            received.borrow_mut().extend_from_slice(&bytes);
        });
    }

    client_socket.write(&reactor, b"Some data").expect("queue client write");
    drive_until(&reactor, Duration::from_secs(5), || server_received.borrow().len() >= b"Some data".len());

    assert_eq!(*server_received.borrow(), b"Some data");
}

/// `connect_client` fires `connected` (not just `encrypted`) right away
/// since the stream handed to it is already connected (spec §4.4: "on TCP
/// connect completion, emit connected (isEncrypted=false), then drive the
/// TLS engine").
#[test]
fn client_handshake_emits_connected_before_encrypted() {
    let client_data = TlsConfigurationData { verify_peer: false, ..Default::default() };
    let client_ctx = TlsContext::client(&client_data).expect("build client TLS context");

    let reactor = Reactor::new().unwrap();
    let (client_stream, _server_stream) = connected_pair();
    let client_socket = TlsSocket::connect_client(&reactor, &client_ctx, "localhost", client_stream).expect("start client handshake");

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let order = order.clone();
        client_socket.signals.connected.connect(move |_| order.borrow_mut().push("connected"));
    }
    {
        let order = order.clone();
        client_socket.signals.encrypted.connect(move |_| order.borrow_mut().push("encrypted"));
    }

    assert!(!client_socket.is_encrypted(), "connected must fire before the handshake completes");
    drive_until(&reactor, Duration::from_secs(2), || client_socket.is_encrypted());
    assert_eq!(*order.borrow(), vec!["connected", "encrypted"]);
}

/// `TlsConnector::connect` mirrors `TcpSocket::connect` (spec §4.4:
/// "Operations mirror TcpSocket plus isEncrypted()"): given a bare
/// hostname/port it resolves, connects, and drives the handshake without
/// the caller ever touching a raw stream.
#[test]
fn connector_resolves_connects_and_completes_handshake() {
    let (ca_cert, ca_key, _ca_issued) = issue_ca();
    let server_cert = issue_leaf("localhost", &ca_cert, &ca_key);

    let server_data = TlsConfigurationData {
        certificate_chain_pem: Some(server_cert.cert_pem.clone()),
        private_key_pem: Some(server_cert.key_pem.clone()),
        ..Default::default()
    };
    let client_data = TlsConfigurationData { verify_peer: false, ..Default::default() };

    let server_ctx = TlsContext::server(&server_data).expect("build server TLS context");
    let client_ctx = TlsContext::client(&client_data).expect("build client TLS context");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let port = listener.local_addr().expect("local_addr").port();
    let (accepted_tx, accepted_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            stream.set_nonblocking(true).expect("server set_nonblocking");
            let _ = accepted_tx.send(stream);
        }
    });

    let reactor = Reactor::new().unwrap();
    let connector = TlsConnector::connect(&reactor, client_ctx, "127.0.0.1", port);

    let tcp_connected = Rc::new(Cell::new(false));
    let client_encrypted = Rc::new(Cell::new(false));
    {
        let flag = tcp_connected.clone();
        connector.signals.connected.connect(move |_| flag.set(true));
    }
    {
        let flag = client_encrypted.clone();
        connector.signals.encrypted.connect(move |_| flag.set(true));
    }

    let mut server_socket: Option<Rc<TlsSocket>> = None;
    let server_encrypted = Rc::new(Cell::new(false));

    let deadline = Instant::now() + Duration::from_secs(5);
    while (!client_encrypted.get() || !server_encrypted.get()) && Instant::now() < deadline {
        reactor.turn().expect("reactor turn failed");
        TlsConnector::pump(&connector, &reactor);
        if server_socket.is_none() {
            if let Ok(stream) = accepted_rx.try_recv() {
                let mio_stream = MioTcpStream::from_std(stream);
                let socket = TlsSocket::accept_server(&reactor, &server_ctx, mio_stream).expect("start server handshake");
                let flag = server_encrypted.clone();
                socket.signals.encrypted.connect(move |_| flag.set(true));
                server_socket = Some(socket);
            }
        }
    }

    assert!(tcp_connected.get(), "connector never reported TCP connect completion");
    assert!(client_encrypted.get(), "client never completed the handshake");
    assert!(server_encrypted.get(), "server never completed the handshake");
    assert!(connector.inner().expect("connector should have handed off to a TlsSocket").is_encrypted());
}
