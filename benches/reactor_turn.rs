//! Micro-benchmark for one client/server connection driven entirely by
//! `Reactor::turn` (spec §4.2/§4.7 components C8/C11): measures how many
//! reactor turns it takes to push a fixed amount of payload end to end over
//! a loopback `TcpSocket` pair.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kourier_net::config::StartData;
use kourier_net::handler::{ConnectionHandler, ConnectionHandlerFactory};
use kourier_net::reactor::Reactor;
use kourier_net::signal::Signal;
use kourier_net::tcp::TcpSocket;
use kourier_net::worker::ServerWorker;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

struct SinkHandler {
    socket: Rc<RefCell<TcpSocket>>,
    received: Cell<usize>,
    disconnected: Signal<()>,
}

impl SinkHandler {
    fn new(reactor: &Reactor, fd: RawFd) -> Rc<Self> {
        let socket = TcpSocket::from_accepted_fd(reactor, fd);
        Rc::new_cyclic(|weak: &Weak<SinkHandler>| {
            let channel = socket.borrow().channel().clone();
            {
                let socket = socket.clone();
                let weak = weak.clone();
                channel.borrow().signals.data_received.connect(move |_| {
                    let Some(this) = weak.upgrade() else { return };
                    let channel = socket.borrow().channel().clone();
                    let mut ch = channel.borrow_mut();
                    let n = ch.read_buf.peek_all().len();
                    ch.read_buf.discard(n);
                    drop(ch);
                    this.received.set(this.received.get() + n);
                });
            }
            SinkHandler { socket, received: Cell::new(0), disconnected: Signal::new() }
        })
    }
}

impl ConnectionHandler for SinkHandler {
    fn disconnected(&self) -> &Signal<()> {
        &self.disconnected
    }
    fn request_disconnect(&self, reactor: &Reactor) {
        self.socket.borrow_mut().disconnect_from_peer(reactor);
    }
}

struct SinkFactory {
    handlers: RefCell<Vec<Rc<SinkHandler>>>,
}

impl ConnectionHandlerFactory for SinkFactory {
    fn create(&self, reactor: &Reactor, fd: RawFd) -> Rc<dyn ConnectionHandler> {
        let handler = SinkHandler::new(reactor, fd);
        self.handlers.borrow_mut().push(handler.clone());
        handler
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn drive_until(reactor: &Reactor, budget: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + budget;
    loop {
        reactor.turn().unwrap();
        if done() || Instant::now() >= deadline {
            break;
        }
    }
}

fn throughput(c: &mut Criterion) {
    c.bench_function("reactor_turn_1mb_round_trip", |b| {
        b.iter(|| {
            let reactor = Reactor::new().unwrap();
            let port = free_port();
            let factory = Rc::new(SinkFactory { handlers: RefCell::new(Vec::new()) });

            struct Adapter(Rc<SinkFactory>);
            impl ConnectionHandlerFactory for Adapter {
                fn create(&self, reactor: &Reactor, fd: RawFd) -> Rc<dyn ConnectionHandler> {
                    self.0.create(reactor, fd)
                }
            }

            let worker = ServerWorker::new(Box::new(Adapter(factory.clone())));
            ServerWorker::start(&worker, &reactor, StartData::with_address("127.0.0.1", port));
            drive_until(&reactor, Duration::from_secs(2), || {
                worker.state() == kourier_net::worker::WorkerState::Started
            });

            let client = TcpSocket::new();
            let connected = Rc::new(Cell::new(false));
            {
                let flag = connected.clone();
                client.borrow().signals.connected.connect(move |_| flag.set(true));
            }
            TcpSocket::connect(&client, &reactor, "127.0.0.1", port);
            drive_until(&reactor, Duration::from_secs(2), || connected.get());

            let payload = vec![0x5Au8; 1024 * 1024];
            client.borrow_mut().write(&reactor, black_box(&payload)).unwrap();
            drive_until(&reactor, Duration::from_secs(5), || {
                factory.handlers.borrow().first().map(|h| h.received.get()).unwrap_or(0) >= payload.len()
            });

            black_box(factory.handlers.borrow().first().map(|h| h.received.get()).unwrap_or(0))
        });
    });
}

criterion_group!(benches, throughput);
criterion_main!(benches);
