//! Event-driven, readiness-based TCP/TLS networking runtime: ring-buffered
//! sockets driven by a single-threaded-per-worker `mio` reactor, with an
//! optional TLS overlay and a multi-worker accept server.
//!
//! No `async`/`await`, no `tokio`: progress is driven entirely by readiness
//! events dispatched from [`reactor::Reactor::turn`]. Parallelism, where it
//! exists, is across workers ([`worker::ServerWorker`] /
//! [`host::AsyncWorkerHost`] / [`server::Server`]), never within one.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod listener;
pub mod reactor;
pub mod resolver;
pub mod server;
pub mod signal;
pub mod tcp;
pub mod timer;
#[cfg(feature = "tls")]
pub mod tls;
pub mod worker;

pub use config::{SocketOption, StartData, TlsConfigurationData, TlsVersion, ValidatedStart};
pub use error::{Error, EventKind, Result};
pub use handler::{ConnectionHandler, ConnectionHandlerFactory, Repository};
pub use host::AsyncWorkerHost;
pub use listener::ConnectionListener;
pub use reactor::{IoSource, Reactor};
pub use server::{Server, ServerState};
pub use tcp::TcpSocket;
#[cfg(feature = "tls")]
pub use tls::{TlsConnector, TlsContext, TlsRole, TlsSocket};
pub use worker::{ServerWorker, WorkerState};
