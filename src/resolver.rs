//! Off-thread DNS resolution so a slow `getaddrinfo()` never blocks a
//! worker's event loop (spec §5/§9).
//!
//! `TcpSocket::connect` hands a hostname to [`Resolver::resolve`], which
//! runs the (blocking) `std::net::ToSocketAddrs` lookup on a spawned
//! thread and delivers the result back over a `crossbeam_channel`. The
//! caller polls the channel from its own event-loop turn rather than
//! blocking on it, the same isolation-of-blocking-work principle the
//! teacher's `net.rs` applies to other syscalls.

use crossbeam_channel::{Receiver, Sender};
use std::net::{IpAddr, SocketAddr};

/// Outcome of one resolution request, delivered on the requester's thread.
pub enum ResolveOutcome {
    Addresses(Vec<IpAddr>),
    NotFound,
}

/// A resolution in flight; poll [`Pending::try_recv`] from the event loop.
pub struct Pending {
    rx: Receiver<ResolveOutcome>,
}

impl Pending {
    pub fn try_recv(&self) -> Option<ResolveOutcome> {
        self.rx.try_recv().ok()
    }
}

/// Spawns a one-shot resolver thread for `host`. If `host` already parses
/// as a literal IPv4/IPv6 address, the caller should skip this entirely
/// (spec §4.3: "if the argument parses as a literal IPv4/IPv6, connect
/// directly").
pub fn resolve(host: &str, port: u16) -> Pending {
    let (tx, rx): (Sender<ResolveOutcome>, Receiver<ResolveOutcome>) = crossbeam_channel::bounded(1);
    let host = host.to_owned();
    std::thread::Builder::new()
        .name("kourier-resolver".into())
        .spawn(move || {
            let outcome = match (host.as_str(), port).to_socket_addrs() {
                Ok(iter) => {
                    let addrs: Vec<IpAddr> = iter.map(|a: SocketAddr| a.ip()).collect();
                    if addrs.is_empty() {
                        ResolveOutcome::NotFound
                    } else {
                        ResolveOutcome::Addresses(addrs)
                    }
                }
                Err(_) => ResolveOutcome::NotFound,
            };
            let _ = tx.send(outcome);
        })
        .expect("failed to spawn resolver thread");
    Pending { rx }
}

use std::net::ToSocketAddrs;
