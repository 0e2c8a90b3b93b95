//! Start-data and socket-option schemas (spec §6).
//!
//! These are plain `serde`-derivable structs, not a config-file loader —
//! loading TOML/CLI config is explicitly out of scope (spec §1). A caller
//! that wants file-based config brings its own deserializer (`toml`,
//! `serde_json`, ...) and feeds these `derive(Deserialize)` structs, the
//! way the teacher's `config.rs` structures wire up.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::os::unix::io::RawFd;

/// Start data accepted by [`crate::listener::ConnectionListener::start`]
/// and [`crate::server::Server::start`] (spec §6 table).
///
/// Either `address`+`port` or `socket_descriptor` must be given; supplying
/// both is a [`Error::Configuration`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartData {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub backlog_size: Option<i32>,
    pub socket_descriptor: Option<RawFd>,
}

impl StartData {
    pub fn with_address(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: Some(address.into()),
            port: Some(port),
            backlog_size: None,
            socket_descriptor: None,
        }
    }

    pub fn with_fd(fd: RawFd) -> Self {
        Self {
            address: None,
            port: None,
            backlog_size: None,
            socket_descriptor: Some(fd),
        }
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog_size = Some(n);
        self
    }

    /// Validates field presence/shape per spec §4.5/§6, in the order the
    /// original listener checks them: backlog type/value, then
    /// fd-vs-address/port exclusivity, then address, then port.
    pub fn validate(&self) -> Result<ValidatedStart> {
        let backlog = match self.backlog_size {
            Some(n) if n <= 0 => {
                return Err(Error::configuration(
                    "Failed to start connection listener. Given backlogSize is not a positive integer.",
                ))
            }
            Some(n) => n as i32,
            None => 50,
        };

        match (self.socket_descriptor, &self.address, self.port) {
            (Some(_), None, None) => {}
            (Some(_), _, _) => {
                return Err(Error::configuration(
                    "Failed to start connection listener. Given data contains both socketDescriptor and address/port.",
                ))
            }
            (None, Some(addr), Some(port)) => {
                if addr.parse::<IpAddr>().is_err() {
                    return Err(Error::configuration(
                        "Failed to start connection listener. Given address is not valid.",
                    ));
                }
                if port == 0 {
                    return Err(Error::configuration(
                        "Failed to start connection listener. Given port must be positive.",
                    ));
                }
            }
            (None, None, _) => {
                return Err(Error::configuration(
                    "Failed to start connection listener. Given data does not contain an address.",
                ))
            }
            (None, Some(_), None) => {
                return Err(Error::configuration(
                    "Failed to start connection listener. Given data does not contain a port.",
                ))
            }
        }

        Ok(ValidatedStart {
            address: self.address.clone(),
            port: self.port,
            backlog_size: backlog,
            socket_descriptor: self.socket_descriptor,
        })
    }
}

/// A [`StartData`] that has passed [`StartData::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedStart {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub backlog_size: i32,
    pub socket_descriptor: Option<RawFd>,
}

/// Socket options exposed by [`crate::tcp::TcpSocket`] (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    LowDelay,
    KeepAlive,
    SendBufferSize,
    ReceiveBufferSize,
}

/// TLS parameters (spec §3 C4 / §6). Immutable once constructed; not tied
/// to any one certificate file format beyond PEM bytes or a path, per
/// spec's scope note.
#[derive(Debug, Clone, Default)]
pub struct TlsConfigurationData {
    pub certificate_chain_pem: Option<Vec<u8>>,
    pub private_key_pem: Option<Vec<u8>>,
    pub private_key_password: Option<String>,
    pub ca_bundle_pem: Option<Vec<u8>>,
    pub verify_peer: bool,
    pub min_protocol_version: Option<TlsVersion>,
    pub max_protocol_version: Option<TlsVersion>,
    pub cipher_list: Option<Vec<String>>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsConfigurationData {
    /// A configuration is client-usable when it has a CA bundle (or
    /// accepts system defaults, represented here by `ca_bundle_pem` being
    /// `None` with `verify_peer == false`).
    pub fn is_client_usable(&self) -> bool {
        self.ca_bundle_pem.is_some() || !self.verify_peer
    }

    /// Server-usable when it has a cert/key pair.
    pub fn is_server_usable(&self) -> bool {
        self.certificate_chain_pem.is_some() && self.private_key_pem.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_both_fd_and_address() {
        let mut data = StartData::with_address("127.0.0.1", 8080);
        data.socket_descriptor = Some(3);
        assert!(data.validate().is_err());
    }

    #[test]
    fn rejects_missing_port() {
        let data = StartData {
            address: Some("127.0.0.1".into()),
            port: None,
            backlog_size: None,
            socket_descriptor: None,
        };
        assert!(data.validate().is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let data = StartData::with_address("127.0.0.1", 0);
        assert!(data.validate().is_err());
    }

    #[test]
    fn defaults_backlog_to_fifty() {
        let data = StartData::with_address("127.0.0.1", 8080);
        let validated = data.validate().unwrap();
        assert_eq!(validated.backlog_size, 50);
    }

    #[test]
    fn accepts_fd_only() {
        let data = StartData::with_fd(3);
        assert!(data.validate().is_ok());
    }
}
