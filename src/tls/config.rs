//! Builds `rustls` client/server configurations from
//! [`crate::config::TlsConfigurationData`] (spec §6, component C4).

use crate::config::{TlsConfigurationData, TlsVersion};
use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::BufReader;
use std::sync::Arc;

/// An immutable, ready-to-use TLS configuration. Built once and shared
/// (via `Arc`) across every [`crate::tls::socket::TlsSocket`] that uses it,
/// the way a `rustls::ClientConfig`/`ServerConfig` is meant to be reused.
#[derive(Clone)]
pub enum TlsContext {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

impl TlsContext {
    /// Builds a client-side context. Without a CA bundle and with
    /// `verify_peer == false`, certificate verification is disabled
    /// entirely (spec §6 "verify mode") — callers that want that behavior
    /// are opting into it explicitly via `TlsConfigurationData`.
    pub fn client(data: &TlsConfigurationData) -> Result<Self> {
        if !data.is_client_usable() {
            return Err(Error::configuration(
                "Failed to build TLS client context. A CA bundle is required when peer verification is enabled.",
            ));
        }
        let versions = protocol_versions(data)?;
        let builder = ClientConfig::builder_with_protocol_versions(versions);
        let own_cert = own_certificate(data)?;

        let mut config = if !data.verify_peer {
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
            match own_cert {
                Some((chain, key)) => builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::configuration(format!("Failed to build TLS client context. Invalid client certificate or key: {e}.")))?,
                None => builder.with_no_client_auth(),
            }
        } else {
            let roots = root_store(data.ca_bundle_pem.as_deref().unwrap_or_default(), "client")?;
            let builder = builder.with_root_certificates(roots);
            match own_cert {
                Some((chain, key)) => builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::configuration(format!("Failed to build TLS client context. Invalid client certificate or key: {e}.")))?,
                None => builder.with_no_client_auth(),
            }
        };
        config.alpn_protocols = data.alpn_protocols.clone();
        Ok(Self::Client(Arc::new(config)))
    }

    /// Builds a server-side context. Requires a certificate chain and
    /// private key (spec §6). When `verify_peer` is set, the server
    /// requires and verifies a client certificate against `ca_bundle_pem`
    /// (spec §8 scenario 4, "TLS client authentication path").
    pub fn server(data: &TlsConfigurationData) -> Result<Self> {
        if !data.is_server_usable() {
            return Err(Error::configuration(
                "Failed to build TLS server context. A certificate chain and private key are required.",
            ));
        }
        let versions = protocol_versions(data)?;
        let chain = parse_certs(data.certificate_chain_pem.as_deref().unwrap_or_default())?;
        let key = parse_key(data.private_key_pem.as_deref().unwrap_or_default())?;

        let client_verifier = if data.verify_peer {
            let bundle = data.ca_bundle_pem.as_deref().ok_or_else(|| {
                Error::configuration("Failed to build TLS server context. A CA bundle is required when peer verification is enabled.")
            })?;
            let roots = root_store(bundle, "server")?;
            WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::configuration(format!("Failed to build TLS server context. Invalid client CA bundle: {e}.")))?
        } else {
            WebPkiClientVerifier::no_client_auth()
        };

        let builder = ServerConfig::builder_with_protocol_versions(versions);
        let mut config = builder
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain, key)
            .map_err(|e| Error::configuration(format!("Failed to build TLS server context. Invalid certificate or key: {e}.")))?;
        config.alpn_protocols = data.alpn_protocols.clone();
        Ok(Self::Server(Arc::new(config)))
    }
}

fn root_store(bundle: &[u8], role: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(bundle)? {
        roots
            .add(cert)
            .map_err(|e| Error::configuration(format!("Failed to build TLS {role} context. Invalid CA certificate: {e}.")))?;
    }
    Ok(roots)
}

/// A client presents its own certificate only when both a chain and a key
/// were supplied; otherwise it authenticates the server only (spec §6:
/// client cert fields are optional, used only for mutual TLS).
fn own_certificate(data: &TlsConfigurationData) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    match (&data.certificate_chain_pem, &data.private_key_pem) {
        (Some(chain_pem), Some(key_pem)) => {
            let chain = parse_certs(chain_pem)?;
            let key = parse_key(key_pem)?;
            Ok(Some((chain, key)))
        }
        _ => Ok(None),
    }
}

fn protocol_versions(data: &TlsConfigurationData) -> Result<&'static [&'static rustls::SupportedProtocolVersion]> {
    match (data.min_protocol_version, data.max_protocol_version) {
        (None, None) => Ok(rustls::ALL_VERSIONS),
        (Some(TlsVersion::Tls12), Some(TlsVersion::Tls12)) | (Some(TlsVersion::Tls12), None) => {
            Ok(&[&rustls::version::TLS12])
        }
        (Some(TlsVersion::Tls13), _) | (None, Some(TlsVersion::Tls13)) => Ok(&[&rustls::version::TLS13]),
        (None, Some(TlsVersion::Tls12)) => Ok(&[&rustls::version::TLS12]),
        (Some(TlsVersion::Tls12), Some(TlsVersion::Tls13)) => Ok(rustls::ALL_VERSIONS),
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::configuration(format!("Failed to parse certificate PEM data: {e}.")))
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::configuration(format!("Failed to parse private key PEM data: {e}.")))?
        .ok_or_else(|| Error::configuration("Failed to build TLS server context. No private key found in PEM data."))
}

/// Accepts every server certificate without verification. Only reachable
/// when a [`TlsConfigurationData`] explicitly asks for `verify_peer = false`.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
