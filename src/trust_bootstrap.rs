use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::info;

use crate::config::Config;
use crate::error::{ProvisionError, Result};
use crate::leap_client::{self, LeapRequest};
use crate::storage::{Artifact, CertStore};

/// Result of a successful first contact with the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeInfo {
    pub address: String,
    pub leap_version: String,
    pub ca_subject: String,
    pub ca_path: PathBuf,
}

/// Trust-on-first-use verifier for the initial pairing connection only.
///
/// The bridge's certificate is accepted without chain validation because it
/// is the very certificate this connection exists to capture. Handshake
/// signatures are still checked against it.
#[derive(Debug)]
pub struct FirstContactTrust {
    provider: Arc<CryptoProvider>,
}

impl FirstContactTrust {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for FirstContactTrust {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS 1.2 connector presenting the stored key and certificate chain, trusting
/// the bridge on first contact.
pub fn build_bootstrap_tls_connector(store: &CertStore) -> Result<TlsConnector> {
    let cert_path = store.path(Artifact::Certificate);
    let cert_pem = store
        .read(Artifact::Certificate)?
        .ok_or(ProvisionError::NotReady("the application certificate has not been issued yet"))?;
    let mut cert_reader = BufReader::new(cert_pem.as_slice());
    let client_certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            ProvisionError::Certificate(format!("Failed to read {}: {}", cert_path.display(), e))
        })?;
    if client_certs.is_empty() {
        return Err(ProvisionError::Certificate(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key_path = store.path(Artifact::PrivateKey);
    let key_pem = store
        .read(Artifact::PrivateKey)?
        .ok_or(ProvisionError::NotReady("the private key is missing; reset and log in again"))?;
    let mut key_reader = BufReader::new(key_pem.as_slice());
    let client_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProvisionError::KeyParse(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            ProvisionError::KeyParse(format!("No private key found in {}", key_path.display()))
        })?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = Arc::new(FirstContactTrust::new(provider.clone()));

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| ProvisionError::Certificate(format!("Failed to build TLS config: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| ProvisionError::Certificate(format!("Failed to load client identity: {}", e)))?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Decode the bridge's DER certificate, returning it as PEM with its subject.
fn encode_peer_certificate(der: &[u8]) -> Result<(String, String)> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| {
        ProvisionError::Protocol(format!("Bridge certificate is not valid X.509: {}", e))
    })?;
    let subject = cert.subject().to_string();

    let pem = pem::Pem::new("CERTIFICATE", der.to_vec());
    let encoded = pem::encode_config(
        &pem,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    );
    Ok((encoded, subject))
}

/// Connects to the bridge with the issued certificate and captures its CA.
#[derive(Debug, Clone)]
pub struct TrustBootstrapper {
    config: Arc<Config>,
    store: Arc<CertStore>,
}

impl TrustBootstrapper {
    pub fn new(config: Arc<Config>, store: Arc<CertStore>) -> Self {
        Self { config, store }
    }

    pub async fn bootstrap_trust(&self, bridge_address: &str) -> Result<BridgeInfo> {
        let host = bridge_address.trim();
        if host.is_empty() {
            return Err(ProvisionError::Connection("No bridge address given".to_string()));
        }
        if !self.store.exists(Artifact::Certificate) {
            return Err(ProvisionError::NotReady(
                "the application certificate has not been issued yet",
            ));
        }

        let connector = build_bootstrap_tls_connector(&self.store)?;
        let port = self.config.bridge.leap_port;
        let timeout = Duration::from_secs(self.config.bridge.timeout_secs);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProvisionError::Connection(format!("Invalid bridge address '{}'", host)))?;

        info!("Connecting to bridge at {}:{}...", host, port);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| timed_out(host, port, timeout))?
            .map_err(|e| {
                ProvisionError::Connection(format!(
                    "A connection to {}:{} could not be established: {}",
                    host, port, e
                ))
            })?;

        let tls = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| timed_out(host, port, timeout))?
            .map_err(|e| {
                ProvisionError::Connection(format!("TLS handshake with {} failed: {}", host, e))
            })?;
        info!("TLS session established with {}", host);

        let peer_der = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
            .ok_or_else(|| ProvisionError::Protocol("Bridge presented no certificate".to_string()))?;
        let (ca_pem, ca_subject) = encode_peer_certificate(&peer_der)?;

        self.store.write(Artifact::CaBundle, ca_pem.as_bytes())?;
        let ca_path = self.store.path(Artifact::CaBundle).to_path_buf();
        info!("Bridge CA certificate ({}) saved to {}", ca_subject, ca_path.display());

        let (reader, mut writer) = tokio::io::split(tls);
        leap_client::write_request(&mut writer, &LeapRequest::ping()).await?;

        let mut reader = tokio::io::BufReader::new(reader);
        let response = leap_client::read_response(&mut reader, timeout).await?;
        let leap_version = response.leap_version()?;
        info!("Bridge at {} is running LEAP version {}", host, leap_version);

        Ok(BridgeInfo {
            address: host.to_string(),
            leap_version,
            ca_subject,
            ca_path,
        })
    }
}

fn timed_out(host: &str, port: u16, timeout: Duration) -> ProvisionError {
    ProvisionError::Connection(format!(
        "Timed out after {}s connecting to {}:{}",
        timeout.as_secs(),
        host,
        port
    ))
}
