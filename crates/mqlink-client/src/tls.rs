//! TLS client configuration using rustls.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};

use crate::config::ConnectOptions;
use crate::error::{ClientError, Result};

/// Build a rustls ClientConfig from connect options.
pub(crate) fn build_tls_config(options: &ConnectOptions) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Tls(format!("Unsupported protocol versions: {}", e)))?;

    if options.insecure {
        log::warn!(
            "TLS certificate verification disabled for {}",
            options.broker
        );
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
            .with_no_client_auth());
    }

    let mut root_store = RootCertStore::empty();
    match &options.ca_file {
        Some(path) => load_ca_file(path, &mut root_store)?,
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(builder
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

fn load_ca_file(path: &Path, root_store: &mut RootCertStore) -> Result<()> {
    let file = File::open(path).map_err(|e| {
        ClientError::Tls(format!("Failed to open CA file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("Failed to parse CA file: {}", e)))?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("Failed to add CA cert: {}", e)))?;
    }
    Ok(())
}

/// SNI name for the broker host.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ClientError::Tls(format!("Invalid server name: {}", host)))
}

/// Danger: A certificate verifier that accepts any certificate.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
