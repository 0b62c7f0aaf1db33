//! TLS client setup on top of rustls.

use std::net::TcpStream;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::config::ConnectDescriptor;
use crate::error::{Error, Result};

pub(super) type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Build the client configuration for a descriptor.
pub(crate) fn client_config(descriptor: &ConnectDescriptor) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if descriptor.security().verify_certificate {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        tracing::warn!(
            server = %descriptor.address(),
            "TLS certificate verification disabled"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Wrap a connected socket and complete the handshake.
///
/// Socket timeouts must already be set: the handshake runs on the caller's
/// thread and blocks like any other read.
pub(super) fn connect(descriptor: &ConnectDescriptor, mut socket: TcpStream) -> Result<TlsStream> {
    let config = client_config(descriptor)?;
    let name = descriptor.tls_server_name();
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| Error::tls(format!("invalid server name '{name}': {e}")))?;
    let mut conn = ClientConnection::new(config, server_name)?;

    while conn.is_handshaking() {
        conn.complete_io(&mut socket).map_err(|e| {
            Error::tls(format!("handshake with {} failed: {e}", descriptor.address()))
        })?;
    }
    Ok(StreamOwned::new(conn, socket))
}

/// Verifier used when certificate validation is switched off. Signatures are
/// still checked so the handshake itself stays well-formed.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityOptions;

    #[test]
    fn test_client_config_with_verification() {
        let descriptor = ConnectDescriptor::new("db.example.com", 2484, "svc").with_security(
            SecurityOptions {
                encryption: true,
                ..SecurityOptions::default()
            },
        );
        assert!(client_config(&descriptor).is_ok());
    }

    #[test]
    fn test_client_config_without_verification() {
        let descriptor = ConnectDescriptor::new("10.1.2.3", 2484, "svc").with_security(
            SecurityOptions {
                encryption: true,
                verify_certificate: false,
                server_name: None,
            },
        );
        assert!(client_config(&descriptor).is_ok());
    }
}
