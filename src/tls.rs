//! Self-signed TLS material for the transport hop. Every transport
//! (QUIC/WSS/H2) terminates TLS to an arbitrary peer; authenticating *who*
//! that peer actually is happens in `peer::handshake` and the per-stream
//! `e2e` handshake, never at the certificate layer. So the cert here only
//! needs to make the TLS handshake itself succeed, and the client side
//! skips chain verification rather than trusting a CA that would mean
//! nothing in an ad hoc mesh.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, ServerConfig, SignatureScheme};

use crate::error::AgentError;

/// A generated cert plus the server/client `rustls` configs built from it.
pub struct TlsMaterial {
    pub server_config: Arc<ServerConfig>,
    pub client_config: Arc<ClientConfig>,
}

/// Generates a fresh self-signed certificate bound to `subject_name` and
/// builds both a server config (for listeners) and a client config (for
/// dialers, with verification disabled) around it.
pub fn generate(subject_name: &str, alpn: &[u8]) -> Result<TlsMaterial, AgentError> {
    let generated = rcgen::generate_simple_self_signed(vec![subject_name.to_string()])
        .map_err(|e| AgentError::Config(format!("failed to generate self-signed cert: {e}")))?;
    let cert_der = CertificateDer::from(generated.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(generated.key_pair.serialize_der().into());

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| AgentError::Config(format!("invalid self-signed cert: {e}")))?;
    server_config.alpn_protocols = vec![alpn.to_vec()];

    let mut client_config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    client_config.alpn_protocols = vec![alpn.to_vec()];

    Ok(TlsMaterial {
        server_config: Arc::new(server_config),
        client_config: Arc::new(client_config),
    })
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_matching_alpn() {
        let material = generate("muti-metroo.mesh", b"muti-metroo/1").unwrap();
        assert_eq!(material.server_config.alpn_protocols, vec![b"muti-metroo/1".to_vec()]);
        assert_eq!(material.client_config.alpn_protocols, vec![b"muti-metroo/1".to_vec()]);
    }
}
