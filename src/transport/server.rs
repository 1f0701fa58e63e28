//! The host side of the transport layer.

use rustls::{
    client::danger::HandshakeSignatureValid,
    crypto::WebPkiSupportedAlgorithms,
    server::danger::{ClientCertVerified, ClientCertVerifier},
    DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, UnixTime};
use std::{io, path::Path, sync::Arc};
use tokio_rustls::TlsAcceptor;

use super::pem;

/// Build a [`TlsAcceptor`] from the keypair at the given paths.
///
/// Clients must present a certificate, but no chain verification happens
/// here: a certificate is an identity claim, and whether it is *trusted* is
/// decided per-connection by fingerprint lookup against registered
/// services.
pub fn acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, io::Error> {
    let certificate_chain = pem::read_certificates(cert_path)?;
    let private_key = pem::read_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(RequireClientCertificate::new()))
        .with_single_cert(certificate_chain, private_key)
        .map_err(|_error| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid server certificate chain or private key",
            )
        })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Demands a client certificate and accepts whichever one is offered.
/// Handshake signatures are still checked, so the client must hold the key
/// for the certificate it presents.
#[derive(Debug)]
struct RequireClientCertificate(WebPkiSupportedAlgorithms);

impl RequireClientCertificate {
    fn new() -> Self {
        RequireClientCertificate(
            rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }
}

impl ClientCertVerifier for RequireClientCertificate {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}
