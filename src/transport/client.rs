//! The agent side of the transport layer.

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::WebPkiSupportedAlgorithms,
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::{io, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::certificate::Identity;

/// A TLS dialer carrying the agent's certificate.
///
/// The server's certificate chain and name are not verified; the host is
/// whatever the agent was pointed at, and it is the *host* that decides
/// whether to trust *us*, by the fingerprint bound at registration.
#[derive(Clone)]
pub struct Connector {
    tls_config: Arc<ClientConfig>,
}

impl Connector {
    pub fn new(identity: &Identity) -> Result<Self, rustls::Error> {
        let tls_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification::new()))
            .with_client_auth_cert(identity.certificate_chain(), identity.private_key())?;
        Ok(Connector {
            tls_config: Arc::new(tls_config),
        })
    }

    /// Connect to `endpoint` (a `host:port` pair; the host defaults to
    /// `localhost` when omitted), attempting every resolved address and
    /// succeeding on the first that accepts.
    pub async fn connect(&self, endpoint: &str) -> Result<TlsStream<TcpStream>, io::Error> {
        let endpoint = if endpoint.starts_with(':') {
            format!("localhost{}", endpoint)
        } else {
            endpoint.to_string()
        };
        let host = endpoint
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&endpoint)
            .trim_start_matches('[')
            .trim_end_matches(']');

        let mut addresses = tokio::net::lookup_host(&endpoint).await?;
        let mut connection_error = None;
        let tcp_stream = loop {
            if let Some(address) = addresses.next() {
                match TcpStream::connect(address).await {
                    Ok(tcp_stream) => {
                        // Messages are small; send them immediately
                        tcp_stream.set_nodelay(true)?;
                        break tcp_stream;
                    }
                    Err(e) => connection_error = Some(e),
                }
            } else {
                return Err(connection_error.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("unknown endpoint: {}", endpoint),
                    )
                }));
            }
        };

        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid host name: {}", host),
            )
        })?;
        let connector = TlsConnector::from(self.tls_config.clone());
        connector.connect(server_name, tcp_stream).await
    }
}

/// Accepts any server certificate. Handshake signatures are still checked,
/// so the peer must actually hold the key it presents.
#[derive(Debug)]
struct NoServerVerification(WebPkiSupportedAlgorithms);

impl NoServerVerification {
    fn new() -> Self {
        NoServerVerification(
            rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }
}

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
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
