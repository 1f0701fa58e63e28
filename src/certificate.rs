//! Self-signed certificate material for both sides of the pipeline.
//!
//! Neither end of the transport trusts a certificate authority: the server
//! demands a client certificate but binds trust to its signature
//! fingerprint at registration time, and the client skips server-name
//! verification entirely. All either side needs is a stable, parseable
//! keypair, so [`ensure`] mints one on first start and reuses it until it
//! expires.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use time::OffsetDateTime;

/// Subject organization stamped into every generated certificate.
pub const ORGANIZATION: &str = "Monstercat Inc.";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid PEM encoding: {0}")]
    Pem(#[from] pem::PemError),
    #[error("could not parse certificate: {0}")]
    Parse(String),
    #[error("could not generate RSA key: {0}")]
    KeyGeneration(#[from] rsa::Error),
    #[error("could not encode private key: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),
    #[error("could not build certificate: {0}")]
    Build(#[from] rcgen::Error),
    #[error("no CERTIFICATE block found in {0}")]
    MissingCertificate(PathBuf),
    #[error("no PRIVATE KEY block found in {0}")]
    MissingKey(PathBuf),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// A loaded keypair, ready to hand to rustls on either side.
pub struct Identity {
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    fingerprint: String,
    not_after: DateTime<Utc>,
}

impl Identity {
    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        self.certificate_chain.clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }

    /// Fingerprint of the leaf certificate; the identity key the host will
    /// bind this keypair to.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.not_after
    }

    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after > now
    }
}

/// Load the keypair at the given paths, generating a fresh one if the files
/// are missing, unparseable, or expired.
///
/// Generated material is persisted before returning (certificate as a PEM
/// `CERTIFICATE`, key as a PKCS#8 PEM `PRIVATE KEY`) and then re-parsed, so
/// the returned [`Identity`] always reflects what is on disk.
pub async fn ensure(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    valid_for: Duration,
) -> Result<Identity, Error> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    if cert_path.exists() && key_path.exists() {
        match load(cert_path, key_path).await {
            Ok(identity) if identity.is_valid_at(Utc::now()) => return Ok(identity),
            Ok(identity) => tracing::info!(
                expired = %identity.expires_at(),
                "certificate expired, generating a fresh one"
            ),
            Err(error) => tracing::warn!(
                %error,
                "could not load existing certificate material, generating a fresh one"
            ),
        }
    }

    // RSA-4096 generation takes long enough to deserve a blocking thread.
    let (certificate_pem, key_pem) = tokio::task::spawn_blocking(move || generate(valid_for)).await??;

    tokio::fs::write(cert_path, &certificate_pem).await?;
    tokio::fs::write(key_path, &key_pem).await?;

    load(cert_path, key_path).await
}

/// Parse the PEM files at the given paths into an [`Identity`].
pub async fn load(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Identity, Error> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let certificate_chain: Vec<CertificateDer<'static>> =
        pem::parse_many(tokio::fs::read(cert_path).await?)?
            .into_iter()
            .filter(|p| p.tag() == "CERTIFICATE")
            .map(|p| CertificateDer::from(p.into_contents()))
            .collect();
    let leaf = certificate_chain
        .first()
        .ok_or_else(|| Error::MissingCertificate(cert_path.to_path_buf()))?;

    let key = pem::parse(tokio::fs::read(key_path).await?)?;
    if key.tag() != "PRIVATE KEY" {
        return Err(Error::MissingKey(key_path.to_path_buf()));
    }
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.into_contents()));

    let (fingerprint, not_after) = inspect(leaf.as_ref())?;

    Ok(Identity {
        certificate_chain,
        private_key,
        fingerprint,
        not_after,
    })
}

/// The identity key of a certificate: its DER signature bytes, base64
/// encoded. Existing server state is keyed by exactly this byte sequence,
/// so it is deliberately not a digest.
pub fn signature_fingerprint(cert_der: &[u8]) -> Result<String, Error> {
    let (_, certificate) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| Error::Parse(e.to_string()))?;
    Ok(STANDARD.encode(certificate.signature_value.data.as_ref()))
}

fn inspect(cert_der: &[u8]) -> Result<(String, DateTime<Utc>), Error> {
    let (_, certificate) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| Error::Parse(e.to_string()))?;
    let fingerprint = STANDARD.encode(certificate.signature_value.data.as_ref());
    let not_after = Utc
        .timestamp_opt(certificate.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::Parse("certificate expiry out of range".into()))?;
    Ok((fingerprint, not_after))
}

fn generate(valid_for: Duration) -> Result<(String, String), Error> {
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 4096)?;
    let pkcs8 = key.to_pkcs8_der()?;
    let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_RSA_SHA256)?;

    let mut serial = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut serial);

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::OrganizationName, ORGANIZATION);
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + valid_for;
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.is_ca = IsCa::ExplicitNoCa;

    let certificate = params.self_signed(&key_pair)?;
    let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", pkcs8.as_bytes().to_vec()));

    Ok((certificate.pem(), key_pem))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    #[tokio::test]
    async fn generates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let generated = ensure(&cert_path, &key_path, YEAR).await.unwrap();
        assert!(cert_path.exists() && key_path.exists());

        // A second call must reuse, not regenerate.
        let reloaded = ensure(&cert_path, &key_path, YEAR).await.unwrap();
        assert_eq!(generated.fingerprint(), reloaded.fingerprint());
        assert_eq!(generated.expires_at(), reloaded.expires_at());
    }

    #[tokio::test]
    async fn validity_window_matches_request() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        ensure(&cert_path, &key_path, YEAR).await.unwrap();

        let der = pem::parse(std::fs::read(&cert_path).unwrap()).unwrap();
        let (_, certificate) =
            x509_parser::parse_x509_certificate(der.contents()).unwrap();
        let window = certificate.validity().not_after.timestamp()
            - certificate.validity().not_before.timestamp();
        assert_eq!(window, YEAR.as_secs() as i64);
    }

    #[tokio::test]
    async fn expired_material_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let expired = ensure(&cert_path, &key_path, Duration::ZERO).await.unwrap();
        let fresh = ensure(&cert_path, &key_path, YEAR).await.unwrap();
        assert_ne!(expired.fingerprint(), fresh.fingerprint());
        assert!(fresh.expires_at() > Utc::now());
    }

    #[tokio::test]
    async fn garbage_material_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, "not a certificate").unwrap();
        std::fs::write(&key_path, "not a key").unwrap();

        let identity = ensure(&cert_path, &key_path, YEAR).await.unwrap();
        assert!(identity.expires_at() > Utc::now());
    }

    #[tokio::test]
    async fn fingerprint_matches_signature_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let identity = ensure(&cert_path, &key_path, YEAR).await.unwrap();
        let chain = identity.certificate_chain();
        let recomputed = signature_fingerprint(chain[0].as_ref()).unwrap();
        assert_eq!(identity.fingerprint(), recomputed);
    }
}
