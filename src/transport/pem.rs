//! Utilities for reading PEM files as [`CertificateDer`]s and
//! [`PrivateKeyDer`]s, as necessary to initialize TLS.

use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::{fs::File, io, io::Read, path::Path};

/// Read the file at `path` into memory as a vector of PEM-encoded
/// `CERTIFICATE`s, silently skipping any entries in the file which are not
/// labeled `CERTIFICATE`.
pub fn read_certificates(
    path: impl AsRef<Path>,
) -> Result<Vec<CertificateDer<'static>>, io::Error> {
    let mut file = File::open(&path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let mut certificates = Vec::new();
    for entry in pem::parse_many(contents)
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid PEM encoding in certificate: {}", e),
            )
        })?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
    {
        certificates.push(CertificateDer::from(entry.into_contents()));
    }
    Ok(certificates)
}

/// Read the file at `path` as a single PEM-encoded `PRIVATE KEY`.
pub fn read_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, io::Error> {
    let mut file = File::open(&path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let pem = pem::parse(contents).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid PEM encoding in private key: {}", e),
        )
    })?;
    if pem.tag() == "PRIVATE KEY" {
        Ok(PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
            pem.into_contents(),
        )))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("not labeled as a private key: '{}'", pem.tag()),
        ))
    }
}
