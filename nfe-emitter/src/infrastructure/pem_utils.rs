//! Convenience functions for loading the authority's CA chain.

use std::{io::BufRead, path::Path};

use rustls::{Certificate, RootCertStore};

use crate::NfeEmitterError;

/// Returns all certificates in the pemfile at the given path
pub fn read_certificates(path: impl AsRef<Path>) -> Result<Vec<Certificate>, NfeEmitterError> {
    let fd = std::fs::File::open(path.as_ref())?;
    let mut buf = std::io::BufReader::new(&fd);
    read_certificates_from_reader(&mut buf)
}

/// Returns all certificates in the given PEM bytes
pub fn read_certificates_from_bytes(bytes: &[u8]) -> Result<Vec<Certificate>, NfeEmitterError> {
    let mut reader = bytes;
    read_certificates_from_reader(&mut reader)
}

fn read_certificates_from_reader(
    reader: &mut dyn BufRead,
) -> Result<Vec<Certificate>, NfeEmitterError> {
    let certs = rustls_pemfile::certs(reader)?
        .into_iter()
        .map(Certificate)
        .collect();

    Ok(certs)
}

/// Builds a root store out of every certificate found in `certificates`.
/// Fails if the list is empty, since an empty store would reject every
/// authority endpoint at handshake time.
pub fn root_store(certificates: &[Certificate]) -> Result<RootCertStore, NfeEmitterError> {
    if certificates.is_empty() {
        return Err(NfeEmitterError::InvalidCaChain(
            "no certificates found".to_string(),
        ));
    }

    let mut store = RootCertStore::empty();
    let (_added, ignored) = store.add_parsable_certificates(
        &certificates
            .iter()
            .map(|cert| cert.0.clone())
            .collect::<Vec<_>>(),
    );
    if store.is_empty() {
        return Err(NfeEmitterError::InvalidCaChain(format!(
            "none of the {ignored} certificates could be parsed"
        )));
    }

    Ok(store)
}
