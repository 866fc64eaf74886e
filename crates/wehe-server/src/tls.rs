use std::{io::BufReader, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use tokio_rustls::TlsAcceptor;

/// Build the shared TLS acceptor from the PEM files produced by the
/// external certificate issuance tooling.
pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    let certs = {
        let file = std::fs::File::open(cert_file)
            .with_context(|| format!("open cert file {}", cert_file.display()))?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("parse cert file {}", cert_file.display()))?
    };
    if certs.is_empty() {
        bail!("no certificates found in {}", cert_file.display());
    }

    let key = {
        let file = std::fs::File::open(key_file)
            .with_context(|| format!("open key file {}", key_file.display()))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .with_context(|| format!("parse key file {}", key_file.display()))?
            .with_context(|| format!("no private key found in {}", key_file.display()))?
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
