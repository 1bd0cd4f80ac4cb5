use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse private key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

/// TLS for the public listener: server certificate only, clients anonymous.
pub fn server_config(certificate: &Path, private_key: &Path) -> Result<ServerConfig> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(certificate)?, load_key(private_key)?)
        .context("assemble server TLS config")?;
    Ok(config)
}

/// TLS for the private listener: clients must present a certificate signed
/// by the configured CA chain.
pub fn server_config_mtls(
    certificate: &Path,
    private_key: &Path,
    ca_certificate: &Path,
) -> Result<ServerConfig> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_certificate)? {
        roots
            .add(cert)
            .with_context(|| format!("add CA certificate from {}", ca_certificate.display()))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client certificate verifier")?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(certificate)?, load_key(private_key)?)
        .context("assemble mTLS server config")?;
    Ok(config)
}
