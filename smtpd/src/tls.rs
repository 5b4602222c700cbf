//! STARTTLS server side: certificate loading and the rustls acceptor.

use std::{fs, io::BufReader, path::Path, sync::Arc};

use anyhow::Context;

/// STARTTLS is only advertised when this could be built.
#[derive(Clone)]
pub struct TlsParams {
    pub acceptor: async_tls::TlsAcceptor,
}

fn load_keys(reader: &mut BufReader<fs::File>) -> anyhow::Result<Vec<rustls::PrivateKey>> {
    let pkcs8 = rustls_pemfile::pkcs8_private_keys(reader)
        .map_err(|_| anyhow::anyhow!("unparseable pkcs8 key"))?;
    if !pkcs8.is_empty() {
        return Ok(pkcs8.into_iter().map(rustls::PrivateKey).collect());
    }
    Ok(Vec::new())
}

/// Build the acceptor from `control/servercert.pem` (certificate chain
/// plus key, qmail style; a separate `control/serverkey.pem` is also
/// honoured). `Ok(None)` when no certificate is configured.
pub fn load_server_tls(control: &Path) -> anyhow::Result<Option<TlsParams>> {
    let cert_path = control.join("servercert.pem");
    if !cert_path.exists() {
        return Ok(None);
    }

    let certs = {
        let f = fs::File::open(&cert_path)
            .with_context(|| format!("opening {}", cert_path.display()))?;
        rustls_pemfile::certs(&mut BufReader::new(f))
            .map_err(|_| anyhow::anyhow!("unparseable certificate in {}", cert_path.display()))?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>()
    };
    anyhow::ensure!(!certs.is_empty(), "no certificate in {}", cert_path.display());

    let mut keys = {
        let f = fs::File::open(&cert_path)?;
        let mut keys = load_keys(&mut BufReader::new(f))?;
        if keys.is_empty() {
            let f = fs::File::open(&cert_path)?;
            keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(f))
                .map_err(|_| anyhow::anyhow!("unparseable key"))?
                .into_iter()
                .map(rustls::PrivateKey)
                .collect();
        }
        keys
    };
    if keys.is_empty() {
        let key_path = control.join("serverkey.pem");
        let f = fs::File::open(&key_path)
            .with_context(|| format!("no key in servercert.pem and no {}", key_path.display()))?;
        keys = load_keys(&mut BufReader::new(f))?;
        if keys.is_empty() {
            let f = fs::File::open(&key_path)?;
            keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(f))
                .map_err(|_| anyhow::anyhow!("unparseable key"))?
                .into_iter()
                .map(rustls::PrivateKey)
                .collect();
        }
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no usable private key for STARTTLS"))?;

    let mut config = rustls::ServerConfig::new(rustls::NoClientAuth::new());
    config
        .set_single_cert(certs, key)
        .context("setting the STARTTLS key and certificate")?;
    Ok(Some(TlsParams {
        acceptor: async_tls::TlsAcceptor::from(Arc::new(config)),
    }))
}
