use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// ALPN id clients send for direct TLS connections.
const ALPN_POSTGRESQL: &[u8] = b"postgresql";

/// Acceptor for `NESTBOOK_TLS_CERT` / `NESTBOOK_TLS_KEY`. Both or neither;
/// neither keeps the listener plaintext.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let Some((cert_path, key_path)) = paired(cert_path, key_path)? else {
        return Ok(None);
    };

    let chain = read_cert_chain(Path::new(cert_path))?;
    let key = read_private_key(Path::new(key_path))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![ALPN_POSTGRESQL.to_vec()];

    tracing::info!("TLS enabled with certificate {cert_path}");
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn paired<'a>(cert: Option<&'a str>, key: Option<&'a str>) -> io::Result<Option<(&'a str, &'a str)>> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(c), Some(k)) => Ok(Some((c, k))),
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "both NESTBOOK_TLS_CERT and NESTBOOK_TLS_KEY must be set, or neither",
        )),
    }
}

fn read_cert_chain(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let chain = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificate found in {}", path.display()),
        ));
    }
    Ok(chain)
}

fn read_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key found in {}", path.display()),
        )
    })
}
