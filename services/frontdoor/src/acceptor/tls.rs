//! TLS server material for the TLS and secure WebSocket transports.

use std::fmt;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use super::error::TlsError;

/// ALPN identifiers offered by secure WebSocket listeners.
const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Certificate chain, private key and optional client CA for a listener.
#[derive(Clone)]
pub struct TlsOptions {
    certs: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
    client_ca: Option<Vec<CertificateDer<'static>>>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("certs", &self.certs.len())
            .field("client_auth", &self.client_ca.is_some())
            .finish_non_exhaustive()
    }
}

impl TlsOptions {
    /// Build from DER certificate chain and key.
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        if certs.is_empty() {
            return Err(TlsError::NoCertificates);
        }
        Ok(Self {
            certs,
            key: Arc::new(key),
            client_ca: None,
        })
    }

    /// Build from PEM-encoded certificate chain and private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certs = read_certs(cert_pem)?;
        let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem))
            .map_err(TlsError::Pem)?
            .ok_or(TlsError::NoPrivateKey)?;
        Self::new(certs, key)
    }

    /// Build from PEM files on disk.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        let cert_pem = read_file(cert_path.as_ref())?;
        let key_pem = read_file(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Require client certificates signed by one of the PEM-encoded CAs.
    pub fn with_client_ca_pem(mut self, ca_pem: &[u8]) -> Result<Self, TlsError> {
        self.client_ca = Some(read_certs(ca_pem)?);
        Ok(self)
    }

    /// Produce a rustls server configuration advertising `alpn`.
    pub(crate) fn server_config(&self, alpn: &[&[u8]]) -> Result<ServerConfig, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let builder = match &self.client_ca {
            Some(cas) => {
                let mut roots = RootCertStore::empty();
                for ca in cas {
                    roots.add(ca.clone())?;
                }
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                        .build()
                        .map_err(|e| TlsError::Rustls(rustls::Error::General(e.to_string())))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_single_cert(self.certs.clone(), self.key.clone_key())?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }

    /// Acceptor for raw TLS streams (no ALPN).
    pub(crate) fn stream_acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config(&[])?)))
    }

    /// Acceptor for HTTPS, offering `h2` only when HTTP/2 is served.
    pub(crate) fn http_acceptor(&self, http2: bool) -> Result<TlsAcceptor, TlsError> {
        let alpn: &[&[u8]] = if http2 {
            &[ALPN_H2, ALPN_HTTP11]
        } else {
            &[ALPN_HTTP11]
        };
        Ok(TlsAcceptor::from(Arc::new(self.server_config(alpn)?)))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn read_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(pem)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}
