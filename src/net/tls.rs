//! TLS certificate stores and server configs.
//!
//! # Responsibilities
//! - Abstract certificate lookup behind [`CertificateStore`]
//! - Load PEM certificate, key and client roots from disk
//! - Build rustls server configs per surface (HTTPS, DoT, QUIC)
//!
//! # Design Decisions
//! - Certificates are resolved per handshake, so a store may rotate them
//!   without rebuilding configs
//! - The ring provider is pinned explicitly on every builder

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};

use crate::error::{EdgeError, EdgeResult};

/// ALPN protocols advertised by the HTTPS listener.
pub const ALPN_HTTPS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// ALPN protocols advertised by the QUIC listener.
pub const ALPN_H3: &[&[u8]] = &[b"h3"];

/// Source of server certificates and client trust roots.
pub trait CertificateStore: Send + Sync + std::fmt::Debug {
    /// Certificate for a handshake, `None` aborts it.
    fn get_certificate(&self, hello: &ClientHello<'_>) -> Option<Arc<CertifiedKey>>;

    /// Roots used to verify client certificates.
    fn ca_pool(&self) -> Option<Arc<RootCertStore>>;
}

/// Single certificate loaded from PEM.
#[derive(Debug)]
pub struct FileStore {
    key: Arc<CertifiedKey>,
    roots: Option<Arc<RootCertStore>>,
}

impl FileStore {
    /// Load certificate chain, private key and optional client roots.
    pub fn load(cert_path: &Path, key_path: &Path, roots_path: Option<&Path>) -> EdgeResult<Self> {
        let cert = read_file(cert_path)?;
        let key = read_file(key_path)?;
        let roots = roots_path.map(read_file).transpose()?;
        Self::from_pem(&cert, &key, roots.as_deref())
    }

    /// Build from in-memory PEM.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], roots_pem: Option<&[u8]>) -> EdgeResult<Self> {
        let chain = parse_certs(cert_pem)?;
        if chain.is_empty() {
            return Err(EdgeError::Tls("no certificate found".into()));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|e| EdgeError::Tls(format!("private key: {e}")))?
            .ok_or_else(|| EdgeError::Tls("no private key found".into()))?;
        let signer = rustls::crypto::ring::sign::any_supported_type(&key)?;

        let roots = match roots_pem {
            Some(pem) => {
                let mut store = RootCertStore::empty();
                for cert in parse_certs(pem)? {
                    store.add(cert)?;
                }
                Some(Arc::new(store))
            }
            None => None,
        };

        Ok(Self {
            key: Arc::new(CertifiedKey::new(chain, signer)),
            roots,
        })
    }
}

impl CertificateStore for FileStore {
    fn get_certificate(&self, _hello: &ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }

    fn ca_pool(&self) -> Option<Arc<RootCertStore>> {
        self.roots.clone()
    }
}

fn read_file(path: &Path) -> EdgeResult<Vec<u8>> {
    if !path.exists() {
        return Err(EdgeError::Tls(format!("file not found: {}", path.display())));
    }
    let mut buf = Vec::new();
    io::Read::read_to_end(&mut File::open(path)?, &mut buf)?;
    Ok(buf)
}

fn parse_certs(pem: &[u8]) -> EdgeResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EdgeError::Tls(format!("certificate: {e}")))
}

/// Adapts a [`CertificateStore`] to rustls.
#[derive(Debug)]
struct StoreResolver(Arc<dyn CertificateStore>);

impl ResolvesServerCert for StoreResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = self.0.get_certificate(&hello);
        if key.is_none() {
            tracing::debug!(sni = ?hello.server_name(), "No certificate for handshake");
        }
        key
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server config for a TLS surface.
///
/// `tls13_only` is required by QUIC. With `mtls`, clients must present a
/// certificate chaining to the store's CA pool.
pub fn server_config(
    store: &Arc<dyn CertificateStore>,
    alpn: &[&[u8]],
    mtls: bool,
    tls13_only: bool,
) -> EdgeResult<ServerConfig> {
    let builder = ServerConfig::builder_with_provider(provider());
    let builder = if tls13_only {
        builder.with_protocol_versions(&[&rustls::version::TLS13])?
    } else {
        builder.with_safe_default_protocol_versions()?
    };

    let builder = if mtls {
        let roots = store
            .ca_pool()
            .ok_or_else(|| EdgeError::Tls("client authentication requires a CA pool".into()))?;
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
            .build()
            .map_err(|e| EdgeError::Tls(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder.with_cert_resolver(Arc::new(StoreResolver(store.clone())));
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Config for the HTTPS (h2 + http/1.1) listener.
pub fn https_config(store: &Arc<dyn CertificateStore>, mtls: bool) -> EdgeResult<Arc<ServerConfig>> {
    server_config(store, ALPN_HTTPS, mtls, false).map(Arc::new)
}

/// Config for DNS-over-TLS, which negotiates no ALPN.
pub fn dot_config(store: &Arc<dyn CertificateStore>, mtls: bool) -> EdgeResult<Arc<ServerConfig>> {
    server_config(store, &[], mtls, false).map(Arc::new)
}

/// QUIC server config for HTTP/3.
pub fn quic_config(store: &Arc<dyn CertificateStore>, mtls: bool) -> EdgeResult<quinn::ServerConfig> {
    let mut tls = server_config(store, ALPN_H3, mtls, true)?;
    tls.max_early_data_size = u32::MAX;
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| EdgeError::Tls(e.to_string()))?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}
