//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use edgy::dns::{DnsConfig, QueryLimits};
use edgy::http::HttpConfig;
use edgy::net::tls::{https_config, dot_config, quic_config, CertificateStore, FileStore};

/// Generous bound on any single network step.
pub const STEP: Duration = Duration::from_secs(5);

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Self-signed certificate for `localhost`.
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: CertificateDer<'static>,
}

impl TestCert {
    pub fn new() -> Self {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            cert_pem: ck.cert.pem(),
            key_pem: ck.key_pair.serialize_pem(),
            der: ck.cert.der().clone(),
        }
    }

    pub fn store(&self) -> Arc<dyn CertificateStore> {
        Arc::new(FileStore::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes(), None).unwrap())
    }

    /// Client trusting only this certificate.
    pub fn connector(&self, alpn: &[&[u8]]) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.der.clone()).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        TlsConnector::from(Arc::new(config))
    }

    pub async fn connect(&self, addr: SocketAddr, alpn: &[&[u8]]) -> TlsStream<TcpStream> {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        tokio::time::timeout(STEP, self.connector(alpn).connect(name, tcp))
            .await
            .unwrap()
            .unwrap()
    }
}

/// Loopback HTTP config serving the app on an ephemeral insecure port.
pub fn plain_http() -> HttpConfig {
    HttpConfig {
        addresses: vec![localhost()],
        port: Some(0),
        insecure_port: Some(0),
        port_attempts: 1,
        allow_insecure: true,
        read_header_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(5),
        graceful_timeout: Duration::from_secs(2),
        ..HttpConfig::default()
    }
}

/// Loopback HTTPS (and HTTP/3) config on ephemeral ports.
pub fn secure_http(cert: &TestCert) -> HttpConfig {
    let store = cert.store();
    HttpConfig {
        allow_insecure: false,
        tls: Some(https_config(&store, false).unwrap()),
        quic: Some(quic_config(&store, false).unwrap()),
        ..plain_http()
    }
}

/// Loopback DNS config on an ephemeral port.
pub fn plain_dns() -> DnsConfig {
    DnsConfig {
        addresses: vec![localhost()],
        port: Some(0),
        tls_port: Some(0),
        port_attempts: 1,
        limits: QueryLimits {
            read_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(2),
            max_tcp_queries: 0,
            keep_alive: None,
        },
        graceful_timeout: Duration::from_secs(2),
        ..DnsConfig::default()
    }
}

pub fn secure_dns(cert: &TestCert) -> DnsConfig {
    DnsConfig {
        tls: Some(dot_config(&cert.store(), false).unwrap()),
        ..plain_dns()
    }
}

/// First bound address for `proto` (`h2c`, `h2`, `h3`, `udp`, `tcp`, `tcp+tls`).
pub fn addr_of(addrs: &[(&'static str, SocketAddr)], proto: &str) -> SocketAddr {
    addrs
        .iter()
        .find(|(p, _)| *p == proto)
        .map(|(_, a)| *a)
        .unwrap_or_else(|| panic!("no {proto} listener in {addrs:?}"))
}

pub fn query(id: u16, name: &str) -> Message {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    msg
}

pub async fn udp_exchange(addr: SocketAddr, req: &Message) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&req.to_vec().unwrap(), addr).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(STEP, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

/// One length-prefixed exchange over an open stream.
pub async fn stream_exchange<S>(stream: &mut S, req: &Message) -> Message
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let wire = req.to_vec().unwrap();
    stream.write_u16(wire.len() as u16).await.unwrap();
    stream.write_all(&wire).await.unwrap();
    stream.flush().await.unwrap();

    let len = tokio::time::timeout(STEP, stream.read_u16()).await.unwrap().unwrap() as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    Message::from_vec(&buf).unwrap()
}

/// Send a bare HTTP/1.1 GET and return the raw response.
pub async fn raw_get<S>(stream: &mut S, path: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(STEP, stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .ok();
    String::from_utf8_lossy(&buf).into_owned()
}
