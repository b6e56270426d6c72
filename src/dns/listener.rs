//! Serve loops for one DNS socket.
//!
//! # Responsibilities
//! - Receive datagrams (UDP) or length-prefixed messages (TCP, DoT)
//! - Decode, dispatch to the handler, write back the reply
//! - Bound per-connection work with read/idle timeouts and a query limit
//! - Stop on request, draining stream connections
//!
//! # Data Flow
//! ```text
//! UDP socket ── recv_from ──┐
//!                           ├─→ Message::from_vec → DnsHandler → DnsResponseWriter → send
//! TCP/TLS ── accept ── conn ┘      (per datagram / per query)
//! ```
//!
//! # Design Decisions
//! - UDP has no connection to drain; stopping is immediate
//! - Stream connections finish their in-flight query, then close at the
//!   next idle wait

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::dns::handler::DnsHandler;
use crate::dns::writer::{max_payload, DnsProto, DnsResponseWriter, MAX_STREAM_MESSAGE};
use crate::error::{EdgeError, EdgeResult};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{configure_stream, is_transient, tls_handshake, ACCEPT_BACKOFF};
use crate::observability::metrics::{record_dns_query, ActiveListener};

/// Default queries per stream connection.
pub const DEFAULT_MAX_TCP_QUERIES: usize = 128;

/// Default wait for the first query of a stream connection.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Default wait for later queries of a stream connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// Largest DNS message.
const MAX_MESSAGE: usize = MAX_STREAM_MESSAGE;

/// Per-connection limits for stream listeners.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    /// Wait for the first query of a connection; zero is the default.
    pub read_timeout: Duration,
    /// Wait for each later query; zero is the default.
    pub idle_timeout: Duration,
    /// Queries per connection; negative is unlimited, 0 is the default.
    pub max_tcp_queries: i32,
    /// TCP keep-alive for accepted connections.
    pub keep_alive: Option<Duration>,
}

impl QueryLimits {
    /// Effective query limit, `None` when unlimited.
    pub fn max_queries(&self) -> Option<usize> {
        match self.max_tcp_queries {
            n if n < 0 => None,
            0 => Some(DEFAULT_MAX_TCP_QUERIES),
            n => Some(n as usize),
        }
    }

    /// Effective first-query and read wait.
    pub fn read_timeout(&self) -> Duration {
        non_zero_or(self.read_timeout, DEFAULT_READ_TIMEOUT)
    }

    /// Effective wait between queries.
    pub fn idle_timeout(&self) -> Duration {
        non_zero_or(self.idle_timeout, DEFAULT_IDLE_TIMEOUT)
    }
}

fn non_zero_or(d: Duration, default: Duration) -> Duration {
    if d.is_zero() {
        default
    } else {
        d
    }
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_tcp_queries: 0,
            keep_alive: None,
        }
    }
}

/// Socket served by a [`DnsListener`].
pub enum DnsSocket {
    Udp(UdpSocket),
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
}

impl DnsSocket {
    pub fn proto(&self) -> DnsProto {
        match self {
            DnsSocket::Udp(_) => DnsProto::Udp,
            DnsSocket::Tcp(_) => DnsProto::Tcp,
            DnsSocket::Tls(..) => DnsProto::Tls,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            DnsSocket::Udp(s) => s.local_addr(),
            DnsSocket::Tcp(l) | DnsSocket::Tls(l, _) => l.local_addr(),
        }
    }
}

/// One DNS socket with its handler.
pub struct DnsListener {
    socket: DnsSocket,
    local: SocketAddr,
    handler: Arc<dyn DnsHandler>,
    limits: QueryLimits,
    stop: watch::Receiver<bool>,
    tracker: ConnectionTracker,
}

/// Stops a running [`DnsListener`].
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    proto: DnsProto,
    local: SocketAddr,
    stop: Arc<watch::Sender<bool>>,
    tracker: ConnectionTracker,
}

impl DnsListener {
    pub fn new(
        socket: DnsSocket,
        handler: Arc<dyn DnsHandler>,
        limits: QueryLimits,
    ) -> io::Result<(Self, ListenerHandle)> {
        let local = socket.local_addr()?;
        let (stop_tx, stop) = watch::channel(false);
        let tracker = ConnectionTracker::new();

        let handle = ListenerHandle {
            proto: socket.proto(),
            local,
            stop: Arc::new(stop_tx),
            tracker: tracker.clone(),
        };
        let listener = Self {
            socket,
            local,
            handler,
            limits,
            stop,
            tracker,
        };
        Ok((listener, handle))
    }

    pub fn proto(&self) -> DnsProto {
        self.socket.proto()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Serve until stopped. Returns `Ok(())` on a requested stop.
    pub async fn serve(self) -> EdgeResult<()> {
        let proto = self.proto();
        let _active = ActiveListener::new(proto.as_str());
        tracing::info!(proto = %proto, address = %self.local, "Listening");

        let Self {
            socket,
            local,
            handler,
            limits,
            stop,
            tracker,
        } = self;

        let shared = Shared {
            local,
            handler,
            limits,
            stop: stop.clone(),
        };

        match socket {
            DnsSocket::Udp(socket) => serve_udp(Arc::new(socket), shared, stop).await,
            DnsSocket::Tcp(listener) => serve_stream(listener, None, shared, stop, tracker).await,
            DnsSocket::Tls(listener, acceptor) => {
                serve_stream(listener, Some(acceptor), shared, stop, tracker).await
            }
        }
    }
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop accepting, then wait up to `grace` for stream connections to
    /// drain. A zero `grace` waits without bound.
    pub async fn shutdown(&self, grace: Duration) -> EdgeResult<()> {
        tracing::debug!(proto = %self.proto, address = %self.local, "Shutting down");
        self.stop.send_replace(true);

        if self.proto == DnsProto::Udp {
            return Ok(());
        }
        if grace.is_zero() {
            self.tracker.idle().await;
            return Ok(());
        }
        if self.tracker.drain(grace).await {
            Ok(())
        } else {
            Err(EdgeError::ShutdownTimedOut(grace))
        }
    }
}

#[derive(Clone)]
struct Shared {
    local: SocketAddr,
    handler: Arc<dyn DnsHandler>,
    limits: QueryLimits,
    stop: watch::Receiver<bool>,
}

impl Shared {
    /// Decode, dispatch and encode one query.
    async fn handle(&self, remote: SocketAddr, proto: DnsProto, wire: &[u8]) -> Option<Vec<u8>> {
        record_dns_query(proto.as_str());

        let req = match Message::from_vec(wire) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(%remote, proto = %proto, error = %e, "Dropping malformed query");
                return None;
            }
        };

        let max = if proto == DnsProto::Udp { max_payload(&req) } else { MAX_MESSAGE };
        let mut w = DnsResponseWriter::new(self.local, remote, proto, max);
        self.handler.serve_dns(&mut w, req).await;
        w.take()
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn serve_udp(socket: Arc<UdpSocket>, shared: Shared, stop: watch::Receiver<bool>) -> EdgeResult<()> {
    let mut buf = vec![0u8; MAX_MESSAGE];

    loop {
        let (len, remote) = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(e) if is_transient(&e) || e.kind() == io::ErrorKind::ConnectionRefused => {
                    tracing::debug!(error = %e, "Transient UDP receive error");
                    continue;
                }
                Err(e) => return Err(EdgeError::listener("dns:udp", shared.local, e)),
            },
            _ = stopped(stop.clone()) => return Ok(()),
        };

        let wire = buf[..len].to_vec();
        let socket = socket.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Some(reply) = shared.handle(remote, DnsProto::Udp, &wire).await {
                if let Err(e) = socket.send_to(&reply, remote).await {
                    tracing::debug!(%remote, error = %e, "Failed to send UDP reply");
                }
            }
        });
    }
}

async fn serve_stream(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shared: Shared,
    stop: watch::Receiver<bool>,
    tracker: ConnectionTracker,
) -> EdgeResult<()> {
    let proto = if tls.is_some() { DnsProto::Tls } else { DnsProto::Tcp };

    loop {
        let (stream, remote) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    tracing::debug!(error = %e, "Transient accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    let tag = if tls.is_some() { "dns:tcp+tls" } else { "dns:tcp" };
                    return Err(EdgeError::listener(tag, shared.local, e));
                }
            },
            _ = stopped(stop.clone()) => return Ok(()),
        };

        configure_stream(&stream, shared.limits.keep_alive);
        let guard = tracker.track();
        let shared = shared.clone();
        let tls = tls.clone();

        tokio::spawn(async move {
            let conn_id = guard.id();
            let res = match tls {
                Some(acceptor) => match tls_handshake(acceptor, stream, shared.limits.read_timeout()).await {
                    Ok(stream) => serve_conn(stream, remote, proto, &shared).await,
                    Err(e) => Err(e),
                },
                None => serve_conn(stream, remote, proto, &shared).await,
            };
            if let Err(e) = res {
                tracing::debug!(connection_id = %conn_id, %remote, error = %e, "DNS connection ended");
            }
            drop(guard);
        });
    }
}

/// Serve length-prefixed queries on one connection.
async fn serve_conn<S>(mut stream: S, remote: SocketAddr, proto: DnsProto, shared: &Shared) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let max = shared.limits.max_queries();
    let mut served = 0usize;

    loop {
        if max.is_some_and(|m| served >= m) {
            break;
        }
        let wait = if served == 0 {
            shared.limits.read_timeout()
        } else {
            shared.limits.idle_timeout()
        };

        let len = tokio::select! {
            res = tokio::time::timeout(wait, stream.read_u16()) => match res {
                Ok(Ok(len)) => len as usize,
                // EOF between queries
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            },
            _ = stopped(shared.stop.clone()) => break,
        };

        let mut wire = vec![0u8; len];
        tokio::time::timeout(shared.limits.read_timeout(), stream.read_exact(&mut wire))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
        served += 1;

        if let Some(reply) = shared.handle(remote, proto, &wire).await {
            let len = u16::try_from(reply.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "dns reply exceeds 65535 bytes"))?;
            let mut framed = Vec::with_capacity(reply.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(&reply);
            stream.write_all(&framed).await?;
            stream.flush().await?;
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::writer::refused;
    use async_trait::async_trait;
    use crate::dns::writer::reply_with_rcode;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;
    use tokio::net::TcpStream;

    struct Refuser;

    #[async_trait]
    impl DnsHandler for Refuser {
        async fn serve_dns(&self, w: &mut DnsResponseWriter, req: Message) {
            let _ = w.write_msg(&refused(&req), false);
        }
    }

    /// Answers with more TXT data than one TCP message holds.
    struct Flood;

    #[async_trait]
    impl DnsHandler for Flood {
        async fn serve_dns(&self, w: &mut DnsResponseWriter, req: Message) {
            let mut reply = reply_with_rcode(&req, ResponseCode::NoError);
            let name = Name::from_ascii("example.org.").unwrap();
            for _ in 0..300 {
                reply.add_answer(Record::from_rdata(name.clone(), 60, RData::TXT(TXT::new(vec!["x".repeat(250)]))));
            }
            let _ = w.write_msg(&reply, true);
        }
    }

    async fn exchange(stream: &mut TcpStream, wire: &[u8]) -> Message {
        stream.write_u16(wire.len() as u16).await.unwrap();
        stream.write_all(wire).await.unwrap();
        let len = tokio::time::timeout(Duration::from_secs(2), stream.read_u16())
            .await
            .unwrap()
            .unwrap() as usize;
        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply).await.unwrap();
        Message::from_vec(&reply).unwrap()
    }

    fn query(id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str("example.org.").unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    }

    fn limits() -> QueryLimits {
        QueryLimits {
            read_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            max_tcp_queries: 2,
            keep_alive: None,
        }
    }

    #[test]
    fn query_limit_defaults() {
        let mut l = limits();
        l.max_tcp_queries = 0;
        assert_eq!(l.max_queries(), Some(DEFAULT_MAX_TCP_QUERIES));
        l.max_tcp_queries = -1;
        assert_eq!(l.max_queries(), None);
    }

    #[test]
    fn zero_timeouts_use_defaults() {
        let l = QueryLimits {
            read_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            ..limits()
        };
        assert_eq!(l.read_timeout(), DEFAULT_READ_TIMEOUT);
        assert_eq!(l.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
        assert_eq!(limits().read_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn tcp_serves_with_zero_timeouts() {
        let limits = QueryLimits {
            read_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            ..limits()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (listener, handle) =
            DnsListener::new(DnsSocket::Tcp(listener), Arc::new(Refuser), limits).unwrap();
        let addr = listener.local_addr();
        let task = tokio::spawn(listener.serve());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for id in [11u16, 12] {
            let reply = exchange(&mut stream, &query(id)).await;
            assert_eq!(reply.id(), id);
            assert_eq!(reply.response_code(), ResponseCode::Refused);
        }

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tcp_reply_too_large_to_frame_is_servfail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (listener, handle) =
            DnsListener::new(DnsSocket::Tcp(listener), Arc::new(Flood), limits()).unwrap();
        let addr = listener.local_addr();
        let task = tokio::spawn(listener.serve());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = exchange(&mut stream, &query(21)).await;
        assert_eq!(reply.id(), 21);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert!(reply.answers().is_empty());

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn udp_round_trip_and_stop() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (listener, handle) =
            DnsListener::new(DnsSocket::Udp(socket), Arc::new(Refuser), limits()).unwrap();
        let addr = listener.local_addr();
        let task = tokio::spawn(listener.serve());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(7), addr).await.unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(reply.id(), 7);
        assert_eq!(reply.response_code(), ResponseCode::Refused);

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tcp_connection_closes_after_query_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (listener, handle) =
            DnsListener::new(DnsSocket::Tcp(listener), Arc::new(Refuser), limits()).unwrap();
        let addr = listener.local_addr();
        let task = tokio::spawn(listener.serve());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for id in [1u16, 2] {
            let wire = query(id);
            stream.write_u16(wire.len() as u16).await.unwrap();
            stream.write_all(&wire).await.unwrap();

            let len = stream.read_u16().await.unwrap() as usize;
            let mut reply = vec![0u8; len];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(Message::from_vec(&reply).unwrap().id(), id);
        }

        // third query is past the limit: the server hangs up
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        task.await.unwrap().unwrap();
    }
}
