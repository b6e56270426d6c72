//! Reply capture and wire encoding.
//!
//! # Responsibilities
//! - Carry the local/remote addresses and transport of a query to its handler
//! - Encode the handler's reply, compressed or not
//! - Shrink oversized UDP replies to a truncated (TC) copy
//! - Replace stream replies that cannot be framed with SERVFAIL
//! - Synthesize error replies mirroring the query
//!
//! # Design Decisions
//! - Uncompressed encoding writes every name in full; labels keep the case
//!   they were built with
//! - A handler writes at most once; a second write is an invariant error

use std::net::SocketAddr;

use hickory_proto::op::{Header, Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

use crate::error::{EdgeError, EdgeResult};

/// Largest UDP reply without EDNS.
pub const MIN_UDP_PAYLOAD: usize = 512;

/// Largest reply a two-byte length prefix can frame.
pub const MAX_STREAM_MESSAGE: usize = u16::MAX as usize;

/// Transport a query arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsProto {
    Udp,
    Tcp,
    Tls,
}

impl DnsProto {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsProto::Udp => "udp",
            DnsProto::Tcp => "tcp",
            DnsProto::Tls => "tcp+tls",
        }
    }
}

impl std::fmt::Display for DnsProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collects the reply to one query.
#[derive(Debug)]
pub struct DnsResponseWriter {
    local: SocketAddr,
    remote: SocketAddr,
    proto: DnsProto,
    max_size: usize,
    reply: Option<Vec<u8>>,
}

impl DnsResponseWriter {
    /// Writer for a query received over `proto`.
    ///
    /// `max_size` only applies to UDP.
    pub fn new(local: SocketAddr, remote: SocketAddr, proto: DnsProto, max_size: usize) -> Self {
        Self {
            local,
            remote,
            proto,
            max_size: max_size.max(MIN_UDP_PAYLOAD),
            reply: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn proto(&self) -> DnsProto {
        self.proto
    }

    /// Tell if a reply has been written.
    pub fn is_written(&self) -> bool {
        self.reply.is_some()
    }

    /// Encode and store the reply.
    pub fn write_msg(&mut self, msg: &Message, compress: bool) -> EdgeResult<()> {
        if self.reply.is_some() {
            return Err(EdgeError::Invariant("dns reply already written".into()));
        }

        let mut wire = encode(msg, compress)?;
        if self.proto == DnsProto::Udp && wire.len() > self.max_size {
            tracing::debug!(size = wire.len(), max = self.max_size, "Truncating UDP reply");
            wire = encode(&truncated(msg), false)?;
        } else if wire.len() > MAX_STREAM_MESSAGE {
            tracing::warn!(size = wire.len(), proto = %self.proto, "Reply too large to frame, answering SERVFAIL");
            wire = encode(&reply_with_rcode(msg, ResponseCode::ServFail), false)?;
        }

        self.reply = Some(wire);
        Ok(())
    }

    /// Take the encoded reply.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.reply.take()
    }
}

/// Client's advertised UDP payload size.
pub fn max_payload(req: &Message) -> usize {
    req.extensions()
        .as_ref()
        .map(|edns| edns.max_payload() as usize)
        .unwrap_or(MIN_UDP_PAYLOAD)
        .max(MIN_UDP_PAYLOAD)
}

/// Encode a message to wire format.
///
/// Without compression every name is written in full.
pub fn encode(msg: &Message, compress: bool) -> EdgeResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(MIN_UDP_PAYLOAD);
    {
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_canonical_names(!compress);
        msg.emit(&mut encoder)
            .map_err(|e| EdgeError::Invariant(format!("dns encode: {e}")))?;
    }
    Ok(buf)
}

/// Reply to `req` carrying `rcode` and the first question only.
pub fn reply_with_rcode(req: &Message, rcode: ResponseCode) -> Message {
    let mut header = Header::new();
    header
        .set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_checking_disabled(req.checking_disabled())
        .set_recursion_available(true)
        .set_response_code(rcode);

    let mut reply = Message::new();
    reply.set_header(header);
    if let Some(q) = req.queries().first() {
        reply.add_query(q.clone());
    }
    reply
}

/// Refusal of `req`.
pub fn refused(req: &Message) -> Message {
    reply_with_rcode(req, ResponseCode::Refused)
}

/// Header-and-question copy of `msg` with TC set.
fn truncated(msg: &Message) -> Message {
    let mut header = msg.header().clone();
    header.set_truncated(true);

    let mut out = Message::new();
    out.set_header(header);
    for q in msg.queries() {
        out.add_query(q.clone());
    }
    out
}
