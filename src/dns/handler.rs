//! Query handling seams.

use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::dns::writer::DnsResponseWriter;
use crate::error::EdgeResult;
use crate::routing::Match;

/// Serves one decoded query, writing at most one reply.
#[async_trait]
pub trait DnsHandler: Send + Sync {
    async fn serve_dns(&self, w: &mut DnsResponseWriter, req: Message);
}

/// Resolves a query into a reply.
///
/// An `Err` carrying [`EdgeError::Exchange`](crate::EdgeError::Exchange)
/// is answered with its response code; any other error with SERVFAIL.
#[async_trait]
pub trait Exchanger: Send + Sync {
    async fn exchange(&self, ctx: &ExchangeContext, req: &Message) -> EdgeResult<Message>;
}

/// Per-query facts handed to an [`Exchanger`].
#[derive(Debug, Clone, Default)]
pub struct ExchangeContext {
    /// How the client was admitted, if it went through a horizon.
    pub horizon: Option<Match>,
    /// When the caller stops waiting for this exchange.
    pub deadline: Option<Instant>,
}

impl ExchangeContext {
    pub fn with_match(m: Match) -> Self {
        Self {
            horizon: Some(m),
            deadline: None,
        }
    }

    /// Remote address of the admitted client.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.horizon.as_ref().map(|m| m.remote_addr)
    }
}
