//! Horizon dispatch for DNS queries.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};

use crate::dns::handler::{DnsHandler, ExchangeContext, Exchanger};
use crate::dns::writer::{refused, reply_with_rcode, DnsResponseWriter};
use crate::error::{EdgeError, EdgeResult};
use crate::observability::metrics::record_dns_refused;
use crate::routing::horizon::HorizonRouter;

/// Computes a per-query exchange bound from the client and the query.
pub type TimeoutFn = dyn Fn(IpAddr, &Message) -> Option<Duration> + Send + Sync;

/// Bound on a horizon's exchange.
#[derive(Clone, Default)]
pub enum ExchangeTimeout {
    #[default]
    None,
    Fixed(Duration),
    PerQuery(Arc<TimeoutFn>),
}

impl ExchangeTimeout {
    /// Bound for one query; zero means none.
    pub fn for_query(&self, remote: IpAddr, req: &Message) -> Option<Duration> {
        let d = match self {
            ExchangeTimeout::None => None,
            ExchangeTimeout::Fixed(d) => Some(*d),
            ExchangeTimeout::PerQuery(f) => f(remote, req),
        };
        d.filter(|d| !d.is_zero())
    }
}

impl std::fmt::Debug for ExchangeTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeTimeout::None => f.write_str("None"),
            ExchangeTimeout::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            ExchangeTimeout::PerQuery(_) => f.write_str("PerQuery(..)"),
        }
    }
}

/// Refuses every query.
#[derive(Debug, Clone, Copy, Default)]
pub struct Refuse;

#[async_trait]
impl Exchanger for Refuse {
    async fn exchange(&self, _ctx: &ExchangeContext, _req: &Message) -> EdgeResult<Message> {
        Err(EdgeError::exchange(ResponseCode::Refused, "refused"))
    }
}

#[async_trait]
impl DnsHandler for HorizonRouter {
    async fn serve_dns(&self, w: &mut DnsResponseWriter, req: Message) {
        let Some((horizon, m)) = self.match_addr(w.remote_addr().ip()) else {
            record_dns_refused();
            tracing::debug!(remote = %w.remote_addr(), "No horizon for query");
            if let Err(err) = w.write_msg(&refused(&req), false) {
                tracing::debug!(error = %err, "Failed to write refusal");
            }
            return;
        };

        let timeout = self.exchange_timeout.for_query(m.remote_addr, &req);
        let mut ctx = ExchangeContext::with_match(m);
        ctx.deadline = timeout.map(|d| Instant::now() + d);

        let exchange = horizon.exchanger().exchange(&ctx, &req);
        let res = match timeout {
            Some(d) => tokio::time::timeout(d, exchange)
                .await
                .unwrap_or_else(|_| Err(EdgeError::exchange(ResponseCode::ServFail, "exchange timed out"))),
            None => exchange.await,
        };

        let written = match res {
            Ok(reply) => w.write_msg(&reply, true),
            Err(err) => {
                let rcode = match &err {
                    EdgeError::Exchange { rcode, .. } => *rcode,
                    _ => ResponseCode::ServFail,
                };
                if rcode == ResponseCode::Refused {
                    record_dns_refused();
                } else {
                    tracing::debug!(horizon = horizon.name(), error = %err, "Exchange failed");
                }
                w.write_msg(&reply_with_rcode(&req, rcode), false)
            }
        };
        if let Err(err) = written {
            tracing::debug!(error = %err, "Failed to write reply");
        }
    }
}

#[async_trait]
impl Exchanger for HorizonRouter {
    /// Re-dispatch by the horizon already recorded in `ctx`.
    async fn exchange(&self, ctx: &ExchangeContext, req: &Message) -> EdgeResult<Message> {
        let horizon = ctx
            .horizon
            .as_ref()
            .filter(|m| m.is_valid())
            .and_then(|m| self.get(&m.horizon));
        match horizon {
            Some(h) => h.exchanger().exchange(ctx, req).await,
            None => Err(EdgeError::exchange(ResponseCode::Refused, "no horizon")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::writer::DnsProto;
    use crate::routing::horizon::{Horizon, Match};
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    struct Answer;

    #[async_trait]
    impl Exchanger for Answer {
        async fn exchange(&self, ctx: &ExchangeContext, req: &Message) -> EdgeResult<Message> {
            assert!(ctx.horizon.is_some());
            let mut reply = reply_with_rcode(req, ResponseCode::NoError);
            reply.set_authoritative(true);
            Ok(reply)
        }
    }

    struct Slow;

    #[async_trait]
    impl Exchanger for Slow {
        async fn exchange(&self, _ctx: &ExchangeContext, req: &Message) -> EdgeResult<Message> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(req.clone())
        }
    }

    fn query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str("example.org.").unwrap(), RecordType::A));
        msg
    }

    fn writer(remote: &str) -> DnsResponseWriter {
        DnsResponseWriter::new(
            "127.0.0.1:53".parse().unwrap(),
            remote.parse().unwrap(),
            DnsProto::Udp,
            4096,
        )
    }

    async fn serve(router: &HorizonRouter, remote: &str, id: u16) -> Message {
        let mut w = writer(remote);
        router.serve_dns(&mut w, query(id)).await;
        Message::from_vec(&w.take().unwrap()).unwrap()
    }

    fn lan_router() -> HorizonRouter {
        let mut r = HorizonRouter::new();
        r.append(
            Horizon::new("lan", vec!["10.0.0.0/8".parse().unwrap()]).with_exchanger(Arc::new(Answer)),
        )
        .unwrap();
        r
    }

    #[tokio::test]
    async fn unmatched_query_is_refused_with_same_id() {
        let reply = serve(&lan_router(), "192.0.2.7:5353", 0xbeef).await;
        assert_eq!(reply.id(), 0xbeef);
        assert_eq!(reply.response_code(), ResponseCode::Refused);
        assert!(reply.recursion_available());
    }

    #[tokio::test]
    async fn matched_query_reaches_exchanger() {
        let reply = serve(&lan_router(), "10.0.0.9:5353", 7).await;
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.authoritative());
    }

    #[tokio::test]
    async fn default_horizon_refuses() {
        let mut r = HorizonRouter::new();
        r.append(Horizon::new("all", vec![])).unwrap();
        let reply = serve(&r, "10.0.0.9:5353", 9).await;
        assert_eq!(reply.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn elapsed_exchange_is_servfail() {
        let mut r = HorizonRouter::new().with_exchange_timeout(ExchangeTimeout::Fixed(Duration::from_millis(50)));
        r.append(Horizon::new("all", vec![]).with_exchanger(Arc::new(Slow))).unwrap();
        let reply = serve(&r, "10.0.0.9:5353", 11).await;
        assert_eq!(reply.id(), 11);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn exchange_redispatches_by_match() {
        let r = lan_router();
        let (_, m) = r.match_addr("10.1.1.1".parse().unwrap()).unwrap();
        let reply = r.exchange(&ExchangeContext::with_match(m), &query(3)).await.unwrap();
        assert!(reply.authoritative());

        let forged = Match {
            horizon: "lan".into(),
            remote_addr: "192.0.2.1".parse().unwrap(),
            cidr: "10.0.0.0/8".parse().unwrap(),
        };
        let err = r.exchange(&ExchangeContext::with_match(forged), &query(4)).await.unwrap_err();
        assert!(matches!(err, EdgeError::Exchange { rcode: ResponseCode::Refused, .. }));
    }

    #[test]
    fn per_query_timeout() {
        let t = ExchangeTimeout::PerQuery(Arc::new(|addr: IpAddr, _: &Message| {
            addr.is_loopback().then(|| Duration::from_secs(1))
        }));
        assert_eq!(t.for_query("127.0.0.1".parse().unwrap(), &query(1)), Some(Duration::from_secs(1)));
        assert_eq!(t.for_query("10.0.0.1".parse().unwrap(), &query(1)), None);
        assert_eq!(ExchangeTimeout::Fixed(Duration::ZERO).for_query("::1".parse().unwrap(), &query(1)), None);
    }
}
