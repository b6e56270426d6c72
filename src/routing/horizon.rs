//! Split-horizon policy lookup.
//!
//! # Responsibilities
//! - Store horizons in append order, indexed by name
//! - Match a remote address to the first horizon containing it
//!
//! # Design Decisions
//! - Built once before serving, immutable afterwards (no locks on dispatch)
//! - First match wins; an empty range list is a wildcard for the address
//!   family, so a catch-all horizon must be appended last
//! - IPv4-mapped IPv6 addresses are matched as plain IPv4

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use axum::Router;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::dns::handler::Exchanger;
use crate::error::{EdgeError, EdgeResult};
use crate::http::response::forbidden;
use crate::routing::dns::{ExchangeTimeout, Refuse};

/// A named policy bound to CIDR ranges.
#[derive(Clone)]
pub struct Horizon {
    name: String,
    ranges: Vec<IpNet>,
    http: Router,
    exchanger: Arc<dyn Exchanger>,
}

impl Horizon {
    /// A horizon answering 403 to HTTP and refusing every query.
    pub fn new(name: impl Into<String>, ranges: Vec<IpNet>) -> Self {
        Self {
            name: name.into(),
            ranges,
            http: Router::new().fallback(|| async { forbidden() }),
            exchanger: Arc::new(Refuse),
        }
    }

    /// Serve HTTP requests of this horizon with `http`.
    pub fn with_http(mut self, http: Router) -> Self {
        self.http = http;
        self
    }

    /// Resolve DNS queries of this horizon with `exchanger`.
    pub fn with_exchanger(mut self, exchanger: Arc<dyn Exchanger>) -> Self {
        self.exchanger = exchanger;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ranges(&self) -> &[IpNet] {
        &self.ranges
    }

    pub fn http(&self) -> &Router {
        &self.http
    }

    pub fn exchanger(&self) -> &Arc<dyn Exchanger> {
        &self.exchanger
    }

    /// The range containing `addr`, if any.
    ///
    /// With no ranges, the whole family of `addr` is returned.
    pub fn in_range(&self, addr: IpAddr) -> Option<IpNet> {
        let addr = unmap(addr);
        if self.ranges.is_empty() {
            return Some(any_of(addr));
        }
        self.ranges.iter().copied().find(|net| net.contains(&addr))
    }
}

impl std::fmt::Debug for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Horizon")
            .field("name", &self.name)
            .field("ranges", &self.ranges)
            .finish_non_exhaustive()
    }
}

/// How a client was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub horizon: String,
    pub remote_addr: IpAddr,
    pub cidr: IpNet,
}

impl Match {
    /// A match is valid iff its range contains its address.
    pub fn is_valid(&self) -> bool {
        !self.horizon.is_empty() && self.cidr.contains(&unmap(self.remote_addr))
    }
}

/// Ordered horizons plus a name index.
#[derive(Debug, Clone, Default)]
pub struct HorizonRouter {
    horizons: Vec<Arc<Horizon>>,
    by_name: HashMap<String, Arc<Horizon>>,
    pub(crate) exchange_timeout: ExchangeTimeout,
}

impl HorizonRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every DNS exchange dispatched by this router.
    pub fn with_exchange_timeout(mut self, timeout: ExchangeTimeout) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Add `horizon` after every existing one.
    pub fn append(&mut self, horizon: Horizon) -> EdgeResult<()> {
        if self.by_name.contains_key(horizon.name()) {
            return Err(EdgeError::HorizonExists(horizon.name().to_string()));
        }
        let horizon = Arc::new(horizon);
        self.by_name.insert(horizon.name().to_string(), horizon.clone());
        self.horizons.push(horizon);
        Ok(())
    }

    /// Look a horizon up by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Horizon>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.horizons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.horizons.is_empty()
    }

    /// First horizon containing `addr`, with the match fact.
    pub fn match_addr(&self, addr: IpAddr) -> Option<(&Arc<Horizon>, Match)> {
        let addr = unmap(addr);
        self.horizons.iter().find_map(|h| {
            h.in_range(addr).map(|cidr| {
                let m = Match {
                    horizon: h.name().to_string(),
                    remote_addr: addr,
                    cidr,
                };
                (h, m)
            })
        })
    }
}

/// Strip the IPv4-mapped IPv6 form.
pub fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn any_of(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(_) => IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0)),
        IpAddr::V6(_) => IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn router() -> HorizonRouter {
        let mut r = HorizonRouter::new();
        r.append(Horizon::new("lan", vec![net("10.0.0.0/8"), net("fd00::/8")]))
            .unwrap();
        r.append(Horizon::new("office", vec![net("10.1.0.0/16")])).unwrap();
        r.append(Horizon::new("world", vec![])).unwrap();
        r
    }

    #[test]
    fn first_appended_wins() {
        let r = router();
        let (h, m) = r.match_addr(ip("10.1.2.3")).unwrap();
        assert_eq!(h.name(), "lan");
        assert_eq!(m.cidr, net("10.0.0.0/8"));
        assert!(m.is_valid());
    }

    #[test]
    fn empty_ranges_match_the_family() {
        let r = router();
        let (_, m4) = r.match_addr(ip("192.0.2.1")).unwrap();
        assert_eq!(m4.horizon, "world");
        assert_eq!(m4.cidr, net("0.0.0.0/0"));

        let (_, m6) = r.match_addr(ip("2001:db8::1")).unwrap();
        assert_eq!(m6.cidr, net("::/0"));
    }

    #[test]
    fn catch_all_shadows_later_horizons() {
        let mut r = HorizonRouter::new();
        r.append(Horizon::new("all", vec![])).unwrap();
        r.append(Horizon::new("lan", vec![net("10.0.0.0/8")])).unwrap();
        assert_eq!(r.match_addr(ip("10.0.0.1")).unwrap().1.horizon, "all");
    }

    #[test]
    fn mapped_addresses_are_unmapped() {
        let r = router();
        let (h, m) = r.match_addr(ip("::ffff:10.9.9.9")).unwrap();
        assert_eq!(h.name(), "lan");
        assert_eq!(m.remote_addr, ip("10.9.9.9"));
    }

    #[test]
    fn no_match_outside_ranges() {
        let mut r = HorizonRouter::new();
        r.append(Horizon::new("lan", vec![net("10.0.0.0/8")])).unwrap();
        assert!(r.match_addr(ip("192.168.1.1")).is_none());
        assert!(r.match_addr(ip("::1")).is_none());
    }

    #[test]
    fn duplicate_name_conflicts() {
        let mut r = router();
        let err = r.append(Horizon::new("lan", vec![])).unwrap_err();
        assert!(matches!(err, EdgeError::HorizonExists(name) if name == "lan"));
        assert_eq!(r.len(), 3);
        assert!(r.get("office").is_some());
        assert!(r.get("nope").is_none());
    }

    #[test]
    fn invalid_match() {
        let m = Match {
            horizon: "lan".into(),
            remote_addr: ip("192.168.0.1"),
            cidr: net("10.0.0.0/8"),
        };
        assert!(!m.is_valid());
    }
}
