//! `Alt-Svc` advertisement of HTTP/3 endpoints.
//!
//! # Design Decisions
//! - One shared string behind a mutex, written by discovery tasks and read
//!   on every response
//! - Responses sent before discovery simply lack the header

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::Response;

use crate::lifecycle::WorkerContext;

/// Poll interval of [`discover`].
pub const DISCOVERY_INTERVAL: Duration = Duration::from_millis(10);

/// The merged advertisement, shared by every HTTP listener.
#[derive(Debug, Clone, Default)]
pub struct AltSvc {
    value: Arc<Mutex<String>>,
}

impl AltSvc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the comma-separated tokens of `adv`, skipping known ones.
    pub fn merge(&self, adv: &str) {
        let mut value = self.value.lock().unwrap_or_else(|p| p.into_inner());
        for token in adv.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if value.split(',').map(str::trim).any(|known| known == token) {
                continue;
            }
            if !value.is_empty() {
                value.push_str(", ");
            }
            value.push_str(token);
        }
    }

    /// Current advertisement, if any.
    pub fn get(&self) -> Option<String> {
        let value = self.value.lock().unwrap_or_else(|p| p.into_inner());
        (!value.is_empty()).then(|| value.clone())
    }
}

/// Response mapper setting `Alt-Svc` once an advertisement is known.
pub async fn inject_alt_svc(State(alt_svc): State<AltSvc>, mut res: Response) -> Response {
    if let Some(value) = alt_svc.get().and_then(|v| HeaderValue::from_str(&v).ok()) {
        res.headers_mut().insert(header::ALT_SVC, value);
    }
    res
}

/// Poll `source` until the listener publishes its advertisement, then
/// merge it into `alt_svc`. Gives up when the group is cancelled.
pub async fn discover(source: Arc<OnceLock<String>>, alt_svc: AltSvc, ctx: WorkerContext) {
    let mut tick = tokio::time::interval(DISCOVERY_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Some(adv) = source.get() {
                    tracing::debug!(alt_svc = %adv, "HTTP/3 advertised");
                    alt_svc.merge(adv);
                    return;
                }
            }
            _ = ctx.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::WorkerGroup;

    #[test]
    fn merge_deduplicates_tokens() {
        let alt = AltSvc::new();
        assert!(alt.get().is_none());

        alt.merge(r#"h3=":443"; ma=2592000"#);
        alt.merge(r#"h3=":443"; ma=2592000, h3=":8443"; ma=2592000"#);
        alt.merge("");
        assert_eq!(
            alt.get().unwrap(),
            r#"h3=":443"; ma=2592000, h3=":8443"; ma=2592000"#
        );
    }

    #[tokio::test]
    async fn discover_merges_published_value() {
        let group = WorkerGroup::new();
        let source = Arc::new(OnceLock::new());
        let alt = AltSvc::new();

        let task = tokio::spawn(discover(source.clone(), alt.clone(), group.context()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(alt.get().is_none());

        source.set(r#"h3=":8443"; ma=2592000"#.to_string()).unwrap();
        task.await.unwrap();
        assert_eq!(alt.get().unwrap(), r#"h3=":8443"; ma=2592000"#);
    }

    #[tokio::test]
    async fn discover_stops_on_cancel() {
        let group = WorkerGroup::new();
        let task = tokio::spawn(discover(Arc::new(OnceLock::new()), AltSvc::new(), group.context()));
        group.cancel(crate::EdgeError::Cancelled);
        task.await.unwrap();
    }
}
