use std::sync::Arc;
use std::time::Instant;

use crate::http1::RequestHead;
use crate::stats::Stats;

pub struct MgmtResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl MgmtResponse {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }
}

/// Requests whose path starts with the management prefix never go upstream;
/// they are answered by this collaborator instead. The dashboard replaces
/// the built-in responder through this boundary.
pub trait Management: Send + Sync {
    fn handle(&self, head: &RequestHead, body: &[u8]) -> MgmtResponse;
}

/// Minimal built-in responder: heartbeat and a stats snapshot.
pub struct BuiltinManagement {
    prefix: String,
    stats: Arc<Stats>,
    started: Instant,
}

impl BuiltinManagement {
    pub fn new(prefix: String, stats: Arc<Stats>) -> Self {
        Self {
            prefix,
            stats,
            started: Instant::now(),
        }
    }
}

impl Management for BuiltinManagement {
    fn handle(&self, head: &RequestHead, _body: &[u8]) -> MgmtResponse {
        let path = head.path();
        let sub = path
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(path)
            .split('?')
            .next()
            .unwrap_or("");
        if !head.method.eq_ignore_ascii_case("GET") {
            return MgmtResponse::json(405, serde_json::json!({"error": "method not allowed"}));
        }
        match sub {
            "/heartbeat" => MgmtResponse::json(
                200,
                serde_json::json!({
                    "status": "ok",
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_secs": self.started.elapsed().as_secs(),
                }),
            ),
            "/stats" => match serde_json::to_value(self.stats.snapshot()) {
                Ok(snap) => MgmtResponse::json(200, snap),
                Err(e) => MgmtResponse::json(500, serde_json::json!({"error": e.to_string()})),
            },
            _ => MgmtResponse::json(404, serde_json::json!({"error": "not found"})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, target: &str) -> RequestHead {
        RequestHead {
            method: method.into(),
            target: target.into(),
            version_minor: 1,
            headers: vec![],
        }
    }

    fn mgmt() -> BuiltinManagement {
        BuiltinManagement::new("/fps".into(), Arc::new(Stats::new()))
    }

    #[test]
    fn heartbeat_reports_ok() {
        let resp = mgmt().handle(&head("GET", "/fps/heartbeat"), &[]);
        assert_eq!(resp.status, 200);
        let v: serde_json::Value = serde_json::from_slice(&resp.body).expect("json");
        assert_eq!(v["status"], "ok");
    }

    #[test]
    fn stats_endpoint_serves_snapshot() {
        let resp = mgmt().handle(&head("GET", "/fps/stats"), &[]);
        assert_eq!(resp.status, 200);
        let v: serde_json::Value = serde_json::from_slice(&resp.body).expect("json");
        assert!(v.get("blocked_total").is_some());
    }

    #[test]
    fn unknown_paths_and_methods_are_rejected() {
        assert_eq!(mgmt().handle(&head("GET", "/fps/nope"), &[]).status, 404);
        assert_eq!(mgmt().handle(&head("POST", "/fps/heartbeat"), &[]).status, 405);
    }
}
