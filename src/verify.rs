// Route verification - check where traffic to a target actually goes

use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::routes::prefix::target_ip;
use crate::system::RouteProbe;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub target: String,
    pub hit: bool,
    pub interface: String,
    pub gateway: String,
    pub trace_success: bool,
    pub first_hop: String,
    pub latency_ms: u64,
    pub error: String,
    pub log: String,
}

impl VerifyResult {
    pub fn passed(&self) -> bool {
        self.error.is_empty()
    }
}

/// Runs route-hit checks and optional traces. Its results never decide
/// whether an apply succeeded.
pub struct VerifyManager<'a, P: ?Sized> {
    probe: &'a P,
    trace_timeout: Duration,
}

impl<'a, P> VerifyManager<'a, P>
where
    P: RouteProbe + ?Sized,
{
    pub fn new(probe: &'a P, trace_timeout: Duration) -> Self {
        VerifyManager {
            probe,
            trace_timeout,
        }
    }

    pub async fn verify_route(&self, target: &str, trace: bool) -> VerifyResult {
        let mut result = VerifyResult {
            target: target.to_string(),
            ..VerifyResult::default()
        };

        let ip: Ipv4Addr = match target_ip(target).parse() {
            Ok(ip) => ip,
            Err(_) => {
                result.error = format!("not an IPv4 target: {}", target);
                return result;
            }
        };

        match self.probe.verify_route_hit(ip).await {
            Ok(hit) => {
                result.hit = hit.hit;
                result.interface = hit.out_interface;
                result.gateway = hit.next_hop;
                result.log = hit.raw_output;
            }
            Err(e) => {
                tracing::error!("Route check failed for {}: {}", target, e);
                result.error = e.to_string();
                return result;
            }
        }

        if !result.hit {
            result.error = "no matching route".to_string();
            return result;
        }

        if trace {
            match self.probe.trace_route(ip, self.trace_timeout).await {
                Ok(outcome) => {
                    result.trace_success = outcome.success;
                    result.first_hop = outcome.first_hop;
                    result.latency_ms = outcome.latency_ms;
                    if !outcome.raw_output.is_empty() {
                        result.log.push_str("\n\n");
                        result.log.push_str(&outcome.raw_output);
                    }
                    if !outcome.success {
                        result.error = "trace route failed".to_string();
                    }
                }
                Err(e) => {
                    tracing::warn!("Trace to {} failed: {}", target, e);
                    result.error = e.to_string();
                }
            }
        }

        result
    }

    pub async fn verify_routes(&self, targets: &[String], trace: bool) -> Vec<VerifyResult> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            tracing::info!("Verifying route to {}", target);
            results.push(self.verify_route(target, trace).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::{FakeHost, net_mgmt};

    fn host() -> FakeHost {
        FakeHost::new(
            vec![],
            vec![
                net_mgmt("0.0.0.0/0", "192.168.1.1", 12, 25),
                net_mgmt("10.0.0.0/8", "10.8.0.1", 30, 5),
            ],
        )
    }

    #[tokio::test]
    async fn test_verify_hit_reports_path() {
        let host = host();
        let manager = VerifyManager::new(&host, Duration::from_secs(1));

        let result = manager.verify_route("10.1.2.3", false).await;
        assert!(result.passed());
        assert!(result.hit);
        assert_eq!(result.gateway, "10.8.0.1");
        assert_eq!(result.interface, "30");
        assert!(!result.trace_success);
    }

    #[tokio::test]
    async fn test_verify_accepts_cidr_and_traces() {
        let host = host();
        let manager = VerifyManager::new(&host, Duration::from_secs(1));

        let result = manager.verify_route("10.0.0.0/24", true).await;
        assert!(result.passed());
        assert!(result.trace_success);
        assert_eq!(result.first_hop, "10.8.0.1");
    }

    #[tokio::test]
    async fn test_verify_miss_and_bad_target() {
        let host = FakeHost::new(vec![], vec![net_mgmt("10.0.0.0/8", "10.8.0.1", 30, 5)]);
        let manager = VerifyManager::new(&host, Duration::from_secs(1));

        let results = manager
            .verify_routes(&["8.8.8.8".to_string(), "example.com".to_string()], false)
            .await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].hit);
        assert_eq!(results[0].error, "no matching route");
        assert!(results[1].error.contains("not an IPv4 target"));
    }
}
