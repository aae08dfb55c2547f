// Fake host - in-memory routing table for tests

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    MutationOp, MutationOutcome, MutationRequest, RouteExecutor, RouteHit, RouteProbe, RouteSource,
    TraceOutcome,
};
use crate::error::{AppError, AppResult};
use crate::routes::lookup::RouteTable;
use crate::routes::prefix::{Ipv4Prefix, mask_to_prefix};
use crate::routes::{NetworkInterface, RouteProtocol, SystemRoute};

#[derive(Default)]
struct FakeState {
    interfaces: Vec<NetworkInterface>,
    routes: Vec<SystemRoute>,
    calls: Vec<MutationRequest>,
    failures: Vec<(MutationOp, Ipv4Addr)>,
    fail_queries: bool,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new(interfaces: Vec<NetworkInterface>, routes: Vec<SystemRoute>) -> Self {
        FakeHost {
            state: Mutex::new(FakeState {
                interfaces,
                routes,
                ..FakeState::default()
            }),
        }
    }

    /// Make every `op` against `target` fail.
    pub fn fail_on(&self, op: MutationOp, target: &str) {
        let target = target.parse().expect("test target must be an IPv4 address");
        self.state.lock().unwrap().failures.push((op, target));
    }

    pub fn fail_queries(&self) {
        self.state.lock().unwrap().fail_queries = true;
    }

    pub fn calls(&self) -> Vec<MutationRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls rendered as `"<op> <target>"`, e.g. `"delete 10.0.0.0"`.
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| format!("{} {}", c.op, c.target))
            .collect()
    }

    pub fn routes(&self) -> Vec<SystemRoute> {
        self.state.lock().unwrap().routes.clone()
    }

    /// Mutate the table behind the engine's back.
    pub fn set_routes(&self, routes: Vec<SystemRoute>) {
        self.state.lock().unwrap().routes = routes;
    }
}

pub fn net_mgmt(prefix: &str, next_hop: &str, if_index: u32, metric: u32) -> SystemRoute {
    SystemRoute {
        destination_prefix: prefix.to_string(),
        next_hop: next_hop.parse().expect("test next hop must be an IPv4 address"),
        interface_index: if_index,
        route_metric: metric,
        protocol: RouteProtocol::NetMgmt,
    }
}

fn apply(state: &mut FakeState, request: &MutationRequest) -> MutationOutcome {
    match request.op {
        MutationOp::Delete => {
            let before = state.routes.len();
            state.routes.retain(|r| {
                r.destination()
                    .map(|p| p.network() != request.target)
                    .unwrap_or(true)
            });
            if state.routes.len() == before {
                return MutationOutcome::failed("The route deletion failed: Element not found.");
            }
        }
        MutationOp::Add | MutationOp::Change => {
            let len = mask_to_prefix(request.subnet_mask.unwrap_or(Ipv4Addr::BROADCAST));
            let Ok(prefix) = Ipv4Prefix::new(request.target, len) else {
                return MutationOutcome::failed("bad mask");
            };
            let key = prefix.to_string();
            let existing = state.routes.iter().position(|r| r.key() == key);
            let entry = SystemRoute {
                destination_prefix: key,
                next_hop: request.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
                interface_index: request.interface_index.unwrap_or(0),
                route_metric: request.metric.unwrap_or(0),
                protocol: RouteProtocol::NetMgmt,
            };
            match (request.op, existing) {
                (MutationOp::Add, Some(_)) => {
                    return MutationOutcome::failed(
                        "The route addition failed: The object already exists.",
                    );
                }
                (MutationOp::Add, None) => state.routes.push(entry),
                (_, Some(i)) => state.routes[i] = entry,
                (_, None) => {
                    return MutationOutcome::failed("The route change failed: Element not found.");
                }
            }
        }
    }
    MutationOutcome::ok("OK!")
}

#[async_trait]
impl RouteSource for FakeHost {
    async fn query_network_interfaces(&self) -> AppResult<Vec<NetworkInterface>> {
        let state = self.state.lock().unwrap();
        if state.fail_queries {
            return Err(AppError::InterfaceQuery("fake query failure".to_string()));
        }
        Ok(state.interfaces.clone())
    }

    async fn query_system_routes(&self) -> AppResult<Vec<SystemRoute>> {
        let state = self.state.lock().unwrap();
        if state.fail_queries {
            return Err(AppError::SystemQuery("fake query failure".to_string()));
        }
        Ok(state.routes.clone())
    }
}

#[async_trait]
impl RouteExecutor for FakeHost {
    async fn mutate_route(&self, request: &MutationRequest) -> MutationOutcome {
        let mut state = self.state.lock().unwrap();
        state.calls.push(request.clone());
        if state
            .failures
            .iter()
            .any(|(op, target)| *op == request.op && *target == request.target)
        {
            return MutationOutcome::failed(format!("scripted failure: {}", request));
        }
        apply(&mut state, request)
    }
}

#[async_trait]
impl RouteProbe for FakeHost {
    async fn verify_route_hit(&self, target: Ipv4Addr) -> AppResult<RouteHit> {
        let state = self.state.lock().unwrap();
        let table = RouteTable::new(&state.routes);
        Ok(match table.lookup(target) {
            Some(route) => RouteHit {
                hit: true,
                out_interface: route.interface_index.to_string(),
                next_hop: route.next_hop.to_string(),
                raw_output: route.destination_prefix.clone(),
            },
            None => RouteHit::default(),
        })
    }

    async fn trace_route(&self, target: Ipv4Addr, _timeout: Duration) -> AppResult<TraceOutcome> {
        let hit = self.verify_route_hit(target).await?;
        Ok(TraceOutcome {
            success: hit.hit,
            first_hop: hit.next_hop,
            latency_ms: 1,
            raw_output: String::new(),
        })
    }
}
