// System module - the host's routing table and the commands that change it

#[cfg(test)]
pub mod fake;
pub mod powershell;
pub mod windows;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::AppResult;
use crate::routes::prefix::Ipv4Prefix;
use crate::routes::{NetworkInterface, SystemRoute};

/// Read side of the host: interfaces and the IPv4 routing table.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn query_network_interfaces(&self) -> AppResult<Vec<NetworkInterface>>;

    async fn query_system_routes(&self) -> AppResult<Vec<SystemRoute>>;
}

/// Write side of the host. Failures are reported in the outcome, never raised.
#[async_trait]
pub trait RouteExecutor: Send + Sync {
    async fn mutate_route(&self, request: &MutationRequest) -> MutationOutcome;
}

/// Connectivity checks used by verification, outside the apply loop.
#[async_trait]
pub trait RouteProbe: Send + Sync {
    async fn verify_route_hit(&self, target: Ipv4Addr) -> AppResult<RouteHit>;

    async fn trace_route(&self, target: Ipv4Addr, timeout: Duration) -> AppResult<TraceOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Add,
    Change,
    Delete,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            MutationOp::Add => "add",
            MutationOp::Change => "change",
            MutationOp::Delete => "delete",
        })
    }
}

/// One OS-level route mutation.
///
/// Add and change carry mask, gateway, interface and metric. Delete is keyed
/// by target address only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub op: MutationOp,
    pub target: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub interface_index: Option<u32>,
    pub metric: Option<u32>,
    pub persistent: bool,
}

impl MutationRequest {
    pub fn add(
        prefix: Ipv4Prefix,
        gateway: Ipv4Addr,
        interface_index: u32,
        metric: u32,
        persistent: bool,
    ) -> Self {
        MutationRequest {
            op: MutationOp::Add,
            target: prefix.network(),
            subnet_mask: Some(prefix.mask()),
            gateway: Some(gateway),
            interface_index: Some(interface_index),
            metric: Some(metric),
            persistent,
        }
    }

    pub fn change(prefix: Ipv4Prefix, gateway: Ipv4Addr, interface_index: u32, metric: u32) -> Self {
        MutationRequest {
            op: MutationOp::Change,
            ..MutationRequest::add(prefix, gateway, interface_index, metric, false)
        }
    }

    pub fn delete(target: Ipv4Addr) -> Self {
        MutationRequest {
            op: MutationOp::Delete,
            target,
            subnet_mask: None,
            gateway: None,
            interface_index: None,
            metric: None,
            persistent: false,
        }
    }
}

impl fmt::Display for MutationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.target)?;
        if let Some(mask) = self.subnet_mask {
            write!(f, " mask {}", mask)?;
        }
        if let Some(gateway) = self.gateway {
            write!(f, " via {}", gateway)?;
        }
        if let Some(index) = self.interface_index {
            write!(f, " if {}", index)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {}", metric)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub success: bool,
    pub message: String,
}

impl MutationOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        MutationOutcome {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        MutationOutcome {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHit {
    pub hit: bool,
    pub out_interface: String,
    pub next_hop: String,
    pub raw_output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOutcome {
    pub success: bool,
    pub first_hop: String,
    pub latency_ms: u64,
    pub raw_output: String,
}
