// Windows host backend: PowerShell NetTCPIP cmdlets for reads, route.exe for writes

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::powershell::{run_powershell, run_powershell_json, run_route_cmd};
use super::{
    MutationOp, MutationOutcome, MutationRequest, RouteExecutor, RouteHit, RouteProbe, RouteSource,
    TraceOutcome,
};
use crate::error::{AppError, AppResult};
use crate::routes::prefix::{Ipv4Prefix, prefix_to_mask};
use crate::routes::{NetworkInterface, RawProtocol, RouteProtocol, SystemRoute};

const ADAPTERS_CMD: &str = "Get-NetAdapter | Where-Object {$_.Status -eq 'Up'} | \
    Select-Object Name, ifIndex, MacAddress, Status, InterfaceDescription | ConvertTo-Json";

const ADDRESSES_CMD: &str = "Get-NetIPAddress -AddressFamily IPv4 | \
    Select-Object ifIndex, IPAddress, PrefixLength | ConvertTo-Json";

const DEFAULT_GATEWAYS_CMD: &str = "Get-NetRoute -AddressFamily IPv4 -DestinationPrefix '0.0.0.0/0' | \
    Select-Object ifIndex, NextHop | ConvertTo-Json";

const ROUTES_CMD: &str = "Get-NetRoute -AddressFamily IPv4 | \
    Select-Object DestinationPrefix, NextHop, ifIndex, RouteMetric, \
    @{Name='Protocol';Expression={[string]$_.Protocol}} | ConvertTo-Json";

#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    pub powershell: Duration,
    pub route: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        CommandTimeouts {
            powershell: Duration::from_secs(30),
            route: Duration::from_secs(10),
        }
    }
}

/// The local Windows host.
#[derive(Debug, Clone, Default)]
pub struct WindowsHost {
    timeouts: CommandTimeouts,
}

impl WindowsHost {
    pub fn new(timeouts: CommandTimeouts) -> Self {
        WindowsHost { timeouts }
    }
}

#[derive(Debug, Deserialize)]
struct AdapterRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ifIndex")]
    if_index: u32,
    #[serde(rename = "MacAddress")]
    mac_address: Option<String>,
    #[serde(rename = "Status")]
    status: Option<String>,
    #[serde(rename = "InterfaceDescription")]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddressRow {
    #[serde(rename = "ifIndex")]
    if_index: u32,
    #[serde(rename = "IPAddress")]
    ip_address: String,
    #[serde(rename = "PrefixLength")]
    prefix_length: u8,
}

#[derive(Debug, Deserialize)]
struct GatewayRow {
    #[serde(rename = "ifIndex")]
    if_index: u32,
    #[serde(rename = "NextHop")]
    next_hop: String,
}

#[derive(Debug, Deserialize)]
struct NetRouteRow {
    #[serde(rename = "DestinationPrefix")]
    destination_prefix: Option<String>,
    #[serde(rename = "NextHop")]
    next_hop: Option<String>,
    #[serde(rename = "ifIndex")]
    if_index: Option<u32>,
    #[serde(rename = "RouteMetric")]
    route_metric: Option<u32>,
    #[serde(rename = "Protocol")]
    protocol: Option<RawProtocol>,
}

fn assemble_interfaces(
    adapters: Vec<AdapterRow>,
    addresses: Vec<AddressRow>,
    gateways: Vec<GatewayRow>,
) -> Vec<NetworkInterface> {
    let mut interfaces: Vec<NetworkInterface> = adapters
        .into_iter()
        .map(|row| NetworkInterface {
            name: row.name,
            interface_index: row.if_index,
            mac_address: row.mac_address.unwrap_or_default(),
            status: row.status.unwrap_or_default(),
            description: row.description.unwrap_or_default(),
            ip_address: None,
            prefix_length: 0,
            subnet_mask: None,
            gateway: None,
        })
        .collect();

    let positions: HashMap<u32, usize> = interfaces
        .iter()
        .enumerate()
        .map(|(i, iface)| (iface.interface_index, i))
        .collect();

    for row in addresses {
        let (Some(&i), Ok(ip)) = (positions.get(&row.if_index), row.ip_address.parse::<Ipv4Addr>()) else {
            continue;
        };
        let iface = &mut interfaces[i];
        iface.ip_address = Some(ip);
        iface.prefix_length = row.prefix_length;
        iface.subnet_mask = Some(prefix_to_mask(row.prefix_length));
    }

    for row in gateways {
        if let (Some(&i), Ok(gw)) = (positions.get(&row.if_index), row.next_hop.parse::<Ipv4Addr>()) {
            interfaces[i].gateway = Some(gw);
        }
    }

    interfaces
}

/// Validate `Get-NetRoute` rows into typed records, dropping rows without a usable prefix.
fn parse_net_routes(rows: Vec<NetRouteRow>) -> Vec<SystemRoute> {
    let mut routes = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(raw_prefix) = row.destination_prefix else {
            tracing::warn!("Dropping route row without DestinationPrefix");
            continue;
        };
        let prefix: Ipv4Prefix = match raw_prefix.parse() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Dropping route row {}: {}", raw_prefix, e);
                continue;
            }
        };
        let next_hop = row
            .next_hop
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        routes.push(SystemRoute {
            destination_prefix: prefix.to_string(),
            next_hop,
            interface_index: row.if_index.unwrap_or(0),
            route_metric: row.route_metric.unwrap_or(0),
            protocol: row
                .protocol
                .map(RouteProtocol::from)
                .unwrap_or_else(|| RouteProtocol::Other("Unknown".to_string())),
        });
    }

    routes
}

/// route.exe arguments for a mutation, e.g. `-p add 10.0.0.0 mask 255.255.255.0 192.168.1.1 IF 12 metric 5`
fn route_args(request: &MutationRequest) -> AppResult<Vec<String>> {
    let target = request.target.to_string();
    if request.op == MutationOp::Delete {
        return Ok(vec!["delete".to_string(), target]);
    }

    let missing = |field: &str| AppError::InvalidRoute(format!("{} {} without {}", request.op, target, field));
    let mask = request.subnet_mask.ok_or_else(|| missing("subnet mask"))?;
    let gateway = request.gateway.ok_or_else(|| missing("gateway"))?;
    let if_index = request.interface_index.ok_or_else(|| missing("interface index"))?;
    let metric = request.metric.ok_or_else(|| missing("metric"))?;

    let mut args = Vec::new();
    if request.op == MutationOp::Add && request.persistent {
        args.push("-p".to_string());
    }
    args.extend([
        request.op.to_string(),
        target,
        "mask".to_string(),
        mask.to_string(),
        gateway.to_string(),
        "IF".to_string(),
        if_index.to_string(),
        "metric".to_string(),
        metric.to_string(),
    ]);
    Ok(args)
}

/// route.exe exits 0 on some failures and only says so in its output.
fn reports_failure(stdout: &str) -> bool {
    let lower = stdout.to_lowercase();
    lower.contains("failed") || lower.contains("失败")
}

/// Pick the matching row out of `route print <ip>`.
///
/// Active route rows are `Destination Netmask Gateway Interface Metric`;
/// an `On-link` gateway is reported as the interface address.
fn parse_route_print(output: &str, target_ip: &str) -> RouteHit {
    for line in output.lines() {
        if !line.contains(target_ip) || line.contains("Network Destination") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let next_hop = if parts[2] == "On-link" { parts[3] } else { parts[2] };
        return RouteHit {
            hit: true,
            out_interface: parts[3].to_string(),
            next_hop: next_hop.to_string(),
            raw_output: output.to_string(),
        };
    }

    RouteHit {
        hit: false,
        raw_output: output.to_string(),
        ..RouteHit::default()
    }
}

/// Extract first hop and RTT from `Test-NetConnection -TraceRoute` output.
fn parse_trace_output(output: &str) -> (String, u64) {
    let mut first_hop = String::new();
    let mut latency = 0;
    let mut in_trace = false;

    for line in output.lines() {
        let line = line.trim();

        if line.contains("RTT") || line.starts_with("PingReplyDetails") {
            if let Some(ms) = parse_latency(line) {
                latency = ms;
            }
        }

        if line.starts_with("TraceRoute") {
            in_trace = true;
            if let Some((_, hop)) = line.split_once(':') {
                if !hop.trim().is_empty() {
                    first_hop = hop.trim().to_string();
                    break;
                }
            }
            continue;
        }

        if in_trace && !line.is_empty() {
            first_hop = line.to_string();
            break;
        }
    }

    (first_hop, latency)
}

fn parse_latency(line: &str) -> Option<u64> {
    let (_, value) = line.split_once(':')?;
    let parts: Vec<&str> = value.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        if let Some(num) = part.strip_suffix("ms") {
            if let Ok(ms) = num.parse() {
                return Some(ms);
            }
        }
        if parts.get(i + 1) == Some(&"ms") {
            if let Ok(ms) = part.parse() {
                return Some(ms);
            }
        }
    }
    None
}

#[async_trait]
impl RouteSource for WindowsHost {
    async fn query_network_interfaces(&self) -> AppResult<Vec<NetworkInterface>> {
        let timeout = self.timeouts.powershell;
        let adapters: Vec<AdapterRow> = run_powershell_json(ADAPTERS_CMD, timeout)
            .await
            .map_err(|e| AppError::InterfaceQuery(e.to_string()))?;

        if adapters.is_empty() {
            tracing::warn!("No active network interfaces found");
            return Ok(Vec::new());
        }

        // Address and gateway details are best-effort
        let addresses: Vec<AddressRow> = run_powershell_json(ADDRESSES_CMD, timeout)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read interface addresses: {}", e);
                Vec::new()
            });
        let gateways: Vec<GatewayRow> = run_powershell_json(DEFAULT_GATEWAYS_CMD, timeout)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read default gateways: {}", e);
                Vec::new()
            });

        let interfaces = assemble_interfaces(adapters, addresses, gateways);
        tracing::info!("Found {} network interface(s)", interfaces.len());
        Ok(interfaces)
    }

    async fn query_system_routes(&self) -> AppResult<Vec<SystemRoute>> {
        let rows: Vec<NetRouteRow> = run_powershell_json(ROUTES_CMD, self.timeouts.powershell)
            .await
            .map_err(|e| AppError::SystemQuery(e.to_string()))?;

        let routes = parse_net_routes(rows);
        if routes.is_empty() {
            tracing::warn!("System routing table is empty");
        } else {
            tracing::info!("Read {} system route(s)", routes.len());
        }
        Ok(routes)
    }
}

#[async_trait]
impl RouteExecutor for WindowsHost {
    async fn mutate_route(&self, request: &MutationRequest) -> MutationOutcome {
        let args = match route_args(request) {
            Ok(args) => args,
            Err(e) => return MutationOutcome::failed(e.to_string()),
        };

        match run_route_cmd(&args, self.timeouts.route).await {
            Ok(output) if output.success && !reports_failure(&output.stdout) => {
                tracing::info!("route {}: {}", request, output.stdout);
                MutationOutcome::ok(output.stdout)
            }
            Ok(output) => {
                tracing::error!("route {} failed: {}", request, output.error_text());
                MutationOutcome::failed(output.error_text())
            }
            Err(e) => {
                tracing::error!("route {} failed: {}", request, e);
                MutationOutcome::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl RouteProbe for WindowsHost {
    async fn verify_route_hit(&self, target: Ipv4Addr) -> AppResult<RouteHit> {
        let ip = target.to_string();
        let output = run_route_cmd(&["print".to_string(), ip.clone()], self.timeouts.route).await?;
        if !output.success {
            return Ok(RouteHit {
                hit: false,
                raw_output: output.error_text().to_string(),
                ..RouteHit::default()
            });
        }
        Ok(parse_route_print(&output.stdout, &ip))
    }

    async fn trace_route(&self, target: Ipv4Addr, timeout: Duration) -> AppResult<TraceOutcome> {
        let command = format!(
            "Test-NetConnection {} -TraceRoute -WarningAction SilentlyContinue",
            target
        );
        let output = run_powershell(&command, timeout).await?;
        if !output.success {
            return Ok(TraceOutcome {
                success: false,
                raw_output: output.error_text().to_string(),
                ..TraceOutcome::default()
            });
        }

        let (first_hop, latency_ms) = parse_trace_output(&output.stdout);
        Ok(TraceOutcome {
            success: true,
            first_hop,
            latency_ms,
            raw_output: output.stdout,
        })
    }
}
