// Routes module - desired and observed route records

pub mod interfaces;
pub mod lookup;
pub mod prefix;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::AppResult;
use prefix::Ipv4Prefix;
use validator::{TargetKind, validate_target};

/// A configured route, as stored in a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Route {
    pub enabled: bool,
    /// IPv4 address, CIDR or domain name
    pub target: String,
    #[serde(alias = "prefix_length")]
    pub prefix_length: u8,
    #[serde(deserialize_with = "gateway_or_unspecified")]
    pub gateway: Ipv4Addr,
    #[serde(alias = "interface_name")]
    pub interface_name: String,
    pub metric: u32,
    pub persistent: bool,
    /// Keep the resolved addresses of a domain target
    pub pin: bool,
    pub group: String,
    #[serde(alias = "desc")]
    pub description: String,

    // Runtime fields
    #[serde(rename = "ifIndex", alias = "if_index")]
    pub if_index: u32,
    #[serde(alias = "last_apply_result")]
    pub last_apply_result: String,
    #[serde(alias = "last_apply_time")]
    pub last_apply_time: String,
}

/// Older profiles store an unset gateway as `""`.
fn gateway_or_unspecified<'de, D>(deserializer: D) -> Result<Ipv4Addr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    raw.parse().map_err(serde::de::Error::custom)
}

impl Default for Route {
    fn default() -> Self {
        Route {
            enabled: true,
            target: String::new(),
            prefix_length: 32,
            gateway: Ipv4Addr::UNSPECIFIED,
            interface_name: String::new(),
            metric: 5,
            persistent: true,
            pin: false,
            group: String::new(),
            description: String::new(),
            if_index: 0,
            last_apply_result: String::new(),
            last_apply_time: String::new(),
        }
    }
}

impl Route {
    /// Canonical destination prefix used to match against system routes.
    pub fn destination(&self) -> AppResult<Ipv4Prefix> {
        Ipv4Prefix::from_target(&self.target, self.prefix_length)
    }

    /// The destination as `A.B.C.D/N`, or the raw target when it is not an IPv4 prefix.
    pub fn destination_label(&self) -> String {
        self.destination()
            .map(|p| p.to_string())
            .unwrap_or_else(|_| self.target.clone())
    }

    /// The lowercased domain name when the target is a domain.
    pub fn domain(&self) -> Option<String> {
        match validate_target(&self.target) {
            Ok(TargetKind::Domain) => Some(self.target.trim().to_lowercase()),
            _ => None,
        }
    }

    /// Whether this is one of the `/32` host routes a domain route expands to.
    pub fn expanded_from(&self, origin: &Route) -> bool {
        let Some(domain) = origin.domain() else {
            return false;
        };
        let description = if origin.description.is_empty() {
            domain.as_str()
        } else {
            origin.description.as_str()
        };
        self.prefix_length == 32
            && self.target.parse::<Ipv4Addr>().is_ok()
            && self.description == description
            && self.gateway == origin.gateway
            && self.interface_name == origin.interface_name
            && self.metric == origin.metric
            && self.group == origin.group
    }

    /// Disabled stand-in for a system route that has no configured counterpart.
    pub fn placeholder_for(system: &SystemRoute) -> Route {
        let (target, prefix_length) = match system.destination() {
            Ok(p) => (p.network().to_string(), p.prefix_len()),
            Err(_) => (system.destination_prefix.clone(), 32),
        };
        Route {
            enabled: false,
            target,
            prefix_length,
            gateway: system.next_hop,
            metric: system.route_metric,
            description: "permanent system route not in configuration".to_string(),
            ..Route::default()
        }
    }
}

/// A route read from the live IPv4 routing table.
///
/// Field names follow `Get-NetRoute` so snapshots keep the system's own shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRoute {
    #[serde(rename = "DestinationPrefix")]
    pub destination_prefix: String,
    #[serde(rename = "NextHop")]
    pub next_hop: Ipv4Addr,
    #[serde(rename = "ifIndex")]
    pub interface_index: u32,
    #[serde(rename = "RouteMetric")]
    pub route_metric: u32,
    #[serde(rename = "Protocol")]
    pub protocol: RouteProtocol,
}

impl SystemRoute {
    pub fn destination(&self) -> AppResult<Ipv4Prefix> {
        self.destination_prefix.parse()
    }

    /// Matching key: the canonical prefix, or the raw string if it does not parse.
    pub fn key(&self) -> String {
        self.destination()
            .map(|p| p.to_string())
            .unwrap_or_else(|_| self.destination_prefix.clone())
    }
}

/// Origin of a system route. Only `NetMgmt` routes are owned by this tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawProtocol", into = "String")]
pub enum RouteProtocol {
    NetMgmt,
    Local,
    Redirect,
    Kernel,
    Dhcp,
    RouterAdvertisement,
    Other(String),
}

impl RouteProtocol {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "NetMgmt" => RouteProtocol::NetMgmt,
            "Local" => RouteProtocol::Local,
            "Icmp" | "Redirect" => RouteProtocol::Redirect,
            "Kernel" => RouteProtocol::Kernel,
            "Dhcp" => RouteProtocol::Dhcp,
            "Ra" | "RouterAdvertisement" => RouteProtocol::RouterAdvertisement,
            other => RouteProtocol::Other(other.to_string()),
        }
    }

    /// Map a numeric `MSFT_NetRoute.Protocol` value.
    pub fn from_code(code: u64) -> Self {
        match code {
            2 => RouteProtocol::Local,
            3 => RouteProtocol::NetMgmt,
            4 => RouteProtocol::Redirect,
            19 => RouteProtocol::Dhcp,
            other => RouteProtocol::Other(other.to_string()),
        }
    }

    pub fn is_net_mgmt(&self) -> bool {
        matches!(self, RouteProtocol::NetMgmt)
    }
}

impl fmt::Display for RouteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteProtocol::NetMgmt => "NetMgmt",
            RouteProtocol::Local => "Local",
            RouteProtocol::Redirect => "Redirect",
            RouteProtocol::Kernel => "Kernel",
            RouteProtocol::Dhcp => "Dhcp",
            RouteProtocol::RouterAdvertisement => "RouterAdvertisement",
            RouteProtocol::Other(name) => name,
        };
        f.write_str(name)
    }
}

impl From<RouteProtocol> for String {
    fn from(protocol: RouteProtocol) -> Self {
        protocol.to_string()
    }
}

/// PowerShell emits the protocol either by name or as its numeric code.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawProtocol {
    Name(String),
    Code(u64),
}

impl From<RawProtocol> for RouteProtocol {
    fn from(raw: RawProtocol) -> Self {
        match raw {
            RawProtocol::Name(name) => RouteProtocol::from_name(&name),
            RawProtocol::Code(code) => RouteProtocol::from_code(code),
        }
    }
}

/// An IPv4-capable network adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub interface_index: u32,
    pub mac_address: String,
    pub status: String,
    pub description: String,
    pub ip_address: Option<Ipv4Addr>,
    pub prefix_length: u8,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
}

impl NetworkInterface {
    pub fn new(name: &str, interface_index: u32) -> Self {
        NetworkInterface {
            name: name.to_string(),
            interface_index,
            mac_address: String::new(),
            status: "Up".to_string(),
            description: String::new(),
            ip_address: None,
            prefix_length: 0,
            subnet_mask: None,
            gateway: None,
        }
    }
}
