// Input validation for configured routes

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use super::{NetworkInterface, Route};
use super::prefix::{Ipv4Prefix, is_same_subnet};
use crate::error::{AppError, AppResult};

pub const MAX_DESCRIPTION_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Ip,
    Cidr,
    Domain,
}

pub fn validate_ip(ip: &str) -> AppResult<Ipv4Addr> {
    if ip.trim().is_empty() {
        return Err(AppError::InvalidTarget("IP address is empty".to_string()));
    }
    ip.trim()
        .parse()
        .map_err(|_| AppError::InvalidTarget(ip.to_string()))
}

pub fn validate_cidr(cidr: &str) -> AppResult<Ipv4Prefix> {
    if !cidr.contains('/') {
        return Err(AppError::InvalidTarget(format!("{} (missing '/')", cidr)));
    }
    if cidr.matches('/').count() != 1 {
        return Err(AppError::InvalidTarget(format!("{} (more than one '/')", cidr)));
    }
    cidr.parse()
}

/// Classify a target as IP, CIDR or domain name.
pub fn validate_target(target: &str) -> AppResult<TargetKind> {
    let target = target.trim();
    if target.is_empty() {
        return Err(AppError::InvalidTarget("target is empty".to_string()));
    }
    if target.contains('/') {
        return validate_cidr(target).map(|_| TargetKind::Cidr);
    }
    if validate_ip(target).is_ok() {
        return Ok(TargetKind::Ip);
    }
    if is_valid_domain(target) {
        return Ok(TargetKind::Domain);
    }
    Err(AppError::InvalidTarget(target.to_string()))
}

fn is_valid_domain(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let tld_ok = labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()));
    tld_ok
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

pub fn validate_metric(metric: u32) -> AppResult<u32> {
    if !(1..=999).contains(&metric) {
        return Err(AppError::InvalidRoute(format!(
            "metric {} out of range (1-999)",
            metric
        )));
    }
    Ok(metric)
}

/// The gateway must sit in the interface's own subnet.
pub fn validate_gateway(
    gateway: Ipv4Addr,
    interface_ip: Ipv4Addr,
    interface_mask: Ipv4Addr,
) -> AppResult<()> {
    if !is_same_subnet(gateway, interface_ip, interface_mask) {
        return Err(AppError::InvalidRoute(format!(
            "gateway {} is not in the subnet of {}/{}",
            gateway, interface_ip, interface_mask
        )));
    }
    Ok(())
}

pub fn validate_description(desc: &str, required: bool) -> AppResult<()> {
    if required && desc.trim().is_empty() {
        return Err(AppError::InvalidRoute("description is required".to_string()));
    }
    if desc.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(AppError::InvalidRoute(format!(
            "description longer than {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

/// Warn about targets that can cut off the host or local services.
pub fn dangerous_route_warning(target: &str) -> Option<&'static str> {
    let ip = super::prefix::target_ip(target);
    if ip == "0.0.0.0" {
        Some("modifying the default route (0.0.0.0/0) may disconnect the host")
    } else if ip.starts_with("127.") {
        Some("modifying loopback routes may affect local services")
    } else if ip.starts_with("169.254.") {
        Some("modifying link-local routes may affect network discovery")
    } else if ip.starts_with("224.") || ip.starts_with("239.") {
        Some("modifying multicast routes may affect multicast services")
    } else {
        None
    }
}

/// Field-level checks on a configured route. Interface membership is checked by the diff.
pub fn validate_route(route: &Route) -> AppResult<TargetKind> {
    let kind = validate_target(&route.target)?;
    if kind != TargetKind::Cidr && route.prefix_length > 32 {
        return Err(AppError::InvalidPrefix(route.prefix_length.to_string()));
    }
    validate_metric(route.metric)?;
    validate_description(&route.description, false)?;
    Ok(kind)
}

/// Operator warnings for an enabled route, checked before a diff is applied.
pub fn route_warnings(route: &Route, interface: Option<&NetworkInterface>) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Err(e) = validate_route(route) {
        warnings.push(e.user_message());
    }
    if let Some(warning) = dangerous_route_warning(&route.target) {
        warnings.push(warning.to_string());
    }
    if let Some(iface) = interface
        && let (Some(ip), Some(mask)) = (iface.ip_address, iface.subnet_mask)
        && !route.gateway.is_unspecified()
        && let Err(e) = validate_gateway(route.gateway, ip, mask)
    {
        warnings.push(e.to_string());
    }
    warnings
}

/// Resolve a domain name to its IPv4 addresses, deduplicated and sorted.
pub async fn resolve_domain(domain: &str) -> AppResult<Vec<Ipv4Addr>> {
    let addrs = tokio::net::lookup_host((domain, 0))
        .await
        .map_err(|e| AppError::Resolution(format!("{}: {}", domain, e)))?;

    let ips: BTreeSet<Ipv4Addr> = addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();

    if ips.is_empty() {
        return Err(AppError::Resolution(format!(
            "{}: no IPv4 address returned",
            domain
        )));
    }
    Ok(ips.into_iter().collect())
}
