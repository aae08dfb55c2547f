// Interface directory built from a single interface query

use std::collections::HashMap;

use super::{NetworkInterface, SystemRoute};

/// Immutable name/index view over one interface snapshot.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDirectory {
    interfaces: Vec<NetworkInterface>,
    by_name: HashMap<String, usize>,
    by_index: HashMap<u32, usize>,
}

impl InterfaceDirectory {
    pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_index = HashMap::new();
        for (i, iface) in interfaces.iter().enumerate() {
            by_name.insert(iface.name.clone(), i);
            by_index.insert(iface.interface_index, i);
        }
        InterfaceDirectory {
            interfaces,
            by_name,
            by_index,
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<&NetworkInterface> {
        self.by_name.get(name).map(|&i| &self.interfaces[i])
    }

    pub fn get_by_index(&self, index: u32) -> Option<&NetworkInterface> {
        self.by_index.get(&index).map(|&i| &self.interfaces[i])
    }

    pub fn all(&self) -> &[NetworkInterface] {
        &self.interfaces
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

const FULL_TUNNEL_HALVES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// Detect a WireGuard full tunnel: a tunnel interface carrying 0.0.0.0/1 or 128.0.0.0/1.
///
/// `name_match` is the configured tunnel-name fragment; names containing
/// "wireguard" always qualify. Returns an operator warning when detected.
pub fn detect_full_tunnel(
    interfaces: &InterfaceDirectory,
    routes: &[SystemRoute],
    name_match: &str,
) -> Option<String> {
    let name_match = name_match.to_lowercase();
    let tunnel = interfaces.all().iter().find(|iface| {
        let name = iface.name.to_lowercase();
        name.contains("wireguard") || (!name_match.is_empty() && name.contains(&name_match))
    })?;

    let captured = routes.iter().any(|r| {
        FULL_TUNNEL_HALVES.contains(&r.destination_prefix.as_str())
            && r.interface_index == tunnel.interface_index
    });

    captured.then(|| {
        format!(
            "WireGuard full tunnel detected on interface '{}'. Use /32 or exact CIDR routes for direct-path exceptions.",
            tunnel.name
        )
    })
}
