// Diff engine - classify desired routes against a system snapshot

use std::collections::{HashMap, HashSet};

use super::{DiffAction, DiffItem, DiffPlan};
use crate::error::AppResult;
use crate::routes::interfaces::InterfaceDirectory;
use crate::routes::{Route, SystemRoute};
use crate::system::RouteSource;

pub const REASON_DISABLED: &str = "not enabled";
pub const REASON_NEW: &str = "new route";
pub const REASON_UNCHANGED: &str = "already present, unchanged";
pub const REASON_ORPHAN: &str = "present in system, absent from configuration";

/// Fetch fresh interface and route snapshots, then diff against them.
///
/// A failed fetch aborts the whole call; nothing is partially computed.
pub async fn generate_diff<S>(source: &S, desired: &[Route]) -> AppResult<DiffPlan>
where
    S: RouteSource + ?Sized,
{
    let system = source.query_system_routes().await.inspect_err(|e| {
        tracing::error!("Failed to refresh system routes: {}", e);
    })?;
    let interfaces = source.query_network_interfaces().await.inspect_err(|e| {
        tracing::error!("Failed to refresh network interfaces: {}", e);
    })?;

    let plan = compute_diff(desired, &system, &InterfaceDirectory::new(interfaces));
    let stats = plan.stats();
    tracing::info!(
        "Diff generated: {} item(s) ({} add, {} change, {} delete, {} skip)",
        stats.total,
        stats.add,
        stats.change,
        stats.delete,
        stats.skip
    );
    Ok(plan)
}

/// System routes keyed by destination prefix, in table order.
///
/// Duplicate prefixes keep their first position and the last-seen value.
fn index_system_routes(system: &[SystemRoute]) -> (Vec<(String, &SystemRoute)>, HashMap<String, usize>) {
    let mut ordered: Vec<(String, &SystemRoute)> = Vec::with_capacity(system.len());
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(system.len());

    for route in system {
        let key = route.key();
        match positions.get(&key) {
            Some(&i) => ordered[i].1 = route,
            None => {
                positions.insert(key.clone(), ordered.len());
                ordered.push((key, route));
            }
        }
    }

    (ordered, positions)
}

/// Classify every desired route, then emit deletes for unclaimed `NetMgmt` routes.
pub fn compute_diff(
    desired: &[Route],
    system: &[SystemRoute],
    interfaces: &InterfaceDirectory,
) -> DiffPlan {
    let (ordered, positions) = index_system_routes(system);
    let mut items = Vec::with_capacity(desired.len());

    for route in desired {
        items.push(classify(route, &ordered, &positions, interfaces));
    }

    // Disabled routes do not protect their system counterpart
    let claimed: HashSet<String> = desired
        .iter()
        .filter(|r| r.enabled)
        .filter_map(|r| r.destination().ok())
        .map(|p| p.to_string())
        .collect();

    for (key, sys) in &ordered {
        if !sys.protocol.is_net_mgmt() || claimed.contains(key) {
            continue;
        }
        items.push(DiffItem {
            action: DiffAction::Delete,
            route: Route::placeholder_for(sys),
            old_system_route: Some((*sys).clone()),
            reason: REASON_ORPHAN.to_string(),
        });
    }

    DiffPlan { items }
}

fn classify(
    route: &Route,
    ordered: &[(String, &SystemRoute)],
    positions: &HashMap<String, usize>,
    interfaces: &InterfaceDirectory,
) -> DiffItem {
    if !route.enabled {
        return DiffItem::skip(route.clone(), REASON_DISABLED);
    }

    let Some(interface) = interfaces.get_by_name(&route.interface_name) else {
        return DiffItem::skip(
            route.clone(),
            format!("interface not found: {}", route.interface_name),
        );
    };

    let destination = match route.destination() {
        Ok(p) => p.to_string(),
        Err(e) => return DiffItem::skip(route.clone(), format!("invalid destination: {}", e)),
    };

    let mut resolved = route.clone();
    resolved.if_index = interface.interface_index;

    let Some(sys) = positions.get(&destination).map(|&i| ordered[i].1) else {
        return DiffItem {
            action: DiffAction::Add,
            route: resolved,
            old_system_route: None,
            reason: REASON_NEW.to_string(),
        };
    };

    match describe_changes(sys, &resolved) {
        Some(reason) => DiffItem {
            action: DiffAction::Change,
            route: resolved,
            old_system_route: Some(sys.clone()),
            reason,
        },
        None => DiffItem::skip(resolved, REASON_UNCHANGED),
    }
}

/// Name each differing field, or `None` when gateway, metric and interface all match.
fn describe_changes(sys: &SystemRoute, route: &Route) -> Option<String> {
    let mut changes = Vec::new();
    if sys.next_hop != route.gateway {
        changes.push(format!("gateway {} -> {}", sys.next_hop, route.gateway));
    }
    if sys.route_metric != route.metric {
        changes.push(format!("metric {} -> {}", sys.route_metric, route.metric));
    }
    if sys.interface_index != route.if_index {
        changes.push(format!("interface {} -> {}", sys.interface_index, route.if_index));
    }

    if changes.is_empty() {
        None
    } else {
        Some(format!("changed: {}", changes.join(", ")))
    }
}
