// Reconcile module - diff desired routes against the system and apply the plan

pub mod apply;
pub mod diff;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppResult;
use crate::routes::{Route, SystemRoute};
use crate::snapshot::{PruneReport, SnapshotStore};
use crate::system::{RouteExecutor, RouteSource};
use apply::{ApplyReport, RollbackOutcome, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Add,
    Change,
    Delete,
    Skip,
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            DiffAction::Add => "add",
            DiffAction::Change => "change",
            DiffAction::Delete => "delete",
            DiffAction::Skip => "skip",
        })
    }
}

/// One classified route in a diff plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffItem {
    pub action: DiffAction,
    pub route: Route,
    pub old_system_route: Option<SystemRoute>,
    pub reason: String,
}

impl DiffItem {
    pub fn skip(route: Route, reason: impl Into<String>) -> Self {
        DiffItem {
            action: DiffAction::Skip,
            route,
            old_system_route: None,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub total: usize,
    pub add: usize,
    pub change: usize,
    pub delete: usize,
    pub skip: usize,
}

/// Items in input order for add/change/skip, followed by deletes in table order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffPlan {
    pub items: Vec<DiffItem>,
}

impl DiffPlan {
    pub fn stats(&self) -> DiffStats {
        let mut stats = DiffStats {
            total: self.items.len(),
            ..DiffStats::default()
        };
        for item in &self.items {
            match item.action {
                DiffAction::Add => stats.add += 1,
                DiffAction::Change => stats.change += 1,
                DiffAction::Delete => stats.delete += 1,
                DiffAction::Skip => stats.skip += 1,
            }
        }
        stats
    }

    /// Everything except skips, in plan order.
    pub fn actionable(&self) -> Vec<DiffItem> {
        self.items
            .iter()
            .filter(|item| item.action != DiffAction::Skip)
            .cloned()
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.items.iter().all(|item| item.action == DiffAction::Skip)
    }
}

/// Audit entry for one fully successful apply, kept for the session only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Local>,
    pub total_items: usize,
    pub all_succeeded: bool,
    pub results: Vec<StepResult>,
    pub rollback_log: Vec<RollbackOutcome>,
}

impl ExecutionRecord {
    fn from_report(total_items: usize, report: &ApplyReport) -> Self {
        ExecutionRecord {
            id: Uuid::new_v4(),
            timestamp: Local::now(),
            total_items,
            all_succeeded: report.all_succeeded,
            results: report.results.clone(),
            rollback_log: report.rollback.clone(),
        }
    }
}

/// Serialises every diff, apply and prune against one host.
///
/// The history mutex doubles as the single-flight guard, so no two
/// reconciliation cycles touch the routing table at once.
pub struct Reconciler<H> {
    host: H,
    history: Mutex<Vec<ExecutionRecord>>,
}

impl<H> Reconciler<H>
where
    H: RouteSource + RouteExecutor,
{
    pub fn new(host: H) -> Self {
        Reconciler {
            host,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub async fn generate_diff(&self, desired: &[Route]) -> AppResult<DiffPlan> {
        let _guard = self.history.lock().await;
        diff::generate_diff(&self.host, desired).await
    }

    pub async fn execute_diff(&self, items: &[DiffItem], cancel: &CancellationToken) -> ApplyReport {
        let mut history = self.history.lock().await;
        let report = apply::execute_diff(&self.host, items, cancel).await;
        if report.all_succeeded {
            history.push(ExecutionRecord::from_report(items.len(), &report));
        }
        report
    }

    pub async fn prune_routes_not_in_snapshot(
        &self,
        store: &SnapshotStore,
        path: &Path,
    ) -> AppResult<PruneReport> {
        let _guard = self.history.lock().await;
        store.prune_routes_not_in_snapshot(&self.host, path).await
    }

    pub async fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().await.clone()
    }
}

/// Stamp apply outcomes onto the desired routes they came from.
///
/// A route owns the plan items built from it: itself, or for a domain target
/// the `/32` routes it expanded to. Any failed step marks the route failed.
/// A step that succeeded but was undone by rollback reads "rolled back".
/// Routes the plan did not touch keep their previous outcome.
pub fn record_outcomes(routes: &mut [Route], plan: &DiffPlan, report: &ApplyReport) {
    let now = Local::now().format("%H:%M").to_string();

    for route in routes.iter_mut() {
        let owned: Vec<&DiffItem> = plan
            .items
            .iter()
            .filter(|item| item.action != DiffAction::Delete)
            .filter(|item| {
                let planned = &item.route;
                (planned.target == route.target && planned.interface_name == route.interface_name)
                    || planned.expanded_from(route)
            })
            .collect();

        let labels: Vec<String> = owned
            .iter()
            .filter(|item| matches!(item.action, DiffAction::Add | DiffAction::Change))
            .map(|item| item.route.destination_label())
            .collect();
        let steps: Vec<&StepResult> = report
            .results
            .iter()
            .filter(|r| matches!(r.action, DiffAction::Add | DiffAction::Change))
            .filter(|r| labels.contains(&r.target))
            .collect();

        let outcome = if let Some(failed) = steps.iter().find(|s| !s.success) {
            format!("failed: {}", failed.message)
        } else if !steps.is_empty() {
            if report.rollback.is_empty() {
                "ok".to_string()
            } else {
                "rolled back".to_string()
            }
        } else if let Some(item) = owned.iter().find(|item| item.action == DiffAction::Skip) {
            format!("skipped: {}", item.reason)
        } else {
            continue;
        };

        route.last_apply_result = outcome;
        route.last_apply_time = now.clone();
    }
}
