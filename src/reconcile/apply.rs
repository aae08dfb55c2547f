// Apply engine - three ordered phases with LIFO best-effort rollback

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{DiffAction, DiffItem};
use crate::error::{AppError, AppResult};
use crate::routes::{Route, SystemRoute};
use crate::system::{MutationOp, MutationOutcome, MutationRequest, RouteExecutor};

const PHASES: [DiffAction; 3] = [DiffAction::Delete, DiffAction::Change, DiffAction::Add];

/// Outcome of one forward step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub action: DiffAction,
    /// Destination prefix of the item
    pub target: String,
    pub success: bool,
    pub message: String,
    pub time: DateTime<Local>,
}

/// Outcome of one compensating call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub op: MutationOp,
    pub target: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub all_succeeded: bool,
    pub results: Vec<StepResult>,
    /// Compensations in the order they were issued (newest step first)
    pub rollback: Vec<RollbackOutcome>,
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.results.iter().find(|r| !r.success)
    }

    pub fn rollback_clean(&self) -> bool {
        self.rollback.iter().all(|r| r.success)
    }
}

/// The inverse of a step that already succeeded.
#[derive(Debug, Clone)]
pub struct RollbackAction {
    pub kind: MutationOp,
    pub route: Route,
    pub prior_system_route: Option<SystemRoute>,
}

impl RollbackAction {
    /// Undo a successful step: delete is undone by add, add by delete,
    /// change by change back to the prior values.
    fn for_step(item: &DiffItem) -> Option<Self> {
        let kind = match item.action {
            DiffAction::Delete => MutationOp::Add,
            DiffAction::Change => MutationOp::Change,
            DiffAction::Add => MutationOp::Delete,
            DiffAction::Skip => return None,
        };
        Some(RollbackAction {
            kind,
            route: item.route.clone(),
            prior_system_route: item.old_system_route.clone(),
        })
    }

    fn request(&self) -> AppResult<MutationRequest> {
        match self.kind {
            MutationOp::Delete => Ok(MutationRequest::delete(self.route.destination()?.network())),
            MutationOp::Add => {
                let prior = self.prior()?;
                Ok(MutationRequest::add(
                    prior.destination()?,
                    prior.next_hop,
                    prior.interface_index,
                    prior.route_metric,
                    true,
                ))
            }
            MutationOp::Change => {
                let prior = self.prior()?;
                Ok(MutationRequest::change(
                    prior.destination()?,
                    prior.next_hop,
                    prior.interface_index,
                    prior.route_metric,
                ))
            }
        }
    }

    fn prior(&self) -> AppResult<&SystemRoute> {
        self.prior_system_route.as_ref().ok_or_else(|| {
            AppError::InvalidRoute(format!(
                "no prior system route recorded for {}",
                self.route.destination_label()
            ))
        })
    }
}

/// Compensations for the current apply, drained newest first.
#[derive(Debug, Default)]
pub struct RollbackStack {
    actions: Vec<RollbackAction>,
}

impl RollbackStack {
    pub fn push(&mut self, action: RollbackAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn pop(&mut self) -> Option<RollbackAction> {
        self.actions.pop()
    }
}

/// Issue every pending compensation, newest first.
///
/// A failed compensation is logged and the next one is still attempted.
pub async fn rollback<E>(executor: &E, mut stack: RollbackStack) -> Vec<RollbackOutcome>
where
    E: RouteExecutor + ?Sized,
{
    if stack.is_empty() {
        return Vec::new();
    }
    tracing::warn!("Rolling back {} completed step(s)", stack.len());

    let mut outcomes = Vec::with_capacity(stack.len());
    while let Some(action) = stack.pop() {
        let target = action.route.destination_label();
        let outcome = match action.request() {
            Ok(request) => executor.mutate_route(&request).await,
            Err(e) => MutationOutcome::failed(e.to_string()),
        };

        if outcome.success {
            tracing::info!("Rollback {} {}: ok", action.kind, target);
        } else {
            tracing::error!("Rollback {} {} failed: {}", action.kind, target, outcome.message);
        }

        outcomes.push(RollbackOutcome {
            op: action.kind,
            target,
            success: outcome.success,
            message: outcome.message,
        });
    }
    outcomes
}

fn forward_request(item: &DiffItem) -> AppResult<MutationRequest> {
    let route = &item.route;
    match item.action {
        DiffAction::Delete => {
            let prefix = match &item.old_system_route {
                Some(sys) => sys.destination()?,
                None => route.destination()?,
            };
            Ok(MutationRequest::delete(prefix.network()))
        }
        DiffAction::Change => Ok(MutationRequest::change(
            route.destination()?,
            route.gateway,
            route.if_index,
            route.metric,
        )),
        DiffAction::Add => Ok(MutationRequest::add(
            route.destination()?,
            route.gateway,
            route.if_index,
            route.metric,
            route.persistent,
        )),
        DiffAction::Skip => Err(AppError::InvalidRoute("skip items are not executed".to_string())),
    }
}

enum Halt {
    Failed(DiffAction),
    Cancelled,
}

async fn run_phases<E>(
    executor: &E,
    items: &[DiffItem],
    cancel: &CancellationToken,
    results: &mut Vec<StepResult>,
    stack: &mut RollbackStack,
) -> Result<(), Halt>
where
    E: RouteExecutor + ?Sized,
{
    for phase in PHASES {
        let steps: Vec<&DiffItem> = items.iter().filter(|i| i.action == phase).collect();
        if steps.is_empty() {
            continue;
        }
        tracing::info!("Starting {} phase: {} item(s)", phase, steps.len());

        for item in steps {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }

            let target = item.route.destination_label();
            let outcome = match forward_request(item) {
                Ok(request) => executor.mutate_route(&request).await,
                Err(e) => MutationOutcome::failed(e.to_string()),
            };

            results.push(StepResult {
                action: phase,
                target: target.clone(),
                success: outcome.success,
                message: outcome.message.clone(),
                time: Local::now(),
            });

            if !outcome.success {
                tracing::error!("{} {} failed: {}", phase, target, outcome.message);
                return Err(Halt::Failed(phase));
            }
            tracing::info!("{} {}: ok", phase, target);

            if let Some(action) = RollbackAction::for_step(item) {
                stack.push(action);
            }
        }
    }
    Ok(())
}

/// Execute a plan: all deletes, then all changes, then all adds.
///
/// A failed delete stops the delete phase without touching earlier deletes.
/// A failed change or add rolls back every completed step. Cancellation is
/// checked before each step and rolls back whatever already ran. Skip items
/// are ignored. This never fails; the outcome is in the report.
pub async fn execute_diff<E>(executor: &E, items: &[DiffItem], cancel: &CancellationToken) -> ApplyReport
where
    E: RouteExecutor + ?Sized,
{
    let mut report = ApplyReport::default();
    let mut stack = RollbackStack::default();

    match run_phases(executor, items, cancel, &mut report.results, &mut stack).await {
        Ok(()) => {
            report.all_succeeded = true;
            tracing::info!("Apply finished: {} step(s) succeeded", report.results.len());
        }
        Err(Halt::Failed(DiffAction::Delete)) => {
            tracing::warn!(
                "Delete phase stopped after {} successful delete(s); deletes are not rolled back",
                stack.len()
            );
        }
        Err(Halt::Failed(_)) => {
            report.rollback = rollback(executor, stack).await;
        }
        Err(Halt::Cancelled) => {
            tracing::warn!("Apply cancelled after {} step(s)", report.results.len());
            report.cancelled = true;
            report.rollback = rollback(executor, stack).await;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::NetworkInterface;
    use crate::system::fake::{FakeHost, net_mgmt};
    use std::net::Ipv4Addr;

    fn route(target: &str) -> Route {
        Route {
            target: target.to_string(),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            interface_name: "Eth0".to_string(),
            if_index: 12,
            metric: 5,
            ..Route::default()
        }
    }

    fn add(target: &str) -> DiffItem {
        DiffItem {
            action: DiffAction::Add,
            route: route(target),
            old_system_route: None,
            reason: "new route".to_string(),
        }
    }

    fn change(target: &str, old: SystemRoute) -> DiffItem {
        DiffItem {
            action: DiffAction::Change,
            route: route(target),
            old_system_route: Some(old),
            reason: "changed: gateway".to_string(),
        }
    }

    fn delete(old: SystemRoute) -> DiffItem {
        DiffItem {
            action: DiffAction::Delete,
            route: Route::placeholder_for(&old),
            old_system_route: Some(old),
            reason: "present in system, absent from configuration".to_string(),
        }
    }

    fn host(routes: Vec<SystemRoute>) -> FakeHost {
        FakeHost::new(vec![NetworkInterface::new("Eth0", 12)], routes)
    }

    #[tokio::test]
    async fn test_phase_order_delete_change_add() {
        let old = net_mgmt("10.1.0.0/16", "192.168.1.99", 12, 5);
        let orphan = net_mgmt("172.16.0.0/12", "192.168.1.1", 12, 5);
        let host = host(vec![old.clone(), orphan.clone()]);

        // Deliberately scrambled plan order
        let items = vec![add("10.0.0.0/24"), change("10.1.0.0/16", old), delete(orphan)];
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;

        assert!(report.all_succeeded);
        assert!(report.rollback.is_empty());
        assert_eq!(
            host.call_log(),
            vec!["delete 172.16.0.0", "change 10.1.0.0", "add 10.0.0.0"]
        );
        let actions: Vec<DiffAction> = report.results.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![DiffAction::Delete, DiffAction::Change, DiffAction::Add]);
    }

    #[tokio::test]
    async fn test_change_failure_rolls_back_in_reverse() {
        let d1 = net_mgmt("172.16.0.0/12", "192.168.1.1", 12, 5);
        let d2 = net_mgmt("172.20.0.0/16", "192.168.1.1", 12, 7);
        let c1 = net_mgmt("10.1.0.0/16", "192.168.1.99", 12, 5);
        let c2 = net_mgmt("10.2.0.0/16", "192.168.1.99", 12, 5);
        let host = host(vec![d1.clone(), d2.clone(), c1.clone(), c2.clone()]);
        host.fail_on(MutationOp::Change, "10.2.0.0");

        let items = vec![
            change("10.1.0.0/16", c1.clone()),
            change("10.2.0.0/16", c2),
            add("10.0.0.0/24"),
            delete(d1.clone()),
            delete(d2.clone()),
        ];
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;

        assert!(!report.all_succeeded);
        assert!(!report.cancelled);
        assert_eq!(
            host.call_log(),
            vec![
                "delete 172.16.0.0",
                "delete 172.20.0.0",
                "change 10.1.0.0",
                "change 10.2.0.0",
                // compensations
                "change 10.1.0.0",
                "add 172.20.0.0",
                "add 172.16.0.0",
            ]
        );
        assert_eq!(report.rollback.len(), 3);
        assert!(report.rollback_clean());
        assert_eq!(report.failed_step().unwrap().target, "10.2.0.0/16");

        // The add phase never started
        assert!(!report.results.iter().any(|r| r.action == DiffAction::Add));

        // Prior values restored
        let mut restored = host.routes();
        restored.sort_by(|a, b| a.destination_prefix.cmp(&b.destination_prefix));
        let c1_now = restored.iter().find(|r| r.key() == "10.1.0.0/16").unwrap();
        assert_eq!(c1_now.next_hop, c1.next_hop);
        let d2_now = restored.iter().find(|r| r.key() == "172.20.0.0/16").unwrap();
        assert_eq!(d2_now.route_metric, 7);
        assert!(restored.iter().any(|r| r.key() == "172.16.0.0/12"));
    }

    #[tokio::test]
    async fn test_compensating_requests_use_prior_values() {
        let d1 = net_mgmt("172.16.0.0/12", "10.9.9.9", 7, 40);
        let host = host(vec![d1.clone()]);
        host.fail_on(MutationOp::Add, "10.0.0.0");

        let items = vec![delete(d1), add("10.0.0.0/24")];
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;
        assert!(!report.all_succeeded);

        let calls = host.calls();
        let readd = calls.last().unwrap();
        assert_eq!(readd.op, MutationOp::Add);
        assert_eq!(readd.target, Ipv4Addr::new(172, 16, 0, 0));
        assert_eq!(readd.subnet_mask, Some(Ipv4Addr::new(255, 240, 0, 0)));
        assert_eq!(readd.gateway, Some(Ipv4Addr::new(10, 9, 9, 9)));
        assert_eq!(readd.interface_index, Some(7));
        assert_eq!(readd.metric, Some(40));
        assert!(readd.persistent);
    }

    #[tokio::test]
    async fn test_rollback_is_best_effort() {
        let d1 = net_mgmt("172.16.0.0/12", "192.168.1.1", 12, 5);
        let host = host(vec![d1.clone()]);
        host.fail_on(MutationOp::Add, "10.0.0.2");
        // Undoing the first add fails; the rest must still be attempted
        host.fail_on(MutationOp::Delete, "10.0.0.1");

        let items = vec![
            delete(d1),
            add("10.0.0.0/24"),
            add("10.0.0.1/32"),
            add("10.0.0.2/32"),
        ];
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;

        assert!(!report.all_succeeded);
        assert_eq!(report.rollback.len(), 3);
        assert!(!report.rollback[0].success);
        assert!(report.rollback[1].success);
        assert!(report.rollback[2].success);
        assert!(!report.rollback_clean());
        assert_eq!(
            &host.call_log()[4..],
            &["delete 10.0.0.1", "delete 10.0.0.0", "add 172.16.0.0"]
        );
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_roll_back_prior_deletes() {
        let d1 = net_mgmt("172.16.0.0/12", "192.168.1.1", 12, 5);
        let d2 = net_mgmt("172.20.0.0/16", "192.168.1.1", 12, 5);
        let d3 = net_mgmt("172.30.0.0/16", "192.168.1.1", 12, 5);
        let host = host(vec![d1.clone(), d2.clone(), d3.clone()]);
        host.fail_on(MutationOp::Delete, "172.20.0.0");

        let items = vec![delete(d1), delete(d2), delete(d3), add("10.0.0.0/24")];
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;

        assert!(!report.all_succeeded);
        assert!(report.rollback.is_empty());
        assert_eq!(host.call_log(), vec!["delete 172.16.0.0", "delete 172.20.0.0"]);
        assert_eq!(report.results.len(), 2);
        assert!(!host.routes().iter().any(|r| r.key() == "172.16.0.0/12"));
    }

    #[tokio::test]
    async fn test_stale_snapshot_surfaces_as_step_failure() {
        let old = net_mgmt("10.1.0.0/16", "192.168.1.99", 12, 5);
        let host = host(vec![old.clone()]);
        let items = vec![add("10.0.0.0/24"), change("10.1.0.0/16", old)];

        // Another actor removes the route between diff and apply
        host.set_routes(vec![]);
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;

        assert!(!report.all_succeeded);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].action, DiffAction::Change);
        assert!(report.rollback.is_empty());
        assert_eq!(host.call_log(), vec!["change 10.1.0.0"]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_issues_nothing() {
        let host = host(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = execute_diff(&host, &[add("10.0.0.0/24")], &cancel).await;
        assert!(report.cancelled);
        assert!(!report.all_succeeded);
        assert!(report.results.is_empty());
        assert!(host.calls().is_empty());
    }

    struct CancellingExecutor {
        inner: FakeHost,
        cancel: CancellationToken,
        after: usize,
    }

    #[async_trait::async_trait]
    impl RouteExecutor for CancellingExecutor {
        async fn mutate_route(&self, request: &MutationRequest) -> MutationOutcome {
            let outcome = self.inner.mutate_route(request).await;
            if self.inner.calls().len() == self.after {
                self.cancel.cancel();
            }
            outcome
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_phase_rolls_back_issued_steps() {
        let cancel = CancellationToken::new();
        let executor = CancellingExecutor {
            inner: host(vec![]),
            cancel: cancel.clone(),
            after: 2,
        };

        let items = vec![add("10.0.0.0/24"), add("10.0.1.0/24"), add("10.0.2.0/24")];
        let report = execute_diff(&executor, &items, &cancel).await;

        assert!(report.cancelled);
        assert!(!report.all_succeeded);
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.success));
        assert_eq!(
            executor.inner.call_log(),
            vec!["add 10.0.0.0", "add 10.0.1.0", "delete 10.0.1.0", "delete 10.0.0.0"]
        );
        assert!(executor.inner.routes().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_deletes_re_adds_deleted_route() {
        let d1 = net_mgmt("172.16.0.0/12", "10.9.9.9", 7, 40);
        let d2 = net_mgmt("172.20.0.0/16", "192.168.1.1", 12, 5);
        let cancel = CancellationToken::new();
        let executor = CancellingExecutor {
            inner: host(vec![d1.clone(), d2.clone()]),
            cancel: cancel.clone(),
            after: 1,
        };

        let items = vec![delete(d1.clone()), delete(d2.clone()), add("10.0.0.0/24")];
        let report = execute_diff(&executor, &items, &cancel).await;

        assert!(report.cancelled);
        assert!(!report.all_succeeded);
        assert_eq!(report.results.len(), 1);
        assert_eq!(
            executor.inner.call_log(),
            vec!["delete 172.16.0.0", "add 172.16.0.0"]
        );
        assert_eq!(report.rollback.len(), 1);
        assert!(report.rollback_clean());

        let calls = executor.inner.calls();
        let readd = &calls[1];
        assert_eq!(readd.op, MutationOp::Add);
        assert_eq!(readd.gateway, Some(d1.next_hop));
        assert_eq!(readd.metric, Some(40));
        assert_eq!(readd.interface_index, Some(7));

        let now = executor.inner.routes();
        assert_eq!(now.len(), 2);
        assert!(now.iter().any(|r| r.key() == "172.16.0.0/12"));
        assert!(now.iter().any(|r| r.key() == "172.20.0.0/16"));
    }

    #[tokio::test]
    async fn test_skip_items_are_ignored() {
        let host = host(vec![]);
        let items = vec![DiffItem::skip(route("10.0.0.0/24"), "not enabled")];
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;

        assert!(report.all_succeeded);
        assert!(report.results.is_empty());
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_route_fails_step_and_rolls_back() {
        let host = host(vec![]);
        let items = vec![add("10.0.0.0/24"), add("not-an-address")];
        let report = execute_diff(&host, &items, &CancellationToken::new()).await;

        assert!(!report.all_succeeded);
        assert_eq!(report.results.len(), 2);
        assert!(!report.results[1].success);
        assert_eq!(host.call_log(), vec!["add 10.0.0.0", "delete 10.0.0.0"]);
    }

    #[test]
    fn test_rollback_stack_is_lifo() {
        let mut stack = RollbackStack::default();
        for target in ["10.0.0.0/24", "10.0.1.0/24"] {
            stack.push(RollbackAction::for_step(&add(target)).unwrap());
        }
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop().unwrap().route.target, "10.0.1.0/24");
        assert_eq!(stack.pop().unwrap().route.target, "10.0.0.0/24");
        assert!(stack.pop().is_none());
    }
}
