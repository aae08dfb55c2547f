mod config;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use config::{Command, Config, ProfileCommand, SnapshotCommand};
use route_reconciler::error::AppError;
use route_reconciler::profile::{Profile, ProfileStore};
use route_reconciler::reconcile::apply::ApplyReport;
use route_reconciler::reconcile::{DiffAction, DiffPlan, Reconciler, record_outcomes};
use route_reconciler::routes::interfaces::{InterfaceDirectory, detect_full_tunnel};
use route_reconciler::routes::lookup::RouteTable;
use route_reconciler::routes::validator::route_warnings;
use route_reconciler::routes::{Route, SystemRoute};
use route_reconciler::snapshot::{Snapshot, SnapshotStore};
use route_reconciler::system::RouteSource;
use route_reconciler::system::windows::{CommandTimeouts, WindowsHost};
use route_reconciler::verify::VerifyManager;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::from(2);
    }
    tracing::debug!("Configuration: {:?}", config);

    let app = match App::new(config) {
        Ok(app) => app,
        Err(e) => return report_error(e.into()),
    };

    match app.run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => report_error(e),
    }
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Ok(())
}

fn report_error(e: anyhow::Error) -> ExitCode {
    tracing::error!("{:#}", e);
    match e.downcast_ref::<AppError>() {
        Some(app_error) => {
            eprintln!("Error: {}", app_error.user_message());
            if app_error.is_retryable() {
                eprintln!("This may be temporary, run the command again.");
            }
        }
        None => eprintln!("Error: {:#}", e),
    }
    ExitCode::FAILURE
}

struct App {
    config: Config,
    profiles: ProfileStore,
    snapshots: SnapshotStore,
    reconciler: Reconciler<WindowsHost>,
}

impl App {
    fn new(config: Config) -> Result<Self, AppError> {
        let host = WindowsHost::new(CommandTimeouts {
            powershell: config.powershell_timeout,
            route: config.route_timeout,
        });
        Ok(App {
            profiles: ProfileStore::new(&config.profiles_dir)?,
            snapshots: SnapshotStore::new(&config.snapshots_dir)?,
            reconciler: Reconciler::new(host),
            config,
        })
    }

    fn host(&self) -> &WindowsHost {
        self.reconciler.host()
    }

    async fn run(&self) -> anyhow::Result<bool> {
        match self.config.command.clone() {
            Command::Interfaces => self.show_interfaces().await,
            Command::Routes { all } => self.show_routes(all).await,
            Command::Diff => self.diff().await,
            Command::Apply { yes, no_snapshot } => self.apply(yes, no_snapshot).await,
            Command::Snapshot { action } => self.snapshot(action).await,
            Command::Verify { targets, trace } => self.verify(targets, trace).await,
            Command::Profile { action } => self.profile(action),
        }
    }

    async fn show_interfaces(&self) -> anyhow::Result<bool> {
        let interfaces = self.host().query_network_interfaces().await?;
        println!("{:>5}  {:<28} {:<8} {:<18} {:<15} MAC", "Index", "Name", "Status", "Address", "Gateway");
        for iface in &interfaces {
            let address = iface
                .ip_address
                .map(|ip| format!("{}/{}", ip, iface.prefix_length))
                .unwrap_or_default();
            let gateway = iface.gateway.map(|g| g.to_string()).unwrap_or_default();
            println!(
                "{:>5}  {:<28} {:<8} {:<18} {:<15} {}",
                iface.interface_index, iface.name, iface.status, address, gateway, iface.mac_address
            );
        }
        Ok(true)
    }

    async fn show_routes(&self, all: bool) -> anyhow::Result<bool> {
        let routes = self.host().query_system_routes().await?;
        println!("{:<20} {:<16} {:>5} {:>7}  Protocol", "Destination", "Next hop", "If", "Metric");
        for route in routes.iter().filter(|r| all || r.protocol.is_net_mgmt()) {
            println!(
                "{:<20} {:<16} {:>5} {:>7}  {}",
                route.destination_prefix,
                route.next_hop,
                route.interface_index,
                route.route_metric,
                route.protocol
            );
        }
        Ok(true)
    }

    /// Load the active profile and expand domain targets.
    async fn desired_routes(&self) -> anyhow::Result<(Profile, Vec<Route>)> {
        let mut profile = self.profiles.load_profile(&self.config.profile)?;
        let desired = profile.expand_targets().await;
        Ok((profile, desired))
    }

    /// Print validation and full-tunnel warnings. Nothing here blocks an apply.
    async fn preflight(&self, profile: &Profile, desired: &[Route]) {
        let interfaces = match self.host().query_network_interfaces().await {
            Ok(list) => InterfaceDirectory::new(list),
            Err(e) => {
                tracing::warn!("Skipping pre-apply checks: {}", e);
                return;
            }
        };

        for route in desired.iter().filter(|r| r.enabled) {
            let iface = interfaces.get_by_name(&route.interface_name);
            for warning in route_warnings(route, iface) {
                println!("warning: {}: {}", route.target, warning);
            }
        }

        let wireguard = &profile.interface_policy.wireguard;
        if wireguard.full_tunnel_guard {
            match self.host().query_system_routes().await {
                Ok(system) => {
                    if let Some(warning) = detect_full_tunnel(&interfaces, &system, &wireguard.name_match) {
                        println!("warning: {}", warning);
                    }
                }
                Err(e) => tracing::warn!("Skipping full tunnel check: {}", e),
            }
        }
    }

    async fn diff(&self) -> anyhow::Result<bool> {
        let (profile, desired) = self.desired_routes().await?;
        self.preflight(&profile, &desired).await;
        let plan = self.reconciler.generate_diff(&desired).await?;
        print_plan(&plan);
        Ok(true)
    }

    async fn apply(&self, yes: bool, no_snapshot: bool) -> anyhow::Result<bool> {
        let (mut profile, desired) = self.desired_routes().await?;

        if !no_snapshot {
            match self.snapshots.create_system_snapshot(self.host()).await {
                Ok(path) => println!("Snapshot: {}", path.display()),
                Err(e) => tracing::warn!("Pre-apply snapshot failed, continuing: {}", e),
            }
        }

        self.preflight(&profile, &desired).await;
        let plan = self.reconciler.generate_diff(&desired).await?;
        print_plan(&plan);

        let items = plan.actionable();
        if items.is_empty() {
            println!("Nothing to apply.");
            return Ok(true);
        }
        if !yes && !confirm(&format!("Apply {} change(s)?", items.len())).await? {
            println!("Aborted.");
            return Ok(true);
        }

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping after the current step");
                    cancel.cancel();
                }
            }
        });

        let report = self.reconciler.execute_diff(&items, &cancel).await;
        watcher.abort();
        print_report(&report);

        record_outcomes(&mut profile.routes, &plan, &report);
        let path = self.profiles.save_profile(&mut profile)?;
        if let Err(e) = self.snapshots.create_config_snapshot(&path) {
            tracing::warn!("Config snapshot failed: {}", e);
        }

        Ok(report.all_succeeded)
    }

    async fn snapshot(&self, action: SnapshotCommand) -> anyhow::Result<bool> {
        match action {
            SnapshotCommand::Create => {
                let path = self.snapshots.create_system_snapshot(self.host()).await?;
                println!("{}", path.display());
            }
            SnapshotCommand::List => {
                for info in self.snapshots.list_snapshots()? {
                    println!(
                        "{:<48} {:<7} {:>6} routes  {}",
                        info.filename, info.kind, info.total_routes, info.timestamp
                    );
                }
            }
            SnapshotCommand::Prune { file } => {
                let path = self.snapshot_path(&file);
                if let Snapshot::Config(_) = self.snapshots.load_snapshot(&path)? {
                    anyhow::bail!("{} is a config snapshot", path.display());
                }
                println!("Pruning deletes tool-owned routes absent from the snapshot.");
                println!("It does not re-add or change routes back.");

                let report = self
                    .reconciler
                    .prune_routes_not_in_snapshot(&self.snapshots, &path)
                    .await?;
                for prefix in &report.deleted {
                    println!("  deleted      {}", prefix);
                }
                for error in &report.errors {
                    println!("  failed       {}", error);
                }
                for prefix in &report.not_restored {
                    println!("  not restored {}", prefix);
                }
                return Ok(report.is_clean());
            }
            SnapshotCommand::Delete { file } => {
                self.snapshots.delete_snapshot(&self.snapshot_path(&file))?;
            }
            SnapshotCommand::Cleanup { keep } => {
                let keep = keep.unwrap_or(self.config.snapshot_keep);
                let removed = self.snapshots.cleanup_old_snapshots(keep)?;
                println!("Removed {} snapshot(s), kept up to {}", removed, keep);
            }
        }
        Ok(true)
    }

    /// Bare file names resolve inside the snapshots directory.
    fn snapshot_path(&self, file: &Path) -> PathBuf {
        if file.exists() {
            file.to_path_buf()
        } else {
            self.snapshots.dir().join(file)
        }
    }

    async fn verify(&self, targets: Vec<String>, trace: bool) -> anyhow::Result<bool> {
        let (profile, desired) = self.desired_routes().await?;
        let targets = if targets.is_empty() {
            desired
                .iter()
                .filter(|r| r.enabled)
                .map(Route::destination_label)
                .collect()
        } else {
            targets
        };
        if targets.is_empty() {
            println!("No enabled routes to verify.");
            return Ok(true);
        }

        let trace = trace || profile.defaults.verify.trace;
        let system: Vec<SystemRoute> = self.host().query_system_routes().await.unwrap_or_else(|e| {
            tracing::warn!("Route table unavailable for prediction: {}", e);
            Vec::new()
        });
        let table = RouteTable::new(&system);

        let manager = VerifyManager::new(self.host(), self.config.trace_timeout);
        let results = manager.verify_routes(&targets, trace).await;

        let mut all_passed = true;
        for result in &results {
            let expected = route_reconciler::routes::prefix::target_ip(&result.target)
                .parse()
                .ok()
                .and_then(|ip| table.lookup(ip))
                .map(|r| format!("{} via {}", r.destination_prefix, r.next_hop))
                .unwrap_or_else(|| "-".to_string());

            if result.passed() {
                println!(
                    "ok    {:<20} via {} if {} (table: {})",
                    result.target, result.gateway, result.interface, expected
                );
            } else {
                all_passed = false;
                println!("FAIL  {:<20} {} (table: {})", result.target, result.error, expected);
            }
            if result.trace_success {
                println!("      first hop {} in {} ms", result.first_hop, result.latency_ms);
            }
        }
        Ok(all_passed)
    }

    fn profile(&self, action: ProfileCommand) -> anyhow::Result<bool> {
        match action {
            ProfileCommand::List => {
                for name in self.profiles.list_profiles()? {
                    let marker = if name == self.config.profile { "*" } else { " " };
                    println!("{} {}", marker, name);
                }
            }
            ProfileCommand::Show => {
                let profile = self.profiles.load_profile(&self.config.profile)?;
                println!("{}", serde_json::to_string_pretty(&profile)?);
            }
            ProfileCommand::Delete { name } => self.profiles.delete_profile(&name)?,
            ProfileCommand::Export { name, dest } => self.profiles.export_profile(&name, &dest)?,
            ProfileCommand::Import { src, name } => {
                let profile = self.profiles.import_profile(&src, &name)?;
                println!("Imported {} route(s) as {}", profile.routes.len(), profile.profile_name);
            }
        }
        Ok(true)
    }
}

async fn confirm(prompt: &str) -> anyhow::Result<bool> {
    println!("{} [y/N]", prompt);
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_plan(plan: &DiffPlan) {
    let stats = plan.stats();
    println!(
        "Plan: {} add, {} change, {} delete, {} skip",
        stats.add, stats.change, stats.delete, stats.skip
    );
    for item in &plan.items {
        println!(
            "  {:<7} {:<20} {}",
            item.action,
            item.route.destination_label(),
            item.reason
        );
    }
}

fn print_report(report: &ApplyReport) {
    println!("Results:");
    for step in &report.results {
        let status = if step.success { "ok" } else { "FAILED" };
        println!("  {:<7} {:<20} {:<7} {}", step.action, step.target, status, step.message);
    }

    if report.cancelled {
        println!("Apply was cancelled.");
    }

    if !report.rollback.is_empty() {
        let status = if report.rollback_clean() { "complete" } else { "INCOMPLETE" };
        println!("Rollback ({}):", status);
        for undo in &report.rollback {
            let status = if undo.success { "ok" } else { "FAILED" };
            println!("  {:<7} {:<20} {:<7} {}", undo.op, undo.target, status, undo.message);
        }
    } else if report
        .failed_step()
        .is_some_and(|step| step.action == DiffAction::Delete)
    {
        println!("Deletes are not rolled back; completed deletes remain in place.");
    }

    if report.all_succeeded {
        println!("All {} step(s) succeeded.", report.results.len());
    } else if let Some(step) = report.failed_step() {
        println!("Failed at {} {}: {}", step.action, step.target, step.message);
    }
}
