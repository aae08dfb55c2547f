// Snapshot store - point-in-time captures of the route table and profiles

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};
use crate::routes::SystemRoute;
use crate::system::{MutationRequest, RouteExecutor, RouteSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub timestamp: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(alias = "total_routes", default)]
    pub total_routes: usize,
    pub routes: Vec<SystemRoute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub timestamp: String,
    #[serde(alias = "source_file")]
    pub source_file: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Snapshot {
    System(SystemSnapshot),
    Config(ConfigSnapshot),
}

impl Snapshot {
    pub fn kind(&self) -> &'static str {
        match self {
            Snapshot::System(_) => "system",
            Snapshot::Config(_) => "config",
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            Snapshot::System(s) => &s.timestamp,
            Snapshot::Config(c) => &c.timestamp,
        }
    }
}

/// Directory listing entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub filename: String,
    pub path: PathBuf,
    pub kind: String,
    pub timestamp: String,
    pub size: u64,
    pub total_routes: usize,
}

/// What a prune did. It never re-adds or re-changes anything, so
/// `not_restored` lists snapshot routes that are missing or different now.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub errors: Vec<String>,
    pub not_restored: Vec<String>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture the live IPv4 route table.
    pub async fn create_system_snapshot<S>(&self, source: &S) -> AppResult<PathBuf>
    where
        S: RouteSource + ?Sized,
    {
        let routes = source.query_system_routes().await.inspect_err(|e| {
            tracing::error!("Cannot snapshot system routes: {}", e);
        })?;
        self.write_system_snapshot(routes)
    }

    pub fn write_system_snapshot(&self, routes: Vec<SystemRoute>) -> AppResult<PathBuf> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let snapshot = Snapshot::System(SystemSnapshot {
            timestamp: Local::now().to_rfc3339(),
            hostname,
            total_routes: routes.len(),
            routes,
        });

        let path = self.unique_path("system-routes");
        write_json(&path, &snapshot)?;
        tracing::info!("System route snapshot created: {}", path.display());
        Ok(path)
    }

    /// Copy a profile file into the store, tagged with its profile name.
    pub fn create_config_snapshot(&self, config_path: &Path) -> AppResult<PathBuf> {
        let text = fs::read_to_string(config_path).map_err(|e| {
            AppError::Snapshot(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        let config: serde_json::Value = serde_json::from_str(&text)?;

        let profile = config
            .get("profileName")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let snapshot = Snapshot::Config(ConfigSnapshot {
            timestamp: Local::now().to_rfc3339(),
            source_file: config_path.display().to_string(),
            config,
        });

        let path = self.unique_path(&format!("app-config-{}", profile));
        write_json(&path, &snapshot)?;
        tracing::info!("Config snapshot created: {}", path.display());
        Ok(path)
    }

    /// Every readable snapshot, newest first. Unreadable files are skipped.
    pub fn list_snapshots(&self) -> AppResult<Vec<SnapshotInfo>> {
        let mut snapshots = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let snapshot = match read_snapshot(&path) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Skipping unreadable snapshot {}: {}", path.display(), e);
                    continue;
                }
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let total_routes = match &snapshot {
                Snapshot::System(s) => s.total_routes,
                Snapshot::Config(_) => 0,
            };

            snapshots.push(SnapshotInfo {
                filename: entry.file_name().to_string_lossy().into_owned(),
                path,
                kind: snapshot.kind().to_string(),
                timestamp: snapshot.timestamp().to_string(),
                size,
                total_routes,
            });
        }

        snapshots.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(snapshots)
    }

    pub fn load_snapshot(&self, path: &Path) -> AppResult<Snapshot> {
        let snapshot = read_snapshot(path)?;
        tracing::debug!("Loaded {} snapshot: {}", snapshot.kind(), path.display());
        Ok(snapshot)
    }

    pub fn delete_snapshot(&self, path: &Path) -> AppResult<()> {
        if !path.exists() {
            return Err(AppError::Snapshot(format!("not found: {}", path.display())));
        }
        fs::remove_file(path)?;
        tracing::info!("Snapshot deleted: {}", path.display());
        Ok(())
    }

    /// Keep the newest `keep` snapshots and delete the rest. Returns how many went.
    pub fn cleanup_old_snapshots(&self, keep: usize) -> AppResult<usize> {
        let snapshots = self.list_snapshots()?;
        let mut removed = 0;

        for info in snapshots.iter().skip(keep) {
            match self.delete_snapshot(&info.path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to delete {}: {}", info.filename, e),
            }
        }

        if removed > 0 {
            tracing::info!("Snapshot cleanup removed {}, kept {}", removed, keep);
        }
        Ok(removed)
    }

    /// Delete `NetMgmt` routes present now but absent from a system snapshot.
    ///
    /// This is only the delete half of a restore. Routes the snapshot has but
    /// the system lacks, or holds with other values, are reported in
    /// `not_restored` and left alone.
    pub async fn prune_routes_not_in_snapshot<H>(&self, host: &H, path: &Path) -> AppResult<PruneReport>
    where
        H: RouteSource + RouteExecutor + ?Sized,
    {
        let Snapshot::System(snapshot) = self.load_snapshot(path)? else {
            return Err(AppError::Snapshot(format!(
                "{} is not a system snapshot",
                path.display()
            )));
        };
        let current = host.query_system_routes().await?;

        let kept: HashSet<String> = snapshot.routes.iter().map(SystemRoute::key).collect();
        let mut seen = HashSet::new();
        let mut report = PruneReport::default();

        for route in &current {
            let key = route.key();
            if !route.protocol.is_net_mgmt() || kept.contains(&key) || !seen.insert(key.clone()) {
                continue;
            }

            let request = match route.destination() {
                Ok(prefix) => MutationRequest::delete(prefix.network()),
                Err(e) => {
                    report.errors.push(format!("{}: {}", key, e));
                    continue;
                }
            };

            let outcome = host.mutate_route(&request).await;
            if outcome.success {
                tracing::info!("Pruned {}", key);
                report.deleted.push(key);
            } else {
                tracing::error!("Failed to prune {}: {}", key, outcome.message);
                report.errors.push(format!("{}: {}", key, outcome.message));
            }
        }

        for wanted in snapshot.routes.iter().filter(|r| r.protocol.is_net_mgmt()) {
            let key = wanted.key();
            let matches = current.iter().any(|r| {
                r.key() == key
                    && r.next_hop == wanted.next_hop
                    && r.route_metric == wanted.route_metric
                    && r.interface_index == wanted.interface_index
            });
            if !matches {
                report.not_restored.push(key);
            }
        }

        if !report.not_restored.is_empty() {
            tracing::warn!(
                "{} snapshot route(s) missing or different now; prune does not restore them",
                report.not_restored.len()
            );
        }
        Ok(report)
    }

    /// `<stem>-YYYYMMDD-HHMMSS.json`, suffixed when the second is already taken.
    fn unique_path(&self, stem: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let mut path = self.dir.join(format!("{}-{}.json", stem, stamp));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{}-{}-{}.json", stem, stamp, n));
            n += 1;
        }
        path
    }
}

fn read_snapshot(path: &Path) -> AppResult<Snapshot> {
    let text = fs::read_to_string(path)
        .map_err(|e| AppError::Snapshot(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&text)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{NetworkInterface, RouteProtocol};
    use crate::system::fake::{FakeHost, net_mgmt};
    use tempfile::tempdir;

    fn local(prefix: &str) -> SystemRoute {
        let mut route = net_mgmt(prefix, "0.0.0.0", 12, 256);
        route.protocol = RouteProtocol::Local;
        route
    }

    #[tokio::test]
    async fn test_system_snapshot_shape() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let host = FakeHost::new(vec![], vec![net_mgmt("10.0.0.0/24", "192.168.1.1", 12, 5)]);

        let path = store.create_system_snapshot(&host).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("system-routes-"));
        assert!(name.ends_with(".json"));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["type"], "system");
        assert_eq!(raw["totalRoutes"], 1);
        assert_eq!(raw["routes"][0]["DestinationPrefix"], "10.0.0.0/24");
        assert_eq!(raw["routes"][0]["Protocol"], "NetMgmt");
    }

    #[tokio::test]
    async fn test_system_snapshot_fails_when_source_fails() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let host = FakeHost::new(vec![], vec![]);
        host.fail_queries();

        assert!(store.create_system_snapshot(&host).await.is_err());
        assert!(store.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_loads_snake_case_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system-routes-20240101-120000.json");
        fs::write(
            &path,
            r#"{"type": "system", "timestamp": "2024-01-01T12:00:00", "total_routes": 1,
                "routes": [{"DestinationPrefix": "10.0.0.0/24", "NextHop": "192.168.1.1",
                            "ifIndex": 12, "RouteMetric": 5, "Protocol": "NetMgmt"}]}"#,
        )
        .unwrap();

        let store = SnapshotStore::new(dir.path()).unwrap();
        match store.load_snapshot(&path).unwrap() {
            Snapshot::System(s) => {
                assert_eq!(s.total_routes, 1);
                assert!(s.hostname.is_empty());
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[test]
    fn test_config_snapshot_names_profile() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots")).unwrap();
        let profile = dir.path().join("home.json");
        fs::write(&profile, r#"{"profileName": "home", "routes": []}"#).unwrap();

        let path = store.create_config_snapshot(&profile).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("app-config-home-"));

        match store.load_snapshot(&path).unwrap() {
            Snapshot::Config(c) => {
                assert_eq!(c.config["profileName"], "home");
                assert!(c.source_file.ends_with("home.json"));
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[test]
    fn test_list_skips_garbage_and_cleanup_keeps_newest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let mut written = Vec::new();
        for _ in 0..3 {
            written.push(store.write_system_snapshot(vec![]).unwrap());
        }

        let listed = store.list_snapshots().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|s| s.kind == "system"));
        assert!(listed.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        assert_eq!(store.cleanup_old_snapshots(1).unwrap(), 2);
        assert_eq!(store.list_snapshots().unwrap().len(), 1);
        assert!(dir.path().join("broken.json").exists());
    }

    #[test]
    fn test_delete_missing_snapshot_is_error() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        assert!(store.delete_snapshot(&dir.path().join("nope.json")).is_err());
    }

    #[tokio::test]
    async fn test_prune_only_deletes_net_mgmt_routes_absent_from_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let path = store
            .write_system_snapshot(vec![
                net_mgmt("10.0.0.0/24", "192.168.1.1", 12, 5),
                net_mgmt("10.5.0.0/16", "192.168.1.1", 12, 5),
            ])
            .unwrap();

        let host = FakeHost::new(
            vec![NetworkInterface::new("Eth0", 12)],
            vec![
                net_mgmt("10.0.0.0/24", "192.168.1.99", 12, 5),
                net_mgmt("172.16.0.0/12", "192.168.1.1", 12, 5),
                local("192.168.1.0/24"),
            ],
        );

        let report = store.prune_routes_not_in_snapshot(&host, &path).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.deleted, vec!["172.16.0.0/12"]);
        assert_eq!(host.call_log(), vec!["delete 172.16.0.0"]);
        // Neither re-added nor changed back
        assert_eq!(report.not_restored, vec!["10.0.0.0/24", "10.5.0.0/16"]);
        assert_eq!(host.routes().len(), 2);
    }

    #[tokio::test]
    async fn test_prune_rejects_config_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let profile = dir.path().join("home.json");
        fs::write(&profile, r#"{"profileName": "home"}"#).unwrap();
        let path = store.create_config_snapshot(&profile).unwrap();

        let host = FakeHost::new(vec![], vec![]);
        assert!(store.prune_routes_not_in_snapshot(&host, &path).await.is_err());
        assert!(host.calls().is_empty());
    }
}
