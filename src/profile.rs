// Profile store - named sets of desired routes persisted as JSON

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};
use crate::routes::Route;
use crate::routes::validator::resolve_domain;

pub const PROFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerifyDefaults {
    pub route_hit: bool,
    pub trace: bool,
    pub timeout_ms: u64,
}

impl Default for VerifyDefaults {
    fn default() -> Self {
        VerifyDefaults {
            route_hit: true,
            trace: false,
            timeout_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteDefaults {
    pub metric: u32,
    pub persistent: bool,
    pub verify: VerifyDefaults,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        RouteDefaults {
            metric: 5,
            persistent: true,
            verify: VerifyDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhysicalPolicy {
    pub name_match: String,
    pub gateway: String,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireguardPolicy {
    pub name_match: String,
    pub full_tunnel_guard: bool,
}

impl Default for WireguardPolicy {
    fn default() -> Self {
        WireguardPolicy {
            name_match: "client".to_string(),
            full_tunnel_guard: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterfacePolicy {
    pub physical: PhysicalPolicy,
    pub wireguard: WireguardPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub version: u32,
    pub profile_name: String,
    pub created: String,
    pub last_modified: String,
    pub defaults: RouteDefaults,
    pub interface_policy: InterfacePolicy,
    pub routes: Vec<Route>,
    /// Domain name -> addresses kept from an earlier resolution
    pub pinned: BTreeMap<String, Vec<Ipv4Addr>>,
}

impl Default for Profile {
    fn default() -> Self {
        let now = Local::now().to_rfc3339();
        Profile {
            version: PROFILE_VERSION,
            profile_name: String::new(),
            created: now.clone(),
            last_modified: now,
            defaults: RouteDefaults::default(),
            interface_policy: InterfacePolicy::default(),
            routes: Vec::new(),
            pinned: BTreeMap::new(),
        }
    }
}

impl Profile {
    pub fn new(name: &str) -> Self {
        Profile {
            profile_name: name.to_string(),
            ..Profile::default()
        }
    }

    /// Routes with every domain target replaced by `/32` routes to its addresses.
    pub async fn expand_targets(&mut self) -> Vec<Route> {
        self.expand_targets_with(|domain| async move { resolve_domain(&domain).await })
            .await
    }

    /// Like [`Profile::expand_targets`] with a caller-supplied resolver.
    ///
    /// Pinned addresses win over resolution. Freshly resolved addresses are
    /// pinned when the route asks for it. A domain that cannot be resolved
    /// stays as-is.
    pub async fn expand_targets_with<F, Fut>(&mut self, mut resolve: F) -> Vec<Route>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = AppResult<Vec<Ipv4Addr>>>,
    {
        let mut expanded = Vec::with_capacity(self.routes.len());

        for route in &self.routes {
            let Some(domain) = route.domain() else {
                expanded.push(route.clone());
                continue;
            };
            let ips = match self.pinned.get(&domain) {
                Some(ips) if !ips.is_empty() => ips.clone(),
                _ => match resolve(domain.clone()).await {
                    Ok(ips) => {
                        tracing::info!("Resolved {} to {} address(es)", domain, ips.len());
                        if route.pin {
                            self.pinned.insert(domain.clone(), ips.clone());
                        }
                        ips
                    }
                    Err(e) => {
                        tracing::warn!("Keeping unresolved target {}: {}", domain, e);
                        expanded.push(route.clone());
                        continue;
                    }
                },
            };

            for ip in ips {
                let mut host_route = route.clone();
                host_route.target = ip.to_string();
                host_route.prefix_length = 32;
                if host_route.description.is_empty() {
                    host_route.description = domain.clone();
                }
                expanded.push(host_route);
            }
        }

        expanded
    }
}

/// Directory of `<name>.json` profiles.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(ProfileStore { dir })
    }

    pub fn profile_path(&self, name: &str) -> AppResult<PathBuf> {
        let name = profile_name(name)?;
        Ok(self.dir.join(format!("{}.json", name)))
    }

    /// Load a profile, creating the default one when it does not exist yet.
    pub fn load_profile(&self, name: &str) -> AppResult<Profile> {
        let path = self.profile_path(name)?;
        if !path.exists() {
            tracing::warn!("Profile {} not found, creating default", name);
            return self.create_default_profile(name);
        }

        let profile = read_profile(&path)?;
        tracing::info!(
            "Loaded profile {} ({} route(s))",
            profile.profile_name,
            profile.routes.len()
        );
        Ok(profile)
    }

    /// Write a profile under its own name, stamping `lastModified`.
    pub fn save_profile(&self, profile: &mut Profile) -> AppResult<PathBuf> {
        let path = self.profile_path(&profile.profile_name)?;
        profile.last_modified = Local::now().to_rfc3339();
        write_profile(&path, profile)?;
        tracing::info!("Saved profile {}", profile.profile_name);
        Ok(path)
    }

    pub fn create_default_profile(&self, name: &str) -> AppResult<Profile> {
        let mut profile = Profile::new(profile_name(name)?);
        self.save_profile(&mut profile)?;
        Ok(profile)
    }

    pub fn list_profiles(&self) -> AppResult<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn delete_profile(&self, name: &str) -> AppResult<()> {
        let path = self.profile_path(name)?;
        if !path.exists() {
            return Err(AppError::Profile(format!("profile {} does not exist", name)));
        }
        fs::remove_file(&path)?;
        tracing::info!("Deleted profile {}", name);
        Ok(())
    }

    pub fn export_profile(&self, name: &str, dest: &Path) -> AppResult<()> {
        let path = self.profile_path(name)?;
        if !path.exists() {
            return Err(AppError::Profile(format!("profile {} does not exist", name)));
        }
        let profile = read_profile(&path)?;
        write_profile(dest, &profile)?;
        tracing::info!("Exported profile {} to {}", name, dest.display());
        Ok(())
    }

    /// Import a profile file under a new name. The source must parse as a profile.
    pub fn import_profile(&self, src: &Path, name: &str) -> AppResult<Profile> {
        let mut profile = read_profile(src)?;
        profile.profile_name = profile_name(name)?.to_string();
        self.save_profile(&mut profile)?;
        tracing::info!("Imported {} as profile {}", src.display(), profile.profile_name);
        Ok(profile)
    }
}

/// Accept `home` or `home.json`; reject anything that would escape the directory.
fn profile_name(name: &str) -> AppResult<&str> {
    let name = name.trim();
    let name = name.strip_suffix(".json").unwrap_or(name);
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(AppError::Profile(format!("invalid profile name '{}'", name)));
    }
    Ok(name)
}

fn read_profile(path: &Path) -> AppResult<Profile> {
    let text = fs::read_to_string(path)
        .map_err(|e| AppError::Profile(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| AppError::Profile(format!("{} is not a valid profile: {}", path.display(), e)))
}

fn write_profile(path: &Path, profile: &Profile) -> AppResult<()> {
    let json = serde_json::to_string_pretty(profile)?;
    fs::write(path, json)?;
    Ok(())
}
