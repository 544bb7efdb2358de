// src/compose.rs

//! A compose run
//!
//! `Compose` owns the configuration, the variant tree, the directory layout,
//! the external capabilities and the state phases hand to each other. Phase
//! outputs are write-once cells filled when the producing phase finishes.

use crate::comps::Comps;
use crate::comps::modules::ModuleDefaults;
use crate::config::{Config, VariantTree};
use crate::error::{Error, Result};
use crate::gather::VariantResults;
use crate::manifest::{FailedDeliverable, ImageManifest, OsbsBuild, RpmManifest};
use crate::notifier::{Notifier, NullNotifier, STATUS_CHANGE};
use crate::paths::Paths;
use crate::phases::{CancelToken, RepoLocks};
use crate::pkgset::PackageSet;
use crate::pkgset::koji::KojiSession;
use crate::runroot::{LocalRunroot, Runroot};
use crate::scm::ScmRegistry;
use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{debug, info, warn};

/// Identity recorded in every manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeIdentity {
    pub id: String,
    #[serde(rename = "type")]
    pub compose_type: String,
    pub date: String,
    pub respin: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeStatus {
    Started,
    Finished,
    FinishedIncomplete,
    Doomed,
}

impl ComposeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComposeStatus::Started => "STARTED",
            ComposeStatus::Finished => "FINISHED",
            ComposeStatus::FinishedIncomplete => "FINISHED_INCOMPLETE",
            ComposeStatus::Doomed => "DOOMED",
        }
    }

    /// Process exit code for a final status
    pub fn exit_code(&self) -> i32 {
        match self {
            ComposeStatus::Finished => 0,
            ComposeStatus::FinishedIncomplete => 1,
            ComposeStatus::Started | ComposeStatus::Doomed => 2,
        }
    }
}

impl fmt::Display for ComposeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run options that do not come from the config file
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub target_dir: PathBuf,
    pub label: Option<String>,
    pub compose_date: Option<NaiveDate>,
    pub respin: Option<u32>,
    pub old_composes: Vec<PathBuf>,
    pub just_phases: Vec<String>,
    pub skip_phases: Vec<String>,
    pub no_latest_link: bool,
}

/// Labels look like `RC-1.0` or `Beta-1`
pub fn validate_label(label: &str, config: &Config) -> Result<()> {
    let re = Regex::new(r"^[A-Z][A-Za-z]*-\d+(\.\d+)*$")
        .map_err(|e| Error::Config(format!("Bad label pattern: {}", e)))?;
    if !re.is_match(label) {
        return Err(Error::Config(format!(
            "Invalid compose label {}, expected e.g. RC-1.0 or Beta-1",
            label
        )));
    }
    if config.compose_type != crate::config::ComposeType::Production {
        return Err(Error::Config(format!(
            "Labels are only allowed for production composes, not {}",
            config.compose_type.as_str()
        )));
    }
    Ok(())
}

/// `<short>-<version>[-<base_short><base_version>]`
pub fn compose_prefix(config: &Config) -> String {
    let mut prefix = format!("{}-{}", config.release_short, config.release_version);
    if config.release_is_layered
        && let (Some(short), Some(version)) =
            (&config.base_product_short, &config.base_product_version)
    {
        prefix.push_str(&format!("-{}{}", short, version));
    }
    prefix
}

pub fn compose_id(config: &Config, date: &str, respin: u32) -> String {
    format!(
        "{}-{}{}.{}",
        compose_prefix(config),
        date,
        config.compose_type.suffix(),
        respin
    )
}

/// First respin whose directory does not exist yet
pub fn next_respin(target_dir: &Path, config: &Config, date: &str) -> u32 {
    let stem = format!("{}-{}{}.", compose_prefix(config), date, config.compose_type.suffix());
    let Ok(entries) = fs::read_dir(target_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_prefix(&stem)?.parse::<u32>().ok()
        })
        .max()
        .map(|r| r + 1)
        .unwrap_or(0)
}

pub struct Compose {
    pub config: Config,
    pub variants: VariantTree,
    pub paths: Paths,
    pub identity: ComposeIdentity,
    pub options: ComposeOptions,
    pub cancel: CancelToken,
    pub runroot: Arc<dyn Runroot>,
    pub koji: Option<Arc<dyn KojiSession>>,
    pub scm: ScmRegistry,
    pub repo_locks: RepoLocks,

    pub comps: OnceLock<Option<Comps>>,
    pub module_defaults: OnceLock<ModuleDefaults>,
    pub pkgset: OnceLock<PackageSet>,
    pub gather: OnceLock<VariantResults>,
    pub rpms: OnceLock<RpmManifest>,
    images: Mutex<ImageManifest>,
    osbs: Mutex<Vec<OsbsBuild>>,

    notifier: Box<dyn Notifier>,
    incomplete: AtomicBool,
}

impl Compose {
    /// Create the compose directory and mark it `STARTED`
    pub fn create(config: Config, variants: VariantTree, options: ComposeOptions) -> Result<Self> {
        if let Some(label) = &options.label {
            validate_label(label, &config)?;
        }
        let date = options
            .compose_date
            .unwrap_or_else(|| Utc::now().date_naive())
            .format("%Y%m%d")
            .to_string();
        let respin = options
            .respin
            .unwrap_or_else(|| next_respin(&options.target_dir, &config, &date));
        let identity = ComposeIdentity {
            id: compose_id(&config, &date, respin),
            compose_type: config.compose_type.as_str().to_string(),
            date,
            respin,
            label: options.label.clone(),
        };

        let topdir = options.target_dir.join(&identity.id);
        fs::create_dir_all(topdir.join("compose"))
            .map_err(|e| Error::IoError(format!("Cannot create {}: {}", topdir.display(), e)))?;
        fs::create_dir_all(topdir.join("logs").join("global"))?;
        fs::create_dir_all(topdir.join("work").join("global"))?;
        fs::write(topdir.join("COMPOSE_ID"), format!("{}\n", identity.id))?;
        info!("Compose {} in {}", identity.id, topdir.display());

        let scm = ScmRegistry::new(config.config_dir.clone());
        let compose = Self {
            paths: Paths::new(topdir, variants.clone()),
            images: Mutex::new(ImageManifest::new(identity.clone())),
            config,
            variants,
            identity,
            options,
            cancel: CancelToken::new(),
            runroot: Arc::new(LocalRunroot),
            koji: None,
            scm,
            repo_locks: RepoLocks::default(),
            comps: OnceLock::new(),
            module_defaults: OnceLock::new(),
            pkgset: OnceLock::new(),
            gather: OnceLock::new(),
            rpms: OnceLock::new(),
            osbs: Mutex::new(Vec::new()),
            notifier: Box::new(NullNotifier),
            incomplete: AtomicBool::new(false),
        };
        compose.write_status(ComposeStatus::Started)?;
        Ok(compose)
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_runroot(mut self, runroot: Arc<dyn Runroot>) -> Self {
        self.runroot = runroot;
        self
    }

    pub fn with_koji(mut self, koji: Arc<dyn KojiSession>) -> Self {
        self.koji = Some(koji);
        self
    }

    pub fn topdir(&self) -> &Path {
        self.paths.topdir()
    }

    pub fn notify(&self, event: &str, payload: &serde_json::Value) {
        let mut payload = payload.clone();
        if let Some(map) = payload.as_object_mut() {
            map.insert("compose_id".to_string(), json!(self.identity.id));
            map.insert("location".to_string(), json!(self.topdir().to_string_lossy()));
        }
        self.notifier.send(event, &payload);
    }

    pub fn write_status(&self, status: ComposeStatus) -> Result<()> {
        let path = self.paths.status_file();
        fs::write(&path, format!("{}\n", status))
            .map_err(|e| Error::IoError(format!("Cannot write {}: {}", path.display(), e)))?;
        info!("Compose status: {}", status);
        self.notify(STATUS_CHANGE, &json!({ "status": status.as_str() }));
        Ok(())
    }

    pub fn read_status(&self) -> Option<String> {
        fs::read_to_string(self.paths.status_file())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// A failable deliverable failed
    pub fn mark_incomplete(&self) {
        self.incomplete.store(true, Ordering::SeqCst);
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> Result<MutexGuard<'_, ImageManifest>> {
        self.images
            .lock()
            .map_err(|_| Error::IoError("Image manifest lock poisoned".to_string()))
    }

    pub fn record_failure(&self, failure: FailedDeliverable) -> Result<()> {
        self.images()?.add_failure(failure);
        self.mark_incomplete();
        Ok(())
    }

    pub fn add_osbs_build(&self, build: OsbsBuild) -> Result<()> {
        self.osbs
            .lock()
            .map_err(|_| Error::IoError("osbs list lock poisoned".to_string()))?
            .push(build);
        Ok(())
    }

    pub fn osbs_builds(&self) -> Result<Vec<OsbsBuild>> {
        let mut builds = self
            .osbs
            .lock()
            .map_err(|_| Error::IoError("osbs list lock poisoned".to_string()))?
            .clone();
        builds.sort();
        Ok(builds)
    }

    pub fn package_set(&self) -> Result<&PackageSet> {
        self.pkgset
            .get()
            .ok_or_else(|| Error::Aborted("the package set has not been built".to_string()))
    }

    pub fn gather_results(&self) -> Result<&VariantResults> {
        self.gather
            .get()
            .ok_or_else(|| Error::Aborted("packages have not been gathered".to_string()))
    }

    pub fn rpm_manifest(&self) -> Result<&RpmManifest> {
        self.rpms
            .get()
            .ok_or_else(|| Error::Aborted("the RPM manifest has not been written".to_string()))
    }

    pub fn comps(&self) -> Option<&Comps> {
        self.comps.get().and_then(|c| c.as_ref())
    }

    /// Compose arches after `tree_arches` restriction
    pub fn arches(&self) -> Vec<String> {
        self.config.compose_arches(&self.variants)
    }

    /// Point `latest-<short>-<version>` at this compose
    pub fn update_latest_link(&self) -> Result<()> {
        if self.options.no_latest_link {
            debug!("Not updating latest link");
            return Ok(());
        }
        let name = format!("latest-{}", compose_prefix(&self.config));
        let link = self.options.target_dir.join(&name);
        let tmp = self.options.target_dir.join(format!(".{}.tmp", name));
        let _ = fs::remove_file(&tmp);
        symlink(Path::new(&self.identity.id), &tmp)?;
        fs::rename(&tmp, &link).map_err(|e| {
            Error::IoError(format!("Cannot update {}: {}", link.display(), e))
        })?;
        info!("Updated {} -> {}", link.display(), self.identity.id);
        Ok(())
    }

    /// Write the final status, update the latest link and announce the end
    pub fn finish(&self, failed: bool) -> Result<ComposeStatus> {
        let status = if failed {
            ComposeStatus::Doomed
        } else if self.is_incomplete() {
            ComposeStatus::FinishedIncomplete
        } else {
            ComposeStatus::Finished
        };
        self.write_status(status)?;
        if status != ComposeStatus::Doomed
            && let Err(e) = self.update_latest_link()
        {
            warn!("{}", e);
        }
        self.notify(
            crate::notifier::COMPOSE_FINISHED,
            &json!({ "status": status.as_str() }),
        );
        Ok(status)
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| Error::IoError(format!("Cannot create symlink {}: {}", link.display(), e)))
}

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(Error::IoError(format!("Cannot create symlink {}", link.display())))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CONFIG: &str = r#"
release_name = "Dummy Product"
release_short = "DP"
release_version = "1.0"
variants_file = "variants.xml"

[pkgset_repos]
x86_64 = ["repo"]
"#;

    pub(crate) const VARIANTS: &str = r#"<variants>
  <variant id="Server" name="Server" type="variant">
    <arches><arch>x86_64</arch></arches>
    <variants>
      <variant id="HA" name="High Availability" type="addon"/>
    </variants>
  </variant>
</variants>"#;

    /// A compose in `dir` dated 2024-01-01
    pub(crate) fn test_compose(dir: &Path) -> Compose {
        let config = Config::parse(CONFIG, dir).unwrap();
        let variants = VariantTree::parse(VARIANTS).unwrap();
        Compose::create(
            config,
            variants,
            ComposeOptions {
                target_dir: dir.to_path_buf(),
                compose_date: NaiveDate::from_ymd_opt(2024, 1, 1),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_compose_id() {
        let mut config = Config::parse(CONFIG, Path::new("/")).unwrap();
        assert_eq!(compose_id(&config, "20240101", 0), "DP-1.0-20240101.0");

        config.compose_type = crate::config::ComposeType::Nightly;
        assert_eq!(compose_id(&config, "20240101", 3), "DP-1.0-20240101.n.3");

        config.release_is_layered = true;
        config.base_product_short = Some("BP".to_string());
        config.base_product_version = Some("8".to_string());
        assert_eq!(compose_id(&config, "20240101", 0), "DP-1.0-BP8-20240101.n.0");
    }

    #[test]
    fn test_labels() {
        let mut config = Config::parse(CONFIG, Path::new("/")).unwrap();
        assert!(validate_label("RC-1.0", &config).is_ok());
        assert!(validate_label("Beta-1", &config).is_ok());
        assert!(validate_label("rc1", &config).is_err());
        config.compose_type = crate::config::ComposeType::Nightly;
        assert!(validate_label("RC-1.0", &config).is_err());
    }

    #[test]
    fn test_respin_and_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = test_compose(dir.path());
        assert_eq!(first.identity.id, "DP-1.0-20240101.0");
        assert_eq!(first.read_status().as_deref(), Some("STARTED"));

        let second = test_compose(dir.path());
        assert_eq!(second.identity.respin, 1);

        let status = second.finish(false).unwrap();
        assert_eq!(status, ComposeStatus::Finished);
        assert_eq!(second.read_status().as_deref(), Some("FINISHED"));
        let latest = fs::read_link(dir.path().join("latest-DP-1.0")).unwrap();
        assert_eq!(latest, PathBuf::from("DP-1.0-20240101.1"));
    }

    #[test]
    fn test_incomplete_and_doomed() {
        let dir = tempfile::TempDir::new().unwrap();
        let compose = test_compose(dir.path());
        compose
            .record_failure(FailedDeliverable {
                variant: "Server".to_string(),
                arch: "x86_64".to_string(),
                deliverable: "createiso".to_string(),
                reason: "boom".to_string(),
            })
            .unwrap();
        assert_eq!(compose.finish(false).unwrap().exit_code(), 1);

        let doomed = test_compose(dir.path());
        assert_eq!(doomed.finish(true).unwrap(), ComposeStatus::Doomed);
        assert_eq!(doomed.read_status().as_deref(), Some("DOOMED"));
        // latest still points at the first compose
        assert_eq!(
            fs::read_link(dir.path().join("latest-DP-1.0")).unwrap(),
            PathBuf::from("DP-1.0-20240101.0")
        );
    }
}
