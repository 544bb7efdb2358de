// src/phases/mod.rs

//! Compose phases
//!
//! A `Phase` is a named body plus the pieces every phase shares: an optional
//! config guard, a logger and, for image phases, image defaults. The engine
//! runs phases according to a `Schema`.

pub mod createrepo;
pub mod engine;
pub mod extra_files;
pub mod failable;
pub mod gather;
pub mod image_checksum;
pub mod images;
pub mod init;
pub mod pkgset;
pub mod pool;
pub mod reuse;

use crate::compose::Compose;
use crate::config::Config;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, info_span, warn};

pub use engine::{PhaseEngine, Schema};

/// Shared cancellation flag checked before each phase and pool task
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Aborted("cancelled after a failure elsewhere".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Per-repository locks, so sub-variants sharing a parent's repo do not run
/// createrepo on it concurrently
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RepoLocks {
    pub fn lock_for(&self, repo: &Path) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::IoError("Repository lock registry poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(repo.to_path_buf()).or_default()))
    }
}

/// Phase runs only when its config block is present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigGuard {
    pub key: String,
}

impl ConfigGuard {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn is_satisfied(&self, config: &Config) -> bool {
        match self.key.as_str() {
            "extra_files" => !config.extra_files.is_empty(),
            key => config.image_phases.get(key).is_some_and(|rules| !rules.is_empty()),
        }
    }
}

/// Defaults for images a phase records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefaults {
    pub image_type: &'static str,
    pub format: &'static str,
    pub bootable: bool,
}

/// `[BEGIN]`/`[DONE]`/`[SKIP]`/`[FAIL]` lines inside a `phase` span
#[derive(Debug, Clone)]
pub struct PhaseLogger {
    name: String,
}

impl PhaseLogger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn span(&self) -> tracing::Span {
        info_span!("phase", name = %self.name)
    }

    pub fn begin(&self) {
        info!("[BEGIN] {}", self.name);
    }

    pub fn done(&self) {
        info!("[DONE ] {}", self.name);
    }

    pub fn skip(&self, reason: &str) {
        info!("[SKIP ] {} ({})", self.name, reason);
    }

    pub fn fail(&self, err: &Error) {
        error!("[FAIL ] {}: {}", self.name, err);
    }

    pub fn warn(&self, msg: &str) {
        warn!("{}: {}", self.name, msg);
    }
}

/// What a phase does
pub trait PhaseBody: Send + Sync {
    /// Reason to skip, if any
    fn skip(&self, _phase: &Phase, _compose: &Compose) -> Option<String> {
        None
    }

    /// Checked for every phase before any phase runs
    fn validate(&self, _phase: &Phase, _compose: &Compose) -> Result<()> {
        Ok(())
    }

    fn run(&self, phase: &Phase, compose: &Compose) -> Result<()>;

    /// Finalizer; outputs become visible to later phases once it returns
    fn stop(&self, _phase: &Phase, _compose: &Compose) -> Result<()> {
        Ok(())
    }
}

pub struct Phase {
    pub name: String,
    pub config_guard: Option<ConfigGuard>,
    pub logger: PhaseLogger,
    pub image_defaults: Option<ImageDefaults>,
    body: Box<dyn PhaseBody>,
}

impl Phase {
    pub fn new(name: &str, body: Box<dyn PhaseBody>) -> Self {
        Self {
            name: name.to_string(),
            config_guard: None,
            logger: PhaseLogger::new(name),
            image_defaults: None,
            body,
        }
    }

    pub fn guarded(mut self, guard: ConfigGuard) -> Self {
        self.config_guard = Some(guard);
        self
    }

    pub fn with_image_defaults(mut self, defaults: ImageDefaults) -> Self {
        self.image_defaults = Some(defaults);
        self
    }

    /// Why this phase does not run in this compose, if it does not
    pub fn skip_reason(&self, compose: &Compose) -> Option<String> {
        let options = &compose.options;
        if compose.config.skip_phases.contains(&self.name) || options.skip_phases.contains(&self.name)
        {
            return Some("listed in skip_phases".to_string());
        }
        if !options.just_phases.is_empty() && !options.just_phases.contains(&self.name) {
            return Some("not in just_phases".to_string());
        }
        if let Some(guard) = &self.config_guard
            && !guard.is_satisfied(&compose.config)
        {
            return Some(format!("no {} configuration", guard.key));
        }
        self.body.skip(self, compose)
    }

    pub fn validate(&self, compose: &Compose) -> Result<()> {
        self.body.validate(self, compose)
    }

    pub fn run(&self, compose: &Compose) -> Result<()> {
        self.body.run(self, compose)
    }

    pub fn stop(&self, compose: &Compose) -> Result<()> {
        self.body.stop(self, compose)
    }
}

/// The built-in pipeline
pub fn builtin_schema() -> Schema {
    use Schema::{Parallel, Serial};

    let image = |name: &str| Schema::Phase(Box::new(images::image_phase(name)));
    Serial(vec![
        Schema::Phase(Box::new(Phase::new("init", Box::new(init::InitPhase)))),
        Schema::Phase(Box::new(Phase::new("pkgset", Box::new(pkgset::PkgsetPhase)))),
        Serial(vec![
            Schema::Phase(Box::new(Phase::new("gather", Box::new(gather::GatherPhase)))),
            Schema::Phase(Box::new(Phase::new(
                "createrepo",
                Box::new(createrepo::CreaterepoPhase),
            ))),
            image("productimg"),
            image("buildinstall"),
            Schema::Phase(Box::new(
                Phase::new("extra_files", Box::new(extra_files::ExtraFilesPhase))
                    .guarded(ConfigGuard::new("extra_files")),
            )),
            Parallel(
                [
                    "createiso",
                    "extra_isos",
                    "live_images",
                    "image_build",
                    "livemedia",
                    "ostree",
                    "ostree_installer",
                    "osbs",
                ]
                .into_iter()
                .map(image)
                .collect(),
            ),
            Schema::Phase(Box::new(Phase::new(
                "image_checksum",
                Box::new(image_checksum::ImageChecksumPhase),
            ))),
        ]),
        Schema::Phase(Box::new(Phase::new("test", Box::new(test::TestPhase)))),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(Error::Aborted(_))));
    }

    #[test]
    fn test_repo_locks_are_shared_per_path() {
        let locks = RepoLocks::default();
        let a = locks.lock_for(Path::new("/compose/Server/x86_64/os")).unwrap();
        let b = locks.lock_for(Path::new("/compose/Server/x86_64/os")).unwrap();
        let c = locks.lock_for(Path::new("/compose/Client/x86_64/os")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_builtin_schema_phase_order() {
        let schema = builtin_schema();
        let names = schema.phase_names();
        let expected: Vec<&str> = vec![
            "init",
            "pkgset",
            "gather",
            "createrepo",
            "productimg",
            "buildinstall",
            "extra_files",
            "createiso",
            "extra_isos",
            "live_images",
            "image_build",
            "livemedia",
            "ostree",
            "ostree_installer",
            "osbs",
            "image_checksum",
            "test",
        ];
        assert_eq!(names, expected);
        for name in crate::config::ALL_PHASES {
            assert!(names.contains(name), "{} missing from the pipeline", name);
        }
    }
}
