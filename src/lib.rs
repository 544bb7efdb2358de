// src/lib.rs

//! Pungi compose pipeline
//!
//! Turns a configuration plus a package source (plain repositories or a
//! Koji tag) into a compose directory: per-variant package sets, gathered
//! and linked trees, repodata, images and the productmd-style metadata that
//! describes them.
//!
//! # Architecture
//!
//! - Phases: `init → pkgset → gather → createrepo → images → test`, run by
//!   [`phases::PhaseEngine`] over a serial/parallel schema
//! - Package set: one arch-indexed pool of [`packages::PackageRecord`]s,
//!   shared read-only by every later phase
//! - Gather: per (variant, arch) dependency closure with multilib and
//!   variant layering, recorded in the rpm manifest
//! - Metadata: `composeinfo.json`, `rpms.json`, `images.json`, `.treeinfo`
//!   and `STATUS`, all written with sorted keys

pub mod arch;
pub mod compose;
pub mod comps;
pub mod config;
mod error;
pub mod gather;
pub mod linker;
pub mod manifest;
pub mod metadata;
pub mod notifier;
pub mod packages;
pub mod paths;
pub mod phases;
pub mod pkgset;
pub mod repository;
pub mod runroot;
pub mod scm;
pub mod version;

pub use compose::{Compose, ComposeOptions, ComposeStatus};
pub use config::Config;
pub use error::{Error, Result};

use config::VariantTree;
use notifier::ScriptNotifier;
use phases::{PhaseEngine, builtin_schema};
use pkgset::koji::{KojiHub, KojiSession};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Load and validate the configuration, then create the compose directory
///
/// Nothing is written to `target_dir` unless the configuration is valid.
pub fn prepare_compose(config_path: &Path, options: ComposeOptions) -> Result<Compose> {
    let config = Config::load(config_path)?;
    config.validate(&options.just_phases, &options.skip_phases)?;

    let variants = VariantTree::load(&config.variants_file)?
        .restrict(&config.tree_arches, &config.tree_variants);
    variants.validate_arches(&config.compose_arches(&variants))?;

    let koji: Option<Arc<dyn KojiSession>> = match &config.koji_hub {
        Some(hub) => Some(Arc::new(KojiHub::new(hub.as_str())?)),
        None => None,
    };
    let runroot = runroot::from_config(&config, koji.clone())?;
    let script = config.notification_script.clone();

    let mut compose = Compose::create(config, variants, options)?.with_runroot(runroot);
    if let Some(koji) = koji {
        compose = compose.with_koji(koji);
    }
    if let Some(script) = script {
        compose = compose.with_notifier(Box::new(ScriptNotifier::new(script)));
    }
    Ok(compose)
}

/// Run every phase of the built-in schema and seal the compose
///
/// On a fatal error the remaining work is cancelled, whatever images were
/// produced are still recorded, `STATUS` becomes `DOOMED` and the error is
/// returned.
pub fn run_compose(compose: &Compose) -> Result<ComposeStatus> {
    let schema = builtin_schema();
    let engine = PhaseEngine::new(compose);
    info!("Running phases: {}", schema.phase_names().join(", "));

    let outcome = engine
        .validate(&schema)
        .and_then(|()| engine.run(&schema))
        .and_then(|()| metadata::write_compose_metadata(compose));

    match outcome {
        Ok(()) => {
            let status = compose.finish(false)?;
            info!("Compose {} finished: {}", compose.identity.id, status);
            Ok(status)
        }
        Err(e) => {
            error!("Compose {} failed: {}", compose.identity.id, e);
            compose.cancel.cancel();
            compose.runroot.cancel_all();
            if let Err(save_err) = phases::image_checksum::write_image_manifest(compose) {
                warn!("Cannot save image manifest: {}", save_err);
            }
            compose.finish(true)?;
            Err(e)
        }
    }
}
