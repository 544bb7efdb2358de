// src/phases/gather.rs

//! gather phase
//!
//! Gathers every (variant, arch) through the layering engine (or reloads the
//! results of an old compose with the same inputs), saves the results under
//! `work/<arch>/gather/`, links packages into the output trees and writes
//! `rpms.json` and `modules.json`.

use super::reuse::{ReuseRecord, find_reusable};
use super::{Phase, PhaseBody};
use crate::compose::Compose;
use crate::comps::modules::{ModuleDefaults, variant_modules};
use crate::error::{Error, Result};
use crate::gather::layering::GatherContext;
use crate::gather::seed::{self, Prepopulate, SourceMapping};
use crate::gather::{GatherResult, LayeringEngine, LayeringRecord, SavedResult, VariantResults};
use crate::linker::PackageLinker;
use crate::manifest::{
    MODULES_FILE, ModuleEntry, ModulesManifest, RPMS_FILE, RpmManifest, read_json, write_json,
};
use crate::packages::PackageRecord;
use crate::repository::{self, Repository, RepositoryClient};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Config keys whose values decide the gather result
const REUSE_KEYS: &[&str] = &[
    "gather_method",
    "gather_backend",
    "greedy_method",
    "multilib",
    "multilib_whitelist",
    "multilib_blacklist",
    "filter_packages",
    "additional_packages",
    "filter_system_release_packages",
    "gather_fulltree",
    "gather_selfhosting",
    "lookaside_repos",
    "variant_as_lookaside",
    "check_deps",
];

pub struct GatherPhase;

impl PhaseBody for GatherPhase {
    fn run(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        let config = &compose.config;
        let pkgset = compose.package_set()?;
        let lookaside = load_lookaside(compose)?;
        let prepopulate = config
            .gather_prepopulate
            .as_deref()
            .map(seed::load_prepopulate)
            .transpose()?;
        let source_mapping = config
            .gather_source_mapping
            .as_deref()
            .map(seed::load_source_mapping)
            .transpose()?;
        let module_defaults = compose.module_defaults.get().cloned().unwrap_or_default();

        let engine = LayeringEngine::new(GatherContext {
            config,
            variants: &compose.variants,
            pkgset,
            comps: compose.comps(),
            module_defaults: &module_defaults,
            prepopulate: prepopulate.as_ref(),
            source_mapping: source_mapping.as_ref(),
            lookaside: &lookaside,
        });
        let arches = compose.arches();

        let record = reuse_record(
            compose,
            prepopulate.as_ref(),
            source_mapping.as_ref(),
            &lookaside,
        )?;
        let reloaded = find_reusable(compose, &record)
            .and_then(|old| reload(compose, &engine, &module_defaults, &old, &arches));
        let results = match reloaded {
            Some(results) => results,
            None => engine.run(&arches)?,
        };
        results.check_dependencies(config)?;

        save_results(compose, &results)?;
        record.save(compose)?;

        let rpms = link_packages(compose, &results)?;
        rpms.write(&compose.paths.metadata_dir().join(RPMS_FILE))?;
        write_modules(compose, &results)?;

        if compose.gather.set(results).is_err() {
            warn!("Gather results of this compose were already recorded; keeping the first ones");
        }
        if compose.rpms.set(rpms).is_err() {
            warn!("RPM manifest of this compose was already recorded; keeping the first one");
        }
        Ok(())
    }
}

/// Every configured lookaside repository, loaded once, keyed by location
fn load_lookaside(compose: &Compose) -> Result<BTreeMap<String, Vec<Arc<PackageRecord>>>> {
    let mut locations: Vec<String> = compose
        .config
        .lookaside_repos
        .iter()
        .flat_map(|r| r.value.repos.iter().cloned())
        .collect();
    locations.sort();
    locations.dedup();
    if locations.is_empty() {
        return Ok(BTreeMap::new());
    }

    let client = if locations.iter().any(|l| repository::is_remote(l)) {
        Some(RepositoryClient::new()?)
    } else {
        None
    };
    let mut loaded = BTreeMap::new();
    for (idx, location) in locations.into_iter().enumerate() {
        let repo = Repository::new(format!("lookaside-{}", idx), location.clone());
        let records = repo.load(client.as_ref())?;
        loaded.insert(location, records.into_iter().map(Arc::new).collect());
    }
    Ok(loaded)
}

fn reuse_record(
    compose: &Compose,
    prepopulate: Option<&Prepopulate>,
    source_mapping: Option<&SourceMapping>,
    lookaside: &BTreeMap<String, Vec<Arc<PackageRecord>>>,
) -> Result<ReuseRecord> {
    let comps_digest = match compose.comps() {
        Some(comps) => Some(format!("{:x}", Sha256::digest(comps.to_xml()?.as_bytes()))),
        None => None,
    };
    let lookaside_digest: BTreeMap<&String, String> = lookaside
        .iter()
        .map(|(location, records)| {
            let mut hasher = Sha256::new();
            for record in records {
                hasher.update(record.nevra().to_string().as_bytes());
                hasher.update(b"\n");
            }
            (location, format!("{:x}", hasher.finalize()))
        })
        .collect();
    let module_defaults = compose
        .module_defaults
        .get()
        .map(|d| d.streams().clone())
        .unwrap_or_default();

    Ok(ReuseRecord::new("gather")
        .with_all(compose.config.capture(REUSE_KEYS))
        .with("arches", compose.arches())
        .with("variants", &compose.variants)
        .with("comps", comps_digest)
        .with("module_defaults", module_defaults)
        .with("prepopulate", prepopulate)
        .with("source_mapping", source_mapping)
        .with("lookaside", lookaside_digest)
        .with("package_set", compose.package_set()?.digest()))
}

/// Load the saved results of an old compose; `None` if any of them cannot be
/// resolved against the current package set
fn reload(
    compose: &Compose,
    engine: &LayeringEngine<'_>,
    module_defaults: &ModuleDefaults,
    old_topdir: &Path,
    arches: &[String],
) -> Option<VariantResults> {
    let pkgset = compose.package_set().ok()?;
    let mut results = VariantResults::default();
    for arch in arches {
        let pool = engine.reuse_pool(arch);
        for id in compose.variants.ids() {
            let variant = compose.variants.get(id);
            if !variant.has_arch(arch) || variant.is_empty {
                continue;
            }
            let path = compose.paths.gather_result(variant, arch);
            let old_path = old_topdir.join(path.strip_prefix(compose.topdir()).ok()?);
            let loaded = read_json::<SavedResult>(&old_path)
                .and_then(|saved| GatherResult::from_saved(&saved, &pool));
            let result = match loaded {
                Ok(result) => result,
                Err(e) => {
                    info!("Not reusing gather results: {}", e);
                    return None;
                }
            };
            let layering_path = old_topdir.join(
                compose
                    .paths
                    .gather_layering(variant, arch)
                    .strip_prefix(compose.topdir())
                    .ok()?,
            );
            let layering: LayeringRecord = match read_json(&layering_path) {
                Ok(record) => record,
                Err(e) => {
                    info!("Not reusing gather results: {}", e);
                    return None;
                }
            };
            let modules = variant_modules(&variant.modules, pkgset.modules(), module_defaults).ok()?;
            results
                .modules
                .insert((variant.uid.clone(), arch.clone()), modules.into_iter().cloned().collect());
            results.insert(&variant.uid, arch, result);
            results.restore_layering(&variant.uid, arch, layering);
        }
    }
    Some(results)
}

fn save_results(compose: &Compose, results: &VariantResults) -> Result<()> {
    for ((uid, arch), result) in &results.results {
        let id = compose
            .variants
            .by_uid(uid)
            .ok_or_else(|| Error::Config(format!("Unknown variant {}", uid)))?;
        let variant = compose.variants.get(id);
        let path = compose.paths.gather_result(variant, arch);
        write_json(&path, &result.to_saved())?;
        write_json(
            &compose.paths.gather_layering(variant, arch),
            &results.layering(uid, arch),
        )?;
        debug!("Saved {}", path.display());
    }
    Ok(())
}

/// Link every gathered package and collect the RPM manifest
fn link_packages(compose: &Compose, results: &VariantResults) -> Result<RpmManifest> {
    let config = &compose.config;
    let download_dir = compose.paths.download_dir();
    let needs_client = results
        .results
        .values()
        .flat_map(|r| r.rpm.iter().chain(&r.srpm).chain(&r.debuginfo))
        .any(|p| !p.is_lookaside() && repository::is_remote(&p.record.path.to_string_lossy()));
    let client = if needs_client {
        Some(RepositoryClient::new()?)
    } else {
        None
    };
    let fetch = |record: &PackageRecord| {
        repository::fetch_package(record, &download_dir, client.as_ref())
    };

    let linker = PackageLinker::new(
        &compose.paths,
        config.gather_link_type,
        config.hashed_directories,
        config.link_workers,
    );
    let mut manifest = RpmManifest::new(compose.identity.clone());
    for ((uid, arch), result) in &results.results {
        compose.cancel.check()?;
        let Some(id) = compose.variants.by_uid(uid) else {
            continue;
        };
        let variant = compose.variants.get(id);
        for linked in linker.link_variant(variant, arch, result, fetch)? {
            manifest.add(
                uid,
                arch,
                linked.category,
                &linked.srpm_nevra,
                &linked.nevra,
                linked.entry,
            );
        }
    }
    Ok(manifest)
}

/// Write the modulemd document of every enabled module and `modules.json`
fn write_modules(compose: &Compose, results: &VariantResults) -> Result<()> {
    let mut manifest = ModulesManifest::new(compose.identity.clone());
    for ((uid, arch), modules) in &results.modules {
        let Some(id) = compose.variants.by_uid(uid) else {
            continue;
        };
        let variant = compose.variants.get(id);
        for module in modules {
            let nsvc = module.nsvc();
            let path = compose.paths.modulemd_file(variant, arch, &nsvc);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &module.modulemd)?;
            manifest.add(
                uid,
                arch,
                &nsvc,
                ModuleEntry {
                    koji_tag: module.koji_tag.clone(),
                    modulemd_path: compose.paths.relative_to_top(&path)?,
                    rpms: module.rpms.clone(),
                },
            );
        }
    }
    if !manifest.is_empty() {
        manifest.write(&compose.paths.metadata_dir().join(MODULES_FILE))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::test_compose;
    use crate::pkgset::{PackageSetBuilder, SigkeyPolicy};
    use crate::version::Evr;

    fn write_rpm(dir: &Path, name: &str) -> std::path::PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        path
    }

    fn compose_with_packages(dir: &Path) -> Compose {
        let compose = test_compose(dir);
        let repo = dir.join("repo");
        let records = vec![
            PackageRecord::new("dummy-kernel", Evr::new(0, "3.1.0", "1"), "x86_64")
                .with_sourcerpm("dummy-kernel-3.1.0-1.src.rpm")
                .with_repo("main")
                .with_path(write_rpm(&repo, "dummy-kernel-3.1.0-1.x86_64.rpm")),
            PackageRecord::new("dummy-kernel", Evr::new(0, "3.1.0", "1"), "src")
                .with_repo("main")
                .with_path(write_rpm(&repo, "dummy-kernel-3.1.0-1.src.rpm")),
        ];
        let mut builder = PackageSetBuilder::new(vec!["x86_64".to_string()], SigkeyPolicy::default());
        for record in records {
            builder.insert(record, None).unwrap();
        }
        let _ = compose.pkgset.set(builder.finish());
        compose
    }

    fn mapping(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("mapping.json");
        fs::write(&path, r#"{"Server": {"x86_64": ["dummy-kernel"]}}"#).unwrap();
        path
    }

    #[test]
    fn test_gather_links_and_writes_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut compose = compose_with_packages(dir.path());
        compose.config.gather_source_mapping = Some(mapping(dir.path()));

        Phase::new("gather", Box::new(GatherPhase)).run(&compose).unwrap();

        let results = compose.gather_results().unwrap();
        let server = results.get("Server", "x86_64").unwrap();
        assert_eq!(server.rpm.len(), 1);
        assert_eq!(server.srpm.len(), 1);

        let top = compose.topdir();
        assert!(top.join("compose/Server/x86_64/os/Packages/dummy-kernel-3.1.0-1.x86_64.rpm").is_file());
        assert!(top.join("compose/Server/source/tree/Packages/dummy-kernel-3.1.0-1.src.rpm").is_file());
        assert!(top.join("work/x86_64/gather/Server.json").is_file());
        assert!(compose.paths.reuse_record("gather").is_file());

        let manifest = RpmManifest::load(&top.join("compose/metadata/rpms.json")).unwrap();
        let entries = manifest.entries("Server", "x86_64");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(_, srpm, _, _)| *srpm == "dummy-kernel-0:3.1.0-1.src"));
    }

    #[test]
    fn test_reuse_reloads_saved_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut first = compose_with_packages(dir.path());
        first.config.gather_source_mapping = Some(mapping(dir.path()));
        let phase = Phase::new("gather", Box::new(GatherPhase));
        phase.run(&first).unwrap();
        first.finish(false).unwrap();

        // Mark the old result so a reload is visible
        let saved_path = first.topdir().join("work/x86_64/gather/Server.json");
        let mut saved: SavedResult = read_json(&saved_path).unwrap();
        saved.missing_sources.push("marker".to_string());
        write_json(&saved_path, &saved).unwrap();
        let layering_path = first.topdir().join("work/x86_64/gather/Server.layering.json");
        let mut layering: LayeringRecord = read_json(&layering_path).unwrap();
        layering.trim.removed = 7;
        layering.system_release.chosen = Some("dummy-release-server".to_string());
        write_json(&layering_path, &layering).unwrap();

        let mut second = compose_with_packages(dir.path());
        second.config.gather_source_mapping = Some(mapping(dir.path()));
        second.options.old_composes = vec![first.topdir().to_path_buf()];
        phase.run(&second).unwrap();
        let server = second.gather_results().unwrap().get("Server", "x86_64").unwrap();
        assert_eq!(server.missing_sources, vec!["marker".to_string()]);
        let restored = second.gather_results().unwrap().layering("Server", "x86_64");
        assert_eq!(restored.trim.removed, 7);
        assert_eq!(restored.system_release.chosen.as_deref(), Some("dummy-release-server"));

        // A captured input change runs the gather again
        let mut third = compose_with_packages(dir.path());
        third.config.gather_source_mapping = Some(mapping(dir.path()));
        third.config.gather_fulltree = true;
        third.options.old_composes = vec![first.topdir().to_path_buf()];
        phase.run(&third).unwrap();
        let server = third.gather_results().unwrap().get("Server", "x86_64").unwrap();
        assert!(server.missing_sources.is_empty());

        // An input outside the record does not
        let mut fourth = compose_with_packages(dir.path());
        fourth.config.gather_source_mapping = Some(mapping(dir.path()));
        fourth.config.link_workers = 2;
        fourth.options.old_composes = vec![first.topdir().to_path_buf()];
        phase.run(&fourth).unwrap();
        let server = fourth.gather_results().unwrap().get("Server", "x86_64").unwrap();
        assert_eq!(server.missing_sources, vec!["marker".to_string()]);
    }

    #[test]
    fn test_second_run_keeps_first_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut compose = compose_with_packages(dir.path());
        compose.config.gather_source_mapping = Some(mapping(dir.path()));
        let phase = Phase::new("gather", Box::new(GatherPhase));
        phase.run(&compose).unwrap();
        let first = compose.gather_results().unwrap().get("Server", "x86_64").unwrap().clone();

        phase.run(&compose).unwrap();
        let kept = compose.gather_results().unwrap().get("Server", "x86_64").unwrap();
        assert_eq!(kept.to_saved(), first.to_saved());
        assert!(compose
            .topdir()
            .join("compose/Server/x86_64/os/Packages/dummy-kernel-3.1.0-1.x86_64.rpm")
            .is_file());
    }
}
