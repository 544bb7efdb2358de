// src/phases/pkgset.rs

//! pkgset phase
//!
//! Builds the global package set from `pkgset_repos` or from Koji and saves
//! a snapshot of it under `work/global/pkgset/`. A repository-backed set is
//! reused from an old compose when the configuration and every repository's
//! `repomd.xml` are unchanged.

use super::reuse::{ReuseRecord, find_reusable};
use super::{Phase, PhaseBody};
use crate::compose::Compose;
use crate::config::{Config, PkgsetSource};
use crate::error::{Error, Result};
use crate::manifest::{read_json, write_json};
use crate::pkgset::koji::KojiProvider;
use crate::pkgset::{PackageSet, PackageSetBuilder, PackageSetSnapshot, RepoProvider, SigkeyPolicy};
use crate::repository::{self, Repository};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const REUSE_KEYS: &[&str] = &["pkgset_source", "pkgset_repos", "sigkeys", "tree_arches"];

pub struct PkgsetPhase;

impl PhaseBody for PkgsetPhase {
    fn validate(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        if compose.config.pkgset_source == PkgsetSource::Koji && compose.koji.is_none() {
            return Err(Error::Config(
                "pkgset_source = \"koji\" but no Koji session is available".to_string(),
            ));
        }
        Ok(())
    }

    fn run(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        let record = reuse_record(compose);
        let reused = record.as_ref().and_then(|r| reuse(compose, r));
        let pkgset = match reused {
            Some(pkgset) => pkgset,
            None => build(compose)?,
        };

        write_json(&snapshot_path(compose.topdir()), &pkgset.snapshot())?;
        if let Some(record) = record {
            record.save(compose)?;
        }
        info!(
            "Package set has {} packages for {}",
            pkgset.len(),
            pkgset.arches().join(", ")
        );
        let _ = compose.pkgset.set(pkgset);
        Ok(())
    }
}

fn snapshot_path(topdir: &Path) -> PathBuf {
    topdir
        .join("work")
        .join("global")
        .join("pkgset")
        .join("package-set.json")
}

/// Map `pkgset_repos` onto named repositories
pub fn repositories(config: &Config) -> BTreeMap<String, Vec<Repository>> {
    config
        .pkgset_repos
        .iter()
        .map(|(arch, locations)| {
            let repos = locations
                .iter()
                .enumerate()
                .map(|(idx, loc)| Repository::new(format!("pkgset-{}-{}", arch, idx), loc.clone()))
                .collect();
            (arch.clone(), repos)
        })
        .collect()
}

fn build(compose: &Compose) -> Result<PackageSet> {
    let config = &compose.config;
    let sigkeys = SigkeyPolicy::new(&config.sigkeys);
    let download_dir = compose.paths.download_dir();
    let mut builder = PackageSetBuilder::new(compose.arches(), sigkeys.clone());

    match config.pkgset_source {
        PkgsetSource::Repos => {
            let provider = RepoProvider::new("pkgset_repos", repositories(config), &download_dir)?;
            builder.add_provider(&provider)?;
        }
        PkgsetSource::Koji => {
            let session = compose
                .koji
                .clone()
                .ok_or_else(|| Error::Config("No Koji session for pkgset_source = \"koji\"".to_string()))?;
            let provider = KojiProvider::new(
                session,
                config.koji_topdir.clone().unwrap_or_default(),
                config.pkgset_koji_tag.clone(),
                config.pkgset_koji_inherit,
                config.pkgset_koji_builds.clone(),
                sigkeys,
                &download_dir,
            )?;
            builder.add_provider(&provider)?;
        }
    }
    Ok(builder.finish())
}

/// Fingerprint of a local repository: its `repomd.xml` digest, or the list
/// of RPM files of a plain directory
fn fingerprint(location: &str) -> Option<String> {
    let dir = Path::new(location);
    let repomd = dir.join("repodata").join("repomd.xml");
    if repomd.is_file() {
        let bytes = fs::read(&repomd).ok()?;
        return Some(format!("{:x}", Sha256::digest(&bytes)));
    }
    let mut hasher = Sha256::new();
    let mut files: Vec<PathBuf> = glob::glob(&format!("{}/**/*.rpm", dir.display()))
        .ok()?
        .filter_map(|p| p.ok())
        .collect();
    files.sort();
    for file in files {
        let meta = fs::metadata(&file).ok()?;
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(meta.len().to_le_bytes());
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// Reuse inputs; `None` when the set cannot be reused (Koji or remote repos)
fn reuse_record(compose: &Compose) -> Option<ReuseRecord> {
    let config = &compose.config;
    if config.pkgset_source != PkgsetSource::Repos {
        return None;
    }
    let mut fingerprints = BTreeMap::new();
    for location in config.pkgset_repos.values().flatten() {
        if repository::is_remote(location) {
            debug!("Not reusing package sets with remote repository {}", location);
            return None;
        }
        fingerprints.insert(location.clone(), fingerprint(location)?);
    }
    Some(
        ReuseRecord::new("pkgset")
            .with_all(config.capture(REUSE_KEYS))
            .with("arches", compose.arches())
            .with("repositories", fingerprints),
    )
}

fn reuse(compose: &Compose, record: &ReuseRecord) -> Option<PackageSet> {
    let old = find_reusable(compose, record)?;
    let snapshot: PackageSetSnapshot = match read_json(&snapshot_path(&old)) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Cannot read package set of {}: {}", old.display(), e);
            return None;
        }
    };
    match PackageSet::from_snapshot(snapshot) {
        Ok(set) => Some(set),
        Err(e) => {
            warn!("Cannot reuse package set of {}: {}", old.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::test_compose;

    fn write_repo(dir: &Path) {
        fs::create_dir_all(dir.join("repodata")).unwrap();
        fs::write(
            dir.join("repodata/repomd.xml"),
            r#"<repomd><data type="primary"><location href="repodata/primary.xml"/></data></repomd>"#,
        )
        .unwrap();
        fs::write(
            dir.join("repodata/primary.xml"),
            r#"<metadata xmlns:rpm="http://linux.duke.edu/metadata/rpm">
<package type="rpm">
  <name>dummy-kernel</name>
  <arch>x86_64</arch>
  <version epoch="0" ver="3.1.0" rel="1"/>
  <location href="Packages/dummy-kernel-3.1.0-1.x86_64.rpm"/>
  <format><rpm:sourcerpm>dummy-kernel-3.1.0-1.src.rpm</rpm:sourcerpm></format>
</package>
</metadata>"#,
        )
        .unwrap();
    }

    #[test]
    fn test_builds_and_reuses_package_set() {
        let dir = tempfile::TempDir::new().unwrap();
        write_repo(&dir.path().join("repo"));

        let first = test_compose(dir.path());
        let phase = Phase::new("pkgset", Box::new(PkgsetPhase));
        phase.run(&first).unwrap();
        assert_eq!(first.package_set().unwrap().arch_packages("x86_64").len(), 1);
        assert!(first.paths.reuse_record("pkgset").is_file());
        first.finish(false).unwrap();

        // The old snapshot is used, so primary.xml is never read again
        fs::remove_file(dir.path().join("repo/repodata/primary.xml")).unwrap();
        let mut second = test_compose(dir.path());
        second.options.old_composes = vec![dir.path().to_path_buf()];
        phase.run(&second).unwrap();
        assert_eq!(
            second.package_set().unwrap().digest(),
            first.package_set().unwrap().digest()
        );
    }

    #[test]
    fn test_changed_sigkeys_rebuild() {
        let dir = tempfile::TempDir::new().unwrap();
        write_repo(&dir.path().join("repo"));
        let first = test_compose(dir.path());
        let old = reuse_record(&first).unwrap();

        let mut second = test_compose(dir.path());
        second.config.sigkeys = vec!["a15b79cc".to_string()];
        let new = reuse_record(&second).unwrap();
        assert!(matches!(new.check_against(&old), Err(Error::ReuseInvalidated(_))));
    }

    #[test]
    fn test_missing_repository_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let compose = test_compose(dir.path());
        let err = Phase::new("pkgset", Box::new(PkgsetPhase))
            .run(&compose)
            .unwrap_err();
        assert!(matches!(err, Error::InputNotFound(_)));
    }
}
