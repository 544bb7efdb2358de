// src/pkgset/mod.rs

//! Global package set
//!
//! The package set is built once at the end of the pkgset phase from one or
//! more `PackageProvider`s and is read-only afterwards. It keeps every
//! record once (keyed by NEVRA), an arch-compatible view per tree arch, and
//! the module builds the providers know about.

pub mod koji;
pub mod xmlrpc;

use crate::arch;
use crate::error::{Error, Result};
use crate::packages::{Nevra, PackageRecord};
use crate::repository::{self, Repository, RepositoryClient};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Source of candidate packages (repository-backed or Koji-backed)
pub trait PackageProvider: Send + Sync {
    /// Short name used in log messages
    fn name(&self) -> &str;

    /// Records offered for a tree arch; `"src"` lists source packages
    fn list(&self, arch: &str) -> Result<Vec<PackageRecord>>;

    /// Local path of a record's package file
    fn fetch(&self, record: &PackageRecord) -> Result<PathBuf>;

    /// Module builds whose RPMs this provider lists
    fn module_builds(&self) -> Result<Vec<ModuleBuild>> {
        Ok(Vec::new())
    }
}

/// A module build and the NEVRAs of the RPMs it contains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleBuild {
    pub name: String,
    pub stream: String,
    pub version: u64,
    pub context: String,
    /// Koji tag holding the module's content
    pub koji_tag: String,
    /// The modulemd YAML document of the build
    pub modulemd: String,
    /// `name-epoch:version-release.arch` strings
    pub rpms: Vec<String>,
}

impl ModuleBuild {
    /// `name:stream:version:context`
    pub fn nsvc(&self) -> String {
        format!("{}:{}:{}:{}", self.name, self.stream, self.version, self.context)
    }

    /// Names of the RPMs in this module
    pub fn rpm_names(&self) -> BTreeSet<String> {
        self.rpms
            .iter()
            .filter_map(|n| Nevra::parse(n).ok())
            .map(|n| n.name)
            .collect()
    }
}

/// Which signing keys are acceptable; `None` allows unsigned packages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigkeyPolicy {
    keys: Vec<Option<String>>,
}

impl SigkeyPolicy {
    /// Build from the configured key list; an empty string allows unsigned
    pub fn new(keys: &[String]) -> Self {
        Self {
            keys: keys
                .iter()
                .map(|k| {
                    let k = k.trim().to_ascii_lowercase();
                    if k.is_empty() { None } else { Some(k) }
                })
                .collect(),
        }
    }

    /// Key candidates in priority order
    pub fn keys(&self) -> &[Option<String>] {
        &self.keys
    }

    pub fn is_required(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn allows(&self, sigkey: Option<&str>) -> bool {
        if self.keys.is_empty() {
            return true;
        }
        let sigkey = sigkey.map(|k| k.trim().to_ascii_lowercase());
        self.keys.iter().any(|k| match (k, &sigkey) {
            (None, None) => true,
            // Short and long key ids name the same key when one ends the other
            (Some(want), Some(have)) => {
                !have.is_empty() && (want.ends_with(have.as_str()) || have.ends_with(want.as_str()))
            }
            _ => false,
        })
    }
}

/// Sort key used everywhere packages are iterated: name, arch, newest first
pub fn package_order(a: &PackageRecord, b: &PackageRecord) -> Ordering {
    a.name
        .cmp(&b.name)
        .then_with(|| a.arch.cmp(&b.arch))
        .then_with(|| b.evr.cmp(&a.evr))
        .then_with(|| a.repo.cmp(&b.repo))
        .then_with(|| a.path.cmp(&b.path))
}

/// The read-only global package set
#[derive(Debug, Clone, Default)]
pub struct PackageSet {
    arches: Vec<String>,
    global: BTreeMap<Nevra, Arc<PackageRecord>>,
    by_arch: BTreeMap<String, Vec<Arc<PackageRecord>>>,
    sources: Vec<Arc<PackageRecord>>,
    modules: Vec<ModuleBuild>,
}

impl PackageSet {
    /// Build directly from records, with no signature policy
    pub fn from_records(arches: &[String], records: Vec<PackageRecord>) -> Result<Self> {
        let mut builder = PackageSetBuilder::new(arches.to_vec(), SigkeyPolicy::default());
        for record in records {
            builder.insert(record, None)?;
        }
        Ok(builder.finish())
    }

    /// Tree arches the set was built for
    pub fn arches(&self) -> &[String] {
        &self.arches
    }

    /// Binary packages compatible with a tree arch, in package order
    pub fn arch_packages(&self, arch: &str) -> &[Arc<PackageRecord>] {
        self.by_arch.get(arch).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All source packages, in package order
    pub fn sources(&self) -> &[Arc<PackageRecord>] {
        &self.sources
    }

    /// Every record (binaries of all arches and sources), sorted by NEVRA
    pub fn all(&self) -> impl Iterator<Item = &Arc<PackageRecord>> {
        self.global.values()
    }

    pub fn get(&self, nevra: &Nevra) -> Option<&Arc<PackageRecord>> {
        self.global.get(nevra)
    }

    pub fn len(&self) -> usize {
        self.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    pub fn modules(&self) -> &[ModuleBuild] {
        &self.modules
    }

    /// Records visible to a gather on `arch` with the given enabled module
    /// builds: binaries compatible with the arch plus all sources.
    ///
    /// RPMs of module builds that are not enabled are hidden, and so are
    /// non-modular packages whose names are provided by an enabled module.
    pub fn view(&self, arch: &str, enabled_modules: &[&ModuleBuild]) -> Vec<Arc<PackageRecord>> {
        let enabled: BTreeSet<String> = enabled_modules.iter().map(|m| m.nsvc()).collect();
        let pinned_names: BTreeSet<String> = enabled_modules
            .iter()
            .flat_map(|m| m.rpm_names())
            .collect();

        self.arch_packages(arch)
            .iter()
            .chain(self.sources.iter())
            .filter(|pkg| match &pkg.module {
                Some(nsvc) => enabled.contains(nsvc),
                None => !pinned_names.contains(&pkg.name),
            })
            .cloned()
            .collect()
    }

    /// Serializable copy of the set, arch views included
    pub fn snapshot(&self) -> PackageSetSnapshot {
        PackageSetSnapshot {
            arches: self.arches.clone(),
            packages: self.global.values().map(|p| PackageRecord::clone(p)).collect(),
            arch_views: self
                .by_arch
                .iter()
                .map(|(arch, pkgs)| (arch.clone(), pkgs.iter().map(|p| p.nevra().to_string()).collect()))
                .collect(),
            modules: self.modules.clone(),
        }
    }

    /// Rebuild a set saved by `snapshot`
    pub fn from_snapshot(snapshot: PackageSetSnapshot) -> Result<Self> {
        let global: BTreeMap<Nevra, Arc<PackageRecord>> = snapshot
            .packages
            .into_iter()
            .map(|p| (p.nevra(), Arc::new(p)))
            .collect();
        let mut by_arch = BTreeMap::new();
        for (arch, nevras) in snapshot.arch_views {
            let pkgs = nevras
                .iter()
                .map(|n| {
                    let nevra = Nevra::parse(n)?;
                    global.get(&nevra).cloned().ok_or_else(|| {
                        Error::ReuseInvalidated(format!("{} is missing from the saved package set", n))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            by_arch.insert(arch, pkgs);
        }
        let mut sources: Vec<Arc<PackageRecord>> =
            global.values().filter(|p| p.is_source()).cloned().collect();
        sources.sort_by(|a, b| package_order(a, b));
        Ok(Self {
            arches: snapshot.arches,
            global,
            by_arch,
            sources,
            modules: snapshot.modules,
        })
    }

    /// Digest of every NVRA and signature in the set, for reuse records
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (nevra, pkg) in &self.global {
            hasher.update(nevra.to_string().as_bytes());
            hasher.update(b" ");
            hasher.update(pkg.sigkey.as_deref().unwrap_or("-").as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// On-disk package set (`work/global/pkgset/package-set.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSetSnapshot {
    pub arches: Vec<String>,
    pub packages: Vec<PackageRecord>,
    /// Tree arch → NEVRAs of its view, in package order
    pub arch_views: BTreeMap<String, Vec<String>>,
    pub modules: Vec<ModuleBuild>,
}

/// Accumulates provider output into a `PackageSet`
pub struct PackageSetBuilder {
    arches: Vec<String>,
    sigkeys: SigkeyPolicy,
    global: BTreeMap<Nevra, Arc<PackageRecord>>,
    by_arch: BTreeMap<String, BTreeMap<Nevra, Arc<PackageRecord>>>,
    modules: Vec<ModuleBuild>,
}

impl PackageSetBuilder {
    pub fn new(arches: Vec<String>, sigkeys: SigkeyPolicy) -> Self {
        Self {
            arches,
            sigkeys,
            global: BTreeMap::new(),
            by_arch: BTreeMap::new(),
            modules: Vec::new(),
        }
    }

    /// Add everything a provider lists; providers added first win ties
    pub fn add_provider(&mut self, provider: &dyn PackageProvider) -> Result<()> {
        info!("Reading package set from {}", provider.name());

        let mut list_arches: Vec<String> = self.arches.clone();
        list_arches.push("src".to_string());

        for list_arch in list_arches {
            let records = provider.list(&list_arch)?;
            debug!(
                "{} lists {} packages for {}",
                provider.name(),
                records.len(),
                list_arch
            );
            for record in records {
                let tree_arch = (list_arch != "src").then_some(list_arch.as_str());
                self.insert(record, tree_arch)?;
            }
        }

        for module in provider.module_builds()? {
            if !self.modules.iter().any(|m| m.nsvc() == module.nsvc()) {
                self.modules.push(module);
            }
        }
        Ok(())
    }

    /// Insert one record; `tree_arch` restricts the arch view it joins
    /// (`None` offers it to every compatible tree arch).
    pub fn insert(&mut self, record: PackageRecord, tree_arch: Option<&str>) -> Result<()> {
        if !self.sigkeys.allows(record.sigkey.as_deref()) {
            return Err(Error::MissingSignature(format!(
                "{} is not signed with any of the required keys (has {})",
                record.nvra(),
                record.sigkey.as_deref().unwrap_or("no signature")
            )));
        }

        let nevra = record.nevra();
        let record = match self.global.get(&nevra) {
            Some(existing) => {
                if existing.sigkey != record.sigkey {
                    return Err(Error::DuplicateSignature(format!(
                        "{} is signed with {} in {} but with {} in {}",
                        nevra,
                        existing.sigkey.as_deref().unwrap_or("no key"),
                        existing.repo,
                        record.sigkey.as_deref().unwrap_or("no key"),
                        record.repo
                    )));
                }
                if existing.module != record.module {
                    warn!("{} belongs to more than one module build", nevra);
                }
                Arc::clone(existing)
            }
            None => {
                let record = Arc::new(record);
                self.global.insert(nevra.clone(), Arc::clone(&record));
                record
            }
        };

        if record.is_source() {
            return Ok(());
        }

        let targets: Vec<String> = match tree_arch {
            Some(a) => vec![a.to_string()],
            None => self.arches.clone(),
        };
        for tree in targets {
            if !arch::is_compatible(&tree, &record.arch) {
                continue;
            }
            if record.is_excluded_for(&tree) {
                debug!("{} excluded on {} by its arch headers", record.nvra(), tree);
                continue;
            }
            self.by_arch
                .entry(tree)
                .or_default()
                .insert(nevra.clone(), Arc::clone(&record));
        }
        Ok(())
    }

    pub fn add_module(&mut self, module: ModuleBuild) {
        self.modules.push(module);
    }

    pub fn finish(self) -> PackageSet {
        let mut sources: Vec<Arc<PackageRecord>> = self
            .global
            .values()
            .filter(|p| p.is_source())
            .cloned()
            .collect();
        sources.sort_by(|a, b| package_order(a, b));

        let by_arch = self
            .by_arch
            .into_iter()
            .map(|(arch, pkgs)| {
                let mut pkgs: Vec<_> = pkgs.into_values().collect();
                pkgs.sort_by(|a, b| package_order(a, b));
                (arch, pkgs)
            })
            .collect();

        let mut modules = self.modules;
        modules.sort_by_key(|m| m.nsvc());

        info!(
            "Package set complete: {} packages, {} sources, {} module builds",
            self.global.len(),
            sources.len(),
            modules.len()
        );

        PackageSet {
            arches: self.arches,
            global: self.global,
            by_arch,
            sources,
            modules,
        }
    }
}

/// Repository-backed provider: arch → list of repository locations
pub struct RepoProvider {
    name: String,
    repos: BTreeMap<String, Vec<Repository>>,
    client: Option<RepositoryClient>,
    download_dir: PathBuf,
    cache: Mutex<HashMap<String, Vec<PackageRecord>>>,
}

impl RepoProvider {
    pub fn new(
        name: impl Into<String>,
        repos: BTreeMap<String, Vec<Repository>>,
        download_dir: &Path,
    ) -> Result<Self> {
        let needs_client = repos
            .values()
            .flatten()
            .any(|r| repository::is_remote(&r.location));
        let client = if needs_client {
            Some(RepositoryClient::new()?)
        } else {
            None
        };
        Ok(Self {
            name: name.into(),
            repos,
            client,
            download_dir: download_dir.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn load_cached(&self, repo: &Repository) -> Result<Vec<PackageRecord>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::IoError("Repository cache lock poisoned".to_string()))?;
        if let Some(records) = cache.get(&repo.location) {
            return Ok(records.clone());
        }
        let records = repo.load(self.client.as_ref())?;
        cache.insert(repo.location.clone(), records.clone());
        Ok(records)
    }
}

impl PackageProvider for RepoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn list(&self, arch: &str) -> Result<Vec<PackageRecord>> {
        let Some(repos) = self.repos.get(arch) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for repo in repos {
            let loaded = self.load_cached(repo)?;
            records.extend(loaded.into_iter().filter(|p| {
                if arch == "src" {
                    p.is_source()
                } else {
                    p.is_source() || arch::is_compatible(arch, &p.arch)
                }
            }));
        }
        Ok(records)
    }

    fn fetch(&self, record: &PackageRecord) -> Result<PathBuf> {
        repository::fetch_package(record, &self.download_dir, self.client.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Evr;

    fn pkg(name: &str, ver: &str, arch: &str) -> PackageRecord {
        PackageRecord::new(name, Evr::new(0, ver, "1"), arch)
            .with_sourcerpm(format!("{}-{}-1.src.rpm", name, ver))
            .with_repo("main")
    }

    fn arches() -> Vec<String> {
        vec!["x86_64".to_string(), "aarch64".to_string()]
    }

    #[test]
    fn test_arch_views() {
        let set = PackageSet::from_records(
            &arches(),
            vec![
                pkg("a", "1", "x86_64"),
                pkg("a", "1", "i686"),
                pkg("a", "1", "aarch64"),
                pkg("doc", "1", "noarch"),
                PackageRecord::new("a", Evr::new(0, "1", "1"), "src"),
            ],
        )
        .unwrap();

        let x86: Vec<String> = set.arch_packages("x86_64").iter().map(|p| p.nvra()).collect();
        assert_eq!(x86, vec!["a-1-1.i686", "a-1-1.x86_64", "doc-1-1.noarch"]);
        assert_eq!(set.arch_packages("aarch64").len(), 2);
        assert_eq!(set.sources().len(), 1);
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn test_exclusive_arch_is_honored() {
        let mut efi = pkg("efi", "1", "noarch");
        efi.exclusivearch = vec!["x86_64".to_string()];
        let set = PackageSet::from_records(&arches(), vec![efi]).unwrap();
        assert_eq!(set.arch_packages("x86_64").len(), 1);
        assert!(set.arch_packages("aarch64").is_empty());
    }

    #[test]
    fn test_duplicate_signature_is_fatal() {
        let mut builder = PackageSetBuilder::new(arches(), SigkeyPolicy::default());
        builder.insert(pkg("a", "1", "x86_64").with_sigkey("aaaa1111"), None).unwrap();
        let result = builder.insert(pkg("a", "1", "x86_64").with_sigkey("bbbb2222"), None);
        assert!(matches!(result, Err(Error::DuplicateSignature(_))));
    }

    #[test]
    fn test_same_signature_keeps_first_source() {
        let mut builder = PackageSetBuilder::new(arches(), SigkeyPolicy::default());
        builder.insert(pkg("a", "1", "x86_64").with_repo("first"), None).unwrap();
        builder.insert(pkg("a", "1", "x86_64").with_repo("second"), None).unwrap();
        let set = builder.finish();
        assert_eq!(set.arch_packages("x86_64")[0].repo, "first");
    }

    #[test]
    fn test_sigkey_policy() {
        let policy = SigkeyPolicy::new(&["A15B79CC".to_string()]);
        assert!(policy.is_required());
        assert!(policy.allows(Some("a15b79cc")));
        assert!(policy.allows(Some("0123456789abcdefa15b79cc")));
        assert!(!policy.allows(None));
        assert!(!policy.allows(Some("deadbeef")));
        assert!(!policy.allows(Some("")));
        assert!(!policy.allows(Some("clé-ünïcødé")));
        assert!(policy.allows(Some(" A15B79CC ")));

        let with_unsigned = SigkeyPolicy::new(&["a15b79cc".to_string(), String::new()]);
        assert!(with_unsigned.allows(None));

        let mut builder = PackageSetBuilder::new(arches(), policy);
        let result = builder.insert(pkg("a", "1", "x86_64"), None);
        assert!(matches!(result, Err(Error::MissingSignature(_))));
    }

    #[test]
    fn test_module_view_hides_other_streams() {
        let mut modular = pkg("nodejs", "12", "x86_64");
        modular.module = Some("nodejs:12:1:abc".to_string());
        let mut other_stream = pkg("nodejs", "14", "x86_64");
        other_stream.module = Some("nodejs:14:1:def".to_string());
        let plain = pkg("nodejs", "10", "x86_64");
        let unrelated = pkg("bash", "5", "x86_64");

        let mut builder = PackageSetBuilder::new(arches(), SigkeyPolicy::default());
        for p in [modular, other_stream, plain, unrelated] {
            builder.insert(p, None).unwrap();
        }
        let module = ModuleBuild {
            name: "nodejs".to_string(),
            stream: "12".to_string(),
            version: 1,
            context: "abc".to_string(),
            koji_tag: "module-nodejs-12".to_string(),
            modulemd: String::new(),
            rpms: vec!["nodejs-0:12-1.x86_64".to_string()],
        };
        builder.add_module(module.clone());
        let set = builder.finish();

        let view: Vec<String> = set.view("x86_64", &[&module]).iter().map(|p| p.nvra()).collect();
        assert_eq!(view, vec!["bash-5-1.x86_64", "nodejs-12-1.x86_64"]);

        let no_modules: Vec<String> = set.view("x86_64", &[]).iter().map(|p| p.nvra()).collect();
        assert_eq!(no_modules, vec!["bash-5-1.x86_64", "nodejs-10-1.x86_64"]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let set = PackageSet::from_records(
            &arches(),
            vec![
                pkg("a", "1", "x86_64"),
                pkg("doc", "1", "noarch"),
                PackageRecord::new("a", Evr::new(0, "1", "1"), "src"),
            ],
        )
        .unwrap();
        let json = serde_json::to_string(&set.snapshot()).unwrap();
        let restored = PackageSet::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.digest(), set.digest());
        assert_eq!(restored.arch_packages("x86_64").len(), 2);
        assert_eq!(restored.sources().len(), 1);

        let mut broken = set.snapshot();
        broken.packages.retain(|p| p.name != "doc");
        assert!(matches!(
            PackageSet::from_snapshot(broken),
            Err(Error::ReuseInvalidated(_))
        ));
    }

    #[test]
    fn test_digest_is_stable() {
        let a = PackageSet::from_records(&arches(), vec![pkg("a", "1", "x86_64"), pkg("b", "1", "noarch")]).unwrap();
        let b = PackageSet::from_records(&arches(), vec![pkg("b", "1", "noarch"), pkg("a", "1", "x86_64")]).unwrap();
        assert_eq!(a.digest(), b.digest());
        let c = PackageSet::from_records(&arches(), vec![pkg("a", "2", "x86_64")]).unwrap();
        assert_ne!(a.digest(), c.digest());
    }
}
