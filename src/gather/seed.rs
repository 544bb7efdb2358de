// src/gather/seed.rs

//! Seed requests
//!
//! A seed request lists what one gather source asks for: package
//! specifications with their provenance flag, exclusions, conditional
//! packages, langpack patterns and module pins. Specifications use one
//! grammar everywhere:
//!
//! - `name` matches a package name, falling back to a Provides lookup
//! - `dummy-bash*` matches names by glob
//! - `name.arch` limits to one arch, `name.+` to the multilib arches

use super::Flag;
use super::pool::{PackagePool, PkgId};
use crate::arch::{self, ArchFilter};
use crate::comps::Comps;
use crate::config::{Config, Variant, VariantType};
use crate::error::{Error, Result};
use crate::packages::SYSTEM_RELEASE;
use crate::version::Capability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// A parsed package specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub pattern: String,
    pub arch: Option<ArchFilter>,
    is_glob: bool,
}

impl PackageSpec {
    pub fn parse(spec: &str) -> Self {
        let (pattern, arch) = arch::split_arch_suffix(spec.trim());
        Self {
            pattern: pattern.to_string(),
            arch,
            is_glob: pattern.contains(['*', '?', '[']),
        }
    }

    pub fn is_glob(&self) -> bool {
        self.is_glob
    }

    pub fn matches_name(&self, name: &str) -> bool {
        if self.is_glob {
            glob::Pattern::new(&self.pattern)
                .map(|p| p.matches(name))
                .unwrap_or(false)
        } else {
            self.pattern == name
        }
    }

    pub fn accepts_arch(&self, tree_arch: &str, pkg_arch: &str) -> bool {
        self.arch
            .as_ref()
            .is_none_or(|filter| filter.accepts(tree_arch, pkg_arch))
    }

    /// Whether a pool entry matches by name and arch
    pub fn matches(&self, pool: &PackagePool, id: PkgId) -> bool {
        let record = pool.record(id);
        self.matches_name(&record.name) && self.accepts_arch(pool.tree_arch(), &record.arch)
    }

    /// Non-debug binaries matching by name, in pool order
    pub fn by_name(&self, pool: &PackagePool) -> Vec<PkgId> {
        let ids: Vec<PkgId> = if self.is_glob {
            pool.names()
                .filter(|n| self.matches_name(n))
                .flat_map(|n| pool.by_name(n).iter().copied())
                .collect()
        } else {
            pool.by_name(&self.pattern).to_vec()
        };
        ids.into_iter()
            .filter(|id| self.accepts_arch(pool.tree_arch(), &pool.record(*id).arch))
            .collect()
    }

    /// Providers of the pattern taken as a capability
    pub fn by_provides(&self, pool: &PackagePool) -> Vec<PkgId> {
        if self.is_glob {
            return Vec::new();
        }
        pool.providers(&Capability::new(self.pattern.clone()))
            .into_iter()
            .filter(|id| self.accepts_arch(pool.tree_arch(), &pool.record(*id).arch))
            .collect()
    }
}

/// One requested package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPackage {
    pub spec: PackageSpec,
    pub flag: Flag,
    /// Source NVR the package must be built from (prepopulate entries)
    pub source: Option<String>,
}

/// What one gather source asks for on one (variant, arch)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedRequest {
    pub packages: Vec<SeedPackage>,
    pub excludes: Vec<PackageSpec>,
    /// (package, trigger): the package is added once the trigger is in
    pub conditional: Vec<(String, String)>,
    pub langpacks: BTreeMap<String, String>,
    /// NEVRAs that must be in the result exactly
    pub module_pins: Vec<String>,
}

impl SeedRequest {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.module_pins.is_empty()
    }

    /// Add a specification; a leading `-` makes it an exclusion
    pub fn add(&mut self, spec: &str, flag: Flag) {
        match spec.strip_prefix('-') {
            Some(excluded) => self.excludes.push(PackageSpec::parse(excluded)),
            None => self.packages.push(SeedPackage {
                spec: PackageSpec::parse(spec),
                flag,
                source: None,
            }),
        }
    }

    pub fn extend(&mut self, other: SeedRequest) {
        self.packages.extend(other.packages);
        self.excludes.extend(other.excludes);
        self.conditional.extend(other.conditional);
        self.langpacks.extend(other.langpacks);
        self.module_pins.extend(other.module_pins);
    }
}

/// `variant → arch → source NVR → [package spec]`
pub type Prepopulate = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<String>>>>;

/// `variant → arch → [package spec]`
pub type SourceMapping = BTreeMap<String, BTreeMap<String, Vec<String>>>;

pub fn load_prepopulate(path: &Path) -> Result<Prepopulate> {
    load_json(path, "prepopulate")
}

pub fn load_source_mapping(path: &Path) -> Result<SourceMapping> {
    load_json(path, "gather source mapping")
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::InputNotFound(format!("Cannot read {} file {}: {}", what, path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ParseError(format!("Invalid {} file {}: {}", what, path.display(), e)))
}

/// Seed of the `comps` source: group packages, additional packages and the
/// prepopulate entries of the (variant, arch)
pub fn comps_seed(
    config: &Config,
    variant: &Variant,
    arch: &str,
    comps: Option<&Comps>,
    prepopulate: Option<&Prepopulate>,
) -> SeedRequest {
    let mut seed = SeedRequest::default();

    if let Some(comps) = comps {
        for gref in &variant.groups {
            let Some(group) = comps.group(&gref.name) else {
                continue;
            };
            for pkg in group.packages_for(gref.policy) {
                match (&pkg.kind, &pkg.requires) {
                    (crate::comps::PackageKind::Conditional, Some(trigger)) => {
                        seed.conditional.push((pkg.name.clone(), trigger.clone()));
                    }
                    _ => seed.add(&pkg.name, Flag::Comps),
                }
            }
        }
        seed.langpacks = comps.langpacks.clone();
    }

    for spec in Config::packages_for(&config.additional_packages, &variant.uid, arch) {
        seed.add(&spec, Flag::Input);
    }

    if let Some(entries) = prepopulate
        .and_then(|p| p.get(&variant.uid))
        .and_then(|arches| arches.get(arch))
    {
        for (source, specs) in entries {
            for spec in specs {
                seed.packages.push(SeedPackage {
                    spec: PackageSpec::parse(spec),
                    flag: Flag::Prepopulate,
                    source: Some(source.clone()),
                });
            }
        }
    }
    debug!(
        "comps seed for {}.{}: {} packages, {} conditional",
        variant.uid,
        arch,
        seed.packages.len(),
        seed.conditional.len()
    );
    seed
}

/// Seed of the `json` source
pub fn json_seed(mapping: &SourceMapping, variant: &Variant, arch: &str) -> SeedRequest {
    let mut seed = SeedRequest::default();
    if let Some(specs) = mapping.get(&variant.uid).and_then(|a| a.get(arch)) {
        for spec in specs {
            seed.add(spec, Flag::Input);
        }
    }
    seed
}

/// Seed of the `module` source
pub fn module_seed(pins: Vec<String>) -> SeedRequest {
    SeedRequest {
        module_pins: pins,
        ..Default::default()
    }
}

/// Outcome of system-release selection for one variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRelease {
    pub chosen: Option<String>,
    /// Names of the other providers, added to the filter list
    pub filtered: Vec<String>,
}

/// Pick the one `system-release` provider a variant keeps.
///
/// Variants prefer a name ending in `release-<uid>` or starting with
/// `<uid>-release` and fall back to the first name; child variants keep the
/// parent's choice.
pub fn select_system_release(
    pool: &PackagePool,
    variant: &Variant,
    parent_choice: Option<&SystemRelease>,
) -> SystemRelease {
    let mut names: Vec<String> = pool
        .providers(&Capability::new(SYSTEM_RELEASE))
        .into_iter()
        .filter(|id| !pool.is_lookaside(*id))
        .map(|id| pool.record(id).name.clone())
        .collect();
    names.sort();
    names.dedup();
    if names.len() < 2 {
        return SystemRelease::default();
    }

    let chosen = match (variant.kind, parent_choice) {
        (VariantType::Variant, _) | (_, None) => {
            let uid = variant.uid.to_lowercase();
            names
                .iter()
                .find(|n| n.ends_with(&format!("release-{}", uid)) || n.starts_with(&format!("{}-release", uid)))
                .or_else(|| names.first())
                .cloned()
        }
        (_, Some(parent)) => parent.chosen.clone(),
    };
    let filtered = names
        .iter()
        .filter(|n| Some(*n) != chosen.as_ref())
        .cloned()
        .collect();
    SystemRelease { chosen, filtered }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariantTree;
    use crate::packages::PackageRecord;
    use crate::version::Evr;
    use std::sync::Arc;

    fn release(name: &str) -> Arc<PackageRecord> {
        Arc::new(
            PackageRecord::new(name, Evr::new(0, "1.0.0", "1"), "x86_64").provide("system-release"),
        )
    }

    fn tree() -> VariantTree {
        VariantTree::parse(
            r#"<variants>
  <variant id="Server" name="Server" type="variant">
    <arches><arch>x86_64</arch></arches>
    <variants>
      <variant id="HA" name="HA" type="addon"/>
    </variants>
  </variant>
  <variant id="Workstation" name="Workstation" type="variant">
    <arches><arch>x86_64</arch></arches>
  </variant>
</variants>"#,
        )
        .unwrap()
    }

    #[test]
    fn test_spec_grammar() {
        let spec = PackageSpec::parse("dummy-bash.+");
        assert_eq!(spec.pattern, "dummy-bash");
        assert_eq!(spec.arch, Some(ArchFilter::Multilib));
        assert!(spec.accepts_arch("x86_64", "i686"));
        assert!(!spec.accepts_arch("x86_64", "x86_64"));

        let glob = PackageSpec::parse("dummy-bash*");
        assert!(glob.is_glob());
        assert!(glob.matches_name("dummy-bash-doc"));

        let versioned_name = PackageSpec::parse("python3.11");
        assert_eq!(versioned_name.pattern, "python3.11");
        assert_eq!(versioned_name.arch, None);
    }

    #[test]
    fn test_exclusions_are_split_off() {
        let mut seed = SeedRequest::default();
        seed.add("dummy-bash.+", Flag::Input);
        seed.add("-dummy-bash-doc", Flag::Input);
        assert_eq!(seed.packages.len(), 1);
        assert_eq!(seed.excludes[0].pattern, "dummy-bash-doc");
    }

    #[test]
    fn test_system_release_prefers_variant_name() {
        let pool = PackagePool::new(
            "x86_64",
            &[
                release("dummy-release-client"),
                release("dummy-release-server"),
                release("dummy-release-workstation"),
            ],
            &[],
        );
        let tree = tree();
        let server = tree.get(tree.by_uid("Server").unwrap());
        let choice = select_system_release(&pool, server, None);
        assert_eq!(choice.chosen.as_deref(), Some("dummy-release-server"));
        assert_eq!(
            choice.filtered,
            vec!["dummy-release-client", "dummy-release-workstation"]
        );

        // Addons inherit the parent's choice
        let ha = tree.get(tree.by_uid("Server-HA").unwrap());
        let inherited = select_system_release(&pool, ha, Some(&choice));
        assert_eq!(inherited.chosen.as_deref(), Some("dummy-release-server"));
    }

    #[test]
    fn test_system_release_fallback_and_single() {
        let pool = PackagePool::new(
            "x86_64",
            &[release("dummy-release-client"), release("dummy-release-server")],
            &[],
        );
        let tree = tree();
        let ws = tree.get(tree.by_uid("Workstation").unwrap());
        let choice = select_system_release(&pool, ws, None);
        assert_eq!(choice.chosen.as_deref(), Some("dummy-release-client"));

        let single = PackagePool::new("x86_64", &[release("dummy-release-server")], &[]);
        assert_eq!(select_system_release(&single, ws, None), SystemRelease::default());
    }

    #[test]
    fn test_json_seed() {
        let mapping: SourceMapping = serde_json::from_str(
            r#"{"Server": {"x86_64": ["dummy-kernel", "-dummy-kernel-doc"]}}"#,
        )
        .unwrap();
        let tree = tree();
        let server = tree.get(tree.by_uid("Server").unwrap());
        let seed = json_seed(&mapping, server, "x86_64");
        assert_eq!(seed.packages.len(), 1);
        assert_eq!(seed.packages[0].flag, Flag::Input);
        assert_eq!(seed.excludes.len(), 1);
        assert!(json_seed(&mapping, server, "aarch64").is_empty());
    }
}
