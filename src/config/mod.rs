// src/config/mod.rs

//! Compose configuration
//!
//! The configuration is a TOML document deserialized into `Config`.
//! Deprecated keys are renamed before deserialization, unknown keys are
//! reported, and `Config::validate` collects every problem into a single
//! `Error::Config` before any phase runs.
//!
//! Per-(variant, arch) options share one rule shape:
//!
//! ```toml
//! [[filter_packages]]
//! variant = "^Server$"
//! arch = "*"
//! packages = ["dummy-bash-doc"]
//! ```

pub mod variants;

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub use variants::{GroupPolicy, Variant, VariantId, VariantTree, VariantType};

/// Deprecated key → current key
const DEPRECATED_KEYS: &[(&str, &str)] = &[
    ("gather_lookaside_repos", "lookaside_repos"),
    ("multilib_methods", "multilib"),
    ("link_type", "gather_link_type"),
    ("pkgset_koji_builds_list", "pkgset_koji_builds"),
];

/// Phases whose presence is decided by their own config block
pub const IMAGE_PHASES: &[&str] = &[
    "productimg",
    "buildinstall",
    "createiso",
    "extra_isos",
    "live_images",
    "image_build",
    "livemedia",
    "ostree",
    "ostree_installer",
    "osbs",
];

/// Every phase name the engine knows
pub const ALL_PHASES: &[&str] = &[
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PkgsetSource {
    #[default]
    Repos,
    Koji,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatherMethod {
    #[default]
    Deps,
    Nodeps,
    Hybrid,
}

/// Where seed packages of a gather run come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatherSource {
    Module,
    Comps,
    Json,
}

impl GatherSource {
    pub const ALL: [GatherSource; 3] = [GatherSource::Module, GatherSource::Comps, GatherSource::Json];
}

/// `gather_method`: one method, or one per source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GatherMethodConfig {
    Single(GatherMethod),
    PerSource(BTreeMap<GatherSource, GatherMethod>),
}

impl Default for GatherMethodConfig {
    fn default() -> Self {
        GatherMethodConfig::Single(GatherMethod::Deps)
    }
}

impl GatherMethodConfig {
    /// Method for a source, or `None` if that source is not gathered
    pub fn for_source(&self, source: GatherSource) -> Option<GatherMethod> {
        match self {
            GatherMethodConfig::Single(m) => Some(*m),
            GatherMethodConfig::PerSource(map) => map.get(&source).copied(),
        }
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self, GatherMethodConfig::Single(GatherMethod::Hybrid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GreedyMethod {
    #[default]
    None,
    All,
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LinkType {
    Hardlink,
    Copy,
    #[default]
    HardlinkOrCopy,
    Symlink,
    AbsoluteSymlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComposeType {
    #[default]
    Production,
    Nightly,
    Test,
    Ci,
}

impl ComposeType {
    /// Suffix appended to the compose date in the compose id
    pub fn suffix(&self) -> &'static str {
        match self {
            ComposeType::Production => "",
            ComposeType::Nightly => ".n",
            ComposeType::Test => ".t",
            ComposeType::Ci => ".ci",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComposeType::Production => "production",
            ComposeType::Nightly => "nightly",
            ComposeType::Test => "test",
            ComposeType::Ci => "ci",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunrootMethod {
    #[default]
    Local,
    Ssh,
    Koji,
}

/// A `{ variant = "<regex>", arch = "<glob>", ... }` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule<T> {
    #[serde(default = "match_all_variants")]
    pub variant: String,
    #[serde(default = "match_all_arches")]
    pub arch: String,
    #[serde(flatten)]
    pub value: T,
}

fn match_all_variants() -> String {
    ".*".to_string()
}

fn match_all_arches() -> String {
    "*".to_string()
}

impl<T> Rule<T> {
    /// Whether the rule applies to a (variant, arch); invalid patterns never
    /// match (they are rejected by validation)
    pub fn matches(&self, variant_uid: &str, arch: &str) -> bool {
        let variant_ok = anchored(&self.variant)
            .map(|re| re.is_match(variant_uid))
            .unwrap_or(false);
        let arch_ok = glob::Pattern::new(&self.arch)
            .map(|p| p.matches(arch))
            .unwrap_or(false);
        variant_ok && arch_ok
    }

    fn pattern_problems(&self, key: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = anchored(&self.variant) {
            problems.push(format!("{}: invalid variant regex '{}': {}", key, self.variant, e));
        }
        if let Err(e) = glob::Pattern::new(&self.arch) {
            problems.push(format!("{}: invalid arch glob '{}': {}", key, self.arch, e));
        }
        problems
    }
}

fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Values of every rule matching a (variant, arch), in config order
pub fn matching<'a, T>(rules: &'a [Rule<T>], variant_uid: &str, arch: &str) -> Vec<&'a T> {
    rules
        .iter()
        .filter(|r| r.matches(variant_uid, arch))
        .map(|r| &r.value)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageList {
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoList {
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultilibMethods {
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverables {
    #[serde(default)]
    pub deliverables: Vec<String>,
}

/// A file fetched into a tree by the extra_files phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFile {
    /// SCM spec: `file:<path>` or `git:<repo>#<ref>:<path>`
    pub scm: String,
    #[serde(default)]
    pub target: String,
}

/// One deliverable of an external image phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Command run through the runroot executor
    pub command: String,
    /// Output file, relative to the deliverable directory
    pub output: String,
    #[serde(default, rename = "type")]
    pub image_type: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub subvariant: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// The compose configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub release_name: String,
    pub release_short: String,
    pub release_version: String,
    pub release_type: String,
    pub release_is_layered: bool,
    pub base_product_name: Option<String>,
    pub base_product_short: Option<String>,
    pub base_product_version: Option<String>,
    pub base_product_type: Option<String>,
    pub compose_type: ComposeType,

    pub variants_file: PathBuf,
    pub comps_file: Option<PathBuf>,
    pub comps_filter_environments: bool,
    pub module_defaults_dir: Option<PathBuf>,
    pub tree_arches: Vec<String>,
    pub tree_variants: Vec<String>,

    pub pkgset_source: PkgsetSource,
    pub pkgset_repos: BTreeMap<String, Vec<String>>,
    pub koji_hub: Option<String>,
    pub koji_topdir: Option<String>,
    pub pkgset_koji_tag: Vec<String>,
    pub pkgset_koji_inherit: bool,
    pub pkgset_koji_builds: Vec<String>,
    pub sigkeys: Vec<String>,

    pub gather_method: GatherMethodConfig,
    pub gather_backend: String,
    pub greedy_method: GreedyMethod,
    pub multilib: Vec<Rule<MultilibMethods>>,
    pub multilib_whitelist: Vec<Rule<PackageList>>,
    pub multilib_blacklist: Vec<Rule<PackageList>>,
    pub filter_packages: Vec<Rule<PackageList>>,
    pub additional_packages: Vec<Rule<PackageList>>,
    pub filter_system_release_packages: bool,
    pub gather_fulltree: bool,
    pub gather_selfhosting: bool,
    pub gather_prepopulate: Option<PathBuf>,
    pub gather_source_mapping: Option<PathBuf>,
    pub lookaside_repos: Vec<Rule<RepoList>>,
    pub variant_as_lookaside: Vec<(String, String)>,
    pub check_deps: bool,
    pub gather_link_type: LinkType,
    pub hashed_directories: bool,
    pub link_workers: usize,

    pub skip_phases: Vec<String>,
    pub failable_deliverables: Vec<Rule<Deliverables>>,
    pub createrepo_command: String,
    pub createrepo_num_workers: usize,
    pub runroot_method: RunrootMethod,
    pub runroot_tag: Option<String>,
    pub runroot_channel: Option<String>,
    pub runroot_ssh_hosts: Vec<String>,
    pub runroot_weights: BTreeMap<String, u32>,
    pub notification_script: Option<PathBuf>,
    pub bootable: bool,
    pub test_phase_strict: bool,
    pub media_checksums: Vec<String>,
    pub extra_files: Vec<Rule<ExtraFile>>,

    /// Config blocks of external image phases, keyed by phase name
    #[serde(skip)]
    pub image_phases: BTreeMap<String, Vec<Rule<ImageSpec>>>,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub config_dir: PathBuf,

    #[serde(flatten)]
    other: BTreeMap<String, toml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            release_name: String::new(),
            release_short: String::new(),
            release_version: String::new(),
            release_type: "ga".to_string(),
            release_is_layered: false,
            base_product_name: None,
            base_product_short: None,
            base_product_version: None,
            base_product_type: None,
            compose_type: ComposeType::Production,
            variants_file: PathBuf::new(),
            comps_file: None,
            comps_filter_environments: true,
            module_defaults_dir: None,
            tree_arches: Vec::new(),
            tree_variants: Vec::new(),
            pkgset_source: PkgsetSource::Repos,
            pkgset_repos: BTreeMap::new(),
            koji_hub: None,
            koji_topdir: None,
            pkgset_koji_tag: Vec::new(),
            pkgset_koji_inherit: true,
            pkgset_koji_builds: Vec::new(),
            sigkeys: Vec::new(),
            gather_method: GatherMethodConfig::default(),
            gather_backend: "dnf".to_string(),
            greedy_method: GreedyMethod::None,
            multilib: Vec::new(),
            multilib_whitelist: Vec::new(),
            multilib_blacklist: Vec::new(),
            filter_packages: Vec::new(),
            additional_packages: Vec::new(),
            filter_system_release_packages: true,
            gather_fulltree: false,
            gather_selfhosting: false,
            gather_prepopulate: None,
            gather_source_mapping: None,
            lookaside_repos: Vec::new(),
            variant_as_lookaside: Vec::new(),
            check_deps: true,
            gather_link_type: LinkType::HardlinkOrCopy,
            hashed_directories: false,
            link_workers: 10,
            skip_phases: Vec::new(),
            failable_deliverables: Vec::new(),
            createrepo_command: "createrepo_c".to_string(),
            createrepo_num_workers: 0,
            runroot_method: RunrootMethod::Local,
            runroot_tag: None,
            runroot_channel: None,
            runroot_ssh_hosts: Vec::new(),
            runroot_weights: BTreeMap::new(),
            notification_script: None,
            bootable: false,
            test_phase_strict: false,
            media_checksums: vec!["sha256".to_string()],
            extra_files: Vec::new(),
            image_phases: BTreeMap::new(),
            config_dir: PathBuf::new(),
            other: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load a configuration file; relative paths resolve against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, base)
    }

    /// Parse a configuration document
    pub fn parse(content: &str, base_dir: &Path) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;

        for (old, new) in DEPRECATED_KEYS {
            if let Some(value) = table.remove(*old) {
                if table.contains_key(*new) {
                    return Err(Error::Config(format!(
                        "Options {} and {} are mutually exclusive ({} is deprecated)",
                        old, new, old
                    )));
                }
                warn!("Config option {} is deprecated, use {} instead", old, new);
                table.insert((*new).to_string(), value);
            }
        }

        // A single tag may be given as a string
        if let Some(toml::Value::String(tag)) = table.get("pkgset_koji_tag").cloned() {
            table.insert(
                "pkgset_koji_tag".to_string(),
                toml::Value::Array(vec![toml::Value::String(tag)]),
            );
        }

        let mut config: Config = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| Error::Config(format!("Invalid configuration: {}", e)))?;

        let other = std::mem::take(&mut config.other);
        for (key, value) in other {
            if IMAGE_PHASES.contains(&key.as_str()) {
                let rules: Vec<Rule<ImageSpec>> = value
                    .try_into()
                    .map_err(|e: toml::de::Error| {
                        Error::Config(format!("Invalid {} block: {}", key, e))
                    })?;
                config.image_phases.insert(key, rules);
            } else {
                warn!("Unknown config option {} is ignored", key);
            }
        }

        config.config_dir = base_dir.to_path_buf();
        config.resolve_paths();
        Ok(config)
    }

    fn resolve_paths(&mut self) {
        let base = self.config_dir.clone();
        let resolve = |p: &Path| -> PathBuf {
            if p.as_os_str().is_empty() || p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        let resolve_location = |s: &str| -> String {
            if crate::repository::is_remote(s) || Path::new(s).is_absolute() {
                s.to_string()
            } else {
                base.join(s).to_string_lossy().to_string()
            }
        };

        self.variants_file = resolve(&self.variants_file);
        self.comps_file = self.comps_file.as_deref().map(resolve);
        self.module_defaults_dir = self.module_defaults_dir.as_deref().map(resolve);
        self.gather_prepopulate = self.gather_prepopulate.as_deref().map(resolve);
        self.gather_source_mapping = self.gather_source_mapping.as_deref().map(resolve);
        self.notification_script = self.notification_script.as_deref().map(resolve);
        for locations in self.pkgset_repos.values_mut() {
            for loc in locations.iter_mut() {
                *loc = resolve_location(loc);
            }
        }
        for rule in &mut self.lookaside_repos {
            for loc in rule.value.repos.iter_mut() {
                *loc = resolve_location(loc);
            }
        }
        if let Some(topdir) = self.koji_topdir.as_mut() {
            *topdir = resolve_location(topdir);
        }
    }

    /// Check the whole configuration; every problem is reported at once
    pub fn validate(&self, just_phases: &[String], skip_phases: &[String]) -> Result<()> {
        let mut problems = Vec::new();

        for (key, value) in [
            ("release_name", &self.release_name),
            ("release_short", &self.release_short),
            ("release_version", &self.release_version),
        ] {
            if value.is_empty() {
                problems.push(format!("Missing required option {}", key));
            }
        }
        if self.variants_file.as_os_str().is_empty() {
            problems.push("Missing required option variants_file".to_string());
        }
        if self.release_is_layered
            && (self.base_product_name.is_none()
                || self.base_product_short.is_none()
                || self.base_product_version.is_none())
        {
            problems.push("Layered products need base_product_name, _short and _version".to_string());
        }

        match self.pkgset_source {
            PkgsetSource::Repos => {
                if self.pkgset_repos.is_empty() {
                    problems.push("pkgset_source = \"repos\" needs pkgset_repos".to_string());
                }
                if !self.pkgset_koji_tag.is_empty() || !self.pkgset_koji_builds.is_empty() {
                    problems.push(
                        "pkgset_koji_tag/pkgset_koji_builds cannot be used with pkgset_source = \"repos\""
                            .to_string(),
                    );
                }
            }
            PkgsetSource::Koji => {
                if self.pkgset_koji_tag.is_empty() && self.pkgset_koji_builds.is_empty() {
                    problems.push(
                        "pkgset_source = \"koji\" needs pkgset_koji_tag or pkgset_koji_builds".to_string(),
                    );
                }
                if self.koji_hub.is_none() || self.koji_topdir.is_none() {
                    problems.push("pkgset_source = \"koji\" needs koji_hub and koji_topdir".to_string());
                }
            }
        }
        for arch in self.pkgset_repos.keys() {
            if arch != "src" && !crate::arch::is_valid_tree_arch(arch) {
                problems.push(format!("pkgset_repos uses unknown arch {}", arch));
            }
        }
        for arch in &self.tree_arches {
            if !crate::arch::is_valid_tree_arch(arch) {
                problems.push(format!("tree_arches uses unknown arch {}", arch));
            }
        }

        if self.gather_backend != "dnf" {
            problems.push(format!("Unsupported gather_backend {}", self.gather_backend));
        }
        if let GatherMethodConfig::PerSource(map) = &self.gather_method
            && map.values().any(|m| *m == GatherMethod::Hybrid)
        {
            problems.push("gather_method hybrid cannot be set per source".to_string());
        }

        if self.runroot_method == RunrootMethod::Ssh && self.runroot_ssh_hosts.is_empty() {
            problems.push("runroot_method = \"ssh\" needs runroot_ssh_hosts".to_string());
        }
        if self.runroot_method == RunrootMethod::Koji
            && (self.koji_hub.is_none() || self.runroot_tag.is_none())
        {
            problems.push("runroot_method = \"koji\" needs koji_hub and runroot_tag".to_string());
        }

        for sum in &self.media_checksums {
            if sum != "sha256" && sum != "sha512" {
                problems.push(format!("Unsupported media checksum {}", sum));
            }
        }

        for phase in skip_phases.iter().chain(just_phases).chain(&self.skip_phases) {
            if !ALL_PHASES.contains(&phase.as_str()) {
                problems.push(format!("Unknown phase {}", phase));
            }
        }
        for phase in just_phases {
            if skip_phases.contains(phase) || self.skip_phases.contains(phase) {
                problems.push(format!("Phase {} is both requested and skipped", phase));
            }
        }

        for (dest, source) in &self.variant_as_lookaside {
            if dest == source {
                problems.push(format!("Variant {} cannot be its own lookaside", dest));
            }
        }

        problems.extend(self.rule_problems());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("\n")))
        }
    }

    fn rule_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (key, rules) in [
            ("multilib_whitelist", &self.multilib_whitelist),
            ("multilib_blacklist", &self.multilib_blacklist),
            ("filter_packages", &self.filter_packages),
            ("additional_packages", &self.additional_packages),
        ] {
            for rule in rules {
                problems.extend(rule.pattern_problems(key));
            }
        }
        for rule in &self.multilib {
            problems.extend(rule.pattern_problems("multilib"));
            for method in &rule.value.methods {
                if !crate::gather::multilib::METHODS.contains(&method.as_str()) {
                    problems.push(format!("multilib: unknown method {}", method));
                }
            }
        }
        for rule in &self.lookaside_repos {
            problems.extend(rule.pattern_problems("lookaside_repos"));
        }
        for rule in &self.failable_deliverables {
            problems.extend(rule.pattern_problems("failable_deliverables"));
        }
        for rule in &self.extra_files {
            problems.extend(rule.pattern_problems("extra_files"));
        }
        for (phase, rules) in &self.image_phases {
            for rule in rules {
                problems.extend(rule.pattern_problems(phase));
                if rule.value.command.is_empty() || rule.value.output.is_empty() {
                    problems.push(format!("{}: every deliverable needs command and output", phase));
                }
            }
        }
        problems
    }

    /// Tree arches of the compose (explicit `tree_arches`, else the variants')
    pub fn compose_arches(&self, variants: &VariantTree) -> Vec<String> {
        if self.tree_arches.is_empty() {
            variants.all_arches()
        } else {
            self.tree_arches.clone()
        }
    }

    /// Whether a deliverable may fail on a (variant, arch)
    pub fn is_failable(&self, variant_uid: &str, arch: &str, deliverable: &str) -> bool {
        matching(&self.failable_deliverables, variant_uid, arch)
            .iter()
            .any(|d| d.deliverables.iter().any(|x| x == deliverable || x == "*"))
    }

    /// Packages from every matching rule of a package-list option
    pub fn packages_for(rules: &[Rule<PackageList>], variant_uid: &str, arch: &str) -> Vec<String> {
        matching(rules, variant_uid, arch)
            .into_iter()
            .flat_map(|l| l.packages.iter().cloned())
            .collect()
    }

    /// Multilib methods for a (variant, arch)
    pub fn multilib_methods(&self, variant_uid: &str, arch: &str) -> Vec<String> {
        let mut methods: Vec<String> = matching(&self.multilib, variant_uid, arch)
            .into_iter()
            .flat_map(|m| m.methods.iter().cloned())
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }

    /// Lookaside repository locations for a (variant, arch)
    pub fn lookaside_for(&self, variant_uid: &str, arch: &str) -> Vec<String> {
        matching(&self.lookaside_repos, variant_uid, arch)
            .into_iter()
            .flat_map(|r| r.repos.iter().cloned())
            .collect()
    }

    /// Serialized config keys for reuse records
    pub fn capture(&self, keys: &[&str]) -> BTreeMap<String, serde_json::Value> {
        let full = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        keys.iter()
            .map(|k| {
                let v = full.get(*k).cloned().unwrap_or(serde_json::Value::Null);
                (k.to_string(), v)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
release_name = "Dummy Product"
release_short = "DP"
release_version = "1.0"
variants_file = "variants.xml"

[pkgset_repos]
x86_64 = ["repo"]
"#;

    #[test]
    fn test_minimal_config() {
        let config = Config::parse(MINIMAL, Path::new("/etc/pungi")).unwrap();
        assert_eq!(config.release_short, "DP");
        assert_eq!(config.variants_file, PathBuf::from("/etc/pungi/variants.xml"));
        assert_eq!(config.pkgset_repos["x86_64"], vec!["/etc/pungi/repo".to_string()]);
        assert_eq!(config.greedy_method, GreedyMethod::None);
        assert_eq!(config.gather_link_type, LinkType::HardlinkOrCopy);
        assert!(config.check_deps);
        config.validate(&[], &[]).unwrap();
    }

    #[test]
    fn test_deprecated_keys_are_renamed() {
        let content = format!(
            "{}\nlink_type = \"symlink\"\n[[multilib_methods]]\nvariant = \".*\"\narch = \"x86_64\"\nmethods = [\"devel\"]\n",
            MINIMAL.replace("[pkgset_repos]\nx86_64 = [\"repo\"]\n", "")
        );
        let content = format!("{}\n[pkgset_repos]\nx86_64 = [\"repo\"]\n", content);
        let config = Config::parse(&content, Path::new("/tmp")).unwrap();
        assert_eq!(config.gather_link_type, LinkType::Symlink);
        assert_eq!(config.multilib_methods("Server", "x86_64"), vec!["devel"]);
    }

    #[test]
    fn test_deprecated_and_new_key_conflict() {
        let content = format!("link_type = \"copy\"\ngather_link_type = \"copy\"\n{}", MINIMAL);
        assert!(matches!(
            Config::parse(&content, Path::new("/tmp")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_validation_collects_problems() {
        let content = r#"
pkgset_source = "repos"
pkgset_koji_tag = "f40"
gather_backend = "yum"
[[filter_packages]]
variant = "("
packages = ["x"]
"#;
        let config = Config::parse(content, Path::new("/tmp")).unwrap();
        let err = config
            .validate(&["gather".to_string()], &["gather".to_string()])
            .unwrap_err()
            .to_string();
        assert!(err.contains("release_name"));
        assert!(err.contains("variants_file"));
        assert!(err.contains("pkgset_repos"));
        assert!(err.contains("mutually exclusive") || err.contains("cannot be used"));
        assert!(err.contains("gather_backend"));
        assert!(err.contains("invalid variant regex"));
        assert!(err.contains("both requested and skipped"));
    }

    #[test]
    fn test_gather_method_forms() {
        let single = Config::parse(&format!("gather_method = \"nodeps\"\n{}", MINIMAL), Path::new("/")).unwrap();
        assert_eq!(single.gather_method.for_source(GatherSource::Json), Some(GatherMethod::Nodeps));

        let per_source = Config::parse(
            &format!("{}\n[gather_method]\ncomps = \"deps\"\nmodule = \"nodeps\"\n", MINIMAL),
            Path::new("/"),
        )
        .unwrap();
        assert_eq!(per_source.gather_method.for_source(GatherSource::Comps), Some(GatherMethod::Deps));
        assert_eq!(per_source.gather_method.for_source(GatherSource::Module), Some(GatherMethod::Nodeps));
        assert_eq!(per_source.gather_method.for_source(GatherSource::Json), None);
    }

    #[test]
    fn test_rule_matching() {
        let content = format!(
            "{}\n[[filter_packages]]\nvariant = \"Server\"\narch = \"x86_*\"\npackages = [\"a\"]\n\n[[filter_packages]]\npackages = [\"b\"]\n",
            MINIMAL
        );
        let config = Config::parse(&content, Path::new("/")).unwrap();
        assert_eq!(
            Config::packages_for(&config.filter_packages, "Server", "x86_64"),
            vec!["a", "b"]
        );
        // Regexes are anchored
        assert_eq!(
            Config::packages_for(&config.filter_packages, "Server-HA", "x86_64"),
            vec!["b"]
        );
        assert_eq!(
            Config::packages_for(&config.filter_packages, "Server", "aarch64"),
            vec!["b"]
        );
    }

    #[test]
    fn test_image_phase_blocks_and_failable() {
        let content = format!(
            "{}\n[[image_build]]\nvariant = \"Server\"\ncommand = \"make-image\"\noutput = \"disk.qcow2\"\ntype = \"qcow2\"\n\n[[failable_deliverables]]\nvariant = \"Server\"\ndeliverables = [\"image_build\"]\n",
            MINIMAL
        );
        let config = Config::parse(&content, Path::new("/")).unwrap();
        let rules = &config.image_phases["image_build"];
        assert_eq!(rules[0].value.image_type.as_deref(), Some("qcow2"));
        assert!(config.is_failable("Server", "x86_64", "image_build"));
        assert!(!config.is_failable("Client", "x86_64", "image_build"));
        assert!(!config.is_failable("Server", "x86_64", "createiso"));
    }

    #[test]
    fn test_capture_is_keyed() {
        let config = Config::parse(MINIMAL, Path::new("/")).unwrap();
        let captured = config.capture(&["greedy_method", "gather_fulltree"]);
        assert_eq!(captured["greedy_method"], serde_json::json!("none"));
        assert_eq!(captured["gather_fulltree"], serde_json::json!(false));
    }
}
