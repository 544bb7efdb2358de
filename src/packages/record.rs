// src/packages/record.rs

//! Immutable package records
//!
//! Every candidate RPM, SRPM and debuginfo package of a compose is described by
//! one `PackageRecord`, whatever its origin (repodata, RPM header, Koji).

use crate::arch;
use crate::error::{Error, Result};
use crate::version::{Capability, Evr};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Capability name provided by release packages
pub const SYSTEM_RELEASE: &str = "system-release";

/// Name, epoch, version, release and arch of a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nevra {
    pub name: String,
    pub evr: Evr,
    pub arch: String,
}

impl Nevra {
    pub fn new(name: impl Into<String>, evr: Evr, arch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            evr,
            arch: arch.into(),
        }
    }

    /// Parse `name-[epoch:]version-release.arch`, with an optional `.rpm`
    /// suffix (package file names parse as well).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.rsplit('/').next().unwrap_or(s);
        let s = s.strip_suffix(".rpm").unwrap_or(s);

        let (rest, arch) = s
            .rsplit_once('.')
            .ok_or_else(|| Error::ParseError(format!("Missing arch in NEVRA: {}", s)))?;
        let (rest, release) = rest
            .rsplit_once('-')
            .ok_or_else(|| Error::ParseError(format!("Missing release in NEVRA: {}", s)))?;
        let (name, version) = rest
            .rsplit_once('-')
            .ok_or_else(|| Error::ParseError(format!("Missing version in NEVRA: {}", s)))?;

        let (epoch, version) = match version.split_once(':') {
            Some((e, v)) => (
                e.parse::<u32>()
                    .map_err(|err| Error::ParseError(format!("Invalid epoch in {}: {}", s, err)))?,
                v,
            ),
            None => (0, version),
        };

        // Some tools put the epoch in front of the name instead
        let (epoch, name) = match name.split_once(':') {
            Some((e, n)) if epoch == 0 => (
                e.parse::<u32>()
                    .map_err(|err| Error::ParseError(format!("Invalid epoch in {}: {}", s, err)))?,
                n,
            ),
            _ => (epoch, name),
        };

        if name.is_empty() || version.is_empty() || release.is_empty() || arch.is_empty() {
            return Err(Error::ParseError(format!("Malformed NEVRA: {}", s)));
        }

        Ok(Self::new(name, Evr::new(epoch, version, release), arch))
    }

    /// `name-version-release.arch` (no epoch)
    pub fn nvra(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            self.name, self.evr.version, self.evr.release, self.arch
        )
    }

    /// `name-version-release`
    pub fn nvr(&self) -> String {
        format!("{}-{}-{}", self.name, self.evr.version, self.evr.release)
    }

    /// Package file name as produced by rpmbuild
    pub fn filename(&self) -> String {
        format!("{}.rpm", self.nvra())
    }
}

/// Always carries the epoch (`bash-0:4.2.37-6.x86_64`), matching the manifest
/// key format.
impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}:{}-{}.{}",
            self.name, self.evr.epoch, self.evr.version, self.evr.release, self.arch
        )
    }
}

/// An immutable candidate package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub evr: Evr,
    pub arch: String,
    /// File name of the SRPM this binary was built from (`None` for sources)
    pub sourcerpm: Option<String>,
    /// Location in the package pool (local path or URL)
    pub path: PathBuf,
    /// Short signing key id, lowercase hex; `None` for unsigned packages
    pub sigkey: Option<String>,
    /// Name of the repository or Koji tag the package came from
    pub repo: String,
    pub provides: Vec<Capability>,
    /// For source packages these are the Build-Requires
    pub requires: Vec<Capability>,
    pub obsoletes: Vec<Capability>,
    pub conflicts: Vec<Capability>,
    pub excludearch: Vec<String>,
    pub exclusivearch: Vec<String>,
    pub files: Vec<String>,
    pub size: u64,
    pub mtime: i64,
    /// NSVC of the module build that owns this package
    pub module: Option<String>,
}

impl PackageRecord {
    /// Create a record with no dependency data
    pub fn new(name: impl Into<String>, evr: Evr, arch: impl Into<String>) -> Self {
        let name = name.into();
        let arch = arch.into();
        let path = PathBuf::from(format!(
            "{}-{}-{}.{}.rpm",
            name, evr.version, evr.release, arch
        ));
        Self {
            name,
            evr,
            arch,
            sourcerpm: None,
            path,
            sigkey: None,
            repo: String::new(),
            provides: Vec::new(),
            requires: Vec::new(),
            obsoletes: Vec::new(),
            conflicts: Vec::new(),
            excludearch: Vec::new(),
            exclusivearch: Vec::new(),
            files: Vec::new(),
            size: 0,
            mtime: 0,
            module: None,
        }
    }

    pub fn nevra(&self) -> Nevra {
        Nevra::new(self.name.clone(), self.evr.clone(), self.arch.clone())
    }

    /// `name-version-release.arch`
    pub fn nvra(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            self.name, self.evr.version, self.evr.release, self.arch
        )
    }

    /// File name of this package
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.rpm", self.nvra()))
    }

    pub fn is_source(&self) -> bool {
        arch::is_source(&self.arch)
    }

    /// Whether the name marks a debuginfo or debugsource package
    pub fn is_debug(&self) -> bool {
        is_debug_name(&self.name)
    }

    /// Whether the package provides `system-release`
    pub fn is_system_release(&self) -> bool {
        self.provides.iter().any(|p| p.name == SYSTEM_RELEASE)
    }

    /// Name of the source package, from the `sourcerpm` file name
    pub fn source_name(&self) -> Option<String> {
        if self.is_source() {
            return Some(self.name.clone());
        }
        self.sourcerpm
            .as_deref()
            .and_then(|srpm| Nevra::parse(srpm).ok())
            .map(|n| n.name)
    }

    /// The implicit `name = epoch:version-release` provide
    pub fn self_provide(&self) -> Capability {
        Capability::versioned(self.name.clone(), crate::version::DepFlag::Eq, self.evr.clone())
    }

    /// Whether any Provides (including the implicit one) or any file
    /// satisfies the requirement
    pub fn provides_capability(&self, require: &Capability) -> bool {
        if require.name.starts_with('/') && self.files.iter().any(|f| f == &require.name) {
            return true;
        }
        if self.self_provide().satisfies(require) {
            return true;
        }
        self.provides.iter().any(|p| p.satisfies(require))
    }

    /// Whether the package is dropped for a tree arch by ExcludeArch/ExclusiveArch
    pub fn is_excluded_for(&self, tree_arch: &str) -> bool {
        if self.excludearch.iter().any(|a| a == tree_arch) {
            return true;
        }
        !self.exclusivearch.is_empty() && !self.exclusivearch.iter().any(|a| a == tree_arch)
    }

    // Builder-style helpers used by providers and fixtures

    pub fn with_sourcerpm(mut self, srpm: impl Into<String>) -> Self {
        self.sourcerpm = Some(srpm.into());
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_sigkey(mut self, sigkey: impl Into<String>) -> Self {
        self.sigkey = Some(sigkey.into());
        self
    }

    pub fn provide(mut self, cap: &str) -> Self {
        if let Ok(cap) = Capability::parse(cap) {
            self.provides.push(cap);
        }
        self
    }

    pub fn require(mut self, cap: &str) -> Self {
        if let Ok(cap) = Capability::parse(cap) {
            self.requires.push(cap);
        }
        self
    }

    pub fn file(mut self, path: &str) -> Self {
        self.files.push(path.to_string());
        self
    }
}

/// Whether a package name is a debuginfo/debugsource name
pub fn is_debug_name(name: &str) -> bool {
    name.ends_with("-debuginfo") || name.contains("-debuginfo-") || name.ends_with("-debugsource")
}

/// Requirements the depsolver never resolves
pub fn is_ignored_requirement(name: &str) -> bool {
    name.starts_with("rpmlib(") || name.starts_with("config(")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nevra_parse_filename() {
        let n = Nevra::parse("dummy-bash-4.2.37-6.x86_64.rpm").unwrap();
        assert_eq!(n.name, "dummy-bash");
        assert_eq!(n.evr, Evr::new(0, "4.2.37", "6"));
        assert_eq!(n.arch, "x86_64");
        assert_eq!(n.to_string(), "dummy-bash-0:4.2.37-6.x86_64");
        assert_eq!(n.nvra(), "dummy-bash-4.2.37-6.x86_64");
    }

    #[test]
    fn test_nevra_parse_epoch_forms() {
        let a = Nevra::parse("foo-2:1.0-1.noarch").unwrap();
        let b = Nevra::parse("2:foo-1.0-1.noarch").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.evr.epoch, 2);
        assert!(Nevra::parse("foo").is_err());
        assert!(Nevra::parse("foo-1.noarch").is_err());
    }

    #[test]
    fn test_debug_names() {
        assert!(is_debug_name("dummy-bash-debuginfo"));
        assert!(is_debug_name("dummy-glibc-debuginfo-common"));
        assert!(is_debug_name("dummy-bash-debugsource"));
        assert!(!is_debug_name("dummy-debuginfod"));
    }

    #[test]
    fn test_system_release_and_provides() {
        let pkg = PackageRecord::new("dummy-release-server", Evr::new(0, "1.0.0", "1"), "x86_64")
            .provide("system-release")
            .file("/etc/os-release");
        assert!(pkg.is_system_release());
        assert!(pkg.provides_capability(&Capability::new("system-release")));
        assert!(pkg.provides_capability(&Capability::new("/etc/os-release")));
        assert!(pkg.provides_capability(&Capability::parse("dummy-release-server >= 1.0").unwrap()));
        assert!(!pkg.provides_capability(&Capability::parse("dummy-release-server > 2").unwrap()));
    }

    #[test]
    fn test_source_name() {
        let pkg = PackageRecord::new("dummy-nscd", Evr::new(0, "2.14", "5"), "x86_64")
            .with_sourcerpm("dummy-glibc-2.14-5.src.rpm");
        assert_eq!(pkg.source_name().as_deref(), Some("dummy-glibc"));
        let src = PackageRecord::new("dummy-glibc", Evr::new(0, "2.14", "5"), "src");
        assert!(src.is_source());
        assert_eq!(src.source_name().as_deref(), Some("dummy-glibc"));
    }

    #[test]
    fn test_exclude_arch_rules() {
        let mut pkg = PackageRecord::new("fw", Evr::new(0, "1", "1"), "noarch");
        pkg.excludearch = vec!["s390x".to_string()];
        assert!(pkg.is_excluded_for("s390x"));
        assert!(!pkg.is_excluded_for("x86_64"));

        let mut pkg = PackageRecord::new("efi", Evr::new(0, "1", "1"), "noarch");
        pkg.exclusivearch = vec!["x86_64".to_string(), "aarch64".to_string()];
        assert!(!pkg.is_excluded_for("aarch64"));
        assert!(pkg.is_excluded_for("ppc64le"));
    }
}
