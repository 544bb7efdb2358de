// src/arch.rs

//! Architecture compatibility rules
//!
//! A compose is built for a set of *tree arches* (x86_64, aarch64, ...). Every
//! tree arch accepts packages of a fixed list of compatible RPM arches; some of
//! those are 32-bit *multilib* arches that may only enter a 64-bit tree through
//! the multilib policy.

use crate::error::{Error, Result};

/// Tree arch → every RPM arch whose packages can be installed on it,
/// best first.
const COMPAT_ARCHES: &[(&str, &[&str])] = &[
    ("x86_64", &["x86_64", "i686", "athlon", "i586", "i486", "i386", "noarch"]),
    ("i386", &["i686", "athlon", "i586", "i486", "i386", "noarch"]),
    ("i686", &["i686", "athlon", "i586", "i486", "i386", "noarch"]),
    ("aarch64", &["aarch64", "noarch"]),
    ("ppc64le", &["ppc64le", "noarch"]),
    ("ppc64", &["ppc64", "ppc", "noarch"]),
    ("ppc", &["ppc", "noarch"]),
    ("s390x", &["s390x", "s390", "noarch"]),
    ("s390", &["s390", "noarch"]),
    ("armhfp", &["armv7hnl", "armv7hl", "armv6hl", "noarch"]),
    ("src", &["src", "nosrc"]),
];

/// 64-bit tree arch → 32-bit companion arches, best first
const MULTILIB_ARCHES: &[(&str, &[&str])] = &[
    ("x86_64", &["i686", "athlon", "i586", "i486", "i386"]),
    ("ppc64", &["ppc"]),
    ("s390x", &["s390"]),
];

/// Arches that identify source packages
pub const SOURCE_ARCHES: &[&str] = &["src", "nosrc"];

/// Return the RPM arches compatible with a tree arch (including `noarch`)
pub fn compatible_arches(tree_arch: &str) -> Result<&'static [&'static str]> {
    COMPAT_ARCHES
        .iter()
        .find(|(arch, _)| *arch == tree_arch)
        .map(|(_, compat)| *compat)
        .ok_or_else(|| Error::Config(format!("Unknown tree arch: {}", tree_arch)))
}

/// Return the 32-bit multilib arches of a tree arch (empty when it has none)
pub fn multilib_arches(tree_arch: &str) -> &'static [&'static str] {
    MULTILIB_ARCHES
        .iter()
        .find(|(arch, _)| *arch == tree_arch)
        .map(|(_, arches)| *arches)
        .unwrap_or(&[])
}

/// Whether `arch` is any arch this module knows about
pub fn is_valid_arch(arch: &str) -> bool {
    COMPAT_ARCHES
        .iter()
        .any(|(tree, compat)| *tree == arch || compat.contains(&arch))
}

/// Whether `arch` may be used as a tree arch in a compose
pub fn is_valid_tree_arch(arch: &str) -> bool {
    arch != "src" && COMPAT_ARCHES.iter().any(|(tree, _)| *tree == arch)
}

/// Whether a package arch is compatible with a tree arch
pub fn is_compatible(tree_arch: &str, pkg_arch: &str) -> bool {
    compatible_arches(tree_arch)
        .map(|compat| compat.contains(&pkg_arch))
        .unwrap_or(false)
}

/// Whether a package arch is a multilib companion arch for a tree arch
pub fn is_multilib(tree_arch: &str, pkg_arch: &str) -> bool {
    multilib_arches(tree_arch).contains(&pkg_arch)
}

/// Whether a package arch is native (not noarch, not multilib) for a tree arch
pub fn is_native(tree_arch: &str, pkg_arch: &str) -> bool {
    pkg_arch != "noarch"
        && !is_multilib(tree_arch, pkg_arch)
        && is_compatible(tree_arch, pkg_arch)
}

/// Whether an arch denotes a source package
pub fn is_source(pkg_arch: &str) -> bool {
    SOURCE_ARCHES.contains(&pkg_arch)
}

/// Preference rank of a package arch on a tree arch; higher is better.
///
/// Native arches rank above noarch, noarch ranks above every multilib arch,
/// and multilib arches rank by their position in the companion list.
pub fn arch_rank(tree_arch: &str, pkg_arch: &str) -> u32 {
    if is_native(tree_arch, pkg_arch) {
        return 1000;
    }
    if pkg_arch == "noarch" {
        return 900;
    }
    let multilib = multilib_arches(tree_arch);
    match multilib.iter().position(|a| *a == pkg_arch) {
        Some(pos) => 800 - pos as u32,
        None => 0,
    }
}

/// Arch restriction parsed from a `name.arch` package specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchFilter {
    /// Exactly one RPM arch
    Exact(String),
    /// `name.+` - any multilib arch of the tree arch
    Multilib,
}

impl ArchFilter {
    /// Whether a package arch passes this filter on the given tree arch
    pub fn accepts(&self, tree_arch: &str, pkg_arch: &str) -> bool {
        match self {
            ArchFilter::Exact(arch) => arch == pkg_arch,
            ArchFilter::Multilib => is_multilib(tree_arch, pkg_arch),
        }
    }
}

/// Split an optional `.arch` / `.+` suffix off a package specification.
///
/// A suffix that is not a known arch is part of the name (`python3.11`).
pub fn split_arch_suffix(spec: &str) -> (&str, Option<ArchFilter>) {
    if let Some(name) = spec.strip_suffix(".+") {
        return (name, Some(ArchFilter::Multilib));
    }
    if let Some((name, arch)) = spec.rsplit_once('.')
        && !name.is_empty()
        && (is_valid_arch(arch) || is_source(arch))
    {
        return (name, Some(ArchFilter::Exact(arch.to_string())));
    }
    (spec, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_compat() {
        let compat = compatible_arches("x86_64").unwrap();
        for arch in ["x86_64", "athlon", "i686", "i586", "i486", "i386", "noarch"] {
            assert!(compat.contains(&arch), "{} should be compatible", arch);
        }
        assert!(!compat.contains(&"aarch64"));
    }

    #[test]
    fn test_aarch64_has_no_multilib() {
        assert_eq!(compatible_arches("aarch64").unwrap(), &["aarch64", "noarch"]);
        assert!(multilib_arches("aarch64").is_empty());
    }

    #[test]
    fn test_unknown_tree_arch() {
        assert!(matches!(compatible_arches("mips"), Err(Error::Config(_))));
        assert!(!is_valid_tree_arch("src"));
        assert!(is_valid_tree_arch("ppc64le"));
    }

    #[test]
    fn test_native_and_multilib() {
        assert!(is_native("x86_64", "x86_64"));
        assert!(!is_native("x86_64", "noarch"));
        assert!(!is_native("x86_64", "i686"));
        assert!(is_multilib("x86_64", "i686"));
        assert!(!is_multilib("aarch64", "i686"));
        assert!(is_native("i386", "i686"));
    }

    #[test]
    fn test_arch_rank_order() {
        assert!(arch_rank("x86_64", "x86_64") > arch_rank("x86_64", "noarch"));
        assert!(arch_rank("x86_64", "noarch") > arch_rank("x86_64", "i686"));
        assert!(arch_rank("x86_64", "i686") > arch_rank("x86_64", "i386"));
        assert_eq!(arch_rank("x86_64", "aarch64"), 0);
    }

    #[test]
    fn test_split_arch_suffix() {
        assert_eq!(split_arch_suffix("dummy-bash"), ("dummy-bash", None));
        assert_eq!(
            split_arch_suffix("dummy-bash.+"),
            ("dummy-bash", Some(ArchFilter::Multilib))
        );
        assert_eq!(
            split_arch_suffix("dummy-glibc.i686"),
            ("dummy-glibc", Some(ArchFilter::Exact("i686".to_string())))
        );
        assert_eq!(split_arch_suffix("python3.11"), ("python3.11", None));
    }
}
