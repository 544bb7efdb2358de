// src/gather/multilib.rs

//! Multilib classification
//!
//! Decides whether a native package on a 64-bit tree arch should bring in
//! its 32-bit companion.

use super::pool::PackagePool;
use crate::arch;
use crate::packages::PackageRecord;
use std::collections::HashSet;

/// Classifier methods accepted in the `multilib` option
pub const METHODS: &[&str] = &["all", "devel", "runtime", "kernel", "yaboot", "openssl", "none"];

/// Methods that select by package name alone
const NAME_RULES: &[(&str, &[&str])] = &[
    ("yaboot", &["yaboot"]),
    ("openssl", &["openssl", "openssl-libs"]),
];

const MODULE_DIRS: &[&str] = &["/lib/modules/", "/usr/lib/modules/"];

const LIB64_DIRS: &[&str] = &["/lib64/", "/usr/lib64/"];
const LIB32_DIRS: &[&str] = &["/lib/", "/usr/lib/"];

/// Multilib policy of one (variant, arch)
#[derive(Debug, Clone, Default)]
pub struct MultilibPolicy {
    methods: Vec<String>,
    whitelist: Vec<glob::Pattern>,
    blacklist: Vec<glob::Pattern>,
    /// Library basenames shipped in 32-bit lib dirs by multilib-arch packages
    lib32_sonames: HashSet<String>,
    /// Multilib-arch packages carrying modules of a 32-bit kernel
    kmod32_names: HashSet<String>,
}

impl MultilibPolicy {
    pub fn new(methods: &[String], whitelist: &[String], blacklist: &[String]) -> Self {
        Self {
            methods: methods.to_vec(),
            whitelist: compile(whitelist),
            blacklist: compile(blacklist),
            lib32_sonames: HashSet::new(),
            kmod32_names: HashSet::new(),
        }
    }

    /// Index the 32-bit libraries and kernel modules of a pool for the
    /// `runtime` and `kernel` methods
    pub fn with_pool(mut self, pool: &PackagePool) -> Self {
        if self.methods.iter().any(|m| m == "kernel") {
            let arches32 = arch::multilib_arches(pool.tree_arch());
            self.kmod32_names = pool
                .ids()
                .filter(|id| pool.is_multilib(*id))
                .map(|id| pool.record(id))
                .filter(|r| r.files.iter().any(|f| is_kernel_module_for(f, arches32)))
                .map(|r| r.name.clone())
                .collect();
        }
        if self.methods.iter().any(|m| m == "runtime") {
            self.lib32_sonames = pool
                .ids()
                .filter(|id| pool.is_multilib(*id))
                .flat_map(|id| pool.record(id).files.iter())
                .filter(|f| LIB32_DIRS.iter().any(|d| in_dir(f, d)) && is_shared_lib(f))
                .filter_map(|f| basename(f).map(str::to_string))
                .collect();
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.whitelist.is_empty() || self.methods.iter().any(|m| m != "none")
    }

    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.whitelist.iter().any(|p| p.matches(name))
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.iter().any(|p| p.matches(name))
    }

    /// Whether a native package qualifies for a 32-bit companion
    pub fn qualifies(&self, record: &PackageRecord) -> bool {
        if self.is_whitelisted(&record.name) {
            return true;
        }
        if self.is_blacklisted(&record.name) {
            return false;
        }
        self.methods.iter().any(|m| self.method_selects(m, record))
    }

    fn method_selects(&self, method: &str, record: &PackageRecord) -> bool {
        match method {
            "all" => true,
            "devel" => is_devel(record),
            "runtime" => self.is_runtime(record),
            "kernel" => self.kmod32_names.contains(&record.name),
            _ => NAME_RULES
                .iter()
                .find(|(rule, _)| *rule == method)
                .is_some_and(|(_, names)| names.contains(&record.name.as_str())),
        }
    }

    fn is_runtime(&self, record: &PackageRecord) -> bool {
        record.files.iter().any(|f| {
            LIB64_DIRS.iter().any(|d| in_dir(f, d))
                && is_shared_lib(f)
                && basename(f).is_some_and(|b| self.lib32_sonames.contains(b))
        })
    }
}

fn compile(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect()
}

fn is_devel(record: &PackageRecord) -> bool {
    if record.name.ends_with("-devel") || record.name.ends_with("-static") {
        return true;
    }
    record.files.iter().any(|f| {
        f.ends_with(".a")
            && LIB64_DIRS
                .iter()
                .chain(LIB32_DIRS)
                .any(|d| in_dir(f, d))
    })
}

/// A `.ko` file under the module tree of a kernel built for one of `arches`.
///
/// Module trees are named by kernel release, which ends with the arch the
/// kernel (and so every module ELF object in the tree) was built for.
fn is_kernel_module_for(path: &str, arches: &[&str]) -> bool {
    let Some(rest) = MODULE_DIRS.iter().find_map(|d| path.strip_prefix(d)) else {
        return false;
    };
    let Some((release, module)) = rest.split_once('/') else {
        return false;
    };
    let is_module = basename(module).is_some_and(|b| {
        [".ko", ".ko.xz", ".ko.zst", ".ko.gz"]
            .iter()
            .any(|ext| b.ends_with(ext))
    });
    is_module
        && release
            .rsplit_once('.')
            .is_some_and(|(_, kernel_arch)| arches.contains(&kernel_arch))
}

fn in_dir(path: &str, dir: &str) -> bool {
    path.starts_with(dir)
}

fn is_shared_lib(path: &str) -> bool {
    basename(path).is_some_and(|b| b.contains(".so"))
}

fn basename(path: &str) -> Option<&str> {
    path.rsplit('/').next().filter(|b| !b.is_empty())
}
