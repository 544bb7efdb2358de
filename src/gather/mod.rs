// src/gather/mod.rs

//! Package gathering
//!
//! The gather engine turns a seed request into the rpm, srpm and debuginfo
//! sets of one (variant, arch). `layering` drives it over the whole variant
//! tree.

pub mod layering;
pub mod multilib;
pub mod pool;
pub mod seed;
pub mod solver;

use crate::config::{GatherMethod, GatherMethodConfig, GatherSource};
use crate::error::{Error, Result};
use crate::packages::{Nevra, PackageRecord};
use crate::pkgset::package_order;
use pool::PackagePool;
use seed::SeedRequest;
use serde::{Deserialize, Serialize};
use solver::{GatherOptions, Solver};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub use layering::{LayeringEngine, LayeringRecord, TrimStats, VariantResults};

/// Provenance tag of a gathered package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flag {
    Input,
    Comps,
    Prepopulate,
    Langpack,
    Multilib,
    Fulltree,
    FulltreeExclude,
    SelfHosting,
    Lookaside,
}

pub type Flags = BTreeSet<Flag>;

/// Package categories of a gather result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Rpm,
    Srpm,
    Debuginfo,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Rpm, Category::Srpm, Category::Debuginfo];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatheredPackage {
    pub record: Arc<PackageRecord>,
    pub flags: Flags,
}

impl GatheredPackage {
    pub fn new(record: Arc<PackageRecord>, flags: Flags) -> Self {
        Self { record, flags }
    }

    pub fn is_lookaside(&self) -> bool {
        self.flags.contains(&Flag::Lookaside)
    }

    pub fn has(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}

/// A requirement nothing in the package set provides
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokenDep {
    /// NVRA of the requiring package
    pub package: String,
    pub requirement: String,
}

/// Output of the gather engine for one (variant, arch)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherResult {
    pub rpm: Vec<GatheredPackage>,
    pub srpm: Vec<GatheredPackage>,
    pub debuginfo: Vec<GatheredPackage>,
    pub broken: Vec<BrokenDep>,
    /// NVRAs of binaries whose source package is not in the package set
    pub missing_sources: Vec<String>,
}

impl GatherResult {
    pub fn packages(&self, category: Category) -> &[GatheredPackage] {
        match category {
            Category::Rpm => &self.rpm,
            Category::Srpm => &self.srpm,
            Category::Debuginfo => &self.debuginfo,
        }
    }

    pub fn packages_mut(&mut self, category: Category) -> &mut Vec<GatheredPackage> {
        match category {
            Category::Rpm => &mut self.rpm,
            Category::Srpm => &mut self.srpm,
            Category::Debuginfo => &mut self.debuginfo,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rpm.is_empty() && self.srpm.is_empty() && self.debuginfo.is_empty()
    }

    /// (name, arch) of every binary
    pub fn binary_keys(&self) -> BTreeSet<(String, String)> {
        self.rpm
            .iter()
            .map(|p| (p.record.name.clone(), p.record.arch.clone()))
            .collect()
    }

    /// NEVRAs of a category
    pub fn nevras(&self, category: Category) -> BTreeSet<Nevra> {
        self.packages(category).iter().map(|p| p.record.nevra()).collect()
    }

    /// Source package names of every gathered binary
    pub fn source_names(&self) -> BTreeSet<String> {
        self.rpm.iter().filter_map(|p| p.record.source_name()).collect()
    }

    /// Merge another result; the same package gets the union of flags
    pub fn merge(&mut self, other: GatherResult) {
        for category in Category::ALL {
            let mine = self.packages_mut(category);
            let mut by_nevra: BTreeMap<(Nevra, String), GatheredPackage> = mine
                .drain(..)
                .map(|p| ((p.record.nevra(), p.record.repo.clone()), p))
                .collect();
            for pkg in other.packages(category) {
                by_nevra
                    .entry((pkg.record.nevra(), pkg.record.repo.clone()))
                    .and_modify(|existing| existing.flags.extend(pkg.flags.iter().copied()))
                    .or_insert_with(|| pkg.clone());
            }
            *mine = by_nevra.into_values().collect();
        }
        self.broken.extend(other.broken);
        self.missing_sources.extend(other.missing_sources);
        self.normalize();
    }

    /// Sort everything into canonical order
    pub fn normalize(&mut self) {
        for category in Category::ALL {
            let list = self.packages_mut(category);
            list.sort_by(|a, b| package_order(&a.record, &b.record));
            list.dedup_by(|a, b| a.record.nevra() == b.record.nevra() && a.record.repo == b.record.repo);
        }
        self.broken.sort();
        self.broken.dedup();
        self.missing_sources.sort();
        self.missing_sources.dedup();
    }

    /// Serializable form, keyed by NEVRA
    pub fn to_saved(&self) -> SavedResult {
        let save = |list: &[GatheredPackage]| {
            list.iter()
                .map(|p| SavedPackage {
                    nevra: p.record.nevra().to_string(),
                    repo: p.record.repo.clone(),
                    flags: p.flags.clone(),
                })
                .collect()
        };
        SavedResult {
            rpm: save(&self.rpm),
            srpm: save(&self.srpm),
            debuginfo: save(&self.debuginfo),
            broken: self.broken.clone(),
            missing_sources: self.missing_sources.clone(),
        }
    }

    /// Resolve a saved result against a pool; any missing package is an error
    pub fn from_saved(saved: &SavedResult, pool: &PackagePool) -> Result<Self> {
        let load = |list: &[SavedPackage]| -> Result<Vec<GatheredPackage>> {
            list.iter()
                .map(|p| {
                    let nevra = Nevra::parse(&p.nevra)?;
                    let ids = pool.find(&nevra);
                    let id = ids
                        .iter()
                        .find(|id| pool.record(**id).repo == p.repo)
                        .or_else(|| ids.first())
                        .copied()
                        .ok_or_else(|| {
                            Error::ReuseInvalidated(format!("{} is no longer in the package set", p.nevra))
                        })?;
                    Ok(GatheredPackage::new(Arc::clone(pool.record(id)), p.flags.clone()))
                })
                .collect()
        };
        let mut result = Self {
            rpm: load(&saved.rpm)?,
            srpm: load(&saved.srpm)?,
            debuginfo: load(&saved.debuginfo)?,
            broken: saved.broken.clone(),
            missing_sources: saved.missing_sources.clone(),
        };
        result.normalize();
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPackage {
    pub nevra: String,
    pub repo: String,
    pub flags: Flags,
}

/// On-disk gather result (`work/<arch>/gather/<variant>.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedResult {
    pub rpm: Vec<SavedPackage>,
    pub srpm: Vec<SavedPackage>,
    pub debuginfo: Vec<SavedPackage>,
    pub broken: Vec<BrokenDep>,
    pub missing_sources: Vec<String>,
}

/// Gather one (variant, arch): run each seed source with its method and
/// merge, or resolve everything in one pass for `hybrid`
pub fn gather(
    pool: &PackagePool,
    options: &GatherOptions,
    method: &GatherMethodConfig,
    seeds: &BTreeMap<GatherSource, SeedRequest>,
) -> GatherResult {
    if method.is_hybrid() {
        let mut merged = SeedRequest::default();
        for seed in seeds.values() {
            merged.extend(seed.clone());
        }
        let opts = GatherOptions {
            method: GatherMethod::Deps,
            ..options.clone()
        };
        return Solver::new(pool, &opts).run(&merged);
    }

    let mut result = GatherResult::default();
    for (source, seed) in seeds {
        let Some(source_method) = method.for_source(*source) else {
            continue;
        };
        if seed.is_empty() {
            continue;
        }
        let opts = GatherOptions {
            method: source_method,
            ..options.clone()
        };
        result.merge(Solver::new(pool, &opts).run(seed));
    }
    result.normalize();
    result
}
