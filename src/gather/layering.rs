// src/gather/layering.rs

//! Variant layering
//!
//! Runs the gather engine over the variant tree in type order (variant,
//! addon, layered-product, optional). Children are gathered against their
//! parent's result: parent sources do not trigger fulltree in the child,
//! packages the parent already has are trimmed from the child, and
//! fulltree-exclude orphans move up into the parent. Arches are independent
//! and run in parallel.

use super::multilib::MultilibPolicy;
use super::pool::PackagePool;
use super::seed::{self, Prepopulate, SeedRequest, SourceMapping, SystemRelease};
use super::solver::GatherOptions;
use super::{Category, Flag, GatherResult, GatheredPackage};
use crate::comps::Comps;
use crate::comps::modules::{ModuleDefaults, module_pins, variant_modules};
use crate::config::{Config, GatherSource, Variant, VariantId, VariantTree, VariantType};
use crate::error::{Error, Result};
use crate::packages::PackageRecord;
use crate::pkgset::{ModuleBuild, PackageSet};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What trimming did to one (variant, arch)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimStats {
    pub removed: usize,
    pub promoted: usize,
}

/// Layering outcome of one (variant, arch), saved next to its gather result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeringRecord {
    pub trim: TrimStats,
    pub system_release: SystemRelease,
}

/// Gather output of the whole compose, keyed by (variant uid, arch)
#[derive(Debug, Clone, Default)]
pub struct VariantResults {
    pub results: BTreeMap<(String, String), GatherResult>,
    pub trim: BTreeMap<(String, String), TrimStats>,
    pub modules: BTreeMap<(String, String), Vec<ModuleBuild>>,
    pub system_release: BTreeMap<(String, String), SystemRelease>,
}

impl VariantResults {
    pub fn get(&self, uid: &str, arch: &str) -> Option<&GatherResult> {
        self.results.get(&(uid.to_string(), arch.to_string()))
    }

    pub fn insert(&mut self, uid: &str, arch: &str, result: GatherResult) {
        self.results.insert((uid.to_string(), arch.to_string()), result);
    }

    pub fn layering(&self, uid: &str, arch: &str) -> LayeringRecord {
        let key = (uid.to_string(), arch.to_string());
        LayeringRecord {
            trim: self.trim.get(&key).copied().unwrap_or_default(),
            system_release: self.system_release.get(&key).cloned().unwrap_or_default(),
        }
    }

    /// Put back the layering outcome of a reloaded result
    pub fn restore_layering(&mut self, uid: &str, arch: &str, record: LayeringRecord) {
        let key = (uid.to_string(), arch.to_string());
        if let Some(result) = self.results.get(&key) {
            log_layering(uid, arch, result, &record);
        }
        self.trim.insert(key.clone(), record.trim);
        self.system_release.insert(key, record.system_release);
    }

    fn extend(&mut self, other: VariantResults) {
        self.results.extend(other.results);
        self.trim.extend(other.trim);
        self.modules.extend(other.modules);
        self.system_release.extend(other.system_release);
    }

    /// Unsatisfied requirements are fatal when `check_deps` is on, unless
    /// the (variant, arch) may fail its gather
    pub fn check_dependencies(&self, config: &Config) -> Result<()> {
        let mut fatal = Vec::new();
        for ((uid, arch), result) in &self.results {
            for dep in &result.broken {
                warn!(
                    "Unresolved dependency in {}.{}: {} requires {}",
                    uid, arch, dep.package, dep.requirement
                );
            }
            if !result.broken.is_empty()
                && config.check_deps
                && !config.is_failable(uid, arch, "gather")
            {
                fatal.push(format!("{}.{} ({} broken)", uid, arch, result.broken.len()));
            }
        }
        if fatal.is_empty() {
            Ok(())
        } else {
            Err(Error::Unsatisfiable(fatal.join(", ")))
        }
    }
}

/// Everything the gather of one compose reads
pub struct GatherContext<'a> {
    pub config: &'a Config,
    pub variants: &'a VariantTree,
    pub pkgset: &'a PackageSet,
    pub comps: Option<&'a Comps>,
    pub module_defaults: &'a ModuleDefaults,
    pub prepopulate: Option<&'a Prepopulate>,
    pub source_mapping: Option<&'a SourceMapping>,
    /// Loaded lookaside repositories, keyed by location
    pub lookaside: &'a BTreeMap<String, Vec<Arc<PackageRecord>>>,
}

pub struct LayeringEngine<'a> {
    ctx: GatherContext<'a>,
}

impl<'a> LayeringEngine<'a> {
    pub fn new(ctx: GatherContext<'a>) -> Self {
        Self { ctx }
    }

    /// Gather every (variant, arch)
    pub fn run(&self, arches: &[String]) -> Result<VariantResults> {
        let per_arch: Vec<Result<VariantResults>> =
            arches.par_iter().map(|arch| self.run_arch(arch)).collect();
        let mut results = VariantResults::default();
        for arch_results in per_arch {
            results.extend(arch_results?);
        }
        Ok(results)
    }

    fn run_arch(&self, arch: &str) -> Result<VariantResults> {
        let tree = self.ctx.variants;
        let mut done: BTreeMap<VariantId, GatherResult> = BTreeMap::new();
        let mut out = VariantResults::default();

        for kind in VariantType::ORDER {
            for vid in self.lookaside_order(tree.of_type(kind)) {
                let variant = tree.get(vid);
                if !variant.has_arch(arch) || variant.is_empty {
                    continue;
                }
                let key = (variant.uid.clone(), arch.to_string());
                let parent_release = variant
                    .parent
                    .and_then(|p| out.system_release.get(&(tree.get(p).uid.clone(), arch.to_string())))
                    .cloned();

                let modules = variant_modules(
                    &variant.modules,
                    self.ctx.pkgset.modules(),
                    self.ctx.module_defaults,
                )?;
                let pool = self.pool_for(variant, arch, &modules, &done);
                let release = if self.ctx.config.filter_system_release_packages {
                    seed::select_system_release(&pool, variant, parent_release.as_ref())
                } else {
                    SystemRelease::default()
                };

                let fulltree_excludes = variant
                    .parent
                    .and_then(|p| done.get(&p))
                    .map(GatherResult::source_names)
                    .unwrap_or_default();
                let options = self.options(variant, arch, &pool, fulltree_excludes, &release);
                let seeds = self.seeds(variant, arch, &modules, &release);

                info!("Gathering packages for {}.{}", variant.uid, arch);
                let mut result = super::gather(&pool, &options, &self.ctx.config.gather_method, &seeds);

                let mut stats = TrimStats::default();
                if let Some(parent) = variant.parent
                    && let Some(parent_result) = done.get_mut(&parent)
                {
                    stats = trim(&mut result, parent_result, kind == VariantType::LayeredProduct);
                }
                if kind == VariantType::Optional {
                    let sibling_keys: BTreeSet<(String, String)> = tree
                        .layered_siblings(vid)
                        .iter()
                        .filter_map(|s| done.get(s))
                        .flat_map(GatherResult::binary_keys)
                        .collect();
                    let before = result.rpm.len();
                    result
                        .rpm
                        .retain(|p| !sibling_keys.contains(&(p.record.name.clone(), p.record.arch.clone())));
                    stats.removed += before - result.rpm.len();
                }
                let record = LayeringRecord {
                    trim: stats,
                    system_release: release,
                };
                log_layering(&variant.uid, arch, &result, &record);

                out.trim.insert(key.clone(), record.trim);
                out.system_release.insert(key.clone(), record.system_release);
                out.modules
                    .insert(key, modules.into_iter().cloned().collect());
                done.insert(vid, result);
            }
        }

        for (vid, result) in done {
            out.insert(&tree.get(vid).uid, arch, result);
        }
        Ok(out)
    }

    /// Order variants of one type so that a variant used as lookaside is
    /// gathered before the variants that use it
    fn lookaside_order(&self, ids: Vec<VariantId>) -> Vec<VariantId> {
        let tree = self.ctx.variants;
        let sources_of = |id: VariantId| -> Vec<&String> {
            self.ctx
                .config
                .variant_as_lookaside
                .iter()
                .filter(|(dest, _)| *dest == tree.get(id).uid)
                .map(|(_, source)| source)
                .collect()
        };

        let mut ordered = Vec::with_capacity(ids.len());
        let mut pending = ids;
        while !pending.is_empty() {
            let pending_uids: BTreeSet<&str> = pending.iter().map(|id| tree.get(*id).uid.as_str()).collect();
            let (ready, blocked): (Vec<VariantId>, Vec<VariantId>) = pending
                .iter()
                .copied()
                .partition(|id| sources_of(*id).iter().all(|s| !pending_uids.contains(s.as_str())));
            if ready.is_empty() {
                warn!("Variants used as lookaside for each other; gathering them in uid order");
                ordered.extend(blocked);
                break;
            }
            ordered.extend(ready);
            pending = blocked;
        }
        ordered
    }

    /// Pool of a (variant, arch): the module-filtered package set view plus
    /// configured lookaside repos and variants used as lookaside
    fn pool_for(
        &self,
        variant: &Variant,
        arch: &str,
        modules: &[&ModuleBuild],
        done: &BTreeMap<VariantId, GatherResult>,
    ) -> PackagePool {
        let view = self.ctx.pkgset.view(arch, modules);
        let mut lookaside: Vec<Arc<PackageRecord>> = Vec::new();
        for location in self.ctx.config.lookaside_for(&variant.uid, arch) {
            match self.ctx.lookaside.get(&location) {
                Some(records) => lookaside.extend(records.iter().cloned()),
                None => warn!("Lookaside repo {} was not loaded", location),
            }
        }
        for (dest, source) in &self.ctx.config.variant_as_lookaside {
            if *dest != variant.uid {
                continue;
            }
            let source_result = self
                .ctx
                .variants
                .by_uid(source)
                .and_then(|id| done.get(&id));
            match source_result {
                Some(result) => lookaside.extend(result.rpm.iter().map(|p| Arc::clone(&p.record))),
                None => warn!(
                    "Variant {} used as lookaside for {} has no result on {}",
                    source, dest, arch
                ),
            }
        }
        PackagePool::new(arch, &view, &lookaside)
    }

    /// Pool used to resolve saved gather results of an arch
    pub fn reuse_pool(&self, arch: &str) -> PackagePool {
        let view: Vec<Arc<PackageRecord>> = self
            .ctx
            .pkgset
            .arch_packages(arch)
            .iter()
            .chain(self.ctx.pkgset.sources())
            .cloned()
            .collect();
        let lookaside: Vec<Arc<PackageRecord>> =
            self.ctx.lookaside.values().flatten().cloned().collect();
        PackagePool::new(arch, &view, &lookaside)
    }

    fn options(
        &self,
        variant: &Variant,
        arch: &str,
        pool: &PackagePool,
        fulltree_excludes: BTreeSet<String>,
        release: &SystemRelease,
    ) -> GatherOptions {
        let config = self.ctx.config;
        let multilib = MultilibPolicy::new(
            &config.multilib_methods(&variant.uid, arch),
            &Config::packages_for(&config.multilib_whitelist, &variant.uid, arch),
            &Config::packages_for(&config.multilib_blacklist, &variant.uid, arch),
        )
        .with_pool(pool);
        let mut filter = Config::packages_for(&config.filter_packages, &variant.uid, arch);
        filter.extend(release.filtered.iter().cloned());

        GatherOptions {
            method: Default::default(),
            greedy: config.greedy_method,
            multilib,
            fulltree: config.gather_fulltree,
            fulltree_excludes,
            selfhosting: config.gather_selfhosting,
            filter,
        }
    }

    fn seeds(
        &self,
        variant: &Variant,
        arch: &str,
        modules: &[&ModuleBuild],
        release: &SystemRelease,
    ) -> BTreeMap<GatherSource, SeedRequest> {
        let mut seeds = BTreeMap::new();
        let comps = self.ctx.comps.map(|c| c.for_arch(arch));
        let mut comps_seed =
            seed::comps_seed(self.ctx.config, variant, arch, comps.as_ref(), self.ctx.prepopulate);
        if let Some(chosen) = &release.chosen {
            comps_seed.add(chosen, Flag::Input);
        }
        seeds.insert(GatherSource::Comps, comps_seed);
        if let Some(mapping) = self.ctx.source_mapping {
            seeds.insert(GatherSource::Json, seed::json_seed(mapping, variant, arch));
        }
        if !modules.is_empty() {
            seeds.insert(GatherSource::Module, seed::module_seed(module_pins(modules, arch)));
        }
        seeds
    }
}

fn log_layering(uid: &str, arch: &str, result: &GatherResult, record: &LayeringRecord) {
    if let Some(chosen) = &record.system_release.chosen {
        debug!("{}.{}: system-release provider {}", uid, arch, chosen);
    }
    debug!(
        "{}.{}: {} rpms, {} removed, {} promoted",
        uid,
        arch,
        result.rpm.len(),
        record.trim.removed,
        record.trim.promoted
    );
}

/// Trim a child result against its parent.
///
/// Fulltree-exclude packages the parent lacks (and that were not asked for
/// directly) move to the parent. Binaries whose (name, arch) the parent has
/// are dropped; so are sources and debuginfo the parent has, except for
/// layered products.
pub fn trim(child: &mut GatherResult, parent: &mut GatherResult, keep_sources: bool) -> TrimStats {
    let mut stats = TrimStats::default();

    for category in Category::ALL {
        let parent_nevras = parent.nevras(category);
        let (promote, keep): (Vec<GatheredPackage>, Vec<GatheredPackage>) =
            std::mem::take(child.packages_mut(category))
                .into_iter()
                .partition(|p| {
                    p.has(Flag::FulltreeExclude)
                        && !p.has(Flag::Input)
                        && !p.is_lookaside()
                        && !parent_nevras.contains(&p.record.nevra())
                });
        if category == Category::Rpm {
            stats.promoted += promote.len();
        }
        for pkg in &promote {
            debug!("Moving {} to parent variant", pkg.record.nvra());
        }
        parent.packages_mut(category).extend(promote);
        *child.packages_mut(category) = keep;
    }

    let parent_keys = parent.binary_keys();
    let before = child.rpm.len();
    child
        .rpm
        .retain(|p| !parent_keys.contains(&(p.record.name.clone(), p.record.arch.clone())));
    stats.removed = before - child.rpm.len();

    if !keep_sources {
        let parent_srpms = parent.nevras(Category::Srpm);
        let parent_debug = parent.nevras(Category::Debuginfo);
        child.srpm.retain(|p| !parent_srpms.contains(&p.record.nevra()));
        child.debuginfo.retain(|p| !parent_debug.contains(&p.record.nevra()));
    }

    parent.normalize();
    child.normalize();
    stats
}
