// src/gather/solver.rs

//! The depsolver
//!
//! Resolves one seed request against one package pool. Work proceeds in
//! rounds: each round takes the packages added by the previous one, resolves
//! their Requires and applies the multilib, langpack, conditional, fulltree
//! and self-hosting policies. Every choice is a pure function of the pool,
//! and packages are always visited in pool order, so the result is
//! reproducible.

use super::multilib::MultilibPolicy;
use super::pool::{PackagePool, PkgId};
use super::seed::{PackageSpec, SeedRequest};
use super::{BrokenDep, Flag, Flags, GatherResult, GatheredPackage};
use crate::arch;
use crate::config::{GatherMethod, GreedyMethod};
use crate::packages::{Nevra, is_ignored_requirement};
use crate::version::Capability;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Solver knobs for one (variant, arch)
#[derive(Debug, Clone, Default)]
pub struct GatherOptions {
    pub method: GatherMethod,
    pub greedy: GreedyMethod,
    pub multilib: MultilibPolicy,
    pub fulltree: bool,
    /// Source names whose siblings are not pulled in by fulltree
    pub fulltree_excludes: BTreeSet<String>,
    pub selfhosting: bool,
    /// `filter_packages` specs (plus filtered system-release providers)
    pub filter: Vec<String>,
}

/// Flags a source package inherits from its binaries
const SOURCE_FLAGS: &[Flag] = &[
    Flag::Input,
    Flag::Fulltree,
    Flag::Langpack,
    Flag::Multilib,
    Flag::FulltreeExclude,
];

pub struct Solver<'a> {
    pool: &'a PackagePool,
    opts: &'a GatherOptions,
    excluded: HashSet<PkgId>,
    binaries: BTreeMap<PkgId, Flags>,
    added: Vec<PkgId>,
    conditional_done: HashSet<usize>,
    selfhosted_sources: HashSet<PkgId>,
    broken: BTreeSet<BrokenDep>,
}

impl<'a> Solver<'a> {
    pub fn new(pool: &'a PackagePool, opts: &'a GatherOptions) -> Self {
        Self {
            pool,
            opts,
            excluded: HashSet::new(),
            binaries: BTreeMap::new(),
            added: Vec::new(),
            conditional_done: HashSet::new(),
            selfhosted_sources: HashSet::new(),
            broken: BTreeSet::new(),
        }
    }

    /// Resolve a seed request
    pub fn run(mut self, seed: &SeedRequest) -> GatherResult {
        self.exclude(seed);
        self.add_seeds(seed);

        if self.opts.method != GatherMethod::Nodeps {
            let mut round = 0;
            while !self.added.is_empty() {
                round += 1;
                let mut batch = std::mem::take(&mut self.added);
                batch.sort();
                trace!("Gather round {}: {} new packages", round, batch.len());

                for id in &batch {
                    self.resolve_deps(*id);
                }
                self.add_multilib(&batch);
                self.add_langpacks(&batch, &seed.langpacks);
                self.add_conditional(&seed.conditional);
                if self.opts.fulltree {
                    self.add_fulltree(&batch);
                }
                if self.opts.selfhosting {
                    self.add_build_requires(&batch);
                }
            }
            debug!("Gather finished after {} rounds", round);
        }

        self.finish()
    }

    /// Compute the excluded set; lookaside packages are never excluded
    fn exclude(&mut self, seed: &SeedRequest) {
        let filters: Vec<PackageSpec> = self
            .opts
            .filter
            .iter()
            .map(|s| PackageSpec::parse(s))
            .chain(seed.excludes.iter().cloned())
            .collect();

        for id in self.pool.ids() {
            if self.pool.is_lookaside(id) {
                continue;
            }
            let record = self.pool.record(id);
            let filtered = filters.iter().any(|f| f.matches(self.pool, id));
            let blacklisted =
                self.pool.is_multilib(id) && self.opts.multilib.is_blacklisted(&record.name);
            if filtered || blacklisted {
                self.excluded.insert(id);
            }
        }
        debug!("{} packages excluded", self.excluded.len());
    }

    fn is_included(&self, id: PkgId) -> bool {
        self.binaries.contains_key(&id)
    }

    /// Add a binary with a flag; returns whether it was new
    fn include(&mut self, id: PkgId, flag: Option<Flag>) -> bool {
        if self.excluded.contains(&id) {
            return false;
        }
        let lookaside = self.pool.is_lookaside(id);
        let fulltree_exclude = !lookaside
            && self
                .pool
                .record(id)
                .source_name()
                .is_some_and(|s| self.opts.fulltree_excludes.contains(&s));

        let is_new = !self.binaries.contains_key(&id);
        let flags = self.binaries.entry(id).or_default();
        if let Some(flag) = flag {
            flags.insert(flag);
        }
        if lookaside {
            flags.insert(Flag::Lookaside);
        }
        if fulltree_exclude {
            flags.insert(Flag::FulltreeExclude);
        }
        if is_new {
            trace!("Adding {}", self.pool.record(id).nvra());
            self.added.push(id);
        }
        is_new
    }

    fn add_seeds(&mut self, seed: &SeedRequest) {
        for pkg in &seed.packages {
            let mut ids = self.seed_candidates(&pkg.spec);
            if let Some(source) = &pkg.source {
                let prefix = format!("{}.", source);
                ids.retain(|id| {
                    self.pool
                        .record(*id)
                        .sourcerpm
                        .as_deref()
                        .is_some_and(|s| s == source.as_str() || s.starts_with(&prefix))
                });
            }
            if ids.is_empty() {
                warn!("No package matches {}", pkg.spec.pattern);
            }
            for id in ids {
                self.include(id, Some(pkg.flag));
            }
        }

        for pin in &seed.module_pins {
            let Ok(nevra) = Nevra::parse(pin) else {
                warn!("Ignoring malformed module RPM {}", pin);
                continue;
            };
            match self.pool.find(&nevra).first() {
                Some(id) => {
                    self.include(*id, Some(Flag::Input));
                }
                None => warn!("Module RPM {} is not in the package set", pin),
            }
        }
    }

    /// Candidates of a seed specification
    fn seed_candidates(&self, spec: &PackageSpec) -> Vec<PkgId> {
        let by_name: Vec<PkgId> = spec
            .by_name(self.pool)
            .into_iter()
            .filter(|id| !self.excluded.contains(id))
            .collect();

        if by_name.is_empty() && !spec.is_glob() {
            let providers: Vec<PkgId> = spec
                .by_provides(self.pool)
                .into_iter()
                .filter(|id| !self.excluded.contains(id))
                .collect();
            if self.opts.greedy == GreedyMethod::All {
                return self.latest_per_name_arch(&providers);
            }
            let preferred = self.prefer(&providers, None);
            return self.best(&preferred).into_iter().collect();
        }

        if self.opts.greedy == GreedyMethod::All {
            return self.latest_per_name_arch(&by_name);
        }
        let candidates = if spec.arch.is_some() {
            by_name
        } else {
            self.prefer(&by_name, None)
        };
        // Best package per name
        let mut by_package: BTreeMap<&str, Vec<PkgId>> = BTreeMap::new();
        for id in &candidates {
            by_package
                .entry(self.pool.record(*id).name.as_str())
                .or_default()
                .push(*id);
        }
        by_package
            .values()
            .filter_map(|ids| self.best(ids))
            .collect()
    }

    /// Narrow candidates: lookaside first, then arch affinity with the requirer
    fn prefer(&self, ids: &[PkgId], requirer: Option<PkgId>) -> Vec<PkgId> {
        let lookaside: Vec<PkgId> = ids
            .iter()
            .copied()
            .filter(|id| self.pool.is_lookaside(*id))
            .collect();
        let ids = if lookaside.is_empty() { ids.to_vec() } else { lookaside };

        let requirer_is_multilib = requirer.is_some_and(|r| self.pool.is_multilib(r));
        let affine: Vec<PkgId> = ids
            .iter()
            .copied()
            .filter(|id| {
                let pkg_arch = &self.pool.record(*id).arch;
                if pkg_arch == "noarch" {
                    return true;
                }
                match requirer {
                    Some(r) if requirer_is_multilib => *pkg_arch == self.pool.record(r).arch,
                    _ => self.pool.is_native(*id),
                }
            })
            .collect();
        if affine.is_empty() { ids } else { affine }
    }

    /// Best package: highest EVR, then arch preference, then shorter name
    fn best(&self, ids: &[PkgId]) -> Option<PkgId> {
        ids.iter().copied().max_by(|a, b| self.compare(*a, *b))
    }

    fn compare(&self, a: PkgId, b: PkgId) -> Ordering {
        let (ra, rb) = (self.pool.record(a), self.pool.record(b));
        let tree_arch = self.pool.tree_arch();
        ra.evr
            .cmp(&rb.evr)
            .then_with(|| arch::arch_rank(tree_arch, &ra.arch).cmp(&arch::arch_rank(tree_arch, &rb.arch)))
            .then_with(|| Reverse(ra.name.len()).cmp(&Reverse(rb.name.len())))
            .then_with(|| rb.name.cmp(&ra.name))
            .then_with(|| b.cmp(&a))
    }

    /// Newest package of every (name, arch)
    fn latest_per_name_arch(&self, ids: &[PkgId]) -> Vec<PkgId> {
        let mut latest: BTreeMap<(&str, &str), PkgId> = BTreeMap::new();
        for id in ids {
            let record = self.pool.record(*id);
            latest
                .entry((record.name.as_str(), record.arch.as_str()))
                .and_modify(|current| {
                    if self.compare(*id, *current) == Ordering::Greater {
                        *current = *id;
                    }
                })
                .or_insert(*id);
        }
        latest.into_values().collect()
    }

    fn resolve_deps(&mut self, id: PkgId) {
        if self.pool.is_lookaside(id) {
            return;
        }
        let record = Arc::clone(self.pool.record(id));
        for require in &record.requires {
            if is_ignored_requirement(&require.name) || record.provides_capability(require) {
                continue;
            }
            self.satisfy(require, Some(id), &record.nvra(), None);
        }
    }

    /// Pull in a provider of a requirement, following the greedy method
    fn satisfy(&mut self, require: &Capability, requirer: Option<PkgId>, requirer_nvra: &str, flag: Option<Flag>) {
        let providers: Vec<PkgId> = self
            .pool
            .providers(require)
            .into_iter()
            .filter(|p| !self.excluded.contains(p))
            .collect();
        if providers.is_empty() {
            debug!("Unresolved dependency {} of {}", require, requirer_nvra);
            self.broken.insert(BrokenDep {
                package: requirer_nvra.to_string(),
                requirement: require.to_string(),
            });
            return;
        }

        let candidates = self.prefer(&providers, requirer);
        match self.opts.greedy {
            GreedyMethod::None => {
                if providers.iter().any(|p| self.is_included(*p)) {
                    return;
                }
                if let Some(best) = self.best(&candidates) {
                    self.include(best, flag);
                }
            }
            GreedyMethod::All => {
                for id in self.latest_per_name_arch(&candidates) {
                    self.include(id, flag);
                }
            }
            GreedyMethod::Build => {
                let Some(best) = self.best(&candidates) else {
                    return;
                };
                self.include(best, flag);
                let srpm = self.pool.record(best).sourcerpm.clone();
                let best_is_native = !self.pool.is_multilib(best);
                let siblings: Vec<PkgId> = candidates
                    .iter()
                    .copied()
                    .filter(|c| *c != best && self.pool.record(*c).sourcerpm == srpm)
                    .filter(|c| best_is_native || !self.pool.is_native(*c))
                    .collect();
                for id in siblings {
                    self.include(id, flag);
                }
            }
        }
    }

    fn add_multilib(&mut self, batch: &[PkgId]) {
        if !self.opts.multilib.is_enabled() {
            return;
        }
        for id in batch {
            if !self.pool.is_native(*id) || self.pool.is_lookaside(*id) {
                continue;
            }
            let record = Arc::clone(self.pool.record(*id));
            if !self.opts.multilib.qualifies(&record) {
                continue;
            }
            let companions: Vec<PkgId> = self
                .pool
                .by_name(&record.name)
                .iter()
                .copied()
                .filter(|c| self.pool.is_multilib(*c) && self.pool.record(*c).evr == record.evr)
                .filter(|c| !self.excluded.contains(c))
                .collect();
            if let Some(best) = self.best(&companions) {
                self.include(best, Some(Flag::Multilib));
            }
        }
    }

    fn add_langpacks(&mut self, batch: &[PkgId], langpacks: &BTreeMap<String, String>) {
        if langpacks.is_empty() {
            return;
        }
        for id in batch {
            let base = self.pool.record(*id).name.clone();
            let Some(install) = langpacks.get(&base) else {
                continue;
            };
            let Ok(pattern) = glob::Pattern::new(&install.replace("%s", "*")) else {
                warn!("Invalid langpack pattern {}", install);
                continue;
            };
            let names: Vec<String> = self
                .pool
                .names()
                .filter(|n| *n != base && pattern.matches(n))
                .filter(|n| !n.ends_with("-devel") && !n.ends_with("-static"))
                .map(str::to_string)
                .collect();
            for name in names {
                let candidates: Vec<PkgId> = self
                    .pool
                    .by_name(&name)
                    .iter()
                    .copied()
                    .filter(|c| !self.excluded.contains(c))
                    .collect();
                let preferred = self.prefer(&candidates, Some(*id));
                if let Some(best) = self.best(&preferred) {
                    self.include(best, Some(Flag::Langpack));
                }
            }
        }
    }

    fn add_conditional(&mut self, conditional: &[(String, String)]) {
        for (i, (package, trigger)) in conditional.iter().enumerate() {
            if self.conditional_done.contains(&i) {
                continue;
            }
            let Some(trigger_id) = self
                .binaries
                .keys()
                .copied()
                .find(|id| self.pool.record(*id).name == *trigger)
            else {
                continue;
            };
            self.conditional_done.insert(i);
            let candidates: Vec<PkgId> = self
                .pool
                .by_name(package)
                .iter()
                .copied()
                .filter(|c| !self.excluded.contains(c))
                .collect();
            let preferred = self.prefer(&candidates, Some(trigger_id));
            if let Some(best) = self.best(&preferred) {
                self.include(best, Some(Flag::Comps));
            }
        }
    }

    /// Pull every binary of a source once one is in, keeping the arch
    /// class stable: native brings native, multilib brings multilib,
    /// noarch alone brings native
    fn add_fulltree(&mut self, batch: &[PkgId]) {
        let mut sources: BTreeSet<String> = BTreeSet::new();
        for id in batch {
            let record = self.pool.record(*id);
            if self.pool.is_lookaside(*id) || record.is_debug() {
                continue;
            }
            let Some(srpm) = record.sourcerpm.clone() else {
                continue;
            };
            if record
                .source_name()
                .is_some_and(|s| self.opts.fulltree_excludes.contains(&s))
            {
                continue;
            }
            sources.insert(srpm);
        }

        for srpm in sources {
            let siblings: Vec<PkgId> = self
                .pool
                .ids()
                .filter(|id| {
                    let r = self.pool.record(*id);
                    r.sourcerpm.as_deref() == Some(srpm.as_str()) && !r.is_debug() && !self.pool.is_lookaside(*id)
                })
                .collect();
            let included: Vec<PkgId> = siblings.iter().copied().filter(|s| self.is_included(*s)).collect();
            let has_native = included.iter().any(|s| self.pool.is_native(*s));
            let has_multilib = included.iter().any(|s| self.pool.is_multilib(*s));
            let want_native = has_native || !has_multilib;

            let to_add: Vec<PkgId> = siblings
                .into_iter()
                .filter(|s| !self.is_included(*s))
                .filter(|s| {
                    self.pool.is_noarch(*s)
                        || (want_native && self.pool.is_native(*s))
                        || (has_multilib && self.pool.is_multilib(*s))
                })
                .collect();
            for id in self.latest_per_name_arch(&to_add) {
                self.include(id, Some(Flag::Fulltree));
            }
        }
    }

    /// Resolve the Build-Requires of the sources of new binaries
    fn add_build_requires(&mut self, batch: &[PkgId]) {
        for id in batch {
            if self.pool.is_lookaside(*id) {
                continue;
            }
            let Some(source) = self.pool.source_of(*id) else {
                continue;
            };
            if !self.selfhosted_sources.insert(source) {
                continue;
            }
            let record = Arc::clone(self.pool.record(source));
            for require in &record.requires {
                if is_ignored_requirement(&require.name) {
                    continue;
                }
                self.satisfy(require, None, &record.nvra(), Some(Flag::SelfHosting));
            }
        }
    }

    fn finish(self) -> GatherResult {
        let pool = self.pool;
        let mut sources: BTreeMap<PkgId, Flags> = BTreeMap::new();
        let mut missing_sources = Vec::new();

        for (id, flags) in &self.binaries {
            if pool.is_lookaside(*id) {
                continue;
            }
            match pool.source_of(*id) {
                Some(src) if !self.excluded.contains(&src) => {
                    let entry = sources.entry(src).or_default();
                    entry.extend(flags.iter().copied().filter(|f| SOURCE_FLAGS.contains(f)));
                    if pool.is_lookaside(src) {
                        entry.insert(Flag::Lookaside);
                    }
                }
                Some(_) => {}
                None => {
                    if pool.record(*id).sourcerpm.is_some() {
                        missing_sources.push(pool.record(*id).nvra());
                    }
                }
            }
        }

        let mut debuginfo: BTreeMap<PkgId, Flags> = BTreeMap::new();
        for id in self.binaries.keys() {
            if pool.is_lookaside(*id) {
                continue;
            }
            let arch = &pool.record(*id).arch;
            let source_flags = pool
                .source_of(*id)
                .and_then(|src| sources.get(&src))
                .cloned()
                .unwrap_or_default();
            for sibling in pool.siblings(*id) {
                let record = pool.record(*sibling);
                if record.is_debug() && &record.arch == arch && !self.excluded.contains(sibling) {
                    debuginfo
                        .entry(*sibling)
                        .or_default()
                        .extend(source_flags.iter().copied());
                }
            }
        }

        let collect = |map: BTreeMap<PkgId, Flags>| -> Vec<GatheredPackage> {
            map.into_iter()
                .map(|(id, flags)| GatheredPackage::new(Arc::clone(pool.record(id)), flags))
                .collect()
        };
        let mut result = GatherResult {
            rpm: collect(self.binaries),
            srpm: collect(sources),
            debuginfo: collect(debuginfo),
            broken: self.broken.into_iter().collect(),
            missing_sources,
        };
        result.normalize();
        result
    }
}
