// src/gather/pool.rs

//! Per-arch package pool
//!
//! A `PackagePool` indexes the package-set view of one tree arch together
//! with the lookaside packages visible to one (variant, arch). Entries are
//! stored in canonical package order, so a `PkgId` sorts the same way the
//! records do.

use crate::arch;
use crate::packages::{Nevra, PackageRecord};
use crate::pkgset::package_order;
use crate::version::Capability;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Index of a package inside one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkgId(pub usize);

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub record: Arc<PackageRecord>,
    /// Satisfies dependencies but is never copied into the output
    pub lookaside: bool,
}

/// Searchable packages for one tree arch
#[derive(Debug, Default)]
pub struct PackagePool {
    tree_arch: String,
    entries: Vec<PoolEntry>,
    /// Non-debug binaries by name
    by_name: BTreeMap<String, Vec<PkgId>>,
    /// Non-debug binaries by provided capability name (including self-provides)
    provides: HashMap<String, Vec<PkgId>>,
    files: HashMap<String, Vec<PkgId>>,
    /// Source package file name → source packages (lookaside first)
    sources: HashMap<String, Vec<PkgId>>,
    /// Source package file name → binaries built from it (debug included)
    built_from: HashMap<String, Vec<PkgId>>,
    by_nevra: HashMap<Nevra, Vec<PkgId>>,
}

impl PackagePool {
    /// Build a pool; a lookaside package hides a main package with the same NEVRA
    pub fn new(
        tree_arch: &str,
        packages: &[Arc<PackageRecord>],
        lookaside: &[Arc<PackageRecord>],
    ) -> Self {
        let lookaside_nevras: HashSet<Nevra> = lookaside.iter().map(|r| r.nevra()).collect();

        let mut entries: Vec<PoolEntry> = lookaside
            .iter()
            .filter(|r| r.is_source() || arch::is_compatible(tree_arch, &r.arch))
            .map(|r| PoolEntry {
                record: Arc::clone(r),
                lookaside: true,
            })
            .collect();
        entries.extend(
            packages
                .iter()
                .filter(|r| !lookaside_nevras.contains(&r.nevra()))
                .filter(|r| r.is_source() || arch::is_compatible(tree_arch, &r.arch))
                .map(|r| PoolEntry {
                    record: Arc::clone(r),
                    lookaside: false,
                }),
        );
        entries.sort_by(|a, b| {
            package_order(&a.record, &b.record).then_with(|| b.lookaside.cmp(&a.lookaside))
        });
        entries.dedup_by(|a, b| a.record.nevra() == b.record.nevra() && a.lookaside == b.lookaside);

        let mut pool = Self {
            tree_arch: tree_arch.to_string(),
            entries,
            ..Default::default()
        };
        pool.index();
        pool
    }

    fn index(&mut self) {
        for (i, entry) in self.entries.iter().enumerate() {
            let id = PkgId(i);
            let record = &entry.record;
            self.by_nevra.entry(record.nevra()).or_default().push(id);

            if record.is_source() {
                self.sources.entry(source_key(record)).or_default().push(id);
                continue;
            }
            if let Some(srpm) = &record.sourcerpm {
                self.built_from.entry(srpm.clone()).or_default().push(id);
            }
            if record.is_debug() {
                continue;
            }
            self.by_name.entry(record.name.clone()).or_default().push(id);
            self.provides.entry(record.name.clone()).or_default().push(id);
            for cap in &record.provides {
                let ids = self.provides.entry(cap.name.clone()).or_default();
                if ids.last() != Some(&id) {
                    ids.push(id);
                }
            }
            for file in &record.files {
                self.files.entry(file.clone()).or_default().push(id);
            }
        }
        for ids in self.sources.values_mut() {
            let entries = &self.entries;
            ids.sort_by_key(|id| !entries[id.0].lookaside);
        }
    }

    pub fn tree_arch(&self) -> &str {
        &self.tree_arch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: PkgId) -> &PoolEntry {
        &self.entries[id.0]
    }

    pub fn record(&self, id: PkgId) -> &Arc<PackageRecord> {
        &self.entries[id.0].record
    }

    pub fn is_lookaside(&self, id: PkgId) -> bool {
        self.entries[id.0].lookaside
    }

    pub fn ids(&self) -> impl Iterator<Item = PkgId> + '_ {
        (0..self.entries.len()).map(PkgId)
    }

    /// Non-debug binary package names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Non-debug binaries with exactly this name
    pub fn by_name(&self, name: &str) -> &[PkgId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Non-debug binaries whose Provides or file list satisfy a requirement
    pub fn providers(&self, require: &Capability) -> Vec<PkgId> {
        let mut ids: Vec<PkgId> = self
            .provides
            .get(&require.name)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| self.record(*id).provides_capability(require))
                    .collect()
            })
            .unwrap_or_default();
        if require.name.starts_with('/')
            && let Some(owners) = self.files.get(&require.name)
        {
            ids.extend(owners.iter().copied());
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Source package of a binary, preferring the lookaside copy
    pub fn source_of(&self, id: PkgId) -> Option<PkgId> {
        let record = self.record(id);
        let srpm = record.sourcerpm.as_deref()?;
        self.sources.get(srpm).and_then(|ids| ids.first().copied())
    }

    /// Binaries (debug included) built from the same source package file
    pub fn siblings(&self, id: PkgId) -> &[PkgId] {
        self.record(id)
            .sourcerpm
            .as_deref()
            .and_then(|srpm| self.built_from.get(srpm))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Binaries built from a source package
    pub fn built_from(&self, source: PkgId) -> &[PkgId] {
        self.built_from
            .get(&source_key(self.record(source)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pool entries with exactly this NEVRA (lookaside first)
    pub fn find(&self, nevra: &Nevra) -> Vec<PkgId> {
        let mut ids = self.by_nevra.get(nevra).cloned().unwrap_or_default();
        ids.sort_by_key(|id| !self.is_lookaside(*id));
        ids
    }

    /// Whether a binary is native, noarch or multilib on this pool's arch
    pub fn is_multilib(&self, id: PkgId) -> bool {
        arch::is_multilib(&self.tree_arch, &self.record(id).arch)
    }

    pub fn is_native(&self, id: PkgId) -> bool {
        arch::is_native(&self.tree_arch, &self.record(id).arch)
    }

    pub fn is_noarch(&self, id: PkgId) -> bool {
        self.record(id).arch == "noarch"
    }
}

/// File name a source package is referenced by from its binaries
fn source_key(record: &PackageRecord) -> String {
    format!("{}.rpm", record.nvra())
}
