// src/linker.rs

//! Package linker
//!
//! Places gathered packages into the variant trees with the configured link
//! strategy and produces the matching `rpms.json` entries. Linking is
//! idempotent: a destination that already holds the same file is left alone.

use crate::config::{LinkType, Variant};
use crate::error::{Error, Result};
use crate::gather::{Category, GatherResult, GatheredPackage};
use crate::manifest::{RpmCategory, RpmEntry};
use crate::packages::{Nevra, PackageRecord};
use crate::paths::Paths;
use filetime::FileTime;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// What a single link call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Hardlinked,
    Copied,
    Symlinked,
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
pub struct Linker {
    link_type: LinkType,
}

impl Linker {
    pub fn new(link_type: LinkType) -> Self {
        Self { link_type }
    }

    /// Materialize `src` at `dst`
    pub fn link(&self, src: &Path, dst: &Path) -> Result<LinkOutcome> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::symlink_metadata(dst).is_ok() {
            return self.check_existing(src, dst);
        }

        match self.link_type {
            LinkType::Hardlink => {
                fs::hard_link(src, dst).map_err(|e| link_error("hardlink", src, dst, e))?;
                Ok(LinkOutcome::Hardlinked)
            }
            LinkType::Copy => {
                copy_preserving(src, dst)?;
                Ok(LinkOutcome::Copied)
            }
            LinkType::HardlinkOrCopy => match fs::hard_link(src, dst) {
                Ok(()) => Ok(LinkOutcome::Hardlinked),
                Err(e) if is_cross_device(&e) => {
                    debug!("{} is on another device, copying", src.display());
                    copy_preserving(src, dst)?;
                    Ok(LinkOutcome::Copied)
                }
                Err(e) => Err(link_error("hardlink", src, dst, e)),
            },
            LinkType::Symlink => {
                let target = relative_path(dst.parent().unwrap_or(Path::new("/")), src);
                symlink(&target, dst)?;
                Ok(LinkOutcome::Symlinked)
            }
            LinkType::AbsoluteSymlink => {
                let target = absolute(src)?;
                symlink(&target, dst)?;
                Ok(LinkOutcome::Symlinked)
            }
        }
    }

    fn check_existing(&self, src: &Path, dst: &Path) -> Result<LinkOutcome> {
        let same = match self.link_type {
            LinkType::Symlink => fs::read_link(dst)
                .map(|t| t == relative_path(dst.parent().unwrap_or(Path::new("/")), src))
                .unwrap_or(false),
            LinkType::AbsoluteSymlink => {
                let target = absolute(src)?;
                fs::read_link(dst).map(|t| t == target).unwrap_or(false)
            }
            _ => same_file(src, dst)? || same_copy(src, dst)?,
        };
        if same {
            Ok(LinkOutcome::Unchanged)
        } else {
            Err(Error::IoError(format!(
                "{} already exists and differs from {}",
                dst.display(),
                src.display()
            )))
        }
    }
}

fn link_error(what: &str, src: &Path, dst: &Path, e: io::Error) -> Error {
    Error::IoError(format!(
        "Failed to {} {} to {}: {}",
        what,
        src.display(),
        dst.display(),
        e
    ))
}

fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(unix)]
fn symlink(target: &Path, dst: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dst).map_err(|e| link_error("symlink", target, dst, e))
}

#[cfg(not(unix))]
fn symlink(target: &Path, dst: &Path) -> Result<()> {
    Err(Error::IoError(format!(
        "Symlinks are not supported here ({} -> {})",
        dst.display(),
        target.display()
    )))
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let (ma, mb) = (fs::metadata(a)?, fs::metadata(b)?);
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> Result<bool> {
    Ok(false)
}

/// A copy made by this linker has the source's size and mtime
fn same_copy(src: &Path, dst: &Path) -> Result<bool> {
    let (ms, md) = (fs::metadata(src)?, fs::metadata(dst)?);
    Ok(ms.len() == md.len()
        && FileTime::from_last_modification_time(&ms) == FileTime::from_last_modification_time(&md))
}

/// Copy through a temporary file, keeping mode and mtime
fn copy_preserving(src: &Path, dst: &Path) -> Result<()> {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dst.with_file_name(format!(".{}.tmp", name));
    fs::copy(src, &tmp).map_err(|e| link_error("copy", src, dst, e))?;
    let meta = fs::metadata(src)?;
    filetime::set_file_mtime(&tmp, FileTime::from_last_modification_time(&meta))?;
    fs::rename(&tmp, dst)?;
    Ok(())
}

/// Relative path from directory `from` to `to`
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from.components().collect();
    let to_parts: Vec<Component<'_>> = to.components().collect();
    let common = from
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

/// One package placed (or recorded) by `PackageLinker`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedPackage {
    pub category: RpmCategory,
    pub srpm_nevra: String,
    pub nevra: String,
    pub entry: RpmEntry,
}

/// Links whole gather results into the compose
pub struct PackageLinker<'a> {
    paths: &'a Paths,
    linker: Linker,
    hashed: bool,
    workers: usize,
}

impl<'a> PackageLinker<'a> {
    pub fn new(paths: &'a Paths, link_type: LinkType, hashed: bool, workers: usize) -> Self {
        Self {
            paths,
            linker: Linker::new(link_type),
            hashed,
            workers: workers.max(1),
        }
    }

    /// Link every non-lookaside package of a (variant, arch) and return the
    /// manifest entries of all of them
    pub fn link_variant<F>(
        &self,
        variant: &Variant,
        arch: &str,
        result: &GatherResult,
        fetch: F,
    ) -> Result<Vec<LinkedPackage>>
    where
        F: Fn(&PackageRecord) -> Result<PathBuf> + Sync,
    {
        let sources: HashMap<String, &PackageRecord> = result
            .srpm
            .iter()
            .map(|p| (format!("{}.rpm", p.record.nvra()), p.record.as_ref()))
            .collect();

        let mut work: Vec<(Category, &GatheredPackage)> = Vec::new();
        for category in Category::ALL {
            work.extend(result.packages(category).iter().map(|p| (category, p)));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Error::IoError(format!("Failed to start link workers: {}", e)))?;
        let linked: Vec<LinkedPackage> = pool.install(|| {
            work.par_iter()
                .map(|(category, pkg)| self.link_one(variant, arch, *category, pkg, &sources, &fetch))
                .collect::<Result<Vec<_>>>()
        })?;

        info!(
            "Linked {} packages for {}.{}",
            linked.iter().filter(|l| l.entry.path.is_some()).count(),
            variant.uid,
            arch
        );
        Ok(linked)
    }

    fn link_one<F>(
        &self,
        variant: &Variant,
        arch: &str,
        category: Category,
        pkg: &GatheredPackage,
        sources: &HashMap<String, &PackageRecord>,
        fetch: &F,
    ) -> Result<LinkedPackage>
    where
        F: Fn(&PackageRecord) -> Result<PathBuf> + Sync,
    {
        let record = &pkg.record;
        let srpm_nevra = match category {
            Category::Srpm => record.nevra().to_string(),
            _ => source_nevra(record, sources, pkg.is_lookaside()),
        };

        let path = if pkg.is_lookaside() {
            None
        } else {
            let filename = record.filename();
            let dir = self
                .paths
                .package_dir(variant, arch, category, self.hashed, &filename);
            let dst = dir.join(&filename);
            let src = fetch(record)?;
            let outcome = self.linker.link(&src, &dst)?;
            debug!("{:?} {}", outcome, dst.display());
            Some(self.paths.relative(&dst)?)
        };

        Ok(LinkedPackage {
            category: category.into(),
            srpm_nevra,
            nevra: record.nevra().to_string(),
            entry: RpmEntry {
                path,
                sigkey: record.sigkey.clone(),
                lookaside: pkg.is_lookaside(),
            },
        })
    }
}

/// Source NEVRA of a binary: the gathered source package when there is one,
/// otherwise built from the `sourcerpm` header with the binary's epoch
fn source_nevra(
    record: &PackageRecord,
    sources: &HashMap<String, &PackageRecord>,
    lookaside: bool,
) -> String {
    if let Some(srpm) = record.sourcerpm.as_deref()
        && let Some(source) = sources.get(srpm)
    {
        return source.nevra().to_string();
    }

    let synthesized = record
        .sourcerpm
        .as_deref()
        .and_then(|srpm| Nevra::parse(srpm).ok())
        .map(|mut n| {
            n.evr.epoch = record.evr.epoch;
            n
        })
        .unwrap_or_else(|| Nevra::new(record.name.clone(), record.evr.clone(), "src"));
    if lookaside {
        debug!("Source of lookaside package {} taken from its header", record.nvra());
    } else {
        warn!(
            "Source of {} is not in the package set, using {}",
            record.nvra(),
            synthesized
        );
    }
    synthesized.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariantTree;
    use crate::gather::Flag;
    use crate::version::Evr;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("/a/b/c"), Path::new("/a/d/file.rpm")),
            PathBuf::from("../../d/file.rpm")
        );
        assert_eq!(
            relative_path(Path::new("/a"), Path::new("/a/file.rpm")),
            PathBuf::from("file.rpm")
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_hardlink_is_idempotent() {
        use std::os::unix::fs::MetadataExt;

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("pool/dummy-bash-4.2.37-6.x86_64.rpm");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"rpm").unwrap();
        let dst = dir.path().join("tree/Packages/dummy-bash-4.2.37-6.x86_64.rpm");

        let linker = Linker::new(LinkType::HardlinkOrCopy);
        assert_eq!(linker.link(&src, &dst).unwrap(), LinkOutcome::Hardlinked);
        let before = fs::metadata(&dst).unwrap();
        assert_eq!(linker.link(&src, &dst).unwrap(), LinkOutcome::Unchanged);
        let after = fs::metadata(&dst).unwrap();
        assert_eq!(before.ino(), after.ino());
        assert_eq!(before.mtime(), after.mtime());
    }

    #[test]
    fn test_copy_keeps_mtime() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.rpm");
        fs::write(&src, b"content").unwrap();
        filetime::set_file_mtime(&src, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let dst = dir.path().join("out/a.rpm");

        let linker = Linker::new(LinkType::Copy);
        assert_eq!(linker.link(&src, &dst).unwrap(), LinkOutcome::Copied);
        let meta = fs::metadata(&dst).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_000_000);
        assert_eq!(linker.link(&src, &dst).unwrap(), LinkOutcome::Unchanged);
    }

    #[test]
    fn test_existing_different_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.rpm");
        let dst = dir.path().join("b.rpm");
        fs::write(&src, b"one").unwrap();
        fs::write(&dst, b"three").unwrap();
        assert!(Linker::new(LinkType::Copy).link(&src, &dst).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_relative_symlink() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("pool/a.rpm");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"x").unwrap();
        let dst = dir.path().join("tree/Packages/a.rpm");

        let linker = Linker::new(LinkType::Symlink);
        assert_eq!(linker.link(&src, &dst).unwrap(), LinkOutcome::Symlinked);
        assert_eq!(fs::read_link(&dst).unwrap(), PathBuf::from("../../pool/a.rpm"));
        assert_eq!(fs::read(&dst).unwrap(), b"x");
        assert_eq!(linker.link(&src, &dst).unwrap(), LinkOutcome::Unchanged);
    }

    #[test]
    fn test_link_variant_skips_lookaside() {
        let dir = TempDir::new().unwrap();
        let pool_dir = dir.path().join("pool");
        fs::create_dir_all(&pool_dir).unwrap();

        let tree = VariantTree::parse(
            r#"<variants><variant id="Server" name="Server" type="variant">
<arches><arch>x86_64</arch></arches></variant></variants>"#,
        )
        .unwrap();
        let paths = Paths::new(dir.path().join("compose-top"), tree.clone());
        let server = tree.get(tree.by_uid("Server").unwrap());

        let record = |name: &str, arch: &str, epoch: u32| {
            let mut r = PackageRecord::new(name, Evr::new(epoch, "1.0", "1"), arch);
            if arch != "src" {
                r = r.with_sourcerpm(format!("{}-1.0-1.src.rpm", name));
            }
            let path = pool_dir.join(format!("{}-1.0-1.{}.rpm", name, arch));
            fs::write(&path, name).unwrap();
            Arc::new(r.with_path(path))
        };
        let mut lookaside = std::collections::BTreeSet::new();
        lookaside.insert(Flag::Lookaside);
        let result = GatherResult {
            rpm: vec![
                GatheredPackage::new(record("dummy-bash", "x86_64", 0), Default::default()),
                GatheredPackage::new(record("dummy-glibc", "x86_64", 2), lookaside),
            ],
            srpm: vec![GatheredPackage::new(record("dummy-bash", "src", 0), Default::default())],
            ..Default::default()
        };

        let linker = PackageLinker::new(&paths, LinkType::HardlinkOrCopy, true, 2);
        let linked = linker
            .link_variant(server, "x86_64", &result, |r| Ok(r.path.clone()))
            .unwrap();
        assert_eq!(linked.len(), 3);

        let glibc = linked.iter().find(|l| l.nevra.starts_with("dummy-glibc")).unwrap();
        assert!(glibc.entry.lookaside);
        assert!(glibc.entry.path.is_none());
        assert_eq!(glibc.srpm_nevra, "dummy-glibc-2:1.0-1.src");

        let bash = linked
            .iter()
            .find(|l| l.nevra == "dummy-bash-0:1.0-1.x86_64")
            .unwrap();
        assert_eq!(bash.srpm_nevra, "dummy-bash-0:1.0-1.src");
        assert_eq!(
            bash.entry.path.as_deref(),
            Some("Server/x86_64/os/Packages/d/dummy-bash-1.0-1.x86_64.rpm")
        );
        assert!(!paths
            .os_tree(server, "x86_64")
            .join("Packages/d/dummy-glibc-1.0-1.x86_64.rpm")
            .exists());
    }
}
