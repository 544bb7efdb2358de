// src/paths.rs

//! Compose directory layout
//!
//! Every file the compose writes lives under one top directory:
//!
//! ```text
//! <topdir>/STATUS
//! <topdir>/compose/<Variant>/<arch>/os/            binary tree and repo
//! <topdir>/compose/<Variant>/<arch>/os/addons/<id> addon repos
//! <topdir>/compose/<Variant>/<arch>/debug/tree/    debuginfo repo
//! <topdir>/compose/<Variant>/source/tree/          source repo
//! <topdir>/compose/<Variant>/<arch>/{iso,jigdo,images}/
//! <topdir>/compose/metadata/                       compose-level metadata
//! <topdir>/logs/<arch|global>/
//! <topdir>/work/<arch|global>/
//! ```
//!
//! Addons share their parent's trees; other variants get their own.

use crate::config::{Variant, VariantTree, VariantType};
use crate::error::{Error, Result};
use crate::gather::Category;
use std::path::{Path, PathBuf};

/// What a tree directory holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Os,
    Repo,
    Packages,
    Debug,
    Source,
    Iso,
    Jigdo,
    Images,
}

#[derive(Debug, Clone)]
pub struct Paths {
    topdir: PathBuf,
    variants: VariantTree,
}

impl Paths {
    pub fn new(topdir: impl Into<PathBuf>, variants: VariantTree) -> Self {
        Self {
            topdir: topdir.into(),
            variants,
        }
    }

    pub fn topdir(&self) -> &Path {
        &self.topdir
    }

    pub fn status_file(&self) -> PathBuf {
        self.topdir.join("STATUS")
    }

    pub fn compose_dir(&self) -> PathBuf {
        self.topdir.join("compose")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.compose_dir().join("metadata")
    }

    /// `work/<arch>` or `work/global`
    pub fn work_dir(&self, arch: Option<&str>) -> PathBuf {
        self.topdir.join("work").join(arch.unwrap_or("global"))
    }

    /// `logs/<arch>` or `logs/global`
    pub fn log_dir(&self, arch: Option<&str>) -> PathBuf {
        self.topdir.join("logs").join(arch.unwrap_or("global"))
    }

    pub fn log_file(&self, arch: Option<&str>, name: &str) -> PathBuf {
        let suffix = arch.unwrap_or("global");
        self.log_dir(arch).join(format!("{}.{}.log", name, suffix))
    }

    pub fn global_log(&self) -> PathBuf {
        self.log_file(None, "pungi")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.work_dir(None).join("download")
    }

    pub fn reuse_record(&self, phase: &str) -> PathBuf {
        self.work_dir(None).join("reuse").join(format!("{}.json", phase))
    }

    pub fn global_comps(&self) -> PathBuf {
        self.work_dir(None).join("comps").join("comps-global.xml")
    }

    pub fn variant_comps(&self, variant: &Variant, arch: &str) -> PathBuf {
        self.work_dir(Some(arch))
            .join("comps")
            .join(format!("comps-{}.{}.xml", variant.uid, arch))
    }

    pub fn module_defaults_dir(&self) -> PathBuf {
        self.work_dir(None).join("module_defaults")
    }

    pub fn modulemd_file(&self, variant: &Variant, arch: &str, nsvc: &str) -> PathBuf {
        self.work_dir(Some(arch))
            .join("module_metadata")
            .join(&variant.uid)
            .join(format!("{}.yaml", nsvc.replace(':', "-")))
    }

    pub fn gather_result(&self, variant: &Variant, arch: &str) -> PathBuf {
        self.work_dir(Some(arch))
            .join("gather")
            .join(format!("{}.json", variant.uid))
    }

    /// Trim statistics and system-release choice saved with a gather result
    pub fn gather_layering(&self, variant: &Variant, arch: &str) -> PathBuf {
        self.work_dir(Some(arch))
            .join("gather")
            .join(format!("{}.layering.json", variant.uid))
    }

    /// Variant whose trees a variant writes into
    fn tree_owner<'a>(&'a self, variant: &'a Variant) -> &'a Variant {
        match (variant.kind, variant.parent) {
            (VariantType::Addon, Some(parent)) => self.variants.get(parent),
            _ => variant,
        }
    }

    fn addon_subdir(&self, variant: &Variant, base: PathBuf) -> PathBuf {
        if variant.kind == VariantType::Addon && variant.parent.is_some() {
            base.join("addons").join(&variant.local_id)
        } else {
            base
        }
    }

    pub fn os_tree(&self, variant: &Variant, arch: &str) -> PathBuf {
        let owner = self.tree_owner(variant);
        self.compose_dir().join(&owner.uid).join(arch).join("os")
    }

    pub fn debug_tree(&self, variant: &Variant, arch: &str) -> PathBuf {
        let owner = self.tree_owner(variant);
        self.compose_dir()
            .join(&owner.uid)
            .join(arch)
            .join("debug")
            .join("tree")
    }

    pub fn source_tree(&self, variant: &Variant) -> PathBuf {
        let owner = self.tree_owner(variant);
        self.compose_dir().join(&owner.uid).join("source").join("tree")
    }

    /// Root of the repository holding a category of a variant
    pub fn repository(&self, variant: &Variant, arch: &str, category: Category) -> PathBuf {
        let base = match category {
            Category::Rpm => self.os_tree(variant, arch),
            Category::Srpm => self.source_tree(variant),
            Category::Debuginfo => self.debug_tree(variant, arch),
        };
        self.addon_subdir(variant, base)
    }

    /// Directory a package file is linked into; `hashed` adds a
    /// lowercased first-letter level
    pub fn package_dir(
        &self,
        variant: &Variant,
        arch: &str,
        category: Category,
        hashed: bool,
        filename: &str,
    ) -> PathBuf {
        let dir = self.repository(variant, arch, category).join("Packages");
        match filename.chars().next() {
            Some(first) if hashed => dir.join(first.to_lowercase().to_string()),
            _ => dir,
        }
    }

    pub fn iso_dir(&self, variant: &Variant, arch: &str) -> PathBuf {
        let owner = self.tree_owner(variant);
        let arch_dir = if arch == "src" { "source" } else { arch };
        self.compose_dir().join(&owner.uid).join(arch_dir).join("iso")
    }

    pub fn jigdo_dir(&self, variant: &Variant, arch: &str) -> PathBuf {
        let owner = self.tree_owner(variant);
        let arch_dir = if arch == "src" { "source" } else { arch };
        self.compose_dir().join(&owner.uid).join(arch_dir).join("jigdo")
    }

    pub fn images_dir(&self, variant: &Variant, arch: &str) -> PathBuf {
        let owner = self.tree_owner(variant);
        self.compose_dir().join(&owner.uid).join(arch).join("images")
    }

    /// Path of a role for a variant; source roles ignore `arch`
    pub fn for_role(&self, variant: &Variant, arch: &str, role: Role) -> PathBuf {
        match role {
            Role::Os => self.os_tree(variant, arch),
            Role::Repo => self.repository(variant, arch, Category::Rpm),
            Role::Packages => self.repository(variant, arch, Category::Rpm).join("Packages"),
            Role::Debug => self.repository(variant, arch, Category::Debuginfo),
            Role::Source => self.repository(variant, arch, Category::Srpm),
            Role::Iso => self.iso_dir(variant, arch),
            Role::Jigdo => self.jigdo_dir(variant, arch),
            Role::Images => self.images_dir(variant, arch),
        }
    }

    /// Path relative to `compose/`, with forward slashes
    pub fn relative(&self, path: &Path) -> Result<String> {
        let compose = self.compose_dir();
        let rel = path.strip_prefix(&compose).map_err(|_| {
            Error::IoError(format!(
                "{} is not inside {}",
                path.display(),
                compose.display()
            ))
        })?;
        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    /// Path relative to the top directory
    pub fn relative_to_top(&self, path: &Path) -> Result<String> {
        let rel = path.strip_prefix(&self.topdir).map_err(|_| {
            Error::IoError(format!(
                "{} is not inside {}",
                path.display(),
                self.topdir.display()
            ))
        })?;
        Ok(rel.to_string_lossy().into_owned())
    }

    pub fn variants(&self) -> &VariantTree {
        &self.variants
    }
}
