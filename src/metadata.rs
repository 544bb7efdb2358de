// src/metadata.rs

//! Compose metadata: `composeinfo.json` plus `.treeinfo`, `.discinfo` and
//! `media.repo` on every os tree
//!
//! Output depends only on the compose inputs. The build timestamp is the
//! compose date at midnight UTC rather than the wall clock, and every map is
//! sorted, so two runs over the same inputs write identical files.

use crate::compose::{Compose, ComposeIdentity};
use crate::config::{Config, Variant, VariantType};
use crate::error::{Error, Result};
use crate::gather::Category;
use crate::manifest::{file_checksums, save};
use crate::paths::Role;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const COMPOSEINFO_FILE: &str = "composeinfo.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub short: String,
    pub version: String,
    #[serde(rename = "type")]
    pub release_type: String,
    pub is_layered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseProductInfo {
    pub name: String,
    pub short: String,
    pub version: String,
    #[serde(rename = "type")]
    pub product_type: String,
}

/// path kind → arch → path relative to `compose/`
pub type VariantPaths = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantInfo {
    pub id: String,
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub variant_type: String,
    pub arches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub paths: VariantPaths,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeInfo {
    pub compose: ComposeIdentity,
    pub release: ReleaseInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_product: Option<BaseProductInfo>,
    pub variants: BTreeMap<String, VariantInfo>,
}

impl ComposeInfo {
    pub fn load(path: &Path) -> Result<Self> {
        crate::manifest::load(path, "productmd.composeinfo")
    }
}

fn release_info(config: &Config) -> ReleaseInfo {
    ReleaseInfo {
        name: config.release_name.clone(),
        short: config.release_short.clone(),
        version: config.release_version.clone(),
        release_type: config.release_type.clone(),
        is_layered: config.release_is_layered,
    }
}

fn base_product_info(config: &Config) -> Option<BaseProductInfo> {
    if !config.release_is_layered {
        return None;
    }
    Some(BaseProductInfo {
        name: config.base_product_name.clone()?,
        short: config.base_product_short.clone()?,
        version: config.base_product_version.clone()?,
        product_type: config
            .base_product_type
            .clone()
            .unwrap_or_else(|| "ga".to_string()),
    })
}

/// Seconds since the epoch of the compose date
fn build_timestamp(identity: &ComposeIdentity) -> Result<i64> {
    let date = NaiveDate::parse_from_str(&identity.date, "%Y%m%d")
        .map_err(|e| Error::ParseError(format!("Bad compose date {}: {}", identity.date, e)))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default())
}

/// Path kinds of `composeinfo.json` and the role each one maps to
const PATH_KINDS: &[(&str, Role)] = &[
    ("os_tree", Role::Os),
    ("repository", Role::Repo),
    ("packages", Role::Packages),
    ("debug_tree", Role::Debug),
    ("debug_repository", Role::Debug),
    ("debug_packages", Role::Debug),
    ("source_tree", Role::Source),
    ("source_repository", Role::Source),
    ("source_packages", Role::Source),
    ("isos", Role::Iso),
    ("jigdos", Role::Jigdo),
    ("images", Role::Images),
];

fn variant_paths(compose: &Compose, variant: &Variant, arches: &[String]) -> Result<VariantPaths> {
    let paths = &compose.paths;
    let mut table = VariantPaths::new();
    for arch in arches {
        for (kind, role) in PATH_KINDS {
            let mut path = paths.for_role(variant, arch, *role);
            if kind.ends_with("_packages") {
                path = path.join("Packages");
            }
            if !path.exists() {
                continue;
            }
            table
                .entry(kind.to_string())
                .or_default()
                .insert(arch.clone(), paths.relative(&path)?);
        }
    }
    Ok(table)
}

/// Build `composeinfo.json`; paths missing on disk are left out
pub fn compose_info(compose: &Compose) -> Result<ComposeInfo> {
    let arches = compose.arches();
    let mut variants = BTreeMap::new();
    for id in compose.variants.ids() {
        let variant = compose.variants.get(id);
        let variant_arches: Vec<String> = variant
            .arches
            .iter()
            .filter(|a| arches.contains(a))
            .cloned()
            .collect();
        variants.insert(
            variant.uid.clone(),
            VariantInfo {
                id: variant.local_id.clone(),
                uid: variant.uid.clone(),
                name: variant.name.clone(),
                variant_type: variant.kind.as_str().to_string(),
                parent: compose.variants.parent(id).map(|p| p.uid.clone()),
                paths: variant_paths(compose, variant, &variant_arches)?,
                arches: variant_arches,
            },
        );
    }
    Ok(ComposeInfo {
        compose: compose.identity.clone(),
        release: release_info(&compose.config),
        base_product: base_product_info(&compose.config),
        variants,
    })
}

/// INI document with sorted sections and keys
#[derive(Debug, Default)]
struct Ini {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Ini {
    fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (i, (name, keys)) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", name));
            for (key, value) in keys {
                out.push_str(&format!("{} = {}\n", key, value));
            }
        }
        out
    }
}

/// Variants whose repositories live in a tree owned by `owner`
fn tree_members<'a>(compose: &'a Compose, owner: &'a Variant, arch: &str) -> Vec<&'a Variant> {
    let mut members = vec![owner];
    for child in &owner.children {
        let child = compose.variants.get(*child);
        if child.kind == VariantType::Addon && child.has_arch(arch) && !child.is_empty {
            members.push(child);
        }
    }
    members
}

fn relative_to(tree: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(tree).ok()?;
    let rel = rel.to_string_lossy().into_owned();
    Some(if rel.is_empty() { ".".to_string() } else { rel })
}

fn treeinfo(compose: &Compose, owner: &Variant, arch: &str, tree: &Path, timestamp: i64) -> Result<String> {
    let config = &compose.config;
    let mut ini = Ini::default();
    ini.set("header", "type", "productmd.treeinfo");
    ini.set("header", "version", "1.2");

    let release = release_info(config);
    ini.set("release", "name", release.name);
    ini.set("release", "short", release.short);
    ini.set("release", "version", release.version);
    ini.set("release", "type", release.release_type);
    ini.set("release", "is_layered", release.is_layered.to_string());
    if let Some(base) = base_product_info(config) {
        ini.set("base_product", "name", base.name);
        ini.set("base_product", "short", base.short);
        ini.set("base_product", "version", base.version);
        ini.set("base_product", "type", base.product_type);
    }

    let members = tree_members(compose, owner, arch);
    ini.set("tree", "arch", arch);
    ini.set("tree", "platforms", arch);
    ini.set("tree", "build_timestamp", timestamp.to_string());
    ini.set(
        "tree",
        "variants",
        members.iter().map(|v| v.uid.as_str()).collect::<Vec<_>>().join(","),
    );

    let mut checksums = BTreeMap::new();
    for variant in &members {
        let section = format!("variant-{}", variant.uid);
        let repo = compose.paths.repository(variant, arch, Category::Rpm);
        let repo_rel = relative_to(tree, &repo).unwrap_or_else(|| ".".to_string());
        let packages = if repo_rel == "." {
            "Packages".to_string()
        } else {
            format!("{}/Packages", repo_rel)
        };
        ini.set(&section, "id", variant.local_id.as_str());
        ini.set(&section, "uid", variant.uid.as_str());
        ini.set(&section, "name", variant.name.as_str());
        ini.set(&section, "type", variant.kind.as_str());
        ini.set(&section, "repository", repo_rel.as_str());
        ini.set(&section, "packages", packages);
        if let Some(parent) = variant.parent.map(|p| compose.variants.get(p)) {
            ini.set(&section, "parent", parent.uid.as_str());
        }

        let repomd = repo.join("repodata").join("repomd.xml");
        if repomd.is_file()
            && let Some(rel) = relative_to(tree, &repomd)
        {
            let sums = file_checksums(&repomd, &["sha256".to_string()])?;
            if let Some(sum) = sums.get("sha256") {
                checksums.insert(rel, format!("sha256:{}", sum));
            }
        }
    }

    let owner_uid = owner.uid.as_str();
    let images = compose.images()?;
    let compose_dir = compose.paths.compose_dir();
    for (variant, image) in images.iter() {
        if variant != owner_uid || image.arch != arch {
            continue;
        }
        let path = compose_dir.join(&image.path);
        let Some(rel) = relative_to(tree, &path) else {
            continue;
        };
        ini.set(&format!("images-{}", arch), &image.image_type, rel.as_str());
        if let Some(sum) = image.checksums.get("sha256") {
            checksums.insert(rel, format!("sha256:{}", sum));
        }
    }
    for (path, sum) in checksums {
        ini.set("checksums", &path, sum);
    }
    Ok(ini.render())
}

fn discinfo(config: &Config, arch: &str, timestamp: i64) -> String {
    format!(
        "{}.0\n{} {}\n{}\nALL\n",
        timestamp, config.release_name, config.release_version, arch
    )
}

fn media_repo(config: &Config, timestamp: i64) -> String {
    format!(
        "[InstallMedia]\nname={} {}\nmediaid={}.0\nmetadata_expire=-1\ngpgcheck=0\ncost=500\n",
        config.release_name, config.release_version, timestamp
    )
}

/// Write `.treeinfo`, `.discinfo` and `media.repo` into every os tree that
/// exists
pub fn write_tree_metadata(compose: &Compose) -> Result<usize> {
    let timestamp = build_timestamp(&compose.identity)?;
    let arches = compose.arches();
    let mut written = 0;
    for id in compose.variants.ids() {
        let variant = compose.variants.get(id);
        if variant.kind == VariantType::Addon {
            continue;
        }
        for arch in variant.arches.iter().filter(|a| arches.contains(a)) {
            let tree = compose.paths.os_tree(variant, arch);
            if !tree.is_dir() {
                continue;
            }
            fs::write(
                tree.join(".treeinfo"),
                treeinfo(compose, variant, arch, &tree, timestamp)?,
            )?;
            fs::write(tree.join(".discinfo"), discinfo(&compose.config, arch, timestamp))?;
            fs::write(tree.join("media.repo"), media_repo(&compose.config, timestamp))?;
            debug!("Wrote tree metadata into {}", tree.display());
            written += 1;
        }
    }
    Ok(written)
}

/// Emit all compose metadata
pub fn write_compose_metadata(compose: &Compose) -> Result<()> {
    let trees = write_tree_metadata(compose)?;
    let info = compose_info(compose)?;
    save(
        &compose.paths.metadata_dir().join(COMPOSEINFO_FILE),
        "productmd.composeinfo",
        &info,
    )?;
    info!("Wrote composeinfo.json and metadata for {} trees", trees);
    Ok(())
}
