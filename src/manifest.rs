// src/manifest.rs

//! Compose manifests: `rpms.json`, `modules.json`, `image-manifest.json`
//! and `osbs.json`
//!
//! Every document is a `header` plus a `payload` carrying the compose
//! identity. Maps are `BTreeMap`s so the written files are byte-stable.

use crate::compose::ComposeIdentity;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::debug;

pub const RPMS_FILE: &str = "rpms.json";
pub const MODULES_FILE: &str = "modules.json";
pub const IMAGES_FILE: &str = "image-manifest.json";
pub const OSBS_FILE: &str = "osbs.json";

/// Write pretty JSON with a trailing newline, creating parent directories
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    fs::write(path, content)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e)))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ParseError(format!("Invalid JSON in {}: {}", path.display(), e)))
}

/// Hex digests of a file for each of `algorithms` (`sha256`, `sha512`),
/// computed in one pass
pub fn file_checksums(path: &Path, algorithms: &[String]) -> Result<BTreeMap<String, String>> {
    if let Some(bad) = algorithms.iter().find(|a| !matches!(a.as_str(), "sha256" | "sha512")) {
        return Err(Error::Config(format!("Unsupported checksum {}", bad)));
    }
    let wants = |name: &str| algorithms.iter().any(|a| a == name);
    let mut sha256 = wants("sha256").then(Sha256::new);
    let mut sha512 = wants("sha512").then(Sha512::new);

    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {} for checksum: {}", path.display(), e)))?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Some(h) = sha256.as_mut() {
            h.update(&buf[..n]);
        }
        if let Some(h) = sha512.as_mut() {
            h.update(&buf[..n]);
        }
    }

    let mut sums = BTreeMap::new();
    if let Some(h) = sha256 {
        sums.insert("sha256".to_string(), format!("{:x}", h.finalize()));
    }
    if let Some(h) = sha512 {
        sums.insert("sha512".to_string(), format!("{:x}", h.finalize()));
    }
    Ok(sums)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Document<P> {
    header: Header,
    payload: P,
}

/// Write `payload` under a `header` naming its document type
pub(crate) fn save<P: Serialize>(path: &Path, kind: &str, payload: &P) -> Result<()> {
    let doc = Document {
        header: Header {
            kind: kind.to_string(),
            version: "1.2".to_string(),
        },
        payload,
    };
    write_json(path, &doc)
}

pub(crate) fn load<P: DeserializeOwned>(path: &Path, kind: &str) -> Result<P> {
    let doc: Document<P> = read_json(path)?;
    if doc.header.kind != kind {
        return Err(Error::ParseError(format!(
            "{} is a {} document, expected {}",
            path.display(),
            doc.header.kind,
            kind
        )));
    }
    Ok(doc.payload)
}

fn is_false(value: &bool) -> bool {
    !value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpmCategory {
    Binary,
    Source,
    Debug,
}

impl From<crate::gather::Category> for RpmCategory {
    fn from(category: crate::gather::Category) -> Self {
        match category {
            crate::gather::Category::Rpm => RpmCategory::Binary,
            crate::gather::Category::Srpm => RpmCategory::Source,
            crate::gather::Category::Debuginfo => RpmCategory::Debug,
        }
    }
}

/// One package in `rpms.json`; lookaside packages have no path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub sigkey: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub lookaside: bool,
}

/// variant → arch → category → source NEVRA → NEVRA → entry
pub type RpmTree = BTreeMap<
    String,
    BTreeMap<String, BTreeMap<RpmCategory, BTreeMap<String, BTreeMap<String, RpmEntry>>>>,
>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmManifest {
    pub compose: ComposeIdentity,
    pub rpms: RpmTree,
}

impl RpmManifest {
    pub fn new(compose: ComposeIdentity) -> Self {
        Self {
            compose,
            rpms: BTreeMap::new(),
        }
    }

    pub fn add(
        &mut self,
        variant: &str,
        arch: &str,
        category: RpmCategory,
        srpm_nevra: &str,
        nevra: &str,
        entry: RpmEntry,
    ) {
        self.rpms
            .entry(variant.to_string())
            .or_default()
            .entry(arch.to_string())
            .or_default()
            .entry(category)
            .or_default()
            .entry(srpm_nevra.to_string())
            .or_default()
            .insert(nevra.to_string(), entry);
    }

    pub fn merge(&mut self, other: RpmManifest) {
        for (variant, arches) in other.rpms {
            for (arch, categories) in arches {
                for (category, sources) in categories {
                    for (srpm, packages) in sources {
                        for (nevra, entry) in packages {
                            self.add(&variant, &arch, category, &srpm, &nevra, entry);
                        }
                    }
                }
            }
        }
    }

    /// Entries of one (variant, arch) as (category, source NEVRA, NEVRA, entry)
    pub fn entries(
        &self,
        variant: &str,
        arch: &str,
    ) -> Vec<(RpmCategory, &str, &str, &RpmEntry)> {
        let Some(categories) = self.rpms.get(variant).and_then(|a| a.get(arch)) else {
            return Vec::new();
        };
        categories
            .iter()
            .flat_map(|(category, sources)| {
                sources.iter().flat_map(move |(srpm, packages)| {
                    packages
                        .iter()
                        .map(move |(nevra, entry)| (*category, srpm.as_str(), nevra.as_str(), entry))
                })
            })
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        save(path, "productmd.rpms", self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load(path, "productmd.rpms")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub koji_tag: String,
    /// Relative to the compose top directory
    pub modulemd_path: String,
    pub rpms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulesManifest {
    pub compose: ComposeIdentity,
    /// variant → arch → NSVC → entry
    pub modules: BTreeMap<String, BTreeMap<String, BTreeMap<String, ModuleEntry>>>,
}

impl ModulesManifest {
    pub fn new(compose: ComposeIdentity) -> Self {
        Self {
            compose,
            modules: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, variant: &str, arch: &str, nsvc: &str, entry: ModuleEntry) {
        self.modules
            .entry(variant.to_string())
            .or_default()
            .entry(arch.to_string())
            .or_default()
            .insert(nsvc.to_string(), entry);
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        save(path, "productmd.modules", self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load(path, "productmd.modules")
    }
}

/// A produced image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Relative to `compose/`
    pub path: String,
    #[serde(rename = "type")]
    pub image_type: String,
    pub format: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subvariant: Option<String>,
    pub size: u64,
    pub bootable: bool,
    /// algorithm → hex digest
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

/// A deliverable that failed but was allowed to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailedDeliverable {
    pub variant: String,
    pub arch: String,
    pub deliverable: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub compose: ComposeIdentity,
    /// variant → arch → images
    pub images: BTreeMap<String, BTreeMap<String, Vec<Image>>>,
    #[serde(default)]
    pub failed_deliverables: Vec<FailedDeliverable>,
}

impl ImageManifest {
    pub fn new(compose: ComposeIdentity) -> Self {
        Self {
            compose,
            images: BTreeMap::new(),
            failed_deliverables: Vec::new(),
        }
    }

    pub fn add(&mut self, variant: &str, image: Image) {
        let images = self
            .images
            .entry(variant.to_string())
            .or_default()
            .entry(image.arch.clone())
            .or_default();
        images.retain(|i| i.path != image.path);
        images.push(image);
        images.sort_by(|a, b| a.path.cmp(&b.path));
    }

    pub fn add_failure(&mut self, failure: FailedDeliverable) {
        if !self.failed_deliverables.contains(&failure) {
            self.failed_deliverables.push(failure);
            self.failed_deliverables.sort();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Image)> {
        self.images
            .iter()
            .flat_map(|(variant, arches)| arches.values().flatten().map(move |i| (variant.as_str(), i)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Image> {
        self.images.values_mut().flat_map(|a| a.values_mut().flatten())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        save(path, "productmd.images", self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load(path, "productmd.images")
    }
}

/// One container build recorded in `osbs.json`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OsbsBuild {
    pub variant: String,
    pub arch: String,
    pub output: String,
}

pub fn write_osbs(path: &Path, builds: &[OsbsBuild]) -> Result<()> {
    let mut by_variant: BTreeMap<&str, BTreeMap<&str, Vec<&str>>> = BTreeMap::new();
    for build in builds {
        by_variant
            .entry(&build.variant)
            .or_default()
            .entry(&build.arch)
            .or_default()
            .push(&build.output);
    }
    for arches in by_variant.values_mut() {
        for outputs in arches.values_mut() {
            outputs.sort();
        }
    }
    write_json(path, &by_variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> ComposeIdentity {
        ComposeIdentity {
            id: "DP-1.0-20240101.0".to_string(),
            compose_type: "production".to_string(),
            date: "20240101".to_string(),
            respin: 0,
            label: None,
        }
    }

    #[test]
    fn test_rpm_manifest_layout() {
        let mut manifest = RpmManifest::new(identity());
        manifest.add(
            "Server",
            "x86_64",
            RpmCategory::Binary,
            "dummy-bash-0:4.2.37-6.src",
            "dummy-bash-0:4.2.37-6.x86_64",
            RpmEntry {
                path: Some("Server/x86_64/os/Packages/d/dummy-bash-4.2.37-6.x86_64.rpm".to_string()),
                sigkey: None,
                lookaside: false,
            },
        );
        manifest.add(
            "Server",
            "x86_64",
            RpmCategory::Binary,
            "dummy-glibc-0:2.14-5.src",
            "dummy-glibc-0:2.14-5.x86_64",
            RpmEntry {
                path: None,
                sigkey: Some("deadbeef".to_string()),
                lookaside: true,
            },
        );

        let value = serde_json::to_value(&manifest).unwrap();
        let entry = &value["rpms"]["Server"]["x86_64"]["binary"]["dummy-glibc-0:2.14-5.src"]
            ["dummy-glibc-0:2.14-5.x86_64"];
        assert!(entry.get("path").is_none());
        assert_eq!(entry["lookaside"], true);
        assert_eq!(manifest.entries("Server", "x86_64").len(), 2);
        assert!(manifest.entries("Client", "x86_64").is_empty());
    }

    #[test]
    fn test_manifest_header_is_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata").join(RPMS_FILE);
        RpmManifest::new(identity()).write(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("}\n"));
        assert!(content.contains("\"productmd.rpms\""));
        assert_eq!(RpmManifest::load(&path).unwrap().compose, identity());
        assert!(ModulesManifest::load(&path).is_err());
    }

    #[test]
    fn test_file_checksums() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello");
        fs::write(&path, "hello\n").unwrap();
        let sums = file_checksums(&path, &["sha256".to_string()]).unwrap();
        assert_eq!(
            sums["sha256"],
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
        assert!(!sums.contains_key("sha512"));
        assert!(file_checksums(&path, &["md5".to_string()]).is_err());
    }

    #[test]
    fn test_image_manifest_replaces_same_path() {
        let mut manifest = ImageManifest::new(identity());
        let image = Image {
            path: "Server/x86_64/iso/boot.iso".to_string(),
            image_type: "boot".to_string(),
            format: "iso".to_string(),
            arch: "x86_64".to_string(),
            subvariant: None,
            size: 1,
            bootable: true,
            checksums: BTreeMap::new(),
        };
        manifest.add("Server", image.clone());
        manifest.add("Server", Image { size: 2, ..image });
        let images: Vec<_> = manifest.iter().collect();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].1.size, 2);
    }
}
