// src/phases/extra_files.rs

//! extra_files phase
//!
//! Copies files named by SCM specs into the os tree of every matching
//! (variant, arch) and describes them in `extra_files.json` on the tree root.

use super::{Phase, PhaseBody};
use crate::compose::Compose;
use crate::config::{ExtraFile, Variant, VariantType, matching};
use crate::error::{Error, Result};
use crate::manifest::{file_checksums, write_json};
use crate::scm::ScmSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};
use tracing::{debug, info};

pub const EXTRA_FILES_FILE: &str = "extra_files.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFileEntry {
    /// Relative to the tree root
    pub file: String,
    pub size: u64,
    pub checksums: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFilesMetadata {
    pub version: String,
    pub data: Vec<ExtraFileEntry>,
}

pub struct ExtraFilesPhase;

impl PhaseBody for ExtraFilesPhase {
    fn validate(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        for rule in &compose.config.extra_files {
            ScmSpec::parse(&rule.value.scm)?;
            let escapes = Path::new(&rule.value.target)
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
            if escapes {
                return Err(Error::Config(format!(
                    "extra_files target {} must stay inside the tree",
                    rule.value.target
                )));
            }
        }
        Ok(())
    }

    fn run(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        let arches = compose.arches();
        for id in compose.variants.ids() {
            let variant = compose.variants.get(id);
            // Addons share their parent's tree
            if variant.is_empty || variant.kind == VariantType::Addon {
                continue;
            }
            for arch in variant.arches.iter().filter(|a| arches.contains(a)) {
                compose.cancel.check()?;
                let files = matching(&compose.config.extra_files, &variant.uid, arch);
                if !files.is_empty() {
                    copy_into_tree(compose, variant, arch, &files)?;
                }
            }
        }
        Ok(())
    }
}

fn copy_into_tree(compose: &Compose, variant: &Variant, arch: &str, files: &[&ExtraFile]) -> Result<()> {
    let tree = compose.paths.os_tree(variant, arch);
    let mut data = Vec::new();
    for extra in files {
        let spec = ScmSpec::parse(&extra.scm)?;
        let dest_dir = tree.join(&extra.target);
        fs::create_dir_all(&dest_dir)?;
        let path = compose.scm.get_file(&spec, &dest_dir)?;
        let meta = fs::metadata(&path)?;
        let file = path
            .strip_prefix(&tree)
            .map_err(|_| Error::IoError(format!("{} landed outside {}", path.display(), tree.display())))?
            .to_string_lossy()
            .into_owned();
        debug!("{}.{}: added {}", variant.uid, arch, file);
        data.push(ExtraFileEntry {
            file,
            size: meta.len(),
            checksums: file_checksums(&path, &compose.config.media_checksums)?,
        });
    }
    data.sort_by(|a, b| a.file.cmp(&b.file));
    data.dedup_by(|a, b| a.file == b.file);

    info!("{}.{}: {} extra files", variant.uid, arch, data.len());
    write_json(
        &tree.join(EXTRA_FILES_FILE),
        &ExtraFilesMetadata {
            version: "1.0".to_string(),
            data,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::test_compose;
    use crate::config::Rule;
    use crate::manifest::read_json;

    fn extra(scm: &str, target: &str) -> Rule<ExtraFile> {
        Rule {
            variant: "Server.*".to_string(),
            arch: "*".to_string(),
            value: ExtraFile {
                scm: scm.to_string(),
                target: target.to_string(),
            },
        }
    }

    #[test]
    fn test_copies_files_and_writes_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("GPL"), "license\n").unwrap();
        fs::write(dir.path().join("EULA"), "eula\n").unwrap();
        let mut compose = test_compose(dir.path());
        compose.config.extra_files = vec![extra("file:GPL", ""), extra("file:EULA", "legal")];

        let phase = Phase::new("extra_files", Box::new(ExtraFilesPhase));
        phase.validate(&compose).unwrap();
        phase.run(&compose).unwrap();

        let tree = compose.topdir().join("compose/Server/x86_64/os");
        assert_eq!(fs::read_to_string(tree.join("GPL")).unwrap(), "license\n");
        assert!(tree.join("legal/EULA").is_file());
        assert!(!tree.join("addons").exists());

        let meta: ExtraFilesMetadata = read_json(&tree.join(EXTRA_FILES_FILE)).unwrap();
        let files: Vec<&str> = meta.data.iter().map(|e| e.file.as_str()).collect();
        assert_eq!(files, vec!["GPL", "legal/EULA"]);
        assert_eq!(meta.data[0].size, 8);
        assert!(meta.data[0].checksums.contains_key("sha256"));
    }

    #[test]
    fn test_rejects_escaping_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut compose = test_compose(dir.path());
        compose.config.extra_files = vec![extra("file:GPL", "../outside")];
        let phase = Phase::new("extra_files", Box::new(ExtraFilesPhase));
        assert!(matches!(phase.validate(&compose), Err(Error::Config(_))));
    }
}
