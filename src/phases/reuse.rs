// src/phases/reuse.rs

//! Reuse of an older compose
//!
//! A phase that can be reused writes a record of its exact inputs. On the
//! next run, an old compose whose record matches field for field lets the
//! phase take the old outputs instead of doing the work again.

use crate::compose::{Compose, compose_prefix};
use crate::config::LinkType;
use crate::error::{Error, Result};
use crate::linker::Linker;
use crate::manifest::{read_json, write_json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReuseRecord {
    pub phase: String,
    pub inputs: BTreeMap<String, Value>,
}

impl ReuseRecord {
    pub fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            inputs: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.inputs.insert(key.to_string(), value);
        self
    }

    pub fn with_all(mut self, values: BTreeMap<String, Value>) -> Self {
        self.inputs.extend(values);
        self
    }

    pub fn save(&self, compose: &Compose) -> Result<()> {
        write_json(&compose.paths.reuse_record(&self.phase), self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// `ReuseInvalidated` naming every input that differs
    pub fn check_against(&self, old: &ReuseRecord) -> Result<()> {
        let mut keys: Vec<&String> = self.inputs.keys().chain(old.inputs.keys()).collect();
        keys.sort();
        keys.dedup();
        let changed: Vec<&str> = keys
            .into_iter()
            .filter(|k| self.inputs.get(*k) != old.inputs.get(*k))
            .map(String::as_str)
            .collect();
        if changed.is_empty() {
            Ok(())
        } else {
            Err(Error::ReuseInvalidated(format!(
                "{} inputs changed: {}",
                self.phase,
                changed.join(", ")
            )))
        }
    }
}

/// Top directories of the old composes given on the command line. A path
/// may be a compose itself or a target directory with a `latest-*` link.
fn old_topdirs(compose: &Compose) -> Vec<PathBuf> {
    compose
        .options
        .old_composes
        .iter()
        .filter_map(|old| {
            if old.join("STATUS").is_file() {
                return Some(old.clone());
            }
            let latest = old.join(format!("latest-{}", compose_prefix(&compose.config)));
            fs::canonicalize(latest).ok()
        })
        .filter(|dir| dir != compose.topdir())
        .collect()
}

/// Old compose whose record for this phase matches `current`
pub fn find_reusable(compose: &Compose, current: &ReuseRecord) -> Option<PathBuf> {
    for old in old_topdirs(compose) {
        let status = fs::read_to_string(old.join("STATUS")).unwrap_or_default();
        if !matches!(status.trim(), "FINISHED" | "FINISHED_INCOMPLETE") {
            debug!("Not reusing {} with status {}", old.display(), status.trim());
            continue;
        }
        let path = old
            .join("work")
            .join("global")
            .join("reuse")
            .join(format!("{}.json", current.phase));
        let record = match ReuseRecord::load(&path) {
            Ok(record) => record,
            Err(e) => {
                debug!("No reuse record in {}: {}", old.display(), e);
                continue;
            }
        };
        match current.check_against(&record) {
            Ok(()) => {
                info!("Reusing {} results from {}", current.phase, old.display());
                return Some(old);
            }
            Err(e) => info!("{}", e),
        }
    }
    None
}

/// Hardlink (or copy) a directory tree from an old compose
pub fn link_tree(src: &Path, dst: &Path) -> Result<()> {
    let linker = Linker::new(LinkType::HardlinkOrCopy);
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(format!("Cannot walk {}: {}", src.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(format!("{}: {}", entry.path().display(), e)))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            linker.link(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::test_compose;
    use serde_json::json;

    #[test]
    fn test_changed_inputs_invalidate() {
        let old = ReuseRecord::new("gather")
            .with("greedy_method", "none")
            .with("pkgset", "abc");
        let same = old.clone();
        assert!(same.check_against(&old).is_ok());

        let changed = ReuseRecord::new("gather")
            .with("greedy_method", "all")
            .with("pkgset", "abc");
        let err = changed.check_against(&old).unwrap_err();
        assert!(matches!(err, Error::ReuseInvalidated(ref m) if m.contains("greedy_method")));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_find_reusable() {
        let dir = tempfile::TempDir::new().unwrap();
        let old = test_compose(dir.path());
        let record = ReuseRecord::new("gather").with("inputs", json!({"a": 1}));
        record.save(&old).unwrap();
        old.finish(false).unwrap();

        let mut new = test_compose(dir.path());
        new.options.old_composes = vec![dir.path().to_path_buf()];
        let found = find_reusable(&new, &record).unwrap();
        assert_eq!(found, fs::canonicalize(old.topdir()).unwrap());

        let other = ReuseRecord::new("gather").with("inputs", json!({"a": 2}));
        assert!(find_reusable(&new, &other).is_none());
    }

    #[test]
    fn test_link_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("old/sub/deeper")).unwrap();
        fs::create_dir_all(dir.path().join("old/empty")).unwrap();
        fs::write(dir.path().join("old/sub/file"), "x").unwrap();
        fs::write(dir.path().join("old/sub/deeper/leaf"), "y").unwrap();
        link_tree(&dir.path().join("old"), &dir.path().join("new")).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("new/sub/file")).unwrap(), "x");
        assert_eq!(fs::read_to_string(dir.path().join("new/sub/deeper/leaf")).unwrap(), "y");
        assert!(dir.path().join("new/empty").is_dir());
        link_tree(&dir.path().join("old"), &dir.path().join("new")).unwrap();
    }
}
