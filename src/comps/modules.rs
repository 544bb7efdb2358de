// src/comps/modules.rs

//! Module defaults and per-variant module metadata

use crate::error::{Error, Result};
use crate::pkgset::ModuleBuild;
use crate::pkgset::koji::resolve_modules;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct DefaultsDocument {
    version: u32,
    data: DefaultsData,
}

#[derive(Debug, Deserialize)]
struct DefaultsData {
    module: String,
    #[serde(default)]
    stream: Option<String>,
}

/// Default stream of every module that has one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDefaults {
    streams: BTreeMap<String, String>,
}

impl ModuleDefaults {
    /// Read every `*.yaml` file of a directory
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let pattern = dir.join("*.yaml");
        let pattern = pattern.to_string_lossy();
        let mut files: Vec<_> = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("Bad module defaults path {}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok())
            .collect();
        if files.is_empty() && !dir.is_dir() {
            return Err(Error::InputNotFound(format!(
                "Module defaults directory {} does not exist",
                dir.display()
            )));
        }
        files.sort();

        let mut defaults = Self::default();
        for file in files {
            let content = std::fs::read_to_string(&file)?;
            defaults.add_yaml(&content).map_err(|e| {
                Error::ParseError(format!("{}: {}", file.display(), e))
            })?;
        }
        debug!("Loaded {} module defaults", defaults.streams.len());
        Ok(defaults)
    }

    /// Add every `modulemd-defaults` document of a YAML stream
    pub fn add_yaml(&mut self, content: &str) -> Result<()> {
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| Error::ParseError(format!("Invalid YAML: {}", e)))?;
            if value.get("document").and_then(|d| d.as_str()) != Some("modulemd-defaults") {
                continue;
            }
            let doc: DefaultsDocument = serde_yaml::from_value(value)
                .map_err(|e| Error::ParseError(format!("Invalid module defaults: {}", e)))?;
            if doc.version != 1 {
                warn!(
                    "Skipping {} defaults of unsupported version {}",
                    doc.data.module, doc.version
                );
                continue;
            }
            if let Some(stream) = doc.data.stream {
                self.streams.insert(doc.data.module, stream);
            }
        }
        Ok(())
    }

    pub fn stream(&self, module: &str) -> Option<&str> {
        self.streams.get(module).map(String::as_str)
    }

    pub fn streams(&self) -> &BTreeMap<String, String> {
        &self.streams
    }
}

/// Module builds enabled for a variant
pub fn variant_modules<'a>(
    requests: &[String],
    available: &'a [ModuleBuild],
    defaults: &ModuleDefaults,
) -> Result<Vec<&'a ModuleBuild>> {
    resolve_modules(requests, available, defaults.streams())
}

/// RPM NEVRAs of enabled modules that belong on a tree arch
pub fn module_pins(modules: &[&ModuleBuild], tree_arch: &str) -> Vec<String> {
    let mut pins: Vec<String> = modules
        .iter()
        .flat_map(|m| m.rpms.iter())
        .filter(|nevra| {
            crate::packages::Nevra::parse(nevra)
                .map(|n| !crate::arch::is_source(&n.arch) && crate::arch::is_compatible(tree_arch, &n.arch))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    pins.sort();
    pins.dedup();
    pins
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULTS: &str = r#"---
document: modulemd-defaults
version: 1
data:
  module: nodejs
  stream: "12"
  profiles:
    "12": [default]
---
document: modulemd-defaults
version: 1
data:
  module: nostream
---
document: modulemd
version: 2
data:
  name: ignored
"#;

    #[test]
    fn test_defaults_parse() {
        let mut defaults = ModuleDefaults::default();
        defaults.add_yaml(DEFAULTS).unwrap();
        assert_eq!(defaults.stream("nodejs"), Some("12"));
        assert_eq!(defaults.stream("nostream"), None);
        assert_eq!(defaults.streams().len(), 1);
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nodejs.yaml"), DEFAULTS).unwrap();
        let defaults = ModuleDefaults::load_dir(dir.path()).unwrap();
        assert_eq!(defaults.stream("nodejs"), Some("12"));

        assert!(matches!(
            ModuleDefaults::load_dir(&dir.path().join("missing")),
            Err(Error::InputNotFound(_))
        ));
    }

    #[test]
    fn test_module_pins_follow_arch() {
        let module = ModuleBuild {
            name: "nodejs".to_string(),
            stream: "12".to_string(),
            version: 1,
            context: "abc".to_string(),
            koji_tag: "module-nodejs".to_string(),
            modulemd: String::new(),
            rpms: vec![
                "nodejs-1:12.1-1.x86_64".to_string(),
                "nodejs-1:12.1-1.aarch64".to_string(),
                "nodejs-1:12.1-1.src".to_string(),
                "nodejs-docs-1:12.1-1.noarch".to_string(),
            ],
        };
        assert_eq!(
            module_pins(&[&module], "x86_64"),
            vec!["nodejs-1:12.1-1.x86_64", "nodejs-docs-1:12.1-1.noarch"]
        );
    }
}
