// src/phases/init.rs

//! init phase: variant arch checks, comps files and module defaults

use super::{Phase, PhaseBody};
use crate::compose::Compose;
use crate::comps::Comps;
use crate::comps::modules::ModuleDefaults;
use crate::config::{Variant, VariantId};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fs;
use tracing::{debug, info};

pub struct InitPhase;

impl PhaseBody for InitPhase {
    fn validate(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        compose.variants.validate_arches(&compose.arches())
    }

    fn run(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        let comps = match &compose.config.comps_file {
            Some(path) => {
                let comps = Comps::load(path)?;
                comps.write(&compose.paths.global_comps())?;
                write_variant_comps(compose, &comps)?;
                Some(comps)
            }
            None => {
                debug!("No comps file configured");
                None
            }
        };
        let _ = compose.comps.set(comps);

        let defaults = copy_module_defaults(compose)?;
        let _ = compose.module_defaults.set(defaults);
        Ok(())
    }
}

/// Groups a variant may reference without listing them: its parent's and
/// those of variants it uses as lookaside
fn lookaside_groups(compose: &Compose, id: VariantId) -> BTreeSet<String> {
    let tree = &compose.variants;
    let variant = tree.get(id);
    let mut sources: Vec<&Variant> = tree.parent(id).into_iter().collect();
    for (dest, source) in &compose.config.variant_as_lookaside {
        if *dest == variant.uid
            && let Some(source) = tree.by_uid(source)
        {
            sources.push(tree.get(source));
        }
    }
    sources
        .into_iter()
        .flat_map(|v| v.groups.iter().map(|g| g.name.clone()))
        .collect()
}

fn write_variant_comps(compose: &Compose, comps: &Comps) -> Result<()> {
    for arch in compose.arches() {
        let arch_comps = comps.for_arch(&arch);
        for id in compose.variants.ids() {
            let variant = compose.variants.get(id);
            if !variant.has_arch(&arch) || variant.is_empty {
                continue;
            }
            let filtered = arch_comps.for_variant(
                variant,
                &lookaside_groups(compose, id),
                compose.config.comps_filter_environments,
            )?;
            let path = compose.paths.variant_comps(variant, &arch);
            filtered.write(&path)?;
            debug!("Wrote {}", path.display());
        }
    }
    Ok(())
}

/// Copy the module defaults into the compose and read them from there
fn copy_module_defaults(compose: &Compose) -> Result<ModuleDefaults> {
    let Some(source) = &compose.config.module_defaults_dir else {
        return Ok(ModuleDefaults::default());
    };
    let target = compose.paths.module_defaults_dir();
    fs::create_dir_all(&target)?;
    let entries = fs::read_dir(source).map_err(|e| {
        Error::InputNotFound(format!(
            "Module defaults directory {}: {}",
            source.display(),
            e
        ))
    })?;
    let mut copied = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "yaml") && path.is_file() {
            if let Some(name) = path.file_name() {
                fs::copy(&path, target.join(name))?;
                copied += 1;
            }
        }
    }
    info!("Copied {} module defaults files", copied);
    ModuleDefaults::load_dir(&target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{ComposeOptions, tests::CONFIG};
    use crate::config::{Config, VariantTree};
    use chrono::NaiveDate;

    const COMPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<comps>
  <group>
    <id>core</id>
    <name>Core</name>
    <packagelist>
      <packagereq type="mandatory">dummy-bash</packagereq>
    </packagelist>
  </group>
  <group>
    <id>ha</id>
    <name>High Availability</name>
    <packagelist>
      <packagereq type="mandatory">dummy-pacemaker</packagereq>
    </packagelist>
  </group>
  <group>
    <id>unused</id>
    <name>Unused</name>
    <packagelist/>
  </group>
</comps>
"#;

    const VARIANTS: &str = r#"<variants>
  <variant id="Server" name="Server" type="variant">
    <arches><arch>x86_64</arch></arches>
    <groups><group>core</group></groups>
    <variants>
      <variant id="HA" name="High Availability" type="addon">
        <groups><group>ha</group></groups>
      </variant>
    </variants>
  </variant>
</variants>"#;

    const DEFAULTS: &str = "---\ndocument: modulemd-defaults\nversion: 1\ndata:\n  module: nodejs\n  stream: \"12\"\n";

    #[test]
    fn test_init_writes_comps_and_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("comps.xml"), COMPS).unwrap();
        fs::create_dir_all(dir.path().join("defaults")).unwrap();
        fs::write(dir.path().join("defaults/nodejs.yaml"), DEFAULTS).unwrap();

        let text = format!(
            "comps_file = \"comps.xml\"\nmodule_defaults_dir = \"defaults\"\n{}",
            CONFIG
        );
        let config = Config::parse(&text, dir.path()).unwrap();
        let variants = VariantTree::parse(VARIANTS).unwrap();
        let compose = Compose::create(
            config,
            variants,
            ComposeOptions {
                target_dir: dir.path().join("out"),
                compose_date: NaiveDate::from_ymd_opt(2024, 1, 1),
                ..Default::default()
            },
        )
        .unwrap();

        let phase = Phase::new("init", Box::new(InitPhase));
        phase.validate(&compose).unwrap();
        phase.run(&compose).unwrap();

        assert!(compose.paths.global_comps().is_file());
        let server = compose.variants.get(compose.variants.by_uid("Server").unwrap());
        let server_comps = Comps::load(&compose.paths.variant_comps(server, "x86_64")).unwrap();
        assert!(server_comps.group("core").is_some());
        assert!(server_comps.group("unused").is_none());

        let ha = compose.variants.get(compose.variants.by_uid("Server-HA").unwrap());
        let ha_comps = Comps::load(&compose.paths.variant_comps(ha, "x86_64")).unwrap();
        assert!(ha_comps.group("ha").is_some());
        assert!(ha_comps.group("core").is_some());

        assert!(compose.comps().is_some());
        assert_eq!(
            compose.module_defaults.get().unwrap().stream("nodejs"),
            Some("12")
        );
    }

    #[test]
    fn test_init_without_comps() {
        let dir = tempfile::TempDir::new().unwrap();
        let compose = crate::compose::tests::test_compose(dir.path());
        Phase::new("init", Box::new(InitPhase)).run(&compose).unwrap();
        assert!(compose.comps().is_none());
        assert!(!compose.paths.global_comps().exists());
    }
}
