// src/phases/images.rs

//! External image phases
//!
//! `productimg`, `buildinstall`, `createiso` and the other image phases all
//! work the same way: each rule of the phase's config block that matches a
//! (variant, arch) is one deliverable. Its command runs through the runroot
//! executor and must leave `output` in the deliverable directory, which is
//! then recorded in the image manifest. Commands may use the placeholders
//! `{arch}`, `{variant}`, `{compose_id}`, `{topdir}`, `{os_tree}`,
//! `{output_dir}` and `{output}`.

use super::failable::run_failable;
use super::pool::WorkPool;
use super::reuse::{ReuseRecord, find_reusable};
use super::{ConfigGuard, ImageDefaults, Phase, PhaseBody};
use crate::compose::Compose;
use crate::config::{ImageSpec, LinkType, Variant, matching};
use crate::error::{Error, Result};
use crate::linker::Linker;
use crate::manifest::{Image, OsbsBuild};
use crate::paths::Role;
use crate::runroot::{RunrootRequest, shell_quote};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Build the phase for one image phase name
pub fn image_phase(name: &str) -> Phase {
    Phase::new(name, Box::new(ImagePhase))
        .guarded(ConfigGuard::new(name))
        .with_image_defaults(image_defaults(name))
}

fn image_defaults(name: &str) -> ImageDefaults {
    let (image_type, format, bootable) = match name {
        "productimg" => ("productimg", "img", false),
        "buildinstall" => ("boot", "iso", true),
        "createiso" => ("dvd", "iso", true),
        "extra_isos" => ("dvd", "iso", false),
        "live_images" | "livemedia" => ("live", "iso", true),
        "image_build" => ("qcow2", "qcow2", false),
        "ostree" => ("ostree", "tar", false),
        "ostree_installer" => ("boot", "iso", true),
        "osbs" => ("container", "docker", false),
        _ => ("image", "raw", false),
    };
    ImageDefaults {
        image_type,
        format,
        bootable,
    }
}

/// Where a phase's deliverables go
fn output_role(name: &str) -> Role {
    match name {
        "createiso" | "extra_isos" | "live_images" | "livemedia" => Role::Iso,
        _ => Role::Images,
    }
}

pub struct ImagePhase;

/// One (variant, arch, rule) deliverable
#[derive(Debug, Clone)]
struct ImageTask {
    uid: String,
    arch: String,
    index: usize,
    spec: ImageSpec,
    output_dir: PathBuf,
}

impl ImageTask {
    fn label(&self) -> String {
        format!("{}.{}.{}", self.uid, self.arch, self.index)
    }

    fn output(&self) -> PathBuf {
        self.output_dir.join(&self.spec.output)
    }
}

impl PhaseBody for ImagePhase {
    fn skip(&self, phase: &Phase, compose: &Compose) -> Option<String> {
        if phase.name == "buildinstall" && !compose.config.bootable {
            return Some("not bootable".to_string());
        }
        None
    }

    fn validate(&self, phase: &Phase, compose: &Compose) -> Result<()> {
        let rules = compose.config.image_phases.get(&phase.name);
        for rule in rules.into_iter().flatten() {
            if rule.value.command.trim().is_empty() || rule.value.output.trim().is_empty() {
                return Err(Error::Config(format!(
                    "{}: every rule needs a command and an output",
                    phase.name
                )));
            }
            if Path::new(&rule.value.output).is_absolute() {
                return Err(Error::Config(format!(
                    "{}: output {} must be relative",
                    phase.name, rule.value.output
                )));
            }
        }
        Ok(())
    }

    fn run(&self, phase: &Phase, compose: &Compose) -> Result<()> {
        let tasks = collect_tasks(phase, compose);
        if tasks.is_empty() {
            phase.logger.warn("no variant matches any rule");
            return Ok(());
        }

        let record = reuse_record(phase, compose, &tasks)?;
        if let Some(record) = &record
            && let Some(old) = find_reusable(compose, record)
        {
            match reuse_outputs(phase, compose, &tasks, &old) {
                Ok(()) => return record.save(compose),
                Err(e) => info!("Cannot reuse {} outputs: {}", phase.name, e),
            }
        }

        let pool = WorkPool::new(&phase.name, 0, compose.cancel.clone());
        let items = tasks.iter().map(|t| (t.label(), t)).collect();
        pool.run(items, |task| {
            run_failable(compose, &task.uid, &task.arch, &phase.name, || {
                build(phase, compose, task)
            })?;
            Ok(())
        })?;

        if let Some(record) = record {
            record.save(compose)?;
        }
        Ok(())
    }
}

fn collect_tasks(phase: &Phase, compose: &Compose) -> Vec<ImageTask> {
    let Some(rules) = compose.config.image_phases.get(&phase.name) else {
        return Vec::new();
    };
    let arches = compose.arches();
    let mut tasks = Vec::new();
    for id in compose.variants.ids() {
        let variant = compose.variants.get(id);
        if variant.is_empty {
            continue;
        }
        for arch in variant.arches.iter().filter(|a| arches.contains(a)) {
            for (index, spec) in matching(rules, &variant.uid, arch).into_iter().enumerate() {
                tasks.push(ImageTask {
                    uid: variant.uid.clone(),
                    arch: arch.clone(),
                    index,
                    spec: spec.clone(),
                    output_dir: compose.paths.for_role(variant, arch, output_role(&phase.name)),
                });
            }
        }
    }
    tasks
}

fn expand(command: &str, compose: &Compose, variant: &Variant, task: &ImageTask) -> String {
    let quoted = |p: &Path| shell_quote(&p.to_string_lossy());
    command
        .replace("{arch}", &task.arch)
        .replace("{variant}", &variant.uid)
        .replace("{compose_id}", &compose.identity.id)
        .replace("{topdir}", &quoted(compose.topdir()))
        .replace("{os_tree}", &quoted(&compose.paths.os_tree(variant, &task.arch)))
        .replace("{output_dir}", &quoted(&task.output_dir))
        .replace("{output}", &shell_quote(&task.spec.output))
}

fn build(phase: &Phase, compose: &Compose, task: &ImageTask) -> Result<()> {
    let id = compose
        .variants
        .by_uid(&task.uid)
        .ok_or_else(|| Error::Config(format!("Unknown variant {}", task.uid)))?;
    let variant = compose.variants.get(id);
    fs::create_dir_all(&task.output_dir)?;

    let request = RunrootRequest {
        command: expand(&task.spec.command, compose, variant, task),
        arch: task.arch.clone(),
        packages: task.spec.packages.clone(),
        mounts: vec![compose.topdir().to_path_buf()],
        weight: compose.config.runroot_weights.get(&phase.name).copied(),
        log_file: compose.paths.log_file(
            Some(&task.arch),
            &format!("{}-{}-{}", phase.name, task.uid, task.index),
        ),
    };
    debug!("{}: {}", task.label(), request.command);
    let output = compose.runroot.run(&request)?;
    if let Some(task_id) = output.task_id {
        info!("{} for {} finished in task {}", phase.name, task.label(), task_id);
    }

    if phase.name == "osbs" {
        return compose.add_osbs_build(OsbsBuild {
            variant: task.uid.clone(),
            arch: task.arch.clone(),
            output: task.spec.output.clone(),
        });
    }
    record_image(phase, compose, task)
}

fn record_image(phase: &Phase, compose: &Compose, task: &ImageTask) -> Result<()> {
    let path = task.output();
    let meta = fs::metadata(&path).map_err(|_| {
        Error::ExternalTool(format!(
            "{} for {} did not produce {}",
            phase.name,
            task.label(),
            path.display()
        ))
    })?;
    let defaults = phase.image_defaults.clone().unwrap_or_else(|| image_defaults(&phase.name));
    let image = Image {
        path: compose.paths.relative(&path)?,
        image_type: task
            .spec
            .image_type
            .clone()
            .unwrap_or_else(|| defaults.image_type.to_string()),
        format: task
            .spec
            .format
            .clone()
            .unwrap_or_else(|| defaults.format.to_string()),
        arch: task.arch.clone(),
        subvariant: Some(task.spec.subvariant.clone().unwrap_or_else(|| task.uid.clone())),
        size: meta.len(),
        bootable: defaults.bootable,
        checksums: BTreeMap::new(),
    };
    info!("{}: recorded {}", phase.name, image.path);
    compose.images()?.add(&task.uid, image);
    Ok(())
}

/// Image outputs depend on the rules and on the packages they were built
/// from. Container builds are never reused.
fn reuse_record(phase: &Phase, compose: &Compose, tasks: &[ImageTask]) -> Result<Option<ReuseRecord>> {
    if phase.name == "osbs" {
        return Ok(None);
    }
    let Some(pkgset) = compose.pkgset.get() else {
        return Ok(None);
    };
    let rules: BTreeMap<String, &ImageSpec> = tasks.iter().map(|t| (t.label(), &t.spec)).collect();
    Ok(Some(
        ReuseRecord::new(&phase.name)
            .with("rules", rules)
            .with("package_set", pkgset.digest())
            .with("bootable", compose.config.bootable),
    ))
}

fn reuse_outputs(phase: &Phase, compose: &Compose, tasks: &[ImageTask], old: &Path) -> Result<()> {
    let linker = Linker::new(LinkType::HardlinkOrCopy);
    let old_compose = old.join("compose");
    for task in tasks {
        let relative = compose.paths.relative(&task.output())?;
        let source = old_compose.join(&relative);
        if !source.is_file() {
            return Err(Error::ReuseInvalidated(format!(
                "{} is missing from {}",
                relative,
                old.display()
            )));
        }
        linker.link(&source, &task.output())?;
    }
    for task in tasks {
        record_image(phase, compose, task)?;
    }
    info!("Reused {} images from {}", tasks.len(), old.display());
    Ok(())
}
