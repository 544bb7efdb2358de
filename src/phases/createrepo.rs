// src/phases/createrepo.rs

//! createrepo phase
//!
//! Every repository a gathered (variant, arch) links packages into gets its
//! repodata from `createrepo_command`, restricted to the variant's own
//! packages with `--pkglist`. A parent's os tree therefore does not index
//! the addons living below it. Runs for one repository directory are
//! serialized by the compose-wide repository locks.

use super::pool::WorkPool;
use super::{Phase, PhaseBody};
use crate::compose::Compose;
use crate::error::{Error, Result};
use crate::gather::Category;
use crate::manifest::RpmCategory;
use crate::runroot::{DEFAULT_ATTEMPTS, RunrootRequest, shell_quote, with_retries};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(not(test))]
const RETRY_DELAY: Duration = Duration::from_secs(5);
#[cfg(test)]
const RETRY_DELAY: Duration = Duration::from_millis(1);

pub struct CreaterepoPhase;

/// One repository to index
#[derive(Debug, Clone, PartialEq, Eq)]
struct RepoTask {
    repo: PathBuf,
    arch: String,
    label: String,
    packages: BTreeSet<String>,
    groupfile: Option<PathBuf>,
}

impl PhaseBody for CreaterepoPhase {
    fn validate(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        if compose.config.createrepo_command.trim().is_empty() {
            return Err(Error::Config("createrepo_command must not be empty".to_string()));
        }
        Ok(())
    }

    fn run(&self, phase: &Phase, compose: &Compose) -> Result<()> {
        let tasks = collect_tasks(compose)?;
        if tasks.is_empty() {
            phase.logger.warn("no repositories to create");
            return Ok(());
        }
        info!("Creating {} repositories", tasks.len());

        let pool = WorkPool::new(
            "createrepo",
            compose.config.createrepo_num_workers,
            compose.cancel.clone(),
        );
        let items = tasks.into_iter().map(|t| (t.label.clone(), t)).collect();
        pool.run(items, |task| create_repo(compose, task))
    }
}

fn category_name(category: Category) -> &'static str {
    match category {
        Category::Rpm => "rpm",
        Category::Srpm => "srpm",
        Category::Debuginfo => "debuginfo",
    }
}

/// Repositories of every gathered (variant, arch). The source tree is shared
/// by all arches of a variant, so its package list is the union.
fn collect_tasks(compose: &Compose) -> Result<Vec<RepoTask>> {
    let results = compose.gather_results()?;
    let manifest = compose.rpm_manifest()?;
    let mut tasks: BTreeMap<PathBuf, RepoTask> = BTreeMap::new();

    for (uid, arch) in results.results.keys() {
        let Some(id) = compose.variants.by_uid(uid) else {
            continue;
        };
        let variant = compose.variants.get(id);
        let entries = manifest.entries(uid, arch);

        for category in Category::ALL {
            let repo = compose.paths.repository(variant, arch, category);
            let prefix = format!("{}/", compose.paths.relative(&repo)?);
            let packages = entries
                .iter()
                .filter(|(cat, _, _, _)| *cat == RpmCategory::from(category))
                .filter_map(|(_, _, _, entry)| entry.path.as_deref())
                .filter_map(|path| path.strip_prefix(&prefix))
                .map(str::to_string);

            let task = tasks.entry(repo.clone()).or_insert_with(|| {
                let groupfile = Some(compose.paths.variant_comps(variant, arch))
                    .filter(|p| category == Category::Rpm && p.is_file());
                RepoTask {
                    label: format!("{}.{}.{}", uid, arch, category_name(category)),
                    repo,
                    arch: arch.clone(),
                    packages: BTreeSet::new(),
                    groupfile,
                }
            });
            task.packages.extend(packages);
        }
    }
    Ok(tasks.into_values().collect())
}

fn package_list_path(compose: &Compose, task: &RepoTask) -> PathBuf {
    compose
        .paths
        .work_dir(Some(&task.arch))
        .join("repo_package_list")
        .join(format!("{}.conf", task.label))
}

fn command_line(compose: &Compose, task: &RepoTask, pkglist: &Path) -> String {
    let mut args = vec![
        compose.config.createrepo_command.clone(),
        "--database".to_string(),
        "--checksum".to_string(),
        "sha256".to_string(),
        "--pkglist".to_string(),
        shell_quote(&pkglist.to_string_lossy()),
    ];
    if let Some(groupfile) = &task.groupfile {
        args.push("--groupfile".to_string());
        args.push(shell_quote(&groupfile.to_string_lossy()));
    }
    args.push(shell_quote(&task.repo.to_string_lossy()));
    args.join(" ")
}

fn create_repo(compose: &Compose, task: &RepoTask) -> Result<()> {
    fs::create_dir_all(&task.repo)?;
    let pkglist = package_list_path(compose, task);
    if let Some(parent) = pkglist.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut listing: String = task.packages.iter().map(|p| format!("{}\n", p)).collect();
    if listing.is_empty() {
        listing.push('\n');
    }
    fs::write(&pkglist, listing)?;

    let mut mounts = vec![task.repo.clone(), pkglist.clone()];
    mounts.extend(task.groupfile.iter().cloned());
    let request = RunrootRequest {
        command: command_line(compose, task, &pkglist),
        arch: task.arch.clone(),
        packages: vec!["createrepo_c".to_string()],
        mounts,
        weight: compose.config.runroot_weights.get("createrepo").copied(),
        log_file: compose
            .paths
            .log_file(Some(&task.arch), &format!("createrepo-{}", task.label)),
    };

    let lock = compose.repo_locks.lock_for(&task.repo)?;
    let _guard = lock
        .lock()
        .map_err(|_| Error::IoError(format!("Lock for {} poisoned", task.repo.display())))?;
    debug!("{}", request.command);
    with_retries(DEFAULT_ATTEMPTS, RETRY_DELAY, |_| {
        compose.cancel.check()?;
        compose.runroot.run(&request)
    })?;
    info!(
        "Created repository {} with {} packages",
        task.repo.display(),
        task.packages.len()
    );
    Ok(())
}
