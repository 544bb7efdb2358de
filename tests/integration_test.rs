// tests/integration_test.rs

//! End-to-end gather scenarios over the dummy package set, plus full
//! composes run from a configuration file on disk.

mod common;

use chrono::NaiveDate;
use common::*;
use pungi::config::GreedyMethod;
use pungi::gather::multilib::MultilibPolicy;
use pungi::gather::solver::GatherOptions;
use pungi::linker::PackageLinker;
use pungi::manifest::{RPMS_FILE, RpmManifest};
use pungi::metadata::COMPOSEINFO_FILE;
use pungi::repository;
use pungi::{ComposeOptions, ComposeStatus, Error};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;
use walkdir::WalkDir;

fn options(target_dir: &Path) -> ComposeOptions {
    ComposeOptions {
        target_dir: target_dir.to_path_buf(),
        compose_date: NaiveDate::from_ymd_opt(2024, 1, 1),
        no_latest_link: true,
        ..Default::default()
    }
}

#[test]
fn test_kernel_only_without_greedy() {
    let pool = pool(dummy_packages(), Vec::new());
    let result = solve(&pool, &GatherOptions::default(), &seed(&["dummy-kernel"]));

    let files: Vec<String> = result.rpm.iter().map(|p| p.record.filename()).collect();
    assert_eq!(files, vec!["dummy-kernel-3.1.0-1.x86_64.rpm"]);
    let sources: Vec<String> = result.srpm.iter().map(|p| p.record.filename()).collect();
    assert_eq!(sources, vec!["dummy-kernel-3.1.0-1.src.rpm"]);
    assert!(result.debuginfo.is_empty());
}

#[test]
fn test_bash_multilib_with_fulltree() {
    let pool = pool(dummy_packages(), Vec::new());
    let opts = GatherOptions {
        fulltree: true,
        ..Default::default()
    };
    let result = solve(&pool, &opts, &seed(&["dummy-bash.+", "-dummy-bash-doc"]));

    assert_eq!(
        nvras(&result.rpm),
        vec![
            "dummy-basesystem-10.0-6.noarch",
            "dummy-bash-4.2.37-6.i686",
            "dummy-filesystem-4.2.37-6.x86_64",
            "dummy-glibc-2.14-5.i686",
            "dummy-glibc-2.14-5.x86_64",
            "dummy-glibc-common-2.14-5.x86_64",
            "dummy-nscd-2.14-5.x86_64",
        ]
    );
    assert!(result.broken.is_empty());
}

#[test]
fn test_filtered_package_never_appears() {
    let pool = pool(dummy_packages(), Vec::new());
    let opts = GatherOptions {
        fulltree: true,
        greedy: GreedyMethod::All,
        filter: vec!["dummy-nscd".to_string(), "dummy-bash-doc".to_string()],
        ..Default::default()
    };
    let result = solve(&pool, &opts, &seed(&["dummy-bash", "dummy-bash-doc"]));

    let names: Vec<&str> = result.rpm.iter().map(|p| p.record.name.as_str()).collect();
    assert!(names.contains(&"dummy-glibc"));
    assert!(!names.contains(&"dummy-nscd"));
    assert!(!names.contains(&"dummy-bash-doc"));
}

#[test]
fn test_multilib_needs_policy_or_explicit_request() {
    let pool = pool(dummy_packages(), Vec::new());
    let plain = solve(&pool, &GatherOptions::default(), &seed(&["dummy-bash"]));
    assert!(plain.rpm.iter().all(|p| p.record.arch != "i686"));

    let whitelisted = GatherOptions {
        multilib: MultilibPolicy::new(&[], &["dummy-glibc".to_string()], &[]),
        ..Default::default()
    };
    let result = solve(&pool, &whitelisted, &seed(&["dummy-bash"]));
    let multilib: Vec<String> = result
        .rpm
        .iter()
        .filter(|p| p.record.arch == "i686")
        .map(|p| p.record.nvra())
        .collect();
    assert_eq!(multilib, vec!["dummy-glibc-2.14-5.i686"]);
}

#[test]
fn test_multilib_package_as_only_provider() {
    let mut packages = dummy_packages();
    packages.push(rpm("dummy-wine", "1.0", "1", "x86_64", "dummy-wine").require("libwine32.so"));
    packages.push(rpm("dummy-wine-core", "1.0", "1", "i686", "dummy-wine").provide("libwine32.so"));
    let pool = pool(packages, Vec::new());
    let result = solve(&pool, &GatherOptions::default(), &seed(&["dummy-wine"]));

    assert!(result.broken.is_empty());
    assert_eq!(
        nvras(&result.rpm),
        vec!["dummy-wine-1.0-1.x86_64", "dummy-wine-core-1.0-1.i686"]
    );
}

#[test]
fn test_system_release_with_greedy_all() {
    let pool = pool(dummy_packages(), Vec::new());
    let opts = GatherOptions {
        greedy: GreedyMethod::All,
        ..Default::default()
    };
    let result = solve(&pool, &opts, &seed(&["system-release"]));

    let mut expected = Vec::new();
    for name in [
        "dummy-release-client",
        "dummy-release-client-workstation",
        "dummy-release-server",
    ] {
        for arch in ["i686", "x86_64"] {
            expected.push(format!("{}-1.0.0-1.{}", name, arch));
        }
    }
    expected.sort();
    assert_eq!(nvras(&result.rpm), expected);
}

#[test]
fn test_langpacks_follow_their_base_package() {
    let pool = pool(dummy_packages(), Vec::new());
    let mut request = seed(&["dummy-release-notes"]);
    request
        .langpacks
        .insert("dummy-release-notes".to_string(), "dummy-release-notes-%s".to_string());
    let result = solve(&pool, &GatherOptions::default(), &request);

    assert_eq!(
        nvras(&result.rpm),
        vec![
            "dummy-release-notes-1.2-1.noarch",
            "dummy-release-notes-cs-CZ-1.2-1.noarch",
            "dummy-release-notes-en-US-1.2-1.noarch",
        ]
    );
}

#[test]
fn test_lookaside_satisfies_dependency_with_older_version() {
    let pool = pool(dummy_packages(), lookaside_packages());
    let result = solve(
        &pool,
        &GatherOptions::default(),
        &seed(&["dummy-cockpit-docker", "-dummy-cockpit-system"]),
    );

    assert!(result.broken.is_empty());
    let own: Vec<String> = result
        .rpm
        .iter()
        .filter(|p| !p.is_lookaside())
        .map(|p| p.record.nvra())
        .collect();
    assert_eq!(own, vec!["dummy-cockpit-docker-141-1.noarch"]);
    assert!(
        result
            .rpm
            .iter()
            .any(|p| p.is_lookaside() && p.record.nvra() == "dummy-cockpit-system-138-1.noarch")
    );
}

#[test]
fn test_compose_layers_addon_on_its_parent() {
    let dir = TempDir::new().unwrap();
    let config = compose_inputs(dir.path(), CONFIG);
    let target = dir.path().join("composes");
    fs::create_dir_all(&target).unwrap();

    let compose = pungi::prepare_compose(&config, options(&target)).unwrap();
    let status = pungi::run_compose(&compose).unwrap();
    assert_eq!(status, ComposeStatus::Finished);
    assert_eq!(status.exit_code(), 0);

    let top = compose.topdir();
    assert_eq!(fs::read_to_string(top.join("STATUS")).unwrap(), "FINISHED\n");

    let manifest = RpmManifest::load(&top.join("compose/metadata").join(RPMS_FILE)).unwrap();
    let binaries = |uid: &str| -> Vec<String> {
        let mut names: Vec<String> = manifest
            .entries(uid, "x86_64")
            .into_iter()
            .filter(|(_, _, nevra, _)| !nevra.ends_with(".src"))
            .map(|(_, _, nevra, _)| nevra.to_string())
            .collect();
        names.sort();
        names
    };
    let server = binaries("Server");
    let addon = binaries("Server-HA");
    assert!(server.contains(&"dummy-bash-0:4.2.37-6.x86_64".to_string()));
    assert_eq!(
        addon,
        vec!["dummy-corosync-0:2.0-1.x86_64", "dummy-pacemaker-0:1.1-1.x86_64"]
    );
    assert!(server.iter().all(|n| !addon.contains(n)));

    let os = top.join("compose/Server/x86_64/os");
    assert!(os.join("Packages/dummy-bash-4.2.37-6.x86_64.rpm").is_file());
    assert!(os.join("addons/HA/Packages/dummy-pacemaker-1.1-1.x86_64.rpm").is_file());
    assert!(!os.join("addons/HA/Packages/dummy-bash-4.2.37-6.x86_64.rpm").exists());
    assert!(os.join(".treeinfo").is_file());
}

#[test]
fn test_compose_metadata_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let config = compose_inputs(dir.path(), CONFIG);

    let mut tops = Vec::new();
    for name in ["first", "second"] {
        let target = dir.path().join(name);
        fs::create_dir_all(&target).unwrap();
        let compose = pungi::prepare_compose(&config, options(&target)).unwrap();
        pungi::run_compose(&compose).unwrap();
        tops.push(compose.topdir().to_path_buf());
    }

    let read_all = |top: &Path| -> BTreeMap<&str, String> {
        [RPMS_FILE, COMPOSEINFO_FILE]
            .into_iter()
            .map(|f| (f, fs::read_to_string(top.join("compose/metadata").join(f)).unwrap()))
            .chain([(
                ".treeinfo",
                fs::read_to_string(top.join("compose/Server/x86_64/os/.treeinfo")).unwrap(),
            )])
            .collect()
    };
    assert_eq!(read_all(&tops[0]), read_all(&tops[1]));
}

#[test]
fn test_invalid_config_creates_nothing() {
    let dir = TempDir::new().unwrap();
    let config = compose_inputs(dir.path(), "release_name = \"Dummy\"\n");
    let target = dir.path().join("composes");
    fs::create_dir_all(&target).unwrap();

    let result = pungi::prepare_compose(&config, options(&target));
    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
}

#[test]
fn test_missing_repository_dooms_the_compose() {
    let dir = TempDir::new().unwrap();
    let config = compose_inputs(dir.path(), &CONFIG.replace("\"repo\"", "\"no-such-repo\""));
    let target = dir.path().join("composes");
    fs::create_dir_all(&target).unwrap();

    let compose = pungi::prepare_compose(&config, options(&target)).unwrap();
    let result = pungi::run_compose(&compose);
    assert!(matches!(result, Err(Error::InputNotFound(_))));
    assert_eq!(fs::read_to_string(compose.topdir().join("STATUS")).unwrap(), "DOOMED\n");
    assert!(compose.topdir().join("compose/metadata/image-manifest.json").is_file());
}

/// Size, mtime and inode of every file under a tree
fn snapshot(root: &Path) -> BTreeMap<PathBuf, (u64, SystemTime, u64)> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let meta = e.metadata().unwrap();
            (e.path().to_path_buf(), (meta.len(), meta.modified().unwrap(), meta.ino()))
        })
        .collect()
}

#[test]
fn test_relinking_a_finished_compose_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let config = compose_inputs(dir.path(), CONFIG);
    let target = dir.path().join("composes");
    fs::create_dir_all(&target).unwrap();
    let compose = pungi::prepare_compose(&config, options(&target)).unwrap();
    pungi::run_compose(&compose).unwrap();

    let tree = compose.topdir().join("compose");
    let before = snapshot(&tree);
    assert!(before.keys().any(|p| p.ends_with("Packages/dummy-bash-4.2.37-6.x86_64.rpm")));

    let linker = PackageLinker::new(
        &compose.paths,
        compose.config.gather_link_type,
        compose.config.hashed_directories,
        1,
    );
    let download_dir = compose.paths.download_dir();
    let results = compose.gather_results().unwrap();
    for ((uid, arch), result) in &results.results {
        let variant = compose.variants.get(compose.variants.by_uid(uid).unwrap());
        linker
            .link_variant(variant, arch, result, |record| {
                repository::fetch_package(record, &download_dir, None)
            })
            .unwrap();
    }
    assert_eq!(snapshot(&tree), before);
}

#[test]
fn test_lookaside_packages_are_not_linked() {
    let dir = TempDir::new().unwrap();
    write_repo(&dir.path().join("lookaside"), &lookaside_packages());
    let config = compose_inputs(
        dir.path(),
        &CONFIG.replace(
            "packages = [\"dummy-bash\"]",
            "packages = [\"dummy-bash\", \"dummy-cockpit-docker\"]\n\n\
             [[lookaside_repos]]\nvariant = \"Server\"\nrepos = [\"lookaside\"]",
        ),
    );
    let target = dir.path().join("composes");
    fs::create_dir_all(&target).unwrap();
    let compose = pungi::prepare_compose(&config, options(&target)).unwrap();
    assert_eq!(pungi::run_compose(&compose).unwrap(), ComposeStatus::Finished);

    let top = compose.topdir();
    let packages = top.join("compose/Server/x86_64/os/Packages");
    assert!(packages.join("dummy-cockpit-docker-141-1.noarch.rpm").is_file());
    let linked: Vec<String> = WalkDir::new(top.join("compose"))
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(linked.iter().all(|name| !name.starts_with("dummy-cockpit-system")));

    let manifest = RpmManifest::load(&top.join("compose/metadata").join(RPMS_FILE)).unwrap();
    let (_, _, _, entry) = manifest
        .entries("Server", "x86_64")
        .into_iter()
        .find(|(_, _, nevra, _)| nevra.starts_with("dummy-cockpit-system-"))
        .unwrap();
    assert!(entry.lookaside);
    assert!(entry.path.is_none());
}
