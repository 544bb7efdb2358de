// tests/common/mod.rs

//! Shared fixtures: an in-memory dummy package set and helpers that write it
//! out as an on-disk repository for end-to-end composes.

#![allow(dead_code)]

use pungi::gather::pool::PackagePool;
use pungi::gather::seed::SeedRequest;
use pungi::gather::solver::{GatherOptions, Solver};
use pungi::gather::{Flag, GatherResult, GatheredPackage};
use pungi::packages::PackageRecord;
use pungi::version::Evr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A binary package built from `<name>-<ver>-<rel>.src.rpm` unless `srpm`
/// says otherwise
pub fn rpm(name: &str, ver: &str, rel: &str, arch: &str, srpm: &str) -> PackageRecord {
    PackageRecord::new(name, Evr::new(0, ver, rel), arch).with_sourcerpm(format!("{}-{}-{}.src.rpm", srpm, ver, rel))
}

pub fn src(name: &str, ver: &str, rel: &str) -> PackageRecord {
    PackageRecord::new(name, Evr::new(0, ver, rel), "src")
}

/// The dummy package set every scenario draws from
pub fn dummy_packages() -> Vec<PackageRecord> {
    let mut packages = vec![
        // kernel
        rpm("dummy-kernel", "3.1.0", "1", "x86_64", "dummy-kernel"),
        rpm("dummy-kernel-headers", "3.1.0", "1", "x86_64", "dummy-kernel"),
        src("dummy-kernel", "3.1.0", "1"),
        // bash and its closure
        rpm("dummy-bash", "4.2.37", "6", "x86_64", "dummy-bash")
            .require("dummy-glibc")
            .require("dummy-filesystem"),
        rpm("dummy-bash", "4.2.37", "6", "i686", "dummy-bash")
            .require("dummy-glibc")
            .require("dummy-filesystem"),
        rpm("dummy-bash-doc", "4.2.37", "6", "noarch", "dummy-bash").require("dummy-bash"),
        src("dummy-bash", "4.2.37", "6"),
        rpm("dummy-filesystem", "4.2.37", "6", "x86_64", "dummy-filesystem").require("dummy-basesystem"),
        src("dummy-filesystem", "4.2.37", "6"),
        rpm("dummy-basesystem", "10.0", "6", "noarch", "dummy-basesystem"),
        src("dummy-basesystem", "10.0", "6"),
        rpm("dummy-glibc", "2.14", "5", "x86_64", "dummy-glibc").require("dummy-glibc-common"),
        rpm("dummy-glibc", "2.14", "5", "i686", "dummy-glibc").require("dummy-glibc-common"),
        rpm("dummy-glibc-common", "2.14", "5", "x86_64", "dummy-glibc"),
        rpm("dummy-nscd", "2.14", "5", "x86_64", "dummy-glibc").require("dummy-glibc"),
        src("dummy-glibc", "2.14", "5"),
        // release notes and langpacks
        rpm("dummy-release-notes", "1.2", "1", "noarch", "dummy-release-notes"),
        rpm("dummy-release-notes-cs-CZ", "1.2", "1", "noarch", "dummy-release-notes"),
        rpm("dummy-release-notes-en-US", "1.2", "1", "noarch", "dummy-release-notes"),
        src("dummy-release-notes", "1.2", "1"),
        // layered addon
        rpm("dummy-pacemaker", "1.1", "1", "x86_64", "dummy-pacemaker")
            .require("dummy-bash")
            .require("dummy-corosync"),
        rpm("dummy-corosync", "2.0", "1", "x86_64", "dummy-corosync"),
        src("dummy-pacemaker", "1.1", "1"),
        src("dummy-corosync", "2.0", "1"),
        // cockpit, its system package also lives in a lookaside
        rpm("dummy-cockpit-docker", "141", "1", "noarch", "dummy-cockpit").require("dummy-cockpit-system"),
        rpm("dummy-cockpit-system", "141", "1", "noarch", "dummy-cockpit"),
        src("dummy-cockpit", "141", "1"),
    ];

    for name in [
        "dummy-release-client",
        "dummy-release-client-workstation",
        "dummy-release-server",
    ] {
        for arch in ["i686", "x86_64"] {
            packages.push(rpm(name, "1.0.0", "1", arch, name).provide("system-release"));
        }
        packages.push(src(name, "1.0.0", "1"));
    }
    packages
}

/// Older cockpit build in a lookaside repository
pub fn lookaside_packages() -> Vec<PackageRecord> {
    vec![rpm("dummy-cockpit-system", "138", "1", "noarch", "dummy-cockpit")]
}

pub fn pool(packages: Vec<PackageRecord>, lookaside: Vec<PackageRecord>) -> PackagePool {
    let packages: Vec<Arc<PackageRecord>> = packages.into_iter().map(Arc::new).collect();
    let lookaside: Vec<Arc<PackageRecord>> = lookaside.into_iter().map(Arc::new).collect();
    PackagePool::new("x86_64", &packages, &lookaside)
}

pub fn seed(specs: &[&str]) -> SeedRequest {
    let mut seed = SeedRequest::default();
    for spec in specs {
        seed.add(spec, Flag::Input);
    }
    seed
}

pub fn solve(pool: &PackagePool, opts: &GatherOptions, seed: &SeedRequest) -> GatherResult {
    Solver::new(pool, opts).run(seed)
}

/// Sorted `name-version-release.arch` of a package list
pub fn nvras(list: &[GatheredPackage]) -> Vec<String> {
    let mut names: Vec<String> = list.iter().map(|p| p.record.nvra()).collect();
    names.sort();
    names
}

/// Write a repository with plain `primary.xml` repodata and empty package
/// files under `Packages/`
pub fn write_repo(dir: &Path, packages: &[PackageRecord]) {
    fs::create_dir_all(dir.join("Packages")).unwrap();
    fs::create_dir_all(dir.join("repodata")).unwrap();

    let mut primary = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <metadata xmlns=\"http://linux.duke.edu/metadata/common\" \
         xmlns:rpm=\"http://linux.duke.edu/metadata/rpm\">\n",
    );
    for pkg in packages {
        let filename = pkg.filename();
        fs::write(dir.join("Packages").join(&filename), pkg.nvra()).unwrap();

        primary.push_str("<package type=\"rpm\">\n");
        primary.push_str(&format!("  <name>{}</name>\n  <arch>{}</arch>\n", pkg.name, pkg.arch));
        primary.push_str(&format!(
            "  <version epoch=\"{}\" ver=\"{}\" rel=\"{}\"/>\n",
            pkg.evr.epoch, pkg.evr.version, pkg.evr.release
        ));
        primary.push_str(&format!("  <location href=\"Packages/{}\"/>\n  <format>\n", filename));
        primary.push_str(&format!(
            "    <rpm:sourcerpm>{}</rpm:sourcerpm>\n",
            pkg.sourcerpm.as_deref().unwrap_or("")
        ));
        for (tag, caps) in [("provides", &pkg.provides), ("requires", &pkg.requires)] {
            if caps.is_empty() {
                continue;
            }
            primary.push_str(&format!("    <rpm:{}>\n", tag));
            for cap in caps {
                primary.push_str(&format!("      <rpm:entry name=\"{}\"/>\n", cap.name));
            }
            primary.push_str(&format!("    </rpm:{}>\n", tag));
        }
        primary.push_str("  </format>\n</package>\n");
    }
    primary.push_str("</metadata>\n");
    fs::write(dir.join("repodata/primary.xml"), primary).unwrap();

    fs::write(
        dir.join("repodata/repomd.xml"),
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <repomd xmlns=\"http://linux.duke.edu/metadata/repo\">\n\
         <data type=\"primary\"><location href=\"repodata/primary.xml\"/></data>\n\
         </repomd>\n",
    )
    .unwrap();
}

pub const VARIANTS: &str = r#"<variants>
  <variant id="Server" name="Server" type="variant">
    <arches><arch>x86_64</arch></arches>
    <variants>
      <variant id="HA" name="High Availability" type="addon"/>
    </variants>
  </variant>
</variants>
"#;

/// Server seeded with bash, Server-HA with pacemaker; createrepo is a no-op
pub const CONFIG: &str = r#"
release_name = "Dummy Product"
release_short = "DP"
release_version = "1.0"
variants_file = "variants.xml"
createrepo_command = "true"

[pkgset_repos]
x86_64 = ["repo"]

[[additional_packages]]
variant = "Server"
packages = ["dummy-bash"]

[[additional_packages]]
variant = "Server-HA"
packages = ["dummy-pacemaker"]
"#;

/// Lay out config, variants and repository in `dir`; returns the config path
pub fn compose_inputs(dir: &Path, config: &str) -> PathBuf {
    write_repo(&dir.join("repo"), &dummy_packages());
    fs::write(dir.join("variants.xml"), VARIANTS).unwrap();
    let path = dir.join("pungi.toml");
    fs::write(&path, config).unwrap();
    path
}
