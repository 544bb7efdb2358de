// src/phases/image_checksum.rs

//! image_checksum phase
//!
//! Checksums every recorded image, writes a `CHECKSUM` file into each image
//! directory and saves the image manifest and `osbs.json`.

use super::{Phase, PhaseBody};
use crate::compose::Compose;
use crate::error::Result;
use crate::manifest::{IMAGES_FILE, OSBS_FILE, file_checksums, write_osbs};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ImageChecksumPhase;

impl PhaseBody for ImageChecksumPhase {
    fn run(&self, _phase: &Phase, compose: &Compose) -> Result<()> {
        let mut algorithms = compose.config.media_checksums.clone();
        if !algorithms.iter().any(|a| a == "sha256") {
            algorithms.push("sha256".to_string());
        }
        algorithms.sort();
        algorithms.dedup();

        let compose_dir = compose.paths.compose_dir();
        // directory → file name → checksums
        let mut by_dir: BTreeMap<PathBuf, BTreeMap<String, BTreeMap<String, String>>> = BTreeMap::new();
        {
            let mut images = compose.images()?;
            for image in images.iter_mut() {
                compose.cancel.check()?;
                let path = compose_dir.join(&image.path);
                image.checksums = file_checksums(&path, &algorithms)?;
                if let (Some(dir), Some(name)) = (path.parent(), path.file_name()) {
                    by_dir
                        .entry(dir.to_path_buf())
                        .or_default()
                        .insert(name.to_string_lossy().into_owned(), image.checksums.clone());
                }
            }
        }

        for (dir, files) in &by_dir {
            write_checksum_file(dir, files)?;
        }
        info!("Checksummed images in {} directories", by_dir.len());
        write_image_manifest(compose)
    }
}

/// BSD-style lines, e.g. `SHA256 (boot.iso) = <hex>`
fn write_checksum_file(dir: &Path, files: &BTreeMap<String, BTreeMap<String, String>>) -> Result<()> {
    let mut content = String::new();
    for (name, sums) in files {
        for (algorithm, digest) in sums {
            content.push_str(&format!("{} ({}) = {}\n", algorithm.to_uppercase(), name, digest));
        }
    }
    let path = dir.join("CHECKSUM");
    fs::write(&path, content)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Save `image-manifest.json` and, when there were container builds,
/// `osbs.json`
pub fn write_image_manifest(compose: &Compose) -> Result<()> {
    let metadata = compose.paths.metadata_dir();
    compose.images()?.write(&metadata.join(IMAGES_FILE))?;
    let builds = compose.osbs_builds()?;
    if !builds.is_empty() {
        write_osbs(&metadata.join(OSBS_FILE), &builds)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::test_compose;
    use crate::manifest::{Image, ImageManifest, OsbsBuild};

    fn image(path: &str) -> Image {
        Image {
            path: path.to_string(),
            image_type: "dvd".to_string(),
            format: "iso".to_string(),
            arch: "x86_64".to_string(),
            subvariant: Some("Server".to_string()),
            size: 4,
            bootable: true,
            checksums: BTreeMap::new(),
        }
    }

    #[test]
    fn test_checksums_images() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut compose = test_compose(dir.path());
        compose.config.media_checksums = vec!["sha512".to_string()];
        let iso_dir = compose.topdir().join("compose/Server/x86_64/iso");
        fs::create_dir_all(&iso_dir).unwrap();
        fs::write(iso_dir.join("dvd.iso"), "dvd\n").unwrap();
        fs::write(iso_dir.join("boot.iso"), "boot").unwrap();
        compose.images().unwrap().add("Server", image("Server/x86_64/iso/dvd.iso"));
        compose.images().unwrap().add("Server", image("Server/x86_64/iso/boot.iso"));
        compose
            .add_osbs_build(OsbsBuild {
                variant: "Server".to_string(),
                arch: "x86_64".to_string(),
                output: "registry.example.com/server:1".to_string(),
            })
            .unwrap();

        Phase::new("image_checksum", Box::new(ImageChecksumPhase))
            .run(&compose)
            .unwrap();

        let checksum = fs::read_to_string(iso_dir.join("CHECKSUM")).unwrap();
        let lines: Vec<&str> = checksum.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("SHA256 (boot.iso) = "));
        assert!(lines[3].starts_with("SHA512 (dvd.iso) = "));

        let metadata = compose.paths.metadata_dir();
        let manifest = ImageManifest::load(&metadata.join(IMAGES_FILE)).unwrap();
        let (_, dvd) = manifest
            .iter()
            .find(|(_, i)| i.path.ends_with("dvd.iso"))
            .unwrap();
        assert_eq!(
            dvd.checksums["sha256"],
            "2265fd36b15dcdd38e94e8b827084fb3d2227aa9567f9891dc5f85798c1dea66"
        );
        assert!(metadata.join(OSBS_FILE).is_file());
    }

    #[test]
    fn test_missing_image_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let compose = test_compose(dir.path());
        compose.images().unwrap().add("Server", image("Server/x86_64/iso/gone.iso"));
        assert!(
            Phase::new("image_checksum", Box::new(ImageChecksumPhase))
                .run(&compose)
                .is_err()
        );
    }
}
