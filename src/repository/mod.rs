// src/repository/mod.rs

//! Package repositories
//!
//! This module provides functionality for:
//! - Loading package records from createrepo metadata (local or remote)
//! - Scanning plain directories of RPM files
//! - Downloading remote packages with retry support

pub mod repodata;

use crate::error::{Error, Result};
use crate::packages::{PackageRecord, RpmPackage};
use rayon::prelude::*;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Whether a location is an HTTP(S) URL rather than a local path
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Fetch a URL into memory with retry support
    pub fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Fetching {}", url);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }
                    let bytes = response.bytes().map_err(|e| {
                        Error::DownloadError(format!("Failed to read response from {}: {}", url, e))
                    })?;
                    return Ok(bytes.to_vec());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Fetch attempt {} of {} failed: {}, retrying...", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Download a file to the specified path with retry support
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    // Write to temporary file first
                    let temp_path = dest_path.with_extension("tmp");
                    let mut file = File::create(&temp_path).map_err(|e| {
                        Error::IoError(format!("Failed to create file {}: {}", temp_path.display(), e))
                    })?;

                    io::copy(&mut response, &mut file).map_err(|e| {
                        Error::IoError(format!("Failed to write downloaded data: {}", e))
                    })?;

                    fs::rename(&temp_path, dest_path).map_err(|e| {
                        Error::IoError(format!(
                            "Failed to move {} to {}: {}",
                            temp_path.display(),
                            dest_path.display(),
                            e
                        ))
                    })?;

                    debug!("Downloaded {}", dest_path.display());
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

/// One package repository: a local directory or a remote URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Name recorded as `repo` on every loaded package
    pub name: String,
    pub location: String,
}

impl Repository {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }

    /// Load every package record of the repository.
    ///
    /// Record paths are absolute: a filesystem path for local repositories,
    /// a URL for remote ones.
    pub fn load(&self, client: Option<&RepositoryClient>) -> Result<Vec<PackageRecord>> {
        info!("Loading repository {} from {}", self.name, self.location);

        let packages = if is_remote(&self.location) {
            let client = client.ok_or_else(|| {
                Error::DownloadError(format!("No HTTP client for {}", self.location))
            })?;
            self.load_remote(client)?
        } else {
            let dir = Path::new(&self.location);
            if !dir.is_dir() {
                return Err(Error::InputNotFound(format!(
                    "Repository {} does not exist: {}",
                    self.name, self.location
                )));
            }
            if dir.join("repodata/repomd.xml").exists() {
                self.load_local_repodata(dir)?
            } else {
                self.scan_directory(dir)?
            }
        };

        info!("Loaded {} packages from repository {}", packages.len(), self.name);
        Ok(packages)
    }

    fn load_remote(&self, client: &RepositoryClient) -> Result<Vec<PackageRecord>> {
        let base = self.location.trim_end_matches('/');
        let repomd = client.fetch_bytes(&format!("{}/repodata/repomd.xml", base))?;
        let repomd = String::from_utf8_lossy(&repomd);
        let locations = repodata::parse_repomd(&repomd)?;

        let read = |href: &str| -> Result<String> {
            let bytes = client.fetch_bytes(&format!("{}/{}", base, href))?;
            repodata::decompress(href, &bytes)
        };
        self.assemble(&locations, read, |href| PathBuf::from(format!("{}/{}", base, href)))
    }

    fn load_local_repodata(&self, dir: &Path) -> Result<Vec<PackageRecord>> {
        let repomd = fs::read_to_string(dir.join("repodata/repomd.xml"))?;
        let locations = repodata::parse_repomd(&repomd)?;

        let read = |href: &str| -> Result<String> {
            let bytes = fs::read(dir.join(href)).map_err(|e| {
                Error::IoError(format!("Failed to read {}: {}", dir.join(href).display(), e))
            })?;
            repodata::decompress(href, &bytes)
        };
        self.assemble(&locations, read, |href| dir.join(href))
    }

    /// Combine primary and filelists documents into records with absolute paths
    fn assemble(
        &self,
        locations: &repodata::RepomdLocations,
        read: impl Fn(&str) -> Result<String>,
        resolve: impl Fn(&str) -> PathBuf,
    ) -> Result<Vec<PackageRecord>> {
        let primary = locations
            .primary
            .as_deref()
            .ok_or_else(|| Error::ParseError("repomd.xml lists no primary data".to_string()))?;
        let mut packages = repodata::parse_primary(&read(primary)?, &self.name)?;

        if let Some(filelists) = locations.filelists.as_deref() {
            let files = repodata::parse_filelists(&read(filelists)?)?;
            for pkg in &mut packages {
                if let Some(list) = files.get(&pkg.nvra()) {
                    pkg.files = list.clone();
                }
            }
        }

        for pkg in &mut packages {
            let href = pkg.path.to_string_lossy().to_string();
            pkg.path = resolve(&href);
        }
        Ok(packages)
    }

    /// Read headers of every `*.rpm` under a directory without repodata
    fn scan_directory(&self, dir: &Path) -> Result<Vec<PackageRecord>> {
        let pattern = format!("{}/**/*.rpm", dir.display());
        let paths: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("Invalid repository path {}: {}", dir.display(), e)))?
            .filter_map(|p| p.ok())
            .collect();

        debug!("Reading {} RPM headers under {}", paths.len(), dir.display());

        let mut packages = paths
            .par_iter()
            .map(|path| RpmPackage::parse(path, &self.name).map(RpmPackage::into_record))
            .collect::<Result<Vec<_>>>()?;
        packages.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(packages)
    }
}

/// Return a local path for a package, downloading remote ones into
/// `download_dir` when they are not there yet
pub fn fetch_package(
    record: &PackageRecord,
    download_dir: &Path,
    client: Option<&RepositoryClient>,
) -> Result<PathBuf> {
    let location = record.path.to_string_lossy();
    if !is_remote(&location) {
        return Ok(record.path.clone());
    }

    let dest = download_dir.join(record.filename());
    if dest.exists() {
        debug!("Using cached download {}", dest.display());
        return Ok(dest);
    }

    let client = client
        .ok_or_else(|| Error::DownloadError(format!("No HTTP client to fetch {}", location)))?;
    client.download_file(&location, &dest)?;
    Ok(dest)
}
