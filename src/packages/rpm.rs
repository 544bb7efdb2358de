// src/packages/rpm.rs

//! RPM header reader
//!
//! Builds `PackageRecord`s straight from local `.rpm` files. Used for package
//! pools that are plain directories of RPMs without repodata.

use crate::error::{Error, Result};
use crate::packages::record::PackageRecord;
use crate::version::{Capability, DepFlag, Evr};
use rpm::{DependencyFlags, IndexSignatureTag, IndexTag, Package};
use sequoia_openpgp as openpgp;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Parsed RPM package header
pub struct RpmPackage {
    record: PackageRecord,
}

impl RpmPackage {
    /// Parse a package file from the given path
    pub fn parse(path: &Path, repo: &str) -> Result<Self> {
        debug!("Parsing RPM package: {}", path.display());

        let file = File::open(path)
            .map_err(|e| Error::IoError(format!("Failed to open RPM file {}: {}", path.display(), e)))?;
        let file_meta = file.metadata()?;

        let mut buf_reader = BufReader::new(file);

        let pkg = Package::parse(&mut buf_reader).map_err(|e| {
            Error::ParseError(format!("Failed to parse RPM {}: {}", path.display(), e))
        })?;

        let md = &pkg.metadata;
        let header_err = |what: &str, e: rpm::Error| {
            Error::ParseError(format!("Failed to get {} of {}: {}", what, path.display(), e))
        };

        let name = md.get_name().map_err(|e| header_err("name", e))?.to_string();
        let version = md.get_version().map_err(|e| header_err("version", e))?.to_string();
        let release = md.get_release().map_err(|e| header_err("release", e))?.to_string();
        let epoch = md.get_epoch().unwrap_or(0);

        // Source packages carry no SOURCERPM tag and report their build arch
        let sourcerpm = md.get_source_rpm().ok().map(|s| s.to_string());
        let arch = if sourcerpm.is_none() {
            if md.header.get_entry_data_as_u32(IndexTag::RPMTAG_NOSOURCE).is_ok() {
                "nosrc".to_string()
            } else {
                "src".to_string()
            }
        } else {
            md.get_arch().map_err(|e| header_err("arch", e))?.to_string()
        };

        let mut record = PackageRecord::new(name, Evr::new(epoch, version, release), arch)
            .with_repo(repo)
            .with_path(path);
        record.sourcerpm = sourcerpm;
        record.provides = md.get_provides().map(convert_deps).unwrap_or_default();
        record.requires = md.get_requires().map(convert_deps).unwrap_or_default();
        record.obsoletes = md.get_obsoletes().map(convert_deps).unwrap_or_default();
        record.conflicts = md.get_conflicts().map(convert_deps).unwrap_or_default();
        record.excludearch = md
            .header
            .get_entry_data_as_string_array(IndexTag::RPMTAG_EXCLUDEARCH)
            .map(|a| a.to_vec())
            .unwrap_or_default();
        record.exclusivearch = md
            .header
            .get_entry_data_as_string_array(IndexTag::RPMTAG_EXCLUSIVEARCH)
            .map(|a| a.to_vec())
            .unwrap_or_default();
        record.files = md
            .get_file_entries()
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|e| e.path.to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        record.size = file_meta.len();
        record.mtime = file_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        record.sigkey = Self::signing_key(&pkg);

        debug!(
            "Parsed RPM: {} ({} provides, {} requires, sigkey {:?})",
            record.nvra(),
            record.provides.len(),
            record.requires.len(),
            record.sigkey
        );

        Ok(Self { record })
    }

    /// Short key id (last 8 hex digits, lowercase) of the header signature
    fn signing_key(pkg: &Package) -> Option<String> {
        let sig = &pkg.metadata.signature;
        let data = sig
            .get_entry_data_as_binary(IndexSignatureTag::RPMSIGTAG_RSA)
            .or_else(|_| sig.get_entry_data_as_binary(IndexSignatureTag::RPMSIGTAG_PGP))
            .ok()?;
        signing_key_from_packet(data)
    }

    pub fn record(&self) -> &PackageRecord {
        &self.record
    }

    pub fn into_record(self) -> PackageRecord {
        self.record
    }
}

/// Extract the short issuer key id from a binary OpenPGP signature packet
pub fn signing_key_from_packet(data: &[u8]) -> Option<String> {
    use openpgp::parse::Parse;

    let packet = openpgp::Packet::from_bytes(data).ok()?;
    let openpgp::Packet::Signature(sig) = packet else {
        return None;
    };
    let issuer = sig.get_issuers().into_iter().next()?;
    let hex = match issuer {
        openpgp::KeyHandle::KeyID(id) => id.to_hex(),
        openpgp::KeyHandle::Fingerprint(fp) => fp.to_hex(),
    };
    let short = &hex[hex.len().saturating_sub(8)..];
    Some(short.to_lowercase())
}

/// Convert rpm crate dependency entries into capabilities
fn convert_deps(deps: Vec<rpm::Dependency>) -> Vec<Capability> {
    deps.into_iter()
        .map(|dep| {
            let flag = convert_flags(dep.flags);
            if flag == DepFlag::Any || dep.version.is_empty() {
                Capability::new(dep.name)
            } else {
                match Evr::parse(&dep.version) {
                    Ok(evr) => Capability::versioned(dep.name, flag, evr),
                    Err(_) => Capability::new(dep.name),
                }
            }
        })
        .collect()
}

fn convert_flags(flags: DependencyFlags) -> DepFlag {
    let less = flags.contains(DependencyFlags::LESS);
    let greater = flags.contains(DependencyFlags::GREATER);
    let equal = flags.contains(DependencyFlags::EQUAL);
    match (less, greater, equal) {
        (true, false, true) => DepFlag::Le,
        (true, false, false) => DepFlag::Lt,
        (false, true, true) => DepFlag::Ge,
        (false, true, false) => DepFlag::Gt,
        (false, false, true) => DepFlag::Eq,
        _ => DepFlag::Any,
    }
}
