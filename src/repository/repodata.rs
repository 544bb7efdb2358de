// src/repository/repodata.rs

//! createrepo metadata parser
//!
//! Reads `repomd.xml` to locate the `primary` and `filelists` documents,
//! then turns every `<package>` of primary.xml into a `PackageRecord` with
//! its full dependency data.

use crate::error::{Error, Result};
use crate::packages::PackageRecord;
use crate::version::{Capability, DepFlag, Evr};
use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::io::Read;
use tracing::debug;

/// Locations of the metadata documents listed by repomd.xml
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepomdLocations {
    pub primary: Option<String>,
    pub filelists: Option<String>,
}

/// Read an attribute value from a start tag
fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

/// Parse repomd.xml and find the primary and filelists locations
pub fn parse_repomd(xml_content: &str) -> Result<RepomdLocations> {
    let mut reader = Reader::from_str(xml_content);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut current_type: Option<String> = None;
    let mut locations = RepomdLocations::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"data" => {
                current_type = attr(&e, b"type");
            }
            Ok(Event::Start(e) | Event::Empty(e)) if e.name().as_ref() == b"location" => {
                let href = attr(&e, b"href");
                match current_type.as_deref() {
                    Some("primary") => locations.primary = href,
                    Some("filelists") => locations.filelists = href,
                    _ => {}
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"data" => {
                current_type = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::ParseError(format!(
                    "Failed to parse repomd.xml: {}",
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    if locations.primary.is_none() {
        return Err(Error::ParseError(
            "Could not find primary data location in repomd.xml".to_string(),
        ));
    }
    Ok(locations)
}

/// Decompress a metadata document according to its file extension
pub fn decompress(location: &str, bytes: &[u8]) -> Result<String> {
    let data = if location.ends_with(".zst") {
        debug!("Decompressing zstd-compressed {}", location);
        zstd::decode_all(bytes)
            .map_err(|e| Error::ParseError(format!("Failed to decompress {}: {}", location, e)))?
    } else if location.ends_with(".gz") {
        debug!("Decompressing gzip-compressed {}", location);
        let mut gz = GzDecoder::new(bytes);
        let mut out = Vec::new();
        gz.read_to_end(&mut out)
            .map_err(|e| Error::ParseError(format!("Failed to decompress {}: {}", location, e)))?;
        out
    } else {
        bytes.to_vec()
    };

    String::from_utf8(data)
        .map_err(|e| Error::ParseError(format!("Invalid UTF-8 in {}: {}", location, e)))
}

/// Which dependency list a `<rpm:entry>` belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepList {
    Provides,
    Requires,
    Obsoletes,
    Conflicts,
}

/// Parse primary.xml into package records.
///
/// `repo` names the records' origin; `location` hrefs are kept relative to
/// the repository root so the caller can resolve them.
pub fn parse_primary(xml_content: &str, repo: &str) -> Result<Vec<PackageRecord>> {
    let mut reader = Reader::from_str(xml_content);
    reader.trim_text(true);

    let mut packages = Vec::new();
    let mut buf = Vec::new();

    let mut current: Option<PackageBuilder> = None;
    let mut current_tag = String::new();
    let mut dep_list: Option<DepList> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag_name.as_str() {
                    "package" => current = Some(PackageBuilder::default()),
                    "rpm:provides" => dep_list = Some(DepList::Provides),
                    "rpm:requires" => dep_list = Some(DepList::Requires),
                    "rpm:obsoletes" => dep_list = Some(DepList::Obsoletes),
                    "rpm:conflicts" => dep_list = Some(DepList::Conflicts),
                    _ => {}
                }
                if let Some(pkg) = current.as_mut() {
                    pkg.read_attributes(&tag_name, &e);
                }
                current_tag = tag_name;
            }
            Ok(Event::Empty(e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if let Some(pkg) = current.as_mut() {
                    if tag_name == "rpm:entry" {
                        if let Some(list) = dep_list {
                            pkg.push_entry(list, &e);
                        }
                    } else {
                        pkg.read_attributes(&tag_name, &e);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(pkg) = current.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "name" => pkg.name = Some(text),
                        "arch" => pkg.arch = Some(text),
                        "rpm:sourcerpm" => pkg.sourcerpm = Some(text),
                        "file" => pkg.files.push(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"package" => {
                        if let Some(builder) = current.take() {
                            match builder.build(repo) {
                                Ok(pkg) => packages.push(pkg),
                                Err(err) => debug!("Skipping malformed package entry: {}", err),
                            }
                        }
                    }
                    b"rpm:provides" | b"rpm:requires" | b"rpm:obsoletes" | b"rpm:conflicts" => {
                        dep_list = None;
                    }
                    _ => {}
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::ParseError(format!("Failed to parse primary.xml: {}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(packages)
}

/// Parse filelists.xml into a map of NVRA → file list
pub fn parse_filelists(xml_content: &str) -> Result<HashMap<String, Vec<String>>> {
    let mut reader = Reader::from_str(xml_content);
    reader.trim_text(true);

    let mut files: HashMap<String, Vec<String>> = HashMap::new();
    let mut buf = Vec::new();

    let mut name = String::new();
    let mut arch = String::new();
    let mut key: Option<String> = None;
    let mut in_file = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"package" => {
                    name = attr(&e, b"name").unwrap_or_default();
                    arch = attr(&e, b"arch").unwrap_or_default();
                    key = None;
                }
                b"file" => in_file = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"version" => {
                let ver = attr(&e, b"ver").unwrap_or_default();
                let rel = attr(&e, b"rel").unwrap_or_default();
                key = Some(format!("{}-{}-{}.{}", name, ver, rel, arch));
            }
            Ok(Event::Text(e)) if in_file => {
                if let Some(k) = &key {
                    let text = e.unescape().unwrap_or_default().to_string();
                    files.entry(k.clone()).or_default().push(text);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"file" => in_file = false,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::ParseError(format!(
                    "Failed to parse filelists.xml: {}",
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(files)
}

/// Builder for constructing a PackageRecord during XML parsing
#[derive(Default)]
struct PackageBuilder {
    name: Option<String>,
    epoch: Option<String>,
    ver: Option<String>,
    rel: Option<String>,
    arch: Option<String>,
    sourcerpm: Option<String>,
    size: Option<String>,
    time: Option<String>,
    location: Option<String>,
    provides: Vec<Capability>,
    requires: Vec<Capability>,
    obsoletes: Vec<Capability>,
    conflicts: Vec<Capability>,
    files: Vec<String>,
}

impl PackageBuilder {
    fn read_attributes(&mut self, tag: &str, e: &BytesStart<'_>) {
        match tag {
            "version" => {
                self.epoch = attr(e, b"epoch");
                self.ver = attr(e, b"ver");
                self.rel = attr(e, b"rel");
            }
            "size" => self.size = attr(e, b"package"),
            "time" => self.time = attr(e, b"file"),
            "location" => self.location = attr(e, b"href"),
            _ => {}
        }
    }

    fn push_entry(&mut self, list: DepList, e: &BytesStart<'_>) {
        let Some(name) = attr(e, b"name") else {
            return;
        };
        let flag = attr(e, b"flags")
            .and_then(|f| DepFlag::parse(&f).ok())
            .unwrap_or(DepFlag::Any);
        let cap = match attr(e, b"ver") {
            Some(ver) if flag != DepFlag::Any => {
                let epoch = attr(e, b"epoch")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(0);
                let rel = attr(e, b"rel").unwrap_or_default();
                Capability::versioned(name, flag, Evr::new(epoch, ver, rel))
            }
            _ => Capability::new(name),
        };
        match list {
            DepList::Provides => self.provides.push(cap),
            DepList::Requires => self.requires.push(cap),
            DepList::Obsoletes => self.obsoletes.push(cap),
            DepList::Conflicts => self.conflicts.push(cap),
        }
    }

    fn build(self, repo: &str) -> Result<PackageRecord> {
        let name = self
            .name
            .ok_or_else(|| Error::ParseError("Missing package name".to_string()))?;
        let ver = self
            .ver
            .ok_or_else(|| Error::ParseError(format!("Missing version of {}", name)))?;
        let rel = self
            .rel
            .ok_or_else(|| Error::ParseError(format!("Missing release of {}", name)))?;
        let arch = self
            .arch
            .ok_or_else(|| Error::ParseError(format!("Missing arch of {}", name)))?;
        let epoch = self
            .epoch
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(|e| e.parse::<u32>())
            .transpose()
            .map_err(|e| Error::ParseError(format!("Invalid epoch of {}: {}", name, e)))?
            .unwrap_or(0);
        let location = self
            .location
            .ok_or_else(|| Error::ParseError(format!("Missing location of {}", name)))?;

        let mut record = PackageRecord::new(name, Evr::new(epoch, ver, rel), arch)
            .with_repo(repo)
            .with_path(location);
        record.sourcerpm = self.sourcerpm.filter(|s| !s.is_empty());
        record.size = self.size.and_then(|s| s.parse().ok()).unwrap_or(0);
        record.mtime = self.time.and_then(|s| s.parse().ok()).unwrap_or(0);
        record.provides = self.provides;
        record.requires = self.requires;
        record.obsoletes = self.obsoletes;
        record.conflicts = self.conflicts;
        record.files = self.files;
        Ok(record)
    }
}
