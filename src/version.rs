// src/version.rs

//! RPM version comparison and dependency range matching
//!
//! Implements the rpmvercmp segment algorithm (including `~` and `^`),
//! epoch:version-release ordering, and the Provides/Requires range overlap
//! test used by the depsolver.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Compare two version (or release) strings the way rpm does
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let mut one = a.as_bytes();
    let mut two = b.as_bytes();

    fn is_sep(c: u8) -> bool {
        !c.is_ascii_alphanumeric() && c != b'~' && c != b'^'
    }

    loop {
        while let Some(&c) = one.first() {
            if !is_sep(c) {
                break;
            }
            one = &one[1..];
        }
        while let Some(&c) = two.first() {
            if !is_sep(c) {
                break;
            }
            two = &two[1..];
        }

        // Tilde sorts before everything, even the end of the string
        if one.first() == Some(&b'~') || two.first() == Some(&b'~') {
            if one.first() != Some(&b'~') {
                return Ordering::Greater;
            }
            if two.first() != Some(&b'~') {
                return Ordering::Less;
            }
            one = &one[1..];
            two = &two[1..];
            continue;
        }

        // Caret sorts after the end of the string but before anything else
        if one.first() == Some(&b'^') || two.first() == Some(&b'^') {
            if one.is_empty() {
                return Ordering::Less;
            }
            if two.is_empty() {
                return Ordering::Greater;
            }
            if one[0] != b'^' {
                return Ordering::Greater;
            }
            if two[0] != b'^' {
                return Ordering::Less;
            }
            one = &one[1..];
            two = &two[1..];
            continue;
        }

        if one.is_empty() || two.is_empty() {
            break;
        }

        let numeric = one[0].is_ascii_digit();
        let segment_len = |s: &[u8]| {
            s.iter()
                .take_while(|c| {
                    if numeric {
                        c.is_ascii_digit()
                    } else {
                        c.is_ascii_alphabetic()
                    }
                })
                .count()
        };
        let len1 = segment_len(one);
        let len2 = segment_len(two);
        let mut seg1 = &one[..len1];
        let mut seg2 = &two[..len2];
        one = &one[len1..];
        two = &two[len2..];

        // Segments of different types: numeric is newer
        if seg2.is_empty() {
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        if numeric {
            while seg1.first() == Some(&b'0') {
                seg1 = &seg1[1..];
            }
            while seg2.first() == Some(&b'0') {
                seg2 = &seg2[1..];
            }
            match seg1.len().cmp(&seg2.len()) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        match seg1.cmp(seg2) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }

    match (one.is_empty(), two.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        _ => Ordering::Greater,
    }
}

/// Epoch, version and release of a package or capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Evr {
    pub epoch: u32,
    pub version: String,
    pub release: String,
}

impl Evr {
    pub fn new(epoch: u32, version: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            epoch,
            version: version.into(),
            release: release.into(),
        }
    }

    /// Parse `[epoch:]version[-release]`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) => {
                let epoch = if e.is_empty() {
                    0
                } else {
                    e.parse::<u32>().map_err(|err| {
                        Error::ParseError(format!("Invalid epoch in '{}': {}", s, err))
                    })?
                };
                (epoch, rest)
            }
            None => (0, s),
        };

        let (version, release) = match rest.rsplit_once('-') {
            Some((v, r)) => (v, r),
            None => (rest, ""),
        };

        if version.is_empty() {
            return Err(Error::ParseError(format!(
                "Empty version component in '{}'",
                s
            )));
        }

        Ok(Self::new(epoch, version, release))
    }

    /// Compare the way dependency matching does: a missing release on
    /// either side matches any release.
    pub fn compare_for_deps(&self, other: &Evr) -> Ordering {
        match self.epoch.cmp(&other.epoch) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match rpmvercmp(&self.version, &other.version) {
            Ordering::Equal => {}
            ord => return ord,
        }
        if self.release.is_empty() || other.release.is_empty() {
            return Ordering::Equal;
        }
        rpmvercmp(&self.release, &other.release)
    }
}

impl Ord for Evr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| rpmvercmp(&self.version, &other.version))
            .then_with(|| rpmvercmp(&self.release, &other.release))
    }
}

impl PartialOrd for Evr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Evr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.version)?;
        if !self.release.is_empty() {
            write!(f, "-{}", self.release)?;
        }
        Ok(())
    }
}

/// Comparison flag of a dependency entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DepFlag {
    #[serde(rename = "")]
    Any,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl DepFlag {
    /// Parse repodata flags (`EQ`, `GE`, ...) or operators (`=`, `>=`, ...)
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Ok(DepFlag::Any),
            "EQ" | "=" | "==" => Ok(DepFlag::Eq),
            "LT" | "<" => Ok(DepFlag::Lt),
            "LE" | "<=" => Ok(DepFlag::Le),
            "GT" | ">" => Ok(DepFlag::Gt),
            "GE" | ">=" => Ok(DepFlag::Ge),
            other => Err(Error::ParseError(format!("Invalid dependency flag: {}", other))),
        }
    }

    fn less(self) -> bool {
        matches!(self, DepFlag::Lt | DepFlag::Le)
    }

    fn greater(self) -> bool {
        matches!(self, DepFlag::Gt | DepFlag::Ge)
    }

    fn equal(self) -> bool {
        matches!(self, DepFlag::Eq | DepFlag::Le | DepFlag::Ge)
    }

    pub fn as_operator(&self) -> &'static str {
        match self {
            DepFlag::Any => "",
            DepFlag::Eq => "=",
            DepFlag::Lt => "<",
            DepFlag::Le => "<=",
            DepFlag::Gt => ">",
            DepFlag::Ge => ">=",
        }
    }
}

/// One Provides/Requires/Obsoletes/Conflicts entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub flag: DepFlag,
    pub evr: Option<Evr>,
}

impl Capability {
    /// Unversioned capability
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flag: DepFlag::Any,
            evr: None,
        }
    }

    /// Versioned capability
    pub fn versioned(name: impl Into<String>, flag: DepFlag, evr: Evr) -> Self {
        Self {
            name: name.into(),
            flag,
            evr: Some(evr),
        }
    }

    /// Parse `name`, or `name OP evr` (e.g. `dummy-glibc-common = 2.14-5`)
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        match parts.as_slice() {
            [name] => Ok(Self::new(*name)),
            [name, op, evr] => Ok(Self::versioned(*name, DepFlag::parse(op)?, Evr::parse(evr)?)),
            _ => Err(Error::ParseError(format!("Invalid capability: {}", s))),
        }
    }

    /// Whether this capability is versioned
    pub fn is_versioned(&self) -> bool {
        self.flag != DepFlag::Any && self.evr.is_some()
    }

    /// Whether this Provides entry satisfies the given Requires entry
    pub fn satisfies(&self, require: &Capability) -> bool {
        if self.name != require.name {
            return false;
        }
        let (Some(p_evr), Some(r_evr)) = (&self.evr, &require.evr) else {
            return true;
        };
        if !self.is_versioned() || !require.is_versioned() {
            return true;
        }
        ranges_overlap(self.flag, p_evr, require.flag, r_evr)
    }
}

/// rpmdsCompare: whether two versioned ranges intersect
fn ranges_overlap(a_flag: DepFlag, a: &Evr, b_flag: DepFlag, b: &Evr) -> bool {
    match a.compare_for_deps(b) {
        Ordering::Less => a_flag.greater() || b_flag.less(),
        Ordering::Greater => a_flag.less() || b_flag.greater(),
        Ordering::Equal => {
            (a_flag.equal() && b_flag.equal())
                || (a_flag.less() && b_flag.less())
                || (a_flag.greater() && b_flag.greater())
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.evr {
            Some(evr) if self.flag != DepFlag::Any => {
                write!(f, "{} {} {}", self.name, self.flag.as_operator(), evr)
            }
            _ => write!(f, "{}", self.name),
        }
    }
}
