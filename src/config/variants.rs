// src/config/variants.rs

//! Variants tree
//!
//! Variants are parsed from `variants.xml` into an arena: every variant has a
//! numeric `VariantId`, its parent is an `Option<VariantId>` and its children
//! a `Vec<VariantId>`. All traversals go through `VariantTree`.

use crate::arch;
use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Index of a variant in its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariantType {
    Variant,
    Addon,
    LayeredProduct,
    Optional,
}

impl VariantType {
    /// Gather processing order
    pub const ORDER: [VariantType; 4] = [
        VariantType::Variant,
        VariantType::Addon,
        VariantType::LayeredProduct,
        VariantType::Optional,
    ];

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "variant" => Ok(VariantType::Variant),
            "addon" => Ok(VariantType::Addon),
            "layered-product" => Ok(VariantType::LayeredProduct),
            "optional" => Ok(VariantType::Optional),
            other => Err(Error::Config(format!("Unknown variant type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantType::Variant => "variant",
            VariantType::Addon => "addon",
            VariantType::LayeredProduct => "layered-product",
            VariantType::Optional => "optional",
        }
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of a comps group enters the seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Mandatory and default packages
    #[default]
    Default,
    /// Optional packages only
    Optional,
    /// Mandatory, default and optional packages
    All,
}

impl GroupPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(GroupPolicy::Default),
            "optional" => Ok(GroupPolicy::Optional),
            "all" => Ok(GroupPolicy::All),
            other => Err(Error::Config(format!("Unknown group policy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub name: String,
    pub policy: GroupPolicy,
    /// Marked default in the variant's filtered comps
    pub default: bool,
    pub uservisible: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub name: String,
    pub display_order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Unique id; children carry their parent's uid as prefix
    pub uid: String,
    /// `uid` with dashes removed
    pub id: String,
    /// The id attribute as written in the variants file
    pub local_id: String,
    pub name: String,
    pub kind: VariantType,
    pub arches: Vec<String>,
    pub parent: Option<VariantId>,
    pub children: Vec<VariantId>,
    pub groups: Vec<GroupRef>,
    pub environments: Vec<EnvironmentRef>,
    pub modules: Vec<String>,
    pub is_empty: bool,
}

impl Variant {
    pub fn has_arch(&self, arch: &str) -> bool {
        self.arches.iter().any(|a| a == arch)
    }
}

/// Arena of variants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantTree {
    variants: Vec<Variant>,
}

impl VariantTree {
    /// Load and parse a variants file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InputNotFound(format!("Cannot read variants file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse a variants XML document
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut tree = VariantTree::default();
        let mut buf = Vec::new();
        // Open <variant> elements, innermost last
        let mut open: Vec<VariantId> = Vec::new();
        let mut current_tag = String::new();
        let mut pending_group: Option<GroupRef> = None;
        let mut pending_env: Option<EnvironmentRef> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match tag.as_str() {
                        "variant" => {
                            let id = tree.open_variant(&e, open.last().copied())?;
                            open.push(id);
                        }
                        "group" => pending_group = Some(group_ref(&e)?),
                        "environment" => pending_env = Some(environment_ref(&e)),
                        _ => {}
                    }
                    current_tag = tag;
                }
                Ok(Event::Empty(e)) if e.name().as_ref() == b"variant" => {
                    tree.open_variant(&e, open.last().copied())?;
                }
                Ok(Event::Text(e)) => {
                    let text = e
                        .unescape()
                        .map_err(|err| Error::ParseError(format!("Bad text in variants file: {}", err)))?
                        .trim()
                        .to_string();
                    let Some(&current) = open.last() else {
                        continue;
                    };
                    let variant = &mut tree.variants[current.0];
                    match current_tag.as_str() {
                        "arch" => variant.arches.push(text),
                        "group" => {
                            if let Some(mut group) = pending_group.take() {
                                group.name = text;
                                variant.groups.push(group);
                            }
                        }
                        "environment" => {
                            if let Some(mut env) = pending_env.take() {
                                env.name = text;
                                variant.environments.push(env);
                            }
                        }
                        "module" => variant.modules.push(text),
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"variant" {
                        open.pop();
                    }
                    current_tag.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::ParseError(format!(
                        "Failed to parse variants file: {}",
                        e
                    )));
                }
                _ => {}
            }
            buf.clear();
        }

        tree.inherit_arches();
        tree.check_structure()?;
        debug!("Parsed {} variants", tree.variants.len());
        Ok(tree)
    }

    fn open_variant(&mut self, e: &BytesStart<'_>, parent: Option<VariantId>) -> Result<VariantId> {
        let local_id = attr(e, b"id")
            .ok_or_else(|| Error::Config("Variant without id attribute".to_string()))?;
        let kind = VariantType::parse(&attr(e, b"type").unwrap_or_else(|| "variant".to_string()))?;
        let name = attr(e, b"name").unwrap_or_else(|| local_id.clone());
        let is_empty = attr(e, b"is_empty").is_some_and(|v| v == "true");

        let uid = match parent {
            Some(p) => format!("{}-{}", self.variants[p.0].uid, local_id),
            None => local_id.clone(),
        };
        let id = VariantId(self.variants.len());
        self.variants.push(Variant {
            id: uid.replace('-', ""),
            uid,
            local_id,
            name,
            kind,
            arches: Vec::new(),
            parent,
            children: Vec::new(),
            groups: Vec::new(),
            environments: Vec::new(),
            modules: Vec::new(),
            is_empty,
        });
        if let Some(p) = parent {
            self.variants[p.0].children.push(id);
        }
        Ok(id)
    }

    /// Children without an explicit arch list take their parent's
    fn inherit_arches(&mut self) {
        for idx in 0..self.variants.len() {
            if self.variants[idx].arches.is_empty()
                && let Some(parent) = self.variants[idx].parent
            {
                self.variants[idx].arches = self.variants[parent.0].arches.clone();
            }
            self.variants[idx].arches.sort();
            self.variants[idx].arches.dedup();
        }
    }

    /// Structural invariants that hold regardless of configuration
    fn check_structure(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut seen = BTreeSet::new();
        for v in &self.variants {
            if !seen.insert(v.uid.as_str()) {
                problems.push(format!("Duplicate variant uid {}", v.uid));
            }
            match (v.kind, v.parent) {
                (VariantType::Variant, Some(_)) => {
                    problems.push(format!("Variant {} of type variant cannot have a parent", v.uid));
                }
                (kind, None) if kind != VariantType::Variant => {
                    problems.push(format!("Variant {} of type {} needs a parent", v.uid, kind));
                }
                _ => {}
            }
            if let Some(parent) = v.parent {
                let parent = &self.variants[parent.0];
                for a in &v.arches {
                    if !parent.has_arch(a) {
                        problems.push(format!(
                            "Variant {} has arch {} which its parent {} lacks",
                            v.uid, a, parent.uid
                        ));
                    }
                }
            }
            for a in &v.arches {
                if !arch::is_valid_tree_arch(a) {
                    problems.push(format!("Variant {} has unknown arch {}", v.uid, a));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Restrict the tree to the given arches and variants (empty = all).
    /// Variants left with no arch are dropped together with their children.
    pub fn restrict(&self, tree_arches: &[String], tree_variants: &[String]) -> Self {
        let mut keep = vec![false; self.variants.len()];
        for (idx, v) in self.variants.iter().enumerate() {
            let root_uid = self.root_of(VariantId(idx)).uid.clone();
            let variant_ok = tree_variants.is_empty() || tree_variants.contains(&root_uid);
            let arch_ok = tree_arches.is_empty() || v.arches.iter().any(|a| tree_arches.contains(a));
            let parent_ok = v.parent.is_none_or(|p| keep[p.0]);
            keep[idx] = variant_ok && arch_ok && parent_ok;
        }

        let mut remap = vec![None; self.variants.len()];
        let mut variants = Vec::new();
        for (idx, v) in self.variants.iter().enumerate() {
            if !keep[idx] {
                continue;
            }
            remap[idx] = Some(VariantId(variants.len()));
            let mut v = v.clone();
            if !tree_arches.is_empty() {
                v.arches.retain(|a| tree_arches.contains(a));
            }
            variants.push(v);
        }
        for v in &mut variants {
            v.parent = v.parent.and_then(|p| remap[p.0]);
            v.children = v.children.iter().filter_map(|c| remap[c.0]).collect();
        }
        Self { variants }
    }

    fn root_of(&self, mut id: VariantId) -> &Variant {
        while let Some(parent) = self.variants[id.0].parent {
            id = parent;
        }
        &self.variants[id.0]
    }

    /// Check that every variant arch is a compose arch
    pub fn validate_arches(&self, compose_arches: &[String]) -> Result<()> {
        let problems: Vec<String> = self
            .variants
            .iter()
            .flat_map(|v| {
                v.arches
                    .iter()
                    .filter(|a| !compose_arches.contains(a))
                    .map(move |a| format!("Variant {} uses arch {} outside the compose", v.uid, a))
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    pub fn get(&self, id: VariantId) -> &Variant {
        &self.variants[id.0]
    }

    pub fn by_uid(&self, uid: &str) -> Option<VariantId> {
        self.variants
            .iter()
            .position(|v| v.uid == uid)
            .map(VariantId)
    }

    pub fn parent(&self, id: VariantId) -> Option<&Variant> {
        self.variants[id.0].parent.map(|p| &self.variants[p.0])
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// All variant ids, sorted by uid
    pub fn ids(&self) -> Vec<VariantId> {
        let mut ids: Vec<VariantId> = (0..self.variants.len()).map(VariantId).collect();
        ids.sort_by(|a, b| self.variants[a.0].uid.cmp(&self.variants[b.0].uid));
        ids
    }

    /// Variants of one type, sorted by uid
    pub fn of_type(&self, kind: VariantType) -> Vec<VariantId> {
        self.ids()
            .into_iter()
            .filter(|id| self.variants[id.0].kind == kind)
            .collect()
    }

    /// Siblings of an optional variant that are addons or layered products
    pub fn layered_siblings(&self, id: VariantId) -> Vec<VariantId> {
        let Some(parent) = self.variants[id.0].parent else {
            return Vec::new();
        };
        self.variants[parent.0]
            .children
            .iter()
            .copied()
            .filter(|c| {
                *c != id
                    && matches!(
                        self.variants[c.0].kind,
                        VariantType::Addon | VariantType::LayeredProduct
                    )
            })
            .collect()
    }

    /// Every arch used by any variant
    pub fn all_arches(&self) -> Vec<String> {
        let arches: BTreeSet<&String> = self.variants.iter().flat_map(|v| &v.arches).collect();
        arches.into_iter().cloned().collect()
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

fn group_ref(e: &BytesStart<'_>) -> Result<GroupRef> {
    Ok(GroupRef {
        name: String::new(),
        policy: attr(e, b"policy")
            .map(|p| GroupPolicy::parse(&p))
            .transpose()?
            .unwrap_or_default(),
        default: attr(e, b"default").is_some_and(|v| v == "true"),
        uservisible: attr(e, b"uservisible").map(|v| v == "true"),
    })
}

fn environment_ref(e: &BytesStart<'_>) -> EnvironmentRef {
    EnvironmentRef {
        name: String::new(),
        display_order: attr(e, b"display_order").and_then(|v| v.parse().ok()),
    }
}
