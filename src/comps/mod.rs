// src/comps/mod.rs

//! Comps group and environment definitions
//!
//! The compose-wide comps document is parsed once; every (variant, arch)
//! gets a filtered copy that keeps only its groups and environments. The
//! filtered copy is written back as XML and used as the group file of the
//! variant's repository.

pub mod modules;

use crate::config::{GroupPolicy, Variant};
use crate::error::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

/// Role of a package inside a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageKind {
    Mandatory,
    Default,
    Optional,
    Conditional,
}

impl PackageKind {
    fn parse(s: &str) -> Self {
        match s {
            "mandatory" => PackageKind::Mandatory,
            "optional" => PackageKind::Optional,
            "conditional" => PackageKind::Conditional,
            _ => PackageKind::Default,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Mandatory => "mandatory",
            PackageKind::Default => "default",
            PackageKind::Optional => "optional",
            PackageKind::Conditional => "conditional",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPackage {
    pub name: String,
    pub kind: PackageKind,
    /// Trigger package of a conditional entry
    pub requires: Option<String>,
    /// Arches the entry is limited to (empty means all)
    pub arches: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub description: String,
    pub default: bool,
    pub uservisible: bool,
    pub arches: Vec<String>,
    pub packages: Vec<GroupPackage>,
}

impl Group {
    /// Packages of the group selected by a variant's inclusion policy
    pub fn packages_for(&self, policy: GroupPolicy) -> impl Iterator<Item = &GroupPackage> {
        self.packages.iter().filter(move |p| match (policy, p.kind) {
            (GroupPolicy::Default, PackageKind::Mandatory | PackageKind::Default) => true,
            (GroupPolicy::Optional, PackageKind::Optional) => true,
            (GroupPolicy::All, _) => true,
            (_, PackageKind::Conditional) => policy != GroupPolicy::Optional,
            _ => false,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub description: String,
    pub display_order: Option<u32>,
    pub groups: Vec<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    pub display_order: Option<u32>,
    pub groups: Vec<String>,
}

/// A comps document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comps {
    pub groups: BTreeMap<String, Group>,
    pub environments: Vec<Environment>,
    pub categories: Vec<Category>,
    /// Base package name → install pattern (`%s` is the locale)
    pub langpacks: BTreeMap<String, String>,
}

/// Element currently collecting text
enum Open {
    Group(Group),
    Environment(Environment),
    Category(Category),
}

impl Comps {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InputNotFound(format!("Cannot read comps file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut comps = Comps::default();
        let mut buf = Vec::new();
        let mut open: Option<Open> = None;
        let mut path: Vec<String> = Vec::new();
        let mut pending_req: Option<GroupPackage> = None;
        // Translated names and descriptions are skipped
        let mut translated = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    translated = attr(&e, b"xml:lang").is_some();
                    match tag.as_str() {
                        "group" => {
                            open = Some(Open::Group(Group {
                                uservisible: true,
                                arches: split_arches(attr(&e, b"arch")),
                                ..Default::default()
                            }))
                        }
                        "environment" => open = Some(Open::Environment(Environment::default())),
                        "category" => open = Some(Open::Category(Category::default())),
                        "packagereq" => {
                            pending_req = Some(GroupPackage {
                                name: String::new(),
                                kind: PackageKind::parse(attr(&e, b"type").as_deref().unwrap_or("default")),
                                requires: attr(&e, b"requires"),
                                arches: split_arches(attr(&e, b"arch")),
                            })
                        }
                        _ => {}
                    }
                    path.push(tag);
                }
                Ok(Event::Empty(e)) => {
                    if e.name().as_ref() == b"match"
                        && let (Some(name), Some(install)) = (attr(&e, b"name"), attr(&e, b"install"))
                    {
                        comps.langpacks.insert(name, install);
                    }
                }
                Ok(Event::Text(e)) => {
                    if translated {
                        continue;
                    }
                    let text = e
                        .unescape()
                        .map_err(|err| Error::ParseError(format!("Bad text in comps: {}", err)))?
                        .to_string();
                    let tag = path.last().map(String::as_str).unwrap_or("");
                    let parent = path.len().checked_sub(2).and_then(|i| path.get(i)).map(String::as_str);
                    match open.as_mut() {
                        Some(Open::Group(g)) => match tag {
                            "id" => g.id = text,
                            "name" => g.name = text,
                            "description" => g.description = text,
                            "default" => g.default = text == "true",
                            "uservisible" => g.uservisible = text == "true",
                            "packagereq" => {
                                if let Some(mut req) = pending_req.take() {
                                    req.name = text;
                                    g.packages.push(req);
                                }
                            }
                            _ => {}
                        },
                        Some(Open::Environment(env)) => match (tag, parent) {
                            ("id", _) => env.id = text,
                            ("name", _) => env.name = text,
                            ("description", _) => env.description = text,
                            ("display_order", _) => env.display_order = text.parse().ok(),
                            ("groupid", Some("grouplist")) => env.groups.push(text),
                            ("groupid", Some("optionlist")) => env.options.push(text),
                            _ => {}
                        },
                        Some(Open::Category(cat)) => match tag {
                            "id" => cat.id = text,
                            "name" => cat.name = text,
                            "description" => cat.description = text,
                            "display_order" => cat.display_order = text.parse().ok(),
                            "groupid" => cat.groups.push(text),
                            _ => {}
                        },
                        None => {}
                    }
                }
                Ok(Event::End(e)) => {
                    translated = false;
                    path.pop();
                    match e.name().as_ref() {
                        b"group" => {
                            if let Some(Open::Group(g)) = open.take() {
                                comps.groups.insert(g.id.clone(), g);
                            }
                        }
                        b"environment" => {
                            if let Some(Open::Environment(env)) = open.take() {
                                comps.environments.push(env);
                            }
                        }
                        b"category" => {
                            if let Some(Open::Category(cat)) = open.take() {
                                comps.categories.push(cat);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::ParseError(format!("Failed to parse comps: {}", e)));
                }
                _ => {}
            }
            buf.clear();
        }

        debug!(
            "Parsed comps: {} groups, {} environments",
            comps.groups.len(),
            comps.environments.len()
        );
        Ok(comps)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Copy restricted to one arch: arch-limited groups and entries of
    /// other arches are dropped
    pub fn for_arch(&self, arch: &str) -> Comps {
        let mut comps = self.clone();
        comps
            .groups
            .retain(|_, g| g.arches.is_empty() || g.arches.iter().any(|a| a == arch));
        for group in comps.groups.values_mut() {
            group
                .packages
                .retain(|p| p.arches.is_empty() || p.arches.iter().any(|a| a == arch));
        }
        comps
    }

    /// Copy restricted to a variant (call on an arch-filtered copy).
    ///
    /// Groups of the variant and `lookaside_groups` are kept, along with the
    /// `conflicts` placeholders. A group the variant lists but comps lacks is
    /// `Error::InputNotFound`.
    pub fn for_variant(
        &self,
        variant: &Variant,
        lookaside_groups: &BTreeSet<String>,
        filter_environments: bool,
    ) -> Result<Comps> {
        let conflicts_own = format!("conflicts-{}", variant.uid.to_lowercase());
        let wanted: BTreeSet<&str> = variant.groups.iter().map(|g| g.name.as_str()).collect();

        let missing: Vec<&str> = wanted
            .iter()
            .copied()
            .filter(|g| !self.groups.contains_key(*g))
            .collect();
        if !missing.is_empty() {
            return Err(Error::InputNotFound(format!(
                "Variant {} uses comps groups missing from comps: {}",
                variant.uid,
                missing.join(", ")
            )));
        }

        let mut comps = Comps {
            langpacks: self.langpacks.clone(),
            ..Default::default()
        };
        for (id, group) in &self.groups {
            let keep = wanted.contains(id.as_str())
                || lookaside_groups.contains(id)
                || id == "conflicts"
                || *id == conflicts_own;
            if !keep {
                continue;
            }
            let mut group = group.clone();
            if let Some(gref) = variant.groups.iter().find(|g| &g.name == id) {
                group.default = gref.default;
                if let Some(visible) = gref.uservisible {
                    group.uservisible = visible;
                }
            }
            comps.groups.insert(id.clone(), group);
        }

        let wanted_envs: BTreeSet<&str> = variant.environments.iter().map(|e| e.name.as_str()).collect();
        for env in &self.environments {
            if filter_environments && !wanted_envs.contains(env.id.as_str()) {
                continue;
            }
            if let Some(missing) = env.groups.iter().find(|g| !comps.groups.contains_key(*g)) {
                warn!(
                    "Dropping environment {} from {}: group {} is missing",
                    env.id, variant.uid, missing
                );
                continue;
            }
            let mut env = env.clone();
            env.options.retain(|g| comps.groups.contains_key(g));
            if let Some(order) = variant
                .environments
                .iter()
                .find(|e| e.name == env.id)
                .and_then(|e| e.display_order)
            {
                env.display_order = Some(order);
            }
            comps.environments.push(env);
        }

        for cat in &self.categories {
            let mut cat = cat.clone();
            cat.groups.retain(|g| comps.groups.contains_key(g));
            if !cat.groups.is_empty() {
                comps.categories.push(cat);
            }
        }
        Ok(comps)
    }

    /// Render the document as XML
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        write_comps(&mut writer, self)
            .map_err(|e| Error::IoError(format!("Failed to write comps: {}", e)))?;
        let mut xml = String::from_utf8(writer.into_inner())
            .map_err(|e| Error::ParseError(format!("Comps output is not UTF-8: {}", e)))?;
        xml.push('\n');
        Ok(xml)
    }

    /// Write the document to a file
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_xml()?)?;
        Ok(())
    }
}

fn write_comps(writer: &mut Writer<Vec<u8>>, comps: &Comps) -> quick_xml::Result<()> {
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("comps")))?;

    for group in comps.groups.values() {
        writer.write_event(Event::Start(BytesStart::new("group")))?;
        text_element(writer, "id", &group.id)?;
        text_element(writer, "name", &group.name)?;
        text_element(writer, "description", &group.description)?;
        text_element(writer, "default", if group.default { "true" } else { "false" })?;
        text_element(writer, "uservisible", if group.uservisible { "true" } else { "false" })?;
        writer.write_event(Event::Start(BytesStart::new("packagelist")))?;
        let mut packages = group.packages.clone();
        packages.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        for pkg in &packages {
            let mut element = writer
                .create_element("packagereq")
                .with_attribute(("type", pkg.kind.as_str()));
            if let Some(requires) = &pkg.requires {
                element = element.with_attribute(("requires", requires.as_str()));
            }
            element.write_text_content(BytesText::new(&pkg.name))?;
        }
        writer.write_event(Event::End(BytesEnd::new("packagelist")))?;
        writer.write_event(Event::End(BytesEnd::new("group")))?;
    }

    for env in &comps.environments {
        writer.write_event(Event::Start(BytesStart::new("environment")))?;
        text_element(writer, "id", &env.id)?;
        text_element(writer, "name", &env.name)?;
        text_element(writer, "description", &env.description)?;
        if let Some(order) = env.display_order {
            text_element(writer, "display_order", &order.to_string())?;
        }
        group_list(writer, "grouplist", &env.groups)?;
        group_list(writer, "optionlist", &env.options)?;
        writer.write_event(Event::End(BytesEnd::new("environment")))?;
    }

    for cat in &comps.categories {
        writer.write_event(Event::Start(BytesStart::new("category")))?;
        text_element(writer, "id", &cat.id)?;
        text_element(writer, "name", &cat.name)?;
        text_element(writer, "description", &cat.description)?;
        if let Some(order) = cat.display_order {
            text_element(writer, "display_order", &order.to_string())?;
        }
        group_list(writer, "grouplist", &cat.groups)?;
        writer.write_event(Event::End(BytesEnd::new("category")))?;
    }

    if !comps.langpacks.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("langpacks")))?;
        for (name, install) in &comps.langpacks {
            writer
                .create_element("match")
                .with_attribute(("install", install.as_str()))
                .with_attribute(("name", name.as_str()))
                .write_empty()?;
        }
        writer.write_event(Event::End(BytesEnd::new("langpacks")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("comps")))?;
    Ok(())
}

fn text_element(writer: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> quick_xml::Result<()> {
    writer
        .create_element(tag)
        .write_text_content(BytesText::new(text))?;
    Ok(())
}

fn group_list(writer: &mut Writer<Vec<u8>>, tag: &str, groups: &[String]) -> quick_xml::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    for group in groups {
        text_element(writer, "groupid", group)?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

fn split_arches(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split([',', ' '])
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariantTree;

    const COMPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<comps>
  <group>
    <id>core</id>
    <name>Core</name>
    <name xml:lang="cs">Jádro</name>
    <description>Smallest possible installation</description>
    <default>true</default>
    <uservisible>false</uservisible>
    <packagelist>
      <packagereq type="mandatory">dummy-bash</packagereq>
      <packagereq type="default">dummy-kernel</packagereq>
      <packagereq type="optional">dummy-lvm2</packagereq>
      <packagereq type="conditional" requires="dummy-lvm2">dummy-lvm2-libs</packagereq>
      <packagereq type="mandatory" arch="aarch64">dummy-grub2-efi</packagereq>
    </packagelist>
  </group>
  <group>
    <id>ha</id>
    <name>High Availability</name>
    <default>false</default>
    <packagelist>
      <packagereq type="mandatory">dummy-pacemaker</packagereq>
    </packagelist>
  </group>
  <group>
    <id>conflicts-server</id>
    <name>Conflicts</name>
    <packagelist/>
  </group>
  <environment>
    <id>minimal</id>
    <name>Minimal</name>
    <display_order>99</display_order>
    <grouplist><groupid>core</groupid></grouplist>
    <optionlist><groupid>ha</groupid></optionlist>
  </environment>
  <environment>
    <id>cluster</id>
    <name>Cluster</name>
    <grouplist><groupid>ha</groupid></grouplist>
  </environment>
  <category>
    <id>base</id>
    <name>Base</name>
    <grouplist><groupid>core</groupid><groupid>ha</groupid></grouplist>
  </category>
  <langpacks>
    <match name="dummy-release-notes" install="dummy-release-notes-%s"/>
  </langpacks>
</comps>
"#;

    const VARIANTS: &str = r#"<variants>
  <variant id="Server" name="Server" type="variant">
    <arches><arch>x86_64</arch><arch>aarch64</arch></arches>
    <groups><group default="true">core</group></groups>
    <environments><environment>minimal</environment><environment>cluster</environment></environments>
  </variant>
</variants>"#;

    #[test]
    fn test_parse() {
        let comps = Comps::parse(COMPS).unwrap();
        let core = comps.group("core").unwrap();
        assert_eq!(core.name, "Core");
        assert!(!core.uservisible);
        assert_eq!(core.packages.len(), 5);
        assert_eq!(core.packages[3].requires.as_deref(), Some("dummy-lvm2"));
        assert_eq!(comps.environments[0].options, vec!["ha"]);
        assert_eq!(comps.langpacks["dummy-release-notes"], "dummy-release-notes-%s");
    }

    #[test]
    fn test_policy_selection() {
        let comps = Comps::parse(COMPS).unwrap();
        let core = comps.group("core").unwrap();
        let names = |policy| -> Vec<String> {
            core.packages_for(policy).map(|p| p.name.clone()).collect()
        };
        assert_eq!(
            names(GroupPolicy::Default),
            vec!["dummy-bash", "dummy-kernel", "dummy-lvm2-libs", "dummy-grub2-efi"]
        );
        assert_eq!(names(GroupPolicy::Optional), vec!["dummy-lvm2"]);
        assert_eq!(names(GroupPolicy::All).len(), 5);
    }

    #[test]
    fn test_variant_filter() {
        let comps = Comps::parse(COMPS).unwrap().for_arch("x86_64");
        let tree = VariantTree::parse(VARIANTS).unwrap();
        let server = tree.get(tree.by_uid("Server").unwrap());
        let filtered = comps.for_variant(server, &BTreeSet::new(), true).unwrap();

        assert!(filtered.groups.contains_key("core"));
        assert!(filtered.groups.contains_key("conflicts-server"));
        assert!(!filtered.groups.contains_key("ha"));
        assert!(!filtered.group("core").unwrap().packages.iter().any(|p| p.name == "dummy-grub2-efi"));
        // cluster needs the dropped ha group
        assert_eq!(filtered.environments.len(), 1);
        assert!(filtered.environments[0].options.is_empty());
        assert_eq!(filtered.categories[0].groups, vec!["core"]);
    }

    #[test]
    fn test_missing_group_is_fatal() {
        let comps = Comps::parse(COMPS).unwrap();
        let tree = VariantTree::parse(&VARIANTS.replace(">core<", ">nonexistent<")).unwrap();
        let server = tree.get(tree.by_uid("Server").unwrap());
        assert!(matches!(
            comps.for_variant(server, &BTreeSet::new(), true),
            Err(Error::InputNotFound(_))
        ));
    }

    #[test]
    fn test_write_and_reparse() {
        let comps = Comps::parse(COMPS).unwrap().for_arch("x86_64");
        let xml = comps.to_xml().unwrap();
        assert!(xml.contains("<packagereq type=\"conditional\" requires=\"dummy-lvm2\">dummy-lvm2-libs</packagereq>"));
        let reparsed = Comps::parse(&xml).unwrap();
        assert_eq!(reparsed.groups.len(), comps.groups.len());
        assert_eq!(reparsed.langpacks, comps.langpacks);
    }
}
