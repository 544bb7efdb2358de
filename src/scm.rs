// src/scm.rs

//! Fetching files from source control
//!
//! Specs look like `file:<path>` or `git:<repo>#<ref>:<path>`. `cvs`, `rpm`
//! and `koji` specs parse too; they work once a provider for them is
//! registered.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScmKind {
    File,
    Git,
    Cvs,
    Rpm,
    Koji,
}

impl ScmKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(ScmKind::File),
            "git" => Some(ScmKind::Git),
            "cvs" => Some(ScmKind::Cvs),
            "rpm" => Some(ScmKind::Rpm),
            "koji" => Some(ScmKind::Koji),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScmKind::File => "file",
            ScmKind::Git => "git",
            ScmKind::Cvs => "cvs",
            ScmKind::Rpm => "rpm",
            ScmKind::Koji => "koji",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmSpec {
    pub kind: ScmKind,
    pub repo: Option<String>,
    pub reference: Option<String>,
    pub path: String,
}

impl ScmSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (kind, rest) = spec
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("SCM spec without a type: {}", spec)))?;
        let kind = ScmKind::parse(kind)
            .ok_or_else(|| Error::Config(format!("Unknown SCM type in {}", spec)))?;

        match rest.rsplit_once('#') {
            Some((repo, tail)) => {
                let (reference, path) = tail.split_once(':').ok_or_else(|| {
                    Error::Config(format!("SCM spec {} needs <ref>:<path> after #", spec))
                })?;
                Ok(Self {
                    kind,
                    repo: Some(repo.to_string()),
                    reference: Some(reference.to_string()),
                    path: path.to_string(),
                })
            }
            None if kind == ScmKind::File => Ok(Self {
                kind,
                repo: None,
                reference: None,
                path: rest.to_string(),
            }),
            None => Err(Error::Config(format!(
                "SCM spec {} needs <repo>#<ref>:<path>",
                spec
            ))),
        }
    }

    /// File name the fetched path gets
    pub fn file_name(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone())
    }
}

impl fmt::Display for ScmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.repo, &self.reference) {
            (Some(repo), Some(reference)) => {
                write!(f, "{}:{}#{}:{}", self.kind.as_str(), repo, reference, self.path)
            }
            _ => write!(f, "{}:{}", self.kind.as_str(), self.path),
        }
    }
}

pub trait ScmProvider: Send + Sync {
    /// Copy one file into `dest_dir`, returning its new path
    fn get_file(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf>;

    /// Copy a directory's content into `dest_dir`
    fn get_dir(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf>;

    /// Stable identity of what a spec points at, for reuse records
    fn resolve(&self, spec: &ScmSpec) -> Result<String> {
        Ok(spec.to_string())
    }
}

fn copy_file_into(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    if !src.is_file() {
        return Err(Error::InputNotFound(format!("SCM file {} not found", src.display())));
    }
    fs::create_dir_all(dest_dir)?;
    let name = src
        .file_name()
        .ok_or_else(|| Error::InputNotFound(format!("SCM path {} has no file name", src.display())))?;
    let dest = dest_dir.join(name);
    fs::copy(src, &dest)
        .map_err(|e| Error::IoError(format!("Failed to copy {}: {}", src.display(), e)))?;
    Ok(dest)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::InputNotFound(format!("SCM directory {} not found", src.display())));
    }
    fs::create_dir_all(dest)?;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| Error::IoError(format!("Cannot walk {}: {}", src.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(format!("{}: {}", entry.path().display(), e)))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|e| Error::IoError(format!("Failed to copy {}: {}", entry.path().display(), e)))?;
        }
    }
    Ok(())
}

/// Local files, relative paths resolved against a base directory
#[derive(Debug, Clone)]
pub struct FileScm {
    base: PathBuf,
}

impl FileScm {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn source(&self, spec: &ScmSpec) -> PathBuf {
        self.base.join(&spec.path)
    }
}

impl ScmProvider for FileScm {
    fn get_file(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf> {
        copy_file_into(&self.source(spec), dest_dir)
    }

    fn get_dir(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf> {
        copy_tree(&self.source(spec), dest_dir)?;
        Ok(dest_dir.to_path_buf())
    }
}

/// Shallow clones of git repositories
#[derive(Debug, Default, Clone)]
pub struct GitScm;

impl GitScm {
    fn git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let output = command
            .output()
            .map_err(|e| Error::ExternalTool(format!("Cannot run git: {}", e)))?;
        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn checkout(&self, spec: &ScmSpec) -> Result<TempDir> {
        let repo = spec
            .repo
            .as_deref()
            .ok_or_else(|| Error::Config(format!("git spec {} has no repository", spec)))?;
        let reference = spec.reference.as_deref().unwrap_or("HEAD");
        let tmp = TempDir::new()?;
        let dir = tmp.path().to_string_lossy().into_owned();

        info!("Cloning {} at {}", repo, reference);
        let shallow = Self::git(&["clone", "--depth", "1", "--branch", reference, repo, &dir], None);
        if let Err(e) = shallow {
            // Commit ids cannot be cloned by name
            debug!("Shallow clone failed ({}), cloning fully", e);
            Self::git(&["clone", repo, &dir], None)?;
            Self::git(&["checkout", reference], Some(tmp.path()))?;
        }
        Ok(tmp)
    }
}

impl ScmProvider for GitScm {
    fn get_file(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf> {
        let checkout = self.checkout(spec)?;
        copy_file_into(&checkout.path().join(&spec.path), dest_dir)
    }

    fn get_dir(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf> {
        let checkout = self.checkout(spec)?;
        copy_tree(&checkout.path().join(&spec.path), dest_dir)?;
        Ok(dest_dir.to_path_buf())
    }

    /// Turn the ref into a commit id with `git ls-remote`
    fn resolve(&self, spec: &ScmSpec) -> Result<String> {
        let (Some(repo), Some(reference)) = (&spec.repo, &spec.reference) else {
            return Ok(spec.to_string());
        };
        if reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(spec.to_string());
        }
        let out = Self::git(&["ls-remote", repo, reference], None)?;
        let commit = out
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::InputNotFound(format!("git ref {} not found in {}", reference, repo)))?;
        Ok(format!("git:{}#{}:{}", repo, commit, spec.path))
    }
}

/// Provider per SCM kind
pub struct ScmRegistry {
    providers: BTreeMap<ScmKind, Box<dyn ScmProvider>>,
}

impl ScmRegistry {
    /// `file` and `git` providers, files relative to `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let mut providers: BTreeMap<ScmKind, Box<dyn ScmProvider>> = BTreeMap::new();
        providers.insert(ScmKind::File, Box::new(FileScm::new(base)));
        providers.insert(ScmKind::Git, Box::new(GitScm));
        Self { providers }
    }

    pub fn register(&mut self, kind: ScmKind, provider: Box<dyn ScmProvider>) {
        self.providers.insert(kind, provider);
    }

    fn provider(&self, spec: &ScmSpec) -> Result<&dyn ScmProvider> {
        self.providers
            .get(&spec.kind)
            .map(|p| p.as_ref())
            .ok_or_else(|| {
                Error::ExternalTool(format!("No provider for {} SCM specs", spec.kind.as_str()))
            })
    }

    pub fn get_file(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf> {
        self.provider(spec)?.get_file(spec, dest_dir)
    }

    pub fn get_dir(&self, spec: &ScmSpec, dest_dir: &Path) -> Result<PathBuf> {
        self.provider(spec)?.get_dir(spec, dest_dir)
    }

    pub fn resolve(&self, spec: &ScmSpec) -> Result<String> {
        self.provider(spec)?.resolve(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_specs() {
        let file = ScmSpec::parse("file:extra/GPL").unwrap();
        assert_eq!(file.kind, ScmKind::File);
        assert_eq!(file.path, "extra/GPL");
        assert_eq!(file.file_name(), "GPL");

        let git = ScmSpec::parse("git:https://pagure.io/docs.git#main:legal/EULA").unwrap();
        assert_eq!(git.repo.as_deref(), Some("https://pagure.io/docs.git"));
        assert_eq!(git.reference.as_deref(), Some("main"));
        assert_eq!(git.path, "legal/EULA");
        assert_eq!(git.to_string(), "git:https://pagure.io/docs.git#main:legal/EULA");

        assert!(ScmSpec::parse("svn:foo").is_err());
        assert!(ScmSpec::parse("git:https://example.com/repo.git").is_err());
    }

    #[test]
    fn test_file_scm() {
        let base = TempDir::new().unwrap();
        fs::create_dir_all(base.path().join("extra/sub")).unwrap();
        fs::write(base.path().join("extra/GPL"), "license").unwrap();
        fs::write(base.path().join("extra/sub/README"), "readme").unwrap();
        let dest = TempDir::new().unwrap();

        let registry = ScmRegistry::new(base.path());
        let copied = registry
            .get_file(&ScmSpec::parse("file:extra/GPL").unwrap(), dest.path())
            .unwrap();
        assert_eq!(fs::read_to_string(copied).unwrap(), "license");

        registry
            .get_dir(&ScmSpec::parse("file:extra").unwrap(), &dest.path().join("tree"))
            .unwrap();
        assert!(dest.path().join("tree/sub/README").exists());

        let missing = registry.get_file(&ScmSpec::parse("file:nope").unwrap(), dest.path());
        assert!(matches!(missing, Err(Error::InputNotFound(_))));
    }

    #[test]
    fn test_copy_tree_skips_git_metadata() {
        let base = TempDir::new().unwrap();
        fs::create_dir_all(base.path().join("docs/.git/objects")).unwrap();
        fs::create_dir_all(base.path().join("docs/a/b")).unwrap();
        fs::write(base.path().join("docs/.git/HEAD"), "ref").unwrap();
        fs::write(base.path().join("docs/a/b/deep.txt"), "deep").unwrap();
        let dest = TempDir::new().unwrap();

        copy_tree(&base.path().join("docs"), dest.path()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("a/b/deep.txt")).unwrap(), "deep");
        assert!(!dest.path().join(".git").exists());
    }

    #[test]
    fn test_unregistered_kind() {
        let registry = ScmRegistry::new("/");
        let spec = ScmSpec::parse("cvs:/cvsroot#HEAD:file").unwrap();
        assert!(matches!(
            registry.get_file(&spec, Path::new("/tmp")),
            Err(Error::ExternalTool(_))
        ));
    }
}
