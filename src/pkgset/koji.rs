// src/pkgset/koji.rs

//! Koji build-system access
//!
//! `KojiSession` is the capability the compose needs from a Koji hub:
//! tag and build queries, module builds, runroot tasks and task watching.
//! `KojiHub` implements it over XML-RPC; `KojiProvider` turns tagged builds
//! into package records read from the Koji storage volume.

use crate::arch;
use crate::error::{Error, Result};
use crate::packages::{PackageRecord, RpmPackage};
use crate::pkgset::xmlrpc;
use crate::pkgset::{ModuleBuild, PackageProvider, SigkeyPolicy};
use crate::repository::{self, RepositoryClient};
use rayon::prelude::*;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between task state polls
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KojiTag {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub arches: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KojiBuild {
    pub build_id: i64,
    pub name: String,
    pub version: String,
    pub release: String,
    #[serde(default)]
    pub epoch: Option<u32>,
    pub nvr: String,
    #[serde(default)]
    pub extra: Option<Value>,
}

impl KojiBuild {
    /// Module metadata stored in the build's `extra.typeinfo.module`
    pub fn module_info(&self) -> Option<&Value> {
        self.extra.as_ref()?.get("typeinfo")?.get("module")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KojiRpm {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub release: String,
    #[serde(default)]
    pub epoch: Option<u32>,
    pub arch: String,
    pub build_id: i64,
}

impl KojiRpm {
    pub fn nvra(&self) -> String {
        format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KojiArchive {
    pub id: i64,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub type_name: Option<String>,
    pub build_id: i64,
}

/// Final state of a watched task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: i64,
    pub succeeded: bool,
    pub result: String,
}

/// A runroot task submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunrootTask {
    pub tag: String,
    pub arch: String,
    pub command: String,
    pub packages: Vec<String>,
    pub mounts: Vec<String>,
    pub weight: Option<u32>,
    pub channel: Option<String>,
}

/// Capability interface to a Koji hub
pub trait KojiSession: Send + Sync {
    fn get_tag(&self, tag: &str) -> Result<Option<KojiTag>>;
    fn list_tagged(&self, tag: &str, inherit: bool) -> Result<Vec<KojiBuild>>;
    fn get_build(&self, nvr: &str) -> Result<Option<KojiBuild>>;
    fn list_rpms(&self, build_id: i64) -> Result<Vec<KojiRpm>>;
    fn list_archives(&self, build_id: i64) -> Result<Vec<KojiArchive>>;

    /// Module builds tagged into a tag
    fn list_module_builds(&self, tag: &str) -> Result<Vec<KojiBuild>> {
        Ok(self
            .list_tagged(tag, false)?
            .into_iter()
            .filter(|b| b.module_info().is_some())
            .collect())
    }

    fn runroot(&self, task: &RunrootTask) -> Result<i64>;
    fn watch_task(&self, task_id: i64) -> Result<TaskOutcome>;
    fn cancel_task(&self, task_id: i64) -> Result<()>;
}

/// XML-RPC client for a Koji hub
pub struct KojiHub {
    url: String,
    client: Client,
    poll_interval: Duration,
}

impl KojiHub {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::ExternalTool(format!("Failed to create Koji client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
            poll_interval: TASK_POLL_INTERVAL,
        })
    }

    fn call(&self, method: &str, params: &[Value], kwargs: Option<Map<String, Value>>) -> Result<Value> {
        debug!("Koji call {}({:?})", method, params);
        let body = xmlrpc::encode_call(method, params, kwargs.as_ref());
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .map_err(|e| Error::ExternalTool(format!("Koji call {} failed: {}", method, e)))?;
        if !response.status().is_success() {
            return Err(Error::ExternalTool(format!(
                "Koji call {} returned HTTP {}",
                method,
                response.status()
            )));
        }
        let text = response
            .text()
            .map_err(|e| Error::ExternalTool(format!("Koji call {} failed: {}", method, e)))?;
        xmlrpc::decode_response(&text)
    }

    fn call_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &[Value],
        kwargs: Option<Map<String, Value>>,
    ) -> Result<T> {
        let value = self.call(method, params, kwargs)?;
        serde_json::from_value(value).map_err(|e| {
            Error::ParseError(format!("Unexpected reply to Koji call {}: {}", method, e))
        })
    }
}

fn kwargs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

impl KojiSession for KojiHub {
    fn get_tag(&self, tag: &str) -> Result<Option<KojiTag>> {
        self.call_typed("getTag", &[json!(tag)], None)
    }

    fn list_tagged(&self, tag: &str, inherit: bool) -> Result<Vec<KojiBuild>> {
        self.call_typed(
            "listTagged",
            &[json!(tag)],
            Some(kwargs(&[("inherit", json!(inherit)), ("latest", json!(true))])),
        )
    }

    fn get_build(&self, nvr: &str) -> Result<Option<KojiBuild>> {
        self.call_typed("getBuild", &[json!(nvr)], None)
    }

    fn list_rpms(&self, build_id: i64) -> Result<Vec<KojiRpm>> {
        self.call_typed("listRPMs", &[], Some(kwargs(&[("buildID", json!(build_id))])))
    }

    fn list_archives(&self, build_id: i64) -> Result<Vec<KojiArchive>> {
        self.call_typed("listArchives", &[], Some(kwargs(&[("buildID", json!(build_id))])))
    }

    fn runroot(&self, task: &RunrootTask) -> Result<i64> {
        let mut opts = kwargs(&[
            ("packages", json!(task.packages)),
            ("mounts", json!(task.mounts)),
        ]);
        if let Some(weight) = task.weight {
            opts.insert("weight".to_string(), json!(weight));
        }
        if let Some(channel) = &task.channel {
            opts.insert("channel".to_string(), json!(channel));
        }
        self.call_typed(
            "runroot",
            &[json!(task.tag), json!(task.arch), json!(task.command)],
            Some(opts),
        )
    }

    fn watch_task(&self, task_id: i64) -> Result<TaskOutcome> {
        loop {
            let info: Value = self.call("getTaskInfo", &[json!(task_id)], None)?;
            // 2 = CLOSED, 3 = CANCELED, 5 = FAILED
            match info.get("state").and_then(|s| s.as_i64()) {
                Some(2) => {
                    return Ok(TaskOutcome {
                        task_id,
                        succeeded: true,
                        result: "closed".to_string(),
                    });
                }
                Some(3) | Some(5) => {
                    let result = self
                        .call("getTaskResult", &[json!(task_id)], None)
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "failed".to_string());
                    return Ok(TaskOutcome {
                        task_id,
                        succeeded: false,
                        result,
                    });
                }
                _ => std::thread::sleep(self.poll_interval),
            }
        }
    }

    fn cancel_task(&self, task_id: i64) -> Result<()> {
        self.call("cancelTask", &[json!(task_id)], None)?;
        Ok(())
    }
}

/// Package provider backed by Koji tags, builds and module builds
pub struct KojiProvider {
    session: Arc<dyn KojiSession>,
    topdir: String,
    tags: Vec<String>,
    inherit: bool,
    builds: Vec<String>,
    sigkeys: SigkeyPolicy,
    download_dir: PathBuf,
    client: Option<RepositoryClient>,
    loaded: Mutex<Option<Loaded>>,
}

#[derive(Clone, Default)]
struct Loaded {
    records: Vec<PackageRecord>,
    modules: Vec<ModuleBuild>,
}

impl KojiProvider {
    pub fn new(
        session: Arc<dyn KojiSession>,
        topdir: impl Into<String>,
        tags: Vec<String>,
        inherit: bool,
        builds: Vec<String>,
        sigkeys: SigkeyPolicy,
        download_dir: &Path,
    ) -> Result<Self> {
        let topdir = topdir.into();
        let client = if repository::is_remote(&topdir) {
            Some(RepositoryClient::new()?)
        } else {
            None
        };
        Ok(Self {
            session,
            topdir,
            tags,
            inherit,
            builds,
            sigkeys,
            download_dir: download_dir.to_path_buf(),
            client,
            loaded: Mutex::new(None),
        })
    }

    /// Storage path of an RPM signed with `sigkey` (or the unsigned copy)
    pub fn rpm_location(topdir: &str, build: &KojiBuild, rpm: &KojiRpm, sigkey: Option<&str>) -> String {
        let base = format!(
            "{}/packages/{}/{}/{}",
            topdir.trim_end_matches('/'),
            build.name,
            build.version,
            build.release
        );
        match sigkey {
            Some(key) => format!("{}/data/signed/{}/{}/{}.rpm", base, key, rpm.arch, rpm.nvra()),
            None => format!("{}/{}/{}.rpm", base, rpm.arch, rpm.nvra()),
        }
    }

    fn builds_to_load(&self) -> Result<Vec<(KojiBuild, String)>> {
        let mut builds = Vec::new();
        for tag in &self.tags {
            if self.session.get_tag(tag)?.is_none() {
                return Err(Error::InputNotFound(format!("Koji tag {} does not exist", tag)));
            }
            let tagged = self.session.list_tagged(tag, self.inherit)?;
            info!("Koji tag {} has {} latest builds", tag, tagged.len());
            builds.extend(
                tagged
                    .into_iter()
                    .filter(|b| b.module_info().is_none())
                    .map(|b| (b, format!("koji:{}", tag))),
            );
        }
        for nvr in &self.builds {
            let build = self
                .session
                .get_build(nvr)?
                .ok_or_else(|| Error::InputNotFound(format!("Koji build {} does not exist", nvr)))?;
            builds.push((build, "koji:builds".to_string()));
        }
        Ok(builds)
    }

    /// Read the header of the first existing signed copy of an RPM
    fn read_rpm(&self, build: &KojiBuild, rpm: &KojiRpm, repo: &str) -> Result<PackageRecord> {
        let candidates: Vec<Option<String>> = if self.sigkeys.is_required() {
            self.sigkeys.keys().to_vec()
        } else {
            vec![None]
        };

        for sigkey in &candidates {
            let location = Self::rpm_location(&self.topdir, build, rpm, sigkey.as_deref());
            let local = if repository::is_remote(&location) {
                let Some(client) = self.client.as_ref() else {
                    continue;
                };
                let dest = self
                    .download_dir
                    .join(sigkey.as_deref().unwrap_or("unsigned"))
                    .join(format!("{}.rpm", rpm.nvra()));
                if !dest.exists() && client.download_file(&location, &dest).is_err() {
                    continue;
                }
                dest
            } else {
                let path = PathBuf::from(&location);
                if !path.exists() {
                    continue;
                }
                path
            };

            let mut record = RpmPackage::parse(&local, repo)?.into_record();
            if sigkey.is_some() {
                record.sigkey = sigkey.clone();
            }
            return Ok(record);
        }

        let message = format!("No copy of {} signed with {:?} in {}", rpm.nvra(), candidates, self.topdir);
        if self.sigkeys.is_required() {
            Err(Error::MissingSignature(message))
        } else {
            Err(Error::InputNotFound(message))
        }
    }

    fn load_module(&self, build: &KojiBuild, records: &mut Vec<PackageRecord>) -> Result<ModuleBuild> {
        let info = build
            .module_info()
            .ok_or_else(|| Error::InputNotFound(format!("{} is not a module build", build.nvr)))?;
        let field = |key: &str| info.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let version = info
            .get("version")
            .and_then(|v| v.as_str().map(|s| s.parse::<u64>().unwrap_or(0)).or_else(|| v.as_u64()))
            .unwrap_or(0);
        let content_tag = field("content_koji_tag");

        let mut module = ModuleBuild {
            name: field("name"),
            stream: field("stream"),
            version,
            context: field("context"),
            koji_tag: content_tag.clone(),
            modulemd: field("modulemd_str"),
            rpms: Vec::new(),
        };
        let nsvc = module.nsvc();

        let content = self.session.list_tagged(&content_tag, false)?;
        for content_build in content {
            for rpm in self.session.list_rpms(content_build.build_id)? {
                let mut record = self.read_rpm(&content_build, &rpm, &format!("koji:{}", content_tag))?;
                record.module = Some(nsvc.clone());
                module.rpms.push(record.nevra().to_string());
                records.push(record);
            }
        }
        module.rpms.sort();
        debug!("Module {} has {} RPMs", nsvc, module.rpms.len());
        Ok(module)
    }

    fn load(&self) -> Result<Loaded> {
        let mut guard = self
            .loaded
            .lock()
            .map_err(|_| Error::IoError("Koji provider lock poisoned".to_string()))?;
        if let Some(loaded) = guard.as_ref() {
            return Ok(loaded.clone());
        }

        let builds = self.builds_to_load()?;
        let mut work = Vec::new();
        for (build, repo) in &builds {
            for rpm in self.session.list_rpms(build.build_id)? {
                work.push((build, rpm, repo));
            }
        }

        let mut records = work
            .par_iter()
            .map(|(build, rpm, repo)| self.read_rpm(build, rpm, repo))
            .collect::<Result<Vec<_>>>()?;

        let mut modules = Vec::new();
        let mut seen = BTreeSet::new();
        for tag in &self.tags {
            for build in self.session.list_module_builds(tag)? {
                if seen.insert(build.build_id) {
                    modules.push(self.load_module(&build, &mut records)?);
                }
            }
        }

        let loaded = Loaded { records, modules };
        *guard = Some(loaded.clone());
        Ok(loaded)
    }
}

impl PackageProvider for KojiProvider {
    fn name(&self) -> &str {
        "koji"
    }

    fn list(&self, tree_arch: &str) -> Result<Vec<PackageRecord>> {
        let loaded = self.load()?;
        Ok(loaded
            .records
            .into_iter()
            .filter(|p| {
                if tree_arch == "src" {
                    p.is_source()
                } else {
                    arch::is_compatible(tree_arch, &p.arch)
                }
            })
            .collect())
    }

    fn fetch(&self, record: &PackageRecord) -> Result<PathBuf> {
        repository::fetch_package(record, &self.download_dir, self.client.as_ref())
    }

    fn module_builds(&self) -> Result<Vec<ModuleBuild>> {
        Ok(self.load()?.modules)
    }
}

/// Resolve module requests against the available builds.
///
/// `name:stream` is taken as given, a bare `name` uses the default stream.
/// Every context of the latest version of the stream is enabled.
pub fn resolve_modules<'a>(
    requests: &[String],
    available: &'a [ModuleBuild],
    defaults: &BTreeMap<String, String>,
) -> Result<Vec<&'a ModuleBuild>> {
    let mut enabled = Vec::new();
    for request in requests {
        let (name, stream) = match request.split_once(':') {
            Some((name, rest)) => (name, rest.split(':').next().unwrap_or(rest).to_string()),
            None => {
                let stream = defaults.get(request).cloned().ok_or_else(|| {
                    Error::InputNotFound(format!("Module {} has no default stream", request))
                })?;
                (request.as_str(), stream)
            }
        };

        let candidates: Vec<&ModuleBuild> = available
            .iter()
            .filter(|m| m.name == name && m.stream == stream)
            .collect();
        let Some(latest) = candidates.iter().map(|m| m.version).max() else {
            return Err(Error::InputNotFound(format!(
                "Module stream {}:{} does not exist",
                name, stream
            )));
        };
        for module in candidates.into_iter().filter(|m| m.version == latest) {
            if !enabled.iter().any(|m: &&ModuleBuild| m.nsvc() == module.nsvc()) {
                enabled.push(module);
            }
        }
    }
    if enabled.is_empty() && !requests.is_empty() {
        warn!("No module builds enabled for {:?}", requests);
    }
    Ok(enabled)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory hub used by tests
    #[derive(Default)]
    pub struct FakeKoji {
        pub tags: BTreeMap<String, Vec<KojiBuild>>,
        pub rpms: BTreeMap<i64, Vec<KojiRpm>>,
        pub cancelled: Mutex<Vec<i64>>,
        pub fail_tasks: bool,
    }

    impl KojiSession for FakeKoji {
        fn get_tag(&self, tag: &str) -> Result<Option<KojiTag>> {
            Ok(self.tags.contains_key(tag).then(|| KojiTag {
                id: 1,
                name: tag.to_string(),
                arches: None,
            }))
        }

        fn list_tagged(&self, tag: &str, _inherit: bool) -> Result<Vec<KojiBuild>> {
            Ok(self.tags.get(tag).cloned().unwrap_or_default())
        }

        fn get_build(&self, nvr: &str) -> Result<Option<KojiBuild>> {
            Ok(self.tags.values().flatten().find(|b| b.nvr == nvr).cloned())
        }

        fn list_rpms(&self, build_id: i64) -> Result<Vec<KojiRpm>> {
            Ok(self.rpms.get(&build_id).cloned().unwrap_or_default())
        }

        fn list_archives(&self, _build_id: i64) -> Result<Vec<KojiArchive>> {
            Ok(Vec::new())
        }

        fn runroot(&self, _task: &RunrootTask) -> Result<i64> {
            Ok(7)
        }

        fn watch_task(&self, task_id: i64) -> Result<TaskOutcome> {
            Ok(TaskOutcome {
                task_id,
                succeeded: !self.fail_tasks,
                result: String::new(),
            })
        }

        fn cancel_task(&self, task_id: i64) -> Result<()> {
            if let Ok(mut c) = self.cancelled.lock() {
                c.push(task_id);
            }
            Ok(())
        }
    }

    fn build(id: i64, name: &str) -> KojiBuild {
        KojiBuild {
            build_id: id,
            name: name.to_string(),
            version: "1.0".to_string(),
            release: "1".to_string(),
            epoch: None,
            nvr: format!("{}-1.0-1", name),
            extra: None,
        }
    }

    fn module(name: &str, stream: &str, version: u64, context: &str) -> ModuleBuild {
        ModuleBuild {
            name: name.to_string(),
            stream: stream.to_string(),
            version,
            context: context.to_string(),
            koji_tag: format!("module-{}", name),
            modulemd: String::new(),
            rpms: Vec::new(),
        }
    }

    #[test]
    fn test_rpm_location() {
        let b = build(1, "dummy-bash");
        let rpm = KojiRpm {
            id: 10,
            name: "dummy-bash".to_string(),
            version: "1.0".to_string(),
            release: "1".to_string(),
            epoch: None,
            arch: "x86_64".to_string(),
            build_id: 1,
        };
        assert_eq!(
            KojiProvider::rpm_location("/mnt/koji", &b, &rpm, None),
            "/mnt/koji/packages/dummy-bash/1.0/1/x86_64/dummy-bash-1.0-1.x86_64.rpm"
        );
        assert_eq!(
            KojiProvider::rpm_location("/mnt/koji/", &b, &rpm, Some("a15b79cc")),
            "/mnt/koji/packages/dummy-bash/1.0/1/data/signed/a15b79cc/x86_64/dummy-bash-1.0-1.x86_64.rpm"
        );
    }

    #[test]
    fn test_missing_tag_is_fatal() {
        let session = Arc::new(FakeKoji::default());
        let temp = tempfile::TempDir::new().unwrap();
        let provider = KojiProvider::new(
            session,
            "/mnt/koji",
            vec!["f99-build".to_string()],
            true,
            Vec::new(),
            SigkeyPolicy::default(),
            temp.path(),
        )
        .unwrap();
        assert!(matches!(provider.list("x86_64"), Err(Error::InputNotFound(_))));
    }

    #[test]
    fn test_missing_signed_copy_is_fatal() {
        let mut fake = FakeKoji::default();
        fake.tags.insert("f40".to_string(), vec![build(1, "dummy-bash")]);
        fake.rpms.insert(
            1,
            vec![KojiRpm {
                id: 10,
                name: "dummy-bash".to_string(),
                version: "1.0".to_string(),
                release: "1".to_string(),
                epoch: None,
                arch: "x86_64".to_string(),
                build_id: 1,
            }],
        );
        let temp = tempfile::TempDir::new().unwrap();
        let provider = KojiProvider::new(
            Arc::new(fake),
            temp.path().to_string_lossy(),
            vec!["f40".to_string()],
            false,
            Vec::new(),
            SigkeyPolicy::new(&["a15b79cc".to_string()]),
            temp.path(),
        )
        .unwrap();
        assert!(matches!(provider.list("x86_64"), Err(Error::MissingSignature(_))));
    }

    #[test]
    fn test_module_build_info() {
        let mut b = build(2, "nodejs");
        b.extra = Some(json!({"typeinfo": {"module": {"name": "nodejs", "stream": "12"}}}));
        assert!(b.module_info().is_some());
        assert!(build(3, "bash").module_info().is_none());
    }

    #[test]
    fn test_resolve_modules() {
        let available = vec![
            module("nodejs", "12", 1, "aaa"),
            module("nodejs", "12", 2, "bbb"),
            module("nodejs", "12", 2, "ccc"),
            module("nodejs", "14", 5, "ddd"),
        ];
        let mut defaults = BTreeMap::new();
        defaults.insert("nodejs".to_string(), "14".to_string());

        let enabled = resolve_modules(&["nodejs:12".to_string()], &available, &defaults).unwrap();
        let nsvcs: Vec<String> = enabled.iter().map(|m| m.nsvc()).collect();
        assert_eq!(nsvcs, vec!["nodejs:12:2:bbb", "nodejs:12:2:ccc"]);

        let enabled = resolve_modules(&["nodejs".to_string()], &available, &defaults).unwrap();
        assert_eq!(enabled[0].nsvc(), "nodejs:14:5:ddd");

        assert!(matches!(
            resolve_modules(&["nodejs:16".to_string()], &available, &defaults),
            Err(Error::InputNotFound(_))
        ));
        assert!(matches!(
            resolve_modules(&["perl".to_string()], &available, &defaults),
            Err(Error::InputNotFound(_))
        ));
    }
}
