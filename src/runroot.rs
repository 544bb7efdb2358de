// src/runroot.rs

//! Runroot executors
//!
//! External tools (createrepo, image builders) run through a `Runroot`: on
//! the local host, on a pool of SSH builders, or as Koji runroot tasks. A
//! non-zero exit is an `ExternalTool` error pointing at the task log.

use crate::config::{Config, RunrootMethod};
use crate::error::{Error, Result};
use crate::pkgset::koji::{KojiSession, RunrootTask};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default attempts for retried external calls
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// One command to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunrootRequest {
    pub command: String,
    pub arch: String,
    /// Packages the buildroot needs installed
    pub packages: Vec<String>,
    /// Paths that must be visible to the command
    pub mounts: Vec<PathBuf>,
    pub weight: Option<u32>,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunrootOutput {
    pub task_id: Option<i64>,
}

pub trait Runroot: Send + Sync {
    fn run(&self, request: &RunrootRequest) -> Result<RunrootOutput>;

    /// Cancel outstanding tasks, where the back-end supports it
    fn cancel_all(&self) {}
}

fn open_log(request: &RunrootRequest) -> Result<File> {
    if let Some(parent) = request.log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(&request.log_file).map_err(|e| {
        Error::IoError(format!(
            "Cannot create log file {}: {}",
            request.log_file.display(),
            e
        ))
    })
}

fn run_logged(mut command: Command, request: &RunrootRequest, what: &str) -> Result<RunrootOutput> {
    let log = open_log(request)?;
    let err_log = log.try_clone()?;
    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err_log))
        .status()
        .map_err(|e| Error::ExternalTool(format!("Cannot start {}: {}", what, e)))?;
    if status.success() {
        Ok(RunrootOutput { task_id: None })
    } else {
        Err(Error::ExternalTool(format!(
            "{} failed with {}, see {}",
            what,
            status,
            request.log_file.display()
        )))
    }
}

/// Runs commands with `sh -c` on this host
#[derive(Debug, Default)]
pub struct LocalRunroot;

impl Runroot for LocalRunroot {
    fn run(&self, request: &RunrootRequest) -> Result<RunrootOutput> {
        debug!("Running locally: {}", request.command);
        let mut command = Command::new("sh");
        command.arg("-c").arg(&request.command);
        run_logged(command, request, &request.command)
    }
}

/// Round-robin over pre-provisioned builders reachable with `ssh`
#[derive(Debug)]
pub struct SshRunroot {
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl SshRunroot {
    pub fn new(hosts: Vec<String>) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::Config(
                "runroot_method = \"ssh\" needs runroot_ssh_hosts".to_string(),
            ));
        }
        Ok(Self {
            hosts,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        &self.hosts[idx]
    }
}

impl Runroot for SshRunroot {
    fn run(&self, request: &RunrootRequest) -> Result<RunrootOutput> {
        let host = self.pick();
        info!("Running on {}: {}", host, request.command);
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(host)
            .arg(&request.command);
        run_logged(command, request, &format!("ssh {}", host))
    }
}

/// Submits Koji runroot tasks and waits for them
pub struct KojiRunroot {
    session: Arc<dyn KojiSession>,
    tag: String,
    channel: Option<String>,
    running: Mutex<BTreeSet<i64>>,
}

impl KojiRunroot {
    pub fn new(session: Arc<dyn KojiSession>, tag: String, channel: Option<String>) -> Self {
        Self {
            session,
            tag,
            channel,
            running: Mutex::new(BTreeSet::new()),
        }
    }

    fn track(&self, task_id: i64, running: bool) {
        if let Ok(mut tasks) = self.running.lock() {
            if running {
                tasks.insert(task_id);
            } else {
                tasks.remove(&task_id);
            }
        }
    }
}

impl Runroot for KojiRunroot {
    fn run(&self, request: &RunrootRequest) -> Result<RunrootOutput> {
        let task = RunrootTask {
            tag: self.tag.clone(),
            arch: request.arch.clone(),
            command: request.command.clone(),
            packages: request.packages.clone(),
            mounts: request
                .mounts
                .iter()
                .map(|m| m.to_string_lossy().into_owned())
                .collect(),
            weight: request.weight,
            channel: self.channel.clone(),
        };
        let task_id = self.session.runroot(&task)?;
        info!("Koji runroot task {} started for {}", task_id, request.arch);
        self.track(task_id, true);
        let outcome = self.session.watch_task(task_id);
        self.track(task_id, false);
        let outcome = outcome?;

        let mut log = open_log(request)?;
        writeln!(log, "task {}: {}", outcome.task_id, outcome.result)?;
        if outcome.succeeded {
            Ok(RunrootOutput {
                task_id: Some(task_id),
            })
        } else {
            Err(Error::ExternalTool(format!(
                "Koji runroot task {} failed: {}",
                task_id, outcome.result
            )))
        }
    }

    fn cancel_all(&self) {
        let tasks: Vec<i64> = match self.running.lock() {
            Ok(tasks) => tasks.iter().copied().collect(),
            Err(_) => return,
        };
        for task_id in tasks {
            match self.session.cancel_task(task_id) {
                Ok(()) => info!("Cancelled Koji task {}", task_id),
                Err(e) => warn!("Cannot cancel Koji task {}: {}", task_id, e),
            }
        }
    }
}

/// Quote one argument for `sh -c`
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Build the configured executor
pub fn from_config(config: &Config, koji: Option<Arc<dyn KojiSession>>) -> Result<Arc<dyn Runroot>> {
    match config.runroot_method {
        RunrootMethod::Local => Ok(Arc::new(LocalRunroot)),
        RunrootMethod::Ssh => Ok(Arc::new(SshRunroot::new(config.runroot_ssh_hosts.clone())?)),
        RunrootMethod::Koji => {
            let session = koji.ok_or_else(|| {
                Error::Config("runroot_method = \"koji\" needs koji_hub".to_string())
            })?;
            let tag = config.runroot_tag.clone().ok_or_else(|| {
                Error::Config("runroot_method = \"koji\" needs runroot_tag".to_string())
            })?;
            Ok(Arc::new(KojiRunroot::new(session, tag, config.runroot_channel.clone())))
        }
    }
}

/// Run `op` until it succeeds, retrying `ExternalTool` errors with
/// exponential backoff
pub fn with_retries<T, F>(attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(Error::ExternalTool(msg)) if attempt < attempts => {
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                warn!(
                    "Attempt {} of {} failed: {}, retrying in {:?}",
                    attempt, attempts, msg, delay
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
