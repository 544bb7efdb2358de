// src/notifier.rs

//! Compose event notifications
//!
//! Notifications are fire-and-forget: a failing script is logged and the
//! compose carries on.

use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

pub const STATUS_CHANGE: &str = "status-change";
pub const PHASE_START: &str = "phase-start";
pub const PHASE_STOP: &str = "phase-stop";
pub const COMPOSE_FINISHED: &str = "compose-finished";

pub trait Notifier: Send + Sync {
    fn send(&self, event: &str, payload: &Value);
}

/// Drops every event
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, event: &str, _payload: &Value) {
        debug!("Not sending {} notification", event);
    }
}

/// Runs `<script> <event>` with the JSON payload on stdin
#[derive(Debug, Clone)]
pub struct ScriptNotifier {
    script: PathBuf,
}

impl ScriptNotifier {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    fn run(&self, event: &str, payload: &Value) -> std::io::Result<std::process::ExitStatus> {
        let mut child = Command::new(&self.script)
            .arg(event)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.to_string().as_bytes())?;
        }
        child.wait()
    }
}

impl Notifier for ScriptNotifier {
    fn send(&self, event: &str, payload: &Value) {
        match self.run(event, payload) {
            Ok(status) if status.success() => debug!("Sent {} notification", event),
            Ok(status) => warn!(
                "Notification script {} failed for {}: {}",
                self.script.display(),
                event,
                status
            ),
            Err(e) => warn!(
                "Cannot run notification script {}: {}",
                self.script.display(),
                e
            ),
        }
    }
}
