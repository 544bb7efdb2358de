// src/phases/engine.rs

//! Phase engine
//!
//! Runs a `Schema`: serial steps one after another, parallel branches on
//! scoped threads. A failing phase cancels the compose so other branches stop
//! before their next phase.

use super::Phase;
use crate::compose::Compose;
use crate::error::{Error, Result};
use crate::notifier::{PHASE_START, PHASE_STOP};
use serde_json::json;
use std::thread;
use tracing::debug;

/// Declarative pipeline
pub enum Schema {
    Phase(Box<Phase>),
    Serial(Vec<Schema>),
    Parallel(Vec<Schema>),
}

impl Schema {
    pub fn phases(&self) -> Vec<&Phase> {
        match self {
            Schema::Phase(phase) => vec![phase.as_ref()],
            Schema::Serial(steps) | Schema::Parallel(steps) => {
                steps.iter().flat_map(Schema::phases).collect()
            }
        }
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases().into_iter().map(|p| p.name.as_str()).collect()
    }
}

pub struct PhaseEngine<'a> {
    compose: &'a Compose,
}

impl<'a> PhaseEngine<'a> {
    pub fn new(compose: &'a Compose) -> Self {
        Self { compose }
    }

    /// Validate every phase that is going to run
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        let mut problems = Vec::new();
        for phase in schema.phases() {
            if phase.skip_reason(self.compose).is_some() {
                continue;
            }
            if let Err(e) = phase.validate(self.compose) {
                problems.push(format!("{}: {}", phase.name, e));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    pub fn run(&self, schema: &Schema) -> Result<()> {
        match schema {
            Schema::Phase(phase) => self.run_phase(phase),
            Schema::Serial(steps) => {
                for step in steps {
                    self.run(step)?;
                }
                Ok(())
            }
            Schema::Parallel(branches) => {
                let results: Vec<Result<()>> = thread::scope(|scope| {
                    let handles: Vec<_> = branches
                        .iter()
                        .map(|branch| scope.spawn(move || self.run(branch)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| {
                            h.join().unwrap_or_else(|_| {
                                self.compose.cancel.cancel();
                                Err(Error::Aborted("a pipeline thread panicked".to_string()))
                            })
                        })
                        .collect()
                });
                first_error(results)
            }
        }
    }

    fn run_phase(&self, phase: &Phase) -> Result<()> {
        let span = phase.logger.span();
        let _guard = span.enter();

        if let Some(reason) = phase.skip_reason(self.compose) {
            phase.logger.skip(&reason);
            return Ok(());
        }
        self.compose.cancel.check()?;

        self.compose
            .notify(PHASE_START, &json!({ "phase_name": phase.name }));
        phase.logger.begin();
        let outcome = phase.run(self.compose).and_then(|()| phase.stop(self.compose));
        match outcome {
            Ok(()) => {
                phase.logger.done();
                self.compose
                    .notify(PHASE_STOP, &json!({ "phase_name": phase.name }));
                Ok(())
            }
            Err(e) => {
                phase.logger.fail(&e);
                self.compose.cancel.cancel();
                Err(e)
            }
        }
    }
}

/// The first real failure; `Aborted` only when nothing else failed
fn first_error(results: Vec<Result<()>>) -> Result<()> {
    let mut aborted = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::Aborted(msg)) => {
                debug!("Branch aborted: {}", msg);
                aborted.get_or_insert(Error::Aborted(msg));
            }
            Err(e) => return Err(e),
        }
    }
    match aborted {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
