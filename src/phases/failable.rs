// src/phases/failable.rs

//! Failable deliverables
//!
//! A task for a (variant, arch, deliverable) that config marks as failable
//! turns its error into a warning plus a failure record in the image
//! manifest; other errors propagate.

use crate::compose::Compose;
use crate::error::{Error, Result};
use crate::manifest::FailedDeliverable;
use tracing::warn;

/// Run `task`; `Ok(None)` means it failed and was allowed to
pub fn run_failable<T, F>(
    compose: &Compose,
    variant: &str,
    arch: &str,
    deliverable: &str,
    task: F,
) -> Result<Option<T>>
where
    F: FnOnce() -> Result<T>,
{
    match task() {
        Ok(value) => Ok(Some(value)),
        Err(Error::Aborted(msg)) => Err(Error::Aborted(msg)),
        Err(e) if compose.config.is_failable(variant, arch, deliverable) => {
            warn!(
                "Failable deliverable {} for {}.{} failed: {}",
                deliverable, variant, arch, e
            );
            compose.record_failure(FailedDeliverable {
                variant: variant.to_string(),
                arch: arch.to_string(),
                deliverable: deliverable.to_string(),
                reason: e.to_string(),
            })?;
            Ok(None)
        }
        Err(e @ Error::DeliverableFailure(_)) => Err(e),
        Err(e) => Err(Error::DeliverableFailure(format!(
            "{} for {}.{}: {}",
            deliverable, variant, arch, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tests::test_compose;
    use crate::config::{Deliverables, Rule};

    #[test]
    fn test_failable_is_swallowed() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut compose = test_compose(dir.path());
        compose.config.failable_deliverables = vec![Rule {
            variant: "^Server$".to_string(),
            arch: "*".to_string(),
            value: Deliverables {
                deliverables: vec!["createiso".to_string()],
            },
        }];

        let out: Option<()> = run_failable(&compose, "Server", "x86_64", "createiso", || {
            Err(Error::ExternalTool("xorriso died".to_string()))
        })
        .unwrap();
        assert!(out.is_none());
        assert!(compose.is_incomplete());
        assert_eq!(compose.images().unwrap().failed_deliverables.len(), 1);

        let err = run_failable(&compose, "Server", "x86_64", "live_images", || -> Result<()> {
            Err(Error::ExternalTool("livecd-creator died".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::DeliverableFailure(_)));
    }

    #[test]
    fn test_success_passes_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let compose = test_compose(dir.path());
        let out = run_failable(&compose, "Server", "x86_64", "createiso", || Ok(5)).unwrap();
        assert_eq!(out, Some(5));
        assert!(!compose.is_incomplete());
    }
}
