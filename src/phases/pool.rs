// src/phases/pool.rs

//! Intra-phase work pools
//!
//! A bounded rayon pool runs independent (variant, arch) tasks. Tasks check
//! the compose cancel token before starting; the first failure cancels the
//! rest.

use super::CancelToken;
use crate::error::{Error, Result};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::debug;

pub struct WorkPool {
    name: String,
    workers: usize,
    cancel: CancelToken,
    finished: Mutex<BTreeSet<String>>,
}

impl WorkPool {
    /// `workers == 0` means one per CPU
    pub fn new(name: &str, workers: usize, cancel: CancelToken) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };
        Self {
            name: name.to_string(),
            workers,
            cancel,
            finished: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` for every item; items are labelled for the finished set
    pub fn run<T, F>(&self, items: Vec<(String, T)>, task: F) -> Result<()>
    where
        T: Send + Sync,
        F: Fn(&T) -> Result<()> + Send + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Error::IoError(format!("Failed to start {} pool: {}", self.name, e)))?;

        let results: Vec<Result<()>> = pool.install(|| {
            items
                .par_iter()
                .map(|(label, item)| {
                    self.cancel.check()?;
                    debug!("{}: starting {}", self.name, label);
                    match task(item) {
                        Ok(()) => {
                            if let Ok(mut finished) = self.finished.lock() {
                                finished.insert(label.clone());
                            }
                            Ok(())
                        }
                        Err(e) => {
                            self.cancel.cancel();
                            Err(e)
                        }
                    }
                })
                .collect()
        });

        let mut aborted = None;
        for result in results {
            match result {
                Ok(()) => {}
                Err(Error::Aborted(msg)) => {
                    aborted.get_or_insert(Error::Aborted(msg));
                }
                Err(e) => return Err(e),
            }
        }
        aborted.map_or(Ok(()), Err)
    }

    /// Labels of tasks that completed
    pub fn finished(&self) -> BTreeSet<String> {
        self.finished.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_every_task() {
        let pool = WorkPool::new("test", 3, CancelToken::new());
        let counter = AtomicUsize::new(0);
        let items: Vec<(String, usize)> = (0..10).map(|i| (format!("task-{}", i), i)).collect();
        pool.run(items, |n| {
            counter.fetch_add(*n, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 45);
        assert_eq!(pool.finished().len(), 10);
    }

    #[test]
    fn test_failure_cancels() {
        let token = CancelToken::new();
        let pool = WorkPool::new("test", 1, token.clone());
        let items: Vec<(String, usize)> = (0..5).map(|i| (format!("task-{}", i), i)).collect();
        let err = pool
            .run(items, |n| {
                if *n == 0 {
                    Err(Error::ExternalTool("createrepo failed".to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
        assert!(token.is_cancelled());
        assert!(!pool.finished().contains("task-0"));
    }
}
