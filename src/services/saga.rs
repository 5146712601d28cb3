//! Ordered compensations for multi-step writes.
//!
//! Each completed step registers an undo action. If a later step fails the
//! caller runs [`Saga::compensate`], which executes the undos newest first.
//! A failed undo is logged and reported but never stops the remaining ones.

use futures::future::BoxFuture;
use tracing::{debug, warn};

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub struct Saga {
    name: &'static str,
    completed: Vec<(&'static str, Undo)>,
}

/// An undo that could not be applied.
#[derive(Debug)]
pub struct CompensationFailure {
    pub step: &'static str,
    pub error: anyhow::Error,
}

impl Saga {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            completed: Vec::new(),
        }
    }

    /// Record that `step` finished and how to reverse it.
    pub fn completed<F>(&mut self, step: &'static str, undo: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        debug!(saga = self.name, step, "step completed");
        self.completed.push((step, Box::new(undo)));
    }

    /// All steps succeeded; drop the undo log.
    pub fn commit(self) {
        debug!(saga = self.name, steps = self.completed.len(), "saga committed");
    }

    /// Undo completed steps in reverse order.
    pub async fn compensate(self) -> Vec<CompensationFailure> {
        let mut failures = Vec::new();
        for (step, undo) in self.completed.into_iter().rev() {
            match undo().await {
                Ok(()) => debug!(saga = self.name, step, "step compensated"),
                Err(error) => {
                    warn!(saga = self.name, step, error = %error, "compensation failed");
                    failures.push(CompensationFailure { step, error });
                }
            }
        }
        failures
    }
}
