//! Per-job result sink.

use std::collections::BTreeMap;
use std::time::Duration;

use common::{EngineError, StrategyTag};
use uuid::Uuid;

use crate::strategy::UpdateOutcome;

/// One object that could not be rotated.
#[derive(Debug)]
pub struct ObjectFailure {
    pub name: String,
    pub error: EngineError,
}

/// Summary of one rotation job.
#[derive(Debug)]
pub struct RotationReport {
    pub job_id: Uuid,
    pub strategy: StrategyTag,
    /// Objects in the job.
    pub total: usize,
    /// Objects whose update was started.
    pub dispatched: usize,
    /// Successful updates, by outcome.
    pub outcomes: BTreeMap<&'static str, usize>,
    pub failures: Vec<ObjectFailure>,
    /// Dispatch stopped early on cancellation.
    pub cancelled: bool,
    pub duration: Duration,
}

impl RotationReport {
    pub(crate) fn new(job_id: Uuid, strategy: StrategyTag, total: usize) -> Self {
        Self {
            job_id,
            strategy,
            total,
            dispatched: 0,
            outcomes: BTreeMap::new(),
            failures: Vec::new(),
            cancelled: false,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn record(&mut self, name: String, result: Result<UpdateOutcome, EngineError>) {
        match result {
            Ok(outcome) => *self.outcomes.entry(outcome.as_str()).or_default() += 1,
            Err(error) => self.failures.push(ObjectFailure { name, error }),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().sum()
    }

    /// Objects that were never dispatched because the job was cancelled.
    pub fn skipped(&self) -> usize {
        self.total.saturating_sub(self.dispatched)
    }

    /// `Ok` only if every object in the job was rotated.
    ///
    /// # Errors
    ///
    /// [`EngineError::PartialRotationFailure`] counting failed and skipped
    /// objects.
    pub fn into_result(self) -> Result<Self, EngineError> {
        let failed = self.failures.len() + self.skipped();
        if failed > 0 {
            return Err(EngineError::PartialRotationFailure {
                failed,
                total: self.total,
            });
        }
        Ok(self)
    }
}
