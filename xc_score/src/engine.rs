//! Contract with the external trajectory-scoring engine.
//!
//! The engine consumes a [`FlightLog`] plus a [`RuleTable`] and produces a
//! sequence of improving [`Solution`]s. It is driven one bounded step at a time
//! through a [`SolutionCursor`], so callers decide when to stop asking.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FlightLog, OptimizationOptions, RuleTable};

#[derive(Error, Debug, Clone, PartialEq)]
#[error("scoring engine failed: {message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Engine-side bounds for one invocation.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SolverOptions {
    /// Wall-clock budget per step, in milliseconds.
    pub max_cycle_ms: Option<u64>,
    /// Iteration budget for the whole run.
    pub max_loop: Option<u64>,
}

impl From<&OptimizationOptions> for SolverOptions {
    fn from(options: &OptimizationOptions) -> Self {
        Self {
            max_cycle_ms: options.max_cycle_duration_ms,
            max_loop: options.max_num_cycles,
        }
    }
}

/// Scoring type selected by the engine for a solution.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoringInfo {
    /// Circuit code: `od`, `tri`, `fai` or `oar`.
    pub code: String,
    pub multiplier: f64,
    /// Absolute closing threshold, km.
    #[serde(default)]
    pub closing_distance_fixed: Option<f64>,
    /// Closing threshold as a ratio of the achieved distance.
    #[serde(default)]
    pub closing_distance_relative: Option<f64>,
}

/// Points closing a triangle or out-and-return.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClosingPoints {
    /// Achieved closing distance, km.
    pub distance: f64,
    /// Engine index of the closing point entering the circuit.
    pub entry: usize,
    /// Engine index of the closing point leaving the circuit.
    pub exit: usize,
}

/// One candidate produced by the engine. Indices refer to the fixes of the
/// flight log the engine was given.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Solution {
    #[serde(default)]
    pub score: Option<f64>,
    /// Scored distance, km.
    #[serde(default)]
    pub distance: Option<f64>,
    pub scoring: ScoringInfo,
    #[serde(default)]
    pub closing: Option<ClosingPoints>,
    #[serde(default)]
    pub turnpoints: Vec<usize>,
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub finish: Option<usize>,
    #[serde(default)]
    pub optimal: Option<bool>,
}

/// A running search. Each call performs one bounded step.
pub trait SolutionCursor: Send {
    /// Returns the next improved solution, or `None` once the run is over.
    fn next_solution(&mut self) -> Result<Option<Solution>, EngineError>;
}

pub trait ScoringEngine: Send + Sync {
    fn run(
        &self,
        flight: FlightLog,
        rules: &'static RuleTable,
        options: SolverOptions,
    ) -> Result<Box<dyn SolutionCursor>, EngineError>;
}

/// Engine that replays previously recorded solutions, one per step. It performs
/// no search and ignores the flight log beyond checking it is not empty.
#[derive(Clone, Debug, Default)]
pub struct ReplayEngine {
    solutions: Vec<Solution>,
}

impl ReplayEngine {
    pub fn new(solutions: Vec<Solution>) -> Self {
        Self { solutions }
    }
}

impl ScoringEngine for ReplayEngine {
    fn run(
        &self,
        flight: FlightLog,
        _rules: &'static RuleTable,
        options: SolverOptions,
    ) -> Result<Box<dyn SolutionCursor>, EngineError> {
        if flight.fixes.is_empty() {
            return Err(EngineError::new("empty flight log"));
        }
        let limit = options
            .max_loop
            .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        Ok(Box::new(ReplayCursor {
            pending: self.solutions.clone().into_iter().take(limit),
        }))
    }
}

struct ReplayCursor {
    pending: std::iter::Take<std::vec::IntoIter<Solution>>,
}

impl SolutionCursor for ReplayCursor {
    fn next_solution(&mut self) -> Result<Option<Solution>, EngineError> {
        Ok(self.pending.next())
    }
}
