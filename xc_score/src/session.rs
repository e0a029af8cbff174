//! One optimization run, exposed as an iterator of improving results.
//!
//! The session is a plain cursor: every call to `next` performs one bounded
//! engine step and returns the decoded result. Nothing runs between calls, so
//! a caller cancels simply by not asking for more.

use std::iter::FusedIterator;
use std::mem;

use tracing::{debug, info, warn};

use crate::decode::decode_solution;
use crate::engine::{ScoringEngine, SolutionCursor, SolverOptions};
use crate::expand::{expand_track, IndexMapping};
use crate::rules::resolve_league;
use crate::{FlightLog, OptimizationRequest, OptimizationResult, ScoreError};

/// Iterator of decoded results for one request.
///
/// The stream ends after the first result with `optimal` set, after an error,
/// or when the engine stops producing solutions. In the last case, typically
/// an exhausted cycle budget, the final result may not be marked optimal.
pub struct OptimizationSession {
    state: State,
}

enum State {
    /// Track too short to score; a single zero result is pending.
    Degenerate,
    Running(Box<Run>),
    Finished,
}

struct Run {
    cursor: Box<dyn SolutionCursor>,
    mapping: IndexMapping,
    best_score: f64,
    steps: usize,
}

impl OptimizationSession {
    /// Prepares the track for `engine` and starts a run. Tracks with fewer than
    /// two points yield a single zero result without touching the engine.
    pub fn start<E: ScoringEngine + ?Sized>(
        engine: &E,
        request: &OptimizationRequest,
        league_id: &str,
    ) -> Result<Self, ScoreError> {
        let track = &request.track;
        if track.len() < 2 {
            warn!(points = track.len(), "track too short to score, returning zero score");
            return Ok(Self {
                state: State::Degenerate,
            });
        }

        track.validate()?;
        let rules = resolve_league(league_id)?;
        let expanded = expand_track(track);
        let flight = FlightLog::from(expanded.track.as_ref());
        let options = request
            .options
            .as_ref()
            .map(SolverOptions::from)
            .unwrap_or_default();

        debug!(
            league = league_id,
            rule_set = rules.rule_set,
            points = track.len(),
            fixes = flight.fixes.len(),
            ?options,
            "starting optimization"
        );
        let cursor = engine.run(flight, rules, options)?;

        Ok(Self {
            state: State::Running(Box::new(Run {
                cursor,
                mapping: expanded.mapping,
                best_score: f64::NEG_INFINITY,
                steps: 0,
            })),
        })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }
}

impl Run {
    fn step(&mut self) -> Result<Option<OptimizationResult>, ScoreError> {
        let Some(solution) = self.cursor.next_solution()? else {
            return Ok(None);
        };
        self.steps += 1;
        let result = decode_solution(&solution, &self.mapping)?;
        if !result.score.is_finite() {
            return Err(ScoreError::contract_violation(
                format!("score {} is not finite", result.score),
                &solution,
            ));
        }
        if result.score < self.best_score {
            return Err(ScoreError::contract_violation(
                format!(
                    "score decreased from {} to {}",
                    self.best_score, result.score
                ),
                &solution,
            ));
        }
        self.best_score = result.score;
        Ok(Some(result))
    }
}

impl Iterator for OptimizationSession {
    type Item = Result<OptimizationResult, ScoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match mem::replace(&mut self.state, State::Finished) {
            State::Finished => None,
            State::Degenerate => Some(Ok(OptimizationResult::zero())),
            State::Running(mut run) => match run.step() {
                Ok(Some(result)) => {
                    if result.optimal {
                        info!(
                            score = result.score,
                            steps = run.steps,
                            circuit = ?result.circuit,
                            "optimal solution found"
                        );
                    } else {
                        self.state = State::Running(run);
                    }
                    Some(Ok(result))
                }
                Ok(None) => {
                    debug!(steps = run.steps, "engine finished without an optimal solution");
                    None
                }
                Err(err) => Some(Err(err)),
            },
        }
    }
}

impl FusedIterator for OptimizationSession {}
