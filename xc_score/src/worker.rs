//! Background scoring off the caller's thread.
//!
//! Each submitted request gets its own [`ScoreTask`]: a private channel whose
//! messages all carry the request id. Overlapping requests therefore never
//! share a callback slot, and dropping a task abandons only that request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::engine::ScoringEngine;
use crate::session::OptimizationSession;
use crate::{OptimizationRequest, OptimizationResult, ScoreError};

pub type RequestId = u64;

/// Request as posted by UI collaborators.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRequest {
    #[serde(flatten)]
    pub request: OptimizationRequest,
    pub league_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

#[derive(Debug)]
struct ScoreMessage {
    request_id: RequestId,
    event: ScoreEvent,
}

#[derive(Debug)]
enum ScoreEvent {
    Progress(OptimizationResult),
    Failed(ScoreError),
    Completed,
}

pub struct ScoreWorker<E> {
    engine: Arc<E>,
    pool: ThreadPool,
    next_id: AtomicU64,
}

impl<E: ScoringEngine + 'static> ScoreWorker<E> {
    pub fn new(engine: E, config: &WorkerConfig) -> Result<Self, ScoreError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .thread_name(|i| format!("xc-score-{i}"))
            .panic_handler(|_| error!("scoring job panicked"))
            .build()
            .map_err(|e| ScoreError::WorkerStart(e.to_string()))?;
        Ok(Self {
            engine: Arc::new(engine),
            pool,
            next_id: AtomicU64::new(1),
        })
    }

    /// Queues `request` and returns the handle its results arrive on.
    pub fn submit(&self, request: ScoreRequest) -> ScoreTask {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        self.pool
            .spawn(move || run_request(engine.as_ref(), id, &request, &sender));
        ScoreTask {
            id,
            receiver,
            done: false,
        }
    }
}

fn run_request<E: ScoringEngine + ?Sized>(
    engine: &E,
    id: RequestId,
    request: &ScoreRequest,
    sender: &Sender<ScoreMessage>,
) {
    let send = |event: ScoreEvent| {
        sender
            .send(ScoreMessage {
                request_id: id,
                event,
            })
            .is_ok()
    };

    let session = match OptimizationSession::start(engine, &request.request, &request.league_id) {
        Ok(session) => session,
        Err(err) => {
            send(ScoreEvent::Failed(err));
            return;
        }
    };

    for item in session {
        let event = match item {
            Ok(result) => ScoreEvent::Progress(result),
            Err(err) => ScoreEvent::Failed(err),
        };
        let failed = matches!(event, ScoreEvent::Failed(_));
        if !send(event) {
            debug!(request_id = id, "score request abandoned");
            return;
        }
        if failed {
            return;
        }
    }
    send(ScoreEvent::Completed);
}

/// Handle on one submitted request. Iterating yields its results in order;
/// dropping it cancels the request at the engine's next step.
pub struct ScoreTask {
    id: RequestId,
    receiver: Receiver<ScoreMessage>,
    done: bool,
}

impl ScoreTask {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Stops consuming results. Work already done is discarded.
    pub fn cancel(self) {
        debug!(request_id = self.id, "cancelling score request");
    }
}

impl Iterator for ScoreTask {
    type Item = Result<OptimizationResult, ScoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let message = match self.receiver.recv() {
            Ok(message) => message,
            Err(_) => {
                self.done = true;
                return Some(Err(ScoreError::WorkerClosed(self.id)));
            }
        };
        if message.request_id != self.id {
            self.done = true;
            error!(
                expected = self.id,
                received = message.request_id,
                "score result routed to the wrong request"
            );
            return Some(Err(ScoreError::WorkerClosed(self.id)));
        }
        match message.event {
            ScoreEvent::Progress(result) => Some(Ok(result)),
            ScoreEvent::Failed(err) => {
                self.done = true;
                Some(Err(err))
            }
            ScoreEvent::Completed => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EngineError, ReplayEngine, ScoringInfo, Solution, SolutionCursor, SolverOptions,
    };
    use crate::{FlightLog, RuleTable, ScoringTrack, TrackPoint};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn request(n: usize, league: &str) -> ScoreRequest {
        let points = (0..n)
            .map(|i| TrackPoint {
                lat: 45.0 + i as f64 * 0.01,
                lon: 6.0,
                alt: 1000.0,
                time_sec: i as f64 * 10.0,
            })
            .collect();
        ScoreRequest {
            request: OptimizationRequest {
                track: ScoringTrack::new(points, 0).unwrap(),
                options: None,
            },
            league_id: league.to_string(),
        }
    }

    fn candidate(score: f64, optimal: bool) -> Solution {
        Solution {
            score: Some(score),
            scoring: ScoringInfo {
                code: "od".to_string(),
                multiplier: 1.0,
                ..ScoringInfo::default()
            },
            start: Some(0),
            finish: Some(1),
            optimal: Some(optimal),
            ..Solution::default()
        }
    }

    #[test]
    fn test_task_streams_results() {
        let engine = ReplayEngine::new(vec![
            candidate(1.0, false),
            candidate(2.0, false),
            candidate(3.0, true),
        ]);
        let worker = ScoreWorker::new(engine, &WorkerConfig::default()).unwrap();
        let scores: Vec<f64> = worker
            .submit(request(6, "xc"))
            .map(|r| r.unwrap().score)
            .collect();
        assert_eq!(scores, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_overlapping_requests_keep_their_own_results() {
        let worker = ScoreWorker::new(
            ReplayEngine::new(vec![candidate(7.0, true)]),
            &WorkerConfig { threads: 2 },
        )
        .unwrap();
        let first = worker.submit(request(6, "fr"));
        let second = worker.submit(request(1, "fr"));
        assert_ne!(first.id(), second.id());

        // Consume the second before the first; nothing is lost or swapped.
        let second: Vec<_> = second.map(|r| r.unwrap()).collect();
        let first: Vec<_> = first.map(|r| r.unwrap()).collect();
        assert_eq!(second, vec![OptimizationResult::zero()]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].score, 7.0);
    }

    #[test]
    fn test_configuration_error_is_reported() {
        let worker = ScoreWorker::new(ReplayEngine::default(), &WorkerConfig::default()).unwrap();
        let results: Vec<_> = worker.submit(request(6, "zz")).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ScoreError::UnknownLeague(_))));
    }

    #[test]
    fn test_request_wire_shape() {
        let request: ScoreRequest = serde_json::from_str(
            r#"{
                "track": {
                    "points": [
                        {"lat": 45.0, "lon": 6.0, "alt": 900.0, "timeSec": 0.0},
                        {"lat": 45.1, "lon": 6.0, "alt": 950.0, "timeSec": 10.0},
                        {"lat": 45.2, "lon": 6.1, "alt": 1000.0, "timeSec": 20.0}
                    ],
                    "startTimeSec": 1700000000
                },
                "options": {"maxCycleDurationMs": 50, "maxNumCycles": 3},
                "leagueId": "fr"
            }"#,
        )
        .unwrap();
        assert_eq!(request.league_id, "fr");
        assert_eq!(request.request.track.len(), 3);
        assert_eq!(request.request.track.start_time_sec, 1_700_000_000);
        let options = request.request.options.unwrap();
        assert_eq!(options.max_cycle_duration_ms, Some(50));
        assert_eq!(options.max_num_cycles, Some(3));

        let backwards = serde_json::from_str::<ScoreRequest>(
            r#"{
                "track": {"points": [
                    {"lat": 45.0, "lon": 6.0, "alt": 0.0, "timeSec": 50.0},
                    {"lat": 45.1, "lon": 6.0, "alt": 0.0, "timeSec": 10.0},
                    {"lat": 45.2, "lon": 6.0, "alt": 0.0, "timeSec": 5.0}
                ]},
                "leagueId": "xc"
            }"#,
        );
        assert!(backwards.is_err());
    }

    /// Endless engine that counts steps; the first step waits on a barrier.
    struct EndlessEngine {
        steps: Arc<AtomicUsize>,
        barrier: Arc<Barrier>,
    }

    struct EndlessCursor {
        steps: Arc<AtomicUsize>,
        barrier: Option<Arc<Barrier>>,
    }

    impl ScoringEngine for EndlessEngine {
        fn run(
            &self,
            _flight: FlightLog,
            _rules: &'static RuleTable,
            _options: SolverOptions,
        ) -> Result<Box<dyn SolutionCursor>, EngineError> {
            Ok(Box::new(EndlessCursor {
                steps: Arc::clone(&self.steps),
                barrier: Some(Arc::clone(&self.barrier)),
            }))
        }
    }

    impl SolutionCursor for EndlessCursor {
        fn next_solution(&mut self) -> Result<Option<Solution>, EngineError> {
            if let Some(barrier) = self.barrier.take() {
                barrier.wait();
            }
            let step = self.steps.fetch_add(1, Ordering::SeqCst);
            Ok(Some(candidate(step as f64, false)))
        }
    }

    #[test]
    fn test_dropping_task_stops_the_run() {
        let steps = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let engine = EndlessEngine {
            steps: Arc::clone(&steps),
            barrier: Arc::clone(&barrier),
        };
        let worker = ScoreWorker::new(engine, &WorkerConfig::default()).unwrap();
        let task = worker.submit(request(6, "xc"));
        task.cancel();
        barrier.wait();

        // The job notices the closed channel on its first send and returns,
        // freeing the single pool thread for the next request.
        let (tx, rx) = mpsc::channel();
        worker.pool.spawn(move || {
            let _ = tx.send(());
        });
        rx.recv().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }
}
