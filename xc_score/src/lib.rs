//! Track optimization adapter for cross-country flight scoring.
//!
//! Reshapes a recorded track and a league ruleset into the input an external
//! trajectory-scoring engine expects, then decodes the engine's improving
//! solutions into stable results whose indices point into the original track.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod decode;
pub mod engine;
pub mod expand;
pub mod flight_log;
pub mod rules;
pub mod session;
pub mod worker;

pub use decode::decode_solution;
pub use engine::{
    ClosingPoints, EngineError, ReplayEngine, ScoringEngine, ScoringInfo, Solution,
    SolutionCursor, SolverOptions,
};
pub use expand::{expand_track, ExpandedTrack, IndexMapping, MIN_ENGINE_POINTS};
pub use flight_log::{Fix, FlightLog};
pub use rules::{resolve_league, League, RuleTable};
pub use session::OptimizationSession;
pub use worker::{RequestId, ScoreRequest, ScoreTask, ScoreWorker, WorkerConfig};

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("no scoring rules for league {0}")]
    UnknownLeague(String),
    #[error("scoring engine contract violation: {reason}")]
    ContractViolation { reason: String, payload: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse track: {0}")]
    TrackParse(String),
    #[error("invalid track: {0}")]
    InvalidTrack(String),
    #[error("failed to start score worker: {0}")]
    WorkerStart(String),
    #[error("score worker stopped before request {0} completed")]
    WorkerClosed(u64),
}

impl ScoreError {
    /// Builds a contract violation carrying the full solution payload and logs it.
    pub(crate) fn contract_violation(reason: impl Into<String>, solution: &Solution) -> Self {
        let reason = reason.into();
        let payload = serde_json::to_string(solution)
            .unwrap_or_else(|e| format!("<unserializable solution: {e}>"));
        tracing::error!(%reason, %payload, "scoring engine contract violation");
        ScoreError::ContractViolation { reason, payload }
    }
}

/// One recorded sample of a flight.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    /// Meters.
    pub alt: f64,
    /// Seconds elapsed since [`ScoringTrack::start_time_sec`].
    pub time_sec: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", try_from = "RawScoringTrack")]
pub struct ScoringTrack {
    pub points: Vec<TrackPoint>,
    /// Epoch seconds; `TrackPoint::time_sec` values are offsets from it.
    pub start_time_sec: i64,
}

/// Wire shape of [`ScoringTrack`]; checked before it becomes one.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScoringTrack {
    points: Vec<TrackPoint>,
    #[serde(default)]
    start_time_sec: i64,
}

impl TryFrom<RawScoringTrack> for ScoringTrack {
    type Error = ScoreError;

    fn try_from(raw: RawScoringTrack) -> Result<Self, Self::Error> {
        Self::new(raw.points, raw.start_time_sec)
    }
}

impl ScoringTrack {
    /// Creates a track, rejecting samples whose time goes backwards.
    pub fn new(points: Vec<TrackPoint>, start_time_sec: i64) -> Result<Self, ScoreError> {
        let track = Self {
            points,
            start_time_sec,
        };
        track.validate()?;
        Ok(track)
    }

    /// Checks the invariants `new` enforces. Fields are public, so callers
    /// holding a mutated track can re-check it here.
    pub fn validate(&self) -> Result<(), ScoreError> {
        if DateTime::<Utc>::from_timestamp(self.start_time_sec, 0).is_none() {
            return Err(ScoreError::InvalidTrack(format!(
                "start time {} out of range",
                self.start_time_sec
            )));
        }
        if let Some(i) = self.points.iter().position(|p| !p.time_sec.is_finite()) {
            return Err(ScoreError::InvalidTrack(format!(
                "point {i} has no finite time"
            )));
        }
        if let Some(i) = self
            .points
            .windows(2)
            .position(|w| w[1].time_sec < w[0].time_sec)
        {
            return Err(ScoreError::InvalidTrack(format!(
                "time decreases between points {} and {}",
                i,
                i + 1
            )));
        }
        Ok(())
    }

    /// Builds a track from bare positions. Missing altitudes default to 0 and
    /// missing times to one minute per point.
    pub fn from_positions(positions: &[Position]) -> Result<Self, ScoreError> {
        let points = positions
            .iter()
            .enumerate()
            .map(|(i, p)| TrackPoint {
                lat: p.lat,
                lon: p.lon,
                alt: p.alt.unwrap_or(0.0),
                time_sec: p.time_sec.unwrap_or(i as f64 * 60.0),
            })
            .collect();
        Self::new(points, 0)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A position with optional altitude and time, as handed over by map
/// collaborators.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt: Option<f64>,
    #[serde(default)]
    pub time_sec: Option<f64>,
}

/// Bounds on a single engine invocation. `None` means unbounded.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationOptions {
    #[serde(default)]
    pub max_cycle_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_num_cycles: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRequest {
    pub track: ScoringTrack,
    #[serde(default)]
    pub options: Option<OptimizationOptions>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CircuitType {
    OpenDistance,
    FlatTriangle,
    FaiTriangle,
    OutAndReturn,
}

impl std::fmt::Display for CircuitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitType::OpenDistance => "Open distance",
            CircuitType::FlatTriangle => "Flat triangle",
            CircuitType::FaiTriangle => "FAI triangle",
            CircuitType::OutAndReturn => "Out and return",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    pub score: f64,
    pub length_km: f64,
    pub multiplier: f64,
    pub circuit: Option<CircuitType>,
    pub closing_radius_m: Option<f64>,
    /// Indices into the original track: start, closing-in, turnpoints,
    /// closing-out, finish. Roles absent for the circuit are omitted.
    pub solution_indices: Vec<usize>,
    pub optimal: bool,
}

impl OptimizationResult {
    /// Result for tracks too short to be scored at all.
    pub fn zero() -> Self {
        Self {
            score: 0.0,
            length_km: 0.0,
            multiplier: 0.0,
            circuit: None,
            closing_radius_m: None,
            solution_indices: Vec::new(),
            optimal: true,
        }
    }
}

/// Display-oriented view of a result, in meters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub distance_m: f64,
    pub indexes: Vec<usize>,
    pub multiplier: f64,
    pub circuit: CircuitType,
    pub closing_radius_m: Option<f64>,
    pub points: f64,
}

impl From<&OptimizationResult> for Score {
    fn from(result: &OptimizationResult) -> Self {
        Self {
            distance_m: result.length_km * 1000.0,
            indexes: result.solution_indices.clone(),
            multiplier: result.multiplier,
            circuit: result.circuit.unwrap_or(CircuitType::OpenDistance),
            closing_radius_m: result.closing_radius_m,
            points: result.score,
        }
    }
}

/// Keeps the first point, then the first point past each sampling boundary.
/// The boundary advances by a single interval per kept point.
pub fn sampled_track(points: &[TrackPoint], interval_sec: f64) -> Vec<TrackPoint> {
    let Some(first) = points.first() else {
        return Vec::new();
    };
    let mut next_sample = first.time_sec + interval_sec;
    let mut samples = vec![*first];
    for point in points {
        if point.time_sec > next_sample {
            next_sample += interval_sec;
            samples.push(*point);
        }
    }
    samples
}

pub fn track_length_km(points: &[TrackPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(w[0].lat, w[0].lon, w[1].lat, w[1].lon))
        .sum::<f64>()
        / 1000.0
}

pub(crate) fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let r = 6_371_000.0_f64;
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    r * c
}

/// Parse a GPX or FIT track from bytes using the provided format hint (extension).
pub fn parse_track(input: &[u8], format: &str) -> Result<ScoringTrack, ScoreError> {
    let format_lc = format.to_ascii_lowercase();
    if format_lc.ends_with(".fit") || format_lc == "fit" {
        parse_fit_track(input)
    } else if format_lc.ends_with(".gpx") || format_lc == "gpx" {
        parse_gpx_track(input)
    } else {
        Err(ScoreError::UnsupportedFormat(format.to_string()))
    }
}

const SEMICIRCLES_TO_DEGREES: f64 = 180.0 / 2_147_483_648.0;

#[derive(Default)]
struct TrackBuilder {
    base: Option<DateTime<Utc>>,
    points: Vec<TrackPoint>,
    skipped: usize,
}

impl TrackBuilder {
    fn push(&mut self, time: DateTime<Utc>, lat: f64, lon: f64, alt: Option<f64>) {
        let base = *self.base.get_or_insert(time);
        let time_sec = (time - base).num_milliseconds() as f64 / 1000.0;
        if self.points.last().is_some_and(|p| time_sec < p.time_sec) {
            self.skipped += 1;
            return;
        }
        self.points.push(TrackPoint {
            lat,
            lon,
            alt: alt.unwrap_or(0.0),
            time_sec,
        });
    }

    fn finish(self) -> Result<ScoringTrack, ScoreError> {
        if self.skipped > 0 {
            debug!(skipped = self.skipped, "dropped fixes with out-of-order timestamps");
        }
        let start = self.base.map(|b| b.timestamp()).unwrap_or(0);
        ScoringTrack::new(self.points, start)
    }
}

fn parse_fit_track(input: &[u8]) -> Result<ScoringTrack, ScoreError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;
    let records = from_bytes(input).map_err(|e| ScoreError::TrackParse(e.to_string()))?;
    let mut builder = TrackBuilder::default();

    for record in records.into_iter() {
        if record.kind() != MesgNum::Record {
            continue;
        }
        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut lat: Option<f64> = None;
        let mut lon: Option<f64> = None;
        let mut alt: Option<f64> = None;
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        timestamp = Some(ts.with_timezone(&Utc));
                    }
                }
                "position_lat" => {
                    lat = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLES_TO_DEGREES);
                }
                "position_long" => {
                    lon = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLES_TO_DEGREES);
                }
                "enhanced_altitude" => alt = fit_value_to_f64(field.value()),
                "altitude" => {
                    if alt.is_none() {
                        alt = fit_value_to_f64(field.value());
                    }
                }
                _ => {}
            }
        }
        if let (Some(time), Some(lat), Some(lon)) = (timestamp, lat, lon) {
            builder.push(time, lat, lon, alt);
        }
    }

    builder.finish()
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::SInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn parse_gpx_track(input: &[u8]) -> Result<ScoringTrack, ScoreError> {
    use gpx::read;
    use std::io::Cursor;

    let mut cursor = Cursor::new(input);
    let gpx = read(&mut cursor).map_err(|e| ScoreError::TrackParse(e.to_string()))?;
    let mut builder = TrackBuilder::default();
    let mut untimed: Vec<Position> = Vec::new();

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let geo = point.point();
                let (lat, lon) = (geo.y(), geo.x());
                match point.time {
                    Some(time) => {
                        let iso = time
                            .format()
                            .map_err(|e| ScoreError::TrackParse(e.to_string()))?;
                        let utc = DateTime::parse_from_rfc3339(&iso)
                            .map_err(|e| ScoreError::TrackParse(e.to_string()))?
                            .with_timezone(&Utc);
                        builder.push(utc, lat, lon, point.elevation);
                    }
                    None => untimed.push(Position {
                        lat,
                        lon,
                        alt: point.elevation,
                        time_sec: None,
                    }),
                }
            }
        }
    }

    // Routes drawn without timestamps still get scored, one minute per point.
    if builder.points.is_empty() && !untimed.is_empty() {
        return ScoringTrack::from_positions(&untimed);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point(time_sec: f64) -> TrackPoint {
        TrackPoint {
            lat: 45.0,
            lon: 6.0,
            alt: 1000.0,
            time_sec,
        }
    }

    #[test]
    fn test_haversine_distance() {
        let dist = haversine_distance(0.0, 0.0, 0.0, 1.0);
        assert!((dist - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn test_track_rejects_decreasing_time() {
        let err = ScoringTrack::new(vec![point(0.0), point(10.0), point(5.0)], 0).unwrap_err();
        assert!(matches!(err, ScoreError::InvalidTrack(_)));
        assert!(ScoringTrack::new(vec![point(0.0), point(0.0), point(5.0)], 0).is_ok());
    }

    #[test]
    fn test_track_rejects_bad_times() {
        assert!(matches!(
            ScoringTrack::new(vec![point(0.0), point(f64::NAN)], 0),
            Err(ScoreError::InvalidTrack(_))
        ));
        assert!(matches!(
            ScoringTrack::new(vec![point(0.0)], i64::MAX),
            Err(ScoreError::InvalidTrack(_))
        ));
    }

    #[test]
    fn test_track_deserialization_checks_time_order() {
        let ok: ScoringTrack = serde_json::from_str(
            r#"{"points":[{"lat":45.0,"lon":6.0,"alt":900.0,"timeSec":0.0},
                          {"lat":45.1,"lon":6.0,"alt":950.0,"timeSec":12.5}],
                "startTimeSec":1700000000}"#,
        )
        .unwrap();
        assert_eq!(ok.start_time_sec, 1_700_000_000);
        assert_eq!(ok.points[1].time_sec, 12.5);

        let defaulted: ScoringTrack =
            serde_json::from_str(r#"{"points":[{"lat":45.0,"lon":6.0,"alt":0.0,"timeSec":0.0}]}"#)
                .unwrap();
        assert_eq!(defaulted.start_time_sec, 0);

        let err = serde_json::from_str::<ScoringTrack>(
            r#"{"points":[{"lat":45.0,"lon":6.0,"alt":0.0,"timeSec":50.0},
                          {"lat":45.1,"lon":6.0,"alt":0.0,"timeSec":10.0}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("time decreases"));
    }

    #[test]
    fn test_from_positions_defaults() {
        let track = ScoringTrack::from_positions(&[
            Position {
                lat: 1.0,
                lon: 2.0,
                alt: None,
                time_sec: None,
            },
            Position {
                lat: 1.5,
                lon: 2.5,
                alt: Some(300.0),
                time_sec: None,
            },
        ])
        .unwrap();
        assert_eq!(track.start_time_sec, 0);
        assert_eq!(track.points[0].alt, 0.0);
        assert_eq!(track.points[1].alt, 300.0);
        assert_eq!(track.points[1].time_sec, 60.0);
    }

    #[test]
    fn test_sampled_track() {
        let points: Vec<TrackPoint> = [0.0, 5.0, 11.0, 12.0, 25.0, 26.0]
            .iter()
            .map(|&t| point(t))
            .collect();
        let times: Vec<f64> = sampled_track(&points, 10.0)
            .iter()
            .map(|p| p.time_sec)
            .collect();
        assert_eq!(times, vec![0.0, 11.0, 25.0]);
        assert!(sampled_track(&[], 10.0).is_empty());
    }

    #[test]
    fn test_track_length_km() {
        let mut a = point(0.0);
        let mut b = point(60.0);
        a.lat = 0.0;
        a.lon = 0.0;
        b.lat = 0.0;
        b.lon = 1.0;
        assert_relative_eq!(track_length_km(&[a, b]), 111.195, epsilon = 0.2);
        assert_eq!(track_length_km(&[a]), 0.0);
    }

    #[test]
    fn test_score_view() {
        let result = OptimizationResult {
            score: 42.0,
            length_km: 35.0,
            multiplier: 1.2,
            circuit: None,
            closing_radius_m: Some(800.0),
            solution_indices: vec![1, 2, 3],
            optimal: false,
        };
        let score = Score::from(&result);
        assert_relative_eq!(score.distance_m, 35_000.0);
        assert_eq!(score.circuit, CircuitType::OpenDistance);
        assert_eq!(score.indexes, vec![1, 2, 3]);
        assert_eq!(score.points, 42.0);
    }

    #[test]
    fn test_unsupported_format() {
        assert!(matches!(
            parse_track(b"", "igc"),
            Err(ScoreError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_parse_gpx_track() {
        let gpx = br#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><trkseg>
    <trkpt lat="45.0" lon="6.0"><ele>1500</ele><time>2024-06-01T10:00:00Z</time></trkpt>
    <trkpt lat="45.1" lon="6.1"><ele>1600</ele><time>2024-06-01T10:01:00Z</time></trkpt>
    <trkpt lat="45.2" lon="6.2"><time>2024-06-01T10:02:30Z</time></trkpt>
  </trkseg></trk>
</gpx>"#;
        let track = parse_track(gpx, "flight.GPX").unwrap();
        assert_eq!(track.len(), 3);
        assert_eq!(track.start_time_sec, 1_717_236_000);
        assert_relative_eq!(track.points[1].lat, 45.1);
        assert_relative_eq!(track.points[1].lon, 6.1);
        assert_eq!(track.points[1].time_sec, 60.0);
        assert_eq!(track.points[2].time_sec, 150.0);
        assert_eq!(track.points[2].alt, 0.0);
    }
}
