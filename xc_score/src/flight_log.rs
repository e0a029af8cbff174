use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ScoringTrack, TrackPoint};

/// A timestamped fix as consumed by the scoring engine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    /// Absolute epoch milliseconds.
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub gps_altitude: f64,
}

impl Fix {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlightLog {
    pub start_time_sec: i64,
    pub fixes: Vec<Fix>,
}

impl FlightLog {
    pub fn date(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.start_time_sec, 0)
    }
}

impl From<&ScoringTrack> for FlightLog {
    fn from(track: &ScoringTrack) -> Self {
        let fixes = track
            .points
            .iter()
            .map(|p| to_fix(p, track.start_time_sec))
            .collect();
        FlightLog {
            start_time_sec: track.start_time_sec,
            fixes,
        }
    }
}

fn to_fix(point: &TrackPoint, start_time_sec: i64) -> Fix {
    Fix {
        timestamp_ms: start_time_sec
            .saturating_mul(1000)
            .saturating_add((point.time_sec * 1000.0).round() as i64),
        latitude: point.lat,
        longitude: point.lon,
        gps_altitude: point.alt,
    }
}
