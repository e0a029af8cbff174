//! Expansion of tracks too short for the scoring engine.
//!
//! The engine refuses tracks with fewer than [`MIN_ENGINE_POINTS`] fixes. Short
//! tracks are padded with synthetic fixes placed a tiny fraction of the way
//! along each segment, so any solution point the engine picks sits on (or
//! within rounding of) a real fix and maps back to it.

use std::borrow::Cow;

use tracing::debug;

use crate::{ScoringTrack, TrackPoint};

pub const MIN_ENGINE_POINTS: usize = 5;

/// Fraction of a segment between consecutive synthetic fixes.
const DISTRIBUTION_FACTOR: f64 = 1e-5;

/// Relation from an index in the engine-facing track to the original track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexMapping {
    /// No expansion happened; holds the track length.
    Identity(usize),
    /// Original index for each of the engine-facing fixes.
    Expanded([usize; MIN_ENGINE_POINTS]),
}

impl IndexMapping {
    /// Translates an engine index. `None` when the index is outside the
    /// engine-facing track.
    pub fn original_index(&self, engine_index: usize) -> Option<usize> {
        match self {
            IndexMapping::Identity(len) => (engine_index < *len).then_some(engine_index),
            IndexMapping::Expanded(mapping) => mapping.get(engine_index).copied(),
        }
    }

    /// Number of fixes in the engine-facing track.
    pub fn engine_len(&self) -> usize {
        match self {
            IndexMapping::Identity(len) => *len,
            IndexMapping::Expanded(mapping) => mapping.len(),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, IndexMapping::Identity(_))
    }
}

#[derive(Clone, Debug)]
pub struct ExpandedTrack<'a> {
    pub track: Cow<'a, ScoringTrack>,
    pub mapping: IndexMapping,
}

/// Returns the engine-facing track and its mapping to `track`.
///
/// Tracks with 2 to 4 points are expanded to exactly [`MIN_ENGINE_POINTS`].
/// Longer tracks are borrowed unchanged. Tracks with fewer than 2 points cannot
/// be interpolated and are also returned unchanged; sessions never hand them
/// to the engine.
pub fn expand_track(track: &ScoringTrack) -> ExpandedTrack<'_> {
    let n = track.points.len();
    if n >= MIN_ENGINE_POINTS || n < 2 {
        return ExpandedTrack {
            track: Cow::Borrowed(track),
            mapping: IndexMapping::Identity(n),
        };
    }

    let segments = n - 1;
    let extra = MIN_ENGINE_POINTS - n;
    let mut points = Vec::with_capacity(MIN_ENGINE_POINTS);
    let mut mapping = [0usize; MIN_ENGINE_POINTS];

    // Extra fixes are spread over segments, earliest segments first.
    for (segment, pair) in track.points.windows(2).enumerate() {
        let subdivisions = 1 + extra / segments + usize::from(segment < extra % segments);
        for k in 0..subdivisions {
            mapping[points.len()] = segment;
            points.push(interpolate(&pair[0], &pair[1], k as f64 * DISTRIBUTION_FACTOR));
        }
    }
    mapping[points.len()] = n - 1;
    points.push(track.points[n - 1]);

    debug!(
        original = n,
        expanded = points.len(),
        "expanded short track for the scoring engine"
    );

    ExpandedTrack {
        track: Cow::Owned(ScoringTrack {
            points,
            start_time_sec: track.start_time_sec,
        }),
        mapping: IndexMapping::Expanded(mapping),
    }
}

fn interpolate(from: &TrackPoint, to: &TrackPoint, fraction: f64) -> TrackPoint {
    TrackPoint {
        lat: from.lat + (to.lat - from.lat) * fraction,
        lon: from.lon + (to.lon - from.lon) * fraction,
        alt: from.alt + (to.alt - from.alt) * fraction,
        time_sec: from.time_sec + (to.time_sec - from.time_sec) * fraction,
    }
}
