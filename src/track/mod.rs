//! Multi-object tracker collaborator.
//!
//! The pipeline only depends on `Tracker`: detections in, `(box, track id)` out. A
//! tracker instance is stateful across calls and is owned by one pipeline.

mod iou;

use anyhow::Result;
use serde::Deserialize;

use crate::detect::{BBox, Detection};

pub use iou::IouTracker;

/// A detection associated with a tracker identity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Track {
    pub bbox: BBox,
    pub track_id: u64,
}

pub trait Tracker: Send {
    fn update(&mut self, detections: &[Detection]) -> Result<Vec<Track>>;
}

/// Association parameters shared by tracker implementations.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Frames a track may go unmatched before it is dropped.
    pub max_age: u32,
    /// Consecutive hits before a track is reported.
    pub min_hits: u32,
    /// Minimum IoU for a detection to continue a track.
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 20,
            min_hits: 3,
            iou_threshold: 0.25,
        }
    }
}
