//! footfall - multi-camera people counting
//!
//! This crate owns the live side of a people-counting deployment: it pulls frames from
//! independently addressed cameras, runs a detect/track pipeline per frame, keeps a live
//! "current occupancy" and "unique visitors seen" count per camera, and fans the annotated
//! frames out to any number of HTTP viewers as an MJPEG stream.
//!
//! # Architecture
//!
//! - `cache`: single-slot, overwrite-on-write holder of the latest processed frame + counts
//! - `pipeline`: per-frame detect → track → count → annotate orchestration
//! - `worker`: one thread per live camera connection (connect, pull, reconnect, teardown)
//! - `registry`: camera id → at most one live worker; dedups concurrent viewers
//! - `snapshot`: periodic count snapshots handed to the persistence collaborator
//! - `server`: per-viewer feed loop, stats and status queries
//! - `api`: thin HTTP/1.1 surface over `server`
//!
//! Detector, tracker and persistence are collaborators consumed through the traits in
//! `detect`, `track` and `storage`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod api;
pub mod cache;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod track;
pub mod worker;

pub use cache::{FrameCache, FrameCacheEntry};
pub use config::FootfallConfig;
pub use detect::{Acceleration, BBox, Detection, Detector, StubDetector, PERSON_CLASS_ID};
pub use frame::Frame;
pub use ingest::{DefaultConnector, FrameSource, SourceConnector, SyntheticSource};
pub use pipeline::{DetectionPipeline, PipelineFactory, PipelineOutput};
pub use registry::CameraRegistry;
pub use snapshot::{CountSnapshot, PersistenceScheduler};
pub use storage::{
    shared_store, CameraRecord, CountStore, InMemoryCountStore, SharedStore, SqliteCountStore,
};
pub use track::{IouTracker, Track, Tracker, TrackerConfig};
pub use worker::{StopReason, WorkerHandle, WorkerSettings, WorkerState};

// -------------------- Camera Identity --------------------

const CAMERA_ID_PREFIX: &str = "camera_";
const CAMERA_ID_HASH_BYTES: usize = 8;

/// Stable identifier for a camera, derived from its stream URL.
///
/// The id is a truncated SHA-256 of the trimmed URL, so the same URL maps to the same id
/// in every process run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(String);

impl CameraId {
    pub fn from_url(url: &str) -> Result<Self> {
        let normalized = normalize_source_url(url);
        if normalized.is_empty() {
            return Err(FootfallError::InvalidRequest("No URL provided".to_string()).into());
        }
        let digest = Sha256::digest(normalized.as_bytes());
        Ok(Self(format!(
            "{}{}",
            CAMERA_ID_PREFIX,
            hex::encode(&digest[..CAMERA_ID_HASH_BYTES])
        )))
    }

    /// Rebuild an id previously produced by `from_url` (e.g. read back from storage).
    pub fn parse(raw: &str) -> Result<Self> {
        let hex_part = raw
            .strip_prefix(CAMERA_ID_PREFIX)
            .ok_or_else(|| anyhow!("camera id must start with '{}'", CAMERA_ID_PREFIX))?;
        if hex_part.len() != CAMERA_ID_HASH_BYTES * 2
            || !hex_part.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(anyhow!("malformed camera id '{}'", raw));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_source_url(url: &str) -> &str {
    url.trim()
}

// -------------------- Errors --------------------

/// Error taxonomy surfaced across module boundaries.
///
/// Per-frame failures (`Connection`, `Decode`, `Pipeline`, `Persistence`) are recovered
/// inside the worker loop and only logged. `InvalidRequest` and `UnknownCamera` reach
/// request handlers, which map them to 400 and 404/"offline".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FootfallError {
    Connection(String),
    Decode(String),
    Pipeline(String),
    Persistence(String),
    InvalidRequest(String),
    UnknownCamera(String),
}

impl std::fmt::Display for FootfallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FootfallError::Connection(msg) => write!(f, "connection error: {}", msg),
            FootfallError::Decode(msg) => write!(f, "decode error: {}", msg),
            FootfallError::Pipeline(msg) => write!(f, "pipeline error: {}", msg),
            FootfallError::Persistence(msg) => write!(f, "persistence error: {}", msg),
            FootfallError::InvalidRequest(msg) => f.write_str(msg),
            FootfallError::UnknownCamera(msg) => write!(f, "unknown camera: {}", msg),
        }
    }
}

impl std::error::Error for FootfallError {}

/// Find the taxonomy entry carried by an `anyhow` chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&FootfallError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<FootfallError>())
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_id_is_deterministic() {
        let a = CameraId::from_url("rtsp://10.0.0.5:554/Streaming/Channels/101").unwrap();
        let b = CameraId::from_url("rtsp://10.0.0.5:554/Streaming/Channels/101").unwrap();
        assert_eq!(a, b);
        // Pinned value: ids must survive process restarts.
        let digest = Sha256::digest(b"rtsp://10.0.0.5:554/Streaming/Channels/101");
        assert_eq!(a.as_str(), format!("camera_{}", hex::encode(&digest[..8])));
    }

    #[test]
    fn camera_id_ignores_surrounding_whitespace() {
        let a = CameraId::from_url("  stub://front \n").unwrap();
        let b = CameraId::from_url("stub://front").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn camera_id_differs_per_url() {
        let a = CameraId::from_url("stub://front").unwrap();
        let b = CameraId::from_url("stub://back").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_url_is_an_invalid_request() {
        let err = CameraId::from_url("   ").unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(FootfallError::InvalidRequest(_))
        ));
    }

    #[test]
    fn camera_id_parse_round_trips() {
        let id = CameraId::from_url("stub://front").unwrap();
        assert_eq!(CameraId::parse(id.as_str()).unwrap(), id);
        assert!(CameraId::parse("camera_xyz").is_err());
        assert!(CameraId::parse("front").is_err());
    }
}
