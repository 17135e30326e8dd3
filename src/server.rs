//! Viewer-facing operations: the multipart feed loop, count queries and status probes.
//!
//! A feed polls the camera's cache every `poll_interval` and writes each new frame as one
//! multipart part. When no new frame arrives for `frame_timeout`, or its worker session
//! has finished, the feed ends. However a feed ends, dropping it releases the camera if
//! the registry still serves it with the feed's session.

use anyhow::Result;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::config::StreamSettings;
use crate::registry::CameraRegistry;
use crate::worker::{WorkerHandle, WorkerState};
use crate::{classify, CameraId, FootfallError};

pub const BOUNDARY: &str = "frame";
pub const FEED_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedEnd {
    /// No new frame within the timeout window.
    Timeout,
    /// Writing to the viewer failed.
    ViewerGone,
    /// Server shutdown.
    Cancelled,
    /// The camera's worker session ended (released elsewhere, idle, or gave up).
    WorkerGone,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraCounts {
    pub count: u32,
    pub total: u32,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Online,
    Offline,
}

#[derive(Clone)]
pub struct StreamServer {
    registry: CameraRegistry,
    settings: StreamSettings,
}

impl StreamServer {
    pub fn new(registry: CameraRegistry, settings: StreamSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Resolve the camera and attach to (or start) its worker. Errors here happen
    /// before anything is written to the viewer.
    pub fn open_feed(&self, url: &str) -> Result<Feed> {
        let worker = self.registry.get_or_create(url)?;
        log::info!("feed: viewer attached to {}", worker.camera_id());
        Ok(Feed {
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            worker,
        })
    }

    /// Open a feed and stream it into `out` until it ends.
    pub fn stream_feed<W: Write>(&self, url: &str, out: &mut W, cancel: &AtomicBool) -> Result<FeedEnd> {
        self.open_feed(url)?.run(out, cancel)
    }

    /// Counts from the camera's latest frame; zeros when nothing is cached yet.
    pub fn current_counts(&self, url: &str) -> Result<CameraCounts> {
        let worker = self.registry.get_or_create(url)?;
        let (count, total) = worker
            .latest()?
            .map(|entry| (entry.current_count, entry.total_unique))
            .unwrap_or((0, 0));
        Ok(CameraCounts {
            count,
            total,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Online when the worker reaches `Streaming` within `status_probe`. Unknown or
    /// deactivated cameras are offline; other setup failures are returned.
    pub fn check_status(&self, url: &str) -> Result<CameraStatus> {
        let worker = match self.registry.get_or_create(url) {
            Ok(worker) => worker,
            Err(err) => {
                if let Some(FootfallError::UnknownCamera(_)) = classify(&err) {
                    return Ok(CameraStatus::Offline);
                }
                return Err(err);
            }
        };
        let state = worker.wait_until_settled(self.settings.status_probe);
        Ok(if state == WorkerState::Streaming {
            CameraStatus::Online
        } else {
            CameraStatus::Offline
        })
    }
}

/// One viewer's attachment to a camera. Releases the camera when dropped.
pub struct Feed {
    registry: CameraRegistry,
    settings: StreamSettings,
    worker: WorkerHandle,
}

impl Feed {
    pub fn camera_id(&self) -> &CameraId {
        self.worker.camera_id()
    }

    pub fn run<W: Write>(self, out: &mut W, cancel: &AtomicBool) -> Result<FeedEnd> {
        let camera = self.worker.camera_id().clone();
        let mut last_seq = 0u64;
        let mut last_emit = Instant::now();
        let mut frames = 0u64;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Ok(FeedEnd::Cancelled);
            }
            if let Some(entry) = self.worker.latest()? {
                if entry.seq != last_seq {
                    if let Err(err) = write_part(out, &entry.encoded_frame) {
                        log::info!("feed[{}]: viewer gone after {} frames: {}", camera, frames, err);
                        return Ok(FeedEnd::ViewerGone);
                    }
                    last_seq = entry.seq;
                    last_emit = Instant::now();
                    frames += 1;
                }
            }
            if self.worker.is_finished() {
                log::info!(
                    "feed[{}]: session {} ended after {} frames",
                    camera,
                    self.worker.session(),
                    frames
                );
                return Ok(FeedEnd::WorkerGone);
            }
            if last_emit.elapsed() >= self.settings.frame_timeout {
                log::info!(
                    "feed[{}]: no frame for {:?}, ending after {} frames",
                    camera,
                    self.settings.frame_timeout,
                    frames
                );
                return Ok(FeedEnd::Timeout);
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        // A newer session started by another viewer is left running.
        let released = self
            .registry
            .release_session(self.worker.camera_id(), self.worker.session());
        if let Err(err) = released {
            log::error!("feed[{}]: release failed: {:#}", self.worker.camera_id(), err);
        }
    }
}

/// One multipart part: boundary line, part header, JPEG bytes, CRLF.
pub fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> std::io::Result<()> {
    write!(out, "--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY)?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()
}
