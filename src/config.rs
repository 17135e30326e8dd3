use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::track::TrackerConfig;
use crate::worker::WorkerSettings;

const DEFAULT_DB_PATH: &str = "footfall.db";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_FRAME_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STATUS_PROBE_MS: u64 = 2000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_FRAME_PACING_MS: u64 = 33;
const DEFAULT_CAMERA_CHECK_SECS: u64 = 5;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_SNAPSHOT_SECS: u64 = 300;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_MAX_DETECTIONS: usize = 100;
const DEFAULT_INPUT_SIZE: u32 = 640;
#[cfg(feature = "backend-tract")]
const DETECTOR_BACKENDS: &[&str] = &["stub", "tract"];
#[cfg(not(feature = "backend-tract"))]
const DETECTOR_BACKENDS: &[&str] = &["stub"];

#[derive(Debug, Deserialize, Default)]
struct FootfallConfigFile {
    db_path: Option<String>,
    http: Option<HttpConfigFile>,
    stream: Option<StreamConfigFile>,
    worker: Option<WorkerConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfig>,
    annotate: Option<AnnotateConfigFile>,
    branches: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    poll_interval_ms: Option<u64>,
    frame_timeout_secs: Option<u64>,
    status_probe_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    idle_timeout_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    frame_pacing_ms: Option<u64>,
    camera_check_secs: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence: Option<f32>,
    max_detections: Option<usize>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotateConfigFile {
    font_path: Option<PathBuf>,
}

/// Daemon configuration: file (optional) → environment overrides → validation.
#[derive(Debug, Clone)]
pub struct FootfallConfig {
    pub db_path: String,
    pub http_addr: String,
    pub stream: StreamSettings,
    pub worker: WorkerSettings,
    pub detector: DetectorSettings,
    pub tracker: TrackerConfig,
    pub annotate: AnnotateSettings,
    /// Branch name → ordered camera stream URLs.
    pub branches: BTreeMap<String, Vec<String>>,
}

/// Viewer-side timing.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Sleep between cache polls while a feed waits for a new frame.
    pub poll_interval: Duration,
    /// A feed with no new frame for this long ends and releases the camera.
    pub frame_timeout: Duration,
    /// How long a status check waits for a connecting worker to settle.
    pub status_probe: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            frame_timeout: Duration::from_secs(DEFAULT_FRAME_TIMEOUT_SECS),
            status_probe: Duration::from_millis(DEFAULT_STATUS_PROBE_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence: f32,
    pub max_detections: usize,
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            model_path: None,
            confidence: DEFAULT_CONFIDENCE,
            max_detections: DEFAULT_MAX_DETECTIONS,
            input_width: DEFAULT_INPUT_SIZE,
            input_height: DEFAULT_INPUT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotateSettings {
    /// TTF/OTF font for labels and count overlays. Without one only boxes are drawn.
    pub font_path: Option<PathBuf>,
}

impl Default for FootfallConfig {
    fn default() -> Self {
        // Defaults are infallible; the validation pass only rejects overrides.
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            stream: StreamSettings::default(),
            worker: WorkerSettings::default(),
            detector: DetectorSettings {
                backend: DEFAULT_DETECTOR.to_string(),
                ..DetectorSettings::default()
            },
            tracker: TrackerConfig::default(),
            annotate: AnnotateSettings::default(),
            branches: BTreeMap::new(),
        }
    }
}

impl FootfallConfig {
    /// Load using `FOOTFALL_CONFIG` as the optional config file path.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FOOTFALL_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => FootfallConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FootfallConfigFile) -> Self {
        let defaults = Self::default();
        let http = file.http.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let worker = file.worker.unwrap_or_default();
        let snapshot = file.snapshot.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let annotate = file.annotate.unwrap_or_default();

        Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            http_addr: http.addr.unwrap_or(defaults.http_addr),
            stream: StreamSettings {
                poll_interval: stream
                    .poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stream.poll_interval),
                frame_timeout: stream
                    .frame_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stream.frame_timeout),
                status_probe: stream
                    .status_probe_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stream.status_probe),
            },
            worker: WorkerSettings {
                idle_timeout: worker
                    .idle_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.worker.idle_timeout),
                reconnect_initial: worker
                    .reconnect_initial_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.worker.reconnect_initial),
                reconnect_max: worker
                    .reconnect_max_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.worker.reconnect_max),
                max_reconnect_attempts: worker
                    .max_reconnect_attempts
                    .unwrap_or(defaults.worker.max_reconnect_attempts),
                frame_pacing: worker
                    .frame_pacing_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.worker.frame_pacing),
                camera_check_interval: worker
                    .camera_check_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.worker.camera_check_interval),
                jpeg_quality: worker.jpeg_quality.unwrap_or(defaults.worker.jpeg_quality),
                snapshot_interval: snapshot
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.worker.snapshot_interval),
            },
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or(defaults.detector.backend),
                model_path: detector.model_path,
                confidence: detector.confidence.unwrap_or(defaults.detector.confidence),
                max_detections: detector
                    .max_detections
                    .unwrap_or(defaults.detector.max_detections),
                input_width: detector.input_width.unwrap_or(defaults.detector.input_width),
                input_height: detector
                    .input_height
                    .unwrap_or(defaults.detector.input_height),
            },
            tracker: file.tracker.unwrap_or(defaults.tracker),
            annotate: AnnotateSettings {
                font_path: annotate.font_path,
            },
            branches: file.branches.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FOOTFALL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("FOOTFALL_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.http_addr = addr;
            }
        }
        if let Ok(secs) = std::env::var("FOOTFALL_FRAME_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("FOOTFALL_FRAME_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.stream.frame_timeout = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("FOOTFALL_SNAPSHOT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("FOOTFALL_SNAPSHOT_SECS must be an integer number of seconds")
            })?;
            self.worker.snapshot_interval = Duration::from_secs(secs);
        }
        if let Ok(backend) = std::env::var("FOOTFALL_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_lowercase();
            }
        }
        if let Ok(path) = std::env::var("FOOTFALL_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("FOOTFALL_FONT_PATH") {
            if !path.trim().is_empty() {
                self.annotate.font_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.stream.poll_interval.is_zero() {
            return Err(anyhow!("stream.poll_interval_ms must be greater than zero"));
        }
        if self.stream.frame_timeout.is_zero() {
            return Err(anyhow!("stream frame timeout must be greater than zero"));
        }
        if self.worker.snapshot_interval.is_zero() {
            return Err(anyhow!("snapshot interval must be greater than zero"));
        }
        if self.worker.idle_timeout.is_zero() {
            return Err(anyhow!("worker.idle_timeout_secs must be greater than zero"));
        }
        if self.worker.camera_check_interval.is_zero() {
            return Err(anyhow!("worker.camera_check_secs must be greater than zero"));
        }
        if self.worker.reconnect_initial.is_zero() {
            return Err(anyhow!("worker.reconnect_initial_ms must be greater than zero"));
        }
        if self.worker.reconnect_max < self.worker.reconnect_initial {
            return Err(anyhow!(
                "worker.reconnect_max_ms must not be below worker.reconnect_initial_ms"
            ));
        }
        if !(1..=100).contains(&self.worker.jpeg_quality) {
            return Err(anyhow!("worker.jpeg_quality must be between 1 and 100"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(anyhow!("detector.confidence must be between 0 and 1"));
        }
        if self.detector.max_detections == 0 {
            return Err(anyhow!("detector.max_detections must be greater than zero"));
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input dimensions must be non-zero"));
        }
        self.detector.backend = self.detector.backend.to_lowercase();
        if !DETECTOR_BACKENDS.contains(&self.detector.backend.as_str()) {
            return Err(anyhow!(
                "detector backend '{}' is not available in this build (expected one of {:?})",
                self.detector.backend,
                DETECTOR_BACKENDS
            ));
        }
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(anyhow!(
                "detector backend 'tract' requires detector.model_path (or FOOTFALL_MODEL_PATH)"
            ));
        }
        if !(0.0..=1.0).contains(&self.tracker.iou_threshold) {
            return Err(anyhow!("tracker.iou_threshold must be between 0 and 1"));
        }
        for (branch, urls) in &mut self.branches {
            if branch.trim().is_empty() {
                return Err(anyhow!("branch names must be non-empty"));
            }
            urls.retain(|url| !url.trim().is_empty());
        }
        Ok(())
    }

    /// Branch that lists `url`, with the camera's 1-based position in that branch.
    pub fn branch_for(&self, url: &str) -> Option<(&str, usize)> {
        let url = crate::normalize_source_url(url);
        self.branches.iter().find_map(|(branch, urls)| {
            urls.iter()
                .position(|candidate| crate::normalize_source_url(candidate) == url)
                .map(|idx| (branch.as_str(), idx + 1))
        })
    }
}

fn read_config_file(path: &Path) -> Result<FootfallConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
