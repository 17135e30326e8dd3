//! Per-frame detect → track → count → annotate.
//!
//! A `DetectionPipeline` belongs to exactly one worker session. It owns the session's
//! unique-id set, so the "total unique" count starts from zero for every new session and
//! only ever grows while that session lives.

use anyhow::Result;
use image::{Rgb, RgbImage};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::annotate::Annotator;
use crate::config::DetectorSettings;
use crate::detect::{build_detector, select_people, Detector};
use crate::frame::Frame;
use crate::track::{IouTracker, Track, Tracker, TrackerConfig};
use crate::CameraId;

/// Annotated frame plus the counts it shows.
pub struct PipelineOutput {
    pub frame: RgbImage,
    pub current_count: u32,
    pub total_unique: u32,
}

pub struct DetectionPipeline {
    detector: Box<dyn Detector>,
    tracker: Box<dyn Tracker>,
    annotator: Arc<Annotator>,
    min_confidence: f32,
    max_detections: usize,
    unique_ids: HashSet<u64>,
    colors: HashMap<u64, Rgb<u8>>,
    announced: bool,
}

impl DetectionPipeline {
    pub fn new(
        detector: Box<dyn Detector>,
        tracker: Box<dyn Tracker>,
        annotator: Arc<Annotator>,
        min_confidence: f32,
        max_detections: usize,
    ) -> Self {
        Self {
            detector,
            tracker,
            annotator,
            min_confidence,
            max_detections,
            unique_ids: HashSet::new(),
            colors: HashMap::new(),
            announced: false,
        }
    }

    /// Distinct track ids seen by this pipeline.
    pub fn total_unique(&self) -> u32 {
        self.unique_ids.len() as u32
    }

    /// Process one frame. `None` means "no output this frame": the frame was empty or a
    /// stage failed (logged here). Accumulated counts are kept either way.
    pub fn process(&mut self, frame: &Frame, camera: &CameraId) -> Option<PipelineOutput> {
        if frame.is_empty() {
            log::debug!("pipeline[{}]: skipping empty frame", camera);
            return None;
        }
        if !self.announced {
            log::info!(
                "pipeline[{}]: detector={} acceleration={}",
                camera,
                self.detector.name(),
                self.detector.acceleration()
            );
            self.announced = true;
        }
        match self.run(frame) {
            Ok(output) => Some(output),
            Err(err) => {
                log::warn!("pipeline[{}]: frame dropped: {:#}", camera, err);
                None
            }
        }
    }

    fn run(&mut self, frame: &Frame) -> Result<PipelineOutput> {
        let detections = self.detector.infer(frame)?;
        let people = select_people(detections, self.min_confidence, self.max_detections);
        let tracks = self.tracker.update(&people)?;
        let mut image = frame.to_image()?;

        let mut colored: Vec<(Track, Rgb<u8>)> = Vec::with_capacity(tracks.len());
        for track in tracks {
            self.unique_ids.insert(track.track_id);
            let color = *self
                .colors
                .entry(track.track_id)
                .or_insert_with(random_color);
            colored.push((track, color));
        }

        let current_count = colored.len() as u32;
        let total_unique = self.total_unique();
        self.annotator
            .draw(&mut image, &colored, current_count, total_unique);

        Ok(PipelineOutput {
            frame: image,
            current_count,
            total_unique,
        })
    }
}

/// Builds a fresh pipeline for each new worker session.
pub trait PipelineFactory: Send + Sync {
    fn build(&self, camera: &CameraId) -> Result<DetectionPipeline>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&CameraId) -> Result<DetectionPipeline> + Send + Sync,
{
    fn build(&self, camera: &CameraId) -> Result<DetectionPipeline> {
        self(camera)
    }
}

/// Daemon factory: configured detector backend + `IouTracker` + shared annotator.
pub struct ConfiguredPipelineFactory {
    detector: DetectorSettings,
    tracker: TrackerConfig,
    annotator: Arc<Annotator>,
}

impl ConfiguredPipelineFactory {
    pub fn new(detector: DetectorSettings, tracker: TrackerConfig, annotator: Arc<Annotator>) -> Self {
        Self {
            detector,
            tracker,
            annotator,
        }
    }
}

impl PipelineFactory for ConfiguredPipelineFactory {
    fn build(&self, _camera: &CameraId) -> Result<DetectionPipeline> {
        Ok(DetectionPipeline::new(
            build_detector(&self.detector)?,
            Box::new(IouTracker::new(self.tracker)),
            Arc::clone(&self.annotator),
            self.detector.confidence,
            self.detector.max_detections,
        ))
    }
}

/// Saturated, bright color from a random hue.
fn random_color() -> Rgb<u8> {
    let hue: f32 = rand::thread_rng().gen_range(0.0..360.0);
    hsv_to_rgb(hue, 1.0, 1.0)
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Rgb<u8> {
    let c = value * saturation;
    let h = (hue % 360.0) / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = value - c;
    let to_byte = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([to_byte(r), to_byte(g), to_byte(b)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Detection, StubDetector, PERSON_CLASS_ID};
    use anyhow::anyhow;

    fn person(x: f32) -> Detection {
        Detection {
            bbox: BBox::new(x, 0.0, x + 4.0, 8.0),
            confidence: 0.9,
            class_id: PERSON_CLASS_ID,
        }
    }

    /// Replays fixed track ids regardless of input.
    struct ScriptedTracker {
        frames: Vec<Vec<u64>>,
        cursor: usize,
    }

    impl Tracker for ScriptedTracker {
        fn update(&mut self, _detections: &[Detection]) -> Result<Vec<Track>> {
            let ids = self.frames.get(self.cursor).cloned().unwrap_or_default();
            self.cursor += 1;
            Ok(ids
                .into_iter()
                .map(|track_id| Track {
                    bbox: BBox::new(1.0, 1.0, 5.0, 5.0),
                    track_id,
                })
                .collect())
        }
    }

    struct FailingTracker;

    impl Tracker for FailingTracker {
        fn update(&mut self, _detections: &[Detection]) -> Result<Vec<Track>> {
            Err(anyhow!("tracker exploded"))
        }
    }

    fn pipeline(tracker: Box<dyn Tracker>) -> DetectionPipeline {
        DetectionPipeline::new(
            Box::new(StubDetector::new()),
            tracker,
            Arc::new(Annotator::boxes_only()),
            0.25,
            100,
        )
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; 16 * 16 * 3], 16, 16).unwrap()
    }

    #[test]
    fn counts_follow_tracker_output() {
        let camera = CameraId::from_url("stub://a").unwrap();
        let mut pipeline = pipeline(Box::new(ScriptedTracker {
            frames: vec![vec![1, 2], vec![2, 3, 4], vec![], vec![1]],
            cursor: 0,
        }));
        let mut totals = Vec::new();
        for expected_current in [2u32, 3, 0, 1] {
            let out = pipeline.process(&frame(), &camera).unwrap();
            assert_eq!(out.current_count, expected_current);
            totals.push(out.total_unique);
        }
        assert_eq!(totals, vec![2, 4, 4, 4]);
    }

    #[test]
    fn colors_are_stable_per_track() {
        let camera = CameraId::from_url("stub://a").unwrap();
        let mut pipeline = pipeline(Box::new(ScriptedTracker {
            frames: vec![vec![7], vec![7]],
            cursor: 0,
        }));
        pipeline.process(&frame(), &camera).unwrap();
        let first = pipeline.colors[&7];
        pipeline.process(&frame(), &camera).unwrap();
        assert_eq!(pipeline.colors[&7], first);
    }

    #[test]
    fn failures_and_empty_frames_yield_none_and_keep_counts() {
        let camera = CameraId::from_url("stub://a").unwrap();
        let mut failing = pipeline(Box::new(FailingTracker));
        assert!(failing.process(&frame(), &camera).is_none());
        assert_eq!(failing.total_unique(), 0);

        let mut ok = pipeline(Box::new(ScriptedTracker {
            frames: vec![vec![1]],
            cursor: 0,
        }));
        let empty = Frame::new(Vec::new(), 0, 0).unwrap();
        assert!(ok.process(&empty, &camera).is_none());
        assert!(ok.process(&frame(), &camera).is_some());
        assert_eq!(ok.total_unique(), 1);
    }

    #[test]
    fn iou_tracker_pipeline_counts_people() {
        let camera = CameraId::from_url("stub://a").unwrap();
        let detector = StubDetector::with_script(vec![vec![person(0.0), person(10.0)]]);
        let tracker = IouTracker::new(TrackerConfig {
            max_age: 5,
            min_hits: 1,
            iou_threshold: 0.3,
        });
        let mut pipeline = DetectionPipeline::new(
            Box::new(detector),
            Box::new(tracker),
            Arc::new(Annotator::boxes_only()),
            0.25,
            100,
        );
        for _ in 0..3 {
            let out = pipeline.process(&frame(), &camera).unwrap();
            assert_eq!(out.current_count, 2);
            assert_eq!(out.total_unique, 2);
        }
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), Rgb([255, 0, 0]));
        assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), Rgb([0, 255, 0]));
        assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), Rgb([0, 0, 255]));
    }
}
