use anyhow::Result;

use crate::detect::backend::Detector;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub detector for testing and model-less deployments.
///
/// Replays a fixed script of per-frame detections, cycling when it runs out.
/// With an empty script it reports nothing.
#[derive(Default)]
pub struct StubDetector {
    script: Vec<Vec<Detection>>,
    cursor: usize,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Vec<Detection>>) -> Self {
        Self { script, cursor: 0 }
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let detections = self.script[self.cursor % self.script.len()].clone();
        self.cursor += 1;
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, PERSON_CLASS_ID};

    #[test]
    fn stub_detector_replays_script() {
        let frame = Frame::new(vec![0u8; 12], 2, 2).unwrap();
        let person = Detection {
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            confidence: 0.9,
            class_id: PERSON_CLASS_ID,
        };
        let mut detector = StubDetector::with_script(vec![vec![person], vec![]]);

        assert_eq!(detector.infer(&frame).unwrap().len(), 1);
        assert!(detector.infer(&frame).unwrap().is_empty());
        assert_eq!(detector.infer(&frame).unwrap().len(), 1);
    }

    #[test]
    fn empty_stub_detector_reports_nothing() {
        let frame = Frame::new(vec![0u8; 12], 2, 2).unwrap();
        let mut detector = StubDetector::new();
        assert!(detector.infer(&frame).unwrap().is_empty());
    }
}
