#![cfg(feature = "backend-tract")]

use std::cmp::Ordering;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::{BBox, Detection};
use crate::frame::Frame;

const NMS_IOU_THRESHOLD: f32 = 0.45;
/// YOLOv8 output rows before the class scores: cx, cy, w, h.
const BOX_ROWS: usize = 4;

/// Tract-based YOLOv8 detector.
///
/// Loads a local ONNX export (`[1, 3, H, W]` input, `[1, 4 + classes, anchors]` output)
/// and runs it on the CPU.
pub struct TractDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.25,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame.to_image()?;
        let resized = image::imageops::resize(&image, self.width, self.height, FilterType::Triangle);
        let width = self.width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= BOX_ROWS {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let rows = shape[1];
        let anchors = shape[2];
        let scale_x = frame.width as f32 / self.width as f32;
        let scale_y = frame.height as f32 / self.height as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (class_id, score) = (BOX_ROWS..rows)
                .map(|row| (row - BOX_ROWS, view[[0, row, i]]))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if score < self.confidence_threshold {
                continue;
            }
            let cx = view[[0, 0, i]];
            let cy = view[[0, 1, i]];
            let w = view[[0, 2, i]];
            let h = view[[0, 3, i]];
            candidates.push(Detection {
                bbox: BBox::new(
                    ((cx - w / 2.0) * scale_x).max(0.0),
                    ((cy - h / 2.0) * scale_y).max(0.0),
                    ((cx + w / 2.0) * scale_x).min(frame.width as f32),
                    ((cy + h / 2.0) * scale_y).min(frame.height as f32),
                ),
                confidence: score,
                class_id: class_id as u32,
            });
        }
        Ok(nms(candidates, NMS_IOU_THRESHOLD))
    }
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}

/// Greedy per-class NMS: highest confidence first, suppress overlaps of the same class.
fn nms(mut boxes: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in boxes {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_thresh
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_suppresses_overlapping_same_class() {
        let a = Detection {
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            confidence: 0.9,
            class_id: 0,
        };
        let b = Detection {
            bbox: BBox::new(1.0, 1.0, 10.0, 10.0),
            confidence: 0.8,
            class_id: 0,
        };
        let c = Detection {
            class_id: 2,
            ..b
        };
        let kept = nms(vec![b, a, c], 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 2);
    }
}
