use std::cmp::Ordering;

/// COCO class id for "person".
pub const PERSON_CLASS_ID: u32 = 0;

/// Axis-aligned box in frame pixel coordinates (top-left, bottom-right).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: u32,
}

/// Keep person detections at or above `min_confidence`, highest confidence first,
/// capped at `max_detections`.
pub fn select_people(
    detections: Vec<Detection>,
    min_confidence: f32,
    max_detections: usize,
) -> Vec<Detection> {
    let mut people: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.class_id == PERSON_CLASS_ID && d.confidence >= min_confidence)
        .collect();
    people.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    people.truncate(max_detections);
    people
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, confidence: f32) -> Detection {
        Detection {
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            confidence,
            class_id,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn select_people_filters_class_and_caps() {
        let input = vec![
            det(PERSON_CLASS_ID, 0.4),
            det(2, 0.99),
            det(PERSON_CLASS_ID, 0.9),
            det(PERSON_CLASS_ID, 0.1),
            det(PERSON_CLASS_ID, 0.6),
        ];
        let people = select_people(input, 0.25, 2);
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].confidence, 0.9);
        assert_eq!(people[1].confidence, 0.6);
        assert!(people.iter().all(|d| d.class_id == PERSON_CLASS_ID));
    }
}
