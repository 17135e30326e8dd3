use anyhow::Result;
use std::cmp::Ordering;

use super::{Track, Tracker, TrackerConfig};
use crate::detect::{BBox, Detection};

struct TrackState {
    id: u64,
    bbox: BBox,
    hit_streak: u32,
    frames_lost: u32,
}

/// Greedy IoU associator.
///
/// Each frame, detection/track pairs are matched highest-IoU first. Matched tracks take
/// the new box; unmatched detections open new tracks; tracks unmatched for more than
/// `max_age` frames are dropped. A track is reported once it has `min_hits` consecutive
/// matches, or immediately during the first `min_hits` frames of the session.
pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<TrackState>,
    next_id: u64,
    frame_count: u64,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
            frame_count: 0,
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[Detection]) -> Result<Vec<Track>> {
        self.frame_count += 1;

        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.config.iou_threshold {
                    pairs.push((ti, di, iou));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (ti, di, _) in pairs {
            if track_matched[ti] || det_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;
            let track = &mut self.tracks[ti];
            track.bbox = detections[di].bbox;
            track.hit_streak += 1;
            track.frames_lost = 0;
        }

        for (ti, matched) in track_matched.iter().enumerate() {
            if !matched {
                let track = &mut self.tracks[ti];
                track.frames_lost += 1;
                track.hit_streak = 0;
            }
        }
        let max_age = self.config.max_age;
        self.tracks.retain(|t| t.frames_lost <= max_age);

        for (di, det) in detections.iter().enumerate() {
            if det_matched[di] {
                continue;
            }
            self.tracks.push(TrackState {
                id: self.next_id,
                bbox: det.bbox,
                hit_streak: 1,
                frames_lost: 0,
            });
            self.next_id += 1;
        }

        let warming_up = self.frame_count <= self.config.min_hits as u64;
        Ok(self
            .tracks
            .iter()
            .filter(|t| t.frames_lost == 0 && (t.hit_streak >= self.config.min_hits || warming_up))
            .map(|t| Track {
                bbox: t.bbox,
                track_id: t.id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PERSON_CLASS_ID;

    fn det(x: f32) -> Detection {
        Detection {
            bbox: BBox::new(x, 0.0, x + 10.0, 20.0),
            confidence: 0.9,
            class_id: PERSON_CLASS_ID,
        }
    }

    fn config(min_hits: u32, max_age: u32) -> TrackerConfig {
        TrackerConfig {
            max_age,
            min_hits,
            iou_threshold: 0.3,
        }
    }

    #[test]
    fn moving_box_keeps_its_id() {
        let mut tracker = IouTracker::new(config(1, 5));
        let first = tracker.update(&[det(0.0)]).unwrap();
        let second = tracker.update(&[det(1.0)]).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].track_id, second[0].track_id);
    }

    #[test]
    fn distant_boxes_get_distinct_ids() {
        let mut tracker = IouTracker::new(config(1, 5));
        let tracks = tracker.update(&[det(0.0), det(100.0)]).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_ne!(tracks[0].track_id, tracks[1].track_id);
    }

    #[test]
    fn unconfirmed_tracks_are_hidden_after_warm_up() {
        let mut tracker = IouTracker::new(config(3, 5));
        for _ in 0..3 {
            tracker.update(&[det(0.0)]).unwrap();
        }
        // A newcomer after warm-up needs three consecutive hits.
        let tracks = tracker.update(&[det(0.0), det(200.0)]).unwrap();
        assert_eq!(tracks.len(), 1);
        tracker.update(&[det(0.0), det(200.0)]).unwrap();
        let tracks = tracker.update(&[det(0.0), det(200.0)]).unwrap();
        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn lost_tracks_expire_after_max_age() {
        let mut tracker = IouTracker::new(config(1, 2));
        let id = tracker.update(&[det(0.0)]).unwrap()[0].track_id;
        tracker.update(&[]).unwrap();
        tracker.update(&[]).unwrap();
        assert_eq!(tracker.live_tracks(), 1);
        tracker.update(&[]).unwrap();
        assert_eq!(tracker.live_tracks(), 0);
        let reborn = tracker.update(&[det(0.0)]).unwrap();
        assert_ne!(reborn[0].track_id, id);
    }
}
