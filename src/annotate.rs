//! Overlay rendering: per-track boxes and id labels plus the two running counts.
//!
//! Text needs a font. Without `annotate.font_path` a few common system font locations
//! are tried; if none loads, boxes are still drawn and text overlays are skipped.

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

use crate::track::Track;

const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
const COUNT_SCALE: f32 = 28.0;
const COUNT_X: i32 = 20;
const CURRENT_Y: i32 = 20;
const TOTAL_Y: i32 = 60;
const LABEL_PAD: u32 = 4;
const COUNT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

pub struct Annotator {
    font: Option<FontArc>,
}

impl Annotator {
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    pub fn from_font_path(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            let candidates: Vec<&Path> = SYSTEM_FONTS.iter().map(Path::new).collect();
            return Ok(match first_usable_font(&candidates) {
                Some(font) => Self::new(Some(font)),
                None => {
                    log::warn!("annotate: no font found; labels and counts will not be drawn");
                    Self::boxes_only()
                }
            });
        };
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .with_context(|| format!("invalid font file {}", path.display()))?;
        Ok(Self::new(Some(font)))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw `tracks` (with their colors) and the count overlays onto `image`.
    pub fn draw(
        &self,
        image: &mut RgbImage,
        tracks: &[(Track, Rgb<u8>)],
        current_count: u32,
        total_unique: u32,
    ) {
        for (track, color) in tracks {
            let Some(rect) = track_rect(track, image.width(), image.height()) else {
                continue;
            };
            for inset in 0..BOX_THICKNESS {
                let (w, h) = (rect.width(), rect.height());
                let shrink = 2 * inset as u32;
                if w <= shrink || h <= shrink {
                    break;
                }
                let inner = Rect::at(rect.left() + inset, rect.top() + inset)
                    .of_size(w - shrink, h - shrink);
                draw_hollow_rect_mut(image, inner, *color);
            }
            if let Some(font) = &self.font {
                draw_label(image, font, &rect, &format!("ID: {}", track.track_id), *color);
            }
        }

        if let Some(font) = &self.font {
            let scale = PxScale::from(COUNT_SCALE);
            draw_text_mut(
                image,
                COUNT_COLOR,
                COUNT_X,
                CURRENT_Y,
                scale,
                font,
                &format!("Current Count: {}", current_count),
            );
            draw_text_mut(
                image,
                COUNT_COLOR,
                COUNT_X,
                TOTAL_Y,
                scale,
                font,
                &format!("Total Unique: {}", total_unique),
            );
        }
    }
}

fn first_usable_font(candidates: &[&Path]) -> Option<FontArc> {
    candidates.iter().find_map(|path| {
        let bytes = std::fs::read(path).ok()?;
        match FontArc::try_from_vec(bytes) {
            Ok(font) => {
                log::info!("annotate: using font {}", path.display());
                Some(font)
            }
            Err(err) => {
                log::debug!("annotate: skipping {}: {}", path.display(), err);
                None
            }
        }
    })
}

fn track_rect(track: &Track, width: u32, height: u32) -> Option<Rect> {
    let x1 = track.bbox.x1.max(0.0).min(width as f32) as i32;
    let y1 = track.bbox.y1.max(0.0).min(height as f32) as i32;
    let x2 = track.bbox.x2.max(0.0).min(width as f32) as i32;
    let y2 = track.bbox.y2.max(0.0).min(height as f32) as i32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32))
}

/// Filled tag above the box (inside it when the box touches the top edge).
fn draw_label(image: &mut RgbImage, font: &FontArc, rect: &Rect, text: &str, color: Rgb<u8>) {
    let scale = PxScale::from(LABEL_SCALE);
    let (text_w, text_h) = text_size(scale, font, text);
    let tag_h = text_h + 2 * LABEL_PAD;
    let tag_w = text_w + 2 * LABEL_PAD;
    let top = if rect.top() >= tag_h as i32 {
        rect.top() - tag_h as i32
    } else {
        rect.top()
    };
    draw_filled_rect_mut(image, Rect::at(rect.left(), top).of_size(tag_w, tag_h), color);
    draw_text_mut(
        image,
        LABEL_TEXT_COLOR,
        rect.left() + LABEL_PAD as i32,
        top + LABEL_PAD as i32,
        scale,
        font,
        text,
    );
}
