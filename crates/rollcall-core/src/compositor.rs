//! Overlay drawing: boxes and labels for the latest match results.

use crate::font;
use crate::types::{BoundingBox, MatchResult};
use image::{Rgb, RgbImage};

pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: i64 = 2;
const LABEL_SCALE: u32 = 2;
const LABEL_PADDING: i64 = 2;

/// Produce an annotated copy of `frame`.
///
/// Every result gets a rectangle coloured by match state and a filled label
/// strip above it (inside the box when there is no room above).
pub fn annotate(frame: &RgbImage, results: &[MatchResult]) -> RgbImage {
    let mut out = frame.clone();
    for result in results {
        let color = if result.label.is_known() {
            MATCHED_COLOR
        } else {
            UNKNOWN_COLOR
        };
        let rect = PixelRect::from_bbox(&result.bbox);
        draw_hollow_rect(&mut out, rect, color);
        draw_label(&mut out, rect, &result.label.to_string(), color);
    }
    out
}

#[derive(Debug, Clone, Copy)]
struct PixelRect {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl PixelRect {
    fn from_bbox(bbox: &BoundingBox) -> Self {
        Self {
            left: bbox.x.round() as i64,
            top: bbox.y.round() as i64,
            right: (bbox.x + bbox.width).round() as i64,
            bottom: (bbox.y + bbox.height).round() as i64,
        }
    }
}

/// Fill [left, right) × [top, bottom), clipped to the image.
fn fill_rect(image: &mut RgbImage, left: i64, top: i64, right: i64, bottom: i64, color: Rgb<u8>) {
    let x0 = left.max(0);
    let y0 = top.max(0);
    let x1 = right.min(i64::from(image.width()));
    let y1 = bottom.min(i64::from(image.height()));
    for y in y0..y1 {
        for x in x0..x1 {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_hollow_rect(image: &mut RgbImage, r: PixelRect, color: Rgb<u8>) {
    let t = BOX_THICKNESS;
    fill_rect(image, r.left, r.top, r.right, r.top + t, color);
    fill_rect(image, r.left, r.bottom - t, r.right, r.bottom, color);
    fill_rect(image, r.left, r.top, r.left + t, r.bottom, color);
    fill_rect(image, r.right - t, r.top, r.right, r.bottom, color);
}

fn draw_label(image: &mut RgbImage, r: PixelRect, text: &str, color: Rgb<u8>) {
    let strip_h = i64::from(font::GLYPH_HEIGHT * LABEL_SCALE) + 2 * LABEL_PADDING;
    let strip_w = i64::from(font::text_width(text, LABEL_SCALE)) + 2 * LABEL_PADDING;
    let top = if r.top - strip_h >= 0 { r.top - strip_h } else { r.top };

    fill_rect(image, r.left, top, r.left + strip_w, top + strip_h, color);
    font::draw_text(
        image,
        r.left + LABEL_PADDING,
        top + LABEL_PADDING,
        text,
        LABEL_TEXT_COLOR,
        LABEL_SCALE,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchLabel;

    const GREY: Rgb<u8> = Rgb([50, 50, 50]);

    fn result(x: f32, y: f32, w: f32, h: f32, known: bool) -> MatchResult {
        MatchResult {
            bbox: BoundingBox::new(x, y, w, h),
            label: if known {
                MatchLabel::Known {
                    identity_id: "S001".into(),
                    display_name: "Alice".into(),
                }
            } else {
                MatchLabel::Unknown
            },
            distance: 0.1,
        }
    }

    #[test]
    fn test_no_results_is_identity() {
        let frame = RgbImage::from_pixel(64, 48, GREY);
        assert_eq!(annotate(&frame, &[]), frame);
    }

    #[test]
    fn test_box_colours_by_match_state() {
        let frame = RgbImage::from_pixel(200, 200, GREY);
        let out = annotate(
            &frame,
            &[result(40.0, 60.0, 50.0, 50.0, true), result(120.0, 60.0, 50.0, 50.0, false)],
        );
        // Left and bottom edges of each box.
        assert_eq!(*out.get_pixel(40, 100), MATCHED_COLOR);
        assert_eq!(*out.get_pixel(60, 109), MATCHED_COLOR);
        assert_eq!(*out.get_pixel(120, 100), UNKNOWN_COLOR);
        assert_eq!(*out.get_pixel(140, 109), UNKNOWN_COLOR);
        // Interior untouched.
        assert_eq!(*out.get_pixel(65, 90), GREY);
        // Input frame is not modified.
        assert_eq!(*frame.get_pixel(40, 100), GREY);
    }

    #[test]
    fn test_label_strip_above_box() {
        let frame = RgbImage::from_pixel(200, 200, GREY);
        let out = annotate(&frame, &[result(40.0, 60.0, 50.0, 50.0, true)]);
        // Strip height = 7*2 + 4 = 18, so it spans rows 42..60.
        assert_eq!(*out.get_pixel(41, 43), MATCHED_COLOR);
        assert_eq!(*out.get_pixel(41, 40), GREY);
        let strip_has_text = (42..60).any(|y| (42..100).any(|x| *out.get_pixel(x, y) == LABEL_TEXT_COLOR));
        assert!(strip_has_text);
    }

    #[test]
    fn test_label_inside_box_at_top_edge() {
        let frame = RgbImage::from_pixel(100, 100, GREY);
        let out = annotate(&frame, &[result(10.0, 0.0, 60.0, 60.0, false)]);
        assert_eq!(*out.get_pixel(11, 10), UNKNOWN_COLOR);
    }

    #[test]
    fn test_box_outside_frame_is_clipped() {
        let frame = RgbImage::from_pixel(50, 50, GREY);
        let out = annotate(
            &frame,
            &[result(-30.0, -30.0, 200.0, 200.0, true), result(500.0, 500.0, 10.0, 10.0, false)],
        );
        assert_eq!(out.dimensions(), (50, 50));
    }
}
