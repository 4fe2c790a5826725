//! overlay — scale, tilt and alpha-blend an accessory onto a face
//!
//! Given a verified face box the accessory is
//!
//! 1. scaled to `face.width × scale_factor` (aspect preserved),
//! 2. rotated to follow the eye line when both eyes are known,
//! 3. centred over the face and lifted by `y_offset_factor × height`,
//! 4. clipped to the frame and alpha-blended in place.

use anyhow::{Context, Result, bail};
use fast_image_resize as fr;
use image::{Rgba, RgbaImage};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use tracing::{debug, warn};

use crate::catalog::{AccessoryAsset, AccessorySettings};
use crate::detection::{Point, Rect};
use crate::video::RgbFrame;

/// Head tilt beyond this is clamped.
pub const MAX_ROTATION_DEG: f32 = 25.0;

/// Tilt of the eye line in degrees, clamped to ±[`MAX_ROTATION_DEG`].
///
/// The left eye is the one with the smaller x, so the input order does not
/// matter. Anything other than exactly two eyes, or a vertical eye line,
/// gives 0.
pub fn rotation_angle(eyes: &[Point]) -> f32 {
    let [a, b] = eyes else {
        return 0.0;
    };
    let (left, right) = if b.x < a.x { (b, a) } else { (a, b) };
    let dx = (right.x - left.x) as f32;
    let dy = (right.y - left.y) as f32;
    if dx == 0.0 {
        return 0.0;
    }
    dy.atan2(dx)
        .to_degrees()
        .clamp(-MAX_ROTATION_DEG, MAX_ROTATION_DEG)
}

/// Where an accessory of `asset_width × asset_height` lands for `face`,
/// before clipping. `None` when the scaled accessory is degenerate.
pub fn placement(
    face: &Rect,
    asset_width: u32,
    asset_height: u32,
    settings: &AccessorySettings,
) -> Option<Rect> {
    if face.is_empty() || asset_width == 0 || asset_height == 0 {
        return None;
    }
    let width = (face.width as f32 * settings.scale_factor) as u32;
    let height = (width as f32 * asset_height as f32 / asset_width as f32) as u32;
    if width == 0 || height == 0 {
        return None;
    }
    let x = face.x + (face.width / 2) as i32 - (width / 2) as i32;
    let x = (x as f32 + settings.x_offset_factor * width as f32) as i32;
    let y = (face.y as f32 - settings.y_offset_factor * height as f32) as i32;
    Some(Rect::new(x, y, width, height))
}

/// Reusable compositing context (keeps the resizer's scratch buffers warm).
pub struct OverlayCompositor {
    resizer: fr::Resizer,
}

impl OverlayCompositor {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
        }
    }

    /// Composite `accessory` onto `frame` above `face`.
    ///
    /// Returns `true` when any pixel was written. A zero-area face, a missing
    /// accessory or a placement entirely off-frame leave the frame untouched;
    /// so does any internal failure, which is logged.
    pub fn compose(
        &mut self,
        frame: &mut RgbFrame,
        face: Rect,
        accessory: Option<&AccessoryAsset>,
        eyes: &[Point],
    ) -> bool {
        let Some(accessory) = accessory else {
            return false;
        };
        if face.is_empty() {
            return false;
        }
        match self.try_compose(frame, face, accessory, eyes) {
            Ok(written) => written,
            Err(e) => {
                warn!(name = accessory.name(), ?face, "overlay skipped: {e:#}");
                false
            }
        }
    }

    fn try_compose(
        &mut self,
        frame: &mut RgbFrame,
        face: Rect,
        accessory: &AccessoryAsset,
        eyes: &[Point],
    ) -> Result<bool> {
        let source = accessory.image();
        let Some(target) = placement(
            &face,
            source.width(),
            source.height(),
            accessory.settings(),
        ) else {
            return Ok(false);
        };
        let Some(visible) = target.clip(frame.width, frame.height) else {
            return Ok(false);
        };
        if !frame.is_well_formed() {
            bail!(
                "malformed frame: {}x{} with {} bytes",
                frame.width,
                frame.height,
                frame.data.len()
            );
        }

        let mut scaled = self.scale(source, target.width, target.height)?;
        let angle = rotation_angle(eyes);
        if angle != 0.0 {
            scaled = tilt(&scaled, angle);
        }
        debug!(?target, angle, "placing accessory");

        let offset_x = (visible.x - target.x) as u32;
        let offset_y = (visible.y - target.y) as u32;
        if offset_x + visible.width > scaled.width() || offset_y + visible.height > scaled.height()
        {
            bail!(
                "accessory region {}x{} at ({offset_x}, {offset_y}) exceeds the {}x{} image",
                visible.width,
                visible.height,
                scaled.width(),
                scaled.height()
            );
        }

        blend(frame, &scaled, visible, offset_x, offset_y);
        Ok(true)
    }

    fn scale(&mut self, source: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
        if source.dimensions() == (width, height) {
            return Ok(source.clone());
        }
        let src = fr::images::ImageRef::new(
            source.width(),
            source.height(),
            source.as_raw(),
            fr::PixelType::U8x4,
        )
        .context("failed to create fast_image_resize source for accessory")?;
        let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x4);
        let options =
            fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize accessory scale failed")?;
        RgbaImage::from_raw(width, height, dst.into_vec())
            .context("scaled accessory has unexpected size")
    }
}

impl Default for OverlayCompositor {
    fn default() -> Self {
        Self::new()
    }
}

/// Rotate about the centre, counter-clockwise on screen for a positive
/// angle. Uncovered corners become fully transparent.
fn tilt(image: &RgbaImage, angle_deg: f32) -> RgbaImage {
    // imageproc turns clockwise for a positive theta
    rotate_about_center(
        image,
        -angle_deg.to_radians(),
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
    )
}

/// `out = (1 - α)·bg + α·fg` over `region`, reading the accessory from
/// `(offset_x, offset_y)` onwards. Both ranges are checked by the caller.
fn blend(frame: &mut RgbFrame, accessory: &RgbaImage, region: Rect, offset_x: u32, offset_y: u32) {
    let stride = frame.width as usize * 3;
    for row in 0..region.height {
        let start = (region.y as u32 + row) as usize * stride + region.x as usize * 3;
        let line = &mut frame.data[start..start + region.width as usize * 3];
        for (col, bg) in line.chunks_exact_mut(3).enumerate() {
            let fg = accessory.get_pixel(offset_x + col as u32, offset_y + row);
            let alpha = fg[3] as f32 / 255.0;
            if alpha == 0.0 {
                continue;
            }
            for c in 0..3 {
                bg[c] = ((1.0 - alpha) * bg[c] as f32 + alpha * fg[c] as f32) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, px: [u8; 4]) -> AccessoryAsset {
        AccessoryAsset::new(
            "TEST",
            RgbaImage::from_pixel(width, height, Rgba(px)),
            AccessorySettings::default(),
        )
    }

    fn pixel(frame: &RgbFrame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width + x) * 3) as usize;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2]]
    }

    #[test]
    fn level_eyes_give_zero_angle() {
        assert_eq!(rotation_angle(&[Point::new(10, 40), Point::new(50, 40)]), 0.0);
        assert_eq!(rotation_angle(&[]), 0.0);
        assert_eq!(rotation_angle(&[Point::new(10, 40)]), 0.0);
    }

    #[test]
    fn eye_order_does_not_matter() {
        let a = Point::new(10, 40);
        let b = Point::new(50, 50);
        let forward = rotation_angle(&[a, b]);
        assert!(forward > 0.0);
        assert_eq!(forward, rotation_angle(&[b, a]));
        let up = rotation_angle(&[Point::new(10, 50), Point::new(50, 40)]);
        assert!((up + forward).abs() < 1e-5);
    }

    #[test]
    fn steep_eye_line_is_clamped() {
        assert_eq!(rotation_angle(&[Point::new(0, 0), Point::new(1, 100)]), MAX_ROTATION_DEG);
        assert_eq!(rotation_angle(&[Point::new(0, 100), Point::new(1, 0)]), -MAX_ROTATION_DEG);
        assert_eq!(rotation_angle(&[Point::new(5, 0), Point::new(5, 100)]), 0.0);
    }

    #[test]
    fn default_placement_sits_above_face() {
        let face = Rect::new(100, 100, 80, 80);
        let target = placement(&face, 10, 5, &AccessorySettings::default()).unwrap();
        assert_eq!(target, Rect::new(84, 55, 112, 56));
    }

    #[test]
    fn x_offset_shifts_by_accessory_width() {
        let face = Rect::new(100, 100, 100, 100);
        let settings = AccessorySettings {
            scale_factor: 1.0,
            y_offset_factor: 0.0,
            x_offset_factor: 0.5,
        };
        let target = placement(&face, 10, 10, &settings).unwrap();
        assert_eq!(target, Rect::new(150, 100, 100, 100));
    }

    #[test]
    fn zero_area_face_leaves_frame_unchanged() {
        let mut frame = RgbFrame::black(64, 64);
        let before = frame.clone();
        let mut compositor = OverlayCompositor::new();
        let hat = solid(4, 4, [255, 0, 0, 255]);
        assert!(!compositor.compose(&mut frame, Rect::new(10, 30, 0, 20), Some(&hat), &[]));
        assert_eq!(frame, before);
    }

    #[test]
    fn missing_accessory_leaves_frame_unchanged() {
        let mut frame = RgbFrame::black(64, 64);
        let before = frame.clone();
        let mut compositor = OverlayCompositor::new();
        assert!(!compositor.compose(&mut frame, Rect::new(10, 30, 20, 20), None, &[]));
        assert_eq!(frame, before);
    }

    #[test]
    fn opaque_accessory_paints_only_its_rectangle() {
        let mut frame = RgbFrame::black(320, 240);
        let mut compositor = OverlayCompositor::new();
        let hat = solid(10, 5, [255, 0, 0, 255]);
        assert!(compositor.compose(&mut frame, Rect::new(100, 100, 80, 80), Some(&hat), &[]));
        assert_eq!(pixel(&frame, 84, 55), [255, 0, 0]);
        assert_eq!(pixel(&frame, 195, 110), [255, 0, 0]);
        assert_eq!(pixel(&frame, 83, 55), [0, 0, 0]);
        assert_eq!(pixel(&frame, 196, 60), [0, 0, 0]);
        assert_eq!(pixel(&frame, 140, 54), [0, 0, 0]);
        assert_eq!(pixel(&frame, 140, 111), [0, 0, 0]);
    }

    #[test]
    fn accessory_hanging_off_frame_is_clipped() {
        let mut frame = RgbFrame::black(100, 100);
        let mut compositor = OverlayCompositor::new();
        let hat = solid(10, 10, [0, 0, 255, 255]);
        // lifted above the top edge and past the left edge
        assert!(compositor.compose(&mut frame, Rect::new(-10, 10, 40, 40), Some(&hat), &[]));
        assert_eq!(pixel(&frame, 0, 0), [0, 0, 255]);
        assert_eq!(pixel(&frame, 99, 99), [0, 0, 0]);
    }

    #[test]
    fn accessory_fully_off_frame_is_noop() {
        let mut frame = RgbFrame::black(100, 100);
        let before = frame.clone();
        let mut compositor = OverlayCompositor::new();
        let hat = solid(10, 10, [0, 0, 255, 255]);
        assert!(!compositor.compose(&mut frame, Rect::new(300, 300, 40, 40), Some(&hat), &[]));
        assert_eq!(frame, before);
    }

    #[test]
    fn half_alpha_blends_linearly() {
        let mut frame = RgbFrame::black(100, 100);
        let mut compositor = OverlayCompositor::new();
        let hat = solid(10, 10, [200, 200, 200, 128]);
        compositor.compose(&mut frame, Rect::new(30, 60, 40, 40), Some(&hat), &[]);
        let [r, g, b] = pixel(&frame, 50, 40);
        let expected = 200.0 * 128.0 / 255.0;
        for v in [r, g, b] {
            assert!((v as f32 - expected).abs() <= 1.5, "{v} vs {expected}");
        }
    }

    #[test]
    fn transparent_pixels_keep_background() {
        let mut frame = RgbFrame::black(100, 100);
        frame.data.fill(77);
        let before = frame.clone();
        let mut compositor = OverlayCompositor::new();
        let hat = solid(10, 10, [255, 255, 255, 0]);
        compositor.compose(&mut frame, Rect::new(30, 60, 40, 40), Some(&hat), &[]);
        assert_eq!(frame, before);
    }

    #[test]
    fn tilted_eyes_rotate_accessory() {
        let face = Rect::new(100, 100, 100, 100);
        let hat = solid(20, 10, [255, 0, 0, 255]);
        let eyes = [Point::new(120, 120), Point::new(180, 160)];
        let target = placement(&face, 20, 10, hat.settings()).unwrap();

        let mut level = RgbFrame::black(400, 300);
        let mut tilted = RgbFrame::black(400, 300);
        let mut compositor = OverlayCompositor::new();
        compositor.compose(&mut level, face, Some(&hat), &[]);
        compositor.compose(&mut tilted, face, Some(&hat), &eyes);

        let corner = (target.x as u32 + 1, target.y as u32 + 1);
        assert_eq!(pixel(&level, corner.0, corner.1), [255, 0, 0]);
        // the rotation exposes transparent corners
        assert_eq!(pixel(&tilted, corner.0, corner.1), [0, 0, 0]);
        let centre = target.center();
        assert_eq!(pixel(&tilted, centre.x as u32, centre.y as u32), [255, 0, 0]);
    }

    #[test]
    fn positive_angle_lifts_right_end() {
        // eye line sloping down to the right
        let angle = rotation_angle(&[Point::new(10, 40), Point::new(50, 50)]);
        assert!((angle - 14.036).abs() < 0.01);

        let bar = RgbaImage::from_fn(41, 41, |_, y| {
            if (19..=21).contains(&y) {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        let tilted = tilt(&bar, angle);
        assert!(tilted.get_pixel(35, 16)[3] > 0);
        assert_eq!(tilted.get_pixel(35, 24)[3], 0);
        assert!(tilted.get_pixel(5, 24)[3] > 0);
        assert_eq!(tilted.get_pixel(5, 16)[3], 0);
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let mut frame = RgbFrame::black(50, 50);
        frame.data.truncate(30);
        let mut compositor = OverlayCompositor::new();
        let hat = solid(4, 4, [255, 0, 0, 255]);
        assert!(!compositor.compose(&mut frame, Rect::new(10, 30, 20, 20), Some(&hat), &[]));
        assert_eq!(frame.data.len(), 30);
    }
}
