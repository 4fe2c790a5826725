//! detection — proposal + verification cascade
//!
//! A fast [`RegionDetector`] over-generates face candidates, each candidate
//! is verified by the LBP descriptor + [`Classifier`], and the survivors are
//! optionally refined with eye positions from a second detector.

mod onnx;

pub use onnx::OnnxRegionDetector;

use anyhow::{Result, bail};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::rect::Rect as DrawRect;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::classifier::Classifier;
use crate::features::lbp_features_gray;
use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// Smallest face candidate considered, in pixels.
pub const MIN_FACE_SIZE: u32 = 50;
/// Eye boxes must be at least this fraction of the face box.
const MIN_EYE_FRACTION: f32 = 0.15;
/// Outline colour for verified faces.
pub const BOX_COLOR: [u8; 3] = [0, 255, 0];
/// Outline width in pixels, drawn inwards from the box edge.
const BOX_THICKNESS: u32 = 2;

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Integer axis-aligned box in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    /// Intersection with a `width × height` image, `None` when disjoint.
    pub fn clip(&self, width: u32, height: u32) -> Option<Rect> {
        let x1 = self.x.max(0);
        let y1 = self.y.max(0);
        let x2 = self.right().min(width as i32);
        let y2 = self.bottom().min(height as i32);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Rect::new(x1, y1, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

// ── Region detector capability ───────────────────────────────────────────────

/// Tuning knobs passed to a [`RegionDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Pyramid step between scales. Only multi-scale sliding-window
    /// detectors use it; single-pass models see every scale at once.
    pub scale_factor: f32,
    /// How many overlapping raw hits a region needs to be reported,
    /// itself included.
    pub min_neighbors: u32,
    /// Smallest reported box, `(width, height)`.
    pub min_size: (u32, u32),
}

impl DetectParams {
    pub const FACE: Self = Self {
        scale_factor: 1.1,
        min_neighbors: 5,
        min_size: (MIN_FACE_SIZE, MIN_FACE_SIZE),
    };

    /// Looser parameters for eyes inside `face`.
    pub fn eyes_in(face: &Rect) -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 4,
            min_size: (
                (face.width as f32 * MIN_EYE_FRACTION) as u32,
                (face.height as f32 * MIN_EYE_FRACTION) as u32,
            ),
        }
    }
}

/// Coarse region proposal over a grayscale image (faces, eyes, ...).
pub trait RegionDetector: Send {
    fn detect(&mut self, image: &GrayImage, params: &DetectParams) -> Result<Vec<Rect>>;
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// A verified face, with both eye centres when they were located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceDetection {
    pub bbox: Rect,
    /// Empty, or exactly two eye centres in frame coordinates.
    pub eyes: Vec<Point>,
}

pub struct DetectionPipeline {
    faces: Box<dyn RegionDetector>,
    eyes: Option<Box<dyn RegionDetector>>,
    classifier: Box<dyn Classifier>,
    face_params: DetectParams,
}

impl DetectionPipeline {
    pub fn new(faces: Box<dyn RegionDetector>, classifier: Box<dyn Classifier>) -> Self {
        Self {
            faces,
            eyes: None,
            classifier,
            face_params: DetectParams::FACE,
        }
    }

    /// Enable eye localisation (needed for accessory rotation).
    pub fn with_eye_detector(mut self, eyes: Box<dyn RegionDetector>) -> Self {
        self.eyes = Some(eyes);
        self
    }

    pub fn has_eye_detector(&self) -> bool {
        self.eyes.is_some()
    }

    /// Run the cascade on `frame`. Detections keep the proposal order.
    ///
    /// Never fails once the frame is valid: a broken candidate is logged and
    /// skipped, a failing proposal stage yields no detections.
    pub fn detect(&mut self, frame: &RgbFrame, locate_eyes: bool) -> Vec<FaceDetection> {
        let gray = match frame.to_gray() {
            Ok(gray) => gray,
            Err(e) => {
                warn!("skipping frame: {e:#}");
                return Vec::new();
            }
        };
        self.detect_gray(&gray, locate_eyes)
    }

    pub fn detect_gray(&mut self, gray: &GrayImage, locate_eyes: bool) -> Vec<FaceDetection> {
        let candidates = match self.faces.detect(gray, &self.face_params) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("face proposal error: {e:#}");
                return Vec::new();
            }
        };

        let verified = self.verify(gray, &candidates);
        debug!(
            candidates = candidates.len(),
            verified = verified.len(),
            "face verification"
        );

        verified
            .into_iter()
            .map(|bbox| {
                let eyes = if locate_eyes {
                    self.locate_eyes(gray, &bbox)
                } else {
                    Vec::new()
                };
                FaceDetection { bbox, eyes }
            })
            .collect()
    }

    /// Keep the candidates the classifier labels as faces, in input order.
    fn verify(&self, gray: &GrayImage, candidates: &[Rect]) -> Vec<Rect> {
        let classifier = &*self.classifier;
        let decisions: Vec<Result<bool>> = candidates
            .par_iter()
            .map(|rect| {
                let patch = crop(gray, rect)?;
                let descriptor = lbp_features_gray(&patch)?;
                classifier.predict(&descriptor)
            })
            .collect();

        candidates
            .iter()
            .zip(decisions)
            .filter_map(|(rect, decision)| match decision {
                Ok(true) => Some(*rect),
                Ok(false) => None,
                Err(e) => {
                    warn!(?rect, "skipping candidate: {e:#}");
                    None
                }
            })
            .collect()
    }

    /// Centres of the two largest eye boxes, or nothing when fewer than two
    /// eyes are found.
    fn locate_eyes(&mut self, gray: &GrayImage, face: &Rect) -> Vec<Point> {
        let Some(detector) = self.eyes.as_mut() else {
            return Vec::new();
        };
        let Some(visible) = face.clip(gray.width(), gray.height()) else {
            return Vec::new();
        };
        let found = crop(gray, &visible)
            .and_then(|patch| detector.detect(&patch, &DetectParams::eyes_in(face)));
        let mut eyes = match found {
            Ok(eyes) => eyes,
            Err(e) => {
                warn!(?face, "eye detection error: {e:#}");
                return Vec::new();
            }
        };
        if eyes.len() < 2 {
            return Vec::new();
        }
        eyes.sort_by_key(|e| std::cmp::Reverse(e.area()));
        eyes.truncate(2);
        eyes.iter()
            .map(|e| {
                let c = e.center();
                Point::new(c.x + visible.x, c.y + visible.y)
            })
            .collect()
    }
}

/// Copy the part of `rect` that lies inside `image`.
fn crop(image: &GrayImage, rect: &Rect) -> Result<GrayImage> {
    let Some(r) = rect.clip(image.width(), image.height()) else {
        bail!(
            "candidate {:?} lies outside the {}x{} frame",
            rect,
            image.width(),
            image.height()
        );
    };
    Ok(image::imageops::crop_imm(image, r.x as u32, r.y as u32, r.width, r.height).to_image())
}

// ── Debug rendering ──────────────────────────────────────────────────────────

/// Draw hollow boxes onto a frame's RGB data in-place.
pub fn draw_boxes(frame: &mut RgbFrame, boxes: &[Rect], color: [u8; 3]) {
    if boxes.is_empty() {
        return;
    }
    // borrow the frame buffer and hand it back afterwards
    let data = std::mem::take(&mut frame.data);
    let mut img = match RgbImage::from_raw(frame.width, frame.height, data) {
        Some(img) => img,
        None => {
            warn!("cannot draw boxes on a malformed frame");
            return;
        }
    };

    for rect in boxes.iter().filter(|r| !r.is_empty()) {
        for inset in 0..BOX_THICKNESS {
            let (w, h) = (rect.width.saturating_sub(2 * inset), rect.height.saturating_sub(2 * inset));
            if w == 0 || h == 0 {
                break;
            }
            let outline = DrawRect::at(rect.x + inset as i32, rect.y + inset as i32).of_size(w, h);
            imageproc::drawing::draw_hollow_rect_mut(&mut img, outline, Rgb(color));
        }
    }

    frame.data = img.into_raw();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Descriptor;
    use image::Luma;
    use std::sync::{Arc, Mutex};

    /// Replays a fixed list of boxes and records the params it was given.
    struct FixedDetector {
        boxes: Vec<Rect>,
        seen: Arc<Mutex<Vec<DetectParams>>>,
    }

    impl FixedDetector {
        fn boxed(boxes: Vec<Rect>) -> (Box<dyn RegionDetector>, Arc<Mutex<Vec<DetectParams>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let det = Self {
                boxes,
                seen: Arc::clone(&seen),
            };
            (Box::new(det), seen)
        }
    }

    impl RegionDetector for FixedDetector {
        fn detect(&mut self, _image: &GrayImage, params: &DetectParams) -> Result<Vec<Rect>> {
            self.seen.lock().unwrap().push(*params);
            Ok(self.boxes.clone())
        }
    }

    struct FailingDetector;

    impl RegionDetector for FailingDetector {
        fn detect(&mut self, _: &GrayImage, _: &DetectParams) -> Result<Vec<Rect>> {
            anyhow::bail!("model exploded")
        }
    }

    /// Accepts everything.
    struct AcceptAll;

    impl Classifier for AcceptAll {
        fn predict(&self, _: &Descriptor) -> Result<bool> {
            Ok(true)
        }
    }

    /// Accepts patches whose LBP histogram is dominated by the all-ones
    /// bin, i.e. flat regions.
    struct FlatOnly;

    impl Classifier for FlatOnly {
        fn predict(&self, d: &Descriptor) -> Result<bool> {
            Ok(d[24] > 0.5)
        }
    }

    fn test_image() -> GrayImage {
        // left half flat, right half hashed noise
        GrayImage::from_fn(200, 100, |x, y| {
            if x < 100 {
                Luma([100])
            } else {
                let h = (x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263))
                    .wrapping_mul(1_274_126_177);
                Luma([(h >> 24) as u8])
            }
        })
    }

    #[test]
    fn clip_handles_partial_and_disjoint_boxes() {
        assert_eq!(
            Rect::new(-10, -5, 30, 20).clip(100, 100),
            Some(Rect::new(0, 0, 20, 15))
        );
        assert_eq!(Rect::new(90, 90, 30, 30).clip(100, 100), Some(Rect::new(90, 90, 10, 10)));
        assert_eq!(Rect::new(100, 0, 10, 10).clip(100, 100), None);
        assert_eq!(Rect::new(5, 5, 0, 10).clip(100, 100), None);
    }

    #[test]
    fn keeps_only_verified_candidates_in_order() {
        let flat_a = Rect::new(10, 10, 60, 60);
        let noisy = Rect::new(120, 10, 60, 60);
        let flat_b = Rect::new(20, 20, 50, 50);
        let (faces, _) = FixedDetector::boxed(vec![flat_a, noisy, flat_b]);
        let mut pipeline = DetectionPipeline::new(faces, Box::new(FlatOnly));
        let found = pipeline.detect_gray(&test_image(), false);
        let boxes: Vec<Rect> = found.iter().map(|f| f.bbox).collect();
        assert_eq!(boxes, vec![flat_a, flat_b]);
        assert!(found.iter().all(|f| f.eyes.is_empty()));
    }

    #[test]
    fn candidate_outside_frame_is_skipped() {
        let inside = Rect::new(0, 0, 60, 60);
        let outside = Rect::new(500, 500, 60, 60);
        let (faces, _) = FixedDetector::boxed(vec![outside, inside]);
        let mut pipeline = DetectionPipeline::new(faces, Box::new(AcceptAll));
        let found = pipeline.detect_gray(&test_image(), false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bbox, inside);
    }

    #[test]
    fn proposal_failure_yields_no_detections() {
        let mut pipeline = DetectionPipeline::new(Box::new(FailingDetector), Box::new(AcceptAll));
        assert!(pipeline.detect_gray(&test_image(), true).is_empty());
    }

    #[test]
    fn face_params_are_forwarded() {
        let (faces, seen) = FixedDetector::boxed(vec![]);
        let mut pipeline = DetectionPipeline::new(faces, Box::new(AcceptAll));
        pipeline.detect_gray(&test_image(), false);
        assert_eq!(seen.lock().unwrap().as_slice(), &[DetectParams::FACE]);
    }

    #[test]
    fn two_largest_eyes_mapped_to_frame_coordinates() {
        let face = Rect::new(20, 10, 60, 60);
        let (faces, _) = FixedDetector::boxed(vec![face]);
        let (eyes, seen) = FixedDetector::boxed(vec![
            Rect::new(0, 0, 4, 4),    // smallest, dropped
            Rect::new(10, 20, 10, 10), // centre (15, 25)
            Rect::new(40, 22, 12, 12), // centre (46, 28)
        ]);
        let mut pipeline = DetectionPipeline::new(faces, Box::new(AcceptAll)).with_eye_detector(eyes);
        let found = pipeline.detect_gray(&test_image(), true);
        assert_eq!(found[0].eyes, vec![Point::new(66, 38), Point::new(35, 35)]);
        assert_eq!(seen.lock().unwrap()[0].min_size, (9, 9));
    }

    #[test]
    fn single_eye_gives_no_coordinates() {
        let (faces, _) = FixedDetector::boxed(vec![Rect::new(0, 0, 60, 60)]);
        let (eyes, _) = FixedDetector::boxed(vec![Rect::new(5, 5, 10, 10)]);
        let mut pipeline = DetectionPipeline::new(faces, Box::new(AcceptAll)).with_eye_detector(eyes);
        let found = pipeline.detect_gray(&test_image(), true);
        assert!(found[0].eyes.is_empty());
    }

    #[test]
    fn eyes_skipped_when_not_requested() {
        let (faces, _) = FixedDetector::boxed(vec![Rect::new(0, 0, 60, 60)]);
        let (eyes, seen) = FixedDetector::boxed(vec![Rect::new(5, 5, 10, 10), Rect::new(30, 5, 10, 10)]);
        let mut pipeline = DetectionPipeline::new(faces, Box::new(AcceptAll)).with_eye_detector(eyes);
        let found = pipeline.detect_gray(&test_image(), false);
        assert!(found[0].eyes.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn draw_boxes_outlines_rect() {
        let mut frame = RgbFrame::black(20, 20);
        draw_boxes(&mut frame, &[Rect::new(2, 2, 5, 5)], BOX_COLOR);
        let img = frame.into_image().unwrap();
        assert_eq!(img.get_pixel(2, 2).0, BOX_COLOR);
        assert_eq!(img.get_pixel(4, 4).0, [0, 0, 0]);
    }

    #[test]
    fn outline_is_two_pixels_wide() {
        let mut frame = RgbFrame::black(30, 30);
        draw_boxes(&mut frame, &[Rect::new(5, 5, 12, 10)], BOX_COLOR);
        let img = frame.into_image().unwrap();
        assert_eq!(img.get_pixel(5, 10).0, BOX_COLOR);
        assert_eq!(img.get_pixel(6, 10).0, BOX_COLOR);
        assert_eq!(img.get_pixel(7, 10).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(16, 14).0, BOX_COLOR);
        assert_eq!(img.get_pixel(15, 13).0, BOX_COLOR);
        assert_eq!(img.get_pixel(4, 10).0, [0, 0, 0]);
    }
}
