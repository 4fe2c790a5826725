use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result, anyhow};
use image::{Rgb, RgbImage};

use crate::catalog::AccessoryAsset;
use crate::classifier::LinearClassifier;
use crate::detection::{
    BOX_COLOR, DetectionPipeline, FaceDetection, OnnxRegionDetector, Rect, draw_boxes,
};
use crate::overlay::OverlayCompositor;
use crate::video::RgbFrame;

/// Class reported by single-class face/eye models.
const MODEL_CLASS: usize = 0;

static BUNDLED_FONT: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");
/// Top-left corner of the accessory caption.
const CAPTION_ORIGIN: (i32, i32) = (10, 100);
const CAPTION_SCALE: f32 = 22.0;
const CAPTION_COLOR: [u8; 3] = [255, 0, 0];

/// Read a TrueType/OpenType font for the accessory caption.
pub fn load_font(path: &Path) -> Result<FontArc> {
    let bytes = fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    FontArc::try_from_vec(bytes).map_err(|e| anyhow!("invalid font {}: {e}", path.display()))
}

/// Per-frame detect → outline → overlay → caption stage.
pub struct FrameProcessor {
    detector: DetectionPipeline,
    compositor: OverlayCompositor,
    font: Option<FontArc>,
    show_boxes: bool,
    prof_frames: u64,
    prof_detect: Duration,
    prof_compose: Duration,
}

impl FrameProcessor {
    pub fn new(detector: DetectionPipeline) -> Self {
        let font = match FontArc::try_from_slice(BUNDLED_FONT) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!("bundled font unusable, captions disabled: {e}");
                None
            }
        };
        Self {
            detector,
            compositor: OverlayCompositor::new(),
            font,
            show_boxes: false,
            prof_frames: 0,
            prof_detect: Duration::ZERO,
            prof_compose: Duration::ZERO,
        }
    }

    /// Outline verified faces in green.
    pub fn set_show_boxes(&mut self, show: bool) {
        self.show_boxes = show;
    }

    /// Caption font; replaces the bundled one.
    pub fn set_font(&mut self, font: FontArc) {
        self.font = Some(font);
    }

    /// Build the ONNX-backed cascade. The eye model is optional; without it
    /// accessories are never rotated.
    pub fn load(face_model: &Path, eye_model: Option<&Path>, classifier: &Path) -> Result<Self> {
        let faces = OnnxRegionDetector::load(face_model, MODEL_CLASS)?;
        let classifier = LinearClassifier::load(classifier)?;
        let mut detector = DetectionPipeline::new(Box::new(faces), Box::new(classifier));
        if let Some(eye_model) = eye_model {
            let eyes = OnnxRegionDetector::load(eye_model, MODEL_CLASS)?;
            detector = detector.with_eye_detector(Box::new(eyes));
        } else {
            tracing::info!("no eye model configured; accessories will not be rotated");
        }
        Ok(Self::new(detector))
    }

    /// Detect faces in `frame`, then draw outlines and the accessory in place.
    pub fn process(
        &mut self,
        frame: &mut RgbFrame,
        accessory: Option<&AccessoryAsset>,
    ) -> Vec<FaceDetection> {
        // eye positions only matter for tilting an accessory
        let locate_eyes = accessory.is_some() && self.detector.has_eye_detector();

        let detect_start = Instant::now();
        let faces = self.detector.detect(frame, locate_eyes);
        self.prof_detect += detect_start.elapsed();

        let compose_start = Instant::now();
        if self.show_boxes {
            let boxes: Vec<Rect> = faces.iter().map(|f| f.bbox).collect();
            draw_boxes(frame, &boxes, BOX_COLOR);
        }
        if let Some(accessory) = accessory {
            for face in &faces {
                self.compositor
                    .compose(frame, face.bbox, Some(accessory), &face.eyes);
            }
            if let Some(font) = &self.font {
                draw_caption(frame, &format!("Hat: {}", accessory.name()), font);
            }
        }
        self.prof_compose += compose_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames % 300 == 0 {
            tracing::info!(
                frames = self.prof_frames,
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_detect.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                compose_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_compose.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "frame processing timings"
            );
        }

        faces
    }

    pub fn frames_processed(&self) -> u64 {
        self.prof_frames
    }
}

fn draw_caption(frame: &mut RgbFrame, text: &str, font: &FontArc) {
    let data = std::mem::take(&mut frame.data);
    let mut img = match RgbImage::from_raw(frame.width, frame.height, data) {
        Some(img) => img,
        None => {
            tracing::warn!("cannot draw a caption on a malformed frame");
            return;
        }
    };
    let (x, y) = CAPTION_ORIGIN;
    imageproc::drawing::draw_text_mut(
        &mut img,
        Rgb(CAPTION_COLOR),
        x,
        y,
        PxScale::from(CAPTION_SCALE),
        font,
        text,
    );
    frame.data = img.into_raw();
}
