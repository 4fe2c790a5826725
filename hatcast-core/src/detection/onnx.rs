//! YOLO-style ONNX region proposal.
//!
//! Expects a model with a single `images` input of shape `[1, 3, S, S]` and an
//! `output0` tensor of shape `[1, 4 + C, N]` (box centre/size followed by one
//! score per class), which is what YOLOv8 face/eye exports produce.

use std::path::Path;

use anyhow::{Context, Result, ensure};
use fast_image_resize as fr;
use image::GrayImage;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use tracing::{debug, info};

use super::{DetectParams, Rect, RegionDetector};

/// Model input size (square).
const INPUT_SIZE: u32 = 640;
/// Minimum class score for a raw proposal.
const CONF_THRESHOLD: f32 = 0.45;
/// IoU threshold for NMS.
const IOU_THRESHOLD: f32 = 0.45;

/// Float box used before rounding to [`Rect`].
#[derive(Debug, Clone, Copy)]
struct Scored {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

impl Scored {
    fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    fn iou(&self, other: &Scored) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        inter / union
    }

    fn to_rect(self) -> Rect {
        Rect::new(
            self.x1.round() as i32,
            self.y1.round() as i32,
            self.width().round().max(0.0) as u32,
            self.height().round().max(0.0) as u32,
        )
    }
}

/// Wraps an ONNX Runtime session that proposes boxes of one class.
pub struct OnnxRegionDetector {
    session: Session,
    class_index: usize,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl OnnxRegionDetector {
    /// Load a model from `model_path`, reporting boxes of `class_index`.
    pub fn load<P: AsRef<Path>>(model_path: P, class_index: usize) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = Session::builder()
            .context("failed to create ORT session builder")?
            .with_intra_threads(1)
            .context("failed to set ORT intra threads")?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ONNX model {}", model_path.display()))?;
        info!(path = %model_path.display(), class_index, "loaded region proposal model");
        Ok(Self {
            session,
            class_index,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (INPUT_SIZE * INPUT_SIZE) as usize],
        })
    }

    fn preprocess(&mut self, image: &GrayImage) -> Result<ort::value::DynValue> {
        let src = fr::images::ImageRef::new(
            image.width(),
            image.height(),
            image.as_raw(),
            fr::PixelType::U8,
        )
        .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            INPUT_SIZE,
            INPUT_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize model downscale failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, S, S], luminance replicated into every plane.
        let size = (INPUT_SIZE * INPUT_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];
        let (first, rest) = tensor_data.split_at_mut(size);
        first
            .par_iter_mut()
            .zip(raw.par_iter())
            .for_each(|(out, &px)| *out = px as f32 / 255.0);
        let (second, third) = rest.split_at_mut(size);
        second.copy_from_slice(first);
        third.copy_from_slice(first);

        let shape = [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create model input tensor")?
            .into_dyn())
    }
}

impl RegionDetector for OnnxRegionDetector {
    fn detect(&mut self, image: &GrayImage, params: &DetectParams) -> Result<Vec<Rect>> {
        ensure!(
            image.width() > 0 && image.height() > 0,
            "cannot run detection on an empty image"
        );
        let input_tensor = self.preprocess(image)?;
        let class_index = self.class_index;
        let scale_x = image.width() as f32 / INPUT_SIZE as f32;
        let scale_y = image.height() as f32 / INPUT_SIZE as f32;
        let (img_w, img_h) = (image.width() as f32, image.height() as f32);

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("region proposal inference failed")?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract model output tensor")?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        ensure!(dims.len() == 3, "unexpected output rank {:?}", dims);
        let rows = dims[1] as usize;
        let num_proposals = dims[2] as usize;
        ensure!(
            rows > 4 + class_index,
            "model has {} classes, class {} requested",
            rows.saturating_sub(4),
            class_index
        );

        // Data layout: [cx, cy, w, h, cls0_score, cls1_score, ...], one
        // proposal per column.
        let candidates: Vec<Scored> = (0..num_proposals)
            .into_par_iter()
            .filter_map(|i| {
                let score = data[(4 + class_index) * num_proposals + i];
                if score < CONF_THRESHOLD {
                    return None;
                }
                let cx = data[i];
                let cy = data[num_proposals + i];
                let w = data[2 * num_proposals + i];
                let h = data[3 * num_proposals + i];
                Some(Scored {
                    x1: ((cx - w / 2.0) * scale_x).max(0.0),
                    y1: ((cy - h / 2.0) * scale_y).max(0.0),
                    x2: ((cx + w / 2.0) * scale_x).min(img_w),
                    y2: ((cy + h / 2.0) * scale_y).min(img_h),
                    confidence: score,
                })
            })
            .collect();

        let (min_w, min_h) = params.min_size;
        let raw = candidates.len();
        let boxes: Vec<Rect> = nms(candidates, IOU_THRESHOLD)
            .into_iter()
            .filter(|(_, support)| *support >= params.min_neighbors)
            .map(|(kept, _)| kept.to_rect())
            .filter(|r| r.width >= min_w && r.height >= min_h && !r.is_empty())
            .collect();
        debug!(raw, boxes = boxes.len(), "region proposals");
        Ok(boxes)
    }
}

/// Greedy NMS: sort by confidence descending, suppress overlapping boxes.
/// Each kept box comes with its support: itself plus the boxes it
/// suppressed.
fn nms(mut boxes: Vec<Scored>, iou_thresh: f32) -> Vec<(Scored, u32)> {
    boxes.sort_unstable_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<(Scored, u32)> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        let mut support = 1;
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && boxes[i].iou(&boxes[j]) > iou_thresh {
                suppressed[j] = true;
                support += 1;
            }
        }
        kept.push((boxes[i], support));
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Scored {
        Scored {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    #[test]
    fn nms_suppresses_overlaps_and_keeps_best() {
        let boxes = vec![
            scored(0.0, 0.0, 10.0, 10.0, 0.6),
            scored(1.0, 1.0, 11.0, 11.0, 0.9),
            scored(50.0, 50.0, 60.0, 60.0, 0.7),
        ];
        let kept = nms(boxes, IOU_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0.confidence, 0.9);
        assert_eq!(kept[1].0.confidence, 0.7);
    }

    #[test]
    fn nms_counts_overlapping_support() {
        let boxes = vec![
            scored(0.0, 0.0, 10.0, 10.0, 0.6),
            scored(1.0, 1.0, 11.0, 11.0, 0.9),
            scored(0.0, 1.0, 10.0, 11.0, 0.5),
            scored(50.0, 50.0, 60.0, 60.0, 0.7),
        ];
        let support: Vec<u32> = nms(boxes, IOU_THRESHOLD).iter().map(|(_, n)| *n).collect();
        assert_eq!(support, vec![3, 1]);
    }

    #[test]
    fn rounding_to_rect() {
        let r = scored(1.4, 2.6, 11.5, 12.6, 1.0).to_rect();
        assert_eq!(r, Rect::new(1, 3, 10, 10));
    }
}
