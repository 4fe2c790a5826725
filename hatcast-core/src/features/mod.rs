//! features — uniform local-binary-pattern texture descriptor
//!
//! A face candidate is reduced to a 26-bin histogram of rotation-invariant
//! uniform LBP codes (24 samples on a radius-3 circle):
//!
//! 1. area-resize the patch to 64×64,
//! 2. convert to luminance,
//! 3. equalise the histogram,
//! 4. label every pixel with its uniform LBP code,
//! 5. count labels and normalise by `total + 1e-7`.

use std::cell::RefCell;
use std::f64::consts::PI;

use anyhow::{Context, Result, bail};
use fast_image_resize as fr;
use image::{DynamicImage, GrayImage, RgbImage};

use crate::video::luma;

// ── Constants ────────────────────────────────────────────────────────────────

/// Canonical patch size fed to the LBP operator.
pub const LBP_IMAGE_SIZE: u32 = 64;
/// Sampling circle radius in pixels.
pub const LBP_RADIUS: f64 = 3.0;
/// Number of samples on the circle.
pub const LBP_N_POINTS: usize = 24;
/// Uniform codes `0..=P` plus one bin for all non-uniform patterns.
pub const LBP_BINS: usize = LBP_N_POINTS + 2;

const NORMALIZE_EPS: f64 = 1e-7;

// ── Descriptor ───────────────────────────────────────────────────────────────

/// Normalised LBP histogram. Entries are non-negative and sum to ~1.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor([f64; LBP_BINS]);

impl Descriptor {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.0.iter()
    }

    fn from_counts(counts: &[u64; LBP_BINS]) -> Self {
        let total = counts.iter().sum::<u64>() as f64;
        let mut bins = [0f64; LBP_BINS];
        for (bin, &count) in bins.iter_mut().zip(counts) {
            *bin = count as f64 / (total + NORMALIZE_EPS);
        }
        Self(bins)
    }
}

impl std::ops::Index<usize> for Descriptor {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

thread_local! {
    static PATCH_RESIZER: RefCell<fr::Resizer> = RefCell::new(fr::Resizer::new());
}

/// Extract the descriptor from a grayscale or colour patch of any size.
pub fn extract_lbp_features(patch: &DynamicImage) -> Result<Descriptor> {
    match patch {
        DynamicImage::ImageLuma8(gray) => lbp_features_gray(gray),
        other => lbp_features_rgb(&other.to_rgb8()),
    }
}

pub fn lbp_features_gray(patch: &GrayImage) -> Result<Descriptor> {
    ensure_non_empty(patch.width(), patch.height())?;
    let resized = resize_area(patch.as_raw(), patch.width(), patch.height(), fr::PixelType::U8)?;
    descriptor_from_canonical(resized)
}

pub fn lbp_features_rgb(patch: &RgbImage) -> Result<Descriptor> {
    ensure_non_empty(patch.width(), patch.height())?;
    let resized = resize_area(
        patch.as_raw(),
        patch.width(),
        patch.height(),
        fr::PixelType::U8x3,
    )?;
    let gray = resized
        .chunks_exact(3)
        .map(|px| luma(px[0], px[1], px[2]))
        .collect();
    descriptor_from_canonical(gray)
}

fn ensure_non_empty(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        bail!("cannot extract features from an empty {width}x{height} patch");
    }
    Ok(())
}

fn descriptor_from_canonical(gray: Vec<u8>) -> Result<Descriptor> {
    let canonical = GrayImage::from_raw(LBP_IMAGE_SIZE, LBP_IMAGE_SIZE, gray)
        .context("resized patch has unexpected size")?;
    let equalized = imageproc::contrast::equalize_histogram(&canonical);
    Ok(Descriptor::from_counts(&uniform_lbp_histogram(&equalized)))
}

/// Box-filter resize to the canonical size. Averages source pixels per
/// destination pixel, so downscaling does not alias.
fn resize_area(raw: &[u8], width: u32, height: u32, pixel: fr::PixelType) -> Result<Vec<u8>> {
    let src = fr::images::ImageRef::new(width, height, raw, pixel)
        .context("failed to create patch resize source")?;
    let mut dst = fr::images::Image::new(LBP_IMAGE_SIZE, LBP_IMAGE_SIZE, pixel);
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box));
    PATCH_RESIZER.with(|resizer| {
        resizer
            .borrow_mut()
            .resize(&src, &mut dst, Some(&options))
            .context("patch resize failed")
    })?;
    Ok(dst.into_vec())
}

// ── LBP operator ─────────────────────────────────────────────────────────────

/// Circle offsets `(dy, dx)` rounded to 5 decimals so cardinal samples land
/// exactly on pixel centres.
fn sample_offsets() -> [(f64, f64); LBP_N_POINTS] {
    let mut offsets = [(0.0, 0.0); LBP_N_POINTS];
    for (p, offset) in offsets.iter_mut().enumerate() {
        let theta = 2.0 * PI * p as f64 / LBP_N_POINTS as f64;
        *offset = (
            round5(-LBP_RADIUS * theta.sin()),
            round5(LBP_RADIUS * theta.cos()),
        );
    }
    offsets
}

fn round5(v: f64) -> f64 {
    (v * 1e5).round() / 1e5
}

/// Bilinear sample with a constant zero border.
fn sample(image: &GrayImage, y: f64, x: f64) -> f64 {
    let pixel = |yy: f64, xx: f64| -> f64 {
        if yy < 0.0 || xx < 0.0 || yy >= image.height() as f64 || xx >= image.width() as f64 {
            0.0
        } else {
            image.get_pixel(xx as u32, yy as u32)[0] as f64
        }
    };
    let (y0, x0) = (y.floor(), x.floor());
    let (y1, x1) = (y.ceil(), x.ceil());
    let (dy, dx) = (y - y0, x - x0);
    let top = (1.0 - dx) * pixel(y0, x0) + dx * pixel(y0, x1);
    let bottom = (1.0 - dx) * pixel(y1, x0) + dx * pixel(y1, x1);
    (1.0 - dy) * top + dy * bottom
}

/// Count uniform LBP labels over every pixel of `image`.
///
/// A pattern is uniform when its bit string (read around the circle without
/// wrapping) changes at most twice; its label is the number of set bits.
/// Every other pattern is labelled `P + 1`.
fn uniform_lbp_histogram(image: &GrayImage) -> [u64; LBP_BINS] {
    let offsets = sample_offsets();
    let mut counts = [0u64; LBP_BINS];
    let mut bits = [false; LBP_N_POINTS];

    for y in 0..image.height() {
        for x in 0..image.width() {
            let center = image.get_pixel(x, y)[0] as f64;
            for (bit, &(dy, dx)) in bits.iter_mut().zip(offsets.iter()) {
                *bit = sample(image, y as f64 + dy, x as f64 + dx) >= center;
            }
            let changes = bits.windows(2).filter(|w| w[0] != w[1]).count();
            let label = if changes <= 2 {
                bits.iter().filter(|&&b| b).count()
            } else {
                LBP_N_POINTS + 1
            };
            counts[label] += 1;
        }
    }

    counts
}
