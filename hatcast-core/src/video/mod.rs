//! video — capture bridge, frame helpers and JPEG encoding
//!
//! Frames travel through the pipeline as packed RGB24 buffers. Capture goes
//! through FFmpeg so the same code path serves V4L2/AVFoundation/DirectShow
//! devices, network streams and plain video files.

use anyhow::{Context, Result, bail};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, decoder, format, frame, media, software::scaling};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GrayImage, RgbImage};
use tracing::{debug, info};

/// Scaler used for decode → RGB24.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single video frame in RGB24 format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
}

impl RgbFrame {
    /// A black frame of the given size.
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height * 3) as usize],
            width,
            height,
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }

    pub fn into_image(self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data)
            .context("frame buffer does not match its dimensions")
    }

    /// Byte length a well-formed buffer of this size must have.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }

    /// BT.601 luminance copy of the frame.
    pub fn to_gray(&self) -> Result<GrayImage> {
        if !self.is_well_formed() {
            bail!(
                "malformed frame: {}x{} with {} bytes",
                self.width,
                self.height,
                self.data.len()
            );
        }
        let luma = self.data.chunks_exact(3).map(|px| luma(px[0], px[1], px[2])).collect();
        GrayImage::from_raw(self.width, self.height, luma)
            .context("failed to build grayscale image")
    }
}

#[inline]
pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32 + 0.5) as u8
}

/// Mirror a frame around its vertical axis in-place (selfie view).
pub fn mirror_horizontal(frame: &mut RgbFrame) {
    let width = frame.width as usize;
    if width < 2 || !frame.is_well_formed() {
        return;
    }
    for row in frame.data.chunks_exact_mut(width * 3) {
        for x in 0..width / 2 {
            let left = x * 3;
            let right = (width - 1 - x) * 3;
            for c in 0..3 {
                row.swap(left + c, right + c);
            }
        }
    }
}

/// Encode a frame as baseline JPEG at `quality` (1–100).
pub fn encode_jpeg(frame: &RgbFrame, quality: u8) -> Result<Vec<u8>> {
    if !frame.is_well_formed() {
        bail!(
            "cannot encode malformed frame: {}x{} with {} bytes",
            frame.width,
            frame.height,
            frame.data.len()
        );
    }
    let mut out = Vec::with_capacity(frame.data.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
        .context("JPEG encode failed")?;
    Ok(out)
}

// ── Capture ──────────────────────────────────────────────────────────────────

/// Anything that yields frames for the streaming loop.
pub trait FrameSource {
    /// Read the next frame. `Ok(None)` signals the end of the stream; an
    /// error means this frame was unreadable and the caller may retry.
    fn read_frame(&mut self) -> Result<Option<RgbFrame>>;
}

/// How to open the capture device.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Device path, stream URL or video file.
    pub url: String,
    /// Force an FFmpeg input format (`v4l2`, `avfoundation`, `dshow`, ...).
    pub format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl CaptureOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: None,
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

/// FFmpeg-backed capture: demux, decode and convert to RGB24 one frame at a
/// time.
pub struct CaptureSource {
    ictx: format::context::Input,
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    decoded: frame::Video,
    rgb: frame::Video,
    width: u32,
    height: u32,
    frame_count: u64,
    eof: bool,
}

impl CaptureSource {
    pub fn open(options: &CaptureOptions) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        ffmpeg::device::register_all();

        let ictx = match &options.format {
            Some(name) => {
                let mut dict = ffmpeg::Dictionary::new();
                dict.set("video_size", &format!("{}x{}", options.width, options.height));
                dict.set("framerate", &options.frame_rate.to_string());
                let device_format = ffmpeg::device::input::video()
                    .find(|f| f.name() == name.as_str())
                    .with_context(|| format!("FFmpeg input format not available: {name}"))?;
                format::open_with(&options.url, &format::Format::Input(device_format), dict)
                    .with_context(|| format!("cannot open capture device {}", options.url))?
                    .input()
            }
            None => format::input(&options.url)
                .with_context(|| format!("cannot open capture source {}", options.url))?,
        };

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in capture source")?;
        let stream_index = stream.index();

        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        let src_pixel_fmt = decoder.format();

        let to_rgb = scaling::Context::get(
            src_pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            url = %options.url,
            width,
            height,
            ?src_pixel_fmt,
            "opened capture source"
        );

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            width,
            height,
            frame_count: 0,
            eof: false,
        })
    }

    fn convert_decoded(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let stride = self.rgb.stride(0);
        let row_len = self.width as usize * 3;
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity(row_len * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        self.frame_count += 1;
        if self.frame_count % 300 == 0 {
            debug!(frames = self.frame_count, "captured frames");
        }

        Ok(RgbFrame {
            data,
            width: self.width,
            height: self.height,
        })
    }
}

impl FrameSource for CaptureSource {
    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_decoded().map(Some);
            }
            if self.eof {
                return Ok(None);
            }
            match self.ictx.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("decoder send_packet")?;
                    }
                }
                None => {
                    self.decoder.send_eof().ok();
                    self.eof = true;
                }
            }
        }
    }
}
