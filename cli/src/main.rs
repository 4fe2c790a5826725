use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hatcast_core::{
    catalog::{AccessoryAsset, HatCatalog},
    pipeline::{FrameProcessor, load_font},
    runtime::configure_ort_dylib,
    server::{ServerConfig, StreamStats, StreamingServer},
    video::{CaptureOptions, CaptureSource, RgbFrame},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "hatcast",
    version,
    about = "Live face detection with virtual hats, streamed over UDP",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture, decorate and stream frames to registered UDP clients.
    Serve(ServeArgs),

    /// Run detection + overlay on a single image and save the result.
    Infer(InferArgs),
}

/// Model and font files shared by both commands.
#[derive(Args)]
struct ModelArgs {
    /// Face proposal ONNX model
    #[arg(long, default_value = "models/face.onnx")]
    face_model: PathBuf,

    /// Eye proposal ONNX model (enables hat rotation)
    #[arg(long)]
    eye_model: Option<PathBuf>,

    /// Trained verification classifier (JSON)
    #[arg(long, default_value = "models/face_classifier.json")]
    classifier: PathBuf,

    /// Font for the accessory caption (bundled DejaVu Sans Mono otherwise)
    #[arg(long)]
    font: Option<PathBuf>,
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    models: ModelArgs,

    /// Capture device, stream URL or video file
    #[arg(short, long, default_value = "/dev/video0")]
    device: String,

    /// Force an FFmpeg input format (v4l2, avfoundation, dshow, ...)
    #[arg(long)]
    input_format: Option<String>,

    /// Requested capture width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Requested capture height
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Requested capture frame rate
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Directory of accessory images (+ optional JSON metadata)
    #[arg(long, default_value = "hats")]
    hats: PathBuf,

    /// JSON server config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<IpAddr>,

    /// UDP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Largest datagram, header included
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// JPEG quality (1–100)
    #[arg(long)]
    quality: Option<u8>,

    /// Do not mirror the camera image
    #[arg(long)]
    no_mirror: bool,

    /// Do not outline detected faces
    #[arg(long)]
    no_boxes: bool,
}

#[derive(Args)]
struct InferArgs {
    #[command(flatten)]
    models: ModelArgs,

    /// Input image
    #[arg(short, long)]
    input: PathBuf,

    /// Output image
    #[arg(short, long, default_value = "hatcast.png")]
    output: PathBuf,

    /// Accessory image to place on every face
    #[arg(long)]
    hat: Option<PathBuf>,

    /// Do not outline detected faces
    #[arg(long)]
    no_boxes: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Infer(args) => cmd_infer(args),
    }
}

fn load_processor(models: &ModelArgs) -> Result<FrameProcessor> {
    let mut processor = FrameProcessor::load(
        &models.face_model,
        models.eye_model.as_deref(),
        &models.classifier,
    )
    .context("failed to load detection models")?;
    if let Some(path) = &models.font {
        processor.set_font(load_font(path)?);
    }
    Ok(processor)
}

// ── serve ─────────────────────────────────────────────────────────────────────

fn server_config(args: &ServeArgs) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let host = args.host.unwrap_or(config.bind.ip());
    let port = args.port.unwrap_or(config.bind.port());
    config.bind = SocketAddr::new(host, port);
    if let Some(size) = args.max_packet_size {
        config.max_packet_size = size;
    }
    if let Some(quality) = args.quality {
        config.jpeg_quality = quality;
    }
    if args.no_mirror {
        config.mirror = false;
    }
    if args.no_boxes {
        config.show_boxes = false;
    }
    config.validate()?;
    Ok(config)
}

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let config = server_config(&args)?;
    info!("hatcast server");
    info!("  device : {}", args.device);
    info!("  hats   : {}", args.hats.display());
    info!("  bind   : {}", config.bind);

    configure_ort_dylib();
    let catalog = Arc::new(HatCatalog::load(&args.hats)?);
    let mut processor = load_processor(&args.models)?;
    let mut server = StreamingServer::bind(config, catalog)?;
    let run_flag = server.run_flag();

    let capture = CaptureOptions {
        url: args.device,
        format: args.input_format,
        width: args.width,
        height: args.height,
        frame_rate: args.fps,
    };

    // The FFmpeg scaler is not Send, so the source is opened on the worker.
    let mut task = tokio::task::spawn_blocking(move || -> Result<StreamStats> {
        let mut source = CaptureSource::open(&capture)?;
        server.run(&mut source, &mut processor)
    });

    let stats = tokio::select! {
        joined = &mut task => joined.context("streaming task failed")??,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("shutdown requested");
            run_flag.stop();
            task.await.context("streaming task failed")??
        }
    };

    info!(
        frames = stats.frames_sent,
        packets = stats.packets_sent,
        read_failures = stats.read_failures,
        "server stopped"
    );
    Ok(())
}

// ── infer ─────────────────────────────────────────────────────────────────────

fn cmd_infer(args: InferArgs) -> Result<()> {
    info!("single image inference");
    info!("  input  : {}", args.input.display());
    info!("  output : {}", args.output.display());

    let image = image::open(&args.input)
        .with_context(|| format!("failed to open image: {}", args.input.display()))?
        .to_rgb8();
    let mut frame = RgbFrame::from_image(image);

    let hat = args.hat.as_deref().map(AccessoryAsset::load).transpose()?;

    configure_ort_dylib();
    let mut processor = load_processor(&args.models)?;
    processor.set_show_boxes(!args.no_boxes);

    let faces = processor.process(&mut frame, hat.as_ref());
    info!(faces = faces.len(), "detection finished");

    frame
        .into_image()?
        .save(&args.output)
        .with_context(|| format!("failed to save {}", args.output.display()))?;
    info!("saved {}", args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Serve(args) => args,
            Commands::Infer(_) => panic!("expected serve"),
        }
    }

    #[test]
    fn serve_defaults_match_server_defaults() {
        let args = parse(&["hatcast", "serve"]);
        assert_eq!(server_config(&args).unwrap(), ServerConfig::default());
    }

    #[test]
    fn serve_flags_override_config() {
        let args = parse(&[
            "hatcast",
            "serve",
            "--host",
            "127.0.0.1",
            "--port",
            "9999",
            "--quality",
            "80",
            "--no-mirror",
        ]);
        let config = server_config(&args).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.jpeg_quality, 80);
        assert!(!config.mirror);
        assert!(config.show_boxes);
    }

    #[test]
    fn infer_outlines_faces_by_default() {
        let cli = Cli::try_parse_from(["hatcast", "infer", "-i", "in.png"]).unwrap();
        let Commands::Infer(args) = cli.command else {
            panic!("expected infer");
        };
        assert!(!args.no_boxes);
        assert!(args.models.font.is_none());

        let cli = Cli::try_parse_from(["hatcast", "infer", "-i", "in.png", "--no-boxes"]).unwrap();
        let Commands::Infer(args) = cli.command else {
            panic!("expected infer");
        };
        assert!(args.no_boxes);
    }

    #[test]
    fn invalid_quality_is_rejected() {
        let args = parse(&["hatcast", "serve", "--quality", "0"]);
        assert!(server_config(&args).is_err());
    }
}
