use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use posecam_core::{
    camera::{CameraConstraints, CameraSource, FacingMode},
    config::{DecodingMode, RunConfig},
    estimation::OnnxPoseEstimator,
    pipeline::{CancelFlag, FrameLoop, FrameScheduler, Immediate, RefreshPaced},
    runtime,
    video::{annotate_file, total_frames, VideoWriter},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "posecam",
    version,
    about = "Real-time webcam pose overlay",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture the webcam, overlay detected skeletons, encode to a file.
    Live {
        /// Capture device (defaults to the user-facing camera)
        #[arg(long)]
        device: Option<PathBuf>,

        /// Prefer the outward-facing camera when no device is given
        #[arg(long)]
        rear: bool,

        /// Requested capture width (both width and height must be given)
        #[arg(long)]
        width: Option<u32>,

        /// Requested capture height
        #[arg(long)]
        height: Option<u32>,

        /// Pace the loop to this refresh rate instead of the device rate
        #[arg(long)]
        refresh_rate: Option<f64>,

        /// Output video path
        #[arg(short, long, default_value = "posecam.mp4")]
        output: PathBuf,

        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Overlay detected skeletons onto an existing video file.
    Video {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Output video path
        #[arg(short, long, default_value = "annotated.mp4")]
        output: PathBuf,

        #[command(flatten)]
        session: SessionArgs,
    },
}

/// Flags shared by both commands; each one overrides the matching field of
/// the (JSON or default) run configuration.
#[derive(Args)]
struct SessionArgs {
    /// Pose model ONNX path (defaults to the configured variant's filename)
    #[arg(long)]
    model: Option<PathBuf>,

    /// JSON run configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Minimum whole-pose confidence
    #[arg(long)]
    min_pose_confidence: Option<f32>,

    /// Minimum per-keypoint confidence
    #[arg(long)]
    min_part_confidence: Option<f32>,

    /// Maximum simultaneous detections
    #[arg(long)]
    max_detections: Option<usize>,

    /// De-duplication radius in pixels
    #[arg(long)]
    nms_radius: Option<f32>,

    /// Keep only the strongest detection
    #[arg(long)]
    single_pose: bool,

    /// Disable the mirrored selfie view
    #[arg(long)]
    no_mirror: bool,

    /// Draw overlays on black instead of the camera image
    #[arg(long)]
    no_video: bool,

    /// Do not draw skeleton segments
    #[arg(long)]
    no_skeleton: bool,

    /// Do not draw keypoints
    #[arg(long)]
    no_points: bool,

    /// Draw a bounding box around each detection
    #[arg(long)]
    show_bounding_box: bool,
}

impl SessionArgs {
    fn build_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(model) = &self.model {
            config.model.model_path = Some(model.clone());
        }
        if let Some(v) = self.min_pose_confidence {
            config.detection.min_pose_confidence = v;
        }
        if let Some(v) = self.min_part_confidence {
            config.detection.min_part_confidence = v;
        }
        if let Some(v) = self.max_detections {
            config.detection.max_detections = v;
        }
        if let Some(v) = self.nms_radius {
            config.detection.nms_radius = v;
        }
        if self.single_pose {
            config.detection.decoding = DecodingMode::SinglePose;
        }
        if self.no_mirror {
            config.detection.flip_horizontal = false;
        }
        if self.no_video {
            config.output.show_video = false;
        }
        if self.no_skeleton {
            config.output.show_skeleton = false;
        }
        if self.no_points {
            config.output.show_points = false;
        }
        if self.show_bounding_box {
            config.output.show_bounding_box = true;
        }
        config.validate()?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    runtime::configure_ort_dylib();

    let cli = Cli::parse();

    match cli.command {
        Commands::Live {
            device,
            rear,
            width,
            height,
            refresh_rate,
            output,
            max_frames,
            duration,
            session,
        } => cmd_live(
            device,
            rear,
            width,
            height,
            refresh_rate,
            output,
            max_frames,
            duration,
            session,
        ),
        Commands::Video {
            input,
            output,
            session,
        } => cmd_video(input, output, session),
    }
}

// ── Live capture ──────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn cmd_live(
    device: Option<PathBuf>,
    rear: bool,
    width: Option<u32>,
    height: Option<u32>,
    refresh_rate: Option<f64>,
    output: PathBuf,
    max_frames: Option<u64>,
    duration: Option<u64>,
    session: SessionArgs,
) -> Result<()> {
    let config = session.build_config()?;
    info!("live pose overlay");
    info!("  output : {}", output.display());

    let pb = spinner("Loading pose model…");
    let estimator = OnnxPoseEstimator::load(&config.model)?;
    pb.finish_with_message("Model loaded.");

    let constraints = CameraConstraints {
        device,
        facing: if rear {
            FacingMode::Environment
        } else {
            FacingMode::User
        },
        width,
        height,
        frame_rate: None,
    };

    let mut camera = match CameraSource::open(&constraints) {
        Ok(camera) => camera,
        Err(e) => {
            // Persistent user-visible failure surface; the loop never starts.
            error!("{e}");
            eprintln!("posecam: {e}");
            return Err(e.into());
        }
    };

    let mut writer = VideoWriter::create(
        &output,
        camera.width(),
        camera.height(),
        camera.frame_rate(),
        camera.time_base(),
        None,
    )
    .context("failed to open output video")?;

    let cancel = CancelFlag::new();
    if let Some(secs) = duration {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            cancel.cancel();
        });
    }

    // The device read blocks at the camera's own rate; explicit pacing is
    // opt-in via --refresh-rate.
    let mut paced;
    let mut immediate;
    let scheduler: &mut dyn FrameScheduler = match refresh_rate {
        Some(rate) => {
            paced = RefreshPaced::new(rate);
            &mut paced
        }
        None => {
            immediate = Immediate;
            &mut immediate
        }
    };

    let mut frame_loop = FrameLoop::new(estimator, config, cancel)?;

    let pb = spinner("Capturing…");
    let frames = frame_loop.run(&mut camera, scheduler, max_frames, |frame| {
        pb.tick();
        writer.write_frame(frame)
    })?;
    let encoded = writer.finish()?;
    pb.finish_with_message(format!("Captured {frames} frames."));
    info!(frames, encoded, output = %output.display(), "live session finished");

    Ok(())
}

// ── Offline annotation ────────────────────────────────────────────────────────

fn cmd_video(input: PathBuf, output: PathBuf, session: SessionArgs) -> Result<()> {
    let config = session.build_config()?;
    info!("annotating video");
    info!("  input  : {}", input.display());
    info!("  output : {}", output.display());

    let pb = spinner("Loading pose model…");
    let estimator = OnnxPoseEstimator::load(&config.model)?;
    pb.finish_with_message("Model loaded.");

    let mut frame_loop = FrameLoop::new(estimator, config, CancelFlag::new())?;

    let total = total_frames(&input);
    let pb = if total > 0 {
        progress(total)
    } else {
        spinner("Annotating…")
    };
    let pb2 = pb.clone();

    let frames = annotate_file(&input, &output, move |frame| {
        frame_loop.step(frame);
        pb2.inc(1);
    })
    .context("annotation failed")?;

    pb.finish_with_message("Done.");
    info!(frames, "annotated video written");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn progress(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}]").unwrap(),
    );
    pb
}
