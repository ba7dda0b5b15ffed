//! camera — webcam acquisition through FFmpeg's device layer
//!
//! Opens a video input device with the session's constraints and yields
//! RGB24 frames. Open failures are classified into the user-facing
//! `CameraError` taxonomy; every one of them is terminal for the session
//! (no retries, the frame loop never starts).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, frame, media, software::scaling, Dictionary};
use thiserror::Error;
use tracing::info;

use crate::video::{compact_rgb, FrameSource, RgbFrame};

/// Bilinear matches the conversion quality used on the encode side.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// Which camera to prefer when no explicit device is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    /// The user-facing ("selfie") camera — the first capture device.
    #[default]
    User,
    /// The outward-facing camera, where one exists.
    Environment,
}

/// Native rendering of `{audio: false, video: {facingMode, width?, height?}}`.
#[derive(Debug, Clone, Default)]
pub struct CameraConstraints {
    /// Explicit device node / index. Overrides `facing` when set.
    pub device: Option<PathBuf>,
    pub facing: FacingMode,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

impl CameraConstraints {
    /// The device to open: explicit path, else the platform default for the
    /// requested facing mode.
    pub fn device_path(&self) -> PathBuf {
        if let Some(device) = &self.device {
            return device.clone();
        }
        let index = match self.facing {
            FacingMode::User => 0,
            FacingMode::Environment => 1,
        };
        if cfg!(target_os = "macos") {
            // avfoundation addresses devices by index
            PathBuf::from(index.to_string())
        } else {
            PathBuf::from(format!("/dev/video{index}"))
        }
    }

    fn capture_options(&self) -> Dictionary<'static> {
        let mut options = Dictionary::new();
        if let (Some(w), Some(h)) = (self.width, self.height) {
            options.set("video_size", &format!("{w}x{h}"));
        }
        if let Some(fps) = self.frame_rate {
            options.set("framerate", &fps.to_string());
        }
        options
    }
}

/// Why the camera could not be used. All variants are surfaced to the user
/// as a visible message before exit.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("video capture is not available: {reason}")]
    Unavailable { reason: String },

    #[error("camera access was denied for {device} — check device permissions")]
    PermissionDenied { device: String },

    #[error("camera backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Map an FFmpeg open failure onto the camera error taxonomy.
fn classify_open_error(error: ffmpeg::Error, device: &Path) -> CameraError {
    match error {
        ffmpeg::Error::Other { errno: libc::EACCES } | ffmpeg::Error::Other { errno: libc::EPERM } => {
            CameraError::PermissionDenied {
                device: device.display().to_string(),
            }
        }
        ffmpeg::Error::Other { errno: libc::ENOENT }
        | ffmpeg::Error::Other { errno: libc::ENODEV }
        | ffmpeg::Error::Other { errno: libc::ENXIO }
        | ffmpeg::Error::Other { errno: libc::EBUSY } => CameraError::Unavailable {
            reason: format!("no usable capture device at {}: {error}", device.display()),
        },
        ffmpeg::Error::DemuxerNotFound | ffmpeg::Error::ProtocolNotFound => {
            CameraError::Unavailable {
                reason: format!("no capture backend for {}: {error}", device.display()),
            }
        }
        other => CameraError::Backend(
            anyhow::Error::new(other)
                .context(format!("failed to open camera {}", device.display())),
        ),
    }
}

/// Exclusive handle on one capture device, yielding RGB24 frames.
pub struct CameraSource {
    ictx: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    width: u32,
    height: u32,
    frame_rate: ffmpeg::Rational,
    time_base: ffmpeg::Rational,
    frame_index: u64,
    eof_sent: bool,
    /// First frame, decoded during `open` so the loop never sees an unsized
    /// or not-yet-decoded stream.
    pending: Option<RgbFrame>,
}

impl CameraSource {
    pub fn open(constraints: &CameraConstraints) -> std::result::Result<Self, CameraError> {
        ffmpeg::init().map_err(|e| CameraError::Unavailable {
            reason: format!("FFmpeg initialisation failed: {e}"),
        })?;
        ffmpeg::device::register_all();

        let device = constraints.device_path();
        if cfg!(target_os = "linux") && constraints.device.is_none() && !device.exists() {
            return Err(CameraError::Unavailable {
                reason: format!("capture device {} does not exist", device.display()),
            });
        }

        let ictx = format::input_with_dictionary(&device, constraints.capture_options())
            .map_err(|e| classify_open_error(e, &device))?;

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| CameraError::Unavailable {
                reason: format!("{} exposes no video stream", device.display()),
            })?;
        let stream_index = stream.index();
        let frame_rate = stream.avg_frame_rate();
        let time_base = stream.time_base();

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build camera decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open camera decoder")?;

        let (width, height) = (decoder.width(), decoder.height());
        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create camera to-RGB scaler")?;

        info!(
            device = %device.display(),
            width,
            height,
            fps = ?frame_rate,
            "opened capture device"
        );

        let mut source = Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            width,
            height,
            frame_rate,
            time_base,
            frame_index: 0,
            eof_sent: false,
            pending: None,
        };

        // Block until the device has delivered a decodable frame before
        // handing the source to the loop.
        source.pending = source.decode_next().map_err(CameraError::Backend)?;
        if source.pending.is_none() {
            return Err(CameraError::Unavailable {
                reason: format!("{} produced no frames", device.display()),
            });
        }

        Ok(source)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Frame rate reported by the device; raw devices that report none fall
    /// back to 30 fps.
    pub fn frame_rate(&self) -> ffmpeg::Rational {
        if self.frame_rate.numerator() > 0 && self.frame_rate.denominator() > 0 {
            self.frame_rate
        } else {
            ffmpeg::Rational::new(30, 1)
        }
    }

    /// Time base frame timestamps are expressed in.
    pub fn time_base(&self) -> ffmpeg::Rational {
        self.time_base
    }

    fn decode_next(&mut self) -> Result<Option<RgbFrame>> {
        let mut decoded = frame::Video::empty();
        let mut rgb_av = frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.to_rgb
                    .run(&decoded, &mut rgb_av)
                    .context("camera to-RGB scaling failed")?;
                let pts = decoded.pts().unwrap_or(self.frame_index as i64);
                self.frame_index += 1;
                return Ok(Some(compact_rgb(&rgb_av, self.width, self.height, pts)));
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("camera decoder send_packet")?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    if self.eof_sent {
                        return Ok(None);
                    }
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context("failed to read from capture device"))
                }
            }
        }
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        if let Some(first) = self.pending.take() {
            return Ok(Some(first));
        }
        self.decode_next()
    }
}
