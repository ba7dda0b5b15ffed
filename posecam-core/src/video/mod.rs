//! video — FFmpeg frame transport
//!
//! `RgbFrame` is the unit every stage of the pipeline works on. This module
//! owns the encode half (`VideoWriter`) and the offline path
//! (`annotate_file`), which decodes an existing file, applies a per-frame
//! transform, and re-encodes it with the audio stream copied through.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use std::path::Path;
use tracing::{debug, info};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Bilinear is fast and good enough for the pixel-format conversions here.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame in packed RGB24, row-major, plus its
/// presentation timestamp in the source time base.
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

/// Anything that yields frames for the loop: the webcam, a file decoder, or a
/// synthetic source in tests. `Ok(None)` means the stream ended.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>>;
}

/// Copy a decoded RGB24 AVFrame into a compact `RgbFrame`, dropping any
/// stride padding.
pub(crate) fn compact_rgb(av: &frame::Video, width: u32, height: u32, pts: i64) -> RgbFrame {
    let stride = av.stride(0);
    let raw = av.data(0);
    let row_len = width as usize * 3;
    let mut data = Vec::with_capacity(row_len * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        data.extend_from_slice(&raw[start..start + row_len]);
    }
    RgbFrame {
        data,
        width,
        height,
        pts,
    }
}

/// H.264 encoder + muxer for annotated output.
///
/// The header is written during `create`, so the frame size is fixed for the
/// writer's lifetime (the overlay never changes frame dimensions).
pub struct VideoWriter {
    octx: format::context::Output,
    video_encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    video_stream_index: usize,
    audio_stream_index: Option<usize>,
    time_base: Rational,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl VideoWriter {
    /// Open `path` for writing `width`×`height` H.264 at `frame_rate`.
    /// `audio` adds a stream-copied audio track (offline path only).
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        frame_rate: Rational,
        time_base: Rational,
        audio: Option<&codec::Parameters>,
    ) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let mut octx = format::output(&path).context("could not create output context")?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

        let mut video_out = octx.add_stream(encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = builder
            .open_as_with(
                encoder_codec,
                ffmpeg::Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;
        video_out.set_parameters(&video_encoder);
        let video_stream_index = video_out.index();

        let audio_stream_index = match audio {
            Some(params) => {
                let mut audio_out = octx.add_stream(codec::Id::None)?;
                audio_out.set_parameters(params.clone());
                Some(audio_out.index())
            }
            None => None,
        };

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header()
            .context("failed to write output header")?;
        info!(width, height, "output stream opened");

        Ok(Self {
            octx,
            video_encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            video_stream_index,
            audio_stream_index,
            time_base,
            width,
            height,
            frames_written: 0,
        })
    }

    /// Encode one frame. The frame must match the writer's dimensions.
    pub fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        anyhow::ensure!(
            frame.width == self.width && frame.height == self.height,
            "frame size {}x{} does not match writer {}x{}",
            frame.width,
            frame.height,
            self.width,
            self.height,
        );

        let stride = self.rgb_frame.stride(0);
        let row_len = self.width as usize * 3;
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.height as usize {
            plane[row * stride..row * stride + row_len]
                .copy_from_slice(&frame.data[row * row_len..(row + 1) * row_len]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(frame.pts));

        self.video_encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain_encoder()?;

        self.frames_written += 1;
        if self.frames_written % 100 == 0 {
            debug!(frames = self.frames_written, "encoded frames");
        }
        Ok(())
    }

    /// Stream-copy one audio packet (no re-encoding).
    pub fn write_audio_packet(
        &mut self,
        mut packet: ffmpeg::Packet,
        source_time_base: Rational,
    ) -> Result<()> {
        let Some(audio_index) = self.audio_stream_index else {
            return Ok(());
        };
        packet.set_stream(audio_index);
        packet.rescale_ts(
            source_time_base,
            self.octx.stream(audio_index).unwrap().time_base(),
        );
        packet
            .write_interleaved(&mut self.octx)
            .context("failed to write audio packet")
    }

    /// Flush the encoder and finalize the container.
    pub fn finish(mut self) -> Result<u64> {
        self.video_encoder.send_eof().ok();
        self.drain_encoder()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(frames = self.frames_written, "output finalised");
        Ok(self.frames_written)
    }

    fn drain_encoder(&mut self) -> Result<()> {
        let mut encoded = ffmpeg::Packet::empty();
        while self.video_encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.video_stream_index);
            encoded.rescale_ts(
                self.time_base,
                self.octx
                    .stream(self.video_stream_index)
                    .unwrap()
                    .time_base(),
            );
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

/// Decode `input`, apply `frame_fn` to every video frame, and write the
/// result to `output`. Audio is stream-copied. The transform must preserve
/// frame dimensions.
pub fn annotate_file<P, Q, F>(input: P, output: Q, mut frame_fn: F) -> Result<u64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(&mut RgbFrame),
{
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    let mut ictx = format::input(&input).context("could not open input file")?;

    let video_stream_index = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?
        .index();
    let audio_stream_index = ictx.streams().best(media::Type::Audio).map(|s| s.index());

    let video_stream = ictx.stream(video_stream_index).unwrap();
    let time_base = video_stream.time_base();
    let frame_rate = video_stream.avg_frame_rate();
    let audio_params = audio_stream_index.map(|i| ictx.stream(i).unwrap().parameters());

    let decoder_ctx = codec::context::Context::from_parameters(video_stream.parameters())
        .context("failed to build decoder context")?;
    let mut decoder = decoder_ctx
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let (width, height) = (decoder.width(), decoder.height());
    info!(width, height, "opened input video stream");

    let mut to_rgb = scaling::Context::get(
        decoder.format(),
        width,
        height,
        format::Pixel::RGB24,
        width,
        height,
        SCALE_FLAGS,
    )
    .context("failed to create to-RGB scaler")?;

    let mut writer = VideoWriter::create(
        &output,
        width,
        height,
        frame_rate,
        time_base,
        audio_params.as_ref(),
    )?;

    let mut decoded = frame::Video::empty();
    let mut rgb_av = frame::Video::empty();
    let mut frame_count = 0i64;

    let mut drain_decoder = |decoder: &mut ffmpeg::decoder::Video,
                             to_rgb: &mut scaling::Context,
                             writer: &mut VideoWriter,
                             decoded: &mut frame::Video,
                             rgb_av: &mut frame::Video,
                             frame_count: &mut i64,
                             frame_fn: &mut F|
     -> Result<()> {
        while decoder.receive_frame(decoded).is_ok() {
            to_rgb
                .run(decoded, rgb_av)
                .context("to-RGB scaling failed")?;
            let pts = decoded.pts().unwrap_or(*frame_count);
            let mut rgb = compact_rgb(rgb_av, width, height, pts);
            frame_fn(&mut rgb);
            writer.write_frame(&rgb)?;
            *frame_count += 1;
        }
        Ok(())
    };

    for (stream, packet) in ictx.packets() {
        let index = stream.index();
        if Some(index) == audio_stream_index {
            writer.write_audio_packet(packet.clone(), stream.time_base())?;
            continue;
        }
        if index != video_stream_index {
            continue;
        }
        decoder
            .send_packet(&packet)
            .context("decoder send_packet")?;
        drain_decoder(
            &mut decoder,
            &mut to_rgb,
            &mut writer,
            &mut decoded,
            &mut rgb_av,
            &mut frame_count,
            &mut frame_fn,
        )?;
    }

    decoder.send_eof().ok();
    drain_decoder(
        &mut decoder,
        &mut to_rgb,
        &mut writer,
        &mut decoded,
        &mut rgb_av,
        &mut frame_count,
        &mut frame_fn,
    )?;

    writer.finish()
}

/// Approximate total frame count for a file (progress reporting only);
/// 0 when it cannot be determined.
pub fn total_frames<P: AsRef<Path>>(input: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    // Fall back to duration × fps.
    let duration = stream.duration();
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if duration > 0 && tb.denominator() > 0 && fps.numerator() > 0 {
        let seconds = duration as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}
