//! video — FFmpeg bridge
//!
//! Decodes a source video into RGB24 frames, hands each one to a per-frame
//! transform, and assembles the transformed frames into a video-only H.264
//! stream. Audio is not touched here; `mux` puts it back afterwards.
//!
//! Output dimensions are taken from the first transformed frame, so the
//! transform is free to resize (the pipeline always does when the source is
//! wider than `max_width`). They must stay fixed for the rest of the stream.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, decoder, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use std::path::Path;
use tracing::{debug, info};

use crate::error::Error;

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags for the YUV → RGB24 → YUV conversions.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
const ENCODE_CRF: &str = "20";
const ENCODE_PRESET: &str = "fast";

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// A black frame.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * 3],
            width,
            height,
            pts: 0,
        }
    }

    /// Wrap packed RGB24 data. Fails if `data` does not hold exactly
    /// `width * height` pixels.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB24 buffer for {width}x{height} must be {expected} bytes, got {}",
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            pts: 0,
        })
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * 3
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = y as usize * self.stride() + x as usize * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride();
        &self.data[start..start + self.stride()]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &mut self.data[start..start + stride]
    }
}

/// What a finished assembly produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssembleStats {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
}

/// Decode `input_path`, apply `frame_fn` to every frame in order, and write
/// the results to `output_path` as a video-only H.264 stream. One output
/// frame is written per decoded input frame.
pub fn assemble<P, Q, F>(input_path: P, output_path: Q, mut frame_fn: F) -> Result<AssembleStats>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(&mut RgbFrame) -> Result<()>,
{
    assemble_inner(
        input_path.as_ref(),
        output_path.as_ref(),
        0,
        &mut frame_fn,
        &mut |_, _| {},
    )
}

/// Same as [`assemble`] but calls `progress_fn(current_frame, total_frames)`
/// after every encoded frame.
pub fn assemble_with_progress<P, Q, F, G>(
    input_path: P,
    output_path: Q,
    total: u64,
    mut frame_fn: F,
    mut progress_fn: G,
) -> Result<AssembleStats>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(&mut RgbFrame) -> Result<()>,
    G: FnMut(u64, u64),
{
    assemble_inner(
        input_path.as_ref(),
        output_path.as_ref(),
        total,
        &mut frame_fn,
        &mut progress_fn,
    )
}

fn decode_error(file: &Path, stage: &'static str, source: impl Into<anyhow::Error>) -> Error {
    Error::Decode {
        file: file.to_path_buf(),
        stage,
        source: source.into(),
    }
}

fn encode_error(file: &Path, stage: &'static str, source: impl Into<anyhow::Error>) -> Error {
    Error::Encode {
        file: file.to_path_buf(),
        stage,
        source: source.into(),
    }
}

fn assemble_inner(
    input_path: &Path,
    output_path: &Path,
    total: u64,
    frame_fn: &mut dyn FnMut(&mut RgbFrame) -> Result<()>,
    progress_fn: &mut dyn FnMut(u64, u64),
) -> Result<AssembleStats> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    // ── Input ────────────────────────────────────────────────────────────────
    let mut ictx =
        format::input(&input_path).map_err(|e| decode_error(input_path, "open input", e))?;

    let input_video_stream = ictx
        .streams()
        .best(media::Type::Video)
        .ok_or_else(|| decode_error(input_path, "find video stream", anyhow!("no video stream")))?;
    let video_stream_index = input_video_stream.index();
    let time_base = input_video_stream.time_base();
    let frame_rate = input_video_stream.avg_frame_rate();

    let decoder_ctx = codec::context::Context::from_parameters(input_video_stream.parameters())
        .map_err(|e| decode_error(input_path, "build decoder context", e))?;
    let decoder = decoder_ctx
        .decoder()
        .video()
        .map_err(|e| decode_error(input_path, "open video decoder", e))?;

    let mut reader = FrameReader::new(decoder)
        .map_err(|e| decode_error(input_path, "create RGB scaler", e))?;

    info!(
        src_width = reader.width,
        src_height = reader.height,
        ?time_base,
        "opened input video stream"
    );

    let mut assembly = Assembly {
        input_path,
        output_path,
        time_base,
        frame_rate,
        sink: None,
        frames: 0,
        total,
        frame_fn,
        progress_fn,
    };

    // ── Decode / transform / encode loop ────────────────────────────────────
    for (stream, packet) in ictx.packets() {
        if stream.index() != video_stream_index {
            continue;
        }
        reader
            .decoder
            .send_packet(&packet)
            .map_err(|e| decode_error(input_path, "send packet", e))?;
        while let Some(mut rgb) = reader
            .receive(assembly.frames as i64)
            .map_err(|e| decode_error(input_path, "convert frame", e))?
        {
            assembly.handle(&mut rgb)?;
        }
    }

    // Flush decoder
    reader
        .decoder
        .send_eof()
        .map_err(|e| decode_error(input_path, "flush decoder", e))?;
    while let Some(mut rgb) = reader
        .receive(assembly.frames as i64)
        .map_err(|e| decode_error(input_path, "convert frame", e))?
    {
        assembly.handle(&mut rgb)?;
    }

    let frames = assembly.frames;
    let sink = assembly.sink.ok_or_else(|| {
        decode_error(input_path, "first frame", anyhow!("no decodable video frames"))
    })?;
    let (width, height) = (sink.width, sink.height);
    sink.finish()
        .map_err(|e| encode_error(output_path, "write trailer", e))?;

    info!(frames, width, height, output = %output_path.display(), "video assembly complete");
    Ok(AssembleStats {
        frames,
        width,
        height,
    })
}

/// Decoder plus the fixed-size scaler that turns decoded frames into RGB24.
struct FrameReader {
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    decoded: frame::Video,
    rgb: frame::Video,
    width: u32,
    height: u32,
}

impl FrameReader {
    fn new(decoder: decoder::Video) -> Result<Self> {
        let width = decoder.width();
        let height = decoder.height();
        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;
        Ok(Self {
            decoder,
            to_rgb,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            width,
            height,
        })
    }

    /// Pull the next decoded frame, if the decoder has one ready.
    fn receive(&mut self, fallback_pts: i64) -> Result<Option<RgbFrame>> {
        if self.decoder.receive_frame(&mut self.decoded).is_err() {
            return Ok(None);
        }
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

        Ok(Some(RgbFrame {
            data,
            width: self.width,
            height: self.height,
            pts: self.decoded.pts().unwrap_or(fallback_pts),
        }))
    }
}

/// Per-run state threaded through every decoded frame.
struct Assembly<'a> {
    input_path: &'a Path,
    output_path: &'a Path,
    time_base: Rational,
    frame_rate: Rational,
    sink: Option<VideoSink>,
    frames: u64,
    total: u64,
    frame_fn: &'a mut dyn FnMut(&mut RgbFrame) -> Result<()>,
    progress_fn: &'a mut dyn FnMut(u64, u64),
}

impl Assembly<'_> {
    fn handle(&mut self, rgb: &mut RgbFrame) -> Result<()> {
        (self.frame_fn)(rgb).with_context(|| {
            format!(
                "{}: transform failed on frame {}",
                self.input_path.display(),
                self.frames
            )
        })?;

        // ── Lazy encoder initialisation on first frame ───────────────────
        let sink = match &mut self.sink {
            Some(sink) => sink,
            slot @ None => {
                let sink = VideoSink::open(
                    self.output_path,
                    rgb.width,
                    rgb.height,
                    self.time_base,
                    self.frame_rate,
                )
                .map_err(|e| encode_error(self.output_path, "open encoder", e))?;
                slot.insert(sink)
            }
        };

        sink.push(rgb)
            .map_err(|e| encode_error(self.output_path, "encode frame", e))?;

        self.frames += 1;
        (self.progress_fn)(self.frames, self.total);
        if self.frames % 100 == 0 {
            debug!(frames = self.frames, "assembled frames");
        }
        Ok(())
    }
}

/// H.264 encoder and muxer for the video-only output.
struct VideoSink {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
}

impl VideoSink {
    fn open(
        output_path: &Path,
        width: u32,
        height: u32,
        time_base: Rational,
        frame_rate: Rational,
    ) -> Result<Self> {
        let mut octx = format::output(&output_path).context("could not create output context")?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found; is FFmpeg built with libx264?")?;

        let mut video_out_stream = octx.add_stream(encoder_codec)?;
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

        let encoder = builder
            .open_as_with(
                encoder_codec,
                ffmpeg::Dictionary::from_iter([("crf", ENCODE_CRF), ("preset", ENCODE_PRESET)]),
            )
            .context("failed to open H.264 encoder")?;

        video_out_stream.set_parameters(&encoder);
        let stream_index = video_out_stream.index();

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

        info!(width, height, "output dimensions determined; writing header");
        octx.write_header()
            .context("failed to write output header")?;

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            width,
            height,
        })
    }

    fn push(&mut self, rgb: &RgbFrame) -> Result<()> {
        if rgb.width != self.width || rgb.height != self.height {
            return Err(anyhow!(
                "frame size changed mid-stream: {}x{} → {}x{}",
                self.width,
                self.height,
                rgb.width,
                rgb.height
            ));
        }

        let row_len = self.width as usize * 3;
        let out_stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for (row, src) in rgb.data.chunks_exact(row_len).enumerate() {
            let dst_start = row * out_stride;
            plane[dst_start..dst_start + row_len].copy_from_slice(src);
        }

        // Convert RGB24 → YUV420P for encoder
        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(rgb.pts));

        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain()
    }

    fn finish(mut self) -> Result<()> {
        self.encoder.send_eof().context("encoder send_eof")?;
        self.drain()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        Ok(())
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain(&mut self) -> Result<()> {
        let out_time_base = self
            .octx
            .stream(self.stream_index)
            .context("output video stream disappeared")?
            .time_base();
        let mut encoded = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, out_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

/// Return the approximate total frame count for a video file (used for
/// progress reporting).  Falls back to 0 if the count cannot be determined.
pub fn total_frames<P: AsRef<Path>>(input_path: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input_path) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 && fps.denominator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_checks_length() {
        assert!(RgbFrame::from_raw(2, 2, vec![0; 12]).is_ok());
        assert!(RgbFrame::from_raw(2, 2, vec![0; 11]).is_err());
    }

    #[test]
    fn rows_and_pixels_are_row_major() {
        let data: Vec<u8> = (0..18).collect();
        let frame = RgbFrame::from_raw(3, 2, data).unwrap();
        assert_eq!(frame.stride(), 9);
        assert_eq!(frame.pixel(0, 1), [9, 10, 11]);
        assert_eq!(frame.row(1)[..3], [9, 10, 11]);
    }

    #[test]
    fn missing_input_is_decode_failure() {
        let err = assemble("/nonexistent/input.mp4", "/nonexistent/out.mp4", |_| Ok(()))
            .unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Decode { stage, .. }) => assert_eq!(*stage, "open input"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
