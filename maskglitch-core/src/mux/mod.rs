//! mux — put the source's audio back next to the processed video
//!
//! Both streams are stream-copied (no re-encode) into a `.partial` file that
//! only replaces the final name once the trailer is written. Audio packets
//! past the end of the processed video are dropped.
//!
//! Codec tags from the source container are cleared so the MP4 muxer picks
//! its own (an `.avi` carries WAVE tags MP4 rejects). Audio codecs MP4 cannot
//! hold at all are not re-encoded; the video is passed through silent.

use anyhow::anyhow;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, util::rational::Rational, Packet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Error;

/// How the final file came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxOutcome {
    /// Video and source audio were muxed together.
    Muxed,
    /// No audio to add; the video-only file was renamed into place.
    PassThrough,
    /// The source audio cannot be stream-copied into MP4; the video-only
    /// file was renamed into place.
    AudioDropped,
}

/// What `remux_into` did.
enum Remux {
    Written,
    NoAudio,
    UnsupportedAudio(codec::Id),
}

/// Audio codecs the MP4 muxer accepts as a stream copy.
fn mp4_can_copy_audio(id: codec::Id) -> bool {
    matches!(
        id,
        codec::Id::AAC
            | codec::Id::MP3
            | codec::Id::MP2
            | codec::Id::AC3
            | codec::Id::EAC3
            | codec::Id::OPUS
            | codec::Id::FLAC
            | codec::Id::ALAC
    )
}

/// Drop the source container's codec tag so the output muxer chooses one.
fn clear_codec_tag(params: &mut codec::Parameters) {
    // SAFETY: `params` wraps a live AVCodecParameters owned by its stream.
    unsafe {
        (*params.as_mut_ptr()).codec_tag = 0;
    }
}

fn mux_error(file: &Path, stage: &'static str, source: impl Into<anyhow::Error>) -> Error {
    Error::Mux {
        file: file.to_path_buf(),
        stage,
        source: source.into(),
    }
}

/// `out/name.mp4` → `out/name.partial.mp4` (the container is still guessed
/// from the extension).
pub fn partial_path(final_path: &Path) -> PathBuf {
    let ext = final_path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".to_string());
    final_path.with_extension(format!("partial.{ext}"))
}

/// Rename `video_only` to `final_path` without touching audio.
pub fn pass_through(video_only: &Path, final_path: &Path) -> Result<MuxOutcome, Error> {
    fs::rename(video_only, final_path)
        .map_err(|e| mux_error(video_only, "rename video-only output", e))?;
    info!(output = %final_path.display(), "no audio to remux; video passed through");
    Ok(MuxOutcome::PassThrough)
}

/// Combine the video stream of `video_only` with the best audio stream of
/// `source` into `final_path`. On success `video_only` is removed; on
/// failure no partial output is left at `final_path` or next to it.
pub fn remux_audio(video_only: &Path, source: &Path, final_path: &Path) -> Result<MuxOutcome, Error> {
    ffmpeg::init().map_err(|e| mux_error(source, "initialise FFmpeg", e))?;

    let partial = partial_path(final_path);
    match remux_into(video_only, source, &partial) {
        Ok(Remux::Written) => {
            fs::rename(&partial, final_path).map_err(|e| {
                let _ = fs::remove_file(&partial);
                mux_error(source, "rename muxed output", e)
            })?;
            if let Err(e) = fs::remove_file(video_only) {
                warn!(path = %video_only.display(), "failed to remove video-only output: {e}");
            }
            info!(output = %final_path.display(), "audio remuxed");
            Ok(MuxOutcome::Muxed)
        }
        Ok(Remux::NoAudio) => pass_through(video_only, final_path),
        Ok(Remux::UnsupportedAudio(codec)) => {
            warn!(
                source = %source.display(),
                ?codec,
                "audio codec cannot be stream-copied into MP4; output will be silent"
            );
            pass_through(video_only, final_path)?;
            Ok(MuxOutcome::AudioDropped)
        }
        Err(e) => {
            if partial.exists() {
                if let Err(rm) = fs::remove_file(&partial) {
                    warn!(path = %partial.display(), "failed to remove partial output: {rm}");
                }
            }
            Err(e)
        }
    }
}

/// Writes nothing if `source` has no audio stream or one MP4 cannot copy.
fn remux_into(video_only: &Path, source: &Path, partial: &Path) -> Result<Remux, Error> {
    let mut actx = format::input(&source).map_err(|e| mux_error(source, "open source", e))?;
    let Some(audio_stream) = actx.streams().best(media::Type::Audio) else {
        debug!(source = %source.display(), "source has no audio stream");
        return Ok(Remux::NoAudio);
    };
    let audio_index = audio_stream.index();
    let audio_tb = audio_stream.time_base();
    let audio_params = audio_stream.parameters();
    let audio_codec = audio_params.id();
    if !mp4_can_copy_audio(audio_codec) {
        return Ok(Remux::UnsupportedAudio(audio_codec));
    }

    let mut vctx =
        format::input(&video_only).map_err(|e| mux_error(source, "open video-only output", e))?;
    let video_stream = vctx.streams().best(media::Type::Video).ok_or_else(|| {
        mux_error(source, "open video-only output", anyhow!("no video stream"))
    })?;
    let video_index = video_stream.index();
    let video_tb = video_stream.time_base();
    let video_params = video_stream.parameters();
    // Container duration is in AV_TIME_BASE (microsecond) units.
    let video_end = (vctx.duration() > 0).then(|| vctx.duration() as f64 / 1_000_000.0);

    let mut octx =
        format::output(&partial).map_err(|e| mux_error(source, "create muxed output", e))?;
    let (video_out, audio_out) = {
        let mut v = octx
            .add_stream(ffmpeg::codec::Id::None)
            .map_err(|e| mux_error(source, "add video stream", e))?;
        v.set_parameters(video_params);
        clear_codec_tag(&mut v.parameters());
        let video_out = v.index();
        let mut a = octx
            .add_stream(ffmpeg::codec::Id::None)
            .map_err(|e| mux_error(source, "add audio stream", e))?;
        a.set_parameters(audio_params);
        clear_codec_tag(&mut a.parameters());
        (video_out, a.index())
    };
    octx.write_header()
        .map_err(|e| mux_error(source, "write header", e))?;

    let out_tb = |octx: &format::context::Output, index: usize| -> Result<Rational, Error> {
        octx.stream(index)
            .map(|s| s.time_base())
            .ok_or_else(|| mux_error(source, "write packets", anyhow!("output stream vanished")))
    };
    let video_out_tb = out_tb(&octx, video_out)?;
    let audio_out_tb = out_tb(&octx, audio_out)?;

    let mut video_packets = vctx
        .packets()
        .filter(|(s, _)| s.index() == video_index)
        .map(|(_, p)| p)
        .peekable();
    let mut audio_packets = actx
        .packets()
        .filter(|(s, _)| s.index() == audio_index)
        .map(|(_, p)| p)
        .take_while(|p| match (video_end, packet_seconds(p, audio_tb)) {
            (Some(end), Some(t)) => t < end,
            _ => true,
        })
        .peekable();

    // Merge both streams in timestamp order so the muxer never has to buffer
    // one entire stream while waiting for the other.
    let (mut video_written, mut audio_written) = (0u64, 0u64);
    loop {
        let take_video = match (video_packets.peek(), audio_packets.peek()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(v), Some(a)) => {
                packet_seconds(v, video_tb).unwrap_or(f64::MIN)
                    <= packet_seconds(a, audio_tb).unwrap_or(f64::MIN)
            }
        };
        let (mut packet, stream, from_tb, to_tb): (Packet, usize, Rational, Rational) =
            if take_video {
                video_written += 1;
                let p = video_packets.next().ok_or_else(|| {
                    mux_error(source, "write packets", anyhow!("video packet vanished"))
                })?;
                (p, video_out, video_tb, video_out_tb)
            } else {
                audio_written += 1;
                let p = audio_packets.next().ok_or_else(|| {
                    mux_error(source, "write packets", anyhow!("audio packet vanished"))
                })?;
                (p, audio_out, audio_tb, audio_out_tb)
            };
        packet.set_stream(stream);
        packet.rescale_ts(from_tb, to_tb);
        packet.set_position(-1);
        packet
            .write_interleaved(&mut octx)
            .map_err(|e| mux_error(source, "write packets", e))?;
    }

    octx.write_trailer()
        .map_err(|e| mux_error(source, "write trailer", e))?;
    debug!(video_written, audio_written, "remux packets written");
    Ok(Remux::Written)
}

fn packet_seconds(packet: &Packet, time_base: Rational) -> Option<f64> {
    let ts = packet.dts().or(packet.pts())?;
    Some(ts as f64 * f64::from(time_base))
}
