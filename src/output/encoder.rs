//! Encoder construction, parameterised from the output's filter sink.
//!
//! Encoders inherit their geometry, formats, and timebases from whatever the
//! filter graph actually negotiated rather than from the descriptor — the
//! graph is the single source of truth once it is configured.

use std::ffi::c_int;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::error::{Result, TranscodeError};
use crate::filter::FilterAdapter;
use crate::input::InputPipeline;
use crate::types::OutputDesc;

/// Open the output's video encoder against the configured filter sink.
///
/// Rate control: a configured bitrate pins min/max/buffer to the same value
/// for CBR-like output. When the sink carries a hardware frame pool the
/// encoder encodes on-device without a download.
pub(crate) fn open_video_encoder(
    desc: &OutputDesc,
    adapter: &mut FilterAdapter,
    input: &InputPipeline,
    global_header: bool,
) -> Result<ffmpeg::encoder::Video> {
    let name = &desc.video.name;
    let codec = ffmpeg::encoder::find_by_name(name).ok_or_else(|| {
        tracing::error!(name, "unable to find video encoder");
        TranscodeError::OpenEncoder(format!("video encoder {:?} not found", name))
    })?;

    let mut encoder = ffmpeg::codec::Context::new()
        .encoder()
        .video()
        .map_err(|e| open_err("video encoder context", e))?;

    encoder.set_width(adapter.sink_width());
    encoder.set_height(adapter.sink_height());
    encoder.set_format(adapter.sink_pixel_format());

    if desc.fps.is_some() {
        encoder.set_frame_rate(Some(adapter.sink_frame_rate()));
        encoder.set_time_base(adapter.sink_time_base());
    } else {
        let (rate, time_base) = input
            .video_decoder_timing()
            .unwrap_or((ffmpeg::Rational::new(25, 1), ffmpeg::Rational::new(1, 90000)));
        encoder.set_frame_rate(Some(rate));
        encoder.set_time_base(time_base);
    }

    // SAFETY: raw parameter writes on an unopened encoder context.
    unsafe {
        let ptr = encoder.as_mut_ptr();
        if let Some(bitrate) = desc.bitrate {
            (*ptr).bit_rate = bitrate;
            (*ptr).rc_min_rate = bitrate;
            (*ptr).rc_max_rate = bitrate;
            (*ptr).rc_buffer_size = bitrate as c_int;
        }
        let sink_pool = adapter.sink_hw_frames_ctx();
        if !sink_pool.is_null() {
            let pool_ref = ffi::av_buffer_ref(sink_pool);
            if pool_ref.is_null() {
                return Err(TranscodeError::OpenEncoder(
                    "unable to reference hardware frame pool for encoding".into(),
                ));
            }
            (*ptr).hw_frames_ctx = pool_ref;
        }
        if global_header {
            (*ptr).flags |= ffi::AV_CODEC_FLAG_GLOBAL_HEADER as c_int;
        }
    }

    let opened = encoder
        .open_as_with(codec, desc.video.to_dictionary())
        .map_err(|e| open_err(&format!("video encoder {:?}", name), e))?;
    tracing::debug!(name, width = desc.width, height = desc.height, "video encoder opened");
    Ok(opened)
}

/// Open the output's audio encoder against the audio filter sink. Returns
/// the opened encoder plus its frame size, which the caller must propagate
/// back to the sink so buffering stays aligned.
pub(crate) fn open_audio_encoder(
    desc: &OutputDesc,
    adapter: &mut FilterAdapter,
    global_header: bool,
) -> Result<(ffmpeg::encoder::Audio, u32)> {
    let name = &desc.audio.name;
    let codec = ffmpeg::encoder::find_by_name(name).ok_or_else(|| {
        tracing::error!(name, "unable to find audio encoder");
        TranscodeError::OpenEncoder(format!("audio encoder {:?} not found", name))
    })?;

    let mut encoder = ffmpeg::codec::Context::new()
        .encoder()
        .audio()
        .map_err(|e| open_err("audio encoder context", e))?;

    encoder.set_rate(adapter.sink_sample_rate() as i32);
    encoder.set_format(adapter.sink_sample_format());
    // The normalisation chain behind every audio output pins stereo.
    encoder.set_channel_layout(ffmpeg::ChannelLayout::STEREO);
    encoder.set_time_base(adapter.sink_time_base());

    // SAFETY: raw flag write on an unopened encoder context.
    unsafe {
        if global_header {
            (*encoder.as_mut_ptr()).flags |= ffi::AV_CODEC_FLAG_GLOBAL_HEADER as c_int;
        }
    }

    let opened = encoder
        .open_as_with(codec, desc.audio.to_dictionary())
        .map_err(|e| open_err(&format!("audio encoder {:?}", name), e))?;
    let frame_size = opened.frame_size();
    tracing::debug!(name, frame_size, "audio encoder opened");
    Ok((opened, frame_size))
}

fn open_err(what: &str, e: ffmpeg::Error) -> TranscodeError {
    tracing::error!(%e, "error opening {}", what);
    TranscodeError::OpenEncoder(format!("{}: {}", what, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_common_encoders() {
        ffmpeg::init().expect("ffmpeg init");
        // Encoders every stock build carries.
        assert!(ffmpeg::encoder::find_by_name("mpeg4").is_some());
        assert!(ffmpeg::encoder::find_by_name("aac").is_some());
        assert!(ffmpeg::encoder::find_by_name("no-such-encoder").is_none());
    }
}
