//! # Segment Transcoder
//!
//! `segment-transcoder` is a media segment transcoding engine built on the
//! FFmpeg libraries (via `ffmpeg-next`). It takes a sequence of short,
//! self-contained media segments from one logical stream and produces, for
//! each segment, one or more re-encoded or remuxed output segments at
//! configured resolutions, framerates, bitrates, and containers — while
//! persisting decoder, filter, and encoder state across segments so the
//! expensive per-segment initialisation cost (especially for hardware
//! codecs) is paid only once per stream.
//!
//! ## Core pieces
//!
//! - [`Session`] — the per-stream orchestrator: feed it one segment at a
//!   time with [`Session::transcode`]; stop it exactly once with
//!   [`Session::stop`].
//! - Byte-streaming IO — instead of files, a producer thread can push bytes
//!   in through [`ByteWriter`] and a consumer thread can pull muxed packets
//!   out through [`PacketReader`]; enable with [`Session::push_reset`].
//! - Timestamp plumbing — discontinuity rewriting across segments
//!   ([`Session::discontinuity`]) and a monotonic-PTS adapter in front of
//!   framerate filters, so segment boundaries produce neither duplicate
//!   storms nor dropped frames.
//!
//! ## Usage
//!
//! ```ignore
//! segment_transcoder::init(segment_transcoder::LogLevel::Info)?;
//!
//! let mut session = Session::new(None)?;
//! let input = InputDesc::file("seg0.ts");
//! let output = OutputDesc {
//!     name: "out0.ts".into(),
//!     video: ComponentOpts::named("libx264"),
//!     audio: ComponentOpts::named("copy"),
//!     video_filters: Some("fps=30/1,scale=w=640:h=480".into()),
//!     fps: Some(Fraction::new(30, 1)),
//!     ..OutputDesc::default()
//! };
//! let report = session.transcode(&input, &[output])?;
//! println!("decoded {} frames", report.decoded.frames);
//! session.stop()?;
//! ```

pub(crate) mod filter;
pub(crate) mod input;
pub(crate) mod output;

pub mod error;
pub mod io;
pub mod session;
pub mod types;

pub use error::{Result, TranscodeError};
pub use io::{OutputPacket, PacketFlags, StreamErrorCode, PROTECTED_BYTES, STREAM_BUFFER_BYTES};
pub use session::{ByteWriter, PacketReader, Session};
pub use types::{
    AnalysisOptions, ComponentOpts, DecodedResults, Fraction, HwDeviceKind, InputDesc,
    InputSource, LogLevel, OutputDesc, OutputResults, TranscodeReport, MAX_OUTPUTS,
};

use ffmpeg_next as ffmpeg;

/// Initialise the codec library and set its global log level. Call once per
/// process, before any [`Session`] exists and before threading begins.
pub fn init(level: LogLevel) -> Result<()> {
    ffmpeg::init().map_err(|e| {
        tracing::error!(%e, "codec library initialisation failed");
        TranscodeError::Ffmpeg(e)
    })?;
    // SAFETY: global log-level write, called before any threads decode.
    unsafe {
        ffmpeg::ffi::av_log_set_level(level.to_av_level());
    }
    tracing::info!(?level, "codec library initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(LogLevel::Quiet).unwrap();
        init(LogLevel::Error).unwrap();
    }
}
