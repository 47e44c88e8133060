use thiserror::Error;

/// Main error type for the transcoding engine.
///
/// Two families live here. The first covers the typed codes surfaced to the
/// caller (`InputPixelFormat`, `OutputsMismatch`, ...). The second —
/// [`TranscodeError::PacketOnly`] and [`TranscodeError::FilterFlushed`] — are
/// control-flow codes used by the pipeline protocols; they never escape
/// [`crate::Session::transcode`].
#[derive(Error, Debug)]
pub enum TranscodeError {
    /// The hardware path requires a 4:2:0 input pixel format
    #[error("unsupported input pixel format: {0}")]
    InputPixelFormat(String),

    /// The hardware path requires an H.264 input
    #[error("unsupported input codec: {0}")]
    InputCodec(String),

    /// No video keyframe was seen, so the decoder flush protocol cannot run
    #[error("no keyframe found in input video stream")]
    InputNoKeyframe,

    /// Filter graph construction or operation failed
    #[error("filter graph error: {0}")]
    Filters(String),

    /// A packet was demuxed but no decoded frame is available yet.
    /// Control-flow code: the caller keeps the packet for stream copy and
    /// reads more input.
    #[error("packet available without decoded frame")]
    PacketOnly,

    /// A flush frame completed its round trip through a filter graph.
    /// Control-flow code terminating the per-output drain loop.
    #[error("filter graph flushed")]
    FilterFlushed,

    /// The outputs presented for this segment are incompatible with the
    /// previous segment's configuration
    #[error("output configuration mismatch across segments: {0}")]
    OutputsMismatch(String),

    /// The input descriptor is missing or names no usable source
    #[error("missing or unusable input: {0}")]
    MissingInput(String),

    /// The session can no longer make progress (e.g. hardware loss)
    #[error("unrecoverable session error: {0}")]
    Unrecoverable(String),

    /// Failure opening the demuxer or probing its streams
    #[error("failed to open input: {0}")]
    OpenInput(String),

    /// Failure opening an audio or video decoder
    #[error("failed to open decoder: {0}")]
    OpenDecoder(String),

    /// Failure opening an audio or video encoder
    #[error("failed to open encoder: {0}")]
    OpenEncoder(String),

    /// Failure creating a muxer or opening its IO
    #[error("failed to open output: {0}")]
    OpenMuxer(String),

    /// Failure writing the container header
    #[error("failed to write header: {0}")]
    WriteHeader(String),

    /// Failure writing a packet into the container
    #[error("muxing error: {0}")]
    Mux(String),

    /// Failure writing the container trailer
    #[error("failed to write trailer: {0}")]
    WriteTrailer(String),

    /// An error originating from the underlying codec library
    #[error("codec library error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    /// A standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// True for the control-flow codes that drive the pipeline protocols
    /// and must never surface to the caller.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            TranscodeError::PacketOnly | TranscodeError::FilterFlushed
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TranscodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_flow_codes() {
        assert!(TranscodeError::PacketOnly.is_control_flow());
        assert!(TranscodeError::FilterFlushed.is_control_flow());
        assert!(!TranscodeError::InputNoKeyframe.is_control_flow());
        assert!(!TranscodeError::OutputsMismatch(String::new()).is_control_flow());
    }

    #[test]
    fn test_display_includes_context() {
        let err = TranscodeError::OpenEncoder("h264_nvenc not found".into());
        assert!(err.to_string().contains("h264_nvenc"));
    }
}
