//! Descriptors, result counters, and shared constants.
//!
//! These are the plain-data types crossing the caller boundary: what to read,
//! what to produce, and what was produced. They are serde-round-trippable so
//! binding layers and test harnesses can ship them as data.

use std::collections::BTreeMap;

use ffmpeg_next as ffmpeg;
use serde::{Deserialize, Serialize};

/// Upper bound on the number of outputs a session will drive per segment.
pub const MAX_OUTPUTS: usize = 10;

/// Maximum number of consecutive flush-packet submissions to a stalled video
/// decoder before the drain loop gives up.
pub const SENTINEL_MAX: u32 = 8;

/// Number of classification slots carried by analysis outputs.
pub const MAX_CLASSIFY: usize = 10;

/// Log verbosity, applied to the codec library at [`crate::init`] time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
    Fatal,
    Panic,
    Quiet,
}

impl LogLevel {
    pub(crate) fn to_av_level(self) -> i32 {
        use ffmpeg::ffi::*;
        match self {
            LogLevel::Trace => AV_LOG_TRACE as i32,
            LogLevel::Debug => AV_LOG_DEBUG as i32,
            LogLevel::Verbose => AV_LOG_VERBOSE as i32,
            LogLevel::Info => AV_LOG_INFO as i32,
            LogLevel::Warning => AV_LOG_WARNING as i32,
            LogLevel::Error => AV_LOG_ERROR as i32,
            LogLevel::Fatal => AV_LOG_FATAL as i32,
            LogLevel::Panic => AV_LOG_PANIC as i32,
            LogLevel::Quiet => AV_LOG_QUIET as i32,
        }
    }
}

/// Hardware device kinds recognised by the input/output pipelines.
/// `None` disables the hardware path entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HwDeviceKind {
    #[default]
    None,
    Cuda,
    MediaCodec,
}

impl HwDeviceKind {
    pub(crate) fn to_av_type(self) -> ffmpeg::ffi::AVHWDeviceType {
        use ffmpeg::ffi::AVHWDeviceType::*;
        match self {
            HwDeviceKind::None => AV_HWDEVICE_TYPE_NONE,
            HwDeviceKind::Cuda => AV_HWDEVICE_TYPE_CUDA,
            HwDeviceKind::MediaCodec => AV_HWDEVICE_TYPE_MEDIACODEC,
        }
    }

    /// True when this kind selects a hardware decode/encode path.
    pub fn is_hw(self) -> bool {
        self != HwDeviceKind::None
    }
}

/// A positive rational, used for output framerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn to_rational(self) -> ffmpeg::Rational {
        ffmpeg::Rational::new(self.num, self.den)
    }

    /// 1/fps — the duration of one frame as a timebase.
    pub fn invert(self) -> ffmpeg::Rational {
        ffmpeg::Rational::new(self.den, self.num)
    }
}

/// Name + option dictionary for a muxer, encoder, or demuxer component.
///
/// For encoders the name carries two sentinels: `"copy"` requests packet
/// passthrough and `"drop"` (or the empty string) disables the medium.
/// Anything else names a codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentOpts {
    pub name: String,
    pub opts: BTreeMap<String, String>,
}

impl ComponentOpts {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            opts: BTreeMap::new(),
        }
    }

    /// Packet-level passthrough requested for this medium.
    pub fn is_copy(&self) -> bool {
        self.name == "copy"
    }

    /// No output requested for this medium.
    pub fn is_drop(&self) -> bool {
        self.name.is_empty() || self.name == "drop"
    }

    /// Whether this component depends on decoded frames (i.e. names a real
    /// encoder rather than one of the copy/drop sentinels).
    pub fn needs_decoder(&self) -> bool {
        !(self.is_copy() || self.is_drop())
    }

    pub(crate) fn to_dictionary(&self) -> ffmpeg::Dictionary<'_> {
        let mut dict = ffmpeg::Dictionary::new();
        for (k, v) in &self.opts {
            dict.set(k, v);
        }
        dict
    }
}

/// Where a segment's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    /// Read the segment from a file path.
    File(String),
    /// Consume bytes pushed into the session's byte buffer.
    Pushed,
}

/// Per-segment input description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDesc {
    pub source: InputSource,
    /// Hardware device kind for decoding; `None` selects the software path.
    pub hw_kind: HwDeviceKind,
    /// Device identifier (e.g. a GPU ordinal) for the hardware context.
    pub device: Option<String>,
    /// Demuxer options forwarded verbatim.
    pub demuxer_opts: BTreeMap<String, String>,
    /// Video decoder options forwarded verbatim.
    pub video_opts: BTreeMap<String, String>,
    /// Remux-only mode: outputs mirror every input stream and stay open
    /// across segments until the session stops.
    pub transmuxing: bool,
}

impl InputDesc {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            source: InputSource::File(path.into()),
            hw_kind: HwDeviceKind::None,
            device: None,
            demuxer_opts: BTreeMap::new(),
            video_opts: BTreeMap::new(),
            transmuxing: false,
        }
    }

    pub fn pushed() -> Self {
        Self {
            source: InputSource::Pushed,
            hw_kind: HwDeviceKind::None,
            device: None,
            demuxer_opts: BTreeMap::new(),
            video_opts: BTreeMap::new(),
            transmuxing: false,
        }
    }
}

/// Per-output description: target container, codecs, geometry, and windowing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDesc {
    /// Output file name (ignored when the session runs with pushed IO).
    pub name: String,
    /// Video filter chain description (e.g. `"fps=30/1,scale=w=640:h=480"`).
    pub video_filters: Option<String>,
    /// Analysis filter chain description; only used by analysis outputs.
    pub analysis_filters: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits/s; when set, min/max/buffer rates are pinned to
    /// it for CBR-like output.
    pub bitrate: Option<i64>,
    /// Forced-keyframe interval in milliseconds.
    pub gop_time_ms: Option<i64>,
    /// Clip window start, milliseconds from segment start.
    pub clip_from_ms: Option<i64>,
    /// Clip window end, milliseconds from segment start.
    pub clip_to_ms: Option<i64>,
    /// Output framerate; when set a framerate filter is expected in
    /// `video_filters` and the monotonic PTS adapter engages.
    pub fps: Option<Fraction>,
    pub muxer: ComponentOpts,
    pub video: ComponentOpts,
    pub audio: ComponentOpts,
    /// Analysis-only output: contributes classification results, not media.
    pub is_analysis: bool,
    /// Container-level metadata.
    pub metadata: BTreeMap<String, String>,
}

impl Default for OutputDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            video_filters: None,
            analysis_filters: None,
            width: 0,
            height: 0,
            bitrate: None,
            gop_time_ms: None,
            clip_from_ms: None,
            clip_to_ms: None,
            fps: None,
            muxer: ComponentOpts::named("mpegts"),
            video: ComponentOpts::default(),
            audio: ComponentOpts::default(),
            is_analysis: false,
            metadata: BTreeMap::new(),
        }
    }
}

/// Options for the session-wide analysis filter graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Name of the classification filter to instantiate.
    pub filter_name: String,
    pub model_path: String,
    pub input_name: String,
    pub output_name: String,
    pub backend_configs: String,
    /// Frame-metadata key carrying the per-class confidence text.
    pub metadata_key: String,
}

/// Totals for the decode side of one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedResults {
    pub frames: u64,
    pub pixels: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
    pub other_packets: u64,
}

/// Per-output totals for one segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputResults {
    pub frames: u64,
    pub pixels: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
    pub other_packets: u64,
    /// Mean per-class confidences for analysis outputs; empty otherwise.
    pub probs: Vec<f64>,
}

/// What one `transcode` call produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodeReport {
    pub decoded: DecodedResults,
    pub outputs: Vec<OutputResults>,
}

/// Rescale a timestamp between two timebases with round-to-nearest,
/// half away from zero. NOPTS values pass through untouched.
///
/// Equivalent to the codec library's rescaling with
/// `NEAR_INF | PASS_MINMAX` rounding, kept in plain integer arithmetic so it
/// is testable without library state.
pub(crate) fn rescale_ts(ts: i64, from: ffmpeg::Rational, to: ffmpeg::Rational) -> i64 {
    if ts == ffmpeg::ffi::AV_NOPTS_VALUE {
        return ts;
    }
    let num = ts as i128 * from.numerator() as i128 * to.denominator() as i128;
    let den = from.denominator() as i128 * to.numerator() as i128;
    if den == 0 {
        return ts;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    rounded as i64
}

/// Rescale a duration expressed in milliseconds into `to` timebase units.
pub(crate) fn ms_to_tb(ms: i64, to: ffmpeg::Rational) -> i64 {
    rescale_ts(ms, ffmpeg::Rational::new(1, 1000), to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_name_sentinels() {
        assert!(ComponentOpts::named("copy").is_copy());
        assert!(ComponentOpts::named("drop").is_drop());
        assert!(ComponentOpts::named("").is_drop());
        assert!(ComponentOpts::default().is_drop());
        assert!(!ComponentOpts::named("libx264").is_copy());
        assert!(ComponentOpts::named("libx264").needs_decoder());
        assert!(!ComponentOpts::named("copy").needs_decoder());
        assert!(!ComponentOpts::named("drop").needs_decoder());
    }

    #[test]
    fn test_rescale_identity() {
        let tb = ffmpeg::Rational::new(1, 90000);
        assert_eq!(rescale_ts(12345, tb, tb), 12345);
    }

    #[test]
    fn test_rescale_ms_to_90k() {
        // 1000 ms == 90_000 ticks at 1/90000
        assert_eq!(ms_to_tb(1000, ffmpeg::Rational::new(1, 90000)), 90_000);
        // 33 ms ≈ 2970 ticks
        assert_eq!(ms_to_tb(33, ffmpeg::Rational::new(1, 90000)), 2970);
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        // 1 tick of 1/30 into 1/90000 is exactly 3000
        assert_eq!(
            rescale_ts(1, ffmpeg::Rational::new(1, 30), ffmpeg::Rational::new(1, 90000)),
            3000
        );
        // 1 tick of 3/100 (≈ 1/33.33 fps) into 1/90000 is 2700
        assert_eq!(
            rescale_ts(1, ffmpeg::Rational::new(3, 100), ffmpeg::Rational::new(1, 90000)),
            2700
        );
    }

    #[test]
    fn test_rescale_negative() {
        assert_eq!(
            rescale_ts(-1, ffmpeg::Rational::new(1, 30), ffmpeg::Rational::new(1, 90000)),
            -3000
        );
    }

    #[test]
    fn test_rescale_nopts_passthrough() {
        let nopts = ffmpeg::ffi::AV_NOPTS_VALUE;
        assert_eq!(
            rescale_ts(nopts, ffmpeg::Rational::new(1, 30), ffmpeg::Rational::new(1, 90000)),
            nopts
        );
    }

    #[test]
    fn test_gop_len_in_frame_timebase() {
        // 2-second GOP at 30 fps: timebase 1/30, expect 60 frames
        assert_eq!(ms_to_tb(2000, ffmpeg::Rational::new(1, 30)), 60);
    }

    #[test]
    fn test_fraction_invert() {
        let f = Fraction::new(30, 1);
        assert_eq!(f.invert(), ffmpeg::Rational::new(1, 30));
    }
}
