//! Framerate-aware PTS rewriting in front of per-output filter graphs.
//!
//! The framerate filter demands strictly monotonic input PTS and reacts to
//! gaps by duplicating frames. Real input PTS across segments satisfy
//! neither: they jump, restart, and occasionally go backwards. The adapter
//! therefore feeds the graph a private monotonic counter and repairs the
//! damage on the way out:
//!
//! - before submission the frame's PTS is swapped for `custom_pts` (the
//!   original rides along in the frame's `opaque` slot, which filters
//!   propagate);
//! - on the first post-filter frame of a segment the difference between the
//!   rescaled original PTS and the filter's output PTS is captured, and added
//!   back to every subsequent output frame;
//! - graph flushing is driven by re-injecting the last seen frame with the
//!   `opaque` slot stamped `i64::MIN`, which downstream recognises and turns
//!   into end-of-stream for the drain loop.
//!
//! Non-framerate graphs (and audio) pass PTS through untouched.

use std::ffi::c_void;
use std::ptr;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::error::{Result, TranscodeError};
use crate::types::{rescale_ts, Fraction};

/// Sentinel carried in the `opaque` slot of injected flush frames. Reserved
/// at the codec boundary only; everything else uses [`FlushPhase`].
const FLUSH_SENTINEL: i64 = i64::MIN;

/// Where the adapter is in its per-segment flush protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushPhase {
    Running,
    Flushing,
    Flushed,
}

/// Outcome of one sink read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// A frame is available in the adapter's result buffer.
    Frame,
    /// A flush frame completed its round trip; keep draining.
    Flushed,
    /// The graph needs more input.
    Again,
    /// The graph is fully drained.
    Eof,
}

pub(crate) enum AdapterKind {
    Video { fps: Option<Fraction> },
    Audio,
}

/// Reusable result buffer; video and audio adapters carry their own typed
/// frame so downstream can use the typed accessors.
pub(crate) enum GraphFrame {
    Video(ffmpeg::frame::Video),
    Audio(ffmpeg::frame::Audio),
}

impl GraphFrame {
    fn as_base(&self) -> &ffmpeg::Frame {
        match self {
            GraphFrame::Video(f) => f,
            GraphFrame::Audio(f) => f,
        }
    }

    fn as_base_mut(&mut self) -> &mut ffmpeg::Frame {
        match self {
            GraphFrame::Video(f) => f,
            GraphFrame::Audio(f) => f,
        }
    }

    pub fn pts(&self) -> Option<i64> {
        self.as_base().pts()
    }
}

/// What the video graph's buffer source needs to know about the decoder.
pub(crate) struct VideoSourceInfo {
    pub width: u32,
    pub height: u32,
    pub pix_fmt: ffi::AVPixelFormat,
    pub time_base: ffmpeg::Rational,
    pub sample_aspect_ratio: ffmpeg::Rational,
    /// The decoder's hardware frame pool, or null on the software path.
    /// Borrowed for graph construction; never stored beyond it.
    pub hw_frames_ctx: *mut ffi::AVBufferRef,
}

/// What the audio graph's buffer source needs to know about the decoder.
pub(crate) struct AudioSourceInfo {
    pub sample_rate: u32,
    pub sample_format: ffmpeg::format::Sample,
    pub channel_layout_bits: u64,
    pub channels: u16,
    pub time_base: ffmpeg::Rational,
}

/// The fixed normalisation chain behind every audio output.
pub(crate) const AUDIO_FORMAT_CHAIN: &str =
    "aformat=sample_fmts=fltp:channel_layouts=stereo:sample_rates=44100";

pub(crate) struct FilterAdapter {
    kind: AdapterKind,
    graph: Option<ffmpeg::filter::Graph>,
    frame: GraphFrame,
    active: bool,
    phase: FlushPhase,
    /// Monotonic PTS written to the filter source.
    custom_pts: i64,
    /// Input PTS of the previous real frame.
    prev_frame_pts: i64,
    /// Offset between the rescaled original PTS stream and what the filter
    /// emits; captured on the first output frame of each segment.
    pts_offset: Option<i64>,
    /// Segments already flushed through this adapter.
    segments_complete: u64,
    /// Identity of the upstream hardware frame pool at graph-build time.
    hwframes: *mut c_void,
    /// Input stream time base the source was configured with.
    time_base: ffmpeg::Rational,
}

impl FilterAdapter {
    pub fn new_video(fps: Option<Fraction>) -> Self {
        Self::new(AdapterKind::Video { fps })
    }

    pub fn new_audio() -> Self {
        Self::new(AdapterKind::Audio)
    }

    fn new(kind: AdapterKind) -> Self {
        let frame = match kind {
            AdapterKind::Video { .. } => GraphFrame::Video(ffmpeg::frame::Video::empty()),
            AdapterKind::Audio => GraphFrame::Audio(ffmpeg::frame::Audio::empty()),
        };
        Self {
            kind,
            graph: None,
            frame,
            active: false,
            phase: FlushPhase::Running,
            custom_pts: 0,
            prev_frame_pts: 0,
            pts_offset: None,
            segments_complete: 0,
            hwframes: ptr::null_mut(),
            time_base: ffmpeg::Rational::new(1, 1),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn phase(&self) -> FlushPhase {
        self.phase
    }

    fn fps(&self) -> Option<Fraction> {
        match self.kind {
            AdapterKind::Video { fps } => fps,
            AdapterKind::Audio => None,
        }
    }

    /// Build the video graph: buffer source configured from the decoder,
    /// the caller's chain, and a sink pinned to the encoder-compatible pixel
    /// format.
    pub fn init_video(&mut self, src: &VideoSourceInfo, spec: &str) -> Result<()> {
        if self.active {
            return Ok(());
        }
        let mut graph = ffmpeg::filter::Graph::new();
        let args = format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
            src.width,
            src.height,
            src.pix_fmt as i32,
            src.time_base.numerator(),
            src.time_base.denominator(),
            src.sample_aspect_ratio.numerator(),
            src.sample_aspect_ratio.denominator().max(1),
        );
        let buffer = ffmpeg::filter::find("buffer")
            .ok_or_else(|| filters_err("buffer source filter missing"))?;
        graph
            .add(&buffer, "in", &args)
            .map_err(|e| filters_err(&format!("cannot create video buffer source: {}", e)))?;

        let hw = !src.hw_frames_ctx.is_null();
        if hw {
            // The source must advertise the decoder's frame pool before the
            // graph is configured; plain args cannot carry it.
            // SAFETY: the filter context pointer is valid inside this borrow
            // and the parameters struct is freed immediately after use.
            unsafe {
                let mut src_ctx = graph.get("in").expect("source added above");
                let par = ffi::av_buffersrc_parameters_alloc();
                if par.is_null() {
                    return Err(filters_err("unable to allocate buffer source parameters"));
                }
                (*par).hw_frames_ctx = src.hw_frames_ctx;
                let ret = ffi::av_buffersrc_parameters_set(src_ctx.as_mut_ptr(), par);
                ffi::av_free(par as *mut c_void);
                if ret < 0 {
                    return Err(filters_err("unable to set buffer source hardware parameters"));
                }
                self.hwframes = (*src.hw_frames_ctx).data as *mut c_void;
            }
        } else {
            self.hwframes = ptr::null_mut();
        }

        let buffersink = ffmpeg::filter::find("buffersink")
            .ok_or_else(|| filters_err("buffer sink filter missing"))?;
        graph
            .add(&buffersink, "out", "")
            .map_err(|e| filters_err(&format!("cannot create video buffer sink: {}", e)))?;
        {
            let mut sink = graph.get("out").expect("sink added above");
            sink.set_pixel_format(if hw {
                ffmpeg::format::Pixel::CUDA
            } else {
                ffmpeg::format::Pixel::YUV420P
            });
        }

        let spec = if spec.is_empty() { "null" } else { spec };
        graph
            .output("in", 0)
            .and_then(|o| o.input("out", 0))
            .and_then(|i| i.parse(spec))
            .map_err(|e| filters_err(&format!("unable to parse video filter chain {:?}: {}", spec, e)))?;
        graph
            .validate()
            .map_err(|e| filters_err(&format!("unable to configure video filter graph: {}", e)))?;

        tracing::debug!(spec, hw, "video filter graph initialised");
        self.graph = Some(graph);
        self.time_base = src.time_base;
        self.pts_offset = None;
        self.active = true;
        Ok(())
    }

    /// Build the audio graph: buffer source from the decoder plus the fixed
    /// normalisation chain.
    pub fn init_audio(&mut self, src: &AudioSourceInfo) -> Result<()> {
        if self.active {
            return Ok(());
        }
        let mut graph = ffmpeg::filter::Graph::new();
        let args = format!(
            "time_base={}/{}:sample_rate={}:sample_fmt={}:channel_layout=0x{:x}:channels={}",
            src.time_base.numerator(),
            src.time_base.denominator(),
            src.sample_rate,
            src.sample_format.name(),
            src.channel_layout_bits,
            src.channels,
        );
        let abuffer = ffmpeg::filter::find("abuffer")
            .ok_or_else(|| filters_err("audio buffer source filter missing"))?;
        graph
            .add(&abuffer, "in", &args)
            .map_err(|e| filters_err(&format!("cannot create audio buffer source: {}", e)))?;
        let abuffersink = ffmpeg::filter::find("abuffersink")
            .ok_or_else(|| filters_err("audio buffer sink filter missing"))?;
        graph
            .add(&abuffersink, "out", "")
            .map_err(|e| filters_err(&format!("cannot create audio buffer sink: {}", e)))?;
        graph
            .output("in", 0)
            .and_then(|o| o.input("out", 0))
            .and_then(|i| i.parse(AUDIO_FORMAT_CHAIN))
            .map_err(|e| filters_err(&format!("unable to parse audio filter chain: {}", e)))?;
        graph
            .validate()
            .map_err(|e| filters_err(&format!("unable to configure audio filter graph: {}", e)))?;

        tracing::debug!("audio filter graph initialised");
        self.graph = Some(graph);
        self.time_base = src.time_base;
        self.pts_offset = None;
        self.active = true;
        Ok(())
    }

    /// True when the incoming frame's hardware pool differs from the one the
    /// graph was built against. Hardware decoders that defer pool creation
    /// until the first frame hit this on every stream at least once.
    pub fn needs_rebuild(&self, frame_pool: *mut c_void) -> bool {
        self.active && !frame_pool.is_null() && !self.hwframes.is_null() && frame_pool != self.hwframes
    }

    /// Drop the graph and all rewriting state ahead of a rebuild.
    pub fn reset_for_rebuild(&mut self) {
        self.graph = None;
        self.active = false;
        self.phase = FlushPhase::Running;
        self.custom_pts = 0;
        self.prev_frame_pts = 0;
        self.pts_offset = None;
        self.segments_complete = 0;
        self.hwframes = ptr::null_mut();
    }

    /// Per-frame PTS increment for real frames; see the module docs.
    fn advance_custom_pts(&mut self, input_pts: i64) {
        match self.fps() {
            Some(fps) => {
                let mut ts_step = input_pts - self.prev_frame_pts;
                if self.segments_complete > 0 && self.prev_frame_pts == 0 {
                    // First frame of a non-initial segment: one nominal frame.
                    ts_step = rescale_ts(1, fps.invert(), self.time_base);
                }
                self.custom_pts += ts_step;
                self.prev_frame_pts = input_pts;
            }
            None => {
                self.custom_pts = input_pts;
            }
        }
    }

    /// Submit a real decoded frame. The frame's PTS is restored before
    /// returning, so the caller's view of it is unchanged.
    pub fn write_frame(&mut self, frame: &mut ffmpeg::Frame) -> Result<()> {
        let original_pts = frame.pts().unwrap_or(0);
        // SAFETY: stashing the original PTS in the opaque slot; filters
        // propagate it to the matching output frame.
        unsafe {
            (*frame.as_mut_ptr()).opaque = original_pts as *mut c_void;
        }
        self.advance_custom_pts(original_pts);
        frame.set_pts(Some(self.custom_pts));
        let ret = self.submit(frame);
        frame.set_pts(Some(original_pts));
        ret
    }

    /// Inject one flush frame built from `template` (the last real frame seen
    /// upstream). No-op once the graph has fully flushed.
    pub fn write_flush_frame(&mut self, template: &mut ffmpeg::Frame) -> Result<()> {
        if self.phase == FlushPhase::Flushed {
            return Ok(());
        }
        self.phase = FlushPhase::Flushing;
        let original_pts = template.pts().unwrap_or(0);
        // SAFETY: flush marker in the opaque slot; recognised on the way out.
        unsafe {
            (*template.as_mut_ptr()).opaque = FLUSH_SENTINEL as *mut c_void;
        }
        let ts_step = match self.fps() {
            Some(fps) => rescale_ts(1, fps.invert(), self.time_base),
            // SAFETY: plain field read of the frame's duration.
            None => unsafe { (*template.as_ptr()).duration },
        };
        self.custom_pts += ts_step;
        template.set_pts(Some(self.custom_pts));
        let ret = self.submit(template);
        template.set_pts(Some(original_pts));
        ret
    }

    fn submit(&mut self, frame: &ffmpeg::Frame) -> Result<()> {
        let mut src = self
            .graph
            .as_mut()
            .expect("graph initialised")
            .get("in")
            .expect("graph has a source");
        // SAFETY: write_frame keeps the caller's references intact, unlike
        // the ownership-taking add variant.
        let ret = unsafe { ffi::av_buffersrc_write_frame(src.as_mut_ptr(), frame.as_ptr()) };
        if ret < 0 {
            let err = ffmpeg::Error::from(ret);
            tracing::error!(%err, "error feeding the filter graph");
            return Err(TranscodeError::Ffmpeg(err));
        }
        Ok(())
    }

    /// Pull one frame from the sink into the adapter's result buffer.
    pub fn read_frame(&mut self) -> Result<ReadOutcome> {
        let sink_tb = self.sink_time_base();
        let fps_mode = self.fps().is_some();
        // SAFETY: drop any previous reference before the sink fills the
        // frame; the raw pointer stays valid across the sink borrow below.
        let frame_ptr = unsafe {
            let ptr = self.frame.as_base_mut().as_mut_ptr();
            ffi::av_frame_unref(ptr);
            ptr
        };
        let ret = {
            let mut sink = self
                .graph
                .as_mut()
                .expect("graph initialised")
                .get("out")
                .expect("graph has a sink");
            // SAFETY: sink and frame pointers are live for the call.
            unsafe { ffi::av_buffersink_get_frame(sink.as_mut_ptr(), frame_ptr) }
        };
        if ret < 0 {
            return match ffmpeg::Error::from(ret) {
                ffmpeg::Error::Eof => Ok(ReadOutcome::Eof),
                ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => {
                    Ok(ReadOutcome::Again)
                }
                err => {
                    tracing::error!(%err, "error consuming the filter graph");
                    Err(TranscodeError::Ffmpeg(err))
                }
            };
        }

        // Fresh output frames carry no encoder intent yet.
        if let GraphFrame::Video(v) = &mut self.frame {
            v.set_kind(ffmpeg::picture::Type::None);
        }

        // SAFETY: plain field read; the opaque slot holds the original input
        // PTS (or the flush sentinel) propagated by the graph.
        let opaque = unsafe { (*self.frame.as_base().as_ptr()).opaque as i64 };
        if opaque == FLUSH_SENTINEL {
            // A flush from a previous segment may still be in flight; only
            // complete the protocol we actually started.
            if self.phase == FlushPhase::Flushing {
                self.phase = FlushPhase::Flushed;
            }
            return Ok(ReadOutcome::Flushed);
        }

        if fps_mode {
            let frame_pts = self.frame.pts().unwrap_or(0);
            let offset = match self.pts_offset {
                Some(off) => off,
                None => {
                    let rescaled = rescale_ts(opaque, self.time_base, sink_tb);
                    let off = rescaled - frame_pts;
                    self.pts_offset = Some(off);
                    off
                }
            };
            self.frame.as_base_mut().set_pts(Some(frame_pts + offset));
        }
        Ok(ReadOutcome::Frame)
    }

    pub fn result_frame(&self) -> &GraphFrame {
        &self.frame
    }

    pub fn result_frame_mut(&mut self) -> &mut GraphFrame {
        &mut self.frame
    }

    /// Signal end-of-stream on the graph's source (analysis graphs are
    /// drained this way instead of with injected flush frames).
    pub fn close_source(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let mut src = self
            .graph
            .as_mut()
            .expect("graph initialised")
            .get("in")
            .expect("graph has a source");
        // SAFETY: end-of-stream marker on a live source context, pushed
        // through the graph immediately.
        let ret = unsafe {
            ffi::av_buffersrc_close(
                src.as_mut_ptr(),
                ffi::AV_NOPTS_VALUE,
                ffi::AV_BUFFERSRC_FLAG_PUSH,
            )
        };
        if ret < 0 {
            let err = ffmpeg::Error::from(ret);
            tracing::error!(%err, "error closing filter source");
            return Err(TranscodeError::Ffmpeg(err));
        }
        Ok(())
    }

    /// Reset per-segment state after a successful flush; the graph, the
    /// monotonic counter, and the segment count survive into the next
    /// segment.
    pub fn finish_segment(&mut self) {
        if self.active {
            self.segments_complete += 1;
        }
        self.phase = FlushPhase::Running;
        self.prev_frame_pts = 0;
        self.pts_offset = None;
    }

    // ── Sink property getters for encoder parameterisation ──────────────────

    fn sink_ptr(&mut self) -> *mut ffi::AVFilterContext {
        let mut sink = self
            .graph
            .as_mut()
            .expect("graph initialised")
            .get("out")
            .expect("graph has a sink");
        // SAFETY: the context outlives this adapter's graph borrow.
        unsafe { sink.as_mut_ptr() }
    }

    pub fn sink_width(&mut self) -> u32 {
        // SAFETY: property getters on a configured sink.
        unsafe { ffi::av_buffersink_get_w(self.sink_ptr()) as u32 }
    }

    pub fn sink_height(&mut self) -> u32 {
        unsafe { ffi::av_buffersink_get_h(self.sink_ptr()) as u32 }
    }

    pub fn sink_pixel_format(&mut self) -> ffmpeg::format::Pixel {
        unsafe {
            let raw = ffi::av_buffersink_get_format(self.sink_ptr());
            ffmpeg::format::Pixel::from(std::mem::transmute::<i32, ffi::AVPixelFormat>(raw))
        }
    }

    pub fn sink_sample_format(&mut self) -> ffmpeg::format::Sample {
        unsafe {
            let raw = ffi::av_buffersink_get_format(self.sink_ptr());
            ffmpeg::format::Sample::from(std::mem::transmute::<i32, ffi::AVSampleFormat>(raw))
        }
    }

    pub fn sink_time_base(&mut self) -> ffmpeg::Rational {
        if !self.active {
            return self.time_base;
        }
        unsafe { ffmpeg::Rational::from(ffi::av_buffersink_get_time_base(self.sink_ptr())) }
    }

    pub fn sink_frame_rate(&mut self) -> ffmpeg::Rational {
        unsafe { ffmpeg::Rational::from(ffi::av_buffersink_get_frame_rate(self.sink_ptr())) }
    }

    pub fn sink_sample_rate(&mut self) -> u32 {
        unsafe { ffi::av_buffersink_get_sample_rate(self.sink_ptr()) as u32 }
    }

    pub fn sink_hw_frames_ctx(&mut self) -> *mut ffi::AVBufferRef {
        unsafe { ffi::av_buffersink_get_hw_frames_ctx(self.sink_ptr()) }
    }

    pub fn set_sink_frame_size(&mut self, size: u32) {
        let ptr = self.sink_ptr();
        // SAFETY: aligns the sink's buffering with the encoder's frame size.
        unsafe { ffi::av_buffersink_set_frame_size(ptr, size) };
    }
}

fn filters_err(msg: &str) -> TranscodeError {
    tracing::error!("{}", msg);
    TranscodeError::Filters(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_adapter(fps: Option<Fraction>) -> FilterAdapter {
        let mut adapter = FilterAdapter::new_video(fps);
        // Exercise the PTS arithmetic without a live graph.
        adapter.time_base = ffmpeg::Rational::new(1, 90000);
        adapter
    }

    #[test]
    fn test_custom_pts_tracks_input_deltas_mid_segment() {
        let mut adapter = video_adapter(Some(Fraction::new(30, 1)));
        adapter.advance_custom_pts(3000);
        assert_eq!(adapter.custom_pts, 3000);
        adapter.advance_custom_pts(6000);
        assert_eq!(adapter.custom_pts, 6000);
        // A backwards jump still advances by the (negative) delta, keeping
        // the counter consistent with the previous-frame bookkeeping.
        adapter.advance_custom_pts(9000);
        assert_eq!(adapter.custom_pts, 9000);
        assert_eq!(adapter.prev_frame_pts, 9000);
    }

    #[test]
    fn test_first_frame_of_later_segment_steps_one_frame() {
        let mut adapter = video_adapter(Some(Fraction::new(30, 1)));
        adapter.advance_custom_pts(3000);
        adapter.advance_custom_pts(6000);
        adapter.finish_segment();
        assert_eq!(adapter.segments_complete, 0); // inactive graph: no count
        adapter.active = true;
        adapter.finish_segment();
        assert_eq!(adapter.segments_complete, 1);
        assert_eq!(adapter.prev_frame_pts, 0);
        // New segment restarting at PTS 0: the step is 1/fps in the input
        // timebase (90000/30 = 3000), not the raw delta (which would be 0).
        adapter.advance_custom_pts(0);
        assert_eq!(adapter.custom_pts, 9000);
    }

    #[test]
    fn test_passthrough_without_framerate() {
        let mut adapter = video_adapter(None);
        adapter.advance_custom_pts(500);
        assert_eq!(adapter.custom_pts, 500);
        adapter.advance_custom_pts(100);
        assert_eq!(adapter.custom_pts, 100);
    }

    #[test]
    fn test_audio_is_always_passthrough() {
        let mut adapter = FilterAdapter::new_audio();
        adapter.advance_custom_pts(1234);
        assert_eq!(adapter.custom_pts, 1234);
    }

    #[test]
    fn test_rebuild_detection() {
        let mut adapter = video_adapter(Some(Fraction::new(30, 1)));
        let pool_a = 0x1000 as *mut c_void;
        let pool_b = 0x2000 as *mut c_void;
        // Inactive adapters never ask for a rebuild.
        assert!(!adapter.needs_rebuild(pool_a));
        adapter.active = true;
        adapter.hwframes = pool_a;
        assert!(!adapter.needs_rebuild(pool_a));
        assert!(adapter.needs_rebuild(pool_b));
        assert!(!adapter.needs_rebuild(ptr::null_mut()));
        adapter.reset_for_rebuild();
        assert!(!adapter.is_active());
        assert_eq!(adapter.custom_pts, 0);
    }

    #[test]
    fn test_finish_segment_rearms_calibration() {
        let mut adapter = video_adapter(Some(Fraction::new(30, 1)));
        adapter.active = true;
        adapter.pts_offset = Some(42);
        adapter.phase = FlushPhase::Flushed;
        adapter.finish_segment();
        assert_eq!(adapter.pts_offset, None);
        assert_eq!(adapter.phase, FlushPhase::Running);
        assert_eq!(adapter.segments_complete, 1);
    }
}
