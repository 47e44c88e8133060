//! One output of a transcode session: filter graphs, encoders, muxer, and
//! the per-segment windowing/keyframe policies that sit between them.

pub(crate) mod encoder;
pub(crate) mod muxer;

use std::ffi::CString;
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::error::{Result, TranscodeError};
use crate::filter::{FilterAdapter, FlushPhase, GraphFrame, ReadOutcome};
use crate::input::InputPipeline;
use crate::io::{PacketFlags, PacketQueue, WriteState};
use crate::types::{
    ms_to_tb, AnalysisOptions, HwDeviceKind, OutputDesc, OutputResults, MAX_CLASSIFY,
};

use muxer::{context_time_base, Muxer};

/// Preroll-audio drop decision, resolved at mux time. The encoder's initial
/// padding arrives as the first encoded packet(s); they are dropped so audio
/// starts aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrerollDrop {
    /// Encoder reported no initial padding.
    Off,
    /// Padding reported; the first muxed audio PTS will be the one to drop.
    Undecided,
    /// Drop every audio packet carrying exactly this PTS.
    At(i64),
}

/// Clip window state, tracked in stream-timebase units.
#[derive(Debug, Clone, Default)]
struct ClipWindow {
    from_set: bool,
    to_set: bool,
    audio_from: i64,
    audio_to: i64,
    video_from: i64,
    video_to: i64,
    audio_base: Option<i64>,
    video_base: Option<i64>,
    /// Set once the first video frame inside the window went through; audio
    /// before that point is dropped so the output starts on video.
    started: bool,
}

impl ClipWindow {
    /// Gate an audio timestamp. `None` drops it; `Some(shift)` keeps it with
    /// the given amount to subtract.
    fn gate_audio(&mut self, pts: i64) -> Option<i64> {
        let base = *self.audio_base.get_or_insert(pts);
        if self.to_set && pts > self.audio_to + base {
            return None;
        }
        if self.from_set {
            if !self.started {
                return None;
            }
            if pts < self.audio_from + base {
                return None;
            }
            return Some(self.audio_from + base);
        }
        Some(0)
    }

    /// Gate a video timestamp; marks the clip as started on the first keeper.
    fn gate_video(&mut self, pts: i64) -> Option<i64> {
        let base = *self.video_base.get_or_insert(pts);
        if self.to_set && pts > self.video_to + base {
            return None;
        }
        if self.from_set && pts < self.video_from + base {
            return None;
        }
        self.started = true;
        Some(if self.from_set { self.video_from + base } else { 0 })
    }
}

/// Progress of a drive/flush step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainState {
    /// Input consumed (or another flush round is needed).
    Consumed,
    /// Encoder fully drained; stop calling.
    Finished,
}

pub(crate) struct OutputPipeline {
    desc: OutputDesc,
    index: usize,
    pub drop_video: bool,
    pub drop_audio: bool,

    // The muxer must drop before the write state its AVIO references.
    muxer: Option<Muxer>,
    write_state: Option<Box<WriteState>>,
    video_stream_index: Option<usize>,
    audio_stream_index: Option<usize>,

    video_encoder: Option<ffmpeg::encoder::Video>,
    audio_encoder: Option<ffmpeg::encoder::Audio>,
    /// Keep the video encoder across segments (hardware encoders are
    /// expensive to reinitialise).
    preserve_video_encoder: bool,
    hw_kind: HwDeviceKind,

    video_filter: FilterAdapter,
    audio_filter: FilterAdapter,
    analysis_filter: Option<FilterAdapter>,
    analysis_opts: Option<AnalysisOptions>,

    /// GOP target in output frame-timebase units; 0 disables GOP control.
    gop_pts_len: i64,
    /// PTS at which the next keyframe is forced.
    next_kf_pts: Option<i64>,

    preroll: PrerollDrop,
    clip: Option<ClipWindow>,

    pub res: OutputResults,
}

impl OutputPipeline {
    pub fn new(desc: &OutputDesc, index: usize) -> Self {
        Self {
            video_filter: FilterAdapter::new_video(desc.fps),
            audio_filter: FilterAdapter::new_audio(),
            desc: desc.clone(),
            index,
            drop_video: false,
            drop_audio: false,
            muxer: None,
            write_state: None,
            video_stream_index: None,
            audio_stream_index: None,
            video_encoder: None,
            audio_encoder: None,
            preserve_video_encoder: false,
            hw_kind: HwDeviceKind::None,
            analysis_filter: None,
            analysis_opts: None,
            gop_pts_len: 0,
            next_kf_pts: None,
            preroll: PrerollDrop::Off,
            clip: None,
            res: OutputResults::default(),
        }
    }

    /// Refresh per-segment configuration. Runs after the input is open so
    /// the drop decisions can see which streams actually exist.
    pub fn reconfigure(
        &mut self,
        desc: &OutputDesc,
        input: &InputPipeline,
        analysis_opts: Option<&AnalysisOptions>,
    ) {
        self.desc = desc.clone();
        self.drop_video = input.video_stream_index().is_none() || desc.video.is_drop();
        self.drop_audio = input.audio_stream_index().is_none() || desc.audio.is_drop();
        self.analysis_opts = analysis_opts.cloned();
        self.hw_kind = input.hw_kind();
        self.preroll = PrerollDrop::Off;
        self.next_kf_pts = None;
        self.gop_pts_len = 0;
        self.res = OutputResults::default();
        if desc.is_analysis {
            self.res.probs = vec![0.0; MAX_CLASSIFY];
        }
        self.clip = if desc.clip_from_ms.is_some() || desc.clip_to_ms.is_some() {
            let audio_tb = input
                .audio_stream_index()
                .and_then(|ai| input.stream_time_base(ai))
                .unwrap_or(ffmpeg::Rational::new(1, 44100));
            let video_tb = input
                .video_stream_index()
                .and_then(|vi| input.stream_time_base(vi))
                .unwrap_or(ffmpeg::Rational::new(1, 90000));
            Some(ClipWindow {
                from_set: desc.clip_from_ms.is_some(),
                to_set: desc.clip_to_ms.is_some(),
                audio_from: desc.clip_from_ms.map(|ms| ms_to_tb(ms, audio_tb)).unwrap_or(0),
                audio_to: desc.clip_to_ms.map(|ms| ms_to_tb(ms, audio_tb)).unwrap_or(0),
                video_from: desc.clip_from_ms.map(|ms| ms_to_tb(ms, video_tb)).unwrap_or(0),
                video_to: desc.clip_to_ms.map(|ms| ms_to_tb(ms, video_tb)).unwrap_or(0),
                ..ClipWindow::default()
            })
        } else {
            None
        };
    }

    // ── Opening ──────────────────────────────────────────────────────────────

    pub fn open(&mut self, input: &InputPipeline, queue: Option<&Arc<PacketQueue>>) -> Result<()> {
        if self.desc.is_analysis {
            // Analysis outputs produce results, not media; graph built lazily
            // on the first frame once the decoder geometry is known.
            return Ok(());
        }
        if input.transmuxing {
            return self.open_transmux(input, queue);
        }

        if self.write_state.is_none() {
            if let Some(queue) = queue {
                self.write_state = Some(Box::new(WriteState::new(Arc::clone(queue), self.index)));
            }
        }
        let mut muxer = self.create_muxer()?;

        // Video encode path: filter graph first (the encoder inherits its
        // negotiated parameters), encoder reused across segments when
        // hardware makes reopening expensive.
        if input.has_video_decoder() && self.desc.video.needs_decoder() && !self.drop_video {
            if !self.video_filter.is_active() {
                let src = input.video_source_info().ok_or_else(|| {
                    TranscodeError::Filters("video decoder not ready for filter setup".into())
                })?;
                let spec = self.desc.video_filters.clone().unwrap_or_default();
                self.video_filter.init_video(&src, &spec)?;
            }
            if self.video_encoder.is_none() {
                let enc = encoder::open_video_encoder(
                    &self.desc,
                    &mut self.video_filter,
                    input,
                    muxer.requires_global_header(),
                )?;
                self.video_encoder = Some(enc);
                self.preserve_video_encoder = self.hw_kind.is_hw();
            }
        }

        // Video stream
        if let Some(vi) = input.video_stream_index() {
            if !self.drop_video {
                let rate = self
                    .desc
                    .fps
                    .map(|f| f.to_rational())
                    .or_else(|| input.stream_frame_rate(vi))
                    .unwrap_or(ffmpeg::Rational::new(25, 1));
                let index = if self.desc.video.is_copy() {
                    let params = input.stream_parameters(vi).expect("video stream exists");
                    let tb = input.stream_time_base(vi).expect("video stream exists");
                    muxer.add_copy_stream(&params, tb, rate, input.stream_ptr(vi))?
                } else if let Some(enc) = &self.video_encoder {
                    let index = muxer.add_video_encoder_stream(enc, rate)?;
                    if let Some(gop_ms) = self.desc.gop_time_ms {
                        // The framerate filter emits PTS stepping by one at
                        // 1/fps; other graphs keep the input timebase.
                        let dest_tb = match self.desc.fps {
                            Some(f) => f.invert(),
                            None => input.stream_time_base(vi).expect("video stream exists"),
                        };
                        self.gop_pts_len = ms_to_tb(gop_ms, dest_tb);
                        self.next_kf_pts = Some(0);
                    }
                    index
                } else {
                    return Err(TranscodeError::OpenMuxer(
                        "video output requested without encoder or copy".into(),
                    ));
                };
                self.video_stream_index = Some(index);
            }
        }

        // Audio: encode, copy, or drop.
        if input.has_audio_decoder() && self.desc.audio.needs_decoder() && !self.drop_audio {
            if !self.audio_filter.is_active() {
                let src = input.audio_source_info().ok_or_else(|| {
                    TranscodeError::Filters("audio decoder not ready for filter setup".into())
                })?;
                self.audio_filter.init_audio(&src)?;
            }
            let (enc, frame_size) = encoder::open_audio_encoder(
                &self.desc,
                &mut self.audio_filter,
                muxer.requires_global_header(),
            )?;
            if frame_size > 0 {
                self.audio_filter.set_sink_frame_size(frame_size);
            }
            let (index, padding) = muxer.add_audio_encoder_stream(&enc)?;
            if padding > 0 {
                self.preroll = PrerollDrop::Undecided;
            }
            self.audio_stream_index = Some(index);
            self.audio_encoder = Some(enc);
        } else if let Some(ai) = input.audio_stream_index() {
            if !self.drop_audio && self.desc.audio.is_copy() {
                let params = input.stream_parameters(ai).expect("audio stream exists");
                let tb = input.stream_time_base(ai).expect("audio stream exists");
                let rate = input.stream_frame_rate(ai).unwrap_or(ffmpeg::Rational::new(0, 1));
                let index = muxer.add_copy_stream(&params, tb, rate, input.stream_ptr(ai))?;
                self.audio_stream_index = Some(index);
            }
        }

        muxer.write_header(&self.desc.muxer, &self.desc.metadata)?;
        self.stage_flags(PacketFlags::BEGIN_OF_OUTPUT, -1);
        self.muxer = Some(muxer);
        tracing::debug!(output = self.index, name = %self.desc.name, "output opened");
        Ok(())
    }

    fn open_transmux(
        &mut self,
        input: &InputPipeline,
        queue: Option<&Arc<PacketQueue>>,
    ) -> Result<()> {
        if self.muxer.is_some() {
            // Transmux outputs live across segments until the session stops.
            return Ok(());
        }
        if self.write_state.is_none() {
            if let Some(queue) = queue {
                self.write_state = Some(Box::new(WriteState::new(Arc::clone(queue), self.index)));
            }
        }
        let mut muxer = self.create_muxer()?;
        muxer.set_flush_packets();
        for i in 0..input.stream_count() {
            let params = input.stream_parameters(i).expect("stream exists");
            let tb = input.stream_time_base(i).expect("stream exists");
            let rate = self
                .desc
                .fps
                .map(|f| f.to_rational())
                .or_else(|| input.stream_frame_rate(i))
                .unwrap_or(ffmpeg::Rational::new(0, 1));
            muxer.add_copy_stream(&params, tb, rate, input.stream_ptr(i))?;
        }
        muxer.write_header(&self.desc.muxer, &self.desc.metadata)?;
        self.stage_flags(PacketFlags::BEGIN_OF_OUTPUT, -1);
        self.muxer = Some(muxer);
        tracing::debug!(output = self.index, "transmux output opened");
        Ok(())
    }

    fn create_muxer(&mut self) -> Result<Muxer> {
        match &mut self.write_state {
            Some(ws) => {
                let state: *mut WriteState = &mut **ws;
                Muxer::open_queue(&self.desc.muxer, &self.desc.name, state)
            }
            None => Muxer::open_file(&self.desc.muxer, &self.desc.name),
        }
    }

    fn stage_flags(&mut self, flags: PacketFlags, timestamp: i64) {
        if let Some(ws) = &mut self.write_state {
            ws.push_staging(flags, timestamp);
        }
    }

    // ── Copy-mode packet paths ───────────────────────────────────────────────

    /// Transmux: every input stream has its 1:1 output counterpart.
    pub fn mux_transmux_packet(
        &mut self,
        pkt: &ffmpeg::Packet,
        from_tb: ffmpeg::Rational,
        medium: ffmpeg::media::Type,
    ) -> Result<()> {
        if self.muxer.is_none() {
            return Ok(());
        }
        let mut opkt = pkt.clone();
        let ts = {
            let muxer = self.muxer.as_mut().expect("muxer open");
            muxer.write_interleaved(&mut opkt, from_tb)?
        };
        self.stage_flags(PacketFlags::PACKET_OUTPUT, ts);
        match medium {
            ffmpeg::media::Type::Video => self.res.video_packets += 1,
            ffmpeg::media::Type::Audio => self.res.audio_packets += 1,
            _ => self.res.other_packets += 1,
        }
        Ok(())
    }

    pub fn wants_video_copy(&self) -> bool {
        !self.drop_video && self.desc.video.is_copy() && self.video_stream_index.is_some()
    }

    pub fn wants_audio_copy(&self) -> bool {
        !self.drop_audio && self.desc.audio.is_copy() && self.audio_stream_index.is_some()
    }

    pub fn mux_copy_video_packet(
        &mut self,
        pkt: &ffmpeg::Packet,
        from_tb: ffmpeg::Rational,
    ) -> Result<()> {
        let Some(index) = self.video_stream_index else {
            return Ok(());
        };
        let mut opkt = pkt.clone();
        opkt.set_stream(index);
        let ts = {
            let muxer = self.muxer.as_mut().expect("muxer open");
            muxer.write_interleaved(&mut opkt, from_tb)?
        };
        self.stage_flags(PacketFlags::PACKET_OUTPUT, ts);
        self.res.video_packets += 1;
        Ok(())
    }

    pub fn mux_copy_audio_packet(
        &mut self,
        pkt: &ffmpeg::Packet,
        from_tb: ffmpeg::Rational,
    ) -> Result<()> {
        let Some(index) = self.audio_stream_index else {
            return Ok(());
        };
        let mut shift = 0;
        if let Some(clip) = &mut self.clip {
            match clip.gate_audio(pkt.pts().unwrap_or(0)) {
                Some(s) => shift = s,
                None => return Ok(()),
            }
        }
        let mut opkt = pkt.clone();
        opkt.set_stream(index);
        if shift != 0 {
            if let Some(pts) = opkt.pts() {
                opkt.set_pts(Some(pts - shift));
            }
            if let Some(dts) = opkt.dts() {
                opkt.set_dts(Some(dts - shift));
            }
        }
        let ts = {
            let muxer = self.muxer.as_mut().expect("muxer open");
            muxer.write_interleaved(&mut opkt, from_tb)?
        };
        self.stage_flags(PacketFlags::PACKET_OUTPUT, ts);
        self.res.audio_packets += 1;
        Ok(())
    }

    // ── Encode paths ─────────────────────────────────────────────────────────

    /// Feed one decoded video frame through filter, encoder, and muxer.
    pub fn process_video_frame(
        &mut self,
        input: &mut InputPipeline,
        frame: &mut ffmpeg::frame::Video,
    ) -> Result<()> {
        if self.desc.is_analysis {
            return self.process_analysis_frame(input, frame);
        }
        if self.video_encoder.is_none() {
            return Ok(());
        }

        let original_pts = frame.pts();
        let mut shifted = false;
        if let Some(clip) = &mut self.clip {
            let pts = frame.pts().unwrap_or(0);
            match clip.gate_video(pts) {
                None => return Ok(()),
                Some(shift) if shift != 0 => {
                    frame.set_pts(Some(pts - shift));
                    shifted = true;
                }
                Some(_) => {}
            }
        }

        // The decoder may have replaced its frame pool since the graph was
        // built; rebuild against the current pool before submitting.
        let pool = input.video_frame_pool();
        if self.video_filter.needs_rebuild(pool) {
            tracing::warn!(output = self.index, "hardware frame pool changed; rebuilding video filter graph");
            self.video_filter.reset_for_rebuild();
            let src = input.video_source_info().ok_or_else(|| {
                TranscodeError::Filters("video decoder not ready for filter rebuild".into())
            })?;
            let spec = self.desc.video_filters.clone().unwrap_or_default();
            self.video_filter.init_video(&src, &spec)?;
        }

        let result = self.drive_video(input, Some(frame));
        if shifted {
            frame.set_pts(original_pts);
        }
        result.map(|_| ())
    }

    /// Feed one decoded audio frame through filter, encoder, and muxer.
    pub fn process_audio_frame(
        &mut self,
        input: &mut InputPipeline,
        frame: &mut ffmpeg::frame::Audio,
    ) -> Result<()> {
        if self.audio_encoder.is_none() || self.desc.is_analysis {
            return Ok(());
        }
        let original_pts = frame.pts();
        let mut shifted = false;
        if let Some(clip) = &mut self.clip {
            let pts = frame.pts().unwrap_or(0);
            match clip.gate_audio(pts) {
                None => return Ok(()),
                Some(shift) if shift != 0 => {
                    frame.set_pts(Some(pts - shift));
                    shifted = true;
                }
                Some(_) => {}
            }
        }
        let result = self.drive_audio(input, Some(frame));
        if shifted {
            frame.set_pts(original_pts);
        }
        result.map(|_| ())
    }

    fn drive_video(
        &mut self,
        input: &mut InputPipeline,
        frame: Option<&mut ffmpeg::frame::Video>,
    ) -> Result<DrainState> {
        let flushing = frame.is_none();
        match frame {
            Some(f) => self.video_filter.write_frame(f)?,
            None => {
                if let Some(template) = input.last_video_frame_mut() {
                    self.video_filter.write_flush_frame(template)?;
                }
            }
        }
        loop {
            match self.video_filter.read_frame()? {
                ReadOutcome::Flushed => continue,
                ReadOutcome::Again | ReadOutcome::Eof => {
                    if !flushing {
                        return Ok(DrainState::Consumed);
                    }
                    if self.video_filter.phase() == FlushPhase::Flushed
                        || input.last_video_frame_mut().is_none()
                    {
                        // Graph fully drained; now drain the encoder.
                        return self.drain_video_encoder();
                    }
                    return Ok(DrainState::Consumed);
                }
                ReadOutcome::Frame => {
                    self.mark_keyframes();
                    self.encode_video_result()?;
                }
            }
        }
    }

    fn drive_audio(
        &mut self,
        input: &mut InputPipeline,
        frame: Option<&mut ffmpeg::frame::Audio>,
    ) -> Result<DrainState> {
        let flushing = frame.is_none();
        match frame {
            Some(f) => self.audio_filter.write_frame(f)?,
            None => {
                if let Some(template) = input.last_audio_frame_mut() {
                    self.audio_filter.write_flush_frame(template)?;
                }
            }
        }
        loop {
            match self.audio_filter.read_frame()? {
                ReadOutcome::Flushed => continue,
                ReadOutcome::Again | ReadOutcome::Eof => {
                    if !flushing {
                        return Ok(DrainState::Consumed);
                    }
                    if self.audio_filter.phase() == FlushPhase::Flushed
                        || input.last_audio_frame_mut().is_none()
                    {
                        return self.drain_audio_encoder();
                    }
                    return Ok(DrainState::Consumed);
                }
                ReadOutcome::Frame => {
                    self.encode_audio_result()?;
                }
            }
        }
    }

    /// Force an I-frame on the first frame of the segment and on the GOP
    /// schedule.
    fn mark_keyframes(&mut self) {
        let pts = self.video_filter.result_frame().pts().unwrap_or(0);
        let mut force = self.res.frames == 0;
        if let (true, Some(next_kf)) = (self.gop_pts_len > 0, self.next_kf_pts) {
            if pts >= next_kf {
                force = true;
                self.next_kf_pts = Some(pts + self.gop_pts_len);
            }
        }
        if force {
            if let GraphFrame::Video(v) = self.video_filter.result_frame_mut() {
                v.set_kind(ffmpeg::picture::Type::I);
            }
        }
    }

    fn encode_video_result(&mut self) -> Result<()> {
        let Self {
            video_filter,
            video_encoder,
            muxer,
            res,
            write_state,
            video_stream_index,
            preroll: _,
            ..
        } = self;
        let enc = video_encoder.as_mut().expect("video encoder open");
        let muxer = muxer.as_mut().expect("muxer open");
        let index = video_stream_index.expect("video stream added");

        // SAFETY: plain geometry reads on the opened encoder.
        let (w, h) = unsafe { ((*enc.as_ptr()).width, (*enc.as_ptr()).height) };
        res.frames += 1;
        res.pixels += (w as u64) * (h as u64);

        let frame: &ffmpeg::Frame = match video_filter.result_frame() {
            GraphFrame::Video(v) => v,
            GraphFrame::Audio(a) => a,
        };
        match enc.send_frame(frame) {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) => {
                tracing::error!(%e, "error sending frame to video encoder");
                return Err(TranscodeError::Ffmpeg(e));
            }
        }
        let from_tb = context_time_base(enc);
        receive_into_muxer(
            &mut |pkt| enc.receive_packet(pkt),
            from_tb,
            muxer,
            index,
            ffmpeg::media::Type::Video,
            &mut PrerollDrop::Off,
            write_state,
        )
        .map(|_| ())
    }

    fn encode_audio_result(&mut self) -> Result<()> {
        let Self {
            audio_filter,
            audio_encoder,
            muxer,
            write_state,
            audio_stream_index,
            preroll,
            ..
        } = self;
        let enc = audio_encoder.as_mut().expect("audio encoder open");
        let muxer = muxer.as_mut().expect("muxer open");
        let index = audio_stream_index.expect("audio stream added");

        let frame: &ffmpeg::Frame = match audio_filter.result_frame() {
            GraphFrame::Video(v) => v,
            GraphFrame::Audio(a) => a,
        };
        match enc.send_frame(frame) {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) => {
                tracing::error!(%e, "error sending frame to audio encoder");
                return Err(TranscodeError::Ffmpeg(e));
            }
        }
        let from_tb = context_time_base(enc);
        receive_into_muxer(
            &mut |pkt| enc.receive_packet(pkt),
            from_tb,
            muxer,
            index,
            ffmpeg::media::Type::Audio,
            preroll,
            write_state,
        )
        .map(|_| ())
    }

    fn drain_video_encoder(&mut self) -> Result<DrainState> {
        let Self {
            video_encoder,
            muxer,
            write_state,
            video_stream_index,
            hw_kind,
            ..
        } = self;
        let enc = video_encoder.as_mut().expect("video encoder open");
        let muxer = muxer.as_mut().expect("muxer open");
        let index = video_stream_index.expect("video stream added");

        if *hw_kind == HwDeviceKind::MediaCodec {
            // Sending EOF would close this encoder for good; flush its
            // buffers instead and keep it usable for the next segment.
            // SAFETY: documented reset call on an opened encoder context.
            unsafe { ffi::avcodec_flush_buffers(enc.as_mut_ptr()) };
        } else {
            match enc.send_eof() {
                Ok(()) | Err(ffmpeg::Error::Eof) => {}
                Err(e) => {
                    tracing::error!(%e, "error flushing video encoder");
                    return Err(TranscodeError::Ffmpeg(e));
                }
            }
        }
        let from_tb = context_time_base(enc);
        let progress = receive_into_muxer(
            &mut |pkt| enc.receive_packet(pkt),
            from_tb,
            muxer,
            index,
            ffmpeg::media::Type::Video,
            &mut PrerollDrop::Off,
            write_state,
        )?;
        // Hardware encoders stay open, so EOF never arrives; treat the
        // want-more state as done.
        if *hw_kind == HwDeviceKind::MediaCodec {
            return Ok(DrainState::Finished);
        }
        Ok(progress)
    }

    fn drain_audio_encoder(&mut self) -> Result<DrainState> {
        let Self {
            audio_encoder,
            muxer,
            write_state,
            audio_stream_index,
            preroll,
            ..
        } = self;
        let enc = audio_encoder.as_mut().expect("audio encoder open");
        let muxer = muxer.as_mut().expect("muxer open");
        let index = audio_stream_index.expect("audio stream added");
        match enc.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) => {
                tracing::error!(%e, "error flushing audio encoder");
                return Err(TranscodeError::Ffmpeg(e));
            }
        }
        let from_tb = context_time_base(enc);
        receive_into_muxer(
            &mut |pkt| enc.receive_packet(pkt),
            from_tb,
            muxer,
            index,
            ffmpeg::media::Type::Audio,
            preroll,
            write_state,
        )
    }

    // ── Analysis outputs ─────────────────────────────────────────────────────

    fn process_analysis_frame(
        &mut self,
        input: &InputPipeline,
        frame: &mut ffmpeg::frame::Video,
    ) -> Result<()> {
        let Some(spec) = self.desc.analysis_filters.clone() else {
            return Ok(());
        };
        if self.analysis_filter.is_none() {
            let mut adapter = FilterAdapter::new_video(None);
            let time_base = input
                .video_stream_index()
                .and_then(|vi| input.stream_time_base(vi))
                .unwrap_or(ffmpeg::Rational::new(1, 90000));
            let src = crate::filter::VideoSourceInfo {
                width: frame.width(),
                height: frame.height(),
                pix_fmt: frame.format().into(),
                time_base,
                sample_aspect_ratio: frame.aspect_ratio(),
                // SAFETY: plain field read; borrowed for graph construction.
                hw_frames_ctx: unsafe { (*frame.as_ptr()).hw_frames_ctx },
            };
            adapter.init_video(&src, &spec)?;
            self.analysis_filter = Some(adapter);
        }

        let Self {
            analysis_filter,
            analysis_opts,
            res,
            ..
        } = self;
        let adapter = analysis_filter.as_mut().expect("analysis graph built");
        adapter.write_frame(frame)?;
        loop {
            match adapter.read_frame()? {
                ReadOutcome::Frame => {
                    res.frames += 1;
                    if let Some(opts) = analysis_opts {
                        // SAFETY: metadata read on the live result frame.
                        let probs = unsafe {
                            frame_metadata_probs(adapter_frame_ptr(adapter), &opts.metadata_key)
                        };
                        for (slot, p) in res.probs.iter_mut().zip(probs) {
                            *slot += p;
                        }
                    }
                }
                ReadOutcome::Flushed => continue,
                ReadOutcome::Again | ReadOutcome::Eof => break,
            }
        }
        Ok(())
    }

    // ── Per-segment flush & teardown ─────────────────────────────────────────

    /// Flush filters, then encoders, then the muxer's interleaving queue.
    pub fn flush(&mut self, input: &mut InputPipeline) -> Result<()> {
        if self.desc.is_analysis {
            let Self {
                analysis_filter,
                res,
                ..
            } = self;
            if let Some(adapter) = analysis_filter {
                adapter.close_source()?;
                loop {
                    match adapter.read_frame()? {
                        ReadOutcome::Frame => res.frames += 1,
                        ReadOutcome::Flushed => continue,
                        ReadOutcome::Again | ReadOutcome::Eof => break,
                    }
                }
            }
            // A closed source cannot take the next segment's frames; the
            // graph is rebuilt lazily on the first frame then.
            *analysis_filter = None;
            if res.frames > 0 {
                let frames = res.frames as f64;
                for p in &mut res.probs {
                    *p /= frames;
                }
            }
            return Ok(());
        }
        if self.video_encoder.is_some() {
            loop {
                match self.drive_video(input, None)? {
                    DrainState::Consumed => continue,
                    DrainState::Finished => break,
                }
            }
        }
        if self.audio_encoder.is_some() {
            loop {
                match self.drive_audio(input, None)? {
                    DrainState::Consumed => continue,
                    DrainState::Finished => break,
                }
            }
        }
        if let Some(muxer) = &mut self.muxer {
            muxer.flush_packets();
        }
        Ok(())
    }

    /// Transmux outputs only flush the muxer between segments.
    pub fn flush_transmux(&mut self) {
        if let Some(muxer) = &mut self.muxer {
            muxer.flush_packets();
        }
    }

    /// Segment teardown: trailer + muxer close, audio encoder release, and
    /// adapter re-arming. The video encoder survives when hardware-backed.
    pub fn close_segment(&mut self) -> Result<()> {
        if self.desc.is_analysis {
            self.video_filter.finish_segment();
            return Ok(());
        }
        let mut result = Ok(());
        if let Some(muxer) = self.muxer.as_mut() {
            result = muxer.write_trailer();
        }
        if self.muxer.is_some() {
            self.stage_flags(PacketFlags::END_OF_OUTPUT, -1);
        }
        self.muxer = None;
        self.audio_encoder = None;
        if !self.preserve_video_encoder {
            self.video_encoder = None;
        }
        self.video_stream_index = None;
        self.audio_stream_index = None;
        self.video_filter.finish_segment();
        self.audio_filter.finish_segment();
        result
    }

    /// Write the trailer of a transmux output; only called when the session
    /// stops.
    pub fn close_transmux(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(muxer) = self.muxer.as_mut() {
            result = muxer.write_trailer();
        }
        if self.muxer.is_some() {
            self.stage_flags(PacketFlags::END_OF_OUTPUT, -1);
        }
        self.muxer = None;
        result
    }

    /// Full teardown, hardware encoder included.
    pub fn close(&mut self) {
        let _ = self.close_segment();
        self.video_encoder = None;
        self.analysis_filter = None;
        self.video_filter.reset_for_rebuild();
        self.audio_filter.reset_for_rebuild();
        self.write_state = None;
    }
}

/// Drain every pending packet from an encoder into the muxer. Returns
/// `Consumed` on EAGAIN (encoder wants more input) and `Finished` on EOF.
fn receive_into_muxer(
    receive: &mut dyn FnMut(&mut ffmpeg::Packet) -> std::result::Result<(), ffmpeg::Error>,
    from_tb: ffmpeg::Rational,
    muxer: &mut Muxer,
    stream_index: usize,
    medium: ffmpeg::media::Type,
    preroll: &mut PrerollDrop,
    write_state: &mut Option<Box<WriteState>>,
) -> Result<DrainState> {
    let mut pkt = ffmpeg::Packet::empty();
    loop {
        match receive(&mut pkt) {
            Ok(()) => {
                pkt.set_stream(stream_index);
                let to_tb = muxer.stream_time_base(stream_index);
                if from_tb != to_tb {
                    pkt.rescale_ts(from_tb, to_tb);
                }
                // Preroll drop: the first audio PTS seen becomes the one to
                // drop; packets repeating it are padding, not media.
                if medium == ffmpeg::media::Type::Audio {
                    if *preroll == PrerollDrop::Undecided {
                        *preroll = PrerollDrop::At(pkt.pts().unwrap_or(0));
                    }
                    if let PrerollDrop::At(ts) = *preroll {
                        if ts != 0 && pkt.pts() == Some(ts) {
                            pkt = ffmpeg::Packet::empty();
                            continue;
                        }
                    }
                }
                let ts = pkt.pts().or(pkt.dts()).unwrap_or(-1);
                muxer.write_raw(&mut pkt)?;
                if let Some(ws) = write_state {
                    ws.push_staging(PacketFlags::PACKET_OUTPUT, ts);
                }
                pkt = ffmpeg::Packet::empty();
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(DrainState::Consumed)
            }
            Err(ffmpeg::Error::Eof) => return Ok(DrainState::Finished),
            Err(e) => {
                tracing::error!(%e, "error receiving packet from encoder");
                return Err(TranscodeError::Ffmpeg(e));
            }
        }
    }
}

/// Raw pointer to an adapter's result frame, for metadata reads.
fn adapter_frame_ptr(adapter: &FilterAdapter) -> *const ffi::AVFrame {
    // SAFETY: pointer extraction only; the frame outlives the read.
    unsafe {
        match adapter.result_frame() {
            GraphFrame::Video(v) => v.as_ptr(),
            GraphFrame::Audio(a) => a.as_ptr(),
        }
    }
}

/// Parse per-class confidences from a frame-metadata entry: a comma-separated
/// float list written by the analysis filter.
unsafe fn frame_metadata_probs(frame: *const ffi::AVFrame, key: &str) -> Vec<f64> {
    let Ok(c_key) = CString::new(key) else {
        return Vec::new();
    };
    let entry = ffi::av_dict_get((*frame).metadata, c_key.as_ptr(), std::ptr::null(), 0);
    if entry.is_null() {
        return Vec::new();
    }
    let value = std::ffi::CStr::from_ptr((*entry).value).to_string_lossy();
    value
        .split(',')
        .take(MAX_CLASSIFY)
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_window_audio_waits_for_video() {
        // 1000–2000 ms window at 90 kHz on both streams.
        let mut clip = ClipWindow {
            from_set: true,
            to_set: true,
            audio_from: 90_000,
            audio_to: 180_000,
            video_from: 90_000,
            video_to: 180_000,
            ..ClipWindow::default()
        };
        // Audio inside the window but before any video frame: dropped.
        assert_eq!(clip.gate_audio(0), None);
        assert_eq!(clip.gate_audio(100_000), None);
        // First video frame inside the window starts the clip.
        assert_eq!(clip.gate_video(0), None); // before `from`
        assert_eq!(clip.gate_video(95_000), Some(90_000));
        assert!(clip.started);
        // Audio now passes, shifted by from+base.
        assert_eq!(clip.gate_audio(120_000), Some(90_000));
        // Outside the window on either side: dropped.
        assert_eq!(clip.gate_audio(250_000), None);
        assert_eq!(clip.gate_video(250_000), None);
    }

    #[test]
    fn test_clip_window_bases_are_first_seen() {
        let mut clip = ClipWindow {
            from_set: true,
            audio_from: 90_000,
            video_from: 90_000,
            ..ClipWindow::default()
        };
        // Streams starting at a non-zero PTS anchor the window there.
        assert_eq!(clip.gate_video(500_000), None); // 500k < 500k+90k
        assert_eq!(clip.video_base, Some(500_000));
        assert_eq!(clip.gate_video(600_000), Some(590_000));
    }

    #[test]
    fn test_clip_to_only_passes_audio_immediately() {
        let mut clip = ClipWindow {
            to_set: true,
            audio_to: 180_000,
            video_to: 180_000,
            ..ClipWindow::default()
        };
        // Without `from`, audio needs no video to start and is not shifted.
        assert_eq!(clip.gate_audio(0), Some(0));
        assert_eq!(clip.gate_audio(200_000), None);
    }

    #[test]
    fn test_preroll_drop_state_machine() {
        let mut preroll = PrerollDrop::Undecided;
        // First audio packet pts resolves the sentinel.
        if preroll == PrerollDrop::Undecided {
            preroll = PrerollDrop::At(-1024);
        }
        assert_eq!(preroll, PrerollDrop::At(-1024));
        // Matching pts → dropped; later pts → kept.
        if let PrerollDrop::At(ts) = preroll {
            assert!(ts != 0 && Some(ts) == Some(-1024));
            assert!(!(ts != 0 && Some(ts) == Some(0)));
        }
    }

    #[test]
    fn test_gop_schedule() {
        // 2-second GOP, 30 fps output: gop_pts_len 60 in frame units.
        let gop_pts_len = ms_to_tb(2000, crate::types::Fraction::new(30, 1).invert());
        assert_eq!(gop_pts_len, 60);
        let mut next_kf = 0i64;
        let mut forced = Vec::new();
        for pts in 0..180 {
            if pts >= next_kf {
                forced.push(pts);
                next_kf = pts + gop_pts_len;
            }
        }
        assert_eq!(forced, vec![0, 60, 120]);
    }
}
