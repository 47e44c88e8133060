//! The per-stream transcode session: one input pipeline, up to
//! [`MAX_OUTPUTS`] output pipelines, and the segment-level state machine
//! driving demux → decode → filter → encode → mux across many segments.
//!
//! Expensive components (hardware device contexts, hardware decoders and
//! encoders, filter graphs) persist across segments and are only released by
//! [`Session::stop`]. Everything else is rebuilt per segment.

use std::sync::Arc;

use ffmpeg_next as ffmpeg;

use crate::error::{Result, TranscodeError};
use crate::input::{is_flush_frame, FlushEvent, InputPipeline};
use crate::io::{ByteBuffer, OutputPacket, PacketQueue, StreamErrorCode};
use crate::output::OutputPipeline;
use crate::types::{
    rescale_ts, AnalysisOptions, DecodedResults, InputDesc, OutputDesc, TranscodeReport,
    MAX_OUTPUTS,
};

/// Producer-side handle for byte-streaming input. Cloneable; safe to use
/// from a different thread while `transcode` runs.
#[derive(Clone)]
pub struct ByteWriter {
    buffer: Arc<ByteBuffer>,
}

impl ByteWriter {
    /// Append segment bytes, blocking while the buffer is full.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.buffer.push_bytes(bytes);
    }

    /// Signal that no more bytes are coming for this stream.
    pub fn push_eof(&self) {
        self.buffer.end_of_stream();
    }

    /// Abort the in-flight segment: the demuxer's next read fails with the
    /// mapped error and the failure bubbles out of `transcode`.
    pub fn push_error(&self, code: StreamErrorCode) {
        self.buffer.error(code);
    }
}

/// Consumer-side handle for muxed output packets. Cloneable; safe to use
/// from a different thread while `transcode` runs.
#[derive(Clone)]
pub struct PacketReader {
    queue: Arc<PacketQueue>,
}

impl PacketReader {
    /// Block until a packet is available and return it without consuming.
    pub fn peek_packet(&self) -> OutputPacket {
        self.queue.peek_front()
    }

    /// Block until a packet is available, consume, and return it.
    pub fn pop_packet(&self) -> OutputPacket {
        self.queue.pop_front()
    }

    /// Non-blocking peek.
    pub fn try_peek_packet(&self) -> Option<OutputPacket> {
        self.queue.try_peek_front()
    }
}

pub struct Session {
    input: InputPipeline,
    outputs: Vec<OutputPipeline>,
    /// `is_analysis` flags of the previous segment's outputs; the
    /// configuration-change rule compares against these.
    prev_analysis: Option<Vec<bool>>,
    analysis: Option<AnalysisOptions>,
    /// Shared analysis graph holding the loaded model for the session's
    /// lifetime; built once so per-segment output churn never reloads it.
    analysis_graph: Option<ffmpeg::filter::Graph>,
    byte_buffer: Arc<ByteBuffer>,
    packet_queue: Arc<PacketQueue>,
    use_pushed_io: bool,
}

impl Session {
    /// Allocate an empty session. With analysis options, the named
    /// classification filter is instantiated once and kept for the session's
    /// lifetime; its absence from the codec build is a `Filters` error.
    pub fn new(analysis: Option<AnalysisOptions>) -> Result<Self> {
        ffmpeg::init().map_err(|e| {
            tracing::error!(%e, "codec library initialisation failed");
            TranscodeError::Ffmpeg(e)
        })?;
        let analysis_graph = match &analysis {
            Some(opts) => Some(build_analysis_graph(opts)?),
            None => None,
        };
        Ok(Self {
            input: InputPipeline::new(),
            outputs: Vec::new(),
            prev_analysis: None,
            analysis,
            analysis_graph,
            byte_buffer: Arc::new(ByteBuffer::new()),
            packet_queue: Arc::new(PacketQueue::new()),
            use_pushed_io: false,
        })
    }

    /// Mark every input stream as discontinuous: the next packet per stream
    /// establishes a new timestamp offset (§ transmuxing).
    pub fn discontinuity(&mut self) {
        self.input.mark_discontinuity();
    }

    /// Reset the byte buffer and packet queue, and choose between pushed IO
    /// (caller-driven bytes in, packets out) and file IO for subsequent
    /// segments. Only valid between segments.
    pub fn push_reset(&mut self, enable: bool) {
        self.byte_buffer.reset();
        self.packet_queue.reset();
        self.use_pushed_io = enable;
    }

    pub fn byte_writer(&self) -> ByteWriter {
        ByteWriter {
            buffer: Arc::clone(&self.byte_buffer),
        }
    }

    pub fn packet_reader(&self) -> PacketReader {
        PacketReader {
            queue: Arc::clone(&self.packet_queue),
        }
    }

    // Delegates mirroring the handle surface, for callers that drive the
    // session from one thread. The peek/pop pair blocks; a caller sharing
    // the transcode thread should prefer `packet_reader().try_peek_packet`.

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.byte_buffer.push_bytes(bytes);
    }

    pub fn push_eof(&self) {
        self.byte_buffer.end_of_stream();
    }

    pub fn push_error(&self, code: StreamErrorCode) {
        self.byte_buffer.error(code);
    }

    pub fn peek_packet(&self) -> OutputPacket {
        self.packet_queue.peek_front()
    }

    pub fn pop_packet(&self) -> OutputPacket {
        self.packet_queue.pop_front()
    }

    /// Run one segment through the session.
    ///
    /// The outputs must match the previous segment's outputs, or differ only
    /// by adding/removing analysis-only outputs; any media-output difference
    /// fails with `OutputsMismatch`. Per-segment state is torn down on both
    /// success and failure, with hardware components retained.
    pub fn transcode(
        &mut self,
        input: &InputDesc,
        outputs: &[OutputDesc],
    ) -> Result<TranscodeReport> {
        if outputs.len() > MAX_OUTPUTS {
            return Err(TranscodeError::OutputsMismatch(format!(
                "{} outputs exceed the limit of {}",
                outputs.len(),
                MAX_OUTPUTS
            )));
        }
        self.check_configuration_change(outputs)?;
        self.prev_analysis = Some(outputs.iter().map(|o| o.is_analysis).collect());

        // Decoders are only opened when some output consumes frames.
        self.input.skip_video_decode = outputs.iter().all(|o| !o.video.needs_decoder());
        self.input.skip_audio_decode = outputs.iter().all(|o| !o.audio.needs_decoder());

        let result = self.run_segment(input, outputs);

        // Per-segment teardown runs on success and failure alike; hardware
        // decoder/encoder contexts survive inside the pipelines.
        let mut close_result: Result<()> = Ok(());
        if !self.input.transmuxing {
            for output in &mut self.outputs {
                let r = output.close_segment();
                if close_result.is_ok() {
                    close_result = r;
                }
            }
        }
        self.input.close_segment();
        if self.use_pushed_io {
            self.packet_queue.push_end();
        }

        let decoded = result?;
        close_result?;
        Ok(TranscodeReport {
            decoded,
            outputs: self.outputs.iter().map(|o| o.res.clone()).collect(),
        })
    }

    /// Tear everything down: transmux trailers, encoders, hardware contexts,
    /// buffers. Consumes the session, so it runs exactly once.
    pub fn stop(mut self) -> Result<()> {
        let mut result = Ok(());
        for output in &mut self.outputs {
            if self.input.transmuxing {
                let r = output.close_transmux();
                if result.is_ok() {
                    result = r;
                }
            }
            output.close();
        }
        self.input.close();
        self.analysis_graph = None;
        tracing::info!("session stopped");
        result
    }

    // ── Configuration change rule ────────────────────────────────────────────

    /// Symmetric analysis-only tolerance: when the output count changes, every
    /// output in the disputed index range must be analysis-only — taken from
    /// whichever configuration defines it, preferring the new one.
    fn check_configuration_change(&self, outputs: &[OutputDesc]) -> Result<()> {
        let Some(prev) = &self.prev_analysis else {
            return Ok(());
        };
        if prev.len() == outputs.len() {
            return Ok(());
        }
        let lo = prev.len().min(outputs.len());
        let hi = prev.len().max(outputs.len());
        for i in lo..hi {
            let is_analysis = outputs.get(i).map(|o| o.is_analysis).unwrap_or_else(|| prev[i]);
            if !is_analysis {
                tracing::error!(
                    previous = prev.len(),
                    current = outputs.len(),
                    index = i,
                    "media output count changed across segments"
                );
                return Err(TranscodeError::OutputsMismatch(format!(
                    "output {} changed across segments and is not analysis-only",
                    i
                )));
            }
        }
        Ok(())
    }

    // ── Segment run ──────────────────────────────────────────────────────────

    fn run_segment(
        &mut self,
        input_desc: &InputDesc,
        outputs: &[OutputDesc],
    ) -> Result<DecodedResults> {
        let buffer = self.use_pushed_io.then(|| Arc::clone(&self.byte_buffer));
        self.input.open(input_desc, buffer.as_ref())?;

        // Bring the output pipelines in line with this segment's descriptors.
        // Analysis options only reach the outputs when the session graph
        // actually loaded.
        let analysis = self
            .analysis_graph
            .is_some()
            .then(|| self.analysis.as_ref())
            .flatten();
        self.outputs.truncate(outputs.len());
        for (i, desc) in outputs.iter().enumerate() {
            if i < self.outputs.len() {
                self.outputs[i].reconfigure(desc, &self.input, analysis);
            } else {
                let mut pipeline = OutputPipeline::new(desc, i);
                pipeline.reconfigure(desc, &self.input, analysis);
                self.outputs.push(pipeline);
            }
        }
        let queue = self.use_pushed_io.then(|| Arc::clone(&self.packet_queue));
        for output in &mut self.outputs {
            output.open(&self.input, queue.as_ref())?;
        }

        let mut decoded = DecodedResults::default();
        let mut vframe = ffmpeg::frame::Video::empty();
        let mut aframe = ffmpeg::frame::Audio::empty();

        // Main demux loop: classify each packet, mux it to copy-mode
        // subscribers, and feed the matching decoder.
        while let Some(mut pkt) = self.input.read_packet()? {
            match self.input.stream_medium(pkt.stream()) {
                Some(ffmpeg::media::Type::Video) => {
                    self.handle_video_packet(&mut pkt, &mut decoded, &mut vframe)?
                }
                Some(ffmpeg::media::Type::Audio) => {
                    self.handle_audio_packet(&mut pkt, &mut decoded, &mut aframe)?
                }
                _ => self.handle_other_packet(&mut pkt, &mut decoded)?,
            }
        }

        // Demuxer done; drain the decoders.
        loop {
            match self.input.flush_next(&mut vframe, &mut aframe)? {
                FlushEvent::VideoFrame => self.handle_video_frame(&mut vframe, &mut decoded)?,
                FlushEvent::AudioFrame => self.handle_audio_frame(&mut aframe, &mut decoded)?,
                FlushEvent::Progress => continue,
                FlushEvent::Done => break,
            }
        }

        // Decoders drained; flush filters, encoders, and muxers.
        if self.input.transmuxing {
            for output in &mut self.outputs {
                output.flush_transmux();
            }
        } else {
            let Self { input, outputs, .. } = self;
            for output in outputs.iter_mut() {
                output.flush(input)?;
            }
        }

        Ok(decoded)
    }

    // ── Packet handlers ──────────────────────────────────────────────────────

    fn handle_video_packet(
        &mut self,
        pkt: &mut ffmpeg::Packet,
        decoded: &mut DecodedResults,
        frame: &mut ffmpeg::frame::Video,
    ) -> Result<()> {
        decoded.video_packets += 1;
        self.input.cache_first_keyframe(pkt);
        if self.input.transmuxing {
            self.input.rewrite_discontinuity(pkt);
        }

        let tb = self
            .input
            .stream_time_base(pkt.stream())
            .unwrap_or(ffmpeg::Rational::new(1, 90000));
        let vi = self.input.video_stream_index();
        if self.input.transmuxing {
            for output in &mut self.outputs {
                output.mux_transmux_packet(pkt, tb, ffmpeg::media::Type::Video)?;
            }
        } else if Some(pkt.stream()) == vi {
            for output in &mut self.outputs {
                if output.wants_video_copy() {
                    output.mux_copy_video_packet(pkt, tb)?;
                }
            }
        }

        if Some(pkt.stream()) != vi || !self.input.has_video_decoder() {
            return Ok(());
        }
        if !self.input.send_video_packet(pkt)? {
            // Parked while the decoder settles; resubmitted after frames.
            return Ok(());
        }
        match self.input.receive_video_frame(frame)? {
            Some(()) => self.handle_video_frame(frame, decoded),
            // Not an error: the decoder wants more packets before a frame.
            None => Ok(()),
        }
    }

    fn handle_audio_packet(
        &mut self,
        pkt: &mut ffmpeg::Packet,
        decoded: &mut DecodedResults,
        frame: &mut ffmpeg::frame::Audio,
    ) -> Result<()> {
        decoded.audio_packets += 1;
        if self.input.transmuxing {
            self.input.rewrite_discontinuity(pkt);
        }

        let tb = self
            .input
            .stream_time_base(pkt.stream())
            .unwrap_or(ffmpeg::Rational::new(1, 48000));
        let ai = self.input.audio_stream_index();
        if self.input.transmuxing {
            for output in &mut self.outputs {
                output.mux_transmux_packet(pkt, tb, ffmpeg::media::Type::Audio)?;
            }
        } else if Some(pkt.stream()) == ai {
            for output in &mut self.outputs {
                if output.wants_audio_copy() {
                    output.mux_copy_audio_packet(pkt, tb)?;
                }
            }
        }

        if Some(pkt.stream()) != ai || !self.input.has_audio_decoder() {
            return Ok(());
        }
        self.input.send_audio_packet(pkt)?;
        match self.input.receive_audio_frame(frame)? {
            Some(()) => self.handle_audio_frame(frame, decoded),
            None => Ok(()),
        }
    }

    fn handle_other_packet(
        &mut self,
        pkt: &mut ffmpeg::Packet,
        decoded: &mut DecodedResults,
    ) -> Result<()> {
        decoded.other_packets += 1;
        if !self.input.transmuxing {
            // Extra streams are only carried when remuxing 1:1.
            return Ok(());
        }
        self.input.rewrite_discontinuity(pkt);
        let tb = self
            .input
            .stream_time_base(pkt.stream())
            .unwrap_or(ffmpeg::Rational::new(1, 90000));
        for output in &mut self.outputs {
            output.mux_transmux_packet(pkt, tb, ffmpeg::media::Type::Data)?;
        }
        Ok(())
    }

    // ── Frame handlers ───────────────────────────────────────────────────────

    fn handle_video_frame(
        &mut self,
        frame: &mut ffmpeg::frame::Video,
        decoded: &mut DecodedResults,
    ) -> Result<()> {
        if is_flush_frame(frame) {
            return Ok(());
        }
        decoded.frames += 1;
        decoded.video_frames += 1;
        decoded.pixels += (frame.width() as u64) * (frame.height() as u64);

        let vi = self.input.video_stream_index();
        let rate = vi.and_then(|i| self.input.stream_frame_rate(i));
        let tb = vi
            .and_then(|i| self.input.stream_time_base(i))
            .unwrap_or(ffmpeg::Rational::new(1, 90000));
        ensure_frame_duration(frame, rate, tb);

        self.input.retain_last_video_frame(frame);

        let Self { input, outputs, .. } = self;
        for output in outputs.iter_mut() {
            output.process_video_frame(input, frame)?;
        }
        Ok(())
    }

    fn handle_audio_frame(
        &mut self,
        frame: &mut ffmpeg::frame::Audio,
        decoded: &mut DecodedResults,
    ) -> Result<()> {
        decoded.audio_frames += 1;

        let ai = self.input.audio_stream_index();
        let rate = ai.and_then(|i| self.input.stream_frame_rate(i));
        let tb = ai
            .and_then(|i| self.input.stream_time_base(i))
            .unwrap_or(ffmpeg::Rational::new(1, 48000));
        ensure_frame_duration(frame, rate, tb);

        self.input.retain_last_audio_frame(frame);

        let Self { input, outputs, .. } = self;
        for output in outputs.iter_mut() {
            output.process_audio_frame(input, frame)?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Best-effort teardown mirroring `stop` for sessions dropped without
        // an explicit stop; all closes are idempotent.
        for output in &mut self.outputs {
            if self.input.transmuxing {
                let _ = output.close_transmux();
            }
            output.close();
        }
        self.input.close();
    }
}

/// Fill in a missing frame duration from the stream's nominal frame rate.
/// Without it the framerate filter may drop the frame.
fn ensure_frame_duration(
    frame: &mut ffmpeg::Frame,
    rate: Option<ffmpeg::Rational>,
    time_base: ffmpeg::Rational,
) {
    // SAFETY: plain field access on a live frame.
    unsafe {
        if (*frame.as_ptr()).duration != 0 {
            return;
        }
        match rate {
            Some(r) if r.numerator() != 0 && r.denominator() != 0 => {
                let dur = rescale_ts(
                    1,
                    ffmpeg::Rational::new(r.denominator(), r.numerator()),
                    time_base,
                );
                (*frame.as_mut_ptr()).duration = dur;
            }
            _ => {
                tracing::warn!("could not determine frame duration; filter might drop");
            }
        }
    }
}

fn build_analysis_graph(opts: &AnalysisOptions) -> Result<ffmpeg::filter::Graph> {
    let filter = ffmpeg::filter::find(&opts.filter_name).ok_or_else(|| {
        tracing::error!(name = %opts.filter_name, "analysis filter not present in this build");
        TranscodeError::Filters(format!("filter {:?} not found", opts.filter_name))
    })?;
    let mut graph = ffmpeg::filter::Graph::new();
    let mut args = format!(
        "model={}:input={}:output={}",
        opts.model_path, opts.input_name, opts.output_name
    );
    if !opts.backend_configs.is_empty() {
        args.push_str(&format!(":backend_configs={}", opts.backend_configs));
    }
    graph
        .add(&filter, &opts.filter_name, &args)
        .map_err(|e| {
            tracing::error!(%e, "unable to instantiate analysis filter");
            TranscodeError::Filters(format!("analysis filter: {}", e))
        })?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ComponentOpts;

    fn media_output() -> OutputDesc {
        OutputDesc {
            name: "/tmp/out.ts".into(),
            video: ComponentOpts::named("copy"),
            audio: ComponentOpts::named("copy"),
            ..OutputDesc::default()
        }
    }

    fn analysis_output() -> OutputDesc {
        OutputDesc {
            is_analysis: true,
            analysis_filters: Some("scale=224:224".into()),
            video: ComponentOpts::named("libx264"),
            ..OutputDesc::default()
        }
    }

    #[test]
    fn test_output_limit_enforced() {
        let mut session = Session::new(None).unwrap();
        let outputs = vec![media_output(); MAX_OUTPUTS + 1];
        let err = session
            .transcode(&InputDesc::file("/nonexistent.ts"), &outputs)
            .unwrap_err();
        assert!(matches!(err, TranscodeError::OutputsMismatch(_)));
    }

    #[test]
    fn test_configuration_change_rule_symmetric() {
        let mut session = Session::new(None).unwrap();

        // Same count: always fine.
        session.prev_analysis = Some(vec![false, false]);
        assert!(session
            .check_configuration_change(&[media_output(), media_output()])
            .is_ok());

        // Removing an analysis output: fine.
        session.prev_analysis = Some(vec![false, true]);
        assert!(session.check_configuration_change(&[media_output()]).is_ok());

        // Adding an analysis output: fine (the symmetric case the original
        // check rejected).
        session.prev_analysis = Some(vec![false]);
        assert!(session
            .check_configuration_change(&[media_output(), analysis_output()])
            .is_ok());

        // Adding a media output: rejected.
        session.prev_analysis = Some(vec![false]);
        assert!(session
            .check_configuration_change(&[media_output(), media_output()])
            .is_err());

        // Removing a media output: rejected.
        session.prev_analysis = Some(vec![false, false]);
        assert!(session.check_configuration_change(&[media_output()]).is_err());
    }

    #[test]
    fn test_first_segment_accepts_any_configuration() {
        let session = Session::new(None).unwrap();
        assert!(session
            .check_configuration_change(&[media_output(), media_output(), analysis_output()])
            .is_ok());
    }

    #[test]
    fn test_missing_input_file_fails_segment() {
        let mut session = Session::new(None).unwrap();
        let err = session
            .transcode(&InputDesc::file("/does/not/exist.ts"), &[media_output()])
            .unwrap_err();
        assert!(matches!(err, TranscodeError::OpenInput(_)));
    }

    #[test]
    fn test_pushed_input_without_reset_fails() {
        let mut session = Session::new(None).unwrap();
        let err = session
            .transcode(&InputDesc::pushed(), &[media_output()])
            .unwrap_err();
        assert!(matches!(err, TranscodeError::MissingInput(_)));
    }

    #[test]
    fn test_analysis_session_requires_filter() {
        let opts = AnalysisOptions {
            filter_name: "no-such-analysis-filter".into(),
            model_path: "/m".into(),
            input_name: "in".into(),
            output_name: "out".into(),
            backend_configs: String::new(),
            metadata_key: "lavfi.confidence".into(),
        };
        let err = Session::new(Some(opts)).unwrap_err();
        assert!(matches!(err, TranscodeError::Filters(_)));
    }

    /// Write a short mpegts segment (25 gray frames of MPEG-2 video, plus an
    /// optional second of MP2 silence) that the round-trip tests feed back
    /// through a session.
    fn write_test_segment(path: &std::path::Path, with_audio: bool) {
        use crate::output::muxer::Muxer;

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG2VIDEO)
            .expect("mpeg2video encoder available");
        let mut settings = ffmpeg::codec::Context::new_with_codec(codec)
            .encoder()
            .video()
            .expect("video encoder settings");
        settings.set_width(64);
        settings.set_height(48);
        settings.set_format(ffmpeg::format::Pixel::YUV420P);
        settings.set_time_base(ffmpeg::Rational::new(1, 25));
        settings.set_frame_rate(Some(ffmpeg::Rational::new(25, 1)));
        settings.set_bit_rate(400_000);
        let mut enc = settings.open_as(codec).expect("open mpeg2video");

        let muxer_opts = crate::types::ComponentOpts::named("mpegts");
        let mut muxer = Muxer::open_file(&muxer_opts, path.to_str().unwrap()).unwrap();
        let index = muxer
            .add_video_encoder_stream(&enc, ffmpeg::Rational::new(25, 1))
            .unwrap();

        let mut audio = if with_audio {
            let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MP2)
                .expect("mp2 encoder available");
            let mut settings = ffmpeg::codec::Context::new_with_codec(codec)
                .encoder()
                .audio()
                .expect("audio encoder settings");
            settings.set_rate(44100);
            settings.set_format(ffmpeg::format::Sample::I16(
                ffmpeg::format::sample::Type::Packed,
            ));
            settings.set_channel_layout(ffmpeg::ChannelLayout::STEREO);
            settings.set_time_base(ffmpeg::Rational::new(1, 44100));
            settings.set_bit_rate(128_000);
            let enc = settings.open_as(codec).expect("open mp2");
            let (audio_index, _) = muxer.add_audio_encoder_stream(&enc).unwrap();
            Some((enc, audio_index))
        } else {
            None
        };

        muxer
            .write_header(&muxer_opts, &std::collections::BTreeMap::new())
            .unwrap();

        let video_tb = ffmpeg::Rational::new(1, 25);
        let mut drain = |enc: &mut ffmpeg::encoder::Video, muxer: &mut Muxer| {
            let mut pkt = ffmpeg::Packet::empty();
            while enc.receive_packet(&mut pkt).is_ok() {
                pkt.set_stream(index);
                pkt.rescale_ts(video_tb, muxer.stream_time_base(index));
                muxer.write_raw(&mut pkt).unwrap();
                pkt = ffmpeg::Packet::empty();
            }
        };
        for i in 0..25 {
            let mut frame = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::YUV420P, 64, 48);
            for plane in 0..3 {
                frame.data_mut(plane).fill(128);
            }
            frame.set_pts(Some(i));
            enc.send_frame(&frame).unwrap();
            drain(&mut enc, &mut muxer);
        }
        enc.send_eof().unwrap();
        drain(&mut enc, &mut muxer);

        if let Some((enc, audio_index)) = &mut audio {
            let audio_tb = ffmpeg::Rational::new(1, 44100);
            let frame_size = (enc.frame_size() as usize).max(1152);
            let mut drain = |enc: &mut ffmpeg::encoder::Audio, muxer: &mut Muxer| {
                let mut pkt = ffmpeg::Packet::empty();
                while enc.receive_packet(&mut pkt).is_ok() {
                    pkt.set_stream(*audio_index);
                    pkt.rescale_ts(audio_tb, muxer.stream_time_base(*audio_index));
                    muxer.write_raw(&mut pkt).unwrap();
                    pkt = ffmpeg::Packet::empty();
                }
            };
            let samples_total = 44100; // one second of silence
            let mut pts = 0i64;
            while pts < samples_total {
                let mut frame = ffmpeg::frame::Audio::new(
                    ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
                    frame_size,
                    ffmpeg::ChannelLayout::STEREO,
                );
                frame.set_rate(44100);
                frame.data_mut(0).fill(0);
                frame.set_pts(Some(pts));
                enc.send_frame(&frame).unwrap();
                drain(enc, &mut muxer);
                pts += frame_size as i64;
            }
            enc.send_eof().unwrap();
            drain(enc, &mut muxer);
        }

        muxer.write_trailer().unwrap();
    }

    #[test]
    fn test_copy_mode_segment_roundtrip() {
        ffmpeg::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let seg = dir.path().join("seg0.ts");
        write_test_segment(&seg, false);

        let mut session = Session::new(None).unwrap();
        let make_output = |name: &std::path::Path| OutputDesc {
            name: name.to_str().unwrap().into(),
            video: ComponentOpts::named("copy"),
            audio: ComponentOpts::named("drop"),
            ..OutputDesc::default()
        };

        let out0 = dir.path().join("out0.ts");
        let report = session
            .transcode(&InputDesc::file(seg.to_str().unwrap()), &[make_output(&out0)])
            .unwrap();
        // Pure stream copy: packets flow, nothing is decoded.
        assert!(report.decoded.video_packets >= 25);
        assert_eq!(report.decoded.frames, 0);
        assert!(report.outputs[0].video_packets >= 25);
        assert!(std::fs::metadata(&out0).unwrap().len() > 0);

        // Same configuration on the next segment reuses the session.
        let out1 = dir.path().join("out1.ts");
        let report = session
            .transcode(&InputDesc::file(seg.to_str().unwrap()), &[make_output(&out1)])
            .unwrap();
        assert!(report.outputs[0].video_packets >= 25);
        assert!(std::fs::metadata(&out1).unwrap().len() > 0);

        session.stop().unwrap();
    }

    #[test]
    fn test_reencode_with_framerate_gop_and_bitrate() {
        use crate::types::Fraction;

        ffmpeg::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let seg = dir.path().join("seg.ts");
        write_test_segment(&seg, true);

        // Full decode → filter → encode → mux path: framerate filter in
        // front of an MPEG-4 encoder with CBR pinning and a 400 ms GOP, plus
        // MP2 audio re-encoded to AAC through the normalisation chain.
        let mut session = Session::new(None).unwrap();
        let make_output = |name: &std::path::Path| OutputDesc {
            name: name.to_str().unwrap().into(),
            video: ComponentOpts::named("mpeg4"),
            audio: ComponentOpts::named("aac"),
            video_filters: Some("fps=25/1,scale=w=32:h=32".into()),
            fps: Some(Fraction::new(25, 1)),
            width: 32,
            height: 32,
            bitrate: Some(300_000),
            gop_time_ms: Some(400),
            ..OutputDesc::default()
        };

        let out0 = dir.path().join("enc0.ts");
        let report = session
            .transcode(&InputDesc::file(seg.to_str().unwrap()), &[make_output(&out0)])
            .unwrap();
        // Every input frame decodes (the decoder drain recovers its delay).
        assert!(report.decoded.frames >= 24);
        assert!(report.decoded.video_frames >= 24);
        assert!(report.decoded.audio_frames >= 20);
        // The 25 fps graph re-emits roughly one frame per input frame, each
        // encoded at the scaled geometry.
        let encoded = report.outputs[0].frames;
        assert!((20..=30).contains(&encoded), "encoded {} frames", encoded);
        assert_eq!(report.outputs[0].pixels, encoded * 32 * 32);
        assert!(std::fs::metadata(&out0).unwrap().len() > 0);

        // Second segment through the same session: the filter graph and its
        // monotonic PTS counter survive, the software encoders reopen, and
        // the per-segment GOP schedule restarts at the first output frame.
        let out1 = dir.path().join("enc1.ts");
        let report = session
            .transcode(&InputDesc::file(seg.to_str().unwrap()), &[make_output(&out1)])
            .unwrap();
        assert!(report.decoded.frames >= 24);
        let encoded = report.outputs[0].frames;
        assert!((20..=30).contains(&encoded), "encoded {} frames", encoded);
        assert_eq!(report.outputs[0].pixels, encoded * 32 * 32);
        assert!(std::fs::metadata(&out1).unwrap().len() > 0);

        session.stop().unwrap();
    }

    #[test]
    fn test_transmux_session_keeps_muxer_open() {
        ffmpeg::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let seg = dir.path().join("seg.ts");
        write_test_segment(&seg, false);

        let mut session = Session::new(None).unwrap();
        let mut input = InputDesc::file(seg.to_str().unwrap());
        input.transmuxing = true;
        let out = dir.path().join("joined.ts");
        let output = OutputDesc {
            name: out.to_str().unwrap().into(),
            ..OutputDesc::default()
        };

        let report = session.transcode(&input, &[output.clone()]).unwrap();
        assert!(report.outputs[0].video_packets >= 25);

        // The next segment jumps backwards in time; the discontinuity
        // rewriter re-bases it onto the first segment's timeline.
        session.discontinuity();
        let report = session.transcode(&input, &[output]).unwrap();
        assert!(report.outputs[0].video_packets >= 25);

        // Trailer only lands when the session stops.
        session.stop().unwrap();
        assert!(std::fs::metadata(&out).unwrap().len() > 0);
    }

    #[test]
    fn test_push_reset_clears_state() {
        let mut session = Session::new(None).unwrap();
        session.push_reset(true);
        let writer = session.byte_writer();
        writer.push_bytes(b"garbage");
        session.push_reset(false);
        // After reset the queue and buffer are empty and file IO is back.
        assert!(session.packet_reader().try_peek_packet().is_none());
        assert!(!session.use_pushed_io);
    }
}
