//! Muxer construction, stream composition, and teardown.
//!
//! Outputs write either to a real file or into the session's packet queue
//! through a custom IO context. In the queue case the AVIO context is owned
//! here, not by the codec library: the format context is dropped with its
//! `pb` detached first, then the context and its buffer are freed manually.

use std::ffi::{c_int, c_void, CString};
use std::ops::Deref;
use std::ptr;
use std::rc::Rc;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::error::{Result, TranscodeError};
use crate::io::byte_buffer::free_avio;
use crate::io::packet_queue::avio_for_write_state;
use crate::io::WriteState;
use crate::types::ComponentOpts;

enum MuxerIo {
    /// File IO opened with the format layer; closed on teardown.
    File,
    /// The format layer does its own IO (NOFILE formats).
    None,
    /// Custom IO into the packet queue; freed manually on teardown.
    Queue(*mut ffi::AVIOContext),
}

pub(crate) struct Muxer {
    output: Option<ffmpeg::format::context::Output>,
    io: MuxerIo,
    header_written: bool,
    trailer_written: bool,
}

impl Muxer {
    /// Allocate a muxer writing to `path` with the named container format.
    pub fn open_file(muxer: &ComponentOpts, path: &str) -> Result<Self> {
        let oc = alloc_output_context(&muxer.name, Some(path))?;
        // SAFETY: freshly allocated context; avio_open attaches file IO
        // unless the format does its own.
        let io = unsafe {
            if (*(*oc).oformat).flags & ffi::AVFMT_NOFILE as c_int != 0 {
                MuxerIo::None
            } else {
                let c_path = CString::new(path).map_err(|_| {
                    TranscodeError::OpenMuxer(format!("output path contains NUL: {:?}", path))
                })?;
                let ret =
                    ffi::avio_open(&mut (*oc).pb, c_path.as_ptr(), ffi::AVIO_FLAG_WRITE as c_int);
                if ret < 0 {
                    ffi::avformat_free_context(oc);
                    let err = ffmpeg::Error::from(ret);
                    tracing::error!(path, %err, "error opening output file");
                    return Err(TranscodeError::OpenMuxer(format!("{}: {}", path, err)));
                }
                MuxerIo::File
            }
        };
        Ok(Self {
            // SAFETY: oc is a valid output context we own.
            output: Some(unsafe { ffmpeg::format::context::Output::wrap(oc) }),
            io,
            header_written: false,
            trailer_written: false,
        })
    }

    /// Allocate a muxer writing into the packet queue through `write_state`.
    /// The caller owns the write state (boxed, stable address) and must keep
    /// it alive for this muxer's lifetime.
    pub fn open_queue(
        muxer: &ComponentOpts,
        name: &str,
        write_state: *mut WriteState,
    ) -> Result<Self> {
        let oc = alloc_output_context(&muxer.name, Some(name))?;
        let avio = match avio_for_write_state(write_state) {
            Some(avio) => avio,
            None => {
                // SAFETY: context not yet wrapped; free it directly.
                unsafe { ffi::avformat_free_context(oc) };
                return Err(TranscodeError::OpenMuxer(
                    "unable to allocate io context for queue output".into(),
                ));
            }
        };
        // SAFETY: attach the custom IO and force per-packet flushing so every
        // muxed packet reaches the staging area immediately.
        unsafe {
            (*oc).pb = avio;
            (*oc).flags |=
                ffi::AVFMT_FLAG_CUSTOM_IO as c_int | ffi::AVFMT_FLAG_FLUSH_PACKETS as c_int;
        }
        Ok(Self {
            // SAFETY: oc is a valid output context we own.
            output: Some(unsafe { ffmpeg::format::context::Output::wrap(oc) }),
            io: MuxerIo::Queue(avio),
            header_written: false,
            trailer_written: false,
        })
    }

    /// Whether encoders feeding this muxer must emit global headers.
    pub fn requires_global_header(&self) -> bool {
        let output = self.output.as_ref().expect("muxer context alive");
        // SAFETY: field read on a live context.
        unsafe { (*(*output.as_ptr()).oformat).flags & ffi::AVFMT_GLOBALHEADER as c_int != 0 }
    }

    /// Force packet-level flushing; used by transmuxing outputs that live
    /// across segments.
    pub fn set_flush_packets(&mut self) {
        let output = self.output.as_mut().expect("muxer context alive");
        // SAFETY: field writes on a live context.
        unsafe {
            (*output.as_mut_ptr()).flags |= ffi::AVFMT_FLAG_FLUSH_PACKETS as c_int;
            (*output.as_mut_ptr()).flush_packets = 1;
        }
    }

    /// Add a stream copying codec parameters from an input stream. The codec
    /// tag is reset so the target container re-derives it, and container
    /// timing hints are transferred from the demuxer when available.
    pub fn add_copy_stream(
        &mut self,
        params: &ffmpeg::codec::Parameters,
        time_base: ffmpeg::Rational,
        avg_frame_rate: ffmpeg::Rational,
        input_stream: Option<*mut ffi::AVStream>,
    ) -> Result<usize> {
        let output = self.output.as_mut().expect("muxer context alive");
        // SAFETY: plain field read, taken before the stream borrow below.
        let oformat = unsafe { (*output.as_ptr()).oformat };
        let mut ost = output
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .map_err(|e| stream_err("unable to add copy stream", e))?;
        ost.set_parameters(params.clone());
        ost.set_time_base(time_base);
        let index = ost.index();
        // SAFETY: codecpar is set by set_parameters; the tag reset lets the
        // muxer pick a container-correct tag.
        unsafe {
            let st = ost.as_mut_ptr();
            (*(*st).codecpar).codec_tag = 0;
            (*st).avg_frame_rate = avg_frame_rate.into();
            if let Some(ist) = input_stream {
                ffi::avformat_transfer_internal_stream_timing_info(
                    oformat,
                    st,
                    ist,
                    ffi::AVTimebaseSource::AVFMT_TBCF_DEMUXER,
                );
            }
        }
        Ok(index)
    }

    /// Add a stream taking parameters from an opened video encoder.
    pub fn add_video_encoder_stream(
        &mut self,
        encoder: &ffmpeg::encoder::Video,
        avg_frame_rate: ffmpeg::Rational,
    ) -> Result<usize> {
        let time_base = context_time_base(encoder.deref());
        let params = codec_parameters_of(encoder.deref());
        let output = self.output.as_mut().expect("muxer context alive");
        let mut ost = output
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .map_err(|e| stream_err("unable to add video stream", e))?;
        ost.set_parameters(params);
        ost.set_time_base(time_base);
        let index = ost.index();
        // SAFETY: plain field write on the new stream.
        unsafe {
            (*ost.as_mut_ptr()).avg_frame_rate = avg_frame_rate.into();
        }
        Ok(index)
    }

    /// Add a stream taking parameters from an opened audio encoder. Returns
    /// (stream index, initial padding) — non-zero padding means the first
    /// encoded packets are preroll the mux step must drop.
    pub fn add_audio_encoder_stream(
        &mut self,
        encoder: &ffmpeg::encoder::Audio,
    ) -> Result<(usize, i32)> {
        let time_base = context_time_base(encoder.deref());
        let params = codec_parameters_of(encoder.deref());
        let output = self.output.as_mut().expect("muxer context alive");
        let mut ost = output
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .map_err(|e| stream_err("unable to add audio stream", e))?;
        ost.set_parameters(params);
        ost.set_time_base(time_base);
        let index = ost.index();
        // SAFETY: field read; set_parameters populated codecpar above.
        let padding = unsafe { (*(*ost.as_mut_ptr()).codecpar).initial_padding };
        Ok((index, padding))
    }

    pub fn stream_time_base(&self, index: usize) -> ffmpeg::Rational {
        let output = self.output.as_ref().expect("muxer context alive");
        output
            .stream(index)
            .map(|s| s.time_base())
            .unwrap_or(ffmpeg::Rational::new(1, 90000))
    }

    pub fn write_header(
        &mut self,
        opts: &ComponentOpts,
        metadata: &std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        let output = self.output.as_mut().expect("muxer context alive");
        if !metadata.is_empty() {
            let mut dict = ffmpeg::Dictionary::new();
            for (k, v) in metadata {
                dict.set(k, v);
            }
            output.set_metadata(dict);
        }
        output.write_header_with(opts.to_dictionary()).map_err(|e| {
            tracing::error!(%e, "error writing header");
            TranscodeError::WriteHeader(format!("{}", e))
        })?;
        self.header_written = true;
        Ok(())
    }

    /// Rescale and write one packet interleaved. The packet's stream index
    /// must already be set. Returns the rescaled presentation timestamp.
    pub fn write_interleaved(
        &mut self,
        pkt: &mut ffmpeg::Packet,
        from_time_base: ffmpeg::Rational,
    ) -> Result<i64> {
        let to = self.stream_time_base(pkt.stream());
        if from_time_base != to {
            pkt.rescale_ts(from_time_base, to);
        }
        let ts = pkt.pts().or(pkt.dts()).unwrap_or(-1);
        self.write_raw(pkt)?;
        Ok(ts)
    }

    /// Write one packet interleaved without rescaling.
    pub fn write_raw(&mut self, pkt: &mut ffmpeg::Packet) -> Result<()> {
        let output = self.output.as_mut().expect("muxer context alive");
        pkt.write_interleaved(output).map_err(|e| {
            tracing::error!(%e, "error writing packet");
            TranscodeError::Mux(format!("{}", e))
        })
    }

    /// Drain the interleaving queue (null-packet flush).
    pub fn flush_packets(&mut self) {
        let output = self.output.as_mut().expect("muxer context alive");
        // SAFETY: null packet flush is the documented muxer drain.
        unsafe {
            ffi::av_interleaved_write_frame(output.as_mut_ptr(), ptr::null_mut());
        }
    }

    pub fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written || self.trailer_written {
            return Ok(());
        }
        let output = self.output.as_mut().expect("muxer context alive");
        output.write_trailer().map_err(|e| {
            tracing::error!(%e, "error writing trailer");
            TranscodeError::WriteTrailer(format!("{}", e))
        })?;
        self.trailer_written = true;
        Ok(())
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        let Some(mut output) = self.output.take() else {
            return;
        };
        // SAFETY: teardown discipline — close or detach pb before the format
        // context is freed, so nothing frees it twice.
        unsafe {
            let oc = output.as_mut_ptr();
            match &self.io {
                MuxerIo::File => {
                    ffi::avio_closep(&mut (*oc).pb);
                }
                MuxerIo::None => {}
                MuxerIo::Queue(avio) => {
                    let avio = *avio;
                    (*oc).pb = ptr::null_mut();
                    drop(output);
                    free_avio(avio);
                    return;
                }
            }
            (*oc).pb = ptr::null_mut();
        }
        drop(output);
    }
}

fn alloc_output_context(
    format_name: &str,
    path: Option<&str>,
) -> Result<*mut ffi::AVFormatContext> {
    let c_format = CString::new(format_name).map_err(|_| {
        TranscodeError::OpenMuxer(format!("muxer name contains NUL: {:?}", format_name))
    })?;
    let c_path = path
        .map(|p| {
            CString::new(p)
                .map_err(|_| TranscodeError::OpenMuxer(format!("path contains NUL: {:?}", p)))
        })
        .transpose()?;
    let mut oc: *mut ffi::AVFormatContext = ptr::null_mut();
    // SAFETY: out-pointer allocation; the name guesses the muxer, falling
    // back to the file name.
    let ret = unsafe {
        ffi::avformat_alloc_output_context2(
            &mut oc,
            ptr::null(),
            if format_name.is_empty() {
                ptr::null()
            } else {
                c_format.as_ptr()
            },
            c_path.as_ref().map_or(ptr::null(), |p| p.as_ptr()),
        )
    };
    if ret < 0 || oc.is_null() {
        let err = ffmpeg::Error::from(ret);
        tracing::error!(format_name, %err, "unable to allocate output context");
        return Err(TranscodeError::OpenMuxer(format!(
            "format {:?}: {}",
            format_name, err
        )));
    }
    Ok(oc)
}

/// Copy an (en/de)coder context's parameters into a standalone set, for
/// muxer stream setup.
fn codec_parameters_of(ctx: &ffmpeg::codec::Context) -> ffmpeg::codec::Parameters {
    // SAFETY: allocation plus a field copy from a live, opened context.
    unsafe {
        let params = ffi::avcodec_parameters_alloc();
        ffi::avcodec_parameters_from_context(params, ctx.as_ptr());
        ffmpeg::codec::Parameters::wrap(params, None::<Rc<dyn std::any::Any>>)
    }
}

/// The timebase the (en/de)coder context settled on after opening.
pub(crate) fn context_time_base(ctx: &ffmpeg::codec::Context) -> ffmpeg::Rational {
    // SAFETY: plain field read on a live context.
    unsafe { ffmpeg::Rational::from((*ctx.as_ptr()).time_base) }
}

fn stream_err(msg: &str, e: ffmpeg::Error) -> TranscodeError {
    tracing::error!(%e, "{}", msg);
    TranscodeError::OpenMuxer(format!("{}: {}", msg, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_muxer_writes_header_and_trailer() {
        ffmpeg::init().expect("ffmpeg init");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ts");
        let muxer_opts = ComponentOpts::named("mpegts");
        let mut muxer = Muxer::open_file(&muxer_opts, path.to_str().unwrap()).unwrap();

        // One raw video stream is enough for the container round trip.
        let params = ffmpeg::codec::Parameters::new();
        // SAFETY: test-only field setup on freshly allocated parameters.
        unsafe {
            let p = params.as_ptr() as *mut ffi::AVCodecParameters;
            (*p).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*p).codec_id = ffi::AVCodecID::AV_CODEC_ID_MPEG2VIDEO;
            (*p).width = 64;
            (*p).height = 48;
        }
        let index = muxer
            .add_copy_stream(
                &params,
                ffmpeg::Rational::new(1, 90000),
                ffmpeg::Rational::new(25, 1),
                None,
            )
            .unwrap();
        assert_eq!(index, 0);

        muxer
            .write_header(&muxer_opts, &std::collections::BTreeMap::new())
            .unwrap();
        assert!(muxer.header_written());
        muxer.write_trailer().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        ffmpeg::init().expect("ffmpeg init");
        let muxer_opts = ComponentOpts::named("definitely-not-a-container");
        let err = Muxer::open_file(&muxer_opts, "/tmp/never-created").unwrap_err();
        assert!(matches!(err, TranscodeError::OpenMuxer(_)));
    }
}
