//! Hardware device contexts and decoder pixel-format negotiation.
//!
//! The codec library drives pixel-format selection through a callback on the
//! decoder context. The callback needs to know which device kind the session
//! configured; that key travels in the codec context's user-data slot as a
//! pointer to a [`PixfmtNegotiation`] owned by the input pipeline, so there is
//! no back reference from the decoder into the pipeline itself.

use std::ffi::{c_void, CString};
use std::ptr;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::error::{Result, TranscodeError};
use crate::types::HwDeviceKind;

/// An owned hardware device context, retained by the session across segments
/// and released only on stop.
pub(crate) struct HwDevice {
    kind: HwDeviceKind,
    device_id: Option<String>,
    ctx: *mut ffi::AVBufferRef,
}

impl HwDevice {
    /// Create a device context for (kind, device id).
    pub fn create(kind: HwDeviceKind, device_id: Option<&str>) -> Result<Self> {
        let c_device = device_id
            .map(|d| CString::new(d).map_err(|_| TranscodeError::OpenDecoder(
                format!("device id contains NUL: {:?}", d),
            )))
            .transpose()?;
        let mut ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        // SAFETY: out-pointer call; on success ctx holds one owned reference
        // that Drop releases.
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut ctx,
                kind.to_av_type(),
                c_device.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || ctx.is_null() {
            tracing::error!(?kind, device = ?device_id, ret, "unable to open hardware device context");
            return Err(TranscodeError::OpenDecoder(format!(
                "hardware device context for {:?} failed: {}",
                kind,
                ffmpeg::Error::from(ret)
            )));
        }
        tracing::info!(?kind, device = ?device_id, "hardware device context created");
        Ok(Self {
            kind,
            device_id: device_id.map(str::to_owned),
            ctx,
        })
    }

    /// True when this context was created for the same (kind, device id) key.
    pub fn matches(&self, kind: HwDeviceKind, device_id: Option<&str>) -> bool {
        self.kind == kind && self.device_id.as_deref() == device_id
    }

    /// Take a new owned reference for attachment to a codec context.
    pub fn new_ref(&self) -> *mut ffi::AVBufferRef {
        // SAFETY: ctx is a live buffer ref owned by self.
        unsafe { ffi::av_buffer_ref(self.ctx) }
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        // SAFETY: releases the single reference created in HwDevice::create.
        unsafe { ffi::av_buffer_unref(&mut self.ctx) }
    }
}

/// Negotiation key passed through the codec context's `opaque` slot.
pub(crate) struct PixfmtNegotiation {
    pub hw_type: ffi::AVHWDeviceType,
}

/// The hardware pixel format the opened decoder's codec advertises for the
/// configured device kind, or NONE when the codec cannot decode on it.
pub(crate) unsafe fn hw_pixfmt_for(
    ctx: *const ffi::AVCodecContext,
    hw_type: ffi::AVHWDeviceType,
) -> ffi::AVPixelFormat {
    let codec = (*ctx).codec;
    if codec.is_null() {
        return ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    }
    let mut i = 0;
    loop {
        let config = ffi::avcodec_get_hw_config(codec, i);
        if config.is_null() {
            tracing::warn!("decoder does not support hardware decoding on the configured device");
            return ffi::AVPixelFormat::AV_PIX_FMT_NONE;
        }
        if (*config).methods & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32 != 0
            && (*config).device_type == hw_type
        {
            return (*config).pix_fmt;
        }
        i += 1;
    }
}

/// Pixel-format negotiation callback installed on hardware decoder contexts.
///
/// Allocates the hardware frame pool eagerly: the device context does not
/// initialise it in time for filter construction, so it is done here, sized
/// from the decoder's probed geometry.
unsafe extern "C" fn negotiate_pixel_format(
    vc: *mut ffi::AVCodecContext,
    _pix_fmts: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let neg = (*vc).opaque as *const PixfmtNegotiation;
    if neg.is_null() {
        return ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    }
    let hw_type = (*neg).hw_type;

    ffi::av_buffer_unref(&mut (*vc).hw_frames_ctx);
    (*vc).hw_frames_ctx = ffi::av_hwframe_ctx_alloc((*vc).hw_device_ctx);
    if (*vc).hw_frames_ctx.is_null() {
        tracing::error!("unable to allocate hardware frame pool for decoding");
        return ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    }

    let frames = (*(*vc).hw_frames_ctx).data as *mut ffi::AVHWFramesContext;
    (*frames).format = hw_pixfmt_for(vc, hw_type);
    (*frames).sw_format = (*vc).sw_pix_fmt;
    (*frames).width = (*vc).width;
    (*frames).height = (*vc).height;

    let ret = ffi::av_hwframe_ctx_init((*vc).hw_frames_ctx);
    if ret < 0 {
        tracing::error!(ret, "unable to initialise hardware frame pool");
        return ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    }

    (*frames).format
}

/// Wire a decoder context for hardware decoding: device reference, user-data
/// key, and the negotiation callback. Must run before the decoder is opened.
pub(crate) unsafe fn attach_hw_decoder(
    ctx: *mut ffi::AVCodecContext,
    device: &HwDevice,
    negotiation: *const PixfmtNegotiation,
) {
    (*ctx).hw_device_ctx = device.new_ref();
    (*ctx).opaque = negotiation as *mut c_void;
    (*ctx).get_format = Some(negotiate_pixel_format);
}

/// Name of the dedicated hardware decoder for a codec on a device kind, when
/// one exists.
pub(crate) fn hw_decoder_name(
    codec: ffmpeg::codec::Id,
    kind: HwDeviceKind,
) -> Option<&'static str> {
    match (codec, kind) {
        (ffmpeg::codec::Id::H264, HwDeviceKind::Cuda) => Some("h264_cuvid"),
        (ffmpeg::codec::Id::H264, HwDeviceKind::MediaCodec) => Some("h264_mediacodec"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_decoder_names() {
        assert_eq!(
            hw_decoder_name(ffmpeg::codec::Id::H264, HwDeviceKind::Cuda),
            Some("h264_cuvid")
        );
        assert_eq!(
            hw_decoder_name(ffmpeg::codec::Id::H264, HwDeviceKind::MediaCodec),
            Some("h264_mediacodec")
        );
        assert_eq!(hw_decoder_name(ffmpeg::codec::Id::HEVC, HwDeviceKind::Cuda), None);
        assert_eq!(hw_decoder_name(ffmpeg::codec::Id::H264, HwDeviceKind::None), None);
    }
}
