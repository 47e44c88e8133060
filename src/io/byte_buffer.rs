//! Thread-safe push-in byte adapter.
//!
//! Makes a pull-based demuxer consume from a push-based byte source fed by
//! another thread. The storage is a fixed circular buffer with a twist: bytes
//! are not discarded as soon as they are read. Already-read bytes stay in the
//! backing store (counted by `read_bytes`) so the demuxer can seek back a
//! short distance, and at least [`PROTECTED_BYTES`] of that history survives
//! any overwrite.
//!
//! # Thread safety
//! All operations take the internal lock. The reader side (the demuxer's read
//! callback) blocks while the buffer is empty and EOS has not been signalled;
//! the writer side blocks while no writable capacity remains.

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Circular buffer capacity.
pub const STREAM_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Already-read history that is never overwritten, so short seek-backs from
/// the demuxer always succeed.
pub const PROTECTED_BYTES: usize = 1024;

// Errno values baked into the demuxer-facing error mapping. Identical on
// every platform this library targets.
const ENOENT: c_int = 2;
const EIO: c_int = 5;

/// Error codes a producer can push into the buffer. The current demuxer read
/// converts them into the matching read-callback error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamErrorCode {
    /// Error without dedicated handling; surfaces as an I/O error.
    Other,
    /// The logical source does not exist; surfaces as ENOENT.
    NoEntry,
}

#[derive(Default)]
struct Inner {
    data: Vec<u8>,
    /// Absolute stream position of the first byte still in the backing store.
    index: i64,
    /// Bytes already delivered to the reader but retained for seek-back.
    read_bytes: usize,
    /// Bytes not yet delivered.
    unread_bytes: usize,
    eos: bool,
    error: Option<StreamErrorCode>,
}

impl Inner {
    fn writable(&self) -> usize {
        STREAM_BUFFER_BYTES - self.unread_bytes - PROTECTED_BYTES
    }

    /// Absolute position one past the last byte in the store.
    fn end(&self) -> i64 {
        self.index + (self.read_bytes + self.unread_bytes) as i64
    }

    fn seek_to(&mut self, pos: i64) -> i64 {
        let available = (self.read_bytes + self.unread_bytes) as i64;
        let delta = pos - self.index;
        if delta < 0 || delta > available {
            return -1;
        }
        self.read_bytes = delta as usize;
        self.unread_bytes = (available - delta) as usize;
        pos
    }
}

/// Thread-safe circular byte buffer with limited-seek history.
pub struct ByteBuffer {
    inner: Mutex<Inner>,
    /// Signalled when data is added or the EOS/error flags change.
    put: Condvar,
    /// Signalled when the reader consumes data or seeks.
    got: Condvar,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; STREAM_BUFFER_BYTES],
                ..Inner::default()
            }),
            put: Condvar::new(),
            got: Condvar::new(),
        }
    }

    /// Clear all content and flags. Only valid between segments, when no
    /// reader is blocked on the buffer.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.index = 0;
        inner.read_bytes = 0;
        inner.unread_bytes = 0;
        inner.eos = false;
        inner.error = None;
    }

    /// Append bytes, blocking while the buffer has no writable capacity.
    /// All of `bytes` is eventually written.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let mut inner = self.inner.lock();
            while inner.writable() == 0 {
                if inner.eos {
                    // Nobody will ever drain a buffer in a final state.
                    return;
                }
                self.got.wait(&mut inner);
            }
            let n = remaining.len().min(inner.writable());
            let end_offset = (inner.end() % STREAM_BUFFER_BYTES as i64) as usize;
            let trailing = STREAM_BUFFER_BYTES - end_offset;
            let first = n.min(trailing);
            inner.data[end_offset..end_offset + first].copy_from_slice(&remaining[..first]);
            let second = n - first;
            if second > 0 {
                inner.data[..second].copy_from_slice(&remaining[first..n]);
            }
            inner.unread_bytes += n;
            // Evict the oldest already-read bytes when total content exceeds
            // the capacity. The writable() guard above keeps the eviction from
            // ever touching the protected tail.
            let total = inner.read_bytes + inner.unread_bytes;
            if total > STREAM_BUFFER_BYTES {
                let excess = total - STREAM_BUFFER_BYTES;
                inner.index += excess as i64;
                inner.read_bytes -= excess;
            }
            drop(inner);
            self.put.notify_one();
            remaining = &remaining[n..];
        }
    }

    /// Signal that no more bytes are coming. Wakes a blocked reader.
    pub fn end_of_stream(&self) {
        let mut inner = self.inner.lock();
        inner.eos = true;
        drop(inner);
        self.put.notify_all();
        self.got.notify_all();
    }

    /// Signal a producer-side error. Also sets EOS so any waiting loop exits;
    /// the current demuxer read returns the mapped error.
    pub fn error(&self, code: StreamErrorCode) {
        let mut inner = self.inner.lock();
        inner.eos = true;
        inner.error = Some(code);
        drop(inner);
        self.put.notify_all();
        self.got.notify_all();
    }

    /// Blocking read used by the demuxer callback. Returns the number of
    /// bytes copied, or a negative codec-library error code.
    fn read_into(&self, buf: &mut [u8]) -> c_int {
        let mut inner = self.inner.lock();
        if let Some(code) = inner.error {
            return map_error(code);
        }
        while !inner.eos && inner.unread_bytes == 0 {
            self.put.wait(&mut inner);
        }
        if let Some(code) = inner.error {
            return map_error(code);
        }
        if inner.eos && inner.unread_bytes == 0 {
            return c_int::from(ffmpeg::Error::Eof);
        }
        let to_read = buf.len().min(inner.unread_bytes);
        let start = ((inner.index + inner.read_bytes as i64) % STREAM_BUFFER_BYTES as i64) as usize;
        let trailing = STREAM_BUFFER_BYTES - start;
        let first = to_read.min(trailing);
        buf[..first].copy_from_slice(&inner.data[start..start + first]);
        let second = to_read - first;
        if second > 0 {
            buf[first..to_read].copy_from_slice(&inner.data[..second]);
        }
        inner.read_bytes += to_read;
        inner.unread_bytes -= to_read;
        drop(inner);
        self.got.notify_one();
        to_read as c_int
    }

    /// Seek within the retained window `[index, index + read + unread]`.
    /// End-relative seeks and size queries are only answerable once EOS has
    /// been signalled.
    fn seek(&self, pos: i64, whence: c_int) -> i64 {
        // The demuxer ORs AVSEEK_FORCE into whence; strip it.
        let whence = whence & !(ffmpeg::ffi::AVSEEK_FORCE as c_int);
        let mut inner = self.inner.lock();
        if let Some(code) = inner.error {
            return map_error(code) as i64;
        }
        let ret = if whence & ffmpeg::ffi::AVSEEK_SIZE as c_int != 0 {
            if inner.eos {
                inner.end()
            } else {
                // cannot know the total until the producer finishes
                -1
            }
        } else {
            match whence {
                SEEK_SET => inner.seek_to(pos),
                SEEK_CUR => {
                    let target = inner.index + inner.read_bytes as i64 + pos;
                    inner.seek_to(target)
                }
                SEEK_END => {
                    if inner.eos {
                        let target = inner.end() + pos;
                        inner.seek_to(target)
                    } else {
                        -1
                    }
                }
                _ => -1,
            }
        };
        drop(inner);
        self.got.notify_one();
        ret
    }

    /// Bytes currently pending delivery. Test/diagnostic accessor.
    #[cfg(test)]
    fn unread(&self) -> usize {
        self.inner.lock().unread_bytes
    }
}

const SEEK_SET: c_int = 0;
const SEEK_CUR: c_int = 1;
const SEEK_END: c_int = 2;

fn map_error(code: StreamErrorCode) -> c_int {
    match code {
        StreamErrorCode::NoEntry => c_int::from(ffmpeg::Error::Other { errno: ENOENT }),
        StreamErrorCode::Other => c_int::from(ffmpeg::Error::Other { errno: EIO }),
    }
}

// ── Demuxer glue ─────────────────────────────────────────────────────────────

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    if buf_size <= 0 {
        return 0;
    }
    let buffer = &*(opaque as *const ByteBuffer);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    buffer.read_into(slice)
}

unsafe extern "C" fn seek_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let buffer = &*(opaque as *const ByteBuffer);
    buffer.seek(offset, whence)
}

const AVIO_BUFFER_SIZE: usize = 4096;

/// Allocate an AVIO context that reads from `buffer`.
///
/// The caller must keep its `Arc<ByteBuffer>` alive for as long as the
/// returned context is attached to a demuxer, and free the context with
/// [`free_avio`] after the demuxer is closed (custom-IO contexts are not
/// freed by the demuxer itself).
pub(crate) fn avio_for_buffer(buffer: &Arc<ByteBuffer>) -> Option<*mut ffmpeg::ffi::AVIOContext> {
    // SAFETY: the io buffer is handed to the AVIO context which owns it until
    // free_avio. The opaque pointer stays valid because the caller holds the
    // Arc for the context's whole lifetime.
    unsafe {
        let io_buffer = ffmpeg::ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
        if io_buffer.is_null() {
            return None;
        }
        let ctx = ffmpeg::ffi::avio_alloc_context(
            io_buffer,
            AVIO_BUFFER_SIZE as c_int,
            0, // read-only
            Arc::as_ptr(buffer) as *mut c_void,
            Some(read_packet),
            None,
            Some(seek_packet),
        );
        if ctx.is_null() {
            ffmpeg::ffi::av_free(io_buffer as *mut c_void);
            return None;
        }
        Some(ctx)
    }
}

/// Free an AVIO context created by [`avio_for_buffer`] or the packet-queue
/// equivalent, including its internal buffer. Only call after the owning
/// format context has been closed with the custom-IO flag set.
pub(crate) unsafe fn free_avio(mut ctx: *mut ffmpeg::ffi::AVIOContext) {
    if ctx.is_null() {
        return;
    }
    // The internal buffer may have been reallocated by the io layer; free
    // whatever is current, then the context itself.
    ffmpeg::ffi::av_freep(&mut (*ctx).buffer as *mut _ as *mut c_void);
    ffmpeg::ffi::avio_context_free(&mut ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_then_read() {
        let buf = ByteBuffer::new();
        buf.push_bytes(b"hello world");
        let mut out = [0u8; 5];
        assert_eq!(buf.read_into(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.unread(), 6);
    }

    #[test]
    fn test_eof_after_drain() {
        let buf = ByteBuffer::new();
        buf.push_bytes(b"abc");
        buf.end_of_stream();
        let mut out = [0u8; 8];
        assert_eq!(buf.read_into(&mut out), 3);
        assert_eq!(buf.read_into(&mut out), c_int::from(ffmpeg::Error::Eof));
    }

    #[test]
    fn test_error_propagates_to_reader() {
        let buf = ByteBuffer::new();
        buf.error(StreamErrorCode::NoEntry);
        let mut out = [0u8; 8];
        assert_eq!(
            buf.read_into(&mut out),
            c_int::from(ffmpeg::Error::Other { errno: ENOENT })
        );
    }

    #[test]
    fn test_seek_back_within_history() {
        let buf = ByteBuffer::new();
        buf.push_bytes(b"0123456789");
        let mut out = [0u8; 10];
        assert_eq!(buf.read_into(&mut out), 10);
        // absolute seek back to position 4
        assert_eq!(buf.seek(4, SEEK_SET), 4);
        let mut out = [0u8; 6];
        assert_eq!(buf.read_into(&mut out), 6);
        assert_eq!(&out, b"456789");
    }

    #[test]
    fn test_seek_outside_window_rejected() {
        let buf = ByteBuffer::new();
        buf.push_bytes(b"0123456789");
        assert_eq!(buf.seek(11, SEEK_SET), -1);
        assert_eq!(buf.seek(-1, SEEK_SET), -1);
    }

    #[test]
    fn test_size_query_requires_eos() {
        let buf = ByteBuffer::new();
        buf.push_bytes(b"0123456789");
        let size_whence = ffmpeg::ffi::AVSEEK_SIZE as c_int;
        assert_eq!(buf.seek(0, size_whence), -1);
        buf.end_of_stream();
        assert_eq!(buf.seek(0, size_whence), 10);
    }

    #[test]
    fn test_end_relative_seek_requires_eos() {
        let buf = ByteBuffer::new();
        buf.push_bytes(b"0123456789");
        assert_eq!(buf.seek(-4, SEEK_END), -1);
        buf.end_of_stream();
        assert_eq!(buf.seek(-4, SEEK_END), 6);
        let mut out = [0u8; 4];
        assert_eq!(buf.read_into(&mut out), 4);
        assert_eq!(&out, b"6789");
    }

    #[test]
    fn test_wrap_around_write() {
        let buf = ByteBuffer::new();
        // Fill close to capacity, drain it, then write across the wrap point.
        let chunk = vec![0xAAu8; STREAM_BUFFER_BYTES - PROTECTED_BYTES];
        buf.push_bytes(&chunk);
        let mut sink = vec![0u8; chunk.len()];
        assert_eq!(buf.read_into(&mut sink), chunk.len() as c_int);
        // Now the write position is near the end of the backing store; this
        // write must wrap and evict old history beyond the protected tail.
        let pattern: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        buf.push_bytes(&pattern);
        let mut out = vec![0u8; pattern.len()];
        assert_eq!(buf.read_into(&mut out), pattern.len() as c_int);
        assert_eq!(out, pattern);
    }

    #[test]
    fn test_protected_history_survives_eviction() {
        let buf = ByteBuffer::new();
        let first = vec![1u8; STREAM_BUFFER_BYTES - PROTECTED_BYTES];
        buf.push_bytes(&first);
        let mut sink = vec![0u8; first.len()];
        assert_eq!(buf.read_into(&mut sink), first.len() as c_int);
        // Write enough to force eviction of read history.
        let second = vec![2u8; STREAM_BUFFER_BYTES - PROTECTED_BYTES];
        buf.push_bytes(&second);
        // The last PROTECTED_BYTES of already-read data must still be
        // seekable: current read position is first.len(), so seek back by
        // PROTECTED_BYTES must succeed.
        let pos = first.len() as i64 - PROTECTED_BYTES as i64;
        assert_eq!(buf.seek(pos, SEEK_SET), pos);
    }

    #[test]
    fn test_threaded_larger_than_capacity_stream() {
        // Invariant: every pushed byte is delivered in order, even when the
        // total exceeds the circular capacity and the writer must block.
        let buf = Arc::new(ByteBuffer::new());
        let total: usize = 3 * STREAM_BUFFER_BYTES;
        let producer = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                let chunk: Vec<u8> = (0..65536u32).map(|i| (i % 199) as u8).collect();
                let mut sent = 0;
                while sent < total {
                    let n = chunk.len().min(total - sent);
                    buf.push_bytes(&chunk[..n]);
                    sent += n;
                }
                buf.end_of_stream();
            })
        };
        let mut received = 0usize;
        let mut out = vec![0u8; 4096];
        loop {
            let ret = buf.read_into(&mut out);
            if ret == c_int::from(ffmpeg::Error::Eof) {
                break;
            }
            assert!(ret > 0);
            for (i, b) in out[..ret as usize].iter().enumerate() {
                let absolute = received + i;
                assert_eq!(*b, ((absolute % 65536) % 199) as u8);
            }
            received += ret as usize;
        }
        assert_eq!(received, total);
        producer.join().unwrap();
    }
}
