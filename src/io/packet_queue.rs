//! Thread-safe push-out packet adapter.
//!
//! The dual of the byte buffer: a muxer's write callback produces bytes in
//! unknown-size chunks, and the consumer wants packets tagged with a
//! per-output index and begin/middle/end flags.
//!
//! Flags cannot be assigned inside the write callback — the producer does not
//! know whether the chunk it is writing is the last one of a header, a data
//! packet, or a trailer. Chunks are therefore collected in a per-output
//! staging area and moved into the shared queue as a group once the producer
//! finishes the muxing call, with the group's flags applied then:
//! `END_OF_OUTPUT` lands only on the last packet of the group.

use std::collections::VecDeque;
use std::ffi::{c_int, c_void};
use std::sync::Arc;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Position labels for a packet within one output's logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Emitted before the first data packet: container headers. Timestamp −1.
    pub const BEGIN_OF_OUTPUT: PacketFlags = PacketFlags(0x1);
    /// Data packet with a valid timestamp.
    pub const PACKET_OUTPUT: PacketFlags = PacketFlags(0x2);
    /// End of the current output's stream for this segment (trailer bytes).
    pub const END_OF_OUTPUT: PacketFlags = PacketFlags(0x4);
    /// Very last record of the session; no data beyond.
    pub const END_OF_ALL_OUTPUTS: PacketFlags = PacketFlags(0x8);

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for PacketFlags {
    type Output = PacketFlags;
    fn bitand(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 & rhs.0)
    }
}

impl std::ops::Not for PacketFlags {
    type Output = PacketFlags;
    fn not(self) -> PacketFlags {
        PacketFlags(!self.0)
    }
}

/// One muxed chunk, binary-transparent, with its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPacket {
    /// Exactly the bytes the muxer emitted.
    pub data: Bytes,
    /// Index of the output that produced this packet.
    pub index: usize,
    pub flags: PacketFlags,
    /// Presentation timestamp of the muxed packet; −1 for header/trailer
    /// chunks and the end marker.
    pub timestamp: i64,
}

/// Thread-safe FIFO of muxed packets.
pub struct PacketQueue {
    inner: Mutex<VecDeque<OutputPacket>>,
    cond: Condvar,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Drop all queued packets. Only valid between segments.
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    /// Block until a packet is available and return a copy of the front
    /// without removing it. The payload is reference-counted, so the copy is
    /// cheap.
    pub fn peek_front(&self) -> OutputPacket {
        let mut inner = self.inner.lock();
        while inner.is_empty() {
            self.cond.wait(&mut inner);
        }
        inner.front().cloned().expect("queue non-empty after wait")
    }

    /// Block until a packet is available, remove it, and return it.
    pub fn pop_front(&self) -> OutputPacket {
        let mut inner = self.inner.lock();
        while inner.is_empty() {
            self.cond.wait(&mut inner);
        }
        inner.pop_front().expect("queue non-empty after wait")
    }

    /// Non-blocking look at the front.
    pub fn try_peek_front(&self) -> Option<OutputPacket> {
        self.inner.lock().front().cloned()
    }

    fn push_group(&self, group: Vec<OutputPacket>) {
        if group.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.extend(group);
        drop(inner);
        self.cond.notify_all();
    }

    /// Append the end-of-session marker: empty payload, timestamp −1.
    pub fn push_end(&self) {
        let mut inner = self.inner.lock();
        inner.push_back(OutputPacket {
            data: Bytes::new(),
            index: 0,
            flags: PacketFlags::END_OF_ALL_OUTPUTS,
            timestamp: -1,
        });
        drop(inner);
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Per-output producer state: the muxer's write callback stages chunks here,
/// and the pipeline moves them into the shared queue once a muxing call
/// completes.
///
/// Not thread-safe by design — a write state belongs to exactly one output
/// pipeline and is only touched from the transcode thread (the muxer invokes
/// the write callback re-entrantly from within the same call stack).
pub struct WriteState {
    queue: Arc<PacketQueue>,
    index: usize,
    staging: Vec<Bytes>,
}

impl WriteState {
    pub fn new(queue: Arc<PacketQueue>, index: usize) -> Self {
        Self {
            queue,
            index,
            staging: Vec::new(),
        }
    }

    fn stage(&mut self, chunk: &[u8]) {
        self.staging.push(Bytes::copy_from_slice(chunk));
    }

    /// Move the staged chunks into the queue as one group. `flags` is applied
    /// verbatim to the last packet only; earlier packets get
    /// `flags & !END_OF_OUTPUT`, because only the producer's final chunk can
    /// end the output.
    pub fn push_staging(&mut self, flags: PacketFlags, timestamp: i64) {
        if self.staging.is_empty() {
            return;
        }
        let safe_flags = flags & !PacketFlags::END_OF_OUTPUT;
        let last = self.staging.len() - 1;
        let group: Vec<OutputPacket> = self
            .staging
            .drain(..)
            .enumerate()
            .map(|(i, data)| OutputPacket {
                data,
                index: self.index,
                flags: if i == last { flags } else { safe_flags },
                timestamp,
            })
            .collect();
        self.queue.push_group(group);
    }

    /// Discard staged chunks without publishing them (error paths).
    pub fn clear_staging(&mut self) {
        self.staging.clear();
    }

    pub fn has_staged(&self) -> bool {
        !self.staging.is_empty()
    }
}

// ── Muxer glue ───────────────────────────────────────────────────────────────

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    if buf_size <= 0 {
        return 0;
    }
    let state = &mut *(opaque as *mut WriteState);
    let slice = std::slice::from_raw_parts(buf, buf_size as usize);
    state.stage(slice);
    buf_size
}

const AVIO_BUFFER_SIZE: usize = 4096;

/// Allocate an AVIO context whose writes land in `state`'s staging area.
///
/// The caller owns `state` (boxed, stable address) and must keep it alive for
/// the context's lifetime, then free the context with
/// [`super::byte_buffer::free_avio`] after detaching it from the muxer.
pub(crate) fn avio_for_write_state(
    state: *mut WriteState,
) -> Option<*mut ffmpeg::ffi::AVIOContext> {
    // SAFETY: see avio_for_buffer — identical ownership contract, write side.
    unsafe {
        let io_buffer = ffmpeg::ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
        if io_buffer.is_null() {
            return None;
        }
        let ctx = ffmpeg::ffi::avio_alloc_context(
            io_buffer,
            AVIO_BUFFER_SIZE as c_int,
            1, // write
            state as *mut c_void,
            None,
            Some(write_packet),
            None,
        );
        if ctx.is_null() {
            ffmpeg::ffi::av_free(io_buffer as *mut c_void);
            return None;
        }
        Some(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(queue: &Arc<PacketQueue>, index: usize) -> WriteState {
        WriteState::new(Arc::clone(queue), index)
    }

    #[test]
    fn test_staging_applies_end_flag_to_last_only() {
        let queue = Arc::new(PacketQueue::new());
        let mut ws = state(&queue, 3);
        ws.stage(b"chunk0");
        ws.stage(b"chunk1");
        ws.stage(b"chunk2");
        ws.push_staging(PacketFlags::END_OF_OUTPUT, -1);

        let p0 = queue.pop_front();
        let p1 = queue.pop_front();
        let p2 = queue.pop_front();
        assert_eq!(p0.flags, PacketFlags::empty());
        assert_eq!(p1.flags, PacketFlags::empty());
        assert_eq!(p2.flags, PacketFlags::END_OF_OUTPUT);
        assert_eq!(p0.index, 3);
        assert_eq!(p2.data.as_ref(), b"chunk2");
        assert_eq!(p2.timestamp, -1);
    }

    #[test]
    fn test_non_end_flags_apply_to_all() {
        let queue = Arc::new(PacketQueue::new());
        let mut ws = state(&queue, 0);
        ws.stage(b"hdr0");
        ws.stage(b"hdr1");
        ws.push_staging(PacketFlags::BEGIN_OF_OUTPUT, -1);
        assert_eq!(queue.pop_front().flags, PacketFlags::BEGIN_OF_OUTPUT);
        assert_eq!(queue.pop_front().flags, PacketFlags::BEGIN_OF_OUTPUT);
    }

    #[test]
    fn test_empty_staging_is_noop() {
        let queue = Arc::new(PacketQueue::new());
        let mut ws = state(&queue, 0);
        ws.push_staging(PacketFlags::END_OF_OUTPUT, -1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_flag_protocol_per_segment() {
        // BEGIN_OF_OUTPUT · PACKET_OUTPUT* · END_OF_OUTPUT
        let queue = Arc::new(PacketQueue::new());
        let mut ws = state(&queue, 0);
        ws.stage(b"header");
        ws.push_staging(PacketFlags::BEGIN_OF_OUTPUT, -1);
        for ts in [0i64, 3000, 6000] {
            ws.stage(b"data");
            ws.push_staging(PacketFlags::PACKET_OUTPUT, ts);
        }
        ws.stage(b"trailer");
        ws.push_staging(PacketFlags::END_OF_OUTPUT, -1);
        queue.push_end();

        let mut seen = Vec::new();
        loop {
            let pkt = queue.pop_front();
            let done = pkt.flags.contains(PacketFlags::END_OF_ALL_OUTPUTS);
            seen.push(pkt);
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 6);
        assert!(seen[0].flags.contains(PacketFlags::BEGIN_OF_OUTPUT));
        assert!(seen[1..4]
            .iter()
            .all(|p| p.flags.contains(PacketFlags::PACKET_OUTPUT)));
        assert_eq!(seen[1].timestamp, 0);
        assert_eq!(seen[3].timestamp, 6000);
        assert!(seen[4].flags.contains(PacketFlags::END_OF_OUTPUT));
        assert!(seen[5].flags.contains(PacketFlags::END_OF_ALL_OUTPUTS));
        assert!(seen[5].data.is_empty());
        assert_eq!(seen[5].timestamp, -1);
    }

    #[test]
    fn test_per_output_indexing_preserved() {
        let queue = Arc::new(PacketQueue::new());
        let mut a = state(&queue, 0);
        let mut b = state(&queue, 1);
        a.stage(b"a0");
        a.push_staging(PacketFlags::PACKET_OUTPUT, 1);
        b.stage(b"b0");
        b.push_staging(PacketFlags::PACKET_OUTPUT, 2);
        a.stage(b"a1");
        a.push_staging(PacketFlags::PACKET_OUTPUT, 3);

        let of_a: Vec<_> = [queue.pop_front(), queue.pop_front(), queue.pop_front()]
            .into_iter()
            .filter(|p| p.index == 0)
            .map(|p| p.data)
            .collect();
        assert_eq!(of_a, vec![Bytes::from_static(b"a0"), Bytes::from_static(b"a1")]);
    }

    #[test]
    fn test_blocking_consumer() {
        let queue = Arc::new(PacketQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let pkt = queue.peek_front();
                assert_eq!(pkt.data.as_ref(), b"late");
                queue.pop_front()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut ws = state(&queue, 0);
        ws.stage(b"late");
        ws.push_staging(PacketFlags::PACKET_OUTPUT, 42);
        let got = consumer.join().unwrap();
        assert_eq!(got.timestamp, 42);
    }

    #[test]
    fn test_clear_staging_discards() {
        let queue = Arc::new(PacketQueue::new());
        let mut ws = state(&queue, 0);
        ws.stage(b"junk");
        assert!(ws.has_staged());
        ws.clear_staging();
        ws.push_staging(PacketFlags::END_OF_OUTPUT, -1);
        assert_eq!(queue.len(), 0);
    }
}
