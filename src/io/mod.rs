//! Thread-safe glue between an external caller and the pull-based demuxer /
//! push-based muxer: bytes in, muxed packets out.

pub mod byte_buffer;
pub mod packet_queue;

pub use byte_buffer::{ByteBuffer, StreamErrorCode, PROTECTED_BYTES, STREAM_BUFFER_BYTES};
pub use packet_queue::{OutputPacket, PacketFlags, PacketQueue, WriteState};
