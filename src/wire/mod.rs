// Wire module - THE FRAME
// Binary packet format, streaming reassembly, fragmentation and compression

mod announce;
mod assembler;
mod codec;
pub mod compression;
mod fragment;
mod packet;
pub mod tlv;

pub use announce::{AnnouncementPayload, MAX_ANNOUNCED_NEIGHBORS};
pub use assembler::{AssemblerOutput, AssemblerStats, FrameAssembler};
pub use codec::{
    PacketCodec, WireError, BASE_HEADER_LEN, DEFAULT_COMPRESSION_THRESHOLD, FLAG_COMPRESSED,
    FLAG_HAS_RECIPIENT, FLAG_HAS_SIGNATURE, MAX_FRAME_LEN, MAX_PAYLOAD_SIZE,
};
pub use fragment::{
    fragment_packet, FragmentHeader, FragmentReassembler, ReassemblyStats, FRAGMENT_HEADER_LEN,
    MIN_MTU,
};
pub use packet::{MessageType, Packet, PacketId, DEFAULT_TTL, PROTOCOL_VERSION};
