// Frame Assembler - rebuilds frames from an arbitrarily split byte stream
//
// The transport hands over whatever it received; frames may be split at any
// byte, several may arrive in one chunk, and noise may precede them. Bytes
// that cannot start a frame are dropped one at a time so a valid frame that
// follows the noise is still found.

use crate::wire::codec::{PacketCodec, WireError};
use crate::wire::packet::Packet;
use tracing::{debug, warn};

/// What one call to [`FrameAssembler::append`] produced
#[derive(Debug, Default)]
pub struct AssemblerOutput {
    /// Complete packets, in stream order
    pub packets: Vec<Packet>,
    /// Bytes discarded while resynchronizing
    pub discarded: usize,
    /// Why bytes were discarded, one entry per resync
    pub errors: Vec<WireError>,
}

#[derive(Clone, Debug, Default)]
pub struct AssemblerStats {
    pub frames_decoded: u64,
    pub bytes_discarded: u64,
}

/// Streaming assembler for one inbound byte stream
#[derive(Debug)]
pub struct FrameAssembler {
    codec: PacketCodec,
    buffer: Vec<u8>,
    stats: AssemblerStats,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(PacketCodec::default())
    }
}

impl FrameAssembler {
    pub fn new(codec: PacketCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
            stats: AssemblerStats::default(),
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Append a chunk and drain every complete frame now available
    pub fn append(&mut self, chunk: &[u8]) -> AssemblerOutput {
        self.buffer.extend_from_slice(chunk);
        let mut out = AssemblerOutput::default();
        let mut consumed = 0;

        while consumed < self.buffer.len() {
            let window = &self.buffer[consumed..];
            match PacketCodec::frame_len(window) {
                Ok(None) => break,
                Ok(Some(len)) if window.len() < len => break,
                Ok(Some(len)) => match self.codec.decode(&window[..len]) {
                    Ok(packet) => {
                        debug!(len, kind = ?packet.message_type, "Frame assembled");
                        out.packets.push(packet);
                        self.stats.frames_decoded += 1;
                        consumed += len;
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable frame start");
                        out.errors.push(e);
                        out.discarded += 1;
                        consumed += 1;
                    }
                },
                Err(e) => {
                    debug!(error = %e, byte = window[0], "Skipping stray byte");
                    out.errors.push(e);
                    out.discarded += 1;
                    consumed += 1;
                }
            }
        }

        self.buffer.drain(..consumed);
        self.stats.bytes_discarded += out.discarded as u64;
        out
    }
}
