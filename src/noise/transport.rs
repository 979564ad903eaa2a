// Transport Cipher - post-handshake AEAD with explicit nonces
//
// Wire form of one message: nonce(8, BE) | ciphertext+tag.
// The receiver keeps a sliding window of accepted nonces, so loss and
// reordering are tolerated while replays are rejected. A nonce is recorded
// only after the tag verifies; forged traffic cannot poison the window.

use crate::noise::symmetric::{aead_nonce, TAG_LEN};
use crate::noise::NoiseError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

pub const NONCE_PREFIX_LEN: usize = 8;
pub const DEFAULT_REPLAY_WINDOW: usize = 1024;

// ============================================================================
// REPLAY WINDOW
// ============================================================================

/// Bitmap ring over the most recent `size` nonces
#[derive(Clone, Debug)]
pub struct ReplayWindow {
    size: u64,
    bits: Vec<u64>,
    highest: Option<u64>,
}

impl ReplayWindow {
    /// `size` is rounded up to a multiple of 64
    pub fn new(size: usize) -> Self {
        let words = size.max(64).div_ceil(64);
        Self {
            size: (words * 64) as u64,
            bits: vec![0; words],
            highest: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Check whether `nonce` may be accepted, without recording it
    pub fn check(&self, nonce: u64) -> Result<(), NoiseError> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if nonce > highest {
            return Ok(());
        }
        if highest - nonce >= self.size {
            return Err(NoiseError::NonceTooOld { nonce, highest });
        }
        if self.is_set(nonce) {
            return Err(NoiseError::Replay(nonce));
        }
        Ok(())
    }

    /// Record an authenticated nonce
    pub fn commit(&mut self, nonce: u64) {
        match self.highest {
            None => self.highest = Some(nonce),
            Some(highest) if nonce > highest => {
                let advance = nonce - highest;
                if advance >= self.size {
                    self.bits.iter_mut().for_each(|w| *w = 0);
                } else {
                    for n in highest + 1..nonce {
                        self.clear(n);
                    }
                }
                self.highest = Some(nonce);
            }
            Some(_) => {}
        }
        self.set(nonce);
    }

    fn slot(&self, nonce: u64) -> (usize, u64) {
        let bit = nonce % self.size;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn is_set(&self, nonce: u64) -> bool {
        let (word, mask) = self.slot(nonce);
        self.bits[word] & mask != 0
    }

    fn set(&mut self, nonce: u64) {
        let (word, mask) = self.slot(nonce);
        self.bits[word] |= mask;
    }

    fn clear(&mut self, nonce: u64) {
        let (word, mask) = self.slot(nonce);
        self.bits[word] &= !mask;
    }
}

// ============================================================================
// TRANSPORT CIPHER
// ============================================================================

/// One send key and one receive key, established by the handshake split
pub struct TransportCipher {
    send: ChaCha20Poly1305,
    send_nonce: u64,
    recv: ChaCha20Poly1305,
    window: ReplayWindow,
    sent: u64,
    received: u64,
}

impl std::fmt::Debug for TransportCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCipher")
            .field("send_nonce", &self.send_nonce)
            .field("highest_received", &self.window.highest())
            .finish_non_exhaustive()
    }
}

impl TransportCipher {
    pub fn new(send_key: &[u8; 32], recv_key: &[u8; 32], replay_window: usize) -> Self {
        Self {
            send: ChaCha20Poly1305::new(send_key.into()),
            send_nonce: 0,
            recv: ChaCha20Poly1305::new(recv_key.into()),
            window: ReplayWindow::new(replay_window),
            sent: 0,
            received: 0,
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent
    }

    pub fn messages_received(&self) -> u64 {
        self.received
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.send_nonce == u64::MAX {
            return Err(NoiseError::NonceExhausted);
        }
        let nonce = self.send_nonce;
        let ciphertext = self
            .send
            .encrypt(Nonce::from_slice(&aead_nonce(nonce)), plaintext)
            .map_err(|_| NoiseError::Encryption)?;
        self.send_nonce += 1;
        self.sent += 1;

        let mut out = Vec::with_capacity(NONCE_PREFIX_LEN + ciphertext.len());
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if message.len() < NONCE_PREFIX_LEN + TAG_LEN {
            return Err(NoiseError::InvalidMessage(format!(
                "transport message of {} bytes is too short",
                message.len()
            )));
        }
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&message[..NONCE_PREFIX_LEN]);
        let nonce = u64::from_be_bytes(prefix);

        self.window.check(nonce)?;
        let plaintext = self
            .recv
            .decrypt(Nonce::from_slice(&aead_nonce(nonce)), &message[NONCE_PREFIX_LEN..])
            .map_err(|_| NoiseError::Authentication)?;
        self.window.commit(nonce);
        self.received += 1;
        Ok(plaintext)
    }
}
