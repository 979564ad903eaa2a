// Symmetric state for Noise_XX_25519_ChaChaPoly_SHA256
//
// Chaining key, handshake hash, and the handshake-phase cipher. Every DH
// output passes through `mix_dh`, which zeroizes the raw shared secret before
// returning.

use crate::noise::NoiseError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_ChaChaPoly_SHA256";
pub const DH_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// Noise nonce encoding for ChaChaPoly: 4 zero bytes then a little-endian u64
pub(crate) fn aead_nonce(n: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&n.to_le_bytes());
    nonce
}

/// Noise HKDF with two outputs; identical to RFC 5869 with an empty info
pub(crate) fn hkdf2(
    chaining_key: &[u8; 32],
    ikm: &[u8],
) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
    let mut okm = Zeroizing::new([0u8; 64]);
    // 64 bytes is far below the 255 * HashLen limit
    let _ = hk.expand(&[], okm.as_mut_slice());
    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    (first, second)
}

/// X25519 with contributory check; the result is wiped when dropped
pub(crate) fn dh(
    secret: &StaticSecret,
    remote_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, NoiseError> {
    let shared = secret.diffie_hellman(&X25519PublicKey::from(*remote_public));
    if !shared.was_contributory() {
        return Err(NoiseError::InvalidKey("low-order public key".to_string()));
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

// ============================================================================
// CIPHER STATE (handshake phase)
// ============================================================================

pub(crate) struct CipherState {
    key: Option<Zeroizing<[u8; 32]>>,
    nonce: u64,
}

impl CipherState {
    fn empty() -> Self {
        Self { key: None, nonce: 0 }
    }

    fn with_key(key: Zeroizing<[u8; 32]>) -> Self {
        Self {
            key: Some(key),
            nonce: 0,
        }
    }

    fn has_key(&self) -> bool {
        self.key.is_some()
    }

    fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceExhausted);
        }
        let cipher = ChaCha20Poly1305::new(key.as_slice().into());
        let nonce = aead_nonce(self.nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|_| NoiseError::Encryption)?;
        self.nonce += 1;
        Ok(ciphertext)
    }

    fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let Some(key) = &self.key else {
            return Ok(ciphertext.to_vec());
        };
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceExhausted);
        }
        let cipher = ChaCha20Poly1305::new(key.as_slice().into());
        let nonce = aead_nonce(self.nonce);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| NoiseError::Authentication)?;
        self.nonce += 1;
        Ok(plaintext)
    }
}

// ============================================================================
// SYMMETRIC STATE
// ============================================================================

pub(crate) struct SymmetricState {
    chaining_key: Zeroizing<[u8; 32]>,
    hash: [u8; 32],
    cipher: CipherState,
}

impl SymmetricState {
    /// InitializeSymmetric followed by MixHash(prologue)
    pub fn new(prologue: &[u8]) -> Self {
        // The protocol name is exactly HASHLEN bytes, so it is used unhashed
        let mut state = Self {
            chaining_key: Zeroizing::new(*PROTOCOL_NAME),
            hash: *PROTOCOL_NAME,
            cipher: CipherState::empty(),
        };
        state.mix_hash(prologue);
        state
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash.copy_from_slice(&hasher.finalize());
    }

    pub fn mix_key(&mut self, ikm: &[u8]) {
        let (chaining_key, key) = hkdf2(&self.chaining_key, ikm);
        self.chaining_key = chaining_key;
        self.cipher = CipherState::with_key(key);
    }

    /// Run a DH and feed it to MixKey; the raw output never outlives this call
    pub fn mix_dh(&mut self, secret: &StaticSecret, remote_public: &[u8; 32]) -> Result<(), NoiseError> {
        let shared = dh(secret, remote_public)?;
        self.mix_key(shared.as_slice());
        drop(shared);
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        self.cipher.has_key()
    }

    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.hash, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = self.cipher.decrypt_with_ad(&self.hash, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    pub fn handshake_hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Derive the two transport keys (initiator->responder, responder->initiator)
    pub fn split(&self) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
        hkdf2(&self.chaining_key, &[])
    }
}
