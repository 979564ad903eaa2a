// Signer - Ed25519 signatures with per-purpose domain separation
//
// Every signed message is prefixed with a context tag before signing, so a
// signature produced for one purpose (a broadcast packet) can never be
// presented as another (a verification response).

use crate::identity::{Keypair, PublicKey};
use ed25519_dalek::{Signature as DalekSignature, Signer as DalekSigner, Verifier};
use std::fmt;
use thiserror::Error;

/// Length of an encoded signature trailer
pub const SIGNATURE_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature must be 64 bytes, got {0}")]
    InvalidLength(usize),
}

/// What a signature vouches for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignContext {
    /// Canonical packet encoding with TTL zeroed
    Packet,
    /// Verification challenge nonce bound to the responder's fingerprint
    Verification,
}

impl SignContext {
    fn tag(self) -> &'static [u8] {
        match self {
            Self::Packet => b"blemesh/packet/v1\0",
            Self::Verification => b"blemesh/verify/v1\0",
        }
    }

    fn bind(self, message: &[u8]) -> Vec<u8> {
        let tag = self.tag();
        let mut out = Vec::with_capacity(tag.len() + message.len());
        out.extend_from_slice(tag);
        out.extend_from_slice(message);
        out
    }
}

/// Raw Ed25519 signature bytes. Parsing only checks the length; whether the
/// bytes form a valid signature is decided at verification time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let bytes: [u8; SIGNATURE_LEN] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

pub struct Signer;

impl Signer {
    pub fn sign(keypair: &Keypair, context: SignContext, message: &[u8]) -> Signature {
        let signature = keypair.signing_key().sign(&context.bind(message));
        Signature(signature.to_bytes())
    }

    /// Strict verification: rejects malleable and small-order encodings
    pub fn verify(public_key: &PublicKey, context: SignContext, message: &[u8], signature: &Signature) -> bool {
        let signature = DalekSignature::from_bytes(&signature.0);
        public_key
            .inner()
            .verify_strict(&context.bind(message), &signature)
            .is_ok()
    }
}
