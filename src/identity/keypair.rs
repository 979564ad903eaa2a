use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeypairError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid key bytes: {0}")]
    InvalidBytes(String),
}

fn to_array(bytes: &[u8]) -> Result<[u8; 32], KeypairError> {
    bytes.try_into().map_err(|_| KeypairError::InvalidLength {
        expected: 32,
        got: bytes.len(),
    })
}

// ============================================================================
// SIGNING KEYS (Ed25519)
// ============================================================================

/// Ed25519 public key announced alongside a peer's Noise static key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[u8; 32]", into = "[u8; 32]")]
pub struct PublicKey(VerifyingKey);

impl TryFrom<[u8; 32]> for PublicKey {
    type Error = KeypairError;

    fn try_from(bytes: [u8; 32]) -> Result<Self, Self::Error> {
        Self::from_bytes(&bytes)
    }
}

impl From<PublicKey> for [u8; 32] {
    fn from(key: PublicKey) -> Self {
        key.0.to_bytes()
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Rejects lengths other than 32 and points that do not decompress
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        let bytes_array = to_array(bytes)?;
        let verifying_key = VerifyingKey::from_bytes(&bytes_array)
            .map_err(|e| KeypairError::InvalidBytes(e.to_string()))?;
        Ok(Self(verifying_key))
    }

    pub(crate) fn inner(&self) -> &VerifyingKey {
        &self.0
    }
}

/// Ed25519 keypair used to sign broadcast packets
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    /// Secret key bytes
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        let bytes_array = Zeroizing::new(to_array(bytes)?);
        let signing_key = SigningKey::from_bytes(&bytes_array);
        Ok(Self { signing_key })
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

// ============================================================================
// STATIC HANDSHAKE KEYS (X25519)
// ============================================================================

/// Long-term X25519 key used as the `s` key in the Noise handshake.
///
/// The secret half is zeroized on drop by `StaticSecret`.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl StaticKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        let bytes_array = Zeroizing::new(to_array(bytes)?);
        let secret = StaticSecret::from(*bytes_array);
        let public = X25519PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// IDENTITY BUNDLE
// ============================================================================

#[derive(Serialize, Deserialize)]
struct IdentityBytes {
    signing: [u8; 32],
    noise: [u8; 32],
}

impl Drop for IdentityBytes {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.signing.zeroize();
        self.noise.zeroize();
    }
}

/// Everything a node needs to prove who it is on the mesh
#[derive(Clone)]
pub struct IdentityKeys {
    signing: Keypair,
    noise: StaticKeypair,
}

impl IdentityKeys {
    pub fn generate() -> Self {
        Self {
            signing: Keypair::generate(),
            noise: StaticKeypair::generate(),
        }
    }

    pub fn new(signing: Keypair, noise: StaticKeypair) -> Self {
        Self { signing, noise }
    }

    pub fn signing(&self) -> &Keypair {
        &self.signing
    }

    pub fn noise(&self) -> &StaticKeypair {
        &self.noise
    }

    /// Stable identity: SHA-256 of the Noise static key
    pub fn fingerprint(&self) -> crate::identity::Fingerprint {
        crate::identity::Fingerprint::from_static_key(&self.noise.public_key())
    }

    /// Short identity used on the wire
    pub fn peer_id(&self) -> crate::identity::PeerId {
        self.fingerprint().short_id()
    }

    /// Serialize both secrets (postcard) for export
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let raw = IdentityBytes {
            signing: *self.signing.to_bytes(),
            noise: *self.noise.to_bytes(),
        };
        Zeroizing::new(postcard::to_allocvec(&raw).unwrap_or_default())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        let raw: IdentityBytes =
            postcard::from_bytes(bytes).map_err(|e| KeypairError::InvalidBytes(e.to_string()))?;
        Ok(Self {
            signing: Keypair::from_bytes(&raw.signing)?,
            noise: StaticKeypair::from_bytes(&raw.noise)?,
        })
    }
}
