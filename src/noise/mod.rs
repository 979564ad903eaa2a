// Noise module - THE SESSION ENGINE
// Noise_XX_25519_ChaChaPoly_SHA256 handshakes and per-peer transport ciphers

mod handshake;
mod manager;
mod session;
mod symmetric;
mod transport;

pub use handshake::{HandshakeState, Role, MSG1_LEN, MSG2_MIN_LEN, MSG3_MIN_LEN};
pub use manager::{SessionConfig, SessionManager, SessionStats};
pub use session::{Established, NoiseError, NoiseSession, SessionAction, SessionState};
pub use symmetric::PROTOCOL_NAME;
pub use transport::{ReplayWindow, TransportCipher, DEFAULT_REPLAY_WINDOW, NONCE_PREFIX_LEN};
