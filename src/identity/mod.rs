// Identity module - WHO A PEER IS
// Signing keys, handshake static keys, and the two peer identifier forms

mod keypair;
mod peer_id;
mod signer;

pub use keypair::*;
pub use peer_id::*;
pub use signer::*;
