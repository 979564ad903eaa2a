// Mesh errors - aggregate of every layer's error type

use crate::dedup::FloodError;
use crate::identity::{KeypairError, PeerId, SignatureError};
use crate::mesh::peer::PeerError;
use crate::noise::NoiseError;
use crate::sync::SyncError;
use crate::topology::TopologyError;
use crate::transport::TransportError;
use crate::wire::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Cannot address self ({0})")]
    SelfAddressed(PeerId),

    #[error("Invalid application payload: {0}")]
    Payload(String),

    #[error("Mesh service stopped")]
    ServiceStopped,

    #[error(transparent)]
    Noise(#[from] NoiseError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Keypair(#[from] KeypairError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl From<FloodError> for MeshError {
    fn from(e: FloodError) -> Self {
        MeshError::Config(e.to_string())
    }
}

impl From<TopologyError> for MeshError {
    fn from(e: TopologyError) -> Self {
        MeshError::Config(e.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
