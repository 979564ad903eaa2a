// Application payloads - what travels inside a NoiseEncrypted packet
//
// Layout: kind(u8) | body
//   0x01 chat             message_id(16) | UTF-8 text
//   0x02 delivery ack     message_id(16)
//   0x03 read receipt     message_id(16)
//   0x10 verify challenge nonce(16)
//   0x11 verify response  nonce(16) | Ed25519 signature(64)

use crate::identity::{Fingerprint, Keypair, PublicKey, SignContext, Signature, Signer, SIGNATURE_LEN};
use crate::mesh::error::{MeshError, MeshResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

const KIND_CHAT: u8 = 0x01;
const KIND_DELIVERY_ACK: u8 = 0x02;
const KIND_READ_RECEIPT: u8 = 0x03;
const KIND_VERIFY_CHALLENGE: u8 = 0x10;
const KIND_VERIFY_RESPONSE: u8 = 0x11;

const ID_LEN: usize = 16;

/// Identifier of one private chat message, echoed by acks and receipts
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..4]))
    }
}

/// Decrypted application payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppPayload {
    Chat { id: MessageId, text: String },
    DeliveryAck { id: MessageId },
    ReadReceipt { id: MessageId },
    VerifyChallenge { nonce: [u8; ID_LEN] },
    VerifyResponse { nonce: [u8; ID_LEN], signature: Signature },
}

impl AppPayload {
    pub fn chat(text: &str) -> Self {
        AppPayload::Chat {
            id: MessageId::generate(),
            text: text.to_string(),
        }
    }

    pub fn challenge() -> Self {
        let mut nonce = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        AppPayload::VerifyChallenge { nonce }
    }

    /// Answer a challenge: sign the nonce bound to our own fingerprint
    pub fn respond(nonce: [u8; ID_LEN], signing: &Keypair, own: &Fingerprint) -> Self {
        let signature = Signer::sign(signing, SignContext::Verification, &verify_message(&nonce, own));
        AppPayload::VerifyResponse { nonce, signature }
    }

    /// Check a response against the signing key the peer announced
    pub fn verify_response(
        nonce: &[u8; ID_LEN],
        signature: &Signature,
        signing_key: &PublicKey,
        responder: &Fingerprint,
    ) -> bool {
        Signer::verify(signing_key, SignContext::Verification, &verify_message(nonce, responder), signature)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            AppPayload::Chat { id, text } => {
                let mut out = Vec::with_capacity(1 + ID_LEN + text.len());
                out.push(KIND_CHAT);
                out.extend_from_slice(id.as_bytes());
                out.extend_from_slice(text.as_bytes());
                out
            }
            AppPayload::DeliveryAck { id } => tagged(KIND_DELIVERY_ACK, id.as_bytes()),
            AppPayload::ReadReceipt { id } => tagged(KIND_READ_RECEIPT, id.as_bytes()),
            AppPayload::VerifyChallenge { nonce } => tagged(KIND_VERIFY_CHALLENGE, nonce),
            AppPayload::VerifyResponse { nonce, signature } => {
                let mut out = tagged(KIND_VERIFY_RESPONSE, nonce);
                out.extend_from_slice(signature.as_bytes());
                out
            }
        }
    }

    pub fn decode(data: &[u8]) -> MeshResult<Self> {
        let (&kind, body) = data
            .split_first()
            .ok_or_else(|| MeshError::Payload("empty payload".to_string()))?;
        match kind {
            KIND_CHAT => {
                let id = MessageId(array16(body)?);
                let text = std::str::from_utf8(&body[ID_LEN..])
                    .map_err(|e| MeshError::Payload(format!("chat text is not UTF-8: {}", e)))?;
                Ok(AppPayload::Chat {
                    id,
                    text: text.to_string(),
                })
            }
            KIND_DELIVERY_ACK => Ok(AppPayload::DeliveryAck { id: MessageId(exact16(body)?) }),
            KIND_READ_RECEIPT => Ok(AppPayload::ReadReceipt { id: MessageId(exact16(body)?) }),
            KIND_VERIFY_CHALLENGE => Ok(AppPayload::VerifyChallenge { nonce: exact16(body)? }),
            KIND_VERIFY_RESPONSE => {
                if body.len() != ID_LEN + SIGNATURE_LEN {
                    return Err(MeshError::Payload(format!(
                        "verify response must be {} bytes, got {}",
                        ID_LEN + SIGNATURE_LEN,
                        body.len()
                    )));
                }
                let nonce = array16(body)?;
                let signature = Signature::from_bytes(&body[ID_LEN..])?;
                Ok(AppPayload::VerifyResponse { nonce, signature })
            }
            other => Err(MeshError::Payload(format!("unknown payload kind 0x{:02x}", other))),
        }
    }
}

fn tagged(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(kind);
    out.extend_from_slice(body);
    out
}

fn array16(body: &[u8]) -> MeshResult<[u8; ID_LEN]> {
    body.get(..ID_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| MeshError::Payload(format!("need {} bytes, got {}", ID_LEN, body.len())))
}

fn exact16(body: &[u8]) -> MeshResult<[u8; ID_LEN]> {
    if body.len() != ID_LEN {
        return Err(MeshError::Payload(format!("expected {} bytes, got {}", ID_LEN, body.len())));
    }
    array16(body)
}

fn verify_message(nonce: &[u8; ID_LEN], responder: &Fingerprint) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ID_LEN + 32);
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(responder.as_bytes());
    msg
}
