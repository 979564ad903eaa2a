// Handshake Tests
// XX pattern message sizes, key agreement and tamper detection

use blemesh::identity::StaticKeypair;
use blemesh::noise::{HandshakeState, NoiseError, Role, MSG1_LEN, MSG2_MIN_LEN, MSG3_MIN_LEN};

fn pair() -> (HandshakeState, HandshakeState, StaticKeypair, StaticKeypair) {
    let a = StaticKeypair::generate();
    let b = StaticKeypair::generate();
    let init = HandshakeState::new(Role::Initiator, &a, b"");
    let resp = HandshakeState::new(Role::Responder, &b, b"");
    (init, resp, a, b)
}

#[test]
fn test_full_handshake_agrees() {
    let (mut init, mut resp, a, b) = pair();

    let m1 = init.write_message(&[]).unwrap();
    assert_eq!(m1.len(), MSG1_LEN);
    resp.read_message(&m1).unwrap();

    let m2 = resp.write_message(&[]).unwrap();
    assert_eq!(m2.len(), MSG2_MIN_LEN);
    init.read_message(&m2).unwrap();

    let m3 = init.write_message(&[]).unwrap();
    assert_eq!(m3.len(), MSG3_MIN_LEN);
    resp.read_message(&m3).unwrap();

    assert!(init.is_complete() && resp.is_complete());
    assert_eq!(init.remote_static(), Some(b.public_key()));
    assert_eq!(resp.remote_static(), Some(a.public_key()));
    assert_eq!(init.handshake_hash(), resp.handshake_hash());

    let (mut ic, _) = init.into_transport(64).unwrap();
    let (mut rc, _) = resp.into_transport(64).unwrap();
    let ct = ic.encrypt(b"over the air").unwrap();
    assert_eq!(rc.decrypt(&ct).unwrap(), b"over the air");
    let back = rc.encrypt(b"ack").unwrap();
    assert_eq!(ic.decrypt(&back).unwrap(), b"ack");
}

#[test]
fn test_tampered_second_message_fails() {
    let (mut init, mut resp, _, _) = pair();
    let m1 = init.write_message(&[]).unwrap();
    resp.read_message(&m1).unwrap();
    let mut m2 = resp.write_message(&[]).unwrap();
    m2[40] ^= 0x01;
    assert!(init.read_message(&m2).is_err());
}

#[test]
fn test_out_of_turn_write_rejected() {
    let (_, mut resp, _, _) = pair();
    assert!(!resp.is_my_turn());
    assert!(matches!(resp.write_message(&[]), Err(NoiseError::InvalidState(_))));
}

#[test]
fn test_short_first_message_rejected() {
    let (_, mut resp, _, _) = pair();
    assert!(resp.read_message(&[0u8; MSG1_LEN - 1]).is_err());
}
