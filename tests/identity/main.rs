// Identity integration tests

mod keypair_test;
mod peer_id_test;
mod signer_test;
