// Noise session integration tests

mod handshake_test;
mod manager_test;
