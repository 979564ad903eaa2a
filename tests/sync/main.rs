// Gossip sync integration tests

mod gossip_test;
mod protocol_test;
