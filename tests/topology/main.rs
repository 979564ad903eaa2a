// Topology integration tests

mod tracker_test;
