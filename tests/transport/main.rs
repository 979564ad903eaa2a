// Transport integration tests

mod memory_test;
mod tcp_test;
mod traits_test;
