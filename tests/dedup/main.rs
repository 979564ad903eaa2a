// Dedup integration tests

mod flood_test;
mod lru_test;
