// Wire integration tests

mod codec_test;
mod fragment_test;
