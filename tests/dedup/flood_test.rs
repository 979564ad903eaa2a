// Flood Control Tests
// Token buckets per sender and per content, and content dedup

use blemesh::dedup::{Admission, ContentKey, FloodConfig, FloodController, TokenBucket};
use blemesh::identity::PeerId;

#[test]
fn test_bucket_refills_over_time() {
    let mut bucket = TokenBucket::new(2.0, 1.0, 0);
    assert!(bucket.try_take_at(0));
    assert!(bucket.try_take_at(0));
    assert!(!bucket.try_take_at(0));
    assert!(!bucket.try_take_at(500));
    assert!(bucket.try_take_at(1_000));
}

#[test]
fn test_sender_limited_after_burst() {
    let config = FloodConfig::new().with_sender_bucket(3.0, 0.1).with_content_bucket(100.0, 1.0);
    let mut flood = FloodController::new(config);
    let sender = PeerId::from_bytes([1; 8]);

    for i in 0..3 {
        let key = ContentKey::from_text(&format!("message {}", i));
        assert_eq!(flood.admit_at(sender, key, 0), Admission::Admitted);
    }
    let key = ContentKey::from_text("one more");
    assert_eq!(flood.admit_at(sender, key, 0), Admission::SenderLimited);

    // Other senders are unaffected
    assert!(flood.admit_at(PeerId::from_bytes([2; 8]), key, 0).is_admitted());
}

#[test]
fn test_same_content_limited_across_senders() {
    let config = FloodConfig::new().with_content_bucket(2.0, 0.1);
    let mut flood = FloodController::new(config);
    let key = ContentKey::from_text("Buy now!!");

    assert!(flood.admit_at(PeerId::from_bytes([1; 8]), key, 0).is_admitted());
    assert!(flood.admit_at(PeerId::from_bytes([2; 8]), key, 0).is_admitted());
    assert_eq!(
        flood.admit_at(PeerId::from_bytes([3; 8]), key, 0),
        Admission::ContentLimited
    );
}

#[test]
fn test_cosmetic_variants_are_duplicates() {
    let mut flood = FloodController::new(FloodConfig::default());
    assert!(!flood.check_duplicate_content_at(ContentKey::from_text("Look: https://x.io/a?ref=1"), 0));
    assert!(flood.check_duplicate_content_at(ContentKey::from_text("look:   https://x.io/a#top"), 1));
    assert_eq!(flood.stats().duplicate_content, 1);
}

#[test]
fn test_idle_buckets_pruned() {
    let mut flood = FloodController::new(FloodConfig::default());
    flood.admit_at(PeerId::from_bytes([1; 8]), ContentKey::from_text("hi"), 0);
    assert_eq!(flood.tracked_senders(), 1);

    // Long enough for both buckets to refill
    flood.prune_idle_at(3_600_000);
    assert_eq!(flood.tracked_senders(), 0);
    assert_eq!(flood.tracked_contents(), 0);
}

#[test]
fn test_invalid_config_rejected() {
    assert!(FloodConfig::new().with_sender_bucket(0.0, 1.0).validate().is_err());
    assert!(FloodConfig::default().validate().is_ok());
}
