// Dedup module - THE GATEKEEPER
// Bounded LRU cache, content-key normalization, and token-bucket flood control

mod content_key;
mod lru;
mod rate_limiter;

pub use content_key::{normalize, ContentKey, NORMALIZED_PREFIX_CHARS};
pub use lru::LruCache;
pub use rate_limiter::{Admission, FloodConfig, FloodController, FloodError, FloodStats, TokenBucket};
