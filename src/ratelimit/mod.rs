//! Token bucket rate limiting logic and state management.

mod bucket;
mod clock;
mod key;
mod limiter;

pub use bucket::{BucketConfig, BucketSnapshot, BucketStats, Decision};
pub(crate) use bucket::TokenBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{BucketKey, DEFAULT_ENDPOINT};
pub use limiter::{IdleEviction, RateLimiter, DEFAULT_WARNING_THRESHOLD};
