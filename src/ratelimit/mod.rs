//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod decision;
mod distributed;
mod limiter;
mod window;

pub use backend::RateLimiterBackend;
pub use bucket::{refill, BucketParams, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{BucketStatus, LimiterStats, RateLimitDecision};
pub use distributed::DistributedRateLimiter;
pub use limiter::{LocalRateLimiter, DEFAULT_MAX_BUCKETS};
pub use window::TimeWindow;
