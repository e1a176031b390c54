pub mod limiter;
pub mod token_bucket;

pub use limiter::{MultiDimensionalLimiter, RateLimitScope};
pub use token_bucket::TokenBucket;
