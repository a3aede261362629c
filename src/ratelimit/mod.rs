//! Rate limiting logic and state management.

mod counter;
mod identifier;
mod limiter;
mod registry;

pub use counter::RateWindowCounter;
pub use identifier::{ClientIdentifier, UNKNOWN_CLIENT};
pub use limiter::{LimitPolicy, RateLimitDecision, RateLimiter};
pub use registry::{LimiterRegistry, API_LIMITER, AUTH_LIMITER, POLLING_LIMITER};
