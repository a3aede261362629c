//! HTTP surface of the guard service.

mod middleware;
mod response;
mod server;
mod service;

pub use middleware::enforce_rate_limit;
pub use response::{ErrorResponse, RateLimitResponse};
pub use server::HttpServer;
pub use service::{router, GuardState};
