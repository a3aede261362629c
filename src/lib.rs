//! Pixelift Guard - request guards for the Pixelift API
//!
//! This crate implements the abuse-mitigation layer in front of Pixelift's
//! API routes and job submission: named fixed-window rate limiters, a
//! per-key cap on in-flight jobs, and API key validation. Counters live in
//! an injected store (in-process or Redis) and every check fails open when
//! the store is unavailable.

pub mod apikey;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod retry;
pub mod store;
