//! Keyrate - Key-scoped Rate Limiting Service
//!
//! This crate implements token bucket rate limiting keyed by a value read from
//! each request (an API key header or a query parameter). Bucket state lives in
//! a shared versioned key-value store; isolated workers coordinate through
//! compare-and-swap writes instead of shared memory.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;

#[cfg(test)]
mod testing;
