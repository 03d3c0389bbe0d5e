//! Admission - token bucket admission control for HTTP services
//!
//! This crate limits how many requests each client may make. Every client key
//! (source address, credential digest or API key) owns a token bucket that
//! refills lazily from elapsed time. Buckets live either in process or in
//! Redis, where an atomic script lets many instances share one quota.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod ratelimit;
