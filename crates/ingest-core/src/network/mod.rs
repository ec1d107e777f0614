//! Network utilities for HTTP operations and resilience.
//!
//! This module provides:
//! - Retry logic with exponential backoff and jitter
//! - An HTTP client wrapper with a per-client monotonic rate gate
//! - A reusable request-rate limiter used by provider and source clients

mod client;
mod rate_gate;
mod retry;

pub use client::HttpClient;
pub use rate_gate::RateGate;
pub use retry::{retry_async, RetryConfig, RetryStats};
