//! Utility modules: retry backoff and timeout/cancellation helpers.

pub mod retry;
pub mod timeout;
