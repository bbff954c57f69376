//! Resilience helpers.
//!
//! Bootstrap and gateway setup depend on things outside our control (DHCP servers, router
//! advertisements, binaries appearing on disk), so they run under a retry policy.

mod retry;

pub use retry::{ExponentialBackoffConfig, RetryPolicy, RetryableError};
