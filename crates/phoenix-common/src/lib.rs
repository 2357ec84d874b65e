//! Common types for phoenix: errors, retry, readiness polling, typed
//! control-plane resources and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod poll;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use poll::{poll_until, PollSpec};
pub use retry::{retry, retry_while, RetryConfig};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
