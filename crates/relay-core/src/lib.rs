//! # relay-core
//!
//! Core types, traits, configuration, and error handling for the Relay
//! orchestrator.

pub mod config;
pub mod error;
pub mod group;
pub mod ipc;
pub mod message;
pub mod protocol;
pub mod sanitize;
pub mod task;
pub mod traits;

pub use config::shellexpand;

/// Current instant as an ISO-8601 UTC string with millisecond precision.
///
/// Every cursor and timestamp in the system uses this format; total order is
/// plain lexicographic comparison of the strings.
pub fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
