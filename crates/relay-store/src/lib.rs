//! # relay-store
//!
//! SQLite-backed implementation of the `Store` capability.

pub mod store;

pub use store::SqliteStore;
