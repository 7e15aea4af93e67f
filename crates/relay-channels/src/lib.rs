//! # relay-channels
//!
//! Concrete `Channel` implementations. The orchestrator routes outbound
//! traffic to whichever registered channel `owns` a JID.

pub mod telegram;

pub use telegram::TelegramChannel;
