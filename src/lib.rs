//! Telegram bot that relays user text and photos to Google Gemini.
//!
//! Users register by sharing their own Telegram contact; registrations,
//! chat exchanges and image analyses are kept in MongoDB.

/// Telegram transport: dispatcher endpoints, flows and message rendering
pub mod bot;
/// Configuration and settings management
pub mod config;
/// Gemini client and the generative model interface
pub mod llm;
/// Tracing setup with secret redaction
pub mod logging;
/// MongoDB-backed user registry
pub mod storage;
/// Text formatting, splitting and retry helpers
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
