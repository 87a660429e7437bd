//! Message caching and retrieval for two-party conversations.
//!
//! Data flows backend → fetchers (dedup, fallback chain, back-off) →
//! tiered caches (memory + sqlite) → sessions that own view state.

pub mod backend;
pub mod client;
pub mod config;
pub mod core;
pub mod fetch;
pub mod session;

pub use client::MessagingClient;
pub use config::Config;
pub use session::{ConversationSession, SessionState};
