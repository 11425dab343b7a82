//! Conversation data model and the AI backend port.

pub mod client;
pub mod types;
