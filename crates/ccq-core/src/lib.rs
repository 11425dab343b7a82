//! Core of the cross-process query channel.
//!
//! A UI-side [`query::QueryClient`] multiplexes many concurrent requests over one
//! NDJSON byte channel to a [`worker::Worker`], which runs each request against an AI
//! backend. Responses are routed back by request id through the [`correlator`] and
//! consumed as pull-based [`stream::MessageStream`]s. Backends live behind the
//! [`model::client::Backend`] port and are implemented in adapter crates.

pub mod config;
pub mod correlator;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod permissions;
pub mod presets;
pub mod protocol;
pub mod query;
pub mod retry;
pub mod session;
pub mod stream;
pub mod tools;
pub mod transport;
pub mod utils;
pub mod worker;

pub use errors::{Error, Result};
