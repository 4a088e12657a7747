//! # relay-protocol — relay mesh wire contract
//!
//! Shared types for every relay-mesh crate: the message envelope, agent
//! profiles, harness labels, prefix-tagged identifiers, and the error
//! taxonomy surfaced through the tool layer.
//!
//! This crate is intentionally dependency-light (no tokio, no transport
//! clients) so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — prefix-tagged 16-hex-char identifiers (`ag-…`, `msg-…`)
//! - [`message`] — the durable message envelope
//! - [`profile`] — agent profiles, status values, normalization and patching
//! - [`harness`] — harness labels driving push-adapter selection
//! - [`error`] — `RelayError`, `RelayResult`

pub mod error;
pub mod harness;
pub mod ids;
pub mod message;
pub mod profile;

pub use error::{RelayError, RelayResult};
pub use harness::Harness;
pub use ids::{AGENT_ID_PREFIX, MESSAGE_ID_PREFIX, agent_id, message_id};
pub use message::Message;
pub use profile::{AgentProfile, AgentStatus, ProfilePatch, normalize_project_name};
