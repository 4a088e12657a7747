//! The durable message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope published on an agent's subject and retained in the durable
/// stream. All fields are immutable once assigned; consumers ignore
/// unknown fields and the broker drops records that fail to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a new envelope with a fresh `msg-` id stamped at the current
    /// UTC instant.
    pub fn new(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: crate::ids::message_id(),
            from: from.into(),
            to: to.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}
