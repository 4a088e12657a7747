//! Best-effort session and harness resolution.
//!
//! When a client calls `register_agent` or `bind_session` without an
//! explicit session id, the server tries request headers first, then an
//! optional "most recently active unbound session" lookup against the
//! harness API. Resolution failures are never fatal.

use std::collections::HashSet;
use std::time::Duration;

use relay_protocol::Harness;
use serde::Deserialize;

use crate::{PushError, PushResult};

/// Header names scanned, in order, for a session id.
pub const SESSION_HEADER_CANDIDATES: &[&str] = &[
    "x-opencode-session-id",
    "x-opencode-sessionid",
    "x-opencode-session",
    "x-session-id",
    "x-sessionid",
];

/// First non-empty value among the candidate headers. Header names are
/// compared case-insensitively.
pub fn session_from_headers<'a, I>(headers: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)> + Clone,
{
    for candidate in SESSION_HEADER_CANDIDATES {
        for (name, value) in headers.clone() {
            if name.eq_ignore_ascii_case(candidate) && !value.trim().is_empty() {
                return Some(value.trim().to_owned());
            }
        }
    }
    None
}

/// Infer the harness from environment variables known to be set by each
/// harness. `RELAY_HARNESS` wins when it parses.
pub fn harness_from_env() -> Harness {
    harness_from_lookup(|name| std::env::var(name).ok())
}

/// Testable core of [`harness_from_env`].
pub fn harness_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Harness {
    if let Some(explicit) = lookup("RELAY_HARNESS")
        && let Ok(harness) = explicit.parse::<Harness>()
    {
        return harness;
    }
    if lookup("CLAUDECODE").is_some_and(|v| !v.trim().is_empty()) {
        return Harness::ClaudeCode;
    }
    if lookup("OPENCODE").is_some_and(|v| !v.trim().is_empty()) {
        return Harness::Opencode;
    }
    if lookup("CODEX_HOME").is_some_and(|v| !v.trim().is_empty()) {
        return Harness::Codex;
    }
    Harness::Generic
}

#[derive(Debug, Deserialize)]
struct SessionSummary {
    #[serde(default)]
    id: String,
    #[serde(default)]
    time: SessionTime,
}

#[derive(Debug, Default, Deserialize)]
struct SessionTime {
    #[serde(default)]
    updated: i64,
}

/// Looks up the most recently active session that is not yet bound to an
/// agent, within a bounded recency window.
pub struct SessionResolver {
    base_url: String,
    client: reqwest::Client,
    window: Duration,
}

impl SessionResolver {
    pub fn new(base_url: &str, timeout: Duration, window: Duration) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_owned();
        let timeout = if timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            timeout
        };
        let window = if window.is_zero() {
            Duration::from_secs(15 * 60)
        } else {
            window
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url,
            client,
            window,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    /// The most recently updated session id that is non-empty, not in
    /// `bound`, and updated within the recency window.
    pub async fn find_latest_unbound(&self, bound: &HashSet<String>) -> PushResult<Option<String>> {
        if !self.enabled() {
            return Ok(None);
        }

        let url = format!("{}/session", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| PushError::Request(format!("request session list: {error}")))?;
        if !response.status().is_success() {
            return Err(PushError::Request(format!(
                "session list status {}",
                response.status()
            )));
        }
        let mut sessions: Vec<SessionSummary> = response
            .json()
            .await
            .map_err(|error| PushError::Request(format!("decode session list: {error}")))?;
        if sessions.is_empty() {
            return Ok(None);
        }

        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));

        let now_millis = now_unix_millis();
        let window_millis = self.window.as_millis() as i64;
        for session in sessions {
            let id = session.id.trim();
            if id.is_empty() || bound.contains(id) {
                continue;
            }
            let Some(updated_millis) = unix_maybe_millis(session.time.updated) else {
                continue;
            };
            if now_millis.saturating_sub(updated_millis) > window_millis {
                continue;
            }
            return Ok(Some(id.to_owned()));
        }
        Ok(None)
    }
}

fn now_unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Harness session timestamps are milliseconds since the epoch, but older
/// builds reported seconds.
fn unix_maybe_millis(value: i64) -> Option<i64> {
    if value <= 0 {
        return None;
    }
    if value > 1_000_000_000_000 {
        Some(value)
    } else {
        Some(value * 1000)
    }
}
