//! # relay-push — harness notification adapters
//!
//! Push delivery is a best-effort side channel: after a message lands in
//! the durable stream, the adapter matching the recipient's harness nudges
//! the bound session outside the tool-call loop. Adapter failures are
//! logged by the caller and never affect the originating send.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_protocol::{Harness, Message};
use thiserror::Error;

mod claude_code;
mod opencode;
mod resolver;

pub use claude_code::ClaudeCodeAdapter;
pub use opencode::OpencodeAdapter;
pub use resolver::{
    SESSION_HEADER_CANDIDATES, SessionResolver, harness_from_env, harness_from_lookup,
    session_from_headers,
};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("unknown harness type: {0}")]
    UnknownHarness(String),
    #[error("session id is required")]
    SessionRequired,
    #[error("push request: {0}")]
    Request(String),
    #[error("push state: {0}")]
    State(String),
}

pub type PushResult<T> = Result<T, PushError>;

/// Flattened envelope handed to adapters; `created_at` is already
/// rendered so adapters never depend on a clock type.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub created_at: String,
}

impl From<&Message> for PushMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            body: message.body.clone(),
            created_at: message.created_at.to_rfc3339(),
        }
    }
}

/// Push delivery for one harness type.
#[async_trait]
pub trait PushAdapter: Send + Sync {
    /// The harness this adapter serves.
    fn harness(&self) -> Harness;

    /// Whether the adapter is configured and ready.
    fn enabled(&self) -> bool;

    /// Deliver a notification to the target agent's bound session.
    async fn push(&self, session_id: &str, agent_id: &str, message: &PushMessage)
    -> PushResult<()>;
}

/// Adapters indexed by harness type.
#[derive(Default)]
pub struct PushRegistry {
    adapters: HashMap<Harness, Arc<dyn PushAdapter>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn PushAdapter>) {
        self.adapters.insert(adapter.harness(), adapter);
    }

    /// Dispatch to the adapter for `harness`. An unknown harness is an
    /// error; a disabled adapter is silently skipped.
    pub async fn dispatch(
        &self,
        harness: Harness,
        session_id: &str,
        agent_id: &str,
        message: &PushMessage,
    ) -> PushResult<()> {
        let adapter = self
            .adapters
            .get(&harness)
            .ok_or_else(|| PushError::UnknownHarness(harness.to_string()))?;
        if !adapter.enabled() {
            return Ok(());
        }
        adapter.push(session_id, agent_id, message).await
    }

    /// Try every enabled adapter in harness-name order, stopping at the
    /// first failure.
    pub async fn broadcast_push(
        &self,
        session_id: &str,
        agent_id: &str,
        message: &PushMessage,
    ) -> PushResult<()> {
        let mut adapters: Vec<&Arc<dyn PushAdapter>> = self.adapters.values().collect();
        adapters.sort_by_key(|adapter| adapter.harness().as_str());
        for adapter in adapters {
            if !adapter.enabled() {
                continue;
            }
            adapter
                .push(session_id, agent_id, message)
                .await
                .map_err(|error| {
                    PushError::Request(format!("{} push: {error}", adapter.harness()))
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct RecordingAdapter {
        harness: Harness,
        enabled: bool,
        calls: AtomicUsize,
        fail: bool,
    }

    impl RecordingAdapter {
        fn new(harness: Harness, enabled: bool, fail: bool) -> Self {
            Self {
                harness,
                enabled,
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl PushAdapter for RecordingAdapter {
        fn harness(&self) -> Harness {
            self.harness
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn push(&self, _: &str, _: &str, _: &PushMessage) -> PushResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PushError::Request("boom".to_owned()));
            }
            Ok(())
        }
    }

    fn sample_message() -> PushMessage {
        PushMessage {
            id: "msg-0011223344556677".to_owned(),
            from: "ag-a".to_owned(),
            to: "ag-b".to_owned(),
            body: "hello".to_owned(),
            created_at: "2026-08-02T10:00:00+00:00".to_owned(),
        }
    }

    #[tokio::test]
    async fn dispatch_unknown_harness_is_an_error() {
        let registry = PushRegistry::new();
        let err = registry
            .dispatch(Harness::Codex, "s", "ag-b", &sample_message())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown harness type: codex"));
    }

    #[tokio::test]
    async fn dispatch_skips_disabled_adapters() {
        let adapter = Arc::new(RecordingAdapter::new(Harness::Opencode, false, false));
        let mut registry = PushRegistry::new();
        registry.register(adapter.clone());

        registry
            .dispatch(Harness::Opencode, "s", "ag-b", &sample_message())
            .await
            .unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_routes_by_harness() {
        let opencode = Arc::new(RecordingAdapter::new(Harness::Opencode, true, false));
        let claude = Arc::new(RecordingAdapter::new(Harness::ClaudeCode, true, false));
        let mut registry = PushRegistry::new();
        registry.register(opencode.clone());
        registry.register(claude.clone());

        registry
            .dispatch(Harness::ClaudeCode, "s", "ag-b", &sample_message())
            .await
            .unwrap();
        assert_eq!(opencode.calls.load(Ordering::SeqCst), 0);
        assert_eq!(claude.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_push_stops_at_first_error() {
        // claude-code sorts before opencode, so its failure halts the run.
        let claude = Arc::new(RecordingAdapter::new(Harness::ClaudeCode, true, true));
        let opencode = Arc::new(RecordingAdapter::new(Harness::Opencode, true, false));
        let mut registry = PushRegistry::new();
        registry.register(claude.clone());
        registry.register(opencode.clone());

        let err = registry
            .broadcast_push("s", "ag-b", &sample_message())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("claude-code push"));
        assert_eq!(opencode.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn push_message_from_envelope() {
        let envelope = Message::new("ag-a", "ag-b", "hi");
        let push: PushMessage = (&envelope).into();
        assert_eq!(push.id, envelope.id);
        assert!(push.created_at.contains('T'));
    }
}
