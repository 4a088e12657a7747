//! State-file push adapter for the claude-code harness.
//!
//! Claude Code has no prompt-injection API, so delivery is indirect: a
//! pending-message record is appended to a well-known JSON file that the
//! harness's stop hook reads, and a desktop notification is fired as a
//! best-effort visibility signal.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use relay_protocol::Harness;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{PushAdapter, PushError, PushMessage, PushResult};

const PENDING_FILE: &str = "pending-messages.json";

/// Record shape the stop hook expects; field names are part of the
/// contract with the hook script.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingRecord {
    from: String,
    body: String,
    message_id: String,
    agent_id: String,
    created_at: String,
}

pub struct ClaudeCodeAdapter {
    state_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ClaudeCodeAdapter {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn pending_path(&self) -> PathBuf {
        self.state_dir.join(PENDING_FILE)
    }

    /// Read the current pending list; a corrupted file is treated as
    /// empty and recovered by the atomic rewrite.
    fn read_pending(&self) -> Vec<PendingRecord> {
        match std::fs::read(self.pending_path()) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Write the full pending list atomically: temp file in the same
    /// directory, fsync, rename over the target.
    fn write_pending(&self, pending: &[PendingRecord]) -> PushResult<()> {
        let payload = serde_json::to_vec_pretty(pending)
            .map_err(|error| PushError::State(format!("encode pending messages: {error}")))?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.state_dir)
            .map_err(|error| PushError::State(format!("create temp file: {error}")))?;
        temp.write_all(&payload)
            .map_err(|error| PushError::State(format!("write temp file: {error}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|error| PushError::State(format!("sync temp file: {error}")))?;
        temp.persist(self.pending_path())
            .map_err(|error| PushError::State(format!("replace state file: {error}")))?;
        Ok(())
    }

    async fn notify_desktop(&self, agent_id: &str, from: &str) {
        let text = format!("New message for {agent_id} from {from}");

        #[cfg(target_os = "linux")]
        let command = {
            let mut command = tokio::process::Command::new("notify-send");
            command.arg("relay-mesh").arg(text);
            Some(command)
        };

        #[cfg(target_os = "macos")]
        let command = {
            let script = format!(r#"display notification "{text}" with title "relay-mesh""#);
            let mut command = tokio::process::Command::new("osascript");
            command.arg("-e").arg(script);
            Some(command)
        };

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let command: Option<tokio::process::Command> = None;

        if let Some(mut command) = command
            && let Err(error) = command.status().await
        {
            debug!(%error, "desktop notification failed");
        }
    }
}

#[async_trait]
impl PushAdapter for ClaudeCodeAdapter {
    fn harness(&self) -> Harness {
        Harness::ClaudeCode
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn push(
        &self,
        _session_id: &str,
        agent_id: &str,
        message: &PushMessage,
    ) -> PushResult<()> {
        let _guard = self.write_lock.lock().await;

        std::fs::create_dir_all(&self.state_dir)
            .map_err(|error| PushError::State(format!("create state dir: {error}")))?;

        let mut pending = self.read_pending();
        pending.push(PendingRecord {
            from: message.from.clone(),
            body: message.body.clone(),
            message_id: message.id.clone(),
            agent_id: agent_id.to_owned(),
            created_at: message.created_at.clone(),
        });
        self.write_pending(&pending)?;

        self.notify_desktop(agent_id, &message.from).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(id: &str, body: &str) -> PushMessage {
        PushMessage {
            id: id.to_owned(),
            from: "ag-sender".to_owned(),
            to: "ag-target".to_owned(),
            body: body.to_owned(),
            created_at: "2026-08-02T10:00:00+00:00".to_owned(),
        }
    }

    #[tokio::test]
    async fn push_appends_pending_records() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ClaudeCodeAdapter::new(dir.path());

        adapter
            .push("sess", "ag-target", &sample_message("msg-1111111111111111", "first"))
            .await
            .unwrap();
        adapter
            .push("sess", "ag-target", &sample_message("msg-2222222222222222", "second"))
            .await
            .unwrap();

        let raw = std::fs::read(dir.path().join(PENDING_FILE)).unwrap();
        let pending: Vec<PendingRecord> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].body, "first");
        assert_eq!(pending[1].message_id, "msg-2222222222222222");
        assert_eq!(pending[1].agent_id, "ag-target");
    }

    #[tokio::test]
    async fn corrupted_state_file_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PENDING_FILE), b"{not json").unwrap();

        let adapter = ClaudeCodeAdapter::new(dir.path());
        adapter
            .push("sess", "ag-target", &sample_message("msg-3333333333333333", "fresh"))
            .await
            .unwrap();

        let raw = std::fs::read(dir.path().join(PENDING_FILE)).unwrap();
        let pending: Vec<PendingRecord> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body, "fresh");
    }

    #[tokio::test]
    async fn state_dir_is_created_on_first_push() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("claude-code");
        let adapter = ClaudeCodeAdapter::new(&nested);

        adapter
            .push("sess", "ag-target", &sample_message("msg-4444444444444444", "x"))
            .await
            .unwrap();
        assert!(nested.join(PENDING_FILE).exists());
    }

    #[test]
    fn adapter_is_always_enabled() {
        let adapter = ClaudeCodeAdapter::new("/tmp/unused");
        assert!(adapter.enabled());
        assert_eq!(adapter.harness(), Harness::ClaudeCode);
    }
}
