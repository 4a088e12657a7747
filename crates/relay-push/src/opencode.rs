//! Prompt-injection push adapter for the opencode harness.

use std::time::Duration;

use async_trait::async_trait;
use relay_protocol::Harness;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{PushAdapter, PushError, PushMessage, PushResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Delivers notifications through the opencode HTTP API: the message is
/// injected as an async prompt into the bound session, followed by a
/// best-effort TUI toast. An empty base URL disables the adapter.
pub struct OpencodeAdapter {
    base_url: String,
    client: reqwest::Client,
    no_reply: bool,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    #[serde(default)]
    directory: String,
}

impl OpencodeAdapter {
    pub fn new(base_url: &str, timeout: Duration, no_reply: bool) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_owned();
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url,
            client,
            no_reply,
        }
    }

    async fn post_json_expect(
        &self,
        url: &str,
        body: &Value,
        expected: StatusCode,
    ) -> PushResult<()> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|error| PushError::Request(format!("http post: {error}")))?;
        if response.status() != expected {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PushError::Request(format!(
                "status {status}: {}",
                text.trim()
            )));
        }
        Ok(())
    }

    async fn session_directory(&self, session_id: &str) -> PushResult<String> {
        let url = format!("{}/session/{session_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| PushError::Request(format!("session lookup: {error}")))?;
        if response.status() != StatusCode::OK {
            return Err(PushError::Request(format!(
                "session lookup status {}",
                response.status()
            )));
        }
        let payload: SessionPayload = response
            .json()
            .await
            .map_err(|error| PushError::Request(format!("decode session: {error}")))?;
        Ok(payload.directory.trim().to_owned())
    }
}

#[async_trait]
impl PushAdapter for OpencodeAdapter {
    fn harness(&self) -> Harness {
        Harness::Opencode
    }

    fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    async fn push(
        &self,
        session_id: &str,
        agent_id: &str,
        message: &PushMessage,
    ) -> PushResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(PushError::SessionRequired);
        }

        let prompt = json!({
            "noReply": self.no_reply,
            "parts": [{
                "type": "text",
                "text": format!(
                    "New relay-mesh message for {agent_id}.\nfrom: {}\nmessage_id: {}\nbody:\n{}",
                    message.from, message.id, message.body,
                ),
            }],
        });
        let prompt_url = format!("{}/session/{session_id}/prompt_async", self.base_url);
        self.post_json_expect(&prompt_url, &prompt, StatusCode::NO_CONTENT)
            .await
            .map_err(|error| PushError::Request(format!("post prompt_async: {error}")))?;

        // Visibility signal in the opencode TUI, best effort all the way:
        // the toast targets the session's directory when it can be learned.
        let toast = json!({
            "title": "relay-mesh",
            "message": format!("New message for {agent_id} from {}", message.from),
            "variant": "info",
        });
        let toast_url = format!("{}/tui/show-toast", self.base_url);
        let request = match self.session_directory(session_id).await {
            Ok(directory) if !directory.is_empty() => self
                .client
                .post(&toast_url)
                .query(&[("directory", directory)]),
            _ => self.client.post(&toast_url),
        };
        if let Err(error) = request.json(&toast).send().await {
            debug!(%error, "toast delivery failed");
        }

        Ok(())
    }
}
