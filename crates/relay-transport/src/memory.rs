//! In-process transport with the same contract as the JetStream client.
//!
//! Keeps the durable log as an in-memory vector and fans deliveries out
//! through per-subscription channels, so subject ordering matches what a
//! single-subject NATS subscription would observe.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    DeliveryFn, StreamConfig, StreamInfo, Subscription, Transport, TransportError, TransportResult,
};

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    stream: Option<StreamConfig>,
    log: Vec<StoredEntry>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    next_sequence: u64,
}

struct StoredEntry {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn ensure_stream(&self, config: StreamConfig) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.stream.is_none() {
            state.next_sequence = 1;
        }
        // Re-ensuring updates the configuration but keeps the log, the
        // way a JetStream update does.
        state.stream = Some(config);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        let mut state = self.state.lock();
        let on_stream = state
            .stream
            .as_ref()
            .ok_or(TransportError::StreamNotEnsured)?
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject));

        if on_stream {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.log.push(StoredEntry {
                sequence,
                subject: subject.to_owned(),
                payload: payload.clone(),
            });
        }

        if let Some(senders) = state.subscribers.get_mut(subject) {
            senders.retain(|sender| sender.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, deliver: DeliveryFn) -> TransportResult<Subscription> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();
        self.state
            .lock()
            .subscribers
            .entry(subject.to_owned())
            .or_default()
            .push(sender);

        let task = tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                deliver(&payload);
            }
        });
        Ok(Subscription::new(task))
    }

    async fn stream_info(&self) -> TransportResult<StreamInfo> {
        let state = self.state.lock();
        if state.stream.is_none() {
            return Err(TransportError::StreamNotEnsured);
        }
        Ok(StreamInfo {
            first_sequence: state
                .log
                .first()
                .map_or(state.next_sequence, |entry| entry.sequence),
            last_sequence: state.next_sequence.saturating_sub(1),
            messages: state.log.len() as u64,
        })
    }

    async fn message_by_sequence(&self, sequence: u64) -> TransportResult<Option<Vec<u8>>> {
        let state = self.state.lock();
        if state.stream.is_none() {
            return Err(TransportError::StreamNotEnsured);
        }
        let found = state
            .log
            .binary_search_by_key(&sequence, |entry| entry.sequence)
            .ok()
            .map(|index| state.log[index].payload.clone());
        Ok(found)
    }

    async fn close(&self) {
        self.state.lock().subscribers.clear();
    }
}

/// Subject matching with NATS semantics: `*` matches one token, a
/// trailing `>` matches the rest.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            // `>` requires at least one remaining token.
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
