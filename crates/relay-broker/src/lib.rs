//! # relay-broker — registry and delivery pipeline
//!
//! The broker owns every piece of mutable mesh state: the agents map, the
//! session index, the shared-context store, and each agent's inbound
//! queue. All of it lives behind one broker-wide mutex; transport I/O is
//! performed with the lock released and re-enters through the per-agent
//! subscription callback, which is the only path that appends to a queue.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_discovery::{ProfileFields, SearchFilter, match_profile, query_token_count};
use relay_protocol::{
    AgentProfile, AgentStatus, Harness, Message, ProfilePatch, RelayError, RelayResult, agent_id,
    normalize_project_name,
};
use relay_transport::{DeliveryFn, StreamConfig, Subscription, Transport};
use serde::Serialize;
use tracing::{debug, instrument, warn};

/// Subject prefix for per-agent delivery subjects.
pub const SUBJECT_PREFIX: &str = "relay.agent";
/// Name of the single durable stream covering all agent subjects.
pub const STREAM_NAME: &str = "RELAY_MESSAGES";
/// Retention window for the durable stream.
pub const STREAM_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_FETCH_LIMIT: usize = 10;
const DEFAULT_HISTORY_LIMIT: usize = 20;
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Stream configuration the broker ensures on startup.
pub fn relay_stream_config() -> StreamConfig {
    StreamConfig {
        name: STREAM_NAME.to_owned(),
        subjects: vec![format!("{SUBJECT_PREFIX}.>")],
        max_age: STREAM_MAX_AGE,
    }
}

/// Public view of a registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub project: String,
    pub role: String,
    pub github: String,
    pub branch: String,
    pub specialization: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
}

/// Snapshot of an agent's coordination state for team status reports.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusEntry {
    pub id: String,
    pub name: String,
    pub role: String,
    pub project: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub unread_messages: usize,
}

/// One not-yet-done agent in a readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct PendingAgent {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
}

/// Completion picture for a project.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub total_agents: usize,
    pub done_count: usize,
    pub pending_agents: Vec<PendingAgent>,
}

/// Delivery marker for a single message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageStatusReport {
    pub message_id: String,
    pub to: String,
    pub status: &'static str,
}

/// Result of a broadcast fan-out. A transport failure halts the fan-out;
/// the envelopes already sent stay in `messages` next to the error.
#[derive(Debug)]
pub struct BroadcastOutcome {
    pub messages: Vec<Message>,
    pub error: Option<RelayError>,
}

struct AgentState {
    id: String,
    profile: AgentProfile,
    subject: String,
    session_id: Option<String>,
    harness: Option<Harness>,
    queue: VecDeque<Message>,
    last_seen: DateTime<Utc>,
    last_fetch: Option<DateTime<Utc>>,
}

impl AgentState {
    fn profile_fields(&self) -> ProfileFields<'_> {
        ProfileFields {
            name: &self.profile.name,
            description: &self.profile.description,
            project: &self.profile.project,
            role: &self.profile.role,
            specialization: &self.profile.specialization,
            github: &self.profile.github,
            branch: &self.profile.branch,
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            name: self.profile.name.clone(),
            description: self.profile.description.clone(),
            project: self.profile.project.clone(),
            role: self.profile.role.clone(),
            github: self.profile.github.clone(),
            branch: self.profile.branch.clone(),
            specialization: self.profile.specialization.clone(),
            status: self.profile.status,
            last_seen: self.last_seen,
        }
    }

    fn status_entry(&self) -> AgentStatusEntry {
        AgentStatusEntry {
            id: self.id.clone(),
            name: self.profile.name.clone(),
            role: self.profile.role.clone(),
            project: self.profile.project.clone(),
            status: self.profile.status,
            last_seen: self.last_seen,
            last_fetch: self.last_fetch,
            unread_messages: self.queue.len(),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    agents: HashMap<String, AgentState>,
    subs: HashMap<String, Subscription>,
    session_index: HashMap<String, String>,
    context_store: HashMap<String, HashMap<String, String>>,
}

/// The relay mesh broker. Cheap to clone; every clone shares the same
/// registry state and transport connection.
#[derive(Clone)]
pub struct Broker {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<BrokerState>>,
}

impl Broker {
    /// Ensure the relay stream exists on the transport and return a broker
    /// bound to it.
    pub async fn start(transport: Arc<dyn Transport>) -> RelayResult<Self> {
        transport
            .ensure_stream(relay_stream_config())
            .await
            .map_err(|error| RelayError::Transport(error.to_string()))?;
        Ok(Self {
            transport,
            state: Arc::new(Mutex::new(BrokerState::default())),
        })
    }

    /// Register a new agent: validate the profile, subscribe its subject,
    /// then insert it into the registry.
    #[instrument(skip(self, patch))]
    pub async fn register_agent(&self, patch: ProfilePatch) -> RelayResult<String> {
        let mut profile = AgentProfile::from_patch(patch)?;

        let id = agent_id();
        let subject = format!("{SUBJECT_PREFIX}.{id}");
        if profile.name.is_empty() {
            profile.name = id.clone();
        }

        // The callback captures only the id and looks the agent up late,
        // so it stays valid across removal. Malformed payloads are dropped.
        let state = Arc::clone(&self.state);
        let agent = id.clone();
        let deliver: DeliveryFn = Arc::new(move |payload: &[u8]| {
            let Ok(incoming) = serde_json::from_slice::<Message>(payload) else {
                return;
            };
            let mut state = state.lock();
            let Some(recipient) = state.agents.get_mut(&agent) else {
                return;
            };
            recipient.queue.push_back(incoming);
        });

        let subscription = self
            .transport
            .subscribe(&subject, deliver)
            .await
            .map_err(|error| RelayError::Transport(error.to_string()))?;

        let mut state = self.state.lock();
        state.agents.insert(
            id.clone(),
            AgentState {
                id: id.clone(),
                profile,
                subject,
                session_id: None,
                harness: None,
                queue: VecDeque::new(),
                last_seen: Utc::now(),
                last_fetch: None,
            },
        );
        state.subs.insert(id.clone(), subscription);
        debug!(agent_id = %id, "agent registered");
        Ok(id)
    }

    /// Idempotent registration keyed by session id. An already-indexed
    /// session patches the existing agent instead of creating a duplicate;
    /// a stale index entry is dropped and replaced by a fresh registration.
    pub async fn register_or_update_by_session(
        &self,
        session_id: &str,
        patch: ProfilePatch,
    ) -> RelayResult<(String, bool)> {
        let session_id = session_id.trim().to_owned();
        if session_id.is_empty() {
            let id = self.register_agent(patch).await?;
            return Ok((id, true));
        }

        {
            let mut state = self.state.lock();
            if let Some(existing_id) = state.session_index.get(&session_id).cloned() {
                if let Some(agent) = state.agents.get_mut(&existing_id) {
                    let mut updated = agent.profile.clone();
                    updated.apply(patch);
                    updated.validate()?;
                    agent.profile = updated;
                    agent.session_id = Some(session_id);
                    agent.last_seen = Utc::now();
                    return Ok((existing_id, false));
                }
                // Stale index entry; forget it and register fresh.
                state.session_index.remove(&session_id);
            }
        }

        let id = self.register_agent(patch).await?;
        let mut state = self.state.lock();
        state.session_index.insert(session_id.clone(), id.clone());
        if let Some(agent) = state.agents.get_mut(&id) {
            agent.session_id = Some(session_id);
        }
        Ok((id, true))
    }

    /// Apply the non-empty fields of `patch` to an existing agent.
    pub fn update_agent_profile(
        &self,
        agent_id: &str,
        patch: ProfilePatch,
    ) -> RelayResult<AgentSnapshot> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(RelayError::InvalidArgument(
                "agent_id is required".to_owned(),
            ));
        }

        let mut state = self.state.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(agent_id.to_owned()))?;

        let mut updated = agent.profile.clone();
        updated.apply(patch);
        updated.validate()?;
        agent.profile = updated;
        Ok(agent.snapshot())
    }

    /// All registered agents, ordered by id.
    pub fn list_agents(&self) -> Vec<AgentSnapshot> {
        let state = self.state.lock();
        let mut out: Vec<AgentSnapshot> = state.agents.values().map(AgentState::snapshot).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Rank agents against the filter. Candidates with full query coverage
    /// form the primary tier; partial matches are returned only when no
    /// full match exists.
    pub fn find_agents(&self, filter: SearchFilter) -> Vec<AgentSnapshot> {
        let filter = filter.normalized();
        let total_tokens = query_token_count(&filter.query);

        struct Candidate {
            snapshot: AgentSnapshot,
            score: i64,
            matched_tokens: usize,
        }

        let mut all: Vec<Candidate> = {
            let state = self.state.lock();
            state
                .agents
                .values()
                .filter_map(|agent| {
                    let outcome = match_profile(&agent.profile_fields(), &filter)?;
                    Some(Candidate {
                        snapshot: agent.snapshot(),
                        score: outcome.score,
                        matched_tokens: outcome.matched_tokens,
                    })
                })
                .collect()
        };
        all.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.snapshot.id.cmp(&b.snapshot.id))
        });

        let mut primary = Vec::new();
        let mut fallback = Vec::new();
        for candidate in all {
            if total_tokens == 0 || candidate.matched_tokens >= total_tokens {
                primary.push(candidate);
            } else if candidate.matched_tokens > 0 {
                fallback.push(candidate);
            }
        }

        let chosen = if primary.is_empty() && total_tokens > 0 {
            fallback
        } else {
            primary
        };
        chosen
            .into_iter()
            .take(filter.limit)
            .map(|candidate| candidate.snapshot)
            .collect()
    }

    /// Bind an agent to a harness session. `None` harness preserves any
    /// existing binding.
    pub fn bind_session(
        &self,
        agent_id: &str,
        session_id: &str,
        harness: Option<Harness>,
    ) -> RelayResult<()> {
        let agent_id = agent_id.trim();
        let session_id = session_id.trim();
        if agent_id.is_empty() || session_id.is_empty() {
            return Err(RelayError::InvalidArgument(
                "agent_id and session_id are required".to_owned(),
            ));
        }

        let mut state = self.state.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(agent_id.to_owned()))?;
        agent.session_id = Some(session_id.to_owned());
        if let Some(harness) = harness {
            agent.harness = Some(harness);
        }
        let session_id = session_id.to_owned();
        let agent_id = agent_id.to_owned();
        state.session_index.insert(session_id, agent_id);
        Ok(())
    }

    /// The agent's session binding and harness, if any.
    pub fn session_binding(
        &self,
        agent_id: &str,
    ) -> RelayResult<(Option<String>, Option<Harness>)> {
        let state = self.state.lock();
        let agent = state
            .agents
            .get(agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(agent_id.to_owned()))?;
        let session = agent
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);
        Ok((session, agent.harness))
    }

    /// Every session id currently bound to some agent.
    pub fn bound_session_ids(&self) -> HashSet<String> {
        let state = self.state.lock();
        state
            .agents
            .values()
            .filter_map(|agent| agent.session_id.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Publish a message to the recipient's subject. The envelope reaches
    /// the recipient's queue only through the subscription callback; this
    /// method never appends directly.
    #[instrument(skip(self, body))]
    pub async fn send(&self, from: &str, to: &str, body: &str) -> RelayResult<Message> {
        let subject = {
            let mut state = self.state.lock();
            match state.agents.get_mut(from) {
                Some(sender) => sender.last_seen = Utc::now(),
                None => return Err(RelayError::SenderUnknown(from.to_owned())),
            }
            state
                .agents
                .get(to)
                .map(|agent| agent.subject.clone())
                .ok_or_else(|| RelayError::TargetUnknown(to.to_owned()))?
        };

        let message = Message::new(from, to, body);
        let payload = serde_json::to_vec(&message)
            .map_err(|error| RelayError::Transport(format!("encode envelope: {error}")))?;
        self.transport
            .publish(&subject, payload)
            .await
            .map_err(|error| RelayError::Transport(error.to_string()))?;
        debug!(message_id = %message.id, "message published");
        Ok(message)
    }

    /// Fan a message out to every agent matching the filter, best matches
    /// first, excluding the sender. Partial query matches are demoted
    /// below full matches before ranking.
    #[instrument(skip(self, body, filter))]
    pub async fn broadcast(
        &self,
        from: &str,
        body: &str,
        filter: SearchFilter,
    ) -> RelayResult<BroadcastOutcome> {
        let filter = filter.normalized();
        if from.trim().is_empty() {
            return Err(RelayError::InvalidArgument(
                "sender agent_id is required".to_owned(),
            ));
        }
        if body.trim().is_empty() {
            return Err(RelayError::InvalidArgument("body is required".to_owned()));
        }

        let total_tokens = query_token_count(&filter.query);
        let targets: Vec<String> = {
            let mut state = self.state.lock();
            match state.agents.get_mut(from) {
                Some(sender) => sender.last_seen = Utc::now(),
                None => return Err(RelayError::SenderUnknown(from.to_owned())),
            }

            let mut candidates: Vec<(String, i64)> = state
                .agents
                .values()
                .filter(|agent| agent.id != from)
                .filter_map(|agent| {
                    let outcome = match_profile(&agent.profile_fields(), &filter)?;
                    let mut score = outcome.score;
                    // Same full-match-first strategy as find_agents.
                    if total_tokens > 0 && outcome.matched_tokens < total_tokens {
                        score -= 100;
                    }
                    Some((agent.id.clone(), score))
                })
                .collect();
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            candidates.into_iter().map(|(id, _)| id).collect()
        };

        let mut messages = Vec::new();
        for target in targets {
            if messages.len() >= filter.limit {
                break;
            }
            match self.send(from, &target, body).await {
                Ok(message) => messages.push(message),
                Err(error) => {
                    warn!(%error, target = %target, "broadcast halted");
                    return Ok(BroadcastOutcome {
                        messages,
                        error: Some(error),
                    });
                }
            }
        }
        Ok(BroadcastOutcome {
            messages,
            error: None,
        })
    }

    /// Drain up to `max` messages from the head of the agent's queue.
    /// `max == 0` uses the default of 10.
    pub fn fetch(&self, agent_id: &str, max: usize) -> RelayResult<Vec<Message>> {
        let max = if max == 0 { DEFAULT_FETCH_LIMIT } else { max };

        let mut state = self.state.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(agent_id.to_owned()))?;
        let now = Utc::now();
        agent.last_seen = now;
        agent.last_fetch = Some(now);

        let count = max.min(agent.queue.len());
        Ok(agent.queue.drain(..count).collect())
    }

    /// Read the agent's messages back from the durable stream, newest
    /// window first internally, returned oldest-first. The in-memory queue
    /// is left untouched.
    pub async fn fetch_history(&self, agent_id: &str, max: usize) -> RelayResult<Vec<Message>> {
        let max = if max == 0 { DEFAULT_HISTORY_LIMIT } else { max };
        {
            let state = self.state.lock();
            if !state.agents.contains_key(agent_id) {
                return Err(RelayError::AgentNotFound(agent_id.to_owned()));
            }
        }

        let info = self
            .transport
            .stream_info()
            .await
            .map_err(|error| RelayError::Transport(error.to_string()))?;
        if info.messages == 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut sequence = info.last_sequence;
        loop {
            if out.len() >= max {
                break;
            }
            if let Some(payload) = self
                .transport
                .message_by_sequence(sequence)
                .await
                .map_err(|error| RelayError::Transport(error.to_string()))?
                && let Ok(message) = serde_json::from_slice::<Message>(&payload)
                && message.to == agent_id
            {
                out.push(message);
            }
            if sequence <= info.first_sequence {
                break;
            }
            sequence -= 1;
        }

        out.reverse();
        Ok(out)
    }

    /// Number of pending messages in an agent's queue.
    pub fn unread_count(&self, agent_id: &str) -> usize {
        let state = self.state.lock();
        state
            .agents
            .get(agent_id)
            .map_or(0, |agent| agent.queue.len())
    }

    /// Snapshot of all agents whose project contains `project`
    /// (case-insensitive); an empty filter returns everyone. Ordered by id.
    pub fn team_status(&self, project: &str) -> Vec<AgentStatusEntry> {
        let project = project.trim().to_lowercase();
        let state = self.state.lock();
        let mut out: Vec<AgentStatusEntry> = state
            .agents
            .values()
            .filter(|agent| {
                project.is_empty() || agent.profile.project.to_lowercase().contains(&project)
            })
            .map(AgentState::status_entry)
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Store a key/value pair scoped to a project. An empty value deletes
    /// the key.
    pub fn shared_context_set(&self, project: &str, key: &str, value: &str) -> RelayResult<()> {
        let project = normalize_project_name(project);
        let key = key.trim();
        if project.is_empty() {
            return Err(RelayError::InvalidArgument("project is required".to_owned()));
        }
        if key.is_empty() {
            return Err(RelayError::InvalidArgument("key is required".to_owned()));
        }

        let mut state = self.state.lock();
        let entries = state.context_store.entry(project).or_default();
        if value.is_empty() {
            entries.remove(key);
        } else {
            entries.insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }

    pub fn shared_context_get(&self, project: &str, key: &str) -> Option<String> {
        let project = normalize_project_name(project);
        let key = key.trim();
        let state = self.state.lock();
        state
            .context_store
            .get(&project)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    /// A copy of the project's shared context, keys sorted.
    pub fn shared_context_list(&self, project: &str) -> BTreeMap<String, String> {
        let project = normalize_project_name(project);
        let state = self.state.lock();
        state
            .context_store
            .get(&project)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Poll team status every two seconds until at least `min_count`
    /// agents are registered for the project or the timeout elapses.
    /// `min_count <= 0` returns immediately.
    pub async fn wait_for_agents(
        &self,
        project: &str,
        min_count: i64,
        timeout_seconds: i64,
    ) -> (Vec<AgentStatusEntry>, bool) {
        if min_count <= 0 {
            return (self.team_status(project), true);
        }
        let timeout_seconds = if timeout_seconds <= 0 {
            60
        } else {
            timeout_seconds
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_seconds as u64);

        loop {
            let agents = self.team_status(project);
            if agents.len() as i64 >= min_count {
                return (agents, true);
            }
            if tokio::time::Instant::now() >= deadline {
                return (agents, false);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Force an agent's status (used by task completion).
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> RelayResult<AgentSnapshot> {
        let mut state = self.state.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(agent_id.to_owned()))?;
        agent.profile.status = status;
        Ok(agent.snapshot())
    }

    /// Refresh an agent's liveness stamp.
    pub fn heartbeat(&self, agent_id: &str) -> RelayResult<DateTime<Utc>> {
        let mut state = self.state.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(agent_id.to_owned()))?;
        let now = Utc::now();
        agent.last_seen = now;
        Ok(now)
    }

    /// Readiness predicate: every agent registered under the normalized
    /// project name is `done`, and there is at least one of them.
    pub fn check_project_readiness(&self, project: &str) -> ReadinessReport {
        let project = normalize_project_name(project);
        let state = self.state.lock();

        let mut total = 0;
        let mut done = 0;
        let mut pending = Vec::new();
        for agent in state.agents.values() {
            if agent.profile.project != project {
                continue;
            }
            total += 1;
            if agent.profile.status == AgentStatus::Done {
                done += 1;
            } else {
                pending.push(PendingAgent {
                    id: agent.id.clone(),
                    name: agent.profile.name.clone(),
                    status: agent.profile.status,
                });
            }
        }
        pending.sort_by(|a, b| a.id.cmp(&b.id));

        ReadinessReport {
            ready: total > 0 && done == total,
            total_agents: total,
            done_count: done,
            pending_agents: pending,
        }
    }

    /// Delivery marker for a message id: `queued` while it sits in a
    /// recipient's queue, `seen` once it only remains in the durable
    /// stream, otherwise not found.
    pub async fn message_status(&self, message_id: &str) -> RelayResult<MessageStatusReport> {
        {
            let state = self.state.lock();
            for agent in state.agents.values() {
                if agent.queue.iter().any(|message| message.id == message_id) {
                    return Ok(MessageStatusReport {
                        message_id: message_id.to_owned(),
                        to: agent.id.clone(),
                        status: "queued",
                    });
                }
            }
        }

        let info = self
            .transport
            .stream_info()
            .await
            .map_err(|error| RelayError::Transport(error.to_string()))?;
        if info.messages > 0 {
            let mut sequence = info.last_sequence;
            loop {
                if let Some(payload) = self
                    .transport
                    .message_by_sequence(sequence)
                    .await
                    .map_err(|error| RelayError::Transport(error.to_string()))?
                    && let Ok(message) = serde_json::from_slice::<Message>(&payload)
                    && message.id == message_id
                {
                    return Ok(MessageStatusReport {
                        message_id: message_id.to_owned(),
                        to: message.to,
                        status: "seen",
                    });
                }
                if sequence <= info.first_sequence {
                    break;
                }
                sequence -= 1;
            }
        }
        Err(RelayError::MessageNotFound(message_id.to_owned()))
    }

    /// Remove agents whose `last_seen` is older than `max_age`,
    /// unsubscribing their subjects and dropping their session bindings.
    /// Returns the removed ids.
    #[instrument(skip(self))]
    pub fn prune_stale(&self, max_age: Duration) -> Vec<String> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            // An unrepresentably large max age means nothing is stale.
            return Vec::new();
        };

        let mut dropped_subs = Vec::new();
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock();
            let stale: Vec<String> = state
                .agents
                .values()
                .filter(|agent| agent.last_seen < cutoff)
                .map(|agent| agent.id.clone())
                .collect();
            for id in stale {
                if let Some(subscription) = state.subs.remove(&id) {
                    subscription.unsubscribe();
                    dropped_subs.push(subscription);
                }
                state.agents.remove(&id);
                state.session_index.retain(|_, bound| bound != &id);
                removed.push(id);
            }
        }
        drop(dropped_subs);
        if !removed.is_empty() {
            debug!(count = removed.len(), "stale agents pruned");
        }
        removed
    }

    /// Drop every subscription and flush the transport.
    pub async fn close(&self) {
        let subscriptions: Vec<Subscription> = {
            let mut state = self.state.lock();
            state.agents.clear();
            state.session_index.clear();
            state.subs.drain().map(|(_, sub)| sub).collect()
        };
        drop(subscriptions);
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use relay_transport::MemoryTransport;

    use super::*;

    async fn test_broker() -> Broker {
        Broker::start(Arc::new(MemoryTransport::new())).await.unwrap()
    }

    fn patch(name: &str, project: &str, role: &str, specialization: &str) -> ProfilePatch {
        ProfilePatch {
            name: Some(name.to_owned()),
            description: Some("d".to_owned()),
            project: Some(project.to_owned()),
            role: Some(role.to_owned()),
            specialization: Some(specialization.to_owned()),
            ..ProfilePatch::default()
        }
    }

    fn base_patch(name: &str) -> ProfilePatch {
        patch(name, "p", "r", "s")
    }

    async fn wait_for_queued(broker: &Broker, agent_id: &str, min_count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while broker.unread_count(agent_id) < min_count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {min_count} queued messages for {agent_id}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn register_send_and_fetch() {
        let broker = test_broker().await;

        let from = broker.register_agent(base_patch("alice")).await.unwrap();
        let to = broker.register_agent(base_patch("bob")).await.unwrap();
        let unnamed = broker.register_agent(base_patch("   ")).await.unwrap();

        let agents = broker.list_agents();
        assert_eq!(agents.len(), 3);
        assert!(agents.iter().any(|a| a.id == from && a.name == "alice"));
        assert!(agents.iter().any(|a| a.id == to && a.name == "bob"));
        assert!(agents.iter().any(|a| a.id == unnamed && a.name == unnamed));

        let message = broker.send(&from, &to, "hello").await.unwrap();
        assert!(message.id.starts_with("msg-"));
        assert_eq!(message.from, from);
        assert_eq!(message.to, to);
        assert_eq!(message.body, "hello");
        wait_for_queued(&broker, &to, 1).await;

        let got = broker.fetch(&to, 10).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, message.id);

        let empty = broker.fetch(&to, 10).unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn send_rejects_unknown_sender() {
        let broker = test_broker().await;
        let to = broker.register_agent(base_patch("bob")).await.unwrap();

        let err = broker.send("ag-missing", &to, "hello").await.unwrap_err();
        assert!(err.to_string().contains("sender agent not found"));
        // Nothing was published for the failed send.
        let history = broker.fetch_history(&to, 20).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn send_rejects_unknown_target() {
        let broker = test_broker().await;
        let from = broker.register_agent(base_patch("alice")).await.unwrap();

        let err = broker.send(&from, "ag-missing", "hello").await.unwrap_err();
        assert!(err.to_string().contains("target agent not found"));
    }

    #[tokio::test]
    async fn fetch_default_limit_and_drain() {
        let broker = test_broker().await;
        let from = broker.register_agent(base_patch("source")).await.unwrap();
        let to = broker.register_agent(base_patch("sink")).await.unwrap();

        for _ in 0..12 {
            broker.send(&from, &to, "payload").await.unwrap();
        }
        wait_for_queued(&broker, &to, 12).await;

        let first = broker.fetch(&to, 0).unwrap();
        assert_eq!(first.len(), 10);
        let second = broker.fetch(&to, 10).unwrap();
        assert_eq!(second.len(), 2);

        // Per-sender order is preserved end to end.
        let mut ids: Vec<&str> = first.iter().chain(second.iter()).map(|m| m.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 12);
    }

    #[tokio::test]
    async fn fuzzy_discovery_filters_and_updates() {
        let broker = test_broker().await;
        let x = broker
            .register_agent(patch("x", "civitas", "backend engineer", "go-backend"))
            .await
            .unwrap();
        let y = broker
            .register_agent(patch("y", "civitas", "frontend engineer", "react"))
            .await
            .unwrap();

        broker
            .update_agent_profile(
                &x,
                ProfilePatch {
                    specialization: Some("distributed-systems".to_owned()),
                    ..ProfilePatch::default()
                },
            )
            .unwrap();

        let found = broker.find_agents(SearchFilter {
            query: "distributed".to_owned(),
            project: "civitas".to_owned(),
            ..SearchFilter::default()
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, x);
        assert_eq!(found[0].specialization, "distributed-systems");

        let found = broker.find_agents(SearchFilter {
            role: "frontend engineer".to_owned(),
            ..SearchFilter::default()
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, y);
    }

    #[tokio::test]
    async fn find_agents_breaks_score_ties_by_id() {
        let broker = test_broker().await;
        let mut ids = vec![
            broker.register_agent(base_patch("twin-a")).await.unwrap(),
            broker.register_agent(base_patch("twin-b")).await.unwrap(),
            broker.register_agent(base_patch("twin-c")).await.unwrap(),
        ];
        ids.sort();

        // Same profile shape → same score; ordering must be by id.
        let first = broker.find_agents(SearchFilter {
            project: "p".to_owned(),
            ..SearchFilter::default()
        });
        let again = broker.find_agents(SearchFilter {
            project: "p".to_owned(),
            ..SearchFilter::default()
        });
        let first_ids: Vec<&str> = first.iter().map(|a| a.id.as_str()).collect();
        let again_ids: Vec<&str> = again.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(first_ids, again_ids);
        assert_eq!(first_ids, ids.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn find_agents_empty_filter_returns_everyone() {
        let broker = test_broker().await;
        for name in ["a", "b", "c"] {
            broker.register_agent(base_patch(name)).await.unwrap();
        }
        let found = broker.find_agents(SearchFilter::default());
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn filtered_broadcast_reaches_only_matching_agents() {
        let broker = test_broker().await;
        let lead = broker
            .register_agent(patch("lead", "civitas", "lead", "coordination"))
            .await
            .unwrap();
        let backend = broker
            .register_agent(patch("b", "civitas", "backend engineer", "go-backend"))
            .await
            .unwrap();
        let frontend = broker
            .register_agent(patch("f", "civitas", "frontend engineer", "react"))
            .await
            .unwrap();

        let outcome = broker
            .broadcast(
                &lead,
                "sync",
                SearchFilter {
                    project: "civitas".to_owned(),
                    role: "backend".to_owned(),
                    ..SearchFilter::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].to, backend);

        wait_for_queued(&broker, &backend, 1).await;
        assert_eq!(broker.unread_count(&frontend), 0);
        assert_eq!(broker.unread_count(&lead), 0);
    }

    #[tokio::test]
    async fn broadcast_requires_sender_and_body() {
        let broker = test_broker().await;
        let err = broker
            .broadcast("", "x", SearchFilter::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sender agent_id is required"));

        let from = broker.register_agent(base_patch("a")).await.unwrap();
        let err = broker
            .broadcast(&from, "  ", SearchFilter::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("body is required"));
    }

    #[tokio::test]
    async fn session_dedup_updates_existing_agent() {
        let broker = test_broker().await;
        let (id1, created) = broker
            .register_or_update_by_session("sess-1", base_patch("alice"))
            .await
            .unwrap();
        assert!(created);

        let (id2, created) = broker
            .register_or_update_by_session(
                "sess-1",
                ProfilePatch {
                    specialization: Some("new".to_owned()),
                    ..ProfilePatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert!(!created);

        let agents = broker.list_agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, id1);
        assert_eq!(agents[0].specialization, "new");

        let (session, _) = broker.session_binding(&id1).unwrap();
        assert_eq!(session.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn stale_session_index_entry_registers_fresh() {
        let broker = test_broker().await;
        let (id1, _) = broker
            .register_or_update_by_session("sess-1", base_patch("alice"))
            .await
            .unwrap();

        // Prune the agent out from under the index entry.
        let removed = broker.prune_stale(Duration::ZERO);
        assert_eq!(removed, vec![id1.clone()]);

        let (id2, created) = broker
            .register_or_update_by_session("sess-1", base_patch("alice"))
            .await
            .unwrap();
        assert!(created);
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn history_is_oldest_first_and_nondestructive() {
        let broker = test_broker().await;
        let a = broker.register_agent(base_patch("a")).await.unwrap();
        let b = broker.register_agent(base_patch("b")).await.unwrap();

        for body in ["one", "two", "three"] {
            broker.send(&a, &b, body).await.unwrap();
        }
        wait_for_queued(&broker, &b, 3).await;

        let history = broker.fetch_history(&b, 20).await.unwrap();
        let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
        // The queue was not drained by the history read.
        assert_eq!(broker.unread_count(&b), 3);
    }

    #[tokio::test]
    async fn history_survives_registry_restart() {
        let transport = Arc::new(MemoryTransport::new());
        let broker = Broker::start(transport.clone()).await.unwrap();
        let a = broker.register_agent(base_patch("a")).await.unwrap();
        let b = broker.register_agent(base_patch("b")).await.unwrap();
        for body in ["one", "two", "three"] {
            broker.send(&a, &b, body).await.unwrap();
        }
        broker.close().await;
        drop(broker);

        // A new registry over the same stream: the queues are gone but the
        // durable history is not. Re-adopt the old id so the lookup
        // resolves.
        let rebuilt = Broker::start(transport).await.unwrap();
        let readopted = AgentProfile::from_patch(base_patch("b")).unwrap();
        rebuilt.state.lock().agents.insert(
            b.clone(),
            AgentState {
                id: b.clone(),
                profile: readopted,
                subject: format!("{SUBJECT_PREFIX}.{b}"),
                session_id: None,
                harness: None,
                queue: VecDeque::new(),
                last_seen: Utc::now(),
                last_fetch: None,
            },
        );

        let history = rebuilt.fetch_history(&b, 20).await.unwrap();
        let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn history_on_empty_stream_is_empty() {
        let broker = test_broker().await;
        let a = broker.register_agent(base_patch("a")).await.unwrap();
        let history = broker.fetch_history(&a, 20).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn shared_context_set_get_delete_list() {
        let broker = test_broker().await;
        broker
            .shared_context_set("My Project", "api-prefix", "/v2")
            .unwrap();
        broker
            .shared_context_set("my-project", "spec-path", "docs/spec.md")
            .unwrap();

        assert_eq!(
            broker.shared_context_get("MyProject", "api-prefix").as_deref(),
            Some("/v2")
        );

        let entries = broker.shared_context_list("my-project");
        assert_eq!(entries.len(), 2);

        // Empty value deletes.
        broker.shared_context_set("my-project", "api-prefix", "").unwrap();
        assert!(broker.shared_context_get("my-project", "api-prefix").is_none());
        assert_eq!(broker.shared_context_list("my-project").len(), 1);

        assert!(broker.shared_context_set("", "k", "v").is_err());
        assert!(broker.shared_context_set("p", "  ", "v").is_err());
    }

    #[tokio::test]
    async fn team_status_filters_by_project_fragment() {
        let broker = test_broker().await;
        broker
            .register_agent(patch("a", "civitas", "backend", "go"))
            .await
            .unwrap();
        broker
            .register_agent(patch("b", "orbital", "backend", "go"))
            .await
            .unwrap();

        assert_eq!(broker.team_status("").len(), 2);
        let filtered = broker.team_status("civ");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].project, "civitas");
        assert_eq!(filtered[0].unread_messages, 0);
        assert!(filtered[0].last_fetch.is_none());
    }

    #[tokio::test]
    async fn wait_for_agents_zero_min_count_returns_immediately() {
        let broker = test_broker().await;
        let started = tokio::time::Instant::now();
        let (agents, met) = broker.wait_for_agents("p", 0, 60).await;
        assert!(met);
        assert!(agents.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn wait_for_agents_meets_threshold() {
        let broker = test_broker().await;
        broker.register_agent(base_patch("a")).await.unwrap();
        broker.register_agent(base_patch("b")).await.unwrap();
        let (agents, met) = broker.wait_for_agents("p", 2, 5).await;
        assert!(met);
        assert_eq!(agents.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_agents_times_out() {
        let broker = test_broker().await;
        broker.register_agent(base_patch("a")).await.unwrap();
        let (agents, met) = broker.wait_for_agents("p", 2, 3).await;
        assert!(!met);
        assert_eq!(agents.len(), 1);
    }

    #[tokio::test]
    async fn readiness_requires_all_done_and_nonempty() {
        let broker = test_broker().await;
        assert!(!broker.check_project_readiness("civitas").ready);

        let a = broker
            .register_agent(patch("a", "civitas", "backend", "go"))
            .await
            .unwrap();
        let b = broker
            .register_agent(patch("b", "civitas", "frontend", "react"))
            .await
            .unwrap();

        let report = broker.check_project_readiness("civitas");
        assert!(!report.ready);
        assert_eq!(report.total_agents, 2);
        assert_eq!(report.done_count, 0);
        assert_eq!(report.pending_agents.len(), 2);

        broker.set_status(&a, AgentStatus::Done).unwrap();
        broker.set_status(&b, AgentStatus::Done).unwrap();
        let report = broker.check_project_readiness("Civitas");
        assert!(report.ready);
        assert_eq!(report.done_count, 2);
        assert!(report.pending_agents.is_empty());
    }

    #[tokio::test]
    async fn message_status_tracks_queued_then_seen() {
        let broker = test_broker().await;
        let a = broker.register_agent(base_patch("a")).await.unwrap();
        let b = broker.register_agent(base_patch("b")).await.unwrap();

        let message = broker.send(&a, &b, "ping").await.unwrap();
        wait_for_queued(&broker, &b, 1).await;

        let report = broker.message_status(&message.id).await.unwrap();
        assert_eq!(report.status, "queued");
        assert_eq!(report.to, b);

        broker.fetch(&b, 10).unwrap();
        let report = broker.message_status(&message.id).await.unwrap();
        assert_eq!(report.status, "seen");

        let err = broker.message_status("msg-unknown").await.unwrap_err();
        assert!(err.to_string().contains("message not found"));
    }

    #[tokio::test]
    async fn prune_removes_subscriptions_and_bindings() {
        let broker = test_broker().await;
        let a = broker.register_agent(base_patch("a")).await.unwrap();
        let b = broker.register_agent(base_patch("b")).await.unwrap();
        broker.bind_session(&a, "sess-a", None).unwrap();

        let mut removed = broker.prune_stale(Duration::ZERO);
        removed.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(removed, expected);

        assert!(broker.list_agents().is_empty());
        assert!(broker.bound_session_ids().is_empty());
        let err = broker.send(&a, &b, "x").await.unwrap_err();
        assert!(err.to_string().contains("sender agent not found"));
    }

    #[tokio::test]
    async fn heartbeat_advances_last_seen() {
        let broker = test_broker().await;
        let a = broker.register_agent(base_patch("a")).await.unwrap();
        let before = broker.list_agents()[0].last_seen;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stamped = broker.heartbeat(&a).unwrap();
        assert!(stamped >= before);
        assert!(broker.heartbeat("ag-missing").is_err());
    }

    #[tokio::test]
    async fn bind_session_preserves_harness_when_unset() {
        let broker = test_broker().await;
        let a = broker.register_agent(base_patch("a")).await.unwrap();

        broker
            .bind_session(&a, "sess-1", Some(Harness::Opencode))
            .unwrap();
        let (session, harness) = broker.session_binding(&a).unwrap();
        assert_eq!(session.as_deref(), Some("sess-1"));
        assert_eq!(harness, Some(Harness::Opencode));

        // Re-bind without a harness keeps the existing one.
        broker.bind_session(&a, "sess-2", None).unwrap();
        let (session, harness) = broker.session_binding(&a).unwrap();
        assert_eq!(session.as_deref(), Some("sess-2"));
        assert_eq!(harness, Some(Harness::Opencode));

        assert!(broker.bind_session(&a, "  ", None).is_err());
        assert!(broker.bind_session("ag-missing", "sess", None).is_err());
    }

    #[tokio::test]
    async fn update_profile_renormalizes_and_validates() {
        let broker = test_broker().await;
        let a = broker.register_agent(base_patch("a")).await.unwrap();

        let updated = broker
            .update_agent_profile(
                &a,
                ProfilePatch {
                    project: Some("My NewProject".to_owned()),
                    ..ProfilePatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.project, "my-new-project");

        let err = broker
            .update_agent_profile("ag-missing", ProfilePatch::default())
            .unwrap_err();
        assert!(err.to_string().contains("agent not found"));
    }
}
