//! # relay-tools — the fixed tool dispatch surface
//!
//! A data-driven table of named operations over the broker: each entry
//! pairs a [`ToolDef`] (name, description, typed string arguments) with a
//! handler. Results are compact JSON documents; every failure becomes a
//! single-line `{"error": …}` envelope rather than a protocol-level
//! exception. Push delivery is dispatched here, after the originating
//! send has succeeded and the broker lock is long released.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relay_broker::Broker;
use relay_discovery::SearchFilter;
use relay_protocol::{AgentStatus, Harness, Message, ProfilePatch, RelayError, RelayResult};
use relay_push::{PushMessage, PushRegistry, SessionResolver, harness_from_env, session_from_headers};
use serde_json::{Value, json};
use tracing::warn;

mod args;

use args::{int_arg, limit_arg, optional_str, raw_str, required_str};

/// One typed string input of a tool.
#[derive(Debug, Clone, Copy)]
pub struct ArgDef {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

/// One operation in the tool table.
#[derive(Debug, Clone, Copy)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub args: &'static [ArgDef],
}

/// Request-scoped metadata available to handlers (HTTP headers when the
/// surface is served over HTTP, empty over stdio).
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    headers: Vec<(String, String)>,
}

impl RequestMeta {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Session id carried by the request headers, if any.
    pub fn session_id(&self) -> Option<String> {
        session_from_headers(
            self.headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )
    }
}

/// One invocation of a tool.
pub struct ToolCall {
    pub arguments: Value,
    pub meta: RequestMeta,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = RelayResult<Value>> + Send + 'a>>;
type ToolHandler = for<'a> fn(&'a ToolSurface, &'a ToolCall) -> HandlerFuture<'a>;

macro_rules! tool {
    ($def:expr, $method:ident) => {{
        fn run<'a>(surface: &'a ToolSurface, call: &'a ToolCall) -> HandlerFuture<'a> {
            Box::pin(surface.$method(call))
        }
        ($def, run as ToolHandler)
    }};
}

const ARG_AGENT_ID: ArgDef = ArgDef {
    name: "agent_id",
    required: true,
    description: "Agent id to operate on.",
};

const PROFILE_ARGS: [ArgDef; 7] = [
    ArgDef {
        name: "name",
        required: false,
        description: "Display name for this agent.",
    },
    ArgDef {
        name: "description",
        required: true,
        description: "Who this agent is and what they handle.",
    },
    ArgDef {
        name: "project",
        required: true,
        description: "Project name/context for this agent.",
    },
    ArgDef {
        name: "role",
        required: true,
        description: "Role in project (e.g., backend engineer).",
    },
    ArgDef {
        name: "github",
        required: false,
        description: "GitHub handle/org this agent operates in.",
    },
    ArgDef {
        name: "branch",
        required: false,
        description: "Current or primary git branch.",
    },
    ArgDef {
        name: "specialization",
        required: true,
        description: "Primary specialization/skill domain.",
    },
];

const FILTER_ARGS: [ArgDef; 4] = [
    ArgDef {
        name: "query",
        required: false,
        description: "Free text search across profile fields.",
    },
    ArgDef {
        name: "project",
        required: false,
        description: "Project filter.",
    },
    ArgDef {
        name: "role",
        required: false,
        description: "Role filter.",
    },
    ArgDef {
        name: "specialization",
        required: false,
        description: "Specialization filter.",
    },
];

const TOOL_TABLE: &[(ToolDef, ToolHandler)] = &[
    tool!(
        ToolDef {
            name: "register_agent",
            description: "Register an agent profile and return an agent_id.",
            args: &[
                PROFILE_ARGS[0],
                PROFILE_ARGS[1],
                PROFILE_ARGS[2],
                PROFILE_ARGS[3],
                PROFILE_ARGS[4],
                PROFILE_ARGS[5],
                PROFILE_ARGS[6],
                ArgDef {
                    name: "session_id",
                    required: false,
                    description: "Harness session id to bind immediately; auto-detected when omitted.",
                },
                ArgDef {
                    name: "harness",
                    required: false,
                    description: "Harness type (opencode|claude-code|codex|generic); inferred when omitted.",
                },
            ],
        },
        handle_register_agent
    ),
    tool!(
        ToolDef {
            name: "update_agent_profile",
            description: "Update agent profile fields when new info becomes known.",
            args: &[
                ARG_AGENT_ID,
                ArgDef {
                    name: "name",
                    required: false,
                    description: "Updated display name.",
                },
                ArgDef {
                    name: "description",
                    required: false,
                    description: "Updated description.",
                },
                ArgDef {
                    name: "project",
                    required: false,
                    description: "Updated project.",
                },
                ArgDef {
                    name: "role",
                    required: false,
                    description: "Updated role.",
                },
                ArgDef {
                    name: "github",
                    required: false,
                    description: "Updated GitHub handle/org.",
                },
                ArgDef {
                    name: "branch",
                    required: false,
                    description: "Updated branch.",
                },
                ArgDef {
                    name: "specialization",
                    required: false,
                    description: "Updated specialization.",
                },
                ArgDef {
                    name: "status",
                    required: false,
                    description: "Updated status (idle|working|blocked|done).",
                },
            ],
        },
        handle_update_agent_profile
    ),
    tool!(
        ToolDef {
            name: "list_agents",
            description: "List all registered agents and their profiles.",
            args: &[],
        },
        handle_list_agents
    ),
    tool!(
        ToolDef {
            name: "find_agents",
            description: "Find relevant agents by query/profile filters.",
            args: &[
                FILTER_ARGS[0],
                FILTER_ARGS[1],
                FILTER_ARGS[2],
                FILTER_ARGS[3],
                ArgDef {
                    name: "max",
                    required: false,
                    description: "Max number of agents to return (default 20).",
                },
            ],
        },
        handle_find_agents
    ),
    tool!(
        ToolDef {
            name: "send_message",
            description: "Send a message from one agent to another over the mesh.",
            args: &[
                ArgDef {
                    name: "from",
                    required: true,
                    description: "Sender agent_id.",
                },
                ArgDef {
                    name: "to",
                    required: true,
                    description: "Recipient agent_id.",
                },
                ArgDef {
                    name: "body",
                    required: true,
                    description: "Message body.",
                },
            ],
        },
        handle_send_message
    ),
    tool!(
        ToolDef {
            name: "broadcast_message",
            description: "Broadcast a message to relevant agents using profile filters.",
            args: &[
                ArgDef {
                    name: "from",
                    required: true,
                    description: "Sender agent_id.",
                },
                ArgDef {
                    name: "body",
                    required: true,
                    description: "Message body.",
                },
                FILTER_ARGS[0],
                FILTER_ARGS[1],
                FILTER_ARGS[2],
                FILTER_ARGS[3],
                ArgDef {
                    name: "max",
                    required: false,
                    description: "Max recipients (default 20).",
                },
            ],
        },
        handle_broadcast_message
    ),
    tool!(
        ToolDef {
            name: "fetch_messages",
            description: "Fetch pending messages for an agent.",
            args: &[
                ARG_AGENT_ID,
                ArgDef {
                    name: "max",
                    required: false,
                    description: "Max number of messages to fetch (default 10).",
                },
            ],
        },
        handle_fetch_messages
    ),
    tool!(
        ToolDef {
            name: "fetch_message_history",
            description: "Fetch durable message history for an agent without draining the in-memory queue.",
            args: &[
                ARG_AGENT_ID,
                ArgDef {
                    name: "max",
                    required: false,
                    description: "Max number of historical messages to return (default 20).",
                },
            ],
        },
        handle_fetch_message_history
    ),
    tool!(
        ToolDef {
            name: "bind_session",
            description: "Bind an agent_id to a harness session_id for push delivery.",
            args: &[
                ARG_AGENT_ID,
                ArgDef {
                    name: "session_id",
                    required: false,
                    description: "Harness session id. If omitted, detected from request headers.",
                },
                ArgDef {
                    name: "harness",
                    required: false,
                    description: "Harness type; an existing binding is preserved when omitted.",
                },
            ],
        },
        handle_bind_session
    ),
    tool!(
        ToolDef {
            name: "get_session_binding",
            description: "Get the currently bound session for an agent_id.",
            args: &[ARG_AGENT_ID],
        },
        handle_get_session_binding
    ),
    tool!(
        ToolDef {
            name: "get_team_status",
            description: "Snapshot of all agents' status, optionally filtered by project.",
            args: &[ArgDef {
                name: "project",
                required: false,
                description: "Project name fragment to filter by.",
            }],
        },
        handle_get_team_status
    ),
    tool!(
        ToolDef {
            name: "shared_context",
            description: "Set, get, or list small per-project key/value context.",
            args: &[
                ArgDef {
                    name: "action",
                    required: true,
                    description: "One of set|get|list.",
                },
                ArgDef {
                    name: "project",
                    required: true,
                    description: "Project the context is scoped to.",
                },
                ArgDef {
                    name: "key",
                    required: false,
                    description: "Context key (required for set/get).",
                },
                ArgDef {
                    name: "value",
                    required: false,
                    description: "Context value; empty deletes the key.",
                },
            ],
        },
        handle_shared_context
    ),
    tool!(
        ToolDef {
            name: "wait_for_agents",
            description: "Block until enough agents are registered for a project.",
            args: &[
                ArgDef {
                    name: "project",
                    required: true,
                    description: "Project to wait on.",
                },
                ArgDef {
                    name: "min_count",
                    required: false,
                    description: "Agent threshold (default 2; 0 returns immediately).",
                },
                ArgDef {
                    name: "timeout_seconds",
                    required: false,
                    description: "Give up after this many seconds (default 60).",
                },
            ],
        },
        handle_wait_for_agents
    ),
    tool!(
        ToolDef {
            name: "declare_task_complete",
            description: "Mark an agent's task as done.",
            args: &[
                ARG_AGENT_ID,
                ArgDef {
                    name: "summary",
                    required: false,
                    description: "Short completion summary.",
                },
            ],
        },
        handle_declare_task_complete
    ),
    tool!(
        ToolDef {
            name: "check_project_readiness",
            description: "Check whether every agent on a project has declared completion.",
            args: &[ArgDef {
                name: "project",
                required: true,
                description: "Project to check.",
            }],
        },
        handle_check_project_readiness
    ),
    tool!(
        ToolDef {
            name: "heartbeat_agent",
            description: "Refresh an agent's liveness timestamp.",
            args: &[ARG_AGENT_ID],
        },
        handle_heartbeat_agent
    ),
    tool!(
        ToolDef {
            name: "get_message_status",
            description: "Delivery marker for a message id.",
            args: &[ArgDef {
                name: "message_id",
                required: true,
                description: "Message id to look up.",
            }],
        },
        handle_get_message_status
    ),
];

/// The fixed tool surface. Owns the broker handle, the push registry,
/// and the optional session resolver.
pub struct ToolSurface {
    broker: Broker,
    push: Arc<PushRegistry>,
    resolver: Option<Arc<SessionResolver>>,
}

impl ToolSurface {
    pub fn new(
        broker: Broker,
        push: Arc<PushRegistry>,
        resolver: Option<Arc<SessionResolver>>,
    ) -> Self {
        Self {
            broker,
            push,
            resolver,
        }
    }

    /// The operation table, for protocol-level tool listings.
    pub fn definitions() -> impl Iterator<Item = &'static ToolDef> {
        TOOL_TABLE.iter().map(|(def, _)| def)
    }

    /// Invoke a tool by name. Always yields a JSON document: the tool's
    /// result on success, an `{"error": …}` envelope otherwise.
    pub async fn call(&self, name: &str, arguments: Value, meta: RequestMeta) -> Value {
        let Some((_, handler)) = TOOL_TABLE.iter().find(|(def, _)| def.name == name) else {
            return json!({ "error": format!("unknown tool: {name}") });
        };
        let call = ToolCall { arguments, meta };
        match handler(self, &call).await {
            Ok(result) => result,
            Err(error) => json!({ "error": error.to_string().trim() }),
        }
    }

    async fn handle_register_agent(&self, call: &ToolCall) -> RelayResult<Value> {
        let arguments = &call.arguments;
        let patch = profile_patch_from_args(arguments, false)?;

        let mut session_id = optional_str(arguments, "session_id");
        if session_id.is_none() {
            session_id = call.meta.session_id();
        }
        if session_id.is_none()
            && let Some(resolver) = &self.resolver
            && resolver.enabled()
        {
            match resolver
                .find_latest_unbound(&self.broker.bound_session_ids())
                .await
            {
                Ok(found) => session_id = found,
                Err(error) => warn!(%error, "auto bind resolver failed"),
            }
        }

        // With a session in hand registration is idempotent: a session
        // already indexed patches its existing agent instead of minting a
        // duplicate.
        let Some(session_id) = session_id else {
            let id = self.broker.register_agent(patch).await?;
            return Ok(json!({ "agent_id": id }));
        };

        let (id, _created) = self
            .broker
            .register_or_update_by_session(&session_id, patch)
            .await?;
        // An explicit harness always applies; otherwise keep whatever an
        // earlier bind established, inferring from the environment only
        // for a first-time binding.
        let harness = match harness_argument(arguments)? {
            Some(explicit) => Some(explicit),
            None => match self.broker.session_binding(&id)? {
                (_, Some(_)) => None,
                (_, None) => Some(harness_from_env()),
            },
        };
        let mut out = json!({ "agent_id": id });
        if self.broker.bind_session(&id, &session_id, harness).is_ok()
            && let Ok((_, bound_harness)) = self.broker.session_binding(&id)
        {
            out["session_id"] = json!(session_id);
            out["harness"] = json!(bound_harness.unwrap_or_default());
        }
        Ok(out)
    }

    async fn handle_update_agent_profile(&self, call: &ToolCall) -> RelayResult<Value> {
        let agent_id = required_str(&call.arguments, "agent_id")?;
        let patch = profile_patch_from_args(&call.arguments, true)?;
        let updated = self.broker.update_agent_profile(&agent_id, patch)?;
        Ok(serde_json::to_value(updated).unwrap_or_default())
    }

    async fn handle_list_agents(&self, _call: &ToolCall) -> RelayResult<Value> {
        Ok(serde_json::to_value(self.broker.list_agents()).unwrap_or_default())
    }

    async fn handle_find_agents(&self, call: &ToolCall) -> RelayResult<Value> {
        let filter = search_filter_from_args(&call.arguments)?;
        Ok(serde_json::to_value(self.broker.find_agents(filter)).unwrap_or_default())
    }

    async fn handle_send_message(&self, call: &ToolCall) -> RelayResult<Value> {
        let arguments = &call.arguments;
        let from = required_str(arguments, "from")?;
        let to = required_str(arguments, "to")?;
        let body = required_str(arguments, "body")?;

        let message = self.broker.send(&from, &to, &body).await?;
        self.dispatch_push(&message).await;

        let mut out = serde_json::to_value(&message).unwrap_or_default();
        out["recipient_unread"] = json!(self.broker.unread_count(&to));
        Ok(out)
    }

    async fn handle_broadcast_message(&self, call: &ToolCall) -> RelayResult<Value> {
        let arguments = &call.arguments;
        let from = required_str(arguments, "from")?;
        let body = required_str(arguments, "body")?;
        let filter = search_filter_from_args(arguments)?;

        let outcome = self.broker.broadcast(&from, &body, filter).await?;
        if let Some(error) = outcome.error {
            return Err(error);
        }
        for message in &outcome.messages {
            self.dispatch_push(message).await;
        }

        if outcome.messages.is_empty() {
            return Ok(json!({
                "status": "warning",
                "recipients": 0,
                "messages": [],
                "hint": "no agents matched the filter; widen the query or drop a filter",
            }));
        }
        Ok(json!({
            "status": "ok",
            "recipients": outcome.messages.len(),
            "messages": outcome.messages,
        }))
    }

    async fn handle_fetch_messages(&self, call: &ToolCall) -> RelayResult<Value> {
        let agent_id = required_str(&call.arguments, "agent_id")?;
        let max = limit_arg(&call.arguments, "max", 10)?;
        let messages = self.broker.fetch(&agent_id, max)?;
        let remaining = self.broker.unread_count(&agent_id);
        Ok(json!({
            "messages": messages,
            "count": messages.len(),
            "remaining": remaining,
        }))
    }

    async fn handle_fetch_message_history(&self, call: &ToolCall) -> RelayResult<Value> {
        let agent_id = required_str(&call.arguments, "agent_id")?;
        let max = limit_arg(&call.arguments, "max", 20)?;
        let messages = self.broker.fetch_history(&agent_id, max).await?;
        Ok(serde_json::to_value(messages).unwrap_or_default())
    }

    async fn handle_bind_session(&self, call: &ToolCall) -> RelayResult<Value> {
        let arguments = &call.arguments;
        let agent_id = required_str(arguments, "agent_id")?;

        let session_id = optional_str(arguments, "session_id")
            .or_else(|| call.meta.session_id())
            .ok_or(RelayError::SessionRequired)?;

        // An explicit harness always applies; otherwise a fresh binding is
        // inferred from the environment and an existing one is preserved.
        let harness = match harness_argument(arguments)? {
            Some(explicit) => Some(explicit),
            None => match self.broker.session_binding(&agent_id)? {
                (_, Some(_)) => None,
                (_, None) => Some(harness_from_env()),
            },
        };
        self.broker.bind_session(&agent_id, &session_id, harness)?;

        let (_, bound_harness) = self.broker.session_binding(&agent_id)?;
        Ok(json!({
            "agent_id": agent_id,
            "session_id": session_id,
            "harness": bound_harness.unwrap_or_default(),
        }))
    }

    async fn handle_get_session_binding(&self, call: &ToolCall) -> RelayResult<Value> {
        let agent_id = required_str(&call.arguments, "agent_id")?;
        let (session_id, harness) = self.broker.session_binding(&agent_id)?;
        let Some(session_id) = session_id else {
            return Err(RelayError::InvalidArgument(format!(
                "no session bound for agent: {agent_id}"
            )));
        };
        Ok(json!({
            "agent_id": agent_id,
            "session_id": session_id,
            "harness": harness.unwrap_or_default(),
        }))
    }

    async fn handle_get_team_status(&self, call: &ToolCall) -> RelayResult<Value> {
        let project = optional_str(&call.arguments, "project").unwrap_or_default();
        Ok(serde_json::to_value(self.broker.team_status(&project)).unwrap_or_default())
    }

    async fn handle_shared_context(&self, call: &ToolCall) -> RelayResult<Value> {
        let arguments = &call.arguments;
        let action = required_str(arguments, "action")?;
        let project = required_str(arguments, "project")?;
        let normalized = relay_protocol::normalize_project_name(&project);

        match action.as_str() {
            "set" => {
                let key = required_str(arguments, "key")?;
                let value = raw_str(arguments, "value");
                let deleted = value.is_empty();
                self.broker.shared_context_set(&project, &key, &value)?;
                Ok(json!({
                    "status": "ok",
                    "project": normalized,
                    "key": key,
                    "deleted": deleted,
                }))
            }
            "get" => {
                let key = required_str(arguments, "key")?;
                let value = self.broker.shared_context_get(&project, &key);
                Ok(json!({
                    "project": normalized,
                    "key": key,
                    "found": value.is_some(),
                    "value": value,
                }))
            }
            "list" => {
                let entries = self.broker.shared_context_list(&project);
                Ok(json!({
                    "project": normalized,
                    "entries": entries,
                }))
            }
            other => Err(RelayError::InvalidArgument(format!(
                "invalid action: {other} (expected set|get|list)"
            ))),
        }
    }

    async fn handle_wait_for_agents(&self, call: &ToolCall) -> RelayResult<Value> {
        let arguments = &call.arguments;
        let project = required_str(arguments, "project")?;
        let min_count = int_arg(arguments, "min_count", 2)?;
        let timeout_seconds = int_arg(arguments, "timeout_seconds", 60)?;

        let (agents, met) = self
            .broker
            .wait_for_agents(&project, min_count, timeout_seconds)
            .await;
        Ok(json!({
            "met": met,
            "count": agents.len(),
            "agents": agents,
        }))
    }

    async fn handle_declare_task_complete(&self, call: &ToolCall) -> RelayResult<Value> {
        let agent_id = required_str(&call.arguments, "agent_id")?;
        let updated = self.broker.set_status(&agent_id, AgentStatus::Done)?;

        let mut out = json!({
            "ok": true,
            "agent_id": updated.id,
            "status": AgentStatus::Done,
        });
        if let Some(summary) = optional_str(&call.arguments, "summary") {
            out["summary"] = json!(summary);
        }
        Ok(out)
    }

    async fn handle_check_project_readiness(&self, call: &ToolCall) -> RelayResult<Value> {
        let project = required_str(&call.arguments, "project")?;
        let report = self.broker.check_project_readiness(&project);
        Ok(serde_json::to_value(report).unwrap_or_default())
    }

    async fn handle_heartbeat_agent(&self, call: &ToolCall) -> RelayResult<Value> {
        let agent_id = required_str(&call.arguments, "agent_id")?;
        let last_seen = self.broker.heartbeat(&agent_id)?;
        Ok(json!({
            "agent_id": agent_id,
            "last_seen": last_seen,
        }))
    }

    async fn handle_get_message_status(&self, call: &ToolCall) -> RelayResult<Value> {
        let message_id = required_str(&call.arguments, "message_id")?;
        let report = self.broker.message_status(&message_id).await?;
        Ok(serde_json::to_value(report).unwrap_or_default())
    }

    /// Fire push delivery for a successfully sent message. Only bound
    /// sessions on non-generic harnesses receive pushes; failures are
    /// logged, never surfaced to the sender.
    async fn dispatch_push(&self, message: &Message) {
        let Ok((Some(session_id), harness)) = self.broker.session_binding(&message.to) else {
            return;
        };
        let harness = harness.unwrap_or_default();
        if harness.is_generic() {
            return;
        }

        let push_message = PushMessage::from(message);
        if let Err(error) = self
            .push
            .dispatch(harness, &session_id, &message.to, &push_message)
            .await
        {
            warn!(
                %error,
                agent_id = %message.to,
                session_id = %session_id,
                "push delivery failed"
            );
        }
    }
}

fn profile_patch_from_args(arguments: &Value, allow_status: bool) -> RelayResult<ProfilePatch> {
    let status = if allow_status {
        match optional_str(arguments, "status") {
            Some(raw) => Some(raw.parse::<AgentStatus>()?),
            None => None,
        }
    } else {
        None
    };
    Ok(ProfilePatch {
        name: optional_str(arguments, "name"),
        description: optional_str(arguments, "description"),
        project: optional_str(arguments, "project"),
        role: optional_str(arguments, "role"),
        github: optional_str(arguments, "github"),
        branch: optional_str(arguments, "branch"),
        specialization: optional_str(arguments, "specialization"),
        status,
    })
}

fn search_filter_from_args(arguments: &Value) -> RelayResult<SearchFilter> {
    Ok(SearchFilter {
        query: optional_str(arguments, "query").unwrap_or_default(),
        project: optional_str(arguments, "project").unwrap_or_default(),
        role: optional_str(arguments, "role").unwrap_or_default(),
        specialization: optional_str(arguments, "specialization").unwrap_or_default(),
        limit: limit_arg(arguments, "max", 20)?,
    })
}

fn harness_argument(arguments: &Value) -> RelayResult<Option<Harness>> {
    match optional_str(arguments, "harness") {
        Some(raw) => Ok(Some(raw.parse::<Harness>()?)),
        None => Ok(None),
    }
}
