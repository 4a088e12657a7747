//! Agent profiles, status values, normalization and patching.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Coordination status of an agent. Transitions are driven only by
/// profile updates or by declaring a task complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Blocked,
    Done,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Done => "done",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "idle" => Ok(AgentStatus::Idle),
            "working" => Ok(AgentStatus::Working),
            "blocked" => Ok(AgentStatus::Blocked),
            "done" => Ok(AgentStatus::Done),
            other => Err(RelayError::InvalidArgument(format!(
                "invalid status: {other} (expected idle|working|blocked|done)"
            ))),
        }
    }
}

/// A registered agent's profile. Always stored normalized: `project` in
/// its canonical hyphenated form, every other string field trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub description: String,
    pub project: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub github: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    pub specialization: String,
    pub status: AgentStatus,
}

impl AgentProfile {
    /// Build a full profile from a patch, normalizing and validating the
    /// required fields. Missing status defaults to `idle`; a blank name is
    /// left empty for the registry to substitute the agent id.
    pub fn from_patch(patch: ProfilePatch) -> RelayResult<Self> {
        let mut profile = Self {
            name: String::new(),
            description: String::new(),
            project: String::new(),
            role: String::new(),
            github: String::new(),
            branch: String::new(),
            specialization: String::new(),
            status: AgentStatus::Idle,
        };
        profile.apply(patch);
        profile.validate()?;
        Ok(profile)
    }

    /// Apply the non-empty fields of `patch`, then re-normalize.
    pub fn apply(&mut self, patch: ProfilePatch) {
        if let Some(name) = non_empty(patch.name) {
            self.name = name;
        }
        if let Some(description) = non_empty(patch.description) {
            self.description = description;
        }
        if let Some(project) = non_empty(patch.project) {
            self.project = project;
        }
        if let Some(role) = non_empty(patch.role) {
            self.role = role;
        }
        if let Some(github) = non_empty(patch.github) {
            self.github = github;
        }
        if let Some(branch) = non_empty(patch.branch) {
            self.branch = branch;
        }
        if let Some(specialization) = non_empty(patch.specialization) {
            self.specialization = specialization;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        self.name = self.name.trim().to_owned();
        self.description = self.description.trim().to_owned();
        self.project = normalize_project_name(&self.project);
        self.role = self.role.trim().to_owned();
        self.github = self.github.trim().to_owned();
        self.branch = self.branch.trim().to_owned();
        self.specialization = self.specialization.trim().to_owned();
    }

    /// Required fields must be non-empty after normalization.
    pub fn validate(&self) -> RelayResult<()> {
        if self.description.is_empty() {
            return Err(RelayError::InvalidArgument(
                "description is required".to_owned(),
            ));
        }
        if self.project.is_empty() {
            return Err(RelayError::InvalidArgument("project is required".to_owned()));
        }
        if self.role.is_empty() {
            return Err(RelayError::InvalidArgument("role is required".to_owned()));
        }
        if self.specialization.is_empty() {
            return Err(RelayError::InvalidArgument(
                "specialization is required".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A partial profile: only the populated fields apply. Used both as the
/// full profile on registration and as the patch on updates.
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub project: Option<String>,
    pub role: Option<String>,
    pub github: Option<String>,
    pub branch: Option<String>,
    pub specialization: Option<String>,
    pub status: Option<AgentStatus>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Canonical project-name form: lowercase, camel/Pascal boundaries split
/// with hyphens, spaces and underscores replaced by hyphens, hyphen runs
/// collapsed, leading/trailing hyphens trimmed. Idempotent.
pub fn normalize_project_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_uppercase() {
            let prev = chars[i - 1];
            if prev.is_lowercase() {
                out.push('-');
            } else if prev.is_uppercase() && chars.get(i + 1).is_some_and(|next| next.is_lowercase())
            {
                out.push('-');
            }
        }
        out.push(c);
    }

    let mut normalized = String::with_capacity(out.len());
    let mut last_was_hyphen = false;
    for c in out.chars() {
        let mapped = match c {
            ' ' | '_' => '-',
            other => other,
        };
        if mapped == '-' {
            if !last_was_hyphen {
                normalized.push('-');
            }
            last_was_hyphen = true;
        } else {
            for lower in mapped.to_lowercase() {
                normalized.push(lower);
            }
            last_was_hyphen = false;
        }
    }

    normalized.trim_matches('-').to_owned()
}
