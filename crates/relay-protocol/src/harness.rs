//! Harness labels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// The external runtime hosting an agent. Determines which push adapter,
/// if any, is used for notification delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Harness {
    Opencode,
    ClaudeCode,
    Codex,
    #[default]
    Generic,
}

impl Harness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Harness::Opencode => "opencode",
            Harness::ClaudeCode => "claude-code",
            Harness::Codex => "codex",
            Harness::Generic => "generic",
        }
    }

    /// Generic harnesses have no push channel.
    pub fn is_generic(&self) -> bool {
        matches!(self, Harness::Generic)
    }
}

impl fmt::Display for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Harness {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "opencode" => Ok(Harness::Opencode),
            "claude-code" => Ok(Harness::ClaudeCode),
            "codex" => Ok(Harness::Codex),
            "generic" => Ok(Harness::Generic),
            other => Err(RelayError::InvalidArgument(format!(
                "invalid harness: {other} (expected opencode|claude-code|codex|generic)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_harnesses() {
        assert_eq!("opencode".parse::<Harness>().unwrap(), Harness::Opencode);
        assert_eq!(
            "claude-code".parse::<Harness>().unwrap(),
            Harness::ClaudeCode
        );
        assert_eq!("codex".parse::<Harness>().unwrap(), Harness::Codex);
        assert_eq!("generic".parse::<Harness>().unwrap(), Harness::Generic);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!("emacs".parse::<Harness>().is_err());
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&Harness::ClaudeCode).unwrap();
        assert_eq!(json, "\"claude-code\"");
    }

    #[test]
    fn default_is_generic() {
        assert!(Harness::default().is_generic());
    }
}
