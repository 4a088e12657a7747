//! Environment-driven configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:18808";
const DEFAULT_HTTP_PATH: &str = "/mcp";
const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_AUTO_BIND_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Http,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nats_url: String,
    pub transport: TransportMode,
    pub http_addr: SocketAddr,
    pub http_path: String,
    pub opencode_url: String,
    pub push_timeout: Duration,
    pub auto_bind_window: Duration,
    pub no_reply: bool,
    pub state_dir: PathBuf,
    pub prune_max_age: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Testable core of [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let transport = match lookup_string(&lookup, "MCP_TRANSPORT", "stdio").as_str() {
            "stdio" => TransportMode::Stdio,
            "http" => TransportMode::Http,
            other => bail!("unsupported MCP_TRANSPORT: {other}"),
        };

        let http_addr_raw = lookup_string(&lookup, "MCP_HTTP_ADDR", DEFAULT_HTTP_ADDR);
        let http_addr: SocketAddr = http_addr_raw
            .parse()
            .with_context(|| format!("invalid MCP_HTTP_ADDR: {http_addr_raw}"))?;

        let http_path = lookup_string(&lookup, "MCP_HTTP_PATH", DEFAULT_HTTP_PATH);
        if !http_path.starts_with('/') {
            bail!("MCP_HTTP_PATH must start with '/': {http_path}");
        }

        let state_dir = match lookup("RELAY_STATE_DIR").filter(|dir| !dir.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => lookup("HOME")
                .filter(|home| !home.trim().is_empty())
                .map(|home| PathBuf::from(home).join(".relay-mesh"))
                .unwrap_or_else(|| PathBuf::from(".relay-mesh")),
        };

        Ok(Self {
            nats_url: lookup_string(&lookup, "NATS_URL", DEFAULT_NATS_URL),
            transport,
            http_addr,
            http_path,
            opencode_url: lookup_string(&lookup, "OPENCODE_URL", ""),
            push_timeout: lookup_duration(&lookup, "OPENCODE_PUSH_TIMEOUT", DEFAULT_PUSH_TIMEOUT),
            auto_bind_window: lookup_duration(
                &lookup,
                "OPENCODE_AUTO_BIND_WINDOW",
                DEFAULT_AUTO_BIND_WINDOW,
            ),
            no_reply: lookup_bool(&lookup, "OPENCODE_NO_REPLY", false),
            state_dir,
            prune_max_age: lookup("RELAY_PRUNE_MAX_AGE")
                .as_deref()
                .and_then(parse_duration),
        })
    }
}

fn lookup_string(lookup: &impl Fn(&str) -> Option<String>, name: &str, fallback: &str) -> String {
    lookup(name)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}

fn lookup_duration(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    fallback: Duration,
) -> Duration {
    lookup(name)
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(fallback)
}

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, fallback: bool) -> bool {
    match lookup(name).as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") | Some("y") => true,
        Some("0") | Some("false") | Some("no") | Some("n") => false,
        _ => fallback,
    }
}

/// Accepts `90` (seconds), `90s`, `15m`, or `2h`. Zero and negative
/// values are rejected.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, unit) = match raw.strip_suffix(['s', 'm', 'h']) {
        Some(digits) => (digits, &raw[raw.len() - 1..]),
        None => (raw, "s"),
    };
    let value: u64 = digits.trim().parse().ok().filter(|value| *value > 0)?;
    let seconds = match unit {
        "m" => value.checked_mul(60)?,
        "h" => value.checked_mul(3600)?,
        _ => value,
    };
    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_owned())
        }
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = Config::from_lookup(env(&[("HOME", "/home/dev")])).unwrap();
        assert_eq!(config.nats_url, DEFAULT_NATS_URL);
        assert_eq!(config.transport, TransportMode::Stdio);
        assert_eq!(config.http_addr.port(), 18808);
        assert_eq!(config.http_path, "/mcp");
        assert!(config.opencode_url.is_empty());
        assert_eq!(config.push_timeout, Duration::from_secs(15));
        assert_eq!(config.auto_bind_window, Duration::from_secs(900));
        assert!(!config.no_reply);
        assert_eq!(config.state_dir, PathBuf::from("/home/dev/.relay-mesh"));
        assert!(config.prune_max_age.is_none());
    }

    #[test]
    fn http_mode_and_overrides() {
        let config = Config::from_lookup(env(&[
            ("MCP_TRANSPORT", "http"),
            ("MCP_HTTP_ADDR", "127.0.0.1:9000"),
            ("OPENCODE_URL", "http://127.0.0.1:4097"),
            ("OPENCODE_PUSH_TIMEOUT", "30s"),
            ("OPENCODE_AUTO_BIND_WINDOW", "5m"),
            ("OPENCODE_NO_REPLY", "true"),
            ("RELAY_PRUNE_MAX_AGE", "2h"),
            ("RELAY_STATE_DIR", "/var/lib/relay"),
        ]))
        .unwrap();
        assert_eq!(config.transport, TransportMode::Http);
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.opencode_url, "http://127.0.0.1:4097");
        assert_eq!(config.push_timeout, Duration::from_secs(30));
        assert_eq!(config.auto_bind_window, Duration::from_secs(300));
        assert!(config.no_reply);
        assert_eq!(config.prune_max_age, Some(Duration::from_secs(7200)));
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/relay"));
    }

    #[test]
    fn bad_transport_and_addr_are_fatal() {
        assert!(Config::from_lookup(env(&[("MCP_TRANSPORT", "quic")])).is_err());
        assert!(Config::from_lookup(env(&[("MCP_HTTP_ADDR", "not-an-addr")])).is_err());
        assert!(Config::from_lookup(env(&[("MCP_HTTP_PATH", "mcp")])).is_err());
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("0"), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }
}
