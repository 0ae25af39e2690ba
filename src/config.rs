//! Start-up configuration read from the environment

use crate::state_machine::ChatContext;
use std::time::Duration;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_PATH: &str = "/ws/chat";
const DEFAULT_MODELS: &[&str] = &["llama3", "phi3", "mistral"];
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the peer lives and which models may be requested
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Use `wss://` instead of `ws://`
    pub secure: bool,
    /// Static model catalog offered to the user
    pub models: Vec<String>,
    /// Initially selected model; first catalog entry when unset
    pub default_model: Option<String>,
    pub connect_timeout: Duration,
    /// Bound on a single frame write or close handshake
    pub write_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            secure: false,
            models: DEFAULT_MODELS.iter().map(ToString::to_string).collect(),
            default_model: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or invalid values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let port = match lookup("CHAT_PORT") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "Invalid CHAT_PORT, using default");
                defaults.port
            }),
            None => defaults.port,
        };

        let connect_timeout = parse_secs(&lookup, "CHAT_CONNECT_TIMEOUT_SECS")
            .unwrap_or(defaults.connect_timeout);
        let write_timeout =
            parse_secs(&lookup, "CHAT_WRITE_TIMEOUT_SECS").unwrap_or(defaults.write_timeout);

        let models = lookup("CHAT_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|models| !models.is_empty())
            .unwrap_or(defaults.models);

        Self {
            host: lookup("CHAT_HOST").unwrap_or(defaults.host),
            port,
            path: lookup("CHAT_PATH").unwrap_or(defaults.path),
            secure: lookup("CHAT_SECURE").is_some_and(|v| parse_flag(&v)),
            models,
            default_model: lookup("CHAT_DEFAULT_MODEL"),
            connect_timeout,
            write_timeout,
        }
    }

    /// Socket URL; the scheme follows the transport security setting
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    /// Model selection at start-up
    pub fn initial_selection(&self) -> Vec<String> {
        match &self.default_model {
            Some(model) if self.models.contains(model) => vec![model.clone()],
            Some(model) => {
                tracing::warn!(model = %model, "CHAT_DEFAULT_MODEL is not in the catalog, ignoring");
                self.models.first().cloned().into_iter().collect()
            }
            None => self.models.first().cloned().into_iter().collect(),
        }
    }

    pub fn context(&self) -> ChatContext {
        ChatContext::new(self.models.clone())
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid duration, using default");
            None
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
