//! Supervisor configuration.
//!
//! Configuration is loaded from multiple sources and merged (later wins):
//! 1. Global config: `~/.config/hifriend/config.json`
//! 2. Environment variable: `HIFRIEND_CONFIG_CONTENT`
//! 3. Project config: `hifriend.jsonc` or `hifriend.json` in the project directory
//! 4. Environment override: `HIFRIEND_SERVER_PATH`
//!
//! Files may contain `//` and `/* */` comments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LspError, LspResult};

/// Delay before a failed folder escalates to the persistent error indicator.
pub const DEFAULT_FAILED_STATUS_DELAY: Duration = Duration::from_secs(10);

/// Delay before the progress indicator is hidden (or, for old servers, the
/// toggle is shown) once a session is running.
pub const DEFAULT_TOGGLE_DELAY: Duration = Duration::from_secs(3);

/// Upper bound on the wait for the handshake record.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// How handshake output is searched for the address record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordBuffering {
    /// Each stdout chunk is parsed on its own; a record split across flushes
    /// is never found.
    #[default]
    Chunk,
    /// Complete buffered lines are parsed too.
    Lines,
}

/// Server trace level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl TraceLevel {
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }
}

impl std::str::FromStr for TraceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "messages" => Ok(Self::Messages),
            "verbose" => Ok(Self::Verbose),
            other => Err(format!("unknown trace level: {other}")),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingConfig>,
}

/// Server binary settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Explicit path to the `hi-friend` executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Trace settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TraceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<TraceLevel>,
}

/// Handshake settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandshakeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffering: Option<RecordBuffering>,
}

/// UI timing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_status_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub toggle_delay_ms: Option<u64>,
}

impl SupervisorConfig {
    /// Load configuration from all sources.
    ///
    /// Returns the merged config and the files it was read from.
    pub async fn load(project_dir: Option<&Path>) -> LspResult<(Self, Vec<PathBuf>)> {
        let mut config = Self::default();
        let mut sources = Vec::new();

        if let Some(global_dir) = Self::global_config_dir() {
            for name in ["config.json", "hifriend.json", "hifriend.jsonc"] {
                let path = global_dir.join(name);
                if path.exists() {
                    config = config.merge(Self::load_file(&path).await?);
                    sources.push(path);
                    break;
                }
            }
        }

        if let Ok(content) = std::env::var("HIFRIEND_CONFIG_CONTENT") {
            config = config.merge(Self::parse_jsonc(&content, "<env>")?);
        }

        if let Some(dir) = project_dir {
            for name in ["hifriend.jsonc", "hifriend.json"] {
                let path = dir.join(name);
                if path.exists() {
                    config = config.merge(Self::load_file(&path).await?);
                    sources.push(path);
                    break;
                }
            }
        }

        if let Ok(path) = std::env::var("HIFRIEND_SERVER_PATH") {
            config = config.with_server_path(path);
        }

        Ok((config, sources))
    }

    /// Get the global config directory.
    ///
    /// On Unix, `~/.config/hifriend` is preferred when it exists.
    pub fn global_config_dir() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                let xdg_config = home.join(".config").join("hifriend");
                if xdg_config.exists() {
                    return Some(xdg_config);
                }
            }
        }

        dirs::config_dir().map(|d| d.join("hifriend"))
    }

    /// Load configuration from a file.
    pub async fn load_file(path: &Path) -> LspResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_jsonc(&content, &path.display().to_string())
    }

    /// Parse JSONC (JSON with comments).
    pub fn parse_jsonc(content: &str, source: &str) -> LspResult<Self> {
        let stripped = strip_comments(content);
        serde_json::from_str(&stripped).map_err(|e| LspError::Config {
            path: source.to_string(),
            message: e.to_string(),
        })
    }

    /// Merge another config into this one (other takes precedence).
    pub fn merge(mut self, other: Self) -> Self {
        self.server = match (self.server, other.server) {
            (Some(base), Some(other)) => Some(ServerConfig {
                path: other.path.or(base.path),
            }),
            (base, None) => base,
            (None, other) => other,
        };
        self.trace = match (self.trace, other.trace) {
            (Some(base), Some(other)) => Some(TraceConfig {
                server: other.server.or(base.server),
            }),
            (base, None) => base,
            (None, other) => other,
        };
        self.handshake = match (self.handshake, other.handshake) {
            (Some(base), Some(other)) => Some(HandshakeConfig {
                timeout_secs: other.timeout_secs.or(base.timeout_secs),
                buffering: other.buffering.or(base.buffering),
            }),
            (base, None) => base,
            (None, other) => other,
        };
        self.timing = match (self.timing, other.timing) {
            (Some(base), Some(other)) => Some(TimingConfig {
                failed_status_delay_ms: other
                    .failed_status_delay_ms
                    .or(base.failed_status_delay_ms),
                toggle_delay_ms: other.toggle_delay_ms.or(base.toggle_delay_ms),
            }),
            (base, None) => base,
            (None, other) => other,
        };
        self
    }

    /// Set the server path override.
    pub fn with_server_path(self, path: impl Into<String>) -> Self {
        self.merge(Self {
            server: Some(ServerConfig {
                path: Some(path.into()),
            }),
            ..Default::default()
        })
    }

    /// Set the trace level.
    pub fn with_trace(self, level: TraceLevel) -> Self {
        self.merge(Self {
            trace: Some(TraceConfig {
                server: Some(level),
            }),
            ..Default::default()
        })
    }

    pub fn server_path(&self) -> Option<&str> {
        self.server.as_ref()?.path.as_deref()
    }

    pub fn trace_level(&self) -> TraceLevel {
        self.trace
            .as_ref()
            .and_then(|t| t.server)
            .unwrap_or_default()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake
            .as_ref()
            .and_then(|h| h.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
    }

    pub fn record_buffering(&self) -> RecordBuffering {
        self.handshake
            .as_ref()
            .and_then(|h| h.buffering)
            .unwrap_or_default()
    }

    pub fn failed_status_delay(&self) -> Duration {
        self.timing
            .as_ref()
            .and_then(|t| t.failed_status_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FAILED_STATUS_DELAY)
    }

    pub fn toggle_delay(&self) -> Duration {
        self.timing
            .as_ref()
            .and_then(|t| t.toggle_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TOGGLE_DELAY)
    }
}

/// Strip `//` and `/* */` comments outside of string literals.
fn strip_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            result.push(c);
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => result.push(c),
        }
    }

    result
}
