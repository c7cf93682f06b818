//! Session supervisor error types.

use thiserror::Error;

use crate::version::MalformedVersion;

/// Result type for supervisor operations.
pub type LspResult<T> = Result<T, LspError>;

/// Errors that abort a session.
///
/// None of these are retried: a failed session stays absent until the host
/// asks for a restart.
#[derive(Debug, Error)]
pub enum LspError {
    /// A version string could not be parsed.
    #[error(transparent)]
    MalformedVersion(#[from] MalformedVersion),

    /// The server process could not be started at all.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The server process exited (or was killed) before producing a result.
    #[error("failed to invoke hi-friend: {}", describe_exit(.code))]
    LaunchFailed { code: Option<i32> },

    /// `--version` exited cleanly but printed something unexpected.
    #[error("hi-friend --version showed unknown message: {output:?}")]
    UnrecognizedOutput { output: String },

    /// The server is older than the minimum supported release.
    #[error("hi-friend version {found} is too old; please use {minimum} or later")]
    UnsupportedVersion { found: String, minimum: String },

    /// The handshake did not produce an address in time.
    #[error("hi-friend did not report its address within {secs}s")]
    HandshakeTimeout { secs: u64 },

    /// The transport to the reported address could not be opened.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A framed protocol message could not be read.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The protocol client refused to start on the transport.
    #[error("protocol client failed: {0}")]
    Client(String),

    /// The supervisor task is no longer running.
    #[error("session supervisor has shut down")]
    SupervisorStopped,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read.
    #[error("invalid config at {path}: {message}")]
    Config { path: String, message: String },
}

impl LspError {
    /// Create a launch failure from an optional exit code.
    pub fn launch_failed(code: Option<i32>) -> Self {
        Self::LaunchFailed { code }
    }

    /// Create a framing error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a protocol client error.
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client(message.into())
    }

    /// The exit code carried by a launch failure, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::LaunchFailed { code } => *code,
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("error code {code}"),
        None => "terminated by signal".to_string(),
    }
}
