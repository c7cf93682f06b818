//! The seam between the supervisor and the protocol client.
//!
//! The supervisor never looks at protocol messages. It hands a connected
//! [`ServerTransport`] to a [`ClientFactory`], keeps the returned
//! [`ProtocolClient`] while the session runs, and listens for the two
//! out-of-band notifications newer servers send through a [`SignalSender`].
//! A client whose connection drops reports it through a
//! [`DisconnectNotifier`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use lsp_types::DocumentFilter;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::TraceLevel;
use crate::error::LspResult;
use crate::host::{WorkspaceFolder, FILE_SCHEME};
use crate::supervisor::Event;
use crate::transport::ServerTransport;
use crate::version::{self, SECONDARY_FILES_SINCE};

/// Files the client watches and reports changes for.
pub const WATCH_GLOB: &str = "{**/*.rb,**/*.rbs}";

/// Pattern the Ruby filter is narrowed to for servers that cannot handle
/// other Ruby files.
const RUBY_FILE_PATTERN: &str = "**/*.rb";

/// Out-of-band notifications sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSignal {
    /// The server is ready for the toggle button.
    EnableToggleButton,
    /// The server hit an error it cannot recover from.
    ShowErrorStatus,
}

impl ServerSignal {
    pub const ENABLE_TOGGLE_BUTTON: &'static str = "hi-friend.enableToggleButton";
    pub const SHOW_ERROR_STATUS: &'static str = "hi-friend.showErrorStatus";

    /// Map a notification method to a signal.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            Self::ENABLE_TOGGLE_BUTTON => Some(Self::EnableToggleButton),
            Self::SHOW_ERROR_STATUS => Some(Self::ShowErrorStatus),
            _ => None,
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            Self::EnableToggleButton => Self::ENABLE_TOGGLE_BUTTON,
            Self::ShowErrorStatus => Self::SHOW_ERROR_STATUS,
        }
    }
}

/// Delivers server signals back to the session that started the client.
///
/// Signals sent after the session ended are dropped by the supervisor.
#[derive(Debug, Clone)]
pub struct SignalSender {
    folder: WorkspaceFolder,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
}

impl SignalSender {
    pub(crate) fn new(
        folder: WorkspaceFolder,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            folder,
            generation,
            events,
        }
    }

    pub fn send(&self, signal: ServerSignal) {
        let event = Event::Signal {
            folder: self.folder.clone(),
            generation: self.generation,
            signal,
        };
        if self.events.send(event).is_err() {
            trace!(?signal, "supervisor gone, signal dropped");
        }
    }
}

/// Tells the session that started a client that the server hung up.
#[derive(Clone)]
pub struct DisconnectNotifier(Arc<dyn Fn() + Send + Sync>);

impl DisconnectNotifier {
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(notify))
    }

    pub(crate) fn for_session(
        folder: WorkspaceFolder,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self::new(move || {
            let event = Event::Disconnected {
                folder: folder.clone(),
                generation,
            };
            if events.send(event).is_err() {
                trace!("supervisor gone, disconnect dropped");
            }
        })
    }

    pub fn notify(&self) {
        (self.0)()
    }
}

impl fmt::Debug for DisconnectNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DisconnectNotifier")
    }
}

/// How the protocol client should be set up for a server version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    pub document_selector: Vec<DocumentFilter>,
    pub watch_glob: String,
    pub trace: TraceLevel,
}

impl ClientOptions {
    pub fn for_version(version: &str, trace: TraceLevel) -> LspResult<Self> {
        let narrow = !version::at_least(version, SECONDARY_FILES_SINCE)?;
        let ruby = DocumentFilter {
            language: Some("ruby".to_string()),
            scheme: Some(FILE_SCHEME.to_string()),
            pattern: narrow.then(|| RUBY_FILE_PATTERN.to_string()),
        };
        let rbs = DocumentFilter {
            language: Some("rbs".to_string()),
            scheme: Some(FILE_SCHEME.to_string()),
            pattern: None,
        };

        Ok(Self {
            document_selector: vec![ruby, rbs],
            watch_glob: WATCH_GLOB.to_string(),
            trace,
        })
    }

    /// Whether the client should set up a trace sink.
    pub fn wants_trace(&self) -> bool {
        self.trace.is_enabled()
    }
}

/// Everything a client needs to start on a session.
#[derive(Debug)]
pub struct ClientStart {
    pub folder: WorkspaceFolder,
    pub version: String,
    pub transport: ServerTransport,
    pub options: ClientOptions,
    /// Present when the server sends out-of-band signals.
    pub signals: Option<SignalSender>,
    /// Call when the server closes the connection.
    pub disconnected: DisconnectNotifier,
}

/// A started protocol client owning its transport.
pub trait ProtocolClient: Send + Sync {
    /// Stop the client and close its transport.
    fn stop(&self);
}

/// Starts protocol clients.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn start(&self, request: ClientStart) -> LspResult<Box<dyn ProtocolClient>>;
}
