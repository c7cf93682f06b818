//! Session supervisor for the `hi-friend` Ruby language server.
//!
//! This crate runs one `hi-friend` server per editor workspace folder:
//! - Resolves how to invoke the server (project binstub, bundler, `PATH`)
//! - Probes `hi-friend --version` and gates on the minimum supported release
//! - Negotiates the server address from `hi-friend --lsp`
//! - Connects a TCP transport and hands it to a protocol client
//! - Tears sessions down on restart, folder removal and shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  ensure/restart  ┌────────────┐  spawn   ┌───────────┐
//! │   Host   │─────────────────▶│ Supervisor │─────────▶│ hi-friend │
//! │ (editor) │◀─────status──────│            │◀── TCP ──│  --lsp    │
//! └──────────┘                  └─────┬──────┘          └───────────┘
//!                                     │ transport
//!                                     ▼
//!                              ┌─────────────┐
//!                              │ LSP client  │
//!                              └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hifriend_lsp::{ClientFactory, Host, ProcessLauncher, Supervisor, SupervisorConfig};
//!
//! # async fn example(host: Arc<dyn Host>, clients: Arc<dyn ClientFactory>) -> anyhow::Result<()> {
//! let (config, _) = SupervisorConfig::load(None).await?;
//! let launcher = Arc::new(ProcessLauncher::new(config.server_path().map(String::from)));
//!
//! let supervisor = Supervisor::spawn(host, launcher, clients, config);
//! supervisor.ensure().await?;
//! // ...
//! supervisor.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod diagnostics;
mod error;
pub mod handshake;
mod host;
pub mod launcher;
pub mod probe;
pub mod process;
mod supervisor;
pub mod transport;
pub mod version;

#[cfg(test)]
mod testing;

pub use client::{
    ClientFactory, ClientOptions, ClientStart, DisconnectNotifier, ProtocolClient, ServerSignal,
    SignalSender,
};
pub use config::{RecordBuffering, SupervisorConfig, TraceLevel};
pub use diagnostics::{LineBuffer, LogSink, SharedLog};
pub use error::{LspError, LspResult};
pub use handshake::{negotiate, Handshake, HandshakeRecord};
pub use host::{Host, WorkspaceFolder, FILE_SCHEME};
pub use launcher::{LaunchEnvironment, LaunchPlan, Launcher, ProcessLauncher, ServerMode};
pub use probe::probe_version;
pub use process::{ProcessHandle, ProcessSignal, ServerProcess};
pub use supervisor::{
    SessionPhase, SessionSnapshot, Supervisor, SupervisorHandle, STATUS_FAILED, STATUS_NOT_CONFIGURED,
    STATUS_RUNNING, STATUS_STARTING,
};
pub use transport::ServerTransport;
pub use version::{VersionTriple, MINIMUM_SUPPORTED, SECONDARY_FILES_SINCE, SIGNALS_SINCE};

// Re-export the lsp-types used in client options
pub use lsp_types::DocumentFilter;
