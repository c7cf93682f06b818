//! Per-folder session lifecycle.
//!
//! A [`Supervisor`] owns the map from workspace folder to session and runs as
//! a single task. Everything that can suspend (probing, negotiating,
//! connecting, starting the client) runs in spawned tasks that report back as
//! events tagged with the generation of the session they were started for; an
//! event whose generation is no longer in the map is stale and only releases
//! whatever it carries.
//!
//! ```text
//!  Absent ──start──▶ Invoking(probe) ──version ok──▶ Invoking(handshake)
//!     ▲                  │                                │
//!     │               failure                       connected
//!     │                  │                                ▼
//!     └──────────────────┴────────────stop───────────── Running
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::{
    ClientFactory, ClientOptions, ClientStart, DisconnectNotifier, ProtocolClient, ServerSignal,
    SignalSender,
};
use crate::config::{RecordBuffering, SupervisorConfig};
use crate::diagnostics::SharedLog;
use crate::error::{LspError, LspResult};
use crate::handshake::negotiate;
use crate::host::{Host, HostLog, WorkspaceFolder};
use crate::launcher::{Launcher, ServerMode};
use crate::probe::probe_version;
use crate::process::{ProcessHandle, ServerProcess};
use crate::transport::connect;
use crate::version::{self, SIGNALS_SINCE};

pub const STATUS_STARTING: &str = "Try to start HiFriend for IDE";
pub const STATUS_RUNNING: &str = "Ruby HiFriend is running";
pub const STATUS_NOT_CONFIGURED: &str = "Ruby HiFriend is not configured";
pub const STATUS_FAILED: &str = "Ruby HiFriend failed to start";

const LOG_PREFIX: &str = "[hifriend]";

fn status_launching(version: &str) -> String {
    format!("Starting Ruby HiFriend ({version})...")
}

/// What the map holds for a folder.
enum SessionState {
    /// A probe or handshake process is in flight.
    Invoking {
        generation: u64,
        process: ProcessHandle,
    },
    /// A client is connected to the server.
    Running {
        generation: u64,
        version: String,
        client: Box<dyn ProtocolClient>,
        server: ProcessHandle,
    },
}

impl SessionState {
    fn generation(&self) -> u64 {
        match self {
            Self::Invoking { generation, .. } | Self::Running { generation, .. } => *generation,
        }
    }

    /// Kill the in-flight process, or stop the client and its server.
    fn release(&self) {
        match self {
            Self::Invoking { process, .. } => process.kill(),
            Self::Running { client, server, .. } => {
                client.stop();
                server.interrupt();
            }
        }
    }
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionPhase {
    Invoking,
    Running { version: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub folder: WorkspaceFolder,
    pub generation: u64,
    #[serde(flatten)]
    pub phase: SessionPhase,
}

enum Command {
    Ensure(oneshot::Sender<()>),
    Restart(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<Vec<SessionSnapshot>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delayed {
    HideProgress,
    EnableToggle,
}

type Established = (Box<dyn ProtocolClient>, ProcessHandle);

/// Completions and timers reported back to the supervisor task.
pub(crate) enum Event {
    Probed {
        folder: WorkspaceFolder,
        generation: u64,
        result: LspResult<String>,
    },
    Connected {
        folder: WorkspaceFolder,
        generation: u64,
        version: String,
        result: LspResult<Established>,
    },
    Signal {
        folder: WorkspaceFolder,
        generation: u64,
        signal: ServerSignal,
    },
    Disconnected {
        folder: WorkspaceFolder,
        generation: u64,
    },
    Delayed {
        folder: WorkspaceFolder,
        generation: u64,
        action: Delayed,
    },
    Escalate {
        folder: WorkspaceFolder,
    },
}

/// Handle for talking to a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    /// Reconcile sessions with the host's folders.
    pub async fn ensure(&self) -> LspResult<()> {
        self.request(Command::Ensure).await
    }

    /// Reset the UI, stop every session and start the first local folder.
    pub async fn restart(&self) -> LspResult<()> {
        self.request(Command::Restart).await
    }

    /// Stop every session and end the supervisor task.
    pub async fn shutdown(&self) -> LspResult<()> {
        self.request(Command::Shutdown).await
    }

    /// Current sessions, ordered by folder path.
    pub async fn snapshot(&self) -> LspResult<Vec<SessionSnapshot>> {
        self.request(Command::Snapshot).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> LspResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| LspError::SupervisorStopped)?;
        rx.await.map_err(|_| LspError::SupervisorStopped)
    }
}

/// Owns the folder to session map.
pub struct Supervisor {
    host: Arc<dyn Host>,
    log: SharedLog,
    launcher: Arc<dyn Launcher>,
    clients: Arc<dyn ClientFactory>,
    config: SupervisorConfig,
    sessions: HashMap<WorkspaceFolder, SessionState>,
    next_generation: u64,
    events: mpsc::UnboundedSender<Event>,
}

impl Supervisor {
    /// Start the supervisor task.
    pub fn spawn(
        host: Arc<dyn Host>,
        launcher: Arc<dyn Launcher>,
        clients: Arc<dyn ClientFactory>,
        config: SupervisorConfig,
    ) -> SupervisorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            log: Arc::new(HostLog(host.clone())),
            host,
            launcher,
            clients,
            config,
            sessions: HashMap::new(),
            next_generation: 0,
            events: events_tx,
        };
        tokio::spawn(supervisor.run(commands_rx, events_rx));

        SupervisorHandle {
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        debug!("session supervisor started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Ensure(ack)) => {
                        self.ensure();
                        let _ = ack.send(());
                    }
                    Some(Command::Restart(ack)) => {
                        self.restart();
                        let _ = ack.send(());
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.stop_all();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.stop_all();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        debug!("session supervisor stopped");
    }

    fn ensure(&mut self) {
        let Some(folders) = self.host.workspace_folders() else {
            debug!("no workspace open");
            return;
        };

        let gone: Vec<WorkspaceFolder> = self
            .sessions
            .keys()
            .filter(|folder| !folders.contains(folder))
            .cloned()
            .collect();
        for folder in gone {
            info!(folder = %folder.name, "folder removed, stopping session");
            self.stop(&folder);
        }

        // One server at a time: only the first local folder without a session.
        if let Some(folder) = folders
            .into_iter()
            .find(|folder| folder.is_local() && !self.sessions.contains_key(folder))
        {
            self.start(folder);
        }
    }

    fn restart(&mut self) {
        self.host.hide_progress();
        self.host.hide_toggle();
        self.host.clear_log();

        let Some(folders) = self.host.workspace_folders() else {
            debug!("no workspace open");
            return;
        };

        self.stop_all();
        if let Some(folder) = folders.into_iter().find(WorkspaceFolder::is_local) {
            self.start(folder);
        }
    }

    fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|(folder, state)| SessionSnapshot {
                folder: folder.clone(),
                generation: state.generation(),
                phase: match state {
                    SessionState::Invoking { .. } => SessionPhase::Invoking,
                    SessionState::Running { version, .. } => SessionPhase::Running {
                        version: version.clone(),
                    },
                },
            })
            .collect();
        sessions.sort_by(|a, b| a.folder.path.cmp(&b.folder.path));
        sessions
    }

    fn start(&mut self, folder: WorkspaceFolder) {
        self.next_generation += 1;
        let generation = self.next_generation;
        info!(folder = %folder.name, generation, "starting session");
        self.show_status(STATUS_STARTING);

        let process = match self.launcher.launch(folder.path(), ServerMode::Version) {
            Ok(process) => process,
            Err(e) => {
                self.log_error(&e);
                self.fail(folder, STATUS_NOT_CONFIGURED);
                return;
            }
        };

        self.sessions.insert(
            folder.clone(),
            SessionState::Invoking {
                generation,
                process: process.handle.clone(),
            },
        );

        let log = self.log.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = probe_version(process, log).await;
            let _ = events.send(Event::Probed {
                folder,
                generation,
                result,
            });
        });
    }

    fn stop(&mut self, folder: &WorkspaceFolder) {
        let Some(state) = self.sessions.get(folder) else {
            return;
        };
        debug!(folder = %folder.name, generation = state.generation(), "stopping session");
        state.release();
        self.sessions.remove(folder);
    }

    fn stop_all(&mut self) {
        let folders: Vec<WorkspaceFolder> = self.sessions.keys().cloned().collect();
        for folder in folders {
            self.stop(&folder);
        }
    }

    fn is_current(&self, folder: &WorkspaceFolder, generation: u64) -> bool {
        self.sessions
            .get(folder)
            .is_some_and(|state| state.generation() == generation)
    }

    fn is_running(&self, folder: &WorkspaceFolder, generation: u64) -> bool {
        matches!(
            self.sessions.get(folder),
            Some(SessionState::Running { generation: g, .. }) if *g == generation
        )
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Probed {
                folder,
                generation,
                result,
            } => self.on_probed(folder, generation, result),
            Event::Connected {
                folder,
                generation,
                version,
                result,
            } => self.on_connected(folder, generation, version, result),
            Event::Signal {
                folder,
                generation,
                signal,
            } => self.on_signal(folder, generation, signal),
            Event::Disconnected { folder, generation } => self.on_disconnected(folder, generation),
            Event::Delayed {
                folder,
                generation,
                action,
            } => {
                if !self.is_running(&folder, generation) {
                    return;
                }
                self.host.hide_progress();
                if action == Delayed::EnableToggle {
                    self.host.show_toggle();
                }
            }
            Event::Escalate { folder } => {
                if self.sessions.contains_key(&folder) {
                    debug!(folder = %folder.name, "folder recovered, not escalating");
                    return;
                }
                self.host.hide_progress();
                self.host.show_error();
            }
        }
    }

    fn on_probed(&mut self, folder: WorkspaceFolder, generation: u64, result: LspResult<String>) {
        if !self.is_current(&folder, generation) {
            debug!(folder = %folder.name, generation, "ignoring stale probe result");
            return;
        }

        let version = match result {
            Ok(version) => version,
            Err(e) => {
                warn!(folder = %folder.name, error = %e, "version probe failed");
                self.abort(folder, STATUS_NOT_CONFIGURED);
                return;
            }
        };
        self.show_status(&status_launching(&version));

        let options = match ClientOptions::for_version(&version, self.config.trace_level()) {
            Ok(options) => options,
            Err(e) => {
                self.log_error(&e);
                self.abort(folder, STATUS_FAILED);
                return;
            }
        };

        let process = match self.launcher.launch(folder.path(), ServerMode::Lsp) {
            Ok(process) => process,
            Err(e) => {
                self.log_error(&e);
                self.abort(folder, STATUS_FAILED);
                return;
            }
        };
        if let Some(SessionState::Invoking { process: slot, .. }) = self.sessions.get_mut(&folder) {
            *slot = process.handle.clone();
        }

        let signals = version::at_least(&version, SIGNALS_SINCE)
            .unwrap_or(false)
            .then(|| SignalSender::new(folder.clone(), generation, self.events.clone()));
        let disconnected =
            DisconnectNotifier::for_session(folder.clone(), generation, self.events.clone());

        let attempt = Attempt {
            log: self.log.clone(),
            clients: self.clients.clone(),
            buffering: self.config.record_buffering(),
            timeout: self.config.handshake_timeout(),
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = attempt
                .establish(
                    process,
                    folder.clone(),
                    version.clone(),
                    options,
                    signals,
                    disconnected,
                )
                .await;
            let _ = events.send(Event::Connected {
                folder,
                generation,
                version,
                result,
            });
        });
    }

    fn on_connected(
        &mut self,
        folder: WorkspaceFolder,
        generation: u64,
        version: String,
        result: LspResult<Established>,
    ) {
        if !self.is_current(&folder, generation) {
            if let Ok((client, server)) = result {
                debug!(folder = %folder.name, generation, "releasing client of a stopped session");
                client.stop();
                server.interrupt();
            }
            return;
        }

        let (client, server) = match result {
            Ok(established) => established,
            Err(e) => {
                warn!(folder = %folder.name, error = %e, "failed to start hi-friend");
                self.log_error(&e);
                self.abort(folder, STATUS_FAILED);
                return;
            }
        };

        info!(folder = %folder.name, generation, %version, "session running");
        self.show_status(STATUS_RUNNING);

        let action = if version::at_least(&version, SIGNALS_SINCE).unwrap_or(false) {
            Delayed::HideProgress
        } else {
            // No enableToggleButton notification from this server.
            Delayed::EnableToggle
        };
        self.schedule(
            self.config.toggle_delay(),
            Event::Delayed {
                folder: folder.clone(),
                generation,
                action,
            },
        );

        self.sessions.insert(
            folder,
            SessionState::Running {
                generation,
                version,
                client,
                server,
            },
        );
    }

    fn on_signal(&mut self, folder: WorkspaceFolder, generation: u64, signal: ServerSignal) {
        if !self.is_running(&folder, generation) {
            debug!(folder = %folder.name, ?signal, "ignoring signal from a stopped session");
            return;
        }

        match signal {
            ServerSignal::EnableToggleButton => {
                self.host.hide_progress();
                self.host.show_toggle();
            }
            ServerSignal::ShowErrorStatus => {
                warn!(folder = %folder.name, "server reported an error");
                self.host.hide_progress();
                self.host.show_error();
                self.stop(&folder);
            }
        }
    }

    fn on_disconnected(&mut self, folder: WorkspaceFolder, generation: u64) {
        if !self.is_running(&folder, generation) {
            debug!(folder = %folder.name, generation, "ignoring disconnect of a stopped session");
            return;
        }

        warn!(folder = %folder.name, generation, "hi-friend closed the connection");
        self.log
            .append_line(&format!("{LOG_PREFIX} hi-friend closed the connection"));
        self.abort(folder, STATUS_FAILED);
    }

    /// Drop the session after a failure and schedule escalation.
    fn abort(&mut self, folder: WorkspaceFolder, status: &str) {
        self.stop(&folder);
        self.fail(folder, status);
    }

    fn fail(&mut self, folder: WorkspaceFolder, status: &str) {
        self.show_status(status);
        self.schedule(self.config.failed_status_delay(), Event::Escalate { folder });
    }

    fn schedule(&self, delay: Duration, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn show_status(&self, message: &str) {
        self.log.append_line(&format!("{LOG_PREFIX} {message}"));
        self.host.show_progress(message);
    }

    fn log_error(&self, err: &LspError) {
        self.log.append_line(&format!("{LOG_PREFIX} {err}"));
    }
}

/// The suspending half of a session start, run off the supervisor task.
struct Attempt {
    log: SharedLog,
    clients: Arc<dyn ClientFactory>,
    buffering: RecordBuffering,
    timeout: Duration,
}

impl Attempt {
    async fn establish(
        self,
        process: ServerProcess,
        folder: WorkspaceFolder,
        version: String,
        options: ClientOptions,
        signals: Option<SignalSender>,
        disconnected: DisconnectNotifier,
    ) -> LspResult<Established> {
        let handshake = tokio::time::timeout(
            self.timeout,
            negotiate(process, self.log.clone(), self.buffering),
        )
        .await
        .map_err(|_| LspError::HandshakeTimeout {
            secs: self.timeout.as_secs(),
        })??;

        let server = handshake.server().clone();
        let transport = connect(handshake).await?;
        let client = self
            .clients
            .start(ClientStart {
                folder,
                version,
                transport,
                options,
                signals,
                disconnected,
            })
            .await?;

        Ok((client, server))
    }
}
