//! `serve`: supervise hi-friend and bridge the editor's stdio to it.
//!
//! The editor speaks LSP on our stdin/stdout. Messages are re-framed in both
//! directions: the editor's `initialize` handshake is remembered so a
//! restarted server can be brought up to the same state, and the two
//! `hi-friend.*` notifications from the server are routed to the supervisor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hifriend_lsp::transport::{message_method, read_message, write_message};
use hifriend_lsp::{
    ClientFactory, ClientStart, LspError, LspResult, ProcessLauncher, ProtocolClient, ServerSignal,
    SignalSender, Supervisor, SupervisorConfig, SupervisorHandle, WorkspaceFolder,
};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::host::TerminalHost;

/// Id given to the `initialize` request replayed to a restarted server, so
/// its response can be told apart and swallowed.
const REPLAY_ID: &str = "hifriend/replayed-initialize";

/// How long a restarted server gets to answer the replayed `initialize`.
const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// What the editor has told the servers so far.
#[derive(Debug, Default)]
struct EditorSession {
    initialize: Option<Value>,
    initialized: Option<Vec<u8>>,
    shutting_down: bool,
}

/// Messages that bring a new server to where the editor thinks it is.
#[derive(Debug, PartialEq)]
struct Replay {
    initialize: Vec<u8>,
    initialized: Option<Vec<u8>>,
}

impl EditorSession {
    fn observe(&mut self, message: &[u8]) {
        match message_method(message).as_deref() {
            Some("initialize") => {
                self.initialize = serde_json::from_slice(message).ok();
                self.initialized = None;
                self.shutting_down = false;
            }
            Some("initialized") => self.initialized = Some(message.to_vec()),
            Some("shutdown") | Some("exit") => self.shutting_down = true,
            _ => {}
        }
    }

    /// `None` until the editor has initialized a server.
    fn replay(&self) -> Option<Replay> {
        let mut initialize = self.initialize.clone()?;
        initialize
            .as_object_mut()?
            .insert("id".to_string(), Value::from(REPLAY_ID));
        Some(Replay {
            initialize: serde_json::to_vec(&initialize).ok()?,
            initialized: self.initialized.clone(),
        })
    }
}

fn is_replay_response(message: &[u8]) -> bool {
    serde_json::from_slice::<Value>(message)
        .map(|value| value.get("method").is_none() && value.get("id") == Some(&Value::from(REPLAY_ID)))
        .unwrap_or(false)
}

/// Protocol client that forwards an editor's streams to the server.
///
/// Only one session uses the editor streams at a time; a new session takes
/// them over once the previous one is stopped.
pub struct StdioBridge<R, W> {
    editor_in: Arc<Mutex<BufReader<R>>>,
    editor_out: Arc<Mutex<W>>,
    editor_closed: Arc<Notify>,
    session: Arc<Mutex<EditorSession>>,
}

impl StdioBridge<tokio::io::Stdin, tokio::io::Stdout> {
    /// Bridge the process's own stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> StdioBridge<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(editor_in: R, editor_out: W) -> Self {
        Self {
            editor_in: Arc::new(Mutex::new(BufReader::new(editor_in))),
            editor_out: Arc::new(Mutex::new(editor_out)),
            editor_closed: Arc::new(Notify::new()),
            session: Arc::new(Mutex::new(EditorSession::default())),
        }
    }

    /// Notified once the editor closes its end.
    pub fn editor_closed(&self) -> Arc<Notify> {
        self.editor_closed.clone()
    }
}

/// A running bridge; stopping it aborts both pumps and drops the transport.
struct BridgeClient {
    pumps: Vec<JoinHandle<()>>,
}

impl ProtocolClient for BridgeClient {
    fn stop(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Write a server message to the editor, routing signals on the way.
async fn deliver<W>(
    message: &[u8],
    signals: Option<&SignalSender>,
    editor_out: &Mutex<W>,
) -> LspResult<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(signal) = message_method(message)
        .as_deref()
        .and_then(ServerSignal::from_method)
    {
        match signals {
            Some(signals) => signals.send(signal),
            None => debug!(?signal, "signal from a server without signal support"),
        }
    }

    let mut editor_out = editor_out.lock().await;
    write_message(&mut *editor_out, message).await
}

/// Re-run the editor's `initialize` handshake on a fresh server.
///
/// The server's answer is swallowed; anything else it sends meanwhile goes to
/// the editor.
async fn replay_handshake<S, O, W>(
    replay: &Replay,
    server_in: &mut S,
    server_out: &mut O,
    signals: Option<&SignalSender>,
    editor_out: &Mutex<W>,
) -> LspResult<()>
where
    S: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    write_message(server_out, &replay.initialize).await?;
    loop {
        let Some(message) = read_message(server_in).await? else {
            return Err(LspError::client("hi-friend closed the connection during initialize"));
        };
        if is_replay_response(&message) {
            break;
        }
        deliver(&message, signals, editor_out).await?;
    }
    if let Some(initialized) = &replay.initialized {
        write_message(server_out, initialized).await?;
    }
    debug!("replayed initialize on the new server");
    Ok(())
}

#[async_trait]
impl<R, W> ClientFactory for StdioBridge<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn start(&self, request: ClientStart) -> LspResult<Box<dyn ProtocolClient>> {
        let ClientStart {
            folder,
            version,
            transport,
            options,
            signals,
            disconnected,
        } = request;
        info!(
            folder = %folder.name,
            %version,
            addr = %transport.addr(),
            trace = ?options.trace,
            "bridging editor to hi-friend"
        );
        debug!(options = ?options, "client options");

        let (server_in, mut server_out) = tokio::io::split(transport);
        let mut server_in = BufReader::new(server_in);

        let replay = self.session.lock().await.replay();
        if let Some(replay) = replay {
            tokio::time::timeout(
                REPLAY_TIMEOUT,
                replay_handshake(
                    &replay,
                    &mut server_in,
                    &mut server_out,
                    signals.as_ref(),
                    &*self.editor_out,
                ),
            )
            .await
            .map_err(|_| LspError::client("hi-friend did not answer the replayed initialize"))??;
        }

        let editor_in = self.editor_in.clone();
        let editor_closed = self.editor_closed.clone();
        let session = self.session.clone();
        let upstream = tokio::spawn(async move {
            let mut editor_in = editor_in.lock().await;
            loop {
                let message = match read_message(&mut *editor_in).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        debug!("editor closed its input");
                        editor_closed.notify_one();
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "unreadable input from editor");
                        editor_closed.notify_one();
                        break;
                    }
                };
                session.lock().await.observe(&message);
                if let Err(e) = write_message(&mut server_out, &message).await {
                    warn!(error = %e, "failed to write to hi-friend");
                    break;
                }
            }
        });

        let editor_out = self.editor_out.clone();
        let session = self.session.clone();
        let downstream = tokio::spawn(async move {
            loop {
                let message = match read_message(&mut server_in).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        info!("hi-friend closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read from hi-friend");
                        break;
                    }
                };
                if let Err(e) = deliver(&message, signals.as_ref(), &*editor_out).await {
                    warn!(error = %e, "failed to write to editor");
                    return;
                }
            }
            if !session.lock().await.shutting_down {
                disconnected.notify();
            }
        });

        Ok(Box::new(BridgeClient {
            pumps: vec![upstream, downstream],
        }))
    }
}

/// Canonical workspace folders for the given directories.
pub fn folders(dirs: Vec<PathBuf>, cwd: PathBuf) -> anyhow::Result<Vec<WorkspaceFolder>> {
    let dirs = if dirs.is_empty() { vec![cwd] } else { dirs };
    dirs.into_iter()
        .map(|dir| {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("no such folder: {}", dir.display()))?;
            Ok(WorkspaceFolder::local(dir))
        })
        .collect()
}

/// Run the supervisor until Ctrl-C or until the editor goes away.
///
/// On Unix, SIGHUP restarts the server.
pub async fn run_serve(folders: Vec<WorkspaceFolder>, config: SupervisorConfig) -> anyhow::Result<()> {
    let host = Arc::new(TerminalHost::new(folders));
    let launcher = Arc::new(ProcessLauncher::new(config.server_path().map(String::from)));
    let bridge = StdioBridge::stdio();
    let editor_closed = bridge.editor_closed();

    let supervisor = Supervisor::spawn(host, launcher, Arc::new(bridge), config);
    supervisor.ensure().await?;

    wait_for_exit(&supervisor, &editor_closed).await?;

    info!("shutting down");
    supervisor.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_exit(supervisor: &SupervisorHandle, editor_closed: &Notify) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = editor_closed.notified() => return Ok(()),
            _ = hangup.recv() => {
                info!("SIGHUP received, restarting hi-friend");
                supervisor.restart().await?;
                debug!(sessions = ?supervisor.snapshot().await?, "restarted");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_exit(_supervisor: &SupervisorHandle, editor_closed: &Notify) -> anyhow::Result<()> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = editor_closed.notified() => {}
    }
    Ok(())
}
