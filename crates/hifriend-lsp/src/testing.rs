//! Test doubles for the host, launcher and client seams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::client::{
    ClientFactory, ClientOptions, ClientStart, DisconnectNotifier, ProtocolClient, SignalSender,
};
use crate::diagnostics::LogSink;
use crate::error::{LspError, LspResult};
use crate::host::{Host, WorkspaceFolder};
use crate::launcher::{Launcher, ServerMode};
use crate::process::{ProcessHandle, ProcessSignal, ServerProcess};
use crate::transport::ServerTransport;

const PIPE_CAPACITY: usize = 64 * 1024;
const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `check` until it returns `Some`, panicking after a few seconds.
pub async fn wait_until<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Log sink that keeps every line.
#[derive(Debug, Default)]
pub struct RecordingLog {
    lines: Mutex<Vec<String>>,
}

impl RecordingLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub async fn wait_for_lines(&self, count: usize) {
        wait_until("log lines", || (self.lines.lock().unwrap().len() >= count).then_some(())).await;
    }
}

impl LogSink for RecordingLog {
    fn append_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

struct FakeProcessInner {
    stdout: Mutex<Option<DuplexStream>>,
    stderr: Mutex<Option<DuplexStream>>,
    exit: Mutex<Option<oneshot::Sender<Option<i32>>>>,
    signals: Mutex<Vec<ProcessSignal>>,
}

impl FakeProcessInner {
    fn close(&self, code: Option<i32>) {
        self.stdout.lock().unwrap().take();
        self.stderr.lock().unwrap().take();
        if let Some(exit) = self.exit.lock().unwrap().take() {
            let _ = exit.send(code);
        }
    }
}

/// A scripted server process.
///
/// Any signal delivered through its handle is recorded and ends the process
/// as if it was killed.
pub struct FakeProcess {
    inner: Arc<FakeProcessInner>,
    process: Mutex<Option<ServerProcess>>,
}

impl FakeProcess {
    pub fn new() -> Self {
        let (stdout_writer, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(FakeProcessInner {
            stdout: Mutex::new(Some(stdout_writer)),
            stderr: Mutex::new(Some(stderr_writer)),
            exit: Mutex::new(Some(exit_tx)),
            signals: Mutex::new(Vec::new()),
        });

        let reaper = inner.clone();
        tokio::spawn(async move {
            while let Some(signal) = control_rx.recv().await {
                reaper.signals.lock().unwrap().push(signal);
                reaper.close(None);
            }
        });

        let process = ServerProcess {
            handle: ProcessHandle::new(Some(4242), control_tx),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit: exit_rx,
        };

        Self {
            inner,
            process: Mutex::new(Some(process)),
        }
    }

    /// Hand out the process end; only once.
    pub fn take_process(&self) -> ServerProcess {
        self.process
            .lock()
            .unwrap()
            .take()
            .expect("process already taken")
    }

    pub async fn write_stdout(&self, bytes: &[u8]) {
        write_to(&self.inner.stdout, bytes).await;
    }

    pub async fn write_stderr(&self, bytes: &[u8]) {
        write_to(&self.inner.stderr, bytes).await;
    }

    /// Close both streams and report `code`.
    pub fn exit(&self, code: Option<i32>) {
        self.inner.close(code);
    }

    /// Report `code` but leave both streams open, as when a helper the
    /// server started still holds its pipes.
    pub fn report_exit(&self, code: Option<i32>) {
        if let Some(exit) = self.inner.exit.lock().unwrap().take() {
            let _ = exit.send(code);
        }
    }

    /// Signals received so far, waiting until there is at least one.
    pub async fn signals(&self) -> Vec<ProcessSignal> {
        wait_until("a process signal", || {
            let signals = self.inner.signals.lock().unwrap();
            (!signals.is_empty()).then(|| signals.clone())
        })
        .await
    }
}

impl Default for FakeProcess {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_to(slot: &Mutex<Option<DuplexStream>>, bytes: &[u8]) {
    let writer = slot.lock().unwrap().take();
    if let Some(mut writer) = writer {
        writer.write_all(bytes).await.unwrap();
        writer.flush().await.unwrap();
        *slot.lock().unwrap() = Some(writer);
    }
}

/// What a fake server does when launched.
#[derive(Debug, Clone)]
pub enum Script {
    /// Print `stdout`, then exit with `code`.
    Reply { stdout: String, code: Option<i32> },
    /// Print `stdout` and keep running.
    Serve { stdout: String },
    /// Print nothing and keep running.
    Hang,
    /// Fail to spawn.
    Missing,
}

impl Script {
    pub fn version(version: &str) -> Self {
        Self::Reply {
            stdout: format!("hi-friend {version}\n"),
            code: Some(0),
        }
    }

    pub fn fail(code: i32) -> Self {
        Self::Reply {
            stdout: String::new(),
            code: Some(code),
        }
    }

    pub fn record(port: u16) -> Self {
        Self::Serve {
            stdout: format!(r#"{{"host":"127.0.0.1","port":{port},"pid":4242}}"#),
        }
    }
}

/// A recorded launch.
#[derive(Clone)]
pub struct Launch {
    pub dir: PathBuf,
    pub mode: ServerMode,
    pub process: Arc<FakeProcess>,
}

/// Launcher running [`Script`]s instead of processes.
pub struct FakeLauncher {
    scripts: Mutex<HashMap<ServerMode, Script>>,
    launches: Mutex<Vec<Launch>>,
}

impl FakeLauncher {
    pub fn new(version: Script, lsp: Script) -> Self {
        Self {
            scripts: Mutex::new(HashMap::from([
                (ServerMode::Version, version),
                (ServerMode::Lsp, lsp),
            ])),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, mode: ServerMode, script: Script) {
        self.scripts.lock().unwrap().insert(mode, script);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launches_of(&self, mode: ServerMode) -> Vec<Launch> {
        self.launches()
            .into_iter()
            .filter(|launch| launch.mode == mode)
            .collect()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, dir: &Path, mode: ServerMode) -> LspResult<ServerProcess> {
        let script = self.scripts.lock().unwrap()[&mode].clone();
        if let Script::Missing = script {
            return Err(LspError::Spawn {
                command: format!("hi-friend {}", mode.arg()),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let fake = Arc::new(FakeProcess::new());
        let process = fake.take_process();
        self.launches.lock().unwrap().push(Launch {
            dir: dir.to_path_buf(),
            mode,
            process: fake.clone(),
        });

        tokio::spawn(async move {
            match script {
                Script::Reply { stdout, code } => {
                    fake.write_stdout(stdout.as_bytes()).await;
                    fake.exit(code);
                }
                Script::Serve { stdout } => fake.write_stdout(stdout.as_bytes()).await,
                Script::Hang | Script::Missing => {}
            }
        });

        Ok(process)
    }
}

/// Things the supervisor did to the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    ClearLog,
    Progress(String),
    HideProgress,
    ShowToggle,
    HideToggle,
    ShowError,
}

/// Host that records every UI call.
#[derive(Debug, Default)]
pub struct RecordingHost {
    folders: Mutex<Option<Vec<WorkspaceFolder>>>,
    events: Mutex<Vec<UiEvent>>,
    log: RecordingLog,
}

impl RecordingHost {
    pub fn with_folders(folders: Vec<WorkspaceFolder>) -> Self {
        let host = Self::default();
        host.set_folders(Some(folders));
        host
    }

    pub fn set_folders(&self, folders: Option<Vec<WorkspaceFolder>>) {
        *self.folders.lock().unwrap() = folders;
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &UiEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.log.lines()
    }

    fn record(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl LogSink for RecordingHost {
    fn append_line(&self, line: &str) {
        self.log.append_line(line);
    }
}

impl Host for RecordingHost {
    fn workspace_folders(&self) -> Option<Vec<WorkspaceFolder>> {
        self.folders.lock().unwrap().clone()
    }

    fn clear_log(&self) {
        self.record(UiEvent::ClearLog);
    }

    fn show_progress(&self, message: &str) {
        self.record(UiEvent::Progress(message.to_string()));
    }

    fn hide_progress(&self) {
        self.record(UiEvent::HideProgress);
    }

    fn show_toggle(&self) {
        self.record(UiEvent::ShowToggle);
    }

    fn hide_toggle(&self) {
        self.record(UiEvent::HideToggle);
    }

    fn show_error(&self) {
        self.record(UiEvent::ShowError);
    }
}

/// A client started by [`RecordingClients`].
pub struct StartedClient {
    pub folder: WorkspaceFolder,
    pub version: String,
    pub options: ClientOptions,
    pub signals: Option<SignalSender>,
    pub disconnected: DisconnectNotifier,
    pub stopped: Arc<AtomicBool>,
}

struct FakeClient {
    transport: Mutex<Option<ServerTransport>>,
    stopped: Arc<AtomicBool>,
}

impl ProtocolClient for FakeClient {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.transport.lock().unwrap().take();
    }
}

/// Client factory that records every start.
///
/// While held, starts wait until [`RecordingClients::release`] is called.
pub struct RecordingClients {
    started: Mutex<Vec<StartedClient>>,
    pending: AtomicUsize,
    gate: watch::Sender<bool>,
    fail: AtomicBool,
}

impl Default for RecordingClients {
    fn default() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            gate: watch::channel(true).0,
            fail: AtomicBool::new(false),
        }
    }
}

impl RecordingClients {
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_starts(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Starts that have begun, finished or not.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn stopped_count(&self) -> usize {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stopped.load(Ordering::SeqCst))
            .count()
    }

    /// Inspect the `index`th started client.
    pub fn with_client<T>(&self, index: usize, f: impl FnOnce(&StartedClient) -> T) -> T {
        f(&self.started.lock().unwrap()[index])
    }
}

#[async_trait]
impl ClientFactory for RecordingClients {
    async fn start(&self, request: ClientStart) -> LspResult<Box<dyn ProtocolClient>> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if self.fail.load(Ordering::SeqCst) {
            return Err(LspError::client("refused"));
        }

        let stopped = Arc::new(AtomicBool::new(false));
        self.started.lock().unwrap().push(StartedClient {
            folder: request.folder,
            version: request.version,
            options: request.options,
            signals: request.signals,
            disconnected: request.disconnected,
            stopped: stopped.clone(),
        });

        Ok(Box::new(FakeClient {
            transport: Mutex::new(Some(request.transport)),
            stopped,
        }))
    }
}
