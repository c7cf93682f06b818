//! `hi-friend --lsp` address negotiation.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::config::RecordBuffering;
use crate::diagnostics::{drain, forward_lines, LineBuffer, SharedLog};
use crate::error::{LspError, LspResult};
use crate::process::{wait_exit, ExitReceiver, ProcessHandle, ServerProcess, INTERRUPT_GRACE};

/// Address record printed by a server started in `--lsp` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRecord {
    pub host: String,
    pub port: u16,
    pub pid: u32,
}

impl HandshakeRecord {
    /// `host:port`, suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A successful handshake: where to connect, and how to stop the server.
#[derive(Debug)]
pub struct Handshake {
    pub record: HandshakeRecord,
    server: ProcessHandle,
    exit: Option<ExitReceiver>,
}

impl Handshake {
    pub fn new(record: HandshakeRecord, server: ProcessHandle) -> Self {
        Self {
            record,
            server,
            exit: None,
        }
    }

    fn with_exit(mut self, exit: ExitReceiver) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Interrupt the server process.
    pub fn stop(&self) {
        self.server.interrupt();
    }

    /// Interrupt the server and wait for it to exit, killing it once
    /// [`INTERRUPT_GRACE`] has passed.
    ///
    /// Returns the exit code; `None` when the server was killed or its exit
    /// cannot be observed.
    pub async fn shutdown(mut self) -> Option<i32> {
        self.stop();
        let mut exit = self.exit.take()?;
        match tokio::time::timeout(INTERRUPT_GRACE, &mut exit).await {
            Ok(code) => code.unwrap_or(None),
            Err(_) => {
                debug!(pid = ?self.server.pid(), "server ignored the interrupt, killing it");
                self.server.kill();
                wait_exit(exit).await
            }
        }
    }

    /// Handle of the serving process.
    pub fn server(&self) -> &ProcessHandle {
        &self.server
    }

    pub fn into_parts(self) -> (HandshakeRecord, ProcessHandle) {
        (self.record, self.server)
    }
}

/// How much pre-record output is kept for the failure log.
const OUTPUT_TAIL: usize = 4 * 1024;

/// Looks for the address record in the server's stdout.
#[derive(Debug)]
struct RecordScanner {
    buffering: RecordBuffering,
    /// Last [`OUTPUT_TAIL`] bytes of output.
    tail: Vec<u8>,
    lines: LineBuffer,
}

impl RecordScanner {
    fn new(buffering: RecordBuffering) -> Self {
        Self {
            buffering,
            tail: Vec::new(),
            lines: LineBuffer::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Option<HandshakeRecord> {
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > OUTPUT_TAIL {
            self.tail.drain(..self.tail.len() - OUTPUT_TAIL);
        }

        if let Ok(record) = serde_json::from_slice::<HandshakeRecord>(chunk) {
            return Some(record);
        }

        match self.buffering {
            RecordBuffering::Chunk => None,
            RecordBuffering::Lines => self
                .lines
                .push(chunk)
                .iter()
                .find_map(|line| serde_json::from_str(line).ok()),
        }
    }
}

/// Wait for the server to print its address.
///
/// Every stdout chunk is parsed on its own and the first one that is a
/// complete record wins; with [`RecordBuffering::Lines`] complete buffered
/// lines are tried as well. Stderr is forwarded to `log` line by line. Exiting
/// before a record appears is a [`LspError::LaunchFailed`].
///
/// There is no timeout here; callers bound the wait.
pub async fn negotiate(
    process: ServerProcess,
    log: SharedLog,
    buffering: RecordBuffering,
) -> LspResult<Handshake> {
    let ServerProcess {
        handle,
        mut stdout,
        stderr,
        mut exit,
    } = process;

    tokio::spawn(async move { forward_lines(stderr, log, "").await });

    let mut scanner = RecordScanner::new(buffering);
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        tokio::select! {
            biased;
            read = stdout.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    trace!(bytes = n, "handshake output");
                    if let Some(record) = scanner.push(&buf[..n]) {
                        debug!(host = %record.host, port = record.port, pid = record.pid, "handshake record received");
                        // Keep the pipe empty so the server never blocks on it.
                        tokio::spawn(drain(stdout));
                        return Ok(Handshake::new(record, handle).with_exit(exit));
                    }
                }
            },
            code = &mut exit => {
                let code = code.unwrap_or(None);
                debug!(?code, "server exited during handshake");
                return Err(LspError::launch_failed(code));
            }
        }
    }

    let code = wait_exit(exit).await;
    debug!(
        ?code,
        output = %String::from_utf8_lossy(&scanner.tail),
        "server closed stdout without an address"
    );
    Err(LspError::launch_failed(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSignal;
    use crate::testing::{FakeProcess, RecordingLog};
    use std::sync::Arc;

    const RECORD: &str = r#"{"host":"127.0.0.1","port":4000,"pid":123}"#;

    fn expected() -> HandshakeRecord {
        HandshakeRecord {
            host: "127.0.0.1".to_string(),
            port: 4000,
            pid: 123,
        }
    }

    #[tokio::test]
    async fn test_garbage_chunk_then_record() {
        let fake = FakeProcess::new();
        let process = fake.take_process();
        let log = Arc::new(RecordingLog::default());

        let task = tokio::spawn(negotiate(process, log, RecordBuffering::Chunk));
        fake.write_stdout(b"not json").await;
        // Let the negotiator consume the first chunk on its own.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        fake.write_stdout(RECORD.as_bytes()).await;

        let handshake = task.await.unwrap().unwrap();
        assert_eq!(handshake.record, expected());
        assert_eq!(handshake.record.address(), "127.0.0.1:4000");
    }

    #[tokio::test]
    async fn test_stop_interrupts_server() {
        let fake = FakeProcess::new();
        let process = fake.take_process();
        fake.write_stdout(RECORD.as_bytes()).await;

        let handshake = negotiate(process, Arc::new(RecordingLog::default()), RecordBuffering::Chunk)
            .await
            .unwrap();
        handshake.stop();

        assert_eq!(fake.signals().await, vec![ProcessSignal::Interrupt]);
    }

    #[tokio::test]
    async fn test_exit_before_record_fails() {
        let fake = FakeProcess::new();
        let process = fake.take_process();
        fake.write_stdout(b"starting...\n").await;
        fake.exit(Some(1));

        let err = negotiate(process, Arc::new(RecordingLog::default()), RecordBuffering::Chunk)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_chunk_mode_never_reassembles() {
        let mut scanner = RecordScanner::new(RecordBuffering::Chunk);
        assert_eq!(scanner.push(br#"{"host":"127.0.0.1","#), None);
        assert_eq!(scanner.push(b"\"port\":4000,\"pid\":123}\n"), None);
    }

    #[test]
    fn test_lines_mode_reassembles_split_record() {
        let mut scanner = RecordScanner::new(RecordBuffering::Lines);
        assert_eq!(scanner.push(b"booting\n{\"host\":\"127.0.0.1\","), None);
        assert_eq!(
            scanner.push(b"\"port\":4000,\"pid\":123}\n"),
            Some(expected())
        );
    }

    #[test]
    fn test_noisy_output_is_capped() {
        let mut scanner = RecordScanner::new(RecordBuffering::Chunk);
        let noise = vec![b'.'; 3 * 1024];
        for _ in 0..10 {
            assert_eq!(scanner.push(&noise), None);
        }
        assert_eq!(scanner.tail.len(), OUTPUT_TAIL);
    }

    #[test]
    fn test_whole_chunk_wins_in_both_modes() {
        for buffering in [RecordBuffering::Chunk, RecordBuffering::Lines] {
            let mut scanner = RecordScanner::new(buffering);
            assert_eq!(scanner.push(format!("{RECORD}\n").as_bytes()), Some(expected()));
        }
    }

    #[tokio::test]
    async fn test_stderr_lines_reach_log() {
        let fake = FakeProcess::new();
        let process = fake.take_process();
        let log = Arc::new(RecordingLog::default());

        fake.write_stderr(b"loading gems").await;
        fake.write_stderr(b"...\nready\n").await;
        fake.write_stdout(RECORD.as_bytes()).await;
        negotiate(process, log.clone(), RecordBuffering::Chunk)
            .await
            .unwrap();

        log.wait_for_lines(2).await;
        assert_eq!(log.lines(), vec!["loading gems...", "ready"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_server_handshake_and_interrupt() {
        use crate::launcher::{LaunchEnvironment, Launcher, ProcessLauncher, ServerMode};
        use hifriend_test_utils::{content, TestProject};

        let project = TestProject::new()
            .with_server_script(&content::server_script("0.31.0", 4100))
            .build();
        let launcher = ProcessLauncher::new(None).with_environment(LaunchEnvironment::direct());
        let log = Arc::new(RecordingLog::default());

        let process = launcher.launch(project.path(), ServerMode::Lsp).unwrap();
        let pid = process.handle.pid();
        let handshake = negotiate(process, log.clone(), RecordBuffering::Chunk)
            .await
            .unwrap();

        assert_eq!(handshake.record.port, 4100);
        assert_eq!(Some(handshake.record.pid), pid);
        log.wait_for_lines(1).await;
        assert_eq!(log.lines(), vec!["booting"]);

        handshake.stop();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stopped_server_finishes_on_interrupt_alone() {
        use crate::launcher::{LaunchEnvironment, Launcher, ProcessLauncher, ServerMode};
        use crate::testing::wait_until;
        use hifriend_test_utils::{content, TestProject};

        let project = TestProject::new()
            .with_server_script(&content::graceful_server_script("0.31.0", 4101))
            .build();
        let launcher = ProcessLauncher::new(None).with_environment(LaunchEnvironment::direct());

        let process = launcher.launch(project.path(), ServerMode::Lsp).unwrap();
        let handshake = negotiate(process, Arc::new(RecordingLog::default()), RecordBuffering::Chunk)
            .await
            .unwrap();

        handshake.stop();
        drop(handshake);

        wait_until("the server's interrupt handler", || {
            project.file_exists("stopped").then_some(())
        })
        .await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_waits_for_graceful_exit() {
        use crate::launcher::{LaunchEnvironment, Launcher, ProcessLauncher, ServerMode};
        use hifriend_test_utils::{content, TestProject};

        let project = TestProject::new()
            .with_server_script(&content::graceful_server_script("0.31.0", 4102))
            .build();
        let launcher = ProcessLauncher::new(None).with_environment(LaunchEnvironment::direct());

        let process = launcher.launch(project.path(), ServerMode::Lsp).unwrap();
        let handshake = negotiate(process, Arc::new(RecordingLog::default()), RecordBuffering::Chunk)
            .await
            .unwrap();

        assert_eq!(handshake.shutdown().await, Some(0));
        assert!(project.file_exists("stopped"));
    }
}
