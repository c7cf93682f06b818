//! Running server processes.
//!
//! A [`ServerProcess`] splits a child into the pieces different owners need:
//! the output streams go to whoever reads them (prober, negotiator), the
//! [`ProcessHandle`] stays with the session state so the supervisor can kill or
//! interrupt the child at any time, and the exit code arrives on a oneshot.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// How long an interrupted process may take to exit once its last handle
/// is gone.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Boxed byte stream read from a child process.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Signals the supervisor can deliver to a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Forced termination.
    Kill,
    /// Graceful interrupt (SIGINT on Unix).
    Interrupt,
}

/// Cloneable control handle for a running server process.
///
/// Sending never blocks and never fails loudly: a process that already exited
/// simply ignores the request. Dropping the last handle kills the process,
/// unless it was interrupted, in which case it gets [`INTERRUPT_GRACE`] to
/// exit first.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<ProcessSignal>,
}

impl ProcessHandle {
    /// Build a handle around an existing control channel.
    pub fn new(pid: Option<u32>, control: mpsc::UnboundedSender<ProcessSignal>) -> Self {
        Self { pid, control }
    }

    /// OS process id, when known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forcefully terminate the process.
    pub fn kill(&self) {
        self.signal(ProcessSignal::Kill);
    }

    /// Ask the process to shut down.
    pub fn interrupt(&self) {
        self.signal(ProcessSignal::Interrupt);
    }

    fn signal(&self, signal: ProcessSignal) {
        if self.control.send(signal).is_err() {
            trace!(pid = ?self.pid, ?signal, "process already reaped");
        }
    }
}

/// Receives the exit code once the process is gone.
///
/// `None` means the process was terminated by a signal (or its reaper vanished).
pub type ExitReceiver = oneshot::Receiver<Option<i32>>;

/// A spawned server process with its streams taken apart.
pub struct ServerProcess {
    pub handle: ProcessHandle,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub exit: ExitReceiver,
}

impl ServerProcess {
    /// Take ownership of a tokio child and start reaping it in the background.
    ///
    /// The child must have been spawned with piped stdout and stderr.
    pub fn from_child(mut child: Child) -> std::io::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("no stderr"))?;

        let (handle, exit) = spawn_reaper(child);

        Ok(Self {
            handle,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
        })
    }
}

/// Wait for the exit code, treating a vanished reaper as a signal death.
pub async fn wait_exit(exit: ExitReceiver) -> Option<i32> {
    exit.await.unwrap_or(None)
}

fn spawn_reaper(mut child: Child) -> (ProcessHandle, ExitReceiver) {
    let pid = child.id();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut interrupted = false;
        let code = loop {
            tokio::select! {
                status = child.wait() => break exit_code(pid, status),
                signal = control_rx.recv() => match signal {
                    Some(ProcessSignal::Interrupt) => {
                        interrupted = true;
                        interrupt(&mut child);
                    }
                    Some(ProcessSignal::Kill) => kill(&mut child),
                    None => break detach(pid, &mut child, interrupted).await,
                },
            }
        };
        debug!(?pid, ?code, "server process exited");
        let _ = exit_tx.send(code);
    });

    (ProcessHandle::new(pid, control_tx), exit_rx)
}

/// Nobody can stop the child any more. An interrupted child gets
/// [`INTERRUPT_GRACE`] to finish on its own; anything else is killed.
async fn detach(pid: Option<u32>, child: &mut Child, interrupted: bool) -> Option<i32> {
    if interrupted {
        match tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await {
            Ok(status) => return exit_code(pid, status),
            Err(_) => debug!(?pid, "server ignored the interrupt, killing it"),
        }
    }
    kill(child);
    exit_code(pid, child.wait().await)
}

fn exit_code(pid: Option<u32>, status: std::io::Result<ExitStatus>) -> Option<i32> {
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            debug!(?pid, error = %e, "failed to wait for server process");
            None
        }
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        trace!(error = %e, "kill on exited process");
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::sys::signal::{kill as send_signal, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = send_signal(Pid::from_raw(pid), Signal::SIGINT) {
        debug!(pid, error = %e, "failed to interrupt server process");
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    kill(child);
}
