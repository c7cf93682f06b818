//! `hi-friend --version` probing.

use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::diagnostics::{forward_lines, SharedLog};
use crate::error::{LspError, LspResult};
use crate::process::ServerProcess;
use crate::version::{self, MINIMUM_SUPPORTED};

static REPLY_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn reply_regex() -> &'static regex::Regex {
    REPLY_REGEX.get_or_init(|| {
        regex::Regex::new(r"^hi-friend (\d+\.\d+\.\d+)$")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// How long output is still collected after the process exited.
///
/// Helpers started by the server (or by a login shell) can inherit its pipes
/// and hold them open long after it is gone.
pub const OUTPUT_GRACE: Duration = Duration::from_millis(200);

/// Run a version probe to completion.
///
/// Stdout is collected until the process exits, plus whatever arrives within
/// [`OUTPUT_GRACE`] after that; stderr is forwarded to `log` line by line
/// while it runs. The process is killed before returning, on every path.
pub async fn probe_version(process: ServerProcess, log: SharedLog) -> LspResult<String> {
    let ServerProcess {
        handle,
        mut stdout,
        stderr,
        mut exit,
    } = process;

    let mut stderr_task = tokio::spawn(forward_lines(stderr, log.clone(), "stderr: "));

    let mut output = Vec::new();
    let mut buf = vec![0u8; 8 * 1024];
    let mut stdout_open = true;
    let code = loop {
        tokio::select! {
            read = stdout.read(&mut buf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(e) => {
                    debug!(error = %e, "failed to read version output");
                    stdout_open = false;
                }
            },
            code = &mut exit => break code.unwrap_or(None),
        }
    };

    let deadline = Instant::now() + OUTPUT_GRACE;
    while stdout_open {
        match tokio::time::timeout_at(deadline, stdout.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => output.extend_from_slice(&buf[..n]),
            Ok(_) => stdout_open = false,
            Err(_) => {
                debug!("stdout still open after the version probe exited");
                break;
            }
        }
    }
    if tokio::time::timeout_at(deadline, &mut stderr_task).await.is_err() {
        stderr_task.abort();
    }

    let result = check_reply(code, &String::from_utf8_lossy(&output), &log);
    handle.kill();
    result
}

/// Interpret the exit code and output of `hi-friend --version`.
pub fn check_reply(code: Option<i32>, output: &str, log: &SharedLog) -> LspResult<String> {
    if code != Some(0) {
        let err = LspError::launch_failed(code);
        warn!(?code, "version probe failed");
        log.append_line(&format!("[hifriend] {err}"));
        return Err(err);
    }

    let reply = output.trim();
    log.append_line(&format!("[hifriend] HiFriend version: {reply}"));

    let Some(found) = reply_regex()
        .captures(reply)
        .map(|caps| caps[1].to_string())
    else {
        let err = LspError::UnrecognizedOutput {
            output: reply.to_string(),
        };
        log.append_line(&format!("[hifriend] {err}"));
        return Err(err);
    };

    if !version::at_least(&found, MINIMUM_SUPPORTED)? {
        let err = LspError::UnsupportedVersion {
            found,
            minimum: MINIMUM_SUPPORTED.to_string(),
        };
        log.append_line(&format!("[hifriend] {err}"));
        return Err(err);
    }

    info!(version = %found, "hi-friend version accepted");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSignal;
    use crate::testing::{FakeProcess, RecordingLog};
    use std::sync::Arc;

    async fn probe(stdout: &str, stderr: &str, code: Option<i32>) -> (LspResult<String>, FakeProcess) {
        let log = Arc::new(RecordingLog::default());
        let fake = FakeProcess::new();
        let process = fake.take_process();

        fake.write_stdout(stdout.as_bytes()).await;
        fake.write_stderr(stderr.as_bytes()).await;
        fake.exit(code);

        (probe_version(process, log).await, fake)
    }

    #[tokio::test]
    async fn test_too_old_version() {
        let (result, _) = probe("hi-friend 0.19.9\n", "", Some(0)).await;

        match result {
            Err(LspError::UnsupportedVersion { found, minimum }) => {
                assert_eq!(found, "0.19.9");
                assert_eq!(minimum, "0.20.0");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_minimum_version_accepted() {
        let (result, _) = probe("hi-friend 0.20.0\n", "", Some(0)).await;
        assert_eq!(result.unwrap(), "0.20.0");
    }

    #[tokio::test]
    async fn test_nonzero_exit_ignores_output() {
        let (result, _) = probe("hi-friend 0.31.0\n", "boom\n", Some(3)).await;
        assert_eq!(result.unwrap_err().exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_unknown_output() {
        let (result, _) = probe("hello world\n", "", Some(0)).await;
        assert!(matches!(result, Err(LspError::UnrecognizedOutput { .. })));

        let (result, _) = probe("hi-friend 0.31.0-beta\n", "", Some(0)).await;
        assert!(matches!(result, Err(LspError::UnrecognizedOutput { .. })));
    }

    #[tokio::test]
    async fn test_process_is_killed_on_every_branch() {
        for (stdout, code) in [
            ("hi-friend 0.31.0", Some(0)),
            ("garbage", Some(0)),
            ("", Some(1)),
            ("hi-friend 0.1.0", Some(0)),
        ] {
            let (_, fake) = probe(stdout, "", code).await;
            assert_eq!(fake.signals().await, vec![ProcessSignal::Kill], "{stdout:?}");
        }
    }

    #[test]
    fn test_stderr_and_outcome_are_logged() {
        let log = Arc::new(RecordingLog::default());
        let shared: SharedLog = log.clone();

        let _ = check_reply(Some(0), "  hi-friend 0.25.1 \n", &shared);
        let _ = check_reply(Some(2), "", &shared);

        let lines = log.lines();
        assert_eq!(lines[0], "[hifriend] HiFriend version: hi-friend 0.25.1");
        assert_eq!(lines[1], "[hifriend] failed to invoke hi-friend: error code 2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_probe() {
        use crate::launcher::{LaunchEnvironment, Launcher, ProcessLauncher, ServerMode};
        use hifriend_test_utils::{content, TestProject};

        let project = TestProject::new()
            .with_server_script(&content::version_script("0.30.1"))
            .build();
        let launcher = ProcessLauncher::new(None).with_environment(LaunchEnvironment::direct());
        let log = Arc::new(RecordingLog::default());

        let process = launcher.launch(project.path(), ServerMode::Version).unwrap();
        let version = probe_version(process, log.clone()).await.unwrap();

        assert_eq!(version, "0.30.1");
        assert_eq!(log.lines(), vec!["[hifriend] HiFriend version: hi-friend 0.30.1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_stderr_is_forwarded() {
        use crate::launcher::{LaunchEnvironment, Launcher, ProcessLauncher, ServerMode};
        use hifriend_test_utils::{content, TestProject};

        let project = TestProject::new()
            .with_server_script(&content::failing_script(4))
            .build();
        let launcher = ProcessLauncher::new(None).with_environment(LaunchEnvironment::direct());
        let log = Arc::new(RecordingLog::default());

        let process = launcher.launch(project.path(), ServerMode::Version).unwrap();
        let err = probe_version(process, log.clone()).await.unwrap_err();

        assert_eq!(err.exit_code(), Some(4));
        assert_eq!(
            log.lines(),
            vec![
                "stderr: cannot load such file -- hi_friend",
                "[hifriend] failed to invoke hi-friend: error code 4",
            ]
        );
    }

    #[tokio::test]
    async fn test_exit_is_enough_while_pipes_stay_open() {
        let log = Arc::new(RecordingLog::default());
        let fake = FakeProcess::new();
        let process = fake.take_process();

        fake.write_stdout(b"hi-friend 0.31.0\n").await;
        fake.report_exit(Some(0));

        let result = tokio::time::timeout(Duration::from_secs(2), probe_version(process, log))
            .await
            .expect("probe returns once the process exits");
        assert_eq!(result.unwrap(), "0.31.0");
        assert_eq!(fake.signals().await, vec![ProcessSignal::Kill]);
    }

    #[tokio::test]
    async fn test_output_buffered_at_exit_is_collected() {
        let log = Arc::new(RecordingLog::default());
        let fake = FakeProcess::new();
        let process = fake.take_process();

        let task = tokio::spawn(probe_version(process, log));
        fake.report_exit(Some(0));
        fake.write_stdout(b"hi-friend 0.30.1").await;
        fake.write_stdout(b"\n").await;

        assert_eq!(task.await.unwrap().unwrap(), "0.30.1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_helper_does_not_block_probe() {
        use crate::launcher::{LaunchEnvironment, Launcher, ProcessLauncher, ServerMode};
        use hifriend_test_utils::{content, TestProject};

        let project = TestProject::new()
            .with_server_script(&content::lingering_version_script("0.31.0"))
            .build();
        let launcher = ProcessLauncher::new(None).with_environment(LaunchEnvironment::direct());
        let log = Arc::new(RecordingLog::default());

        let process = launcher.launch(project.path(), ServerMode::Version).unwrap();
        let version = tokio::time::timeout(Duration::from_secs(3), probe_version(process, log))
            .await
            .expect("probe returns while a helper holds the pipes")
            .unwrap();

        assert_eq!(version, "0.31.0");
    }
}
