//! One-shot `version` and `handshake` commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use hifriend_lsp::{
    negotiate, probe_version, Launcher, LspError, ProcessLauncher, ServerMode, SharedLog,
    SupervisorConfig,
};
use tracing::{debug, info};

use super::host::TracingLog;

fn launcher(config: &SupervisorConfig) -> ProcessLauncher {
    ProcessLauncher::new(config.server_path().map(String::from))
}

/// Probe the server for `dir` and print its version.
pub async fn run_version(dir: &Path, config: &SupervisorConfig) -> anyhow::Result<()> {
    let log: SharedLog = Arc::new(TracingLog);
    let process = launcher(config).launch(dir, ServerMode::Version)?;
    let version = probe_version(process, log).await?;

    println!("{version}");
    Ok(())
}

/// Probe, negotiate, print the address record as JSON, then stop the server
/// and wait for it to exit.
pub async fn run_handshake(dir: &Path, config: &SupervisorConfig) -> anyhow::Result<()> {
    let launcher = launcher(config);
    let log: SharedLog = Arc::new(TracingLog);

    let process = launcher.launch(dir, ServerMode::Version)?;
    let version = probe_version(process, log.clone()).await?;
    info!(%version, "negotiating");

    let process = launcher.launch(dir, ServerMode::Lsp)?;
    let timeout = config.handshake_timeout();
    let handshake = tokio::time::timeout(
        timeout,
        negotiate(process, log, config.record_buffering()),
    )
    .await
    .map_err(|_| LspError::HandshakeTimeout {
        secs: timeout.as_secs(),
    })??;

    println!(
        "{}",
        serde_json::to_string_pretty(&handshake.record).context("failed to encode record")?
    );
    let code = handshake.shutdown().await;
    debug!(?code, "hi-friend stopped");
    Ok(())
}
