//! A terminal host: folders from the command line, UI affordances as log
//! events.

use hifriend_lsp::{Host, LogSink, WorkspaceFolder};
use tracing::{debug, error, info};

/// Server output and supervisor diagnostics, as log events.
pub struct TracingLog;

impl LogSink for TracingLog {
    fn append_line(&self, line: &str) {
        info!(target: "hifriend::output", "{line}");
    }
}

/// Host for headless runs.
pub struct TerminalHost {
    folders: Vec<WorkspaceFolder>,
}

impl TerminalHost {
    pub fn new(folders: Vec<WorkspaceFolder>) -> Self {
        Self { folders }
    }
}

impl LogSink for TerminalHost {
    fn append_line(&self, line: &str) {
        TracingLog.append_line(line);
    }
}

impl Host for TerminalHost {
    fn workspace_folders(&self) -> Option<Vec<WorkspaceFolder>> {
        Some(self.folders.clone())
    }

    fn clear_log(&self) {
        debug!("output cleared");
    }

    fn show_progress(&self, message: &str) {
        info!(status = %message, "progress");
    }

    fn hide_progress(&self) {
        debug!("progress hidden");
    }

    fn show_toggle(&self) {
        info!("hi-friend is ready");
    }

    fn hide_toggle(&self) {
        debug!("toggle hidden");
    }

    fn show_error(&self) {
        error!("hi-friend is not available; see the output above");
    }
}
