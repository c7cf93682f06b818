//! The editor surface the supervisor drives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::diagnostics::LogSink;

/// URI scheme of folders on the local file system.
pub const FILE_SCHEME: &str = "file";

/// A workspace folder as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceFolder {
    pub path: PathBuf,
    pub name: String,
    pub scheme: String,
}

impl WorkspaceFolder {
    /// A folder on the local file system, named after its last component.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            name,
            scheme: FILE_SCHEME.to_string(),
        }
    }

    /// Only local folders can host a server.
    pub fn is_local(&self) -> bool {
        self.scheme == FILE_SCHEME
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The host editor: workspace folders, the output sink and the status
/// affordances.
///
/// There is one progress indicator and one toggle for the whole host; the
/// supervisor updates them for whichever session it acted on last.
pub trait Host: LogSink {
    /// Current folders; `None` when no workspace is open at all.
    fn workspace_folders(&self) -> Option<Vec<WorkspaceFolder>>;

    /// Empty the output sink.
    fn clear_log(&self);

    /// Show the transient progress indicator with `message`.
    fn show_progress(&self, message: &str);

    fn hide_progress(&self);

    /// Show the feature toggle button.
    fn show_toggle(&self);

    fn hide_toggle(&self);

    /// Show the persistent error indicator.
    fn show_error(&self);
}

/// Adapts a host to the plain [`LogSink`] the prober and negotiator write to.
pub(crate) struct HostLog(pub Arc<dyn Host>);

impl LogSink for HostLog {
    fn append_line(&self, line: &str) {
        self.0.append_line(line);
    }
}
