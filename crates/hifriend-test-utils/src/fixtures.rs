//! Test fixtures for creating reproducible test environments.
//!
//! Provides utilities for setting up temporary Ruby project directories,
//! configuration files and fake `hi-friend` executables.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Where a project-local server binstub lives.
pub const SERVER_SCRIPT: &str = "bin/hi-friend";

/// A temporary test project with configurable file structure.
///
/// Creates a temporary directory that is automatically cleaned up
/// when the `TestProject` is dropped.
///
/// # Example
///
/// ```rust
/// use hifriend_test_utils::fixtures::TestProject;
///
/// let project = TestProject::new()
///     .with_file("lib/app.rb", "class App; end")
///     .with_gemfile()
///     .with_dir("sig")
///     .build();
///
/// assert!(project.path().join("lib/app.rb").exists());
/// ```
pub struct TestProject {
    /// The temporary directory backing this project.
    temp_dir: TempDir,
    /// Files to create (path relative to root -> contents).
    files: HashMap<PathBuf, String>,
    /// Files that get the executable bit.
    executables: Vec<PathBuf>,
    /// Directories to create (paths relative to root).
    dirs: Vec<PathBuf>,
}

impl TestProject {
    /// Create a new test project builder.
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
            files: HashMap::new(),
            executables: Vec::new(),
            dirs: Vec::new(),
        }
    }

    /// Add a file to the project.
    ///
    /// The path should be relative to the project root.
    /// Parent directories are created automatically.
    pub fn with_file(mut self, path: impl AsRef<Path>, contents: impl Into<String>) -> Self {
        self.files
            .insert(path.as_ref().to_path_buf(), contents.into());
        self
    }

    /// Add an executable file to the project.
    pub fn with_executable(mut self, path: impl AsRef<Path>, contents: impl Into<String>) -> Self {
        self.executables.push(path.as_ref().to_path_buf());
        self.with_file(path, contents)
    }

    /// Add an empty directory to the project.
    pub fn with_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.dirs.push(path.as_ref().to_path_buf());
        self
    }

    /// Add a Gemfile, so the server is run through bundler.
    pub fn with_gemfile(self) -> Self {
        self.with_file("Gemfile", content::GEMFILE)
    }

    /// Add an executable `bin/hi-friend` with the given shell script.
    pub fn with_server_script(self, script: &str) -> Self {
        self.with_executable(SERVER_SCRIPT, script)
    }

    /// Add a hifriend configuration file.
    pub fn with_config(self, config: &str) -> Self {
        self.with_file("hifriend.json", config)
    }

    /// Build the project, creating all files and directories.
    pub fn build(self) -> BuiltTestProject {
        let root = self.temp_dir.path();

        // Create directories first
        for dir in &self.dirs {
            let full_path = root.join(dir);
            fs::create_dir_all(&full_path).unwrap_or_else(|e| {
                panic!("Failed to create directory {}: {}", full_path.display(), e)
            });
        }

        // Create files (parent directories are created automatically)
        for (path, contents) in &self.files {
            let full_path = root.join(path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).unwrap_or_else(|e| {
                    panic!(
                        "Failed to create parent directory for {}: {}",
                        full_path.display(),
                        e
                    )
                });
            }
            fs::write(&full_path, contents)
                .unwrap_or_else(|e| panic!("Failed to write file {}: {}", full_path.display(), e));
        }

        for path in &self.executables {
            make_executable(&root.join(path));
        }

        BuiltTestProject {
            temp_dir: self.temp_dir,
        }
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .unwrap_or_else(|e| panic!("Failed to stat {}: {}", path.display(), e))
        .permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)
        .unwrap_or_else(|e| panic!("Failed to chmod {}: {}", path.display(), e));
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

/// A built test project with files created on disk.
///
/// The temporary directory is automatically cleaned up when this is dropped.
pub struct BuiltTestProject {
    temp_dir: TempDir,
}

impl BuiltTestProject {
    /// Get the path to the project root.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Read a file from the project.
    pub fn read_file(&self, path: impl AsRef<Path>) -> String {
        let full_path = self.path().join(path.as_ref());
        fs::read_to_string(&full_path)
            .unwrap_or_else(|e| panic!("Failed to read file {}: {}", full_path.display(), e))
    }

    /// Check if a file exists in the project.
    pub fn file_exists(&self, path: impl AsRef<Path>) -> bool {
        self.path().join(path.as_ref()).exists()
    }

    /// Write a file to the project (for modifying during tests).
    pub fn write_file(&self, path: impl AsRef<Path>, contents: impl AsRef<str>) {
        let full_path = self.path().join(path.as_ref());
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(&full_path, contents.as_ref())
            .unwrap_or_else(|e| panic!("Failed to write file {}: {}", full_path.display(), e));
    }
}

/// Common test file contents.
pub mod content {
    /// A minimal Gemfile.
    pub const GEMFILE: &str = r#"source "https://rubygems.org"

gem "hi-friend"
"#;

    /// A server that only answers `--version`.
    pub fn version_script(version: &str) -> String {
        format!(
            r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "hi-friend {version}"
  exit 0
fi
exit 1
"#
        )
    }

    /// A server that answers `--version` and, for `--lsp`, reports
    /// `127.0.0.1:<port>` and stays up until interrupted.
    ///
    /// Nothing listens on the port; tests bind it themselves.
    pub fn server_script(version: &str, port: u16) -> String {
        format!(
            r#"#!/bin/sh
case "$1" in
  --version)
    echo "hi-friend {version}"
    ;;
  --lsp)
    echo "booting" >&2
    printf '{{"host":"127.0.0.1","port":{port},"pid":%d}}' "$$"
    exec sleep 30
    ;;
  *)
    exit 2
    ;;
esac
"#
        )
    }

    /// Like [`version_script`], but leaves a background helper holding the
    /// output pipes after exiting.
    pub fn lingering_version_script(version: &str) -> String {
        format!(
            r#"#!/bin/sh
echo "hi-friend {version}"
sleep 20 &
exit 0
"#
        )
    }

    /// Like [`server_script`], but on SIGINT the server takes a moment to
    /// shut down and then creates `stopped` in its working directory.
    pub fn graceful_server_script(version: &str, port: u16) -> String {
        format!(
            r#"#!/bin/sh
case "$1" in
  --version)
    echo "hi-friend {version}"
    ;;
  --lsp)
    trap 'sleep 0.3; echo bye > stopped; exit 0' INT
    printf '{{"host":"127.0.0.1","port":{port},"pid":%d}}' "$$"
    while :; do sleep 0.1; done
    ;;
  *)
    exit 2
    ;;
esac
"#
        )
    }

    /// A server that writes to stderr and fails.
    pub fn failing_script(code: i32) -> String {
        format!(
            r#"#!/bin/sh
echo "cannot load such file -- hi_friend" >&2
exit {code}
"#
        )
    }
}
