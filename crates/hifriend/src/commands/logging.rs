//! Logging initialization and configuration.
//!
//! Stdout belongs to the language server protocol in `serve`, so logs go to
//! stderr unless a log file is requested.

use std::path::PathBuf;

/// Initialize logging based on verbosity.
/// Logs are written to stderr, or to a file in the standard log directory
/// when `to_file` is set.
/// Returns the log file path if logging to file.
pub fn init_logging(verbose: bool, to_file: bool) -> Option<PathBuf> {
    let filter = if verbose {
        "hifriend=debug,hifriend_lsp=debug"
    } else {
        "hifriend=info,hifriend_lsp=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    if !to_file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    // Get log directory
    let log_dir = get_log_dir();

    // Create log directory if needed
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {e}");
        return None;
    }

    let log_file = log_dir.join("hifriend.log");

    // Open log file for appending
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {e}");
            return None;
        }
    };

    // Initialize tracing to file
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(file)
        .init();

    Some(log_file)
}

/// Directory for `--log-file` output.
///
/// The platform state directory (`~/.local/state` on Linux), or the local
/// data directory on platforms without one.
pub fn get_log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("hifriend").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".hifriend/logs"))
}
