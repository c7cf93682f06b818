//! Command handlers for the hifriend CLI.

pub mod host;
pub mod logging;
pub mod probe;
pub mod serve;

pub use logging::*;
pub use probe::*;
pub use serve::*;
