//! Testing utilities and fixtures for hifriend.
//!
//! - **Fixtures**: temporary Ruby projects, optionally with a scripted
//!   `bin/hi-friend` that behaves like the real server
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use hifriend_test_utils::{content, TestProject};
//!
//! #[tokio::test]
//! async fn test_probe() {
//!     let project = TestProject::new()
//!         .with_gemfile()
//!         .with_server_script(&content::version_script("0.31.0"))
//!         .build();
//!
//!     assert!(project.file_exists("bin/hi-friend"));
//! }
//! ```

pub mod fixtures;

// Re-export commonly used items
pub use fixtures::{content, BuiltTestProject, TestProject};
