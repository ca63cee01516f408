//! Startup failures.
//!
//! A failing wrapped command is never an error here: its exit code and output
//! are data carried by [`crate::retry::InvocationResult`]. The only failures
//! the wrapper reports on its own are the ones that prevent it from running
//! the real executable at all.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Exit code used when the real executable cannot be located or executed.
///
/// Chosen to match the shell's "command not found" convention so it does not
/// collide with git's own 1 and 128.
pub const STARTUP_FAILURE_EXIT_CODE: i32 = 127;

#[derive(Debug, Error)]
pub enum StartupError {
	#[error("{var} is not set; it must name the real git executable")]
	Unset { var: &'static str },

	#[error("real executable not found: {}", path.display())]
	NotFound { path: PathBuf },

	#[error("real executable is not an executable file: {}", path.display())]
	NotExecutable { path: PathBuf },

	#[error("{} resolves to this wrapper; refusing to invoke itself", path.display())]
	SelfReference { path: PathBuf },

	#[error("failed to execute {}: {source}", path.display())]
	Spawn {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("invalid configuration: {0:#}")]
	Config(anyhow::Error),
}
