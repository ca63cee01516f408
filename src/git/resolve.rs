//! Resolution of the real git executable.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::StartupError;

/// Environment variable naming the real git binary.
pub const GIT_EXECUTABLE: &str = "GIT_EXECUTABLE";

/// Validate the configured path to the real executable.
///
/// The path is returned as configured (not canonicalized) so git sees the
/// `argv[0]` it was installed under.
pub fn real_executable(configured: Option<&Path>) -> Result<PathBuf, StartupError> {
	let path = configured
		.filter(|path| !path.as_os_str().is_empty())
		.ok_or(StartupError::Unset { var: GIT_EXECUTABLE })?;

	let metadata = fs::metadata(path).map_err(|_| StartupError::NotFound {
		path: path.to_path_buf(),
	})?;
	if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
		return Err(StartupError::NotExecutable {
			path: path.to_path_buf(),
		});
	}

	if is_current_exe(path) {
		return Err(StartupError::SelfReference {
			path: path.to_path_buf(),
		});
	}

	Ok(path.to_path_buf())
}

fn is_current_exe(path: &Path) -> bool {
	let Ok(current) = env::current_exe() else {
		return false;
	};
	match (dunce::canonicalize(path), dunce::canonicalize(current)) {
		(Ok(target), Ok(current)) => target == current,
		_ => false,
	}
}
