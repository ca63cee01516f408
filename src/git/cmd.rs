//! Command execution against the real git executable.
//!
//! The wrapper never calls `git` through `PATH`: after installation `PATH`
//! resolves to the wrapper itself, so every command is built against the
//! explicitly resolved binary.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};

use crate::retry::InvocationRequest;

/// Builder for commands run against a specific git binary.
#[derive(Debug, Clone)]
pub struct Git {
	program: PathBuf,
	cwd: Option<PathBuf>,
	env: Vec<(OsString, OsString)>,
	args: Vec<OsString>,
}

impl Git {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			cwd: None,
			env: Vec::new(),
			args: Vec::new(),
		}
	}

	/// Set the current working directory for the command.
	pub fn cwd(mut self, path: &Path) -> Self {
		self.cwd = Some(path.to_path_buf());
		self
	}

	/// Add an environment variable on top of the inherited environment.
	pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
		self.env
			.push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
		self
	}

	/// Add multiple arguments.
	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<OsStr>,
	{
		self.args
			.extend(args.into_iter().map(|s| s.as_ref().to_os_string()));
		self
	}

	/// Add a single argument.
	pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
		self.args.push(arg.as_ref().to_os_string());
		self
	}

	/// The configured `std::process::Command`, stdio left at its defaults.
	pub fn command(&self) -> Command {
		let mut cmd = Command::new(&self.program);
		if let Some(ref cwd) = self.cwd {
			cmd.current_dir(cwd);
		}
		cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
		cmd.args(&self.args);
		cmd
	}

	fn describe(&self) -> String {
		let args: Vec<_> = self.args.iter().map(|a| a.to_string_lossy()).collect();
		format!("{} {}", self.program.display(), args.join(" "))
	}

	/// Execute and return raw output.
	pub fn output(&self) -> Result<Output> {
		self.command()
			.output()
			.with_context(|| format!("failed to execute: {}", self.describe()))
	}

	/// Execute and return stdout as trimmed string.
	pub fn stdout(&self) -> Result<String> {
		let out = self.output()?;
		if !out.status.success() {
			let stderr = String::from_utf8_lossy(&out.stderr);
			anyhow::bail!("{} failed: {}", self.describe(), stderr.trim());
		}
		Ok(String::from_utf8(out.stdout)?.trim().to_string())
	}

	/// Report the version string of the binary (`git --version`).
	pub fn version(program: &Path) -> Result<String> {
		Git::new(program).arg("--version").stdout()
	}
}

impl From<&InvocationRequest> for Git {
	fn from(request: &InvocationRequest) -> Self {
		let mut git = Git::new(&request.program).args(&request.args);
		if let Some(cwd) = &request.cwd {
			git = git.cwd(cwd);
		}
		for (key, value) in &request.env {
			git = git.env(key, value);
		}
		git
	}
}

#[cfg(test)]
mod tests {
	use std::fs;
	use std::os::unix::fs::PermissionsExt;

	use tempfile::TempDir;

	use super::*;

	fn fake_git(dir: &TempDir, body: &str) -> PathBuf {
		let path = dir.path().join("git_orig");
		fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	#[test]
	fn version_reads_trimmed_stdout() {
		let dir = TempDir::new().unwrap();
		let git = fake_git(&dir, "echo 'git version 2.45.0'");
		assert_eq!(Git::version(&git).unwrap(), "git version 2.45.0");
	}

	#[test]
	fn stdout_reports_failures_with_stderr() {
		let dir = TempDir::new().unwrap();
		let git = fake_git(&dir, "echo 'fatal: not a git repository' >&2; exit 128");
		let err = Git::new(&git).arg("status").stdout().unwrap_err();
		assert!(err.to_string().contains("fatal: not a git repository"));
	}

	#[test]
	fn request_carries_cwd_and_env() {
		let dir = TempDir::new().unwrap();
		let git = fake_git(&dir, "printf '%s %s' \"$(pwd)\" \"$GIT_RETRY_TEST\"");
		let mut request = InvocationRequest::new(&git);
		request.cwd = Some(dir.path().to_path_buf());
		request.env.push(("GIT_RETRY_TEST".into(), "42".into()));

		let out = Git::from(&request).stdout().unwrap();
		let cwd = dunce::canonicalize(dir.path()).unwrap();
		assert_eq!(out, format!("{} 42", cwd.display()));
	}
}
