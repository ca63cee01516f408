//! Drop-in `git`: forward the argument vector to the real binary and retry
//! network subcommands that fail transiently.

use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::{STARTUP_FAILURE_EXIT_CODE, StartupError};
use crate::git::{self, args};
use crate::output;
use crate::retry::cancel::SignalForwarder;
use crate::retry::{
	Cancellation, InvocationRequest, OutputMode, ProcessLauncher, RetryPolicy,
	RetryingCommandRunner,
};

/// Whether the binary was started under the name `git`.
pub fn invoked_as_git(argv0: &OsStr) -> bool {
	Path::new(argv0).file_stem() == Some(OsStr::new("git"))
}

/// How one invocation will be executed.
#[derive(Debug)]
pub struct Plan {
	pub request: InvocationRequest,
	pub policy: RetryPolicy,
	pub launcher: ProcessLauncher,
	/// Whether the subcommand goes through the retry policy.
	pub retried: bool,
}

impl Plan {
	pub fn new(program: PathBuf, mut args: Vec<OsString>, settings: &Settings) -> Self {
		let subcommand = args::subcommand(&args).filter(|sub| settings.retries(&sub.name));

		let Some(subcommand) = subcommand else {
			return Self {
				request: InvocationRequest::new(program).args(args),
				policy: RetryPolicy::single_attempt(),
				launcher: ProcessLauncher::new(OutputMode::Inherit),
				retried: false,
			};
		};

		if settings.monitor.is_some() {
			args::ensure_progress(&mut args, &subcommand);
		}
		Self {
			request: InvocationRequest::new(program).args(args),
			policy: settings.policy.clone(),
			launcher: ProcessLauncher::new(settings.output)
				.with_monitor(settings.monitor)
				.with_attempt_timeout(settings.attempt_timeout),
			retried: true,
		}
	}
}

/// Run with settings from the environment. Returns the exit code to use.
pub fn run(args: Vec<OsString>) -> i32 {
	match Settings::from_env() {
		Ok(settings) => run_with(args, &settings),
		Err(err) => startup_failure(&StartupError::Config(err)),
	}
}

pub fn run_with(args: Vec<OsString>, settings: &Settings) -> i32 {
	match execute(args, settings) {
		Ok(code) => code,
		Err(err) => startup_failure(&err),
	}
}

/// Report a startup failure and return its exit code.
pub fn startup_failure(err: &StartupError) -> i32 {
	output::error(&err.to_string());
	STARTUP_FAILURE_EXIT_CODE
}

/// # Errors
///
/// [`StartupError`] when the real executable cannot be resolved or started.
pub fn execute(args: Vec<OsString>, settings: &Settings) -> Result<i32, StartupError> {
	let program = git::real_executable(settings.git_executable.as_deref())?;
	let plan = Plan::new(program, args, settings);

	let cancellation = Cancellation::new();
	let _signals = signal_forwarder(&plan, &cancellation, settings.quiet);

	let mode = plan.launcher.mode();
	let mut runner = RetryingCommandRunner::new(plan.launcher, plan.policy)
		.with_cancellation(cancellation)
		.quiet(settings.quiet);
	let outcome = runner.run(&plan.request)?;

	let replayed = match mode {
		OutputMode::Inherit => Ok(()),
		OutputMode::Stream => write_stdout(&outcome.result.stdout),
		OutputMode::Capture => outcome
			.result
			.replay(&mut io::stdout().lock(), &mut io::stderr().lock()),
	};
	if let Err(err) = replayed
		&& err.kind() != io::ErrorKind::BrokenPipe
	{
		output::error(&format!("failed to replay output: {err}"));
	}

	Ok(outcome.exit_code)
}

/// Passthrough children share our process group and inherit stdio, so
/// terminal signals already reach them; only retried plans get a forwarder.
fn signal_forwarder(
	plan: &Plan,
	cancellation: &Cancellation,
	quiet: bool,
) -> Option<SignalForwarder> {
	if !plan.retried {
		return None;
	}
	match SignalForwarder::install(cancellation.clone()) {
		Ok(forwarder) => Some(forwarder),
		Err(err) => {
			if !quiet {
				output::diagnostic(&format!("signals will not be forwarded: {err}"));
			}
			None
		}
	}
}

fn write_stdout(bytes: &[u8]) -> io::Result<()> {
	let mut out = io::stdout().lock();
	out.write_all(bytes)?;
	out.flush()
}

#[cfg(test)]
mod tests {
	use std::fs;
	use std::os::unix::fs::PermissionsExt;
	use std::time::Duration;

	use pretty_assertions::assert_eq;
	use tempfile::TempDir;

	use super::*;
	use crate::retry::{Backoff, MonitorSettings};

	fn argv(args: &[&str]) -> Vec<OsString> {
		args.iter().map(OsString::from).collect()
	}

	/// A fake git that fails with `fail_code` until it has run `fail_times`
	/// times, counting invocations in a file next to it.
	fn flaky_git(dir: &TempDir, fail_times: u32, fail_code: i32, stderr: &str) -> PathBuf {
		let counter = dir.path().join("count");
		let path = dir.path().join("git_orig");
		fs::write(
			&path,
			format!(
				"#!/bin/sh\n\
				 n=$(cat '{counter}' 2>/dev/null || echo 0)\n\
				 n=$((n + 1))\n\
				 echo $n > '{counter}'\n\
				 if [ $n -le {fail_times} ]; then echo '{stderr}' >&2; exit {fail_code}; fi\n\
				 echo \"ok $*\"\n",
				counter = counter.display(),
				stderr = stderr.replace('\'', "'\\''"),
			),
		)
		.unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	fn invocations(dir: &TempDir) -> u32 {
		fs::read_to_string(dir.path().join("count"))
			.map(|s| s.trim().parse().unwrap())
			.unwrap_or(0)
	}

	fn settings(git: Option<PathBuf>) -> Settings {
		let mut settings = Settings {
			git_executable: git,
			output: OutputMode::Capture,
			quiet: true,
			..Settings::default()
		};
		settings.policy = settings.policy.with_max_attempts(3).with_backoff(Backoff::Fixed {
			delay: Duration::from_millis(10),
		});
		settings
	}

	#[test]
	fn recognises_git_argv0() {
		assert!(invoked_as_git(OsStr::new("git")));
		assert!(invoked_as_git(OsStr::new("/usr/bin/git")));
		assert!(!invoked_as_git(OsStr::new("/usr/bin/git-retry")));
		assert!(!invoked_as_git(OsStr::new("git_orig")));
	}

	#[test]
	fn non_retried_subcommands_run_once_with_inherited_output() {
		let plan = Plan::new(
			PathBuf::from("/usr/bin/git_orig"),
			argv(&["status", "--short"]),
			&settings(None),
		);
		assert!(!plan.retried);
		assert_eq!(plan.policy.max_attempts, 1);
		assert_eq!(plan.launcher.mode(), OutputMode::Inherit);
		assert_eq!(plan.request.args, argv(&["status", "--short"]));
	}

	#[test]
	fn monitored_fetch_gets_progress() {
		let mut settings = settings(None);
		settings.monitor = Some(MonitorSettings::default());
		let plan = Plan::new(
			PathBuf::from("/usr/bin/git_orig"),
			argv(&["-C", "repo", "fetch", "origin"]),
			&settings,
		);
		assert!(plan.retried);
		assert_eq!(
			plan.request.args,
			argv(&["-C", "repo", "fetch", "origin", "--progress"])
		);
	}

	#[test]
	fn unmonitored_fetch_is_forwarded_verbatim() {
		let plan = Plan::new(
			PathBuf::from("/usr/bin/git_orig"),
			argv(&["fetch", "origin"]),
			&settings(None),
		);
		assert!(plan.retried);
		assert_eq!(plan.request.args, argv(&["fetch", "origin"]));
	}

	#[test]
	fn only_retried_plans_forward_signals() {
		let settings = settings(None);
		let cancellation = Cancellation::new();
		let program = PathBuf::from("/usr/bin/git_orig");

		let passthrough = Plan::new(program.clone(), argv(&["status"]), &settings);
		assert!(signal_forwarder(&passthrough, &cancellation, true).is_none());

		let fetch = Plan::new(program, argv(&["fetch"]), &settings);
		assert!(signal_forwarder(&fetch, &cancellation, true).is_some());
	}

	#[test]
	fn unset_executable_fails_before_any_invocation() {
		let err = execute(argv(&["fetch"]), &settings(None)).unwrap_err();
		assert!(matches!(err, StartupError::Unset { .. }));
		assert_eq!(run_with(argv(&["fetch"]), &settings(None)), STARTUP_FAILURE_EXIT_CODE);
	}

	#[test]
	fn flaky_fetch_is_retried_to_success() {
		let dir = TempDir::new().unwrap();
		let git = flaky_git(&dir, 2, 128, "fatal: early EOF");
		let code = execute(argv(&["fetch", "origin"]), &settings(Some(git))).unwrap();

		assert_eq!(code, 0);
		assert_eq!(invocations(&dir), 3);
	}

	#[test]
	fn persistent_failure_reports_wrapped_exit_code() {
		let dir = TempDir::new().unwrap();
		let git = flaky_git(&dir, 10, 128, "fatal: the remote end hung up unexpectedly");
		let code = execute(argv(&["fetch"]), &settings(Some(git))).unwrap();

		assert_eq!(code, 128);
		assert_eq!(invocations(&dir), 3);
	}

	#[test]
	fn non_network_failure_is_not_retried() {
		let dir = TempDir::new().unwrap();
		let git = flaky_git(&dir, 10, 128, "fatal: couldn't find remote ref nope");
		let code = execute(argv(&["fetch", "origin", "nope"]), &settings(Some(git))).unwrap();

		assert_eq!(code, 128);
		assert_eq!(invocations(&dir), 1);
	}

	#[test]
	fn other_subcommands_are_never_retried() {
		let dir = TempDir::new().unwrap();
		let git = flaky_git(&dir, 10, 128, "fatal: early EOF");
		let code = execute(argv(&["push"]), &settings(Some(git))).unwrap();

		assert_eq!(code, 128);
		assert_eq!(invocations(&dir), 1);
	}
}
