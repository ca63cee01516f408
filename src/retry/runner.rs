//! The attempt loop.
//!
//! `Idle -> Invoking -> {Success, Retrying -> Invoking, Failed}`. A failing
//! wrapped command is never turned into an error: after the last attempt its
//! result is handed back untouched.

use std::time::{Duration, Instant};

use super::policy::{RetryPolicy, Verdict};
use super::{Cancellation, InvocationRequest, InvocationResult};
use crate::error::StartupError;
use crate::output;

/// Performs one attempt of the wrapped command.
pub trait Launcher {
	/// Run the request to completion.
	///
	/// # Errors
	///
	/// Only when the executable cannot be started at all.
	fn launch(
		&mut self,
		request: &InvocationRequest,
		cancellation: &Cancellation,
	) -> Result<InvocationResult, StartupError>;

	/// Whether results carry stderr that pattern classification can inspect.
	fn captures_stderr(&self) -> bool {
		true
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Idle,
	Invoking { attempt: u32 },
	Retrying { attempt: u32, delay: Duration },
	Success,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
	/// The last attempt's result, unchanged.
	pub result: InvocationResult,
	pub attempts: u32,
	pub elapsed: Duration,
	/// Signal that stopped the loop, if any.
	pub interrupted: Option<i32>,
	/// Exit code the wrapper should terminate with.
	pub exit_code: i32,
}

#[derive(Debug)]
pub struct RetryingCommandRunner<L> {
	launcher: L,
	policy: RetryPolicy,
	cancellation: Cancellation,
	quiet: bool,
	state: State,
}

impl<L: Launcher> RetryingCommandRunner<L> {
	pub fn new(launcher: L, policy: RetryPolicy) -> Self {
		Self {
			launcher,
			policy,
			cancellation: Cancellation::new(),
			quiet: false,
			state: State::Idle,
		}
	}

	pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
		self.cancellation = cancellation;
		self
	}

	pub fn quiet(mut self, quiet: bool) -> Self {
		self.quiet = quiet;
		self
	}

	pub fn state(&self) -> State {
		self.state
	}

	pub fn launcher(&self) -> &L {
		&self.launcher
	}

	/// Invoke `request` until it succeeds, fails fatally, or the budget runs out.
	///
	/// # Errors
	///
	/// [`StartupError`] when the launcher cannot start the executable.
	pub fn run(&mut self, request: &InvocationRequest) -> Result<Outcome, StartupError> {
		let started = Instant::now();
		let max_attempts = self.policy.max_attempts.max(1);
		let mut attempt = 0;

		loop {
			attempt += 1;
			self.state = State::Invoking { attempt };
			let result = self.launcher.launch(request, &self.cancellation)?;
			let verdict = self
				.policy
				.classifier
				.classify(&result, self.launcher.captures_stderr());

			if verdict == Verdict::Success {
				self.state = State::Success;
				return Ok(finish(result, attempt, started, None));
			}

			if let Some(signal) = self.cancellation.signal() {
				self.state = State::Failed;
				return Ok(finish(result, attempt, started, Some(signal)));
			}

			if verdict == Verdict::Fatal || attempt >= max_attempts {
				self.state = State::Failed;
				if verdict == Verdict::Retryable && max_attempts > 1 {
					self.report(&format!(
						"giving up after {attempt} attempts (exit code {})",
						result.exit_code
					));
				}
				return Ok(finish(result, attempt, started, None));
			}

			let delay = self.policy.backoff.delay_before(attempt);
			self.state = State::Retrying { attempt, delay };
			self.report(&retry_message(request, &result, attempt, max_attempts, delay));

			if self.cancellation.wait(delay) {
				self.state = State::Failed;
				let signal = self.cancellation.signal();
				let mut outcome = finish(result, attempt, started, signal);
				if let Some(signal) = signal {
					outcome.exit_code = 128 + signal;
				}
				return Ok(outcome);
			}
		}
	}

	fn report(&self, message: &str) {
		if !self.quiet {
			output::diagnostic(message);
		}
	}
}

fn finish(
	result: InvocationResult,
	attempts: u32,
	started: Instant,
	interrupted: Option<i32>,
) -> Outcome {
	Outcome {
		exit_code: result.exit_code,
		result,
		attempts,
		elapsed: started.elapsed(),
		interrupted,
	}
}

fn retry_message(
	request: &InvocationRequest,
	result: &InvocationResult,
	attempt: u32,
	max_attempts: u32,
	delay: Duration,
) -> String {
	let cause = match result.abort {
		Some(reason) => reason.to_string(),
		None => format!("exit code {}", result.exit_code),
	};
	format!(
		"attempt {attempt}/{max_attempts} of 'git {}' failed ({cause}); retrying in {:.1}s",
		request.display_args(),
		delay.as_secs_f64()
	)
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;
	use std::path::PathBuf;

	use pretty_assertions::assert_eq;

	use super::*;
	use crate::retry::policy::{Backoff, Classifier};

	/// Replays a fixed sequence of attempt results.
	struct Scripted {
		results: VecDeque<(i32, &'static str)>,
		calls: u32,
		captured: bool,
	}

	impl Scripted {
		fn new(results: impl IntoIterator<Item = (i32, &'static str)>) -> Self {
			Self {
				results: results.into_iter().collect(),
				calls: 0,
				captured: true,
			}
		}
	}

	impl Launcher for Scripted {
		fn launch(
			&mut self,
			_request: &InvocationRequest,
			_cancellation: &Cancellation,
		) -> Result<InvocationResult, StartupError> {
			self.calls += 1;
			let (exit_code, stderr) = self.results.pop_front().expect("script exhausted");
			Ok(InvocationResult {
				exit_code,
				stdout: format!("attempt {}\n", self.calls).into_bytes(),
				stderr: stderr.as_bytes().to_vec(),
				..InvocationResult::default()
			})
		}

		fn captures_stderr(&self) -> bool {
			self.captured
		}
	}

	struct Unlaunchable;

	impl Launcher for Unlaunchable {
		fn launch(
			&mut self,
			request: &InvocationRequest,
			_cancellation: &Cancellation,
		) -> Result<InvocationResult, StartupError> {
			Err(StartupError::Spawn {
				path: request.program.clone(),
				source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
			})
		}
	}

	fn policy(max_attempts: u32, delay: Duration) -> RetryPolicy {
		RetryPolicy::default()
			.with_max_attempts(max_attempts)
			.with_backoff(Backoff::Fixed { delay })
			.with_classifier(Classifier::exit_codes([128]))
	}

	fn request() -> InvocationRequest {
		InvocationRequest::new(PathBuf::from("/usr/bin/git_orig")).args(["fetch", "origin"])
	}

	#[test]
	fn first_success_is_returned_verbatim() {
		let mut runner = RetryingCommandRunner::new(
			Scripted::new([(0, "From origin\n")]),
			policy(3, Duration::ZERO),
		)
		.quiet(true);
		let outcome = runner.run(&request()).unwrap();

		assert_eq!(outcome.attempts, 1);
		assert_eq!(outcome.exit_code, 0);
		assert_eq!(outcome.result.stdout, b"attempt 1\n");
		assert_eq!(outcome.result.stderr, b"From origin\n");
		assert_eq!(runner.state(), State::Success);
	}

	#[test]
	fn retries_until_success_and_waits_between_attempts() {
		let delay = Duration::from_millis(40);
		let mut runner = RetryingCommandRunner::new(
			Scripted::new([(128, ""), (128, ""), (0, "")]),
			policy(3, delay),
		)
		.quiet(true);
		let outcome = runner.run(&request()).unwrap();

		assert_eq!(outcome.attempts, 3);
		assert_eq!(outcome.exit_code, 0);
		assert_eq!(outcome.result.stdout, b"attempt 3\n");
		assert!(outcome.elapsed >= delay * 2);
		assert_eq!(runner.launcher().calls, 3);
	}

	#[test]
	fn exhausted_retries_return_last_failure_unchanged() {
		let mut runner = RetryingCommandRunner::new(
			Scripted::new([(128, "first\n"), (128, "second\n"), (128, "third\n")]),
			policy(3, Duration::ZERO),
		)
		.quiet(true);
		let outcome = runner.run(&request()).unwrap();

		assert_eq!(outcome.attempts, 3);
		assert_eq!(outcome.exit_code, 128);
		assert_eq!(outcome.result.stderr, b"third\n");
		assert_eq!(runner.launcher().calls, 3);
		assert_eq!(runner.state(), State::Failed);
	}

	#[test]
	fn fatal_failure_is_not_retried() {
		let mut runner = RetryingCommandRunner::new(
			Scripted::new([(129, "usage: git fetch\n")]),
			policy(5, Duration::ZERO),
		)
		.quiet(true);
		let outcome = runner.run(&request()).unwrap();

		assert_eq!(outcome.attempts, 1);
		assert_eq!(outcome.exit_code, 129);
		assert_eq!(runner.launcher().calls, 1);
	}

	#[test]
	fn network_patterns_gate_retries_when_stderr_is_captured() {
		let classifier = Classifier::default();
		let mut runner = RetryingCommandRunner::new(
			Scripted::new([
				(128, "fatal: unable to access: Could not resolve host: example.com\n"),
				(128, "fatal: couldn't find remote ref refs/heads/gone\n"),
			]),
			policy(5, Duration::ZERO).with_classifier(classifier),
		)
		.quiet(true);
		let outcome = runner.run(&request()).unwrap();

		assert_eq!(outcome.attempts, 2);
		assert_eq!(outcome.exit_code, 128);
	}

	#[test]
	fn pending_cancellation_prevents_a_retry() {
		let cancellation = Cancellation::new();
		cancellation.cancel(libc::SIGTERM);
		let mut runner = RetryingCommandRunner::new(
			Scripted::new([(128, ""), (0, "")]),
			policy(3, Duration::from_secs(30)),
		)
		.with_cancellation(cancellation)
		.quiet(true);
		let outcome = runner.run(&request()).unwrap();

		assert_eq!(outcome.attempts, 1);
		assert_eq!(outcome.interrupted, Some(libc::SIGTERM));
		assert_eq!(runner.launcher().calls, 1);
	}

	#[test]
	fn signal_during_backoff_ends_the_run_early() {
		let cancellation = Cancellation::new();
		let remote = cancellation.clone();
		let canceller = std::thread::spawn(move || {
			std::thread::sleep(Duration::from_millis(100));
			remote.cancel(libc::SIGTERM);
		});

		let mut runner = RetryingCommandRunner::new(
			Scripted::new([(128, ""), (0, "")]),
			policy(3, Duration::from_secs(30)),
		)
		.with_cancellation(cancellation)
		.quiet(true);
		let outcome = runner.run(&request()).unwrap();
		canceller.join().unwrap();

		assert!(outcome.elapsed < Duration::from_secs(10));
		assert_eq!(outcome.attempts, 1);
		assert_eq!(outcome.interrupted, Some(libc::SIGTERM));
		assert_eq!(outcome.exit_code, 128 + libc::SIGTERM);
		assert_eq!(outcome.result.exit_code, 128);
		assert_eq!(runner.state(), State::Failed);
		assert_eq!(runner.launcher().calls, 1);
	}

	#[test]
	fn spawn_failure_is_a_startup_error() {
		let mut runner =
			RetryingCommandRunner::new(Unlaunchable, policy(3, Duration::ZERO)).quiet(true);
		let err = runner.run(&request()).unwrap_err();
		assert!(matches!(err, StartupError::Spawn { .. }));
	}
}
