//! Retry policy: attempt budget, backoff schedule and failure classification.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::InvocationResult;

/// Exit code git uses for `die()`, which covers every network failure.
pub const GIT_FATAL_EXIT_CODE: i32 = 128;

/// Stderr fragments that identify a network-level failure of git's transports.
///
/// Matched case-insensitively. Generic fatal messages such as "Could not read
/// from remote repository" are deliberately absent because git prints them
/// for authentication and missing-repository failures too.
pub const DEFAULT_NETWORK_PATTERNS: &[&str] = &[
	"could not resolve host",
	"could not resolve hostname",
	"temporary failure in name resolution",
	"connection timed out",
	"operation timed out",
	"connection reset",
	"connection refused",
	"failed to connect",
	"network is unreachable",
	"the remote end hung up unexpectedly",
	"early eof",
	"unexpected disconnect",
	"rpc failed",
	"index-pack failed",
	"gnutls_handshake",
	"ssl_read",
	"ssl_connect",
	"tls connection was non-properly terminated",
	"http/2 stream",
	"the requested url returned error: 500",
	"the requested url returned error: 502",
	"the requested url returned error: 503",
	"the requested url returned error: 504",
	"connection closed by remote host",
	"kex_exchange_identification",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
	Success,
	Retryable,
	Fatal,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
	Fixed {
		#[serde(with = "super::secs")]
		delay: Duration,
	},
	Exponential {
		#[serde(with = "super::secs")]
		initial: Duration,
		multiplier: f64,
		#[serde(with = "super::secs")]
		max: Duration,
	},
}

impl Backoff {
	/// Delay to wait before retry number `retry` (1 for the first retry).
	pub fn delay_before(&self, retry: u32) -> Duration {
		match *self {
			Backoff::Fixed { delay } => delay,
			Backoff::Exponential {
				initial,
				multiplier,
				max,
			} => {
				let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
				let scaled = initial.as_secs_f64() * multiplier.powi(exponent);
				if !scaled.is_finite() || scaled >= max.as_secs_f64() {
					max
				} else {
					Duration::from_secs_f64(scaled.max(0.0))
				}
			}
		}
	}
}

impl Default for Backoff {
	fn default() -> Self {
		Backoff::Fixed {
			delay: Duration::from_secs(1),
		}
	}
}

/// Decides whether a failed attempt is worth another try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classifier {
	pub exit_codes: Vec<i32>,
	/// Case-insensitive stderr substrings. Empty means exit codes alone decide.
	pub patterns: Vec<String>,
}

impl Classifier {
	/// Retry on the given exit codes regardless of output.
	pub fn exit_codes(codes: impl IntoIterator<Item = i32>) -> Self {
		Self {
			exit_codes: codes.into_iter().collect(),
			patterns: Vec::new(),
		}
	}

	pub fn classify(&self, result: &InvocationResult, stderr_captured: bool) -> Verdict {
		if result.exit_code == 0 {
			return Verdict::Success;
		}
		if result.abort.is_some() {
			return Verdict::Retryable;
		}
		if !self.exit_codes.contains(&result.exit_code) {
			return Verdict::Fatal;
		}
		if self.patterns.is_empty() || !stderr_captured {
			return Verdict::Retryable;
		}

		let stderr = String::from_utf8_lossy(&result.stderr).to_lowercase();
		if self
			.patterns
			.iter()
			.any(|pattern| stderr.contains(&pattern.to_lowercase()))
		{
			Verdict::Retryable
		} else {
			Verdict::Fatal
		}
	}
}

impl Default for Classifier {
	fn default() -> Self {
		Self {
			exit_codes: vec![GIT_FATAL_EXIT_CODE],
			patterns: DEFAULT_NETWORK_PATTERNS
				.iter()
				.map(|s| (*s).to_owned())
				.collect(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Total attempts including the first one. Never below 1.
	pub max_attempts: u32,
	pub backoff: Backoff,
	pub classifier: Classifier,
}

impl RetryPolicy {
	/// A policy that runs the command exactly once.
	pub fn single_attempt() -> Self {
		Self {
			max_attempts: 1,
			..Self::default()
		}
	}

	pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
		self.max_attempts = max_attempts.max(1);
		self
	}

	pub fn with_backoff(mut self, backoff: Backoff) -> Self {
		self.backoff = backoff;
		self
	}

	pub fn with_classifier(mut self, classifier: Classifier) -> Self {
		self.classifier = classifier;
		self
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			backoff: Backoff::default(),
			classifier: Classifier::default(),
		}
	}
}
