//! Retrying invocation of the wrapped executable.
//!
//! The [`RetryingCommandRunner`] owns the attempt loop; a [`Launcher`] performs
//! one attempt. [`ProcessLauncher`] spawns the real process, tests substitute
//! scripted launchers.

pub mod cancel;
pub mod monitor;
pub mod policy;
pub mod process;
pub mod runner;

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use cancel::Cancellation;
pub use monitor::{MonitorSettings, TransferMonitor};
pub use policy::{Backoff, Classifier, RetryPolicy, Verdict};
pub use process::ProcessLauncher;
pub use runner::{Launcher, Outcome, RetryingCommandRunner};

/// One invocation of the wrapped executable.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
	pub program: PathBuf,
	pub args: Vec<OsString>,
	/// Working directory override. `None` inherits the caller's.
	pub cwd: Option<PathBuf>,
	/// Extra environment on top of the inherited one.
	pub env: Vec<(OsString, OsString)>,
}

impl InvocationRequest {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			..Self::default()
		}
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<OsString>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn display_args(&self) -> String {
		self.args
			.iter()
			.map(|arg| arg.to_string_lossy())
			.collect::<Vec<_>>()
			.join(" ")
	}
}

/// Result of a single attempt.
///
/// `stdout`/`stderr` hold whatever the [`OutputMode`] retained: nothing for
/// `Inherit`, all of stdout and a bounded stderr tail for `Stream`, everything
/// for `Capture`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationResult {
	pub exit_code: i32,
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
	pub elapsed: Duration,
	pub abort: Option<AbortReason>,
}

impl InvocationResult {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}

	/// Write the retained output to the given streams.
	pub fn replay(&self, stdout: &mut impl Write, stderr: &mut impl Write) -> io::Result<()> {
		stdout.write_all(&self.stdout)?;
		stdout.flush()?;
		stderr.write_all(&self.stderr)?;
		stderr.flush()
	}
}

/// Why the transfer monitor terminated an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
	NoProgress { after: Duration },
	/// Average speed over the window, in KiB/s.
	TooSlow { average: u64, threshold: u64 },
	TimedOut { after: Duration },
}

impl fmt::Display for AbortReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AbortReason::NoProgress { after } => {
				write!(f, "no transfer speed reported after {:.0}s", after.as_secs_f64())
			}
			AbortReason::TooSlow { average, threshold } => {
				write!(f, "average speed {average} KiB/s below {threshold} KiB/s")
			}
			AbortReason::TimedOut { after } => {
				write!(f, "attempt exceeded {:.0}s", after.as_secs_f64())
			}
		}
	}
}

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
	/// Child writes straight to the caller's streams.
	Inherit,
	/// Forward stderr live and keep its tail; hold stdout until the final attempt.
	#[default]
	Stream,
	/// Buffer everything; the caller replays the final attempt.
	Capture,
}

impl OutputMode {
	pub fn captures_stderr(self) -> bool {
		!matches!(self, OutputMode::Inherit)
	}
}

impl std::str::FromStr for OutputMode {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> anyhow::Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"inherit" => Ok(OutputMode::Inherit),
			"stream" => Ok(OutputMode::Stream),
			"capture" => Ok(OutputMode::Capture),
			other => anyhow::bail!("unknown output mode '{other}' (expected inherit, stream or capture)"),
		}
	}
}

/// Durations serialize as fractional seconds, like the environment knobs.
pub(crate) mod secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_f64(value.as_secs_f64())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let secs = f64::deserialize(deserializer)?;
		Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
	}

	pub mod option {
		use std::time::Duration;

		use serde::Serializer;

		pub fn serialize<S: Serializer>(
			value: &Option<Duration>,
			serializer: S,
		) -> Result<S::Ok, S::Error> {
			match value {
				Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
				None => serializer.serialize_none(),
			}
		}
	}
}
