use std::ffi::OsString;

use clap::Args;

use super::wrapper;
use crate::config::{Overrides, Settings};
use crate::error::StartupError;
use crate::retry::OutputMode;

/// Options for running one command through the wrapper by hand.
#[derive(Args, Debug)]
pub struct ExecArgs {
	/// Maximum attempts, overriding `GIT_FETCH_MAX_RETRIES`.
	#[arg(long, value_name = "N")]
	pub max_attempts: Option<u32>,
	/// Delay before the first retry in seconds, overriding `GIT_FETCH_RETRY_DELAY`.
	#[arg(long, value_name = "SECONDS")]
	pub delay: Option<f64>,
	/// Output handling: inherit, stream or capture.
	#[arg(long, value_name = "MODE")]
	pub output: Option<String>,
	/// Suppress retry diagnostics.
	#[arg(long, short = 'q')]
	pub quiet: bool,
	/// Arguments passed to git, exactly as they would follow `git`.
	#[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "GIT_ARGS")]
	pub args: Vec<OsString>,
}

impl ExecArgs {
	fn overrides(&self) -> anyhow::Result<Overrides> {
		Ok(Overrides {
			max_retries: self.max_attempts,
			retry_delay: self.delay,
			output: self.output.as_deref().map(str::parse::<OutputMode>).transpose()?,
			quiet: self.quiet.then_some(true),
			..Overrides::default()
		})
	}
}

/// Returns the exit code to terminate with.
pub fn run(args: ExecArgs) -> i32 {
	let settings = Settings::from_env().and_then(|mut settings| {
		settings.apply(&args.overrides()?)?;
		Ok(settings)
	});
	match settings {
		Ok(settings) => wrapper::run_with(args.args, &settings),
		Err(err) => wrapper::startup_failure(&StartupError::Config(err)),
	}
}
