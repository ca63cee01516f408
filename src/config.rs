use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::git::GIT_EXECUTABLE;
use crate::retry::{Backoff, MonitorSettings, OutputMode, RetryPolicy};

/// Optional JSON file layered between the defaults and the environment.
pub const CONFIG_FILE_VAR: &str = "GIT_RETRY_CONFIG";

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Fully resolved settings for one wrapper invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
	pub git_executable: Option<PathBuf>,
	pub policy: RetryPolicy,
	/// Transfer monitor; `None` unless a speed threshold is configured.
	pub monitor: Option<MonitorSettings>,
	#[serde(with = "crate::retry::secs::option")]
	pub attempt_timeout: Option<Duration>,
	pub output: OutputMode,
	/// Git subcommands that go through the retry policy.
	pub retry_subcommands: Vec<String>,
	pub quiet: bool,
	pub config_file: Option<PathBuf>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			git_executable: None,
			policy: RetryPolicy::default(),
			monitor: None,
			attempt_timeout: None,
			output: OutputMode::default(),
			retry_subcommands: vec!["fetch".to_owned()],
			quiet: false,
			config_file: None,
		}
	}
}

/// Every knob, all optional. Shared by the JSON file and the environment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Overrides {
	pub git_executable: Option<PathBuf>,
	pub max_retries: Option<u32>,
	/// Seconds.
	pub retry_delay: Option<f64>,
	pub backoff: Option<BackoffKind>,
	pub backoff_multiplier: Option<f64>,
	/// Seconds.
	pub max_delay: Option<f64>,
	/// KiB/s.
	pub speed_threshold: Option<u64>,
	pub speed_window_size: Option<usize>,
	/// Seconds.
	pub speed_check_interval: Option<f64>,
	/// Seconds.
	pub timeout_before_speed_check: Option<f64>,
	/// Seconds.
	pub attempt_timeout: Option<f64>,
	pub exit_codes: Option<Vec<i32>>,
	/// Appended to the built-in network patterns.
	pub patterns: Option<Vec<String>>,
	pub subcommands: Option<Vec<String>>,
	pub output: Option<OutputMode>,
	pub quiet: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
	Fixed,
	Exponential,
}

impl FromStr for BackoffKind {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"fixed" | "constant" => Ok(BackoffKind::Fixed),
			"exponential" => Ok(BackoffKind::Exponential),
			other => anyhow::bail!("unknown backoff '{other}' (expected fixed or exponential)"),
		}
	}
}

impl Settings {
	/// Load settings from the process environment.
	pub fn from_env() -> Result<Self> {
		Self::load(|key| std::env::var(key).ok())
	}

	/// Defaults, then the JSON file named by `GIT_RETRY_CONFIG`, then the
	/// environment. `lookup` reads one environment variable.
	pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
		let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
		let mut settings = Settings::default();

		if let Some(path) = lookup(CONFIG_FILE_VAR) {
			let path = PathBuf::from(path);
			let overrides = load_file_overrides(&path)?;
			settings.apply(&overrides)?;
			settings.config_file = Some(path);
		}

		let overrides = load_env_overrides(&lookup)?;
		settings.apply(&overrides)?;
		Ok(settings)
	}

	/// Apply one layer on top of the current values.
	pub fn apply(&mut self, overrides: &Overrides) -> Result<()> {
		if let Some(path) = &overrides.git_executable {
			self.git_executable = Some(path.clone());
		}
		if let Some(max) = overrides.max_retries {
			anyhow::ensure!(max >= 1, "max retries must be at least 1");
			self.policy.max_attempts = max;
		}

		let mut backoff = self.policy.backoff;
		if let Some(kind) = overrides.backoff {
			// Switching kinds keeps the first delay; repeating the current
			// kind keeps everything an earlier layer set.
			backoff = match (kind, backoff) {
				(BackoffKind::Fixed, Backoff::Exponential { initial, .. }) => {
					Backoff::Fixed { delay: initial }
				}
				(BackoffKind::Exponential, Backoff::Fixed { delay }) => Backoff::Exponential {
					initial: delay,
					multiplier: DEFAULT_MULTIPLIER,
					max: DEFAULT_MAX_DELAY,
				},
				(_, unchanged) => unchanged,
			};
		}
		if let Some(delay) = overrides.retry_delay {
			let delay = secs(delay, "retry delay")?;
			match &mut backoff {
				Backoff::Fixed { delay: d } => *d = delay,
				Backoff::Exponential { initial, .. } => *initial = delay,
			}
		}
		if let Backoff::Exponential {
			multiplier, max, ..
		} = &mut backoff
		{
			if let Some(value) = overrides.backoff_multiplier {
				anyhow::ensure!(
					value.is_finite() && value >= 1.0,
					"backoff multiplier must be at least 1"
				);
				*multiplier = value;
			}
			if let Some(value) = overrides.max_delay {
				*max = secs(value, "max delay")?;
			}
		}
		self.policy.backoff = backoff;

		if let Some(threshold) = overrides.speed_threshold {
			match self.monitor.as_mut() {
				Some(monitor) => monitor.threshold_kib = threshold,
				None => self.monitor = Some(MonitorSettings::with_threshold(threshold)),
			}
		}
		if let Some(monitor) = self.monitor.as_mut() {
			if let Some(size) = overrides.speed_window_size {
				anyhow::ensure!(size >= 1, "speed window size must be at least 1");
				monitor.window_size = size;
			}
			if let Some(interval) = overrides.speed_check_interval {
				monitor.check_interval = secs(interval, "speed check interval")?;
			}
			if let Some(grace) = overrides.timeout_before_speed_check {
				monitor.grace = secs(grace, "timeout before speed check")?;
			}
		}

		if let Some(timeout) = overrides.attempt_timeout {
			self.attempt_timeout = Some(secs(timeout, "attempt timeout")?);
		}
		if let Some(codes) = &overrides.exit_codes {
			self.policy.classifier.exit_codes = codes.clone();
		}
		if let Some(patterns) = &overrides.patterns {
			self.policy
				.classifier
				.patterns
				.extend(patterns.iter().filter(|p| !p.is_empty()).cloned());
		}
		if let Some(subcommands) = &overrides.subcommands {
			self.retry_subcommands = subcommands.clone();
		}
		if let Some(output) = overrides.output {
			self.output = output;
		}
		if let Some(quiet) = overrides.quiet {
			self.quiet = quiet;
		}
		Ok(())
	}

	/// Whether invocations of `subcommand` go through the retry policy.
	pub fn retries(&self, subcommand: &str) -> bool {
		self.retry_subcommands.iter().any(|s| s == subcommand)
	}
}

fn secs(value: f64, what: &str) -> Result<Duration> {
	Duration::try_from_secs_f64(value).with_context(|| format!("invalid {what}: {value}"))
}

fn load_file_overrides(path: &Path) -> Result<Overrides> {
	let contents =
		fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
	serde_json::from_str(&contents)
		.with_context(|| format!("failed to parse {} as JSON", path.display()))
}

fn load_env_overrides(lookup: &impl Fn(&str) -> Option<String>) -> Result<Overrides> {
	Ok(Overrides {
		git_executable: lookup(GIT_EXECUTABLE).map(PathBuf::from),
		max_retries: parse(lookup, "GIT_FETCH_MAX_RETRIES")?,
		retry_delay: parse(lookup, "GIT_FETCH_RETRY_DELAY")?,
		backoff: parse(lookup, "GIT_FETCH_BACKOFF")?,
		backoff_multiplier: parse(lookup, "GIT_FETCH_BACKOFF_MULTIPLIER")?,
		max_delay: parse(lookup, "GIT_FETCH_MAX_DELAY")?,
		speed_threshold: parse(lookup, "GIT_FETCH_SPEED_THRESHOLD")?,
		speed_window_size: parse(lookup, "GIT_FETCH_SPEED_WINDOW_SIZE")?,
		speed_check_interval: parse(lookup, "GIT_FETCH_SPEED_CHECK_INTERVAL")?,
		timeout_before_speed_check: parse(lookup, "GIT_FETCH_TIMEOUT_BEFORE_SPEED_CHECK")?,
		attempt_timeout: parse(lookup, "GIT_FETCH_ATTEMPT_TIMEOUT")?,
		exit_codes: lookup("GIT_RETRY_EXIT_CODES")
			.map(|value| parse_list(&value, ',', "GIT_RETRY_EXIT_CODES"))
			.transpose()?,
		patterns: lookup("GIT_RETRY_PATTERNS")
			.map(|value| parse_list(&value, ';', "GIT_RETRY_PATTERNS"))
			.transpose()?,
		subcommands: lookup("GIT_RETRY_SUBCOMMANDS")
			.map(|value| parse_list(&value, ',', "GIT_RETRY_SUBCOMMANDS"))
			.transpose()?,
		output: parse(lookup, "GIT_RETRY_OUTPUT")?,
		quiet: lookup("GIT_RETRY_QUIET")
			.map(|value| parse_bool(&value, "GIT_RETRY_QUIET"))
			.transpose()?,
	})
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
	T: FromStr,
	T::Err: std::fmt::Display,
{
	lookup(key)
		.map(|value| {
			value
				.trim()
				.parse::<T>()
				.map_err(|err| anyhow::anyhow!("invalid value for {key}: '{value}' ({err})"))
		})
		.transpose()
}

fn parse_list<T>(value: &str, separator: char, key: &str) -> Result<Vec<T>>
where
	T: FromStr,
	T::Err: std::fmt::Display,
{
	value
		.split(separator)
		.map(str::trim)
		.filter(|item| !item.is_empty())
		.map(|item| {
			item.parse::<T>()
				.map_err(|err| anyhow::anyhow!("invalid entry in {key}: '{item}' ({err})"))
		})
		.collect()
}

fn parse_bool(value: &str, key: &str) -> Result<bool> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		other => anyhow::bail!("invalid value for {key}: '{other}' (expected true or false)"),
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use pretty_assertions::assert_eq;
	use tempfile::TempDir;

	use super::*;

	fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs
			.iter()
			.map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
			.collect();
		move |key: &str| map.get(key).cloned()
	}

	#[test]
	fn defaults_without_environment() {
		let settings = Settings::load(env(&[])).unwrap();
		assert_eq!(settings, Settings::default());
		assert_eq!(settings.policy.max_attempts, 5);
		assert!(settings.monitor.is_none());
		assert!(settings.retries("fetch"));
		assert!(!settings.retries("status"));
	}

	#[test]
	fn environment_knobs_are_applied() {
		let settings = Settings::load(env(&[
			("GIT_EXECUTABLE", "/usr/bin/git_orig"),
			("GIT_FETCH_MAX_RETRIES", "3"),
			("GIT_FETCH_RETRY_DELAY", "0.5"),
			("GIT_FETCH_BACKOFF", "exponential"),
			("GIT_FETCH_MAX_DELAY", "4"),
			("GIT_FETCH_SPEED_THRESHOLD", "250"),
			("GIT_FETCH_SPEED_WINDOW_SIZE", "8"),
			("GIT_RETRY_EXIT_CODES", "128, 1"),
			("GIT_RETRY_PATTERNS", "proxy error;;bad gateway"),
			("GIT_RETRY_SUBCOMMANDS", "fetch,clone"),
			("GIT_RETRY_OUTPUT", "capture"),
			("GIT_RETRY_QUIET", "yes"),
		]))
		.unwrap();

		assert_eq!(
			settings.git_executable.as_deref(),
			Some(Path::new("/usr/bin/git_orig"))
		);
		assert_eq!(settings.policy.max_attempts, 3);
		assert_eq!(
			settings.policy.backoff,
			Backoff::Exponential {
				initial: Duration::from_millis(500),
				multiplier: 2.0,
				max: Duration::from_secs(4),
			}
		);
		let monitor = settings.monitor.unwrap();
		assert_eq!(monitor.threshold_kib, 250);
		assert_eq!(monitor.window_size, 8);
		assert_eq!(settings.policy.classifier.exit_codes, vec![128, 1]);
		let patterns = &settings.policy.classifier.patterns;
		assert!(patterns.iter().any(|p| p == "proxy error"));
		assert!(patterns.iter().any(|p| p == "bad gateway"));
		assert!(patterns.iter().any(|p| p == "early eof"));
		assert!(settings.retries("clone"));
		assert_eq!(settings.output, OutputMode::Capture);
		assert!(settings.quiet);
	}

	#[test]
	fn empty_values_are_ignored() {
		let settings =
			Settings::load(env(&[("GIT_EXECUTABLE", ""), ("GIT_FETCH_MAX_RETRIES", " ")])).unwrap();
		assert_eq!(settings.git_executable, None);
		assert_eq!(settings.policy.max_attempts, 5);
	}

	#[test]
	fn invalid_values_are_errors() {
		let err = Settings::load(env(&[("GIT_FETCH_MAX_RETRIES", "many")])).unwrap_err();
		assert!(err.to_string().contains("GIT_FETCH_MAX_RETRIES"));
		assert!(Settings::load(env(&[("GIT_FETCH_MAX_RETRIES", "0")])).is_err());
		assert!(Settings::load(env(&[("GIT_FETCH_RETRY_DELAY", "-1")])).is_err());
		assert!(Settings::load(env(&[("GIT_RETRY_OUTPUT", "loud")])).is_err());
	}

	#[test]
	fn monitor_knobs_without_threshold_do_nothing() {
		let settings = Settings::load(env(&[("GIT_FETCH_SPEED_WINDOW_SIZE", "3")])).unwrap();
		assert!(settings.monitor.is_none());
	}

	#[test]
	fn environment_overrides_config_file() {
		let dir = TempDir::new().unwrap();
		let file = dir.path().join("git-retry.json");
		fs::write(
			&file,
			r#"{
				"git_executable": "/opt/git/bin/git",
				"max_retries": 2,
				"retry_delay": 3,
				"subcommands": ["fetch", "pull"],
				"output": "inherit"
			}"#,
		)
		.unwrap();
		let file_str = file.to_string_lossy().into_owned();

		let settings = Settings::load(env(&[
			("GIT_RETRY_CONFIG", file_str.as_str()),
			("GIT_FETCH_MAX_RETRIES", "4"),
		]))
		.unwrap();

		assert_eq!(settings.config_file.as_deref(), Some(file.as_path()));
		assert_eq!(
			settings.git_executable.as_deref(),
			Some(Path::new("/opt/git/bin/git"))
		);
		assert_eq!(settings.policy.max_attempts, 4);
		assert_eq!(
			settings.policy.backoff,
			Backoff::Fixed {
				delay: Duration::from_secs(3)
			}
		);
		assert!(settings.retries("pull"));
		assert_eq!(settings.output, OutputMode::Inherit);
	}

	#[test]
	fn later_layers_keep_earlier_monitor_and_backoff_knobs() {
		let dir = TempDir::new().unwrap();
		let file = dir.path().join("git-retry.json");
		fs::write(
			&file,
			r#"{
				"backoff": "exponential",
				"backoff_multiplier": 3,
				"max_delay": 120,
				"speed_threshold": 500,
				"speed_window_size": 8,
				"timeout_before_speed_check": 5
			}"#,
		)
		.unwrap();
		let file_str = file.to_string_lossy().into_owned();

		let settings = Settings::load(env(&[
			("GIT_RETRY_CONFIG", file_str.as_str()),
			("GIT_FETCH_BACKOFF", "exponential"),
			("GIT_FETCH_SPEED_THRESHOLD", "1000"),
		]))
		.unwrap();

		assert_eq!(
			settings.policy.backoff,
			Backoff::Exponential {
				initial: Duration::from_secs(1),
				multiplier: 3.0,
				max: Duration::from_secs(120),
			}
		);
		assert_eq!(
			settings.monitor,
			Some(MonitorSettings {
				threshold_kib: 1000,
				window_size: 8,
				check_interval: Duration::from_secs(1),
				grace: Duration::from_secs(5),
			})
		);
	}

	#[test]
	fn switching_backoff_kind_keeps_the_first_delay() {
		let mut settings = Settings::default();
		settings
			.apply(&Overrides {
				backoff: Some(BackoffKind::Exponential),
				retry_delay: Some(2.0),
				..Overrides::default()
			})
			.unwrap();
		settings
			.apply(&Overrides {
				backoff: Some(BackoffKind::Fixed),
				..Overrides::default()
			})
			.unwrap();
		assert_eq!(
			settings.policy.backoff,
			Backoff::Fixed {
				delay: Duration::from_secs(2)
			}
		);
	}

	#[test]
	fn unknown_file_keys_are_rejected() {
		let dir = TempDir::new().unwrap();
		let file = dir.path().join("git-retry.json");
		fs::write(&file, r#"{ "max_retires": 2 }"#).unwrap();
		let file_str = file.to_string_lossy().into_owned();
		let err = Settings::load(env(&[("GIT_RETRY_CONFIG", file_str.as_str())])).unwrap_err();
		assert!(format!("{err:#}").contains("max_retires"));
	}
}
