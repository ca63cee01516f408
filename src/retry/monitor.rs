//! Transfer-speed watchdog for fetch-like commands.
//!
//! Git reports throughput on its progress lines, e.g.
//! `Receiving objects: 62% (193/310), 14.37 MiB | 28.73 MiB/s`. A transfer
//! that never reports a speed, or whose recent average stays below a
//! threshold, is usually stuck on a bad mirror or connection and is cheaper
//! to restart than to wait out.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::AbortReason;

static SPEED: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(\d+(?:\.\d+)?) (bytes|KiB|MiB|GiB)/s").expect("speed pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
	/// Minimum acceptable average, KiB/s.
	pub threshold_kib: u64,
	/// Number of samples averaged.
	pub window_size: usize,
	#[serde(with = "super::secs")]
	pub check_interval: Duration,
	/// Time allowed before the first speed report.
	#[serde(with = "super::secs")]
	pub grace: Duration,
}

impl MonitorSettings {
	pub fn with_threshold(threshold_kib: u64) -> Self {
		Self {
			threshold_kib,
			..Self::default()
		}
	}
}

impl Default for MonitorSettings {
	fn default() -> Self {
		Self {
			threshold_kib: 1000,
			window_size: 5,
			check_interval: Duration::from_secs(1),
			grace: Duration::from_secs(60),
		}
	}
}

/// Parse the transfer rate of a git progress line into KiB/s.
pub fn parse_speed(line: &str) -> Option<u64> {
	let captures = SPEED.captures(line)?;
	let value: f64 = captures[1].parse().ok()?;
	let kib = match &captures[2] {
		"bytes" => value / 1024.0,
		"KiB" => value,
		"MiB" => value * 1024.0,
		"GiB" => value * 1024.0 * 1024.0,
		_ => return None,
	};
	// Truncation is intended; sub-KiB precision is irrelevant here.
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	Some(kib as u64)
}

#[derive(Debug)]
pub struct TransferMonitor {
	settings: MonitorSettings,
	started: Instant,
	last_check: Instant,
	samples: VecDeque<u64>,
	speed_reported: bool,
}

impl TransferMonitor {
	pub fn new(settings: MonitorSettings, now: Instant) -> Self {
		Self {
			settings,
			started: now,
			last_check: now,
			samples: VecDeque::with_capacity(settings.window_size.max(1)),
			speed_reported: false,
		}
	}

	/// Feed one progress line. Returns whether it carried a speed sample.
	pub fn observe(&mut self, line: &str) -> bool {
		let Some(speed) = parse_speed(line) else {
			return false;
		};
		self.speed_reported = true;
		if self.samples.len() == self.settings.window_size.max(1) {
			self.samples.pop_front();
		}
		self.samples.push_back(speed);
		true
	}

	pub fn average(&self) -> Option<u64> {
		if self.samples.is_empty() {
			return None;
		}
		Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
	}

	/// Decide whether the attempt should be abandoned at `now`.
	pub fn check(&mut self, now: Instant) -> Option<AbortReason> {
		if !self.speed_reported && now.duration_since(self.started) >= self.settings.grace {
			return Some(AbortReason::NoProgress {
				after: self.settings.grace,
			});
		}

		if now.duration_since(self.last_check) < self.settings.check_interval {
			return None;
		}
		self.last_check = now;

		if self.samples.len() < self.settings.window_size.max(1) {
			return None;
		}
		let average = self.average()?;
		(average < self.settings.threshold_kib).then_some(AbortReason::TooSlow {
			average,
			threshold: self.settings.threshold_kib,
		})
	}
}
