//! Launching the real executable as a child process.

use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::monitor::{MonitorSettings, TransferMonitor};
use super::runner::Launcher;
use super::{AbortReason, Cancellation, InvocationRequest, InvocationResult, OutputMode};
use crate::error::StartupError;
use crate::git::Git;

/// Bytes of stderr kept for classification when streaming.
const STDERR_TAIL: usize = 64 * 1024;
/// Longest partial progress line buffered before it is dropped.
const MAX_LINE: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time a terminated child gets before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
	mode: OutputMode,
	monitor: Option<MonitorSettings>,
	attempt_timeout: Option<Duration>,
}

impl ProcessLauncher {
	pub fn new(mode: OutputMode) -> Self {
		Self {
			mode,
			..Self::default()
		}
	}

	pub fn with_monitor(mut self, monitor: Option<MonitorSettings>) -> Self {
		self.monitor = monitor;
		self
	}

	pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.attempt_timeout = timeout;
		self
	}

	pub fn mode(&self) -> OutputMode {
		self.mode
	}

	fn pipes_stderr(&self) -> bool {
		self.mode.captures_stderr() || self.monitor.is_some()
	}

	fn supervise(
		&self,
		child: &mut Child,
		lines: &Receiver<String>,
		started: Instant,
	) -> io::Result<(ExitStatus, Option<AbortReason>)> {
		if self.monitor.is_none() && self.attempt_timeout.is_none() {
			return Ok((child.wait()?, None));
		}

		let mut monitor = self.monitor.map(|settings| TransferMonitor::new(settings, started));
		let mut lines_open = true;
		loop {
			if let Some(status) = child.try_wait()? {
				return Ok((status, None));
			}

			if lines_open {
				match lines.recv_timeout(POLL_INTERVAL) {
					Ok(line) => observe(monitor.as_mut(), &line),
					Err(RecvTimeoutError::Timeout) => {}
					Err(RecvTimeoutError::Disconnected) => lines_open = false,
				}
				for line in lines.try_iter() {
					observe(monitor.as_mut(), &line);
				}
			} else {
				thread::sleep(POLL_INTERVAL);
			}

			let now = Instant::now();
			let abort = match self.attempt_timeout {
				Some(limit) if now.duration_since(started) >= limit => {
					Some(AbortReason::TimedOut { after: limit })
				}
				_ => monitor.as_mut().and_then(|monitor| monitor.check(now)),
			};
			if let Some(reason) = abort {
				return Ok((terminate(child)?, Some(reason)));
			}
		}
	}
}

impl Launcher for ProcessLauncher {
	fn launch(
		&mut self,
		request: &InvocationRequest,
		cancellation: &Cancellation,
	) -> Result<InvocationResult, StartupError> {
		let spawn_error = |source| StartupError::Spawn {
			path: request.program.clone(),
			source,
		};

		let started = Instant::now();
		let mut command = Git::from(request).command();
		command.stdin(Stdio::inherit());
		command.stdout(match self.mode {
			OutputMode::Inherit => Stdio::inherit(),
			OutputMode::Stream | OutputMode::Capture => Stdio::piped(),
		});
		command.stderr(if self.pipes_stderr() {
			Stdio::piped()
		} else {
			Stdio::inherit()
		});

		let mut child = command.spawn().map_err(spawn_error)?;
		cancellation.set_child(Some(child.id()));
		if let Some(signal) = cancellation.signal() {
			// Raced with a signal delivered before the child was registered.
			send_signal(&child, signal);
		}

		// Stdout of a failed attempt must never reach the caller, so it is
		// only written once the attempt is known to be the final one.
		let (tx, rx) = mpsc::channel();
		let stdout = child
			.stdout
			.take()
			.map(|pipe| Pump::spawn(pipe, false, Retain::All, None));
		let stderr = child.stderr.take().map(|pipe| {
			let (live, retain) = match self.mode {
				OutputMode::Capture => (false, Retain::All),
				_ => (true, Retain::Tail(STDERR_TAIL)),
			};
			let progress = self.monitor.is_some().then(|| tx.clone());
			Pump::spawn(pipe, live, retain, progress)
		});
		drop(tx);

		let supervised = match self.supervise(&mut child, &rx, started) {
			Ok(supervised) => Ok(supervised),
			Err(err) => {
				let _ = terminate(&mut child);
				Err(err)
			}
		};
		cancellation.set_child(None);
		let (status, abort) = supervised.map_err(spawn_error)?;

		Ok(InvocationResult {
			exit_code: exit_code(status),
			stdout: stdout.map(Pump::finish).unwrap_or_default(),
			stderr: stderr.map(Pump::finish).unwrap_or_default(),
			elapsed: started.elapsed(),
			abort,
		})
	}

	fn captures_stderr(&self) -> bool {
		self.pipes_stderr()
	}
}

fn observe(monitor: Option<&mut TransferMonitor>, line: &str) {
	if let Some(monitor) = monitor {
		monitor.observe(line);
	}
}

/// Exit code as a shell would report it: `128 + N` for a child killed by signal N.
pub fn exit_code(status: ExitStatus) -> i32 {
	status
		.code()
		.unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn send_signal(child: &Child, signal: i32) {
	if let Ok(pid) = i32::try_from(child.id()) {
		// SAFETY: kill(2) has no memory-safety preconditions.
		unsafe {
			libc::kill(pid, signal);
		}
	}
}

/// SIGTERM, then SIGKILL if the child lingers past the grace period.
fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
	send_signal(child, libc::SIGTERM);
	let deadline = Instant::now() + TERMINATE_GRACE;
	while Instant::now() < deadline {
		if let Some(status) = child.try_wait()? {
			return Ok(status);
		}
		thread::sleep(POLL_INTERVAL);
	}
	child.kill()?;
	child.wait()
}

/// Forward a chunk of the child's stderr to ours.
fn forward_stderr(bytes: &[u8]) {
	let mut err = io::stderr().lock();
	// A closed caller stream must not stop the child from being drained.
	let _ = err.write_all(bytes).and_then(|()| err.flush());
}

#[derive(Debug, Clone, Copy)]
enum Retain {
	Tail(usize),
	All,
}

/// Drains one child pipe on its own thread.
struct Pump {
	thread: JoinHandle<Vec<u8>>,
}

impl Pump {
	fn spawn(
		mut pipe: impl Read + Send + 'static,
		live: bool,
		retain: Retain,
		progress: Option<Sender<String>>,
	) -> Self {
		let thread = thread::spawn(move || {
			let mut kept = Vec::new();
			let mut line = Vec::new();
			let mut buf = [0u8; 8192];
			loop {
				let n = match pipe.read(&mut buf) {
					Ok(0) => break,
					Ok(n) => n,
					Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
					Err(_) => break,
				};
				let chunk = &buf[..n];
				if live {
					forward_stderr(chunk);
				}
				keep(&mut kept, chunk, retain);
				if let Some(progress) = &progress {
					split_lines(&mut line, chunk, |text| {
						let _ = progress.send(text);
					});
				}
			}
			kept
		});
		Self { thread }
	}

	fn finish(self) -> Vec<u8> {
		self.thread.join().unwrap_or_default()
	}
}

fn keep(kept: &mut Vec<u8>, chunk: &[u8], retain: Retain) {
	match retain {
		Retain::All => kept.extend_from_slice(chunk),
		Retain::Tail(limit) => {
			kept.extend_from_slice(chunk);
			if kept.len() > limit {
				let excess = kept.len() - limit;
				kept.drain(..excess);
			}
		}
	}
}

/// Split on `\n` and `\r` (git redraws progress with carriage returns).
fn split_lines(partial: &mut Vec<u8>, chunk: &[u8], mut emit: impl FnMut(String)) {
	for &byte in chunk {
		if byte == b'\n' || byte == b'\r' {
			if !partial.is_empty() {
				emit(String::from_utf8_lossy(partial).into_owned());
				partial.clear();
			}
		} else if partial.len() < MAX_LINE {
			partial.push(byte);
		}
	}
}
