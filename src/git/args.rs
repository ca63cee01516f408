//! Inspection of git's command line.
//!
//! Only the subcommand matters to the wrapper; everything else is forwarded
//! byte-for-byte.

use std::ffi::{OsStr, OsString};

/// Global options that consume the following argument when not written as
/// `--opt=value`.
const GLOBAL_OPTIONS_WITH_VALUE: &[&str] = &[
	"-C",
	"-c",
	"--git-dir",
	"--work-tree",
	"--namespace",
	"--super-prefix",
	"--config-env",
	"--list-cmds",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subcommand {
	pub name: String,
	/// Position of the subcommand in the argument vector.
	pub index: usize,
}

/// Find the git subcommand, skipping global options such as `-C <path>`.
pub fn subcommand(args: &[OsString]) -> Option<Subcommand> {
	let mut iter = args.iter().enumerate();
	while let Some((index, arg)) = iter.next() {
		let arg = arg.to_string_lossy();
		if arg == "--" {
			return None;
		}
		if GLOBAL_OPTIONS_WITH_VALUE.contains(&&*arg) {
			iter.next();
			continue;
		}
		if arg.starts_with('-') {
			continue;
		}
		return Some(Subcommand {
			name: arg.into_owned(),
			index,
		});
	}
	None
}

/// Make git print progress to a non-terminal stderr so the transfer monitor
/// has something to read. Leaves the arguments alone when the caller already
/// chose (`--progress`, `--no-progress`, `-q`/`--quiet`).
///
/// Returns whether an argument was added.
pub fn ensure_progress(args: &mut Vec<OsString>, subcommand: &Subcommand) -> bool {
	let after = &args[subcommand.index + 1..];
	let separator = after.iter().position(|arg| arg == "--");
	let options = &after[..separator.unwrap_or(after.len())];

	let chosen = options.iter().any(|arg| {
		let arg: &OsStr = arg;
		arg == "--progress" || arg == "--no-progress" || arg == "-q" || arg == "--quiet"
	});
	if chosen {
		return false;
	}

	let progress = OsString::from("--progress");
	match separator {
		Some(offset) => args.insert(subcommand.index + 1 + offset, progress),
		None => args.push(progress),
	}
	true
}
