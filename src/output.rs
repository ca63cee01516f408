//! Diagnostics on stderr. Nothing here ever writes to stdout, which belongs
//! to the wrapped command.

use std::fmt::Display;
use std::io::{self, Write};

use anyhow::Result;
use owo_colors::OwoColorize;

const PREFIX: &str = "git-retry:";
const RULE_WIDTH: usize = 56;

/// A titled block of aligned `label: value` rows, framed by rules.
#[derive(Debug, Default)]
pub struct Summary {
	title: String,
	rows: Vec<(String, Option<String>)>,
}

impl Summary {
	pub fn new(title: impl Into<String>) -> Self {
		Self {
			title: title.into(),
			rows: Vec::new(),
		}
	}

	pub fn row(mut self, label: &str, value: impl Display) -> Self {
		self.rows.push((label.to_owned(), Some(value.to_string())));
		self
	}

	/// A row whose value is absent, rendered dimmed.
	pub fn missing(mut self, label: &str) -> Self {
		self.rows.push((label.to_owned(), None));
		self
	}

	fn label_width(&self) -> usize {
		self.rows
			.iter()
			.map(|(label, _)| label.chars().count() + 1)
			.max()
			.unwrap_or(0)
	}

	pub fn print(&self) {
		let rule = "─".repeat(RULE_WIDTH);
		let width = self.label_width();
		eprintln!("{}", rule.blue());
		eprintln!("{}", self.title.bold().cyan());
		for (label, value) in &self.rows {
			let label = format!("{label}:");
			match value {
				Some(value) => eprintln!("{:<width$} {value}", label.bold()),
				None => eprintln!("{:<width$} {}", label.bold(), "<none>".dimmed()),
			}
		}
		eprintln!("{}", rule.blue());
	}
}

pub fn bullet_list(lines: impl IntoIterator<Item = String>) {
	for line in lines.into_iter().filter(|line| !line.is_empty()) {
		eprintln!("  {} {line}", "•".green());
	}
}

/// Ask a yes/no question on stderr. `auto_yes` skips the prompt.
pub fn confirm(prompt: &str, default_yes: bool, auto_yes: bool) -> Result<bool> {
	if auto_yes {
		return Ok(true);
	}

	let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
	eprint!("{} {} ", prompt.bold(), hint.dimmed());
	io::stderr().flush()?;

	let mut line = String::new();
	io::stdin().read_line(&mut line)?;
	Ok(parse_reply(&line, default_yes))
}

fn parse_reply(reply: &str, default_yes: bool) -> bool {
	match reply.trim().to_ascii_lowercase().as_str() {
		"y" | "yes" => true,
		"n" | "no" => false,
		_ => default_yes,
	}
}

pub fn note(text: &str) {
	eprintln!("{}", text.dimmed());
}

pub fn success(message: &str) {
	eprintln!("{}", message.green().bold());
}

pub fn warn(message: &str) {
	eprintln!("{}", message.yellow().bold());
}

/// Wrapper-mode notice, interleaved with git's own stderr.
pub fn diagnostic(message: &str) {
	eprintln!("{} {message}", PREFIX.yellow().bold());
}

/// Wrapper-mode failure of the wrapper itself.
pub fn error(message: &str) {
	eprintln!("{} {message}", PREFIX.red().bold());
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn replies_fall_back_to_the_default() {
		assert!(parse_reply("y\n", false));
		assert!(parse_reply(" YES ", false));
		assert!(!parse_reply("n", true));
		assert!(parse_reply("\n", true));
		assert!(!parse_reply("maybe", false));
	}

	#[test]
	fn labels_align_on_the_longest() {
		let summary = Summary::new("title")
			.row("Target", "/usr/bin/git")
			.missing("Original moves to");
		assert_eq!(summary.label_width(), "Original moves to:".len());
	}
}
