use anyhow::{Context, Result};

use crate::config::Settings;
use crate::git::{self, Git};
use crate::output::{self, Summary};

/// Print the resolved settings as JSON on stdout, with a summary on stderr.
pub fn run() -> Result<()> {
	let settings = Settings::from_env()?;

	let mut summary = Summary::new("git-retry configuration");
	summary = match &settings.config_file {
		Some(path) => summary.row("Config file", path.display()),
		None => summary.missing("Config file"),
	};
	let mut problem = None;
	match git::real_executable(settings.git_executable.as_deref()) {
		Ok(path) => {
			summary = summary.row("Real git", path.display());
			summary = match Git::version(&path) {
				Ok(version) => summary.row("Version", version),
				Err(err) => {
					problem = Some(format!("{err:#}"));
					summary.missing("Version")
				}
			};
		}
		Err(err) => {
			problem = Some(err.to_string());
			summary = summary.missing("Real git");
		}
	}
	summary
		.row("Retried subcommands", settings.retry_subcommands.join(", "))
		.row("Max attempts", settings.policy.max_attempts)
		.row(
			"Transfer monitor",
			if settings.monitor.is_some() { "on" } else { "off" },
		)
		.print();
	if let Some(problem) = problem {
		output::warn(&problem);
	}

	let json = serde_json::to_string_pretty(&settings).context("failed to serialize settings")?;
	println!("{json}");
	Ok(())
}
