use std::path::PathBuf;

use clap::{Parser, Subcommand};
use git_retry::commands::{exec, install, show_config, uninstall, wrapper};

#[derive(Parser, Debug)]
#[command(
	name = "git-retry",
	about = "Drop-in git wrapper that retries flaky network operations",
	long_about = "git-retry stands in for the git executable on CI machines. When invoked \
                  as `git` it forwards every argument to the real binary named by \
                  GIT_EXECUTABLE and retries fetches that fail with transient network \
                  errors. Under any other name it offers the commands below.",
	version
)]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run one git command through the retry logic, as if invoked as `git`.
	Exec(exec::ExecArgs),
	/// Print the resolved configuration as JSON.
	ShowConfig,
	/// Move the real git aside and put this binary in its place.
	Install {
		/// The git executable to replace.
		#[arg(long, default_value = "/usr/bin/git")]
		target: PathBuf,
		/// Where to keep the original (defaults to the target with `_orig` appended).
		#[arg(long)]
		relocated: Option<PathBuf>,
		/// Automatically confirm interactive prompts.
		#[arg(long, short = 'y')]
		yes: bool,
	},
	/// Restore the original git executable.
	Uninstall {
		/// The git executable that was replaced.
		#[arg(long, default_value = "/usr/bin/git")]
		target: PathBuf,
		/// Where the original was kept (defaults to the target with `_orig` appended).
		#[arg(long)]
		relocated: Option<PathBuf>,
		/// Automatically confirm interactive prompts.
		#[arg(long, short = 'y')]
		yes: bool,
	},
}

fn main() -> anyhow::Result<()> {
	let mut argv = std::env::args_os();
	if argv
		.next()
		.is_some_and(|argv0| wrapper::invoked_as_git(&argv0))
	{
		std::process::exit(wrapper::run(argv.collect()));
	}

	let cli = Cli::parse();
	match cli.command {
		Command::Exec(args) => std::process::exit(exec::run(args)),
		Command::ShowConfig => show_config::run(),
		Command::Install {
			target,
			relocated,
			yes,
		} => install::run(&target, relocated.as_deref(), yes),
		Command::Uninstall {
			target,
			relocated,
			yes,
		} => uninstall::run(&target, relocated.as_deref(), yes),
	}
}
