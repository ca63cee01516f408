use std::path::Path;

use anyhow::Result;

use crate::install::{Action, Installer};
use crate::output;

pub fn run(target: &Path, relocated: Option<&Path>, auto_yes: bool) -> Result<()> {
	let mut installer = Installer::for_current_exe(target)?;
	if let Some(relocated) = relocated {
		installer = installer.relocated(relocated);
	}

	output::Summary::new("Wrapper removal summary")
		.row("Target", installer.target_path().display())
		.row("Restore from", installer.relocated_path().display())
		.print();

	if !output::confirm("Restore the original git?", false, auto_yes)? {
		anyhow::bail!("aborted by user");
	}

	let actions = installer.uninstall()?;
	output::bullet_list(actions.iter().map(ToString::to_string));
	if actions.contains(&Action::NotInstalled) {
		output::warn("Nothing to restore");
	} else {
		output::success("✓ Original git restored");
		output::note("Unset GIT_EXECUTABLE in later steps.");
	}
	Ok(())
}
