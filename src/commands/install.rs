use std::path::Path;

use anyhow::Result;

use crate::install::Installer;
use crate::output;

pub fn run(target: &Path, relocated: Option<&Path>, auto_yes: bool) -> Result<()> {
	let mut installer = Installer::for_current_exe(target)?;
	if let Some(relocated) = relocated {
		installer = installer.relocated(relocated);
	}

	output::Summary::new("Wrapper installation summary")
		.row("Target", installer.target_path().display())
		.row("Original moves to", installer.relocated_path().display())
		.row("Wrapper", installer.wrapper_path().display())
		.print();

	if !output::confirm("Install the retrying wrapper?", true, auto_yes)? {
		anyhow::bail!("aborted by user");
	}

	let actions = installer.install()?;
	output::bullet_list(actions.iter().map(ToString::to_string));
	output::success("✓ Wrapper installed");
	output::note("Export the real git location for the wrapper:");
	println!("{}", installer.export_line());
	Ok(())
}
