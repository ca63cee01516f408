//! Putting the wrapper in place of git, and taking it out again.
//!
//! Both operations are idempotent: running them twice leaves the same state
//! as running them once.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::git::GIT_EXECUTABLE;

/// Suffix given to the relocated binary when no explicit path is chosen.
pub const RELOCATED_SUFFIX: &str = "_orig";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
	Relocated { from: PathBuf, to: PathBuf },
	PlacedWrapper { at: PathBuf },
	AlreadyInstalled,
	Restored { from: PathBuf, to: PathBuf },
	NotInstalled,
}

impl fmt::Display for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Action::Relocated { from, to } => {
				write!(f, "moved {} to {}", from.display(), to.display())
			}
			Action::PlacedWrapper { at } => write!(f, "installed wrapper at {}", at.display()),
			Action::AlreadyInstalled => write!(f, "wrapper already installed"),
			Action::Restored { from, to } => {
				write!(f, "restored {} to {}", from.display(), to.display())
			}
			Action::NotInstalled => write!(f, "wrapper not installed; nothing to restore"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct Installer {
	/// Where git is looked up, e.g. `/usr/bin/git`.
	target: PathBuf,
	/// Where the original binary is kept, e.g. `/usr/bin/git_orig`.
	relocated: PathBuf,
	/// The wrapper binary to copy into place.
	wrapper: PathBuf,
}

impl Installer {
	pub fn new(target: impl Into<PathBuf>, wrapper: impl Into<PathBuf>) -> Self {
		let target = target.into();
		let mut relocated = OsString::from(target.as_os_str());
		relocated.push(RELOCATED_SUFFIX);
		Self {
			relocated: PathBuf::from(relocated),
			target,
			wrapper: wrapper.into(),
		}
	}

	/// Installer for the currently running binary.
	pub fn for_current_exe(target: impl Into<PathBuf>) -> Result<Self> {
		let wrapper = std::env::current_exe().context("failed to locate the running executable")?;
		Ok(Self::new(target, wrapper))
	}

	pub fn relocated(mut self, path: impl Into<PathBuf>) -> Self {
		self.relocated = path.into();
		self
	}

	pub fn target_path(&self) -> &Path {
		&self.target
	}

	pub fn relocated_path(&self) -> &Path {
		&self.relocated
	}

	pub fn wrapper_path(&self) -> &Path {
		&self.wrapper
	}

	/// The line a CI step exports so the wrapper finds the real git.
	pub fn export_line(&self) -> String {
		format!("export {GIT_EXECUTABLE}={}", self.relocated.display())
	}

	pub fn is_installed(&self) -> Result<bool> {
		Ok(self.relocated.exists() && self.target_is_wrapper()?)
	}

	pub fn install(&self) -> Result<Vec<Action>> {
		if paths_match(&self.target, &self.wrapper) {
			anyhow::bail!(
				"{} is the wrapper itself; install from a copy outside the target",
				self.target.display()
			);
		}
		if self.is_installed()? {
			return Ok(vec![Action::AlreadyInstalled]);
		}

		let mut actions = Vec::new();
		if !self.relocated.exists() {
			if self.target_is_wrapper()? {
				anyhow::bail!(
					"{} is already this wrapper but {} is missing; put the original git back first",
					self.target.display(),
					self.relocated.display()
				);
			}
			if !self.target.exists() {
				anyhow::bail!("{} does not exist; nothing to wrap", self.target.display());
			}
			fs::rename(&self.target, &self.relocated).with_context(|| {
				format!(
					"failed to move {} to {}",
					self.target.display(),
					self.relocated.display()
				)
			})?;
			actions.push(Action::Relocated {
				from: self.target.clone(),
				to: self.relocated.clone(),
			});
		} else if self.target.exists() {
			anyhow::bail!(
				"both {} and {} exist and {} is not this wrapper; remove one first",
				self.target.display(),
				self.relocated.display(),
				self.target.display()
			);
		}

		self.place_wrapper()?;
		actions.push(Action::PlacedWrapper {
			at: self.target.clone(),
		});
		Ok(actions)
	}

	pub fn uninstall(&self) -> Result<Vec<Action>> {
		if !self.relocated.exists() {
			return Ok(vec![Action::NotInstalled]);
		}
		if self.target.exists() && !self.target_is_wrapper()? {
			anyhow::bail!(
				"{} is not this wrapper; refusing to overwrite it with {}",
				self.target.display(),
				self.relocated.display()
			);
		}

		fs::rename(&self.relocated, &self.target).with_context(|| {
			format!(
				"failed to move {} to {}",
				self.relocated.display(),
				self.target.display()
			)
		})?;
		Ok(vec![Action::Restored {
			from: self.relocated.clone(),
			to: self.target.clone(),
		}])
	}

	fn target_is_wrapper(&self) -> Result<bool> {
		if !self.target.exists() {
			return Ok(false);
		}
		same_contents(&self.target, &self.wrapper)
	}

	/// Copy the wrapper next to the target, then rename it into place.
	fn place_wrapper(&self) -> Result<()> {
		let dir = self
			.target
			.parent()
			.filter(|dir| !dir.as_os_str().is_empty())
			.unwrap_or_else(|| Path::new("."));
		let mut staged = NamedTempFile::new_in(dir)
			.with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
		let mut source = File::open(&self.wrapper)
			.with_context(|| format!("failed to open {}", self.wrapper.display()))?;
		io::copy(&mut source, staged.as_file_mut())
			.with_context(|| format!("failed to copy {}", self.wrapper.display()))?;
		fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o755))?;
		staged
			.persist(&self.target)
			.with_context(|| format!("failed to write {}", self.target.display()))?;
		Ok(())
	}
}

fn paths_match(a: &Path, b: &Path) -> bool {
	match (dunce::canonicalize(a), dunce::canonicalize(b)) {
		(Ok(a), Ok(b)) => a == b,
		_ => false,
	}
}

fn same_contents(a: &Path, b: &Path) -> Result<bool> {
	let meta_a = fs::metadata(a).with_context(|| format!("failed to stat {}", a.display()))?;
	let meta_b = fs::metadata(b).with_context(|| format!("failed to stat {}", b.display()))?;
	if meta_a.len() != meta_b.len() {
		return Ok(false);
	}
	let bytes_a = fs::read(a).with_context(|| format!("failed to read {}", a.display()))?;
	let bytes_b = fs::read(b).with_context(|| format!("failed to read {}", b.display()))?;
	Ok(bytes_a == bytes_b)
}
