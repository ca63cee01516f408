//! Git-specific knowledge: locating the real binary, reading its command line
//! and building commands against it.

pub mod args;
pub mod cmd;
pub mod resolve;

pub use cmd::Git;
pub use resolve::{GIT_EXECUTABLE, real_executable};
