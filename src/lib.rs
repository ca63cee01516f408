pub mod commands;
pub mod config;
pub mod error;
pub mod git;
pub mod install;
pub mod output;
pub mod retry;
