pub mod exec;
pub mod install;
pub mod show_config;
pub mod uninstall;
pub mod wrapper;
