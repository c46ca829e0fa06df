pub mod cmd_runner;
pub mod config_loader;
pub mod ipc;
pub mod jsonpath;
