pub mod cli;
pub mod commands;
pub mod config;
pub mod dashboard;
pub mod folders;
pub mod orchestrator;
pub mod platform;
pub mod relaunch;
