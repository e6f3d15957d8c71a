// Library exports for the Warden process supervisor

pub mod cli;
pub mod config;
pub mod error;
pub mod logs;
pub mod process;
