//! Run control: command line flags and the TOML run configuration.

pub mod args;
pub mod config;

pub use args::Args;
pub use config::RunConfig;
