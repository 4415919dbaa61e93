//! Command line flags.
//!
//! Boolean flags accept `--flag`, `--flag=true` and `--flag=false`, so the
//! usual `--useRtsCts=1`-style invocations keep working.

use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

use crate::common::presets;
use crate::common::scene::Scene;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Ad-hoc mesh of five nodes
    Task1,
    /// Five stations behind one access point
    Task2,
}

impl Scenario {
    pub fn scene(&self, ssid: &str) -> Scene {
        match self {
            Scenario::Task1 => presets::task1(ssid),
            Scenario::Task2 => presets::task2(ssid),
        }
    }
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("expected a boolean, got '{}'", value)),
    }
}

/// Wireless echo simulator
#[derive(Parser, Debug)]
#[command(name = "wifi-echo-simulator")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Protect large frames with an RTS/CTS exchange
    #[arg(long = "useRtsCts", num_args = 0..=1, default_value = "false", default_missing_value = "true", value_parser = parse_flag, action = ArgAction::Set)]
    pub use_rts_cts: bool,

    /// Print the echo application log lines
    #[arg(long, num_args = 0..=1, default_value = "false", default_missing_value = "true", value_parser = parse_flag, action = ArgAction::Set)]
    pub verbose: bool,

    /// Write the animation file
    #[arg(long = "useNetAnim", num_args = 0..=1, default_value = "false", default_missing_value = "true", value_parser = parse_flag, action = ArgAction::Set)]
    pub use_net_anim: bool,

    /// Network name shared by the stations and the access point
    #[arg(long, default_value = "TLC2022")]
    pub ssid: String,

    /// Built-in scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::Task1)]
    pub scenario: Scenario,

    /// Custom scene file replacing the built-in scenario
    #[arg(long)]
    pub scene: Option<PathBuf>,

    /// Run configuration file (defaults to config.toml next to the scene, if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the configured seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the configured output directory
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
}
