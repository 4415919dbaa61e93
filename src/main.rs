use anyhow::Context;
use clap::Parser;
use env_logger::Builder;
use log::{LevelFilter, error, info};
use std::path::Path;

use crate::common::load_scene;
use crate::control::{Args, RunConfig};
use crate::simulation::Simulator;

mod common;
mod control;
mod export;
mod simulation;

const ECHO_LOG_TARGET: &str = "wifi_echo_simulator::simulation::echo";

fn init_logging(verbose: bool) {
    let echo_level = if verbose { LevelFilter::Info } else { LevelFilter::Warn };
    Builder::new()
        .filter_level(LevelFilter::Warn)
        .filter(Some("wifi_echo_simulator"), LevelFilter::Info)
        .filter(Some(ECHO_LOG_TARGET), echo_level)
        .parse_default_env()
        .init();
}

fn load_run_config(args: &Args) -> anyhow::Result<RunConfig> {
    let mut config = match (&args.config, &args.scene) {
        (Some(path), _) => RunConfig::load(path).map_err(anyhow::Error::msg).with_context(|| format!("Invalid run configuration {}", path.display()))?,
        (None, Some(scene)) => {
            let path = RunConfig::config_path_from_scene(scene);
            if path.exists() {
                RunConfig::load(&path).map_err(anyhow::Error::msg).with_context(|| format!("Invalid run configuration {}", path.display()))?
            } else {
                RunConfig::default()
            }
        }
        (None, None) => RunConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    Ok(config)
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = load_run_config(args)?;
    let scene = match &args.scene {
        Some(path) => load_scene(path).with_context(|| format!("Failed to load scene {}", path.display()))?,
        None => args.scenario.scene(&args.ssid),
    };
    let options = config.run_options(args.use_rts_cts).map_err(anyhow::Error::msg)?;
    info!("Scenario {} with RTS/CTS {}", scene.name, if options.rts_cts_enabled { "enabled" } else { "disabled" });

    let mut sim = Simulator::build(&scene, &options).context("Failed to build simulation")?;

    let output_dir: &Path = &config.output_dir;
    std::fs::create_dir_all(output_dir).with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
    if args.use_net_anim {
        info!("Setup NetAnim.");
    }
    info!("Enable tracing.");

    sim.run();

    for path in export::pcap::write_captures(sim.network(), output_dir)? {
        info!("Wrote {}", path.display());
    }
    if args.use_net_anim {
        let path = export::netanim::write_animation(sim.network(), output_dir)?;
        info!("Wrote {}", path.display());
    }
    if config.write_trace {
        let path = export::report::write_trace(&sim, output_dir)?;
        info!("Wrote {}", path.display());
    }
    if config.write_summary {
        let path = export::report::write_summary(&sim, output_dir)?;
        info!("Wrote {}", path.display());
    }

    info!("Done.");
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
