//! Configuration loading for the control module.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::common::scene::seconds;
use crate::simulation::network::RunOptions;

fn default_seed() -> u64 {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_position_sample_interval() -> f64 {
    0.25
}

fn default_mobility_tick() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

/// Run settings that live next to the scene files.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RunConfig {
    /// Seed for mobility, backoff and shadowing streams
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Directory receiving capture, animation and report files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Seconds between two position samples in the animation
    #[serde(default = "default_position_sample_interval")]
    pub position_sample_interval: f64,
    /// Seconds between two mobility updates
    #[serde(default = "default_mobility_tick")]
    pub mobility_tick: f64,
    #[serde(default = "default_true")]
    pub write_trace: bool,
    #[serde(default = "default_true")]
    pub write_summary: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            output_dir: default_output_dir(),
            position_sample_interval: default_position_sample_interval(),
            mobility_tick: default_mobility_tick(),
            write_trace: true,
            write_summary: true,
        }
    }
}

impl RunConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    ///
    /// # Returns
    /// * `Ok(RunConfig)` if the file was successfully loaded and parsed
    /// * `Err(String)` with a descriptive error message otherwise
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {}", e))?;

        toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    /// Derive the config path from a scene file path.
    ///
    /// Replaces the scene filename with "config.toml" in the same directory.
    pub fn config_path_from_scene(scene_path: &Path) -> PathBuf {
        scene_path.parent().unwrap_or(Path::new(".")).join("config.toml")
    }

    /// Convert into the options the simulator understands.
    pub fn run_options(&self, rts_cts_enabled: bool) -> Result<RunOptions, String> {
        let mobility_tick = seconds(self.mobility_tick, "mobility-tick")?;
        let position_sample_interval = seconds(self.position_sample_interval, "position-sample-interval")?;
        if mobility_tick.is_zero() || position_sample_interval.is_zero() {
            return Err("mobility-tick and position-sample-interval must be positive".to_string());
        }
        Ok(RunOptions {
            rts_cts_enabled,
            seed: self.seed,
            mobility_tick,
            position_sample_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn loads_partial_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "seed = 42\noutput-dir = \"out\"\nwrite-trace = false").unwrap();
        let config = RunConfig::load(file.path()).unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert!(!config.write_trace);
        assert!(config.write_summary);
        assert_eq!(config.position_sample_interval, 0.25);
    }

    #[test]
    fn rejects_unknown_keys_and_missing_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "speed = 3").unwrap();
        assert!(RunConfig::load(file.path()).unwrap_err().starts_with("Failed to parse"));
        assert!(RunConfig::load(Path::new("/nonexistent/config.toml")).unwrap_err().starts_with("Failed to read"));
    }

    #[test]
    fn run_options_validate_durations() {
        let options = RunConfig::default().run_options(true).unwrap();
        assert!(options.rts_cts_enabled);
        assert!((options.mobility_tick.as_secs_f64() - 0.1).abs() < 1e-9);
        assert_eq!(options.position_sample_interval, Duration::from_millis(250));

        let config = RunConfig {
            mobility_tick: -1.0,
            ..Default::default()
        };
        assert!(config.run_options(false).is_err());
        let config = RunConfig {
            position_sample_interval: 0.0,
            ..Default::default()
        };
        assert!(config.run_options(false).is_err());
    }

    #[test]
    fn config_sits_next_to_scene() {
        assert_eq!(RunConfig::config_path_from_scene(Path::new("scenes/lab.json")), PathBuf::from("scenes/config.toml"));
    }
}
