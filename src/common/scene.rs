//! Scene loading, parsing, and validation logic.
//!
//! A scene describes one wireless scenario: node groups and their MAC mode,
//! placement and motion, the address block, the echo applications, capture
//! devices and radio parameters. Times are given in seconds and must be
//! finite and non-negative.

use anyhow::Context;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::simulation::contention::ContentionConfig;
use crate::simulation::geometry::Bounds;
use crate::simulation::mobility::{GridLayout, RandomWalk};
use crate::simulation::signal_calculations::PhyParameters;
use crate::simulation::time::SimTime;
use crate::simulation::topology::MacKind;
use crate::simulation::types::{InterfaceId, MAX_UDP_PAYLOAD, NodeId, Role};

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for SceneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            SceneError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for SceneError {}

fn default_task() -> u32 {
    1
}

fn default_ssid() -> String {
    "TLC2022".to_string()
}

fn default_horizon() -> f64 {
    7.0
}

/// IPv4 block the interfaces are numbered from.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AddressBlock {
    pub base: Ipv4Addr,
    pub prefix_len: u8,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MacKindConfig {
    AdHoc,
    Station,
    AccessPoint,
}

impl From<MacKindConfig> for MacKind {
    fn from(kind: MacKindConfig) -> Self {
        match kind {
            MacKindConfig::AdHoc => MacKind::AdHoc,
            MacKindConfig::Station => MacKind::Station,
            MacKindConfig::AccessPoint => MacKind::AccessPoint,
        }
    }
}

fn default_bounds() -> Bounds {
    RandomWalk::default().bounds
}

fn default_min_speed() -> f64 {
    RandomWalk::default().min_speed
}

fn default_max_speed() -> f64 {
    RandomWalk::default().max_speed
}

fn default_direction_change_interval() -> f64 {
    RandomWalk::default().direction_change_interval.as_secs_f64()
}

/// Motion model of a node group.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MotionConfig {
    #[default]
    Stationary,
    #[serde(rename_all = "kebab-case")]
    RandomWalk {
        #[serde(default = "default_bounds")]
        bounds: Bounds,
        #[serde(default = "default_min_speed")]
        min_speed: f64,
        #[serde(default = "default_max_speed")]
        max_speed: f64,
        /// Seconds between heading/speed redraws.
        #[serde(default = "default_direction_change_interval")]
        direction_change_interval: f64,
    },
}

/// Display metadata of one node.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeLabel {
    pub role: Role,
    pub label: String,
    #[serde(default)]
    pub color: Option<[u8; 3]>,
}

/// A group of identical nodes sharing one MAC configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeGroup {
    pub count: usize,
    pub mac: MacKindConfig,
    /// Network name; defaults to the scene SSID.
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub qos_supported: bool,
    #[serde(default)]
    pub motion: MotionConfig,
    /// Per-node labels in creation order; missing entries use role defaults.
    #[serde(default)]
    pub labels: Vec<NodeLabel>,
}

impl NodeGroup {
    /// Role used when a node has no explicit label.
    pub fn default_role(&self) -> Role {
        match self.mac {
            MacKindConfig::AccessPoint => Role::AccessPoint,
            MacKindConfig::AdHoc | MacKindConfig::Station => Role::Relay,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ResponderConfig {
    pub node: NodeId,
    pub port: u16,
    pub start: f64,
    pub stop: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RequesterConfig {
    pub node: NodeId,
    /// Node whose first interface address is the request target.
    pub target_node: NodeId,
    pub port: u16,
    pub packet_size: u32,
    pub max_packets: u32,
    pub interval: f64,
    pub start: f64,
    pub stop: f64,
}

/// Time window in seconds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Window {
    pub start: f64,
    pub stop: f64,
}

fn default_counters_window() -> Window {
    Window { start: 0.0, stop: 7.0 }
}

/// Root structure representing the entire scene.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Scene {
    /// Scenario name used as the output file prefix (`task1`, `task2`, ...).
    pub name: String,
    /// Task number used in the animation file name.
    #[serde(default = "default_task")]
    pub task: u32,
    #[serde(default = "default_ssid")]
    pub ssid: String,
    /// Simulation horizon in seconds.
    #[serde(default = "default_horizon")]
    pub horizon: f64,
    pub address_block: AddressBlock,
    pub grid: GridLayout,
    pub groups: Vec<NodeGroup>,
    #[serde(default)]
    pub responders: Vec<ResponderConfig>,
    #[serde(default)]
    pub requesters: Vec<RequesterConfig>,
    /// Interface ids whose frames are written to capture files.
    #[serde(default)]
    pub capture_devices: Vec<InterfaceId>,
    #[serde(default)]
    pub phy: PhyParameters,
    #[serde(default)]
    pub contention: ContentionConfig,
    /// Window over which the animation reports MAC/PHY counters.
    #[serde(default = "default_counters_window")]
    pub counters_window: Window,
}

/// Convert a configuration time in seconds, rejecting negative or non-finite values.
pub fn seconds(value: f64, what: &str) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|_| format!("{} must be a finite, non-negative number of seconds, got {}", what, value))
}

/// Same as [`seconds`] but as an absolute simulation time.
pub fn sim_time(value: f64, what: &str) -> Result<SimTime, String> {
    seconds(value, what).map(SimTime::from_duration)
}

impl Scene {
    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|g| g.count).sum()
    }

    /// Interfaces are created one per node, so the counts agree.
    pub fn interface_count(&self) -> usize {
        self.node_count()
    }
}

/// Load and parse a scene from a file.
///
/// # Parameters
///
/// * `path` - Path to the scene JSON file
///
/// # Returns
///
/// Parsed and validated Scene or an error.
pub fn load_scene(path: &Path) -> Result<Scene, SceneError> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))
        .map_err(|e| SceneError::FileReadError(e.to_string()))?;

    parse_scene(&data)
}

/// Parse and validate a scene from its JSON text.
pub fn parse_scene(data: &str) -> Result<Scene, SceneError> {
    let scene: Scene = serde_json::from_str(data)
        .context("Invalid JSON format")
        .map_err(|e| SceneError::ParseError(format!("{:#}", e)))?;

    validate_scene(&scene).map_err(SceneError::ValidationError)?;

    Ok(scene)
}

/// Validate a scene.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scene(scene: &Scene) -> Result<(), String> {
    const MAX_NODES: usize = 1000;

    if scene.name.trim().is_empty() {
        return Err("Scene name must not be empty".to_string());
    }
    let horizon = seconds(scene.horizon, "horizon")?;
    if horizon.is_zero() {
        return Err("horizon must be positive".to_string());
    }

    if scene.groups.is_empty() {
        return Err("Scene must contain at least one node group".to_string());
    }
    for (idx, group) in scene.groups.iter().enumerate() {
        if group.count == 0 {
            return Err(format!("Node group {} must contain at least one node", idx));
        }
        if group.labels.len() > group.count {
            return Err(format!("Node group {} has {} labels for {} nodes", idx, group.labels.len(), group.count));
        }
        if let MotionConfig::RandomWalk { direction_change_interval, .. } = group.motion {
            seconds(direction_change_interval, "direction change interval")?;
        }
    }
    let node_count = scene.node_count();
    if node_count > MAX_NODES {
        return Err(format!("Node count {} exceeds maximum of {}", node_count, MAX_NODES));
    }

    if !(1..=30).contains(&scene.address_block.prefix_len) {
        return Err(format!("prefix length /{} is outside 1..=30", scene.address_block.prefix_len));
    }
    if scene.grid.grid_width == 0 {
        return Err("grid width must be at least 1".to_string());
    }

    let node_exists = |node: NodeId| (node as usize) < node_count;
    for responder in &scene.responders {
        if !node_exists(responder.node) {
            return Err(format!("Responder node {} does not exist", responder.node));
        }
        if responder.port == 0 {
            return Err("Responder port must be non-zero".to_string());
        }
        validate_window(responder.start, responder.stop, "responder")?;
    }
    for requester in &scene.requesters {
        if !node_exists(requester.node) || !node_exists(requester.target_node) {
            return Err(format!("Requester {} -> {} references a missing node", requester.node, requester.target_node));
        }
        if requester.node == requester.target_node {
            return Err(format!("Requester on node {} targets its own node", requester.node));
        }
        if requester.packet_size == 0 || requester.max_packets == 0 {
            return Err(format!("Requester on node {} needs a positive packet size and count", requester.node));
        }
        if requester.packet_size > MAX_UDP_PAYLOAD {
            return Err(format!(
                "Requester on node {} packet size {} exceeds the UDP limit of {} bytes",
                requester.node, requester.packet_size, MAX_UDP_PAYLOAD
            ));
        }
        if seconds(requester.interval, "requester interval")?.is_zero() {
            return Err(format!("Requester on node {} has a zero interval", requester.node));
        }
        validate_window(requester.start, requester.stop, "requester")?;
    }

    for device in &scene.capture_devices {
        if *device as usize >= scene.interface_count() {
            return Err(format!("Capture device {} does not exist", device));
        }
    }

    scene.phy.validate()?;
    scene.contention.validate()?;
    validate_window(scene.counters_window.start, scene.counters_window.stop, "counters window")?;

    Ok(())
}

fn validate_window(start: f64, stop: f64, what: &str) -> Result<(), String> {
    let start = seconds(start, &format!("{} start", what))?;
    let stop = seconds(stop, &format!("{} stop", what))?;
    if stop < start {
        return Err(format!("{} stops at {:?}, before it starts at {:?}", what, stop, start));
    }
    Ok(())
}
