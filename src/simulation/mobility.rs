//! Node placement and motion.
//!
//! Nodes are placed on a row-major grid whose cursor continues across calls,
//! then either stay put or perform a bounded random walk. Each walking node
//! owns a ChaCha8 stream derived from the run seed and its node id, so the
//! trajectory of one node never depends on how many draws another node made.

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::fmt;
use std::time::Duration;

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use super::geometry::{self, Bounds};
use super::time::SimTime;
use super::types::{NodeId, Point};

/// Row-major grid layout (x advances first, then y).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GridLayout {
    pub min_x: f64,
    pub min_y: f64,
    pub delta_x: f64,
    pub delta_y: f64,
    pub grid_width: u32,
}

impl GridLayout {
    /// Position of the `index`-th cell.
    pub fn cell(&self, index: u32) -> Point {
        let column = index % self.grid_width;
        let row = index / self.grid_width;
        Point::new(self.min_x + self.delta_x * column as f64, self.min_y + self.delta_y * row as f64)
    }
}

/// Parameters of a bounded random walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomWalk {
    pub bounds: Bounds,
    pub min_speed: f64,
    pub max_speed: f64,
    pub direction_change_interval: Duration,
}

impl Default for RandomWalk {
    fn default() -> Self {
        Self {
            bounds: Bounds::square(90.0),
            min_speed: 2.0,
            max_speed: 4.0,
            direction_change_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionModel {
    Stationary,
    BoundedRandomWalk(RandomWalk),
}

/// Integration settings shared by every walking node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MobilityConfig {
    pub tick: Duration,
    pub boundary_epsilon: f64,
    pub seed: u64,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            boundary_epsilon: 0.5,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MobilityError {
    InvalidLayout(String),
    InvalidSpeed { min: f64, max: f64 },
    InvalidBounds(Bounds),
    ZeroInterval,
    /// A node could cross a boundary by more than epsilon within one tick.
    TickTooCoarse { max_speed: f64, tick: Duration, epsilon: f64 },
    StartOutOfBounds { node: NodeId, position: Point },
}

impl fmt::Display for MobilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MobilityError::InvalidLayout(msg) => write!(f, "invalid grid layout: {}", msg),
            MobilityError::InvalidSpeed { min, max } => write!(f, "invalid speed range [{}, {}] m/s", min, max),
            MobilityError::InvalidBounds(b) => write!(f, "invalid bounds [{}, {}] x [{}, {}]", b.min_x, b.max_x, b.min_y, b.max_y),
            MobilityError::ZeroInterval => write!(f, "direction change interval and tick must be positive"),
            MobilityError::TickTooCoarse { max_speed, tick, epsilon } => write!(
                f,
                "max speed {} m/s over a {:?} tick can overshoot a boundary by more than {} m",
                max_speed, tick, epsilon
            ),
            MobilityError::StartOutOfBounds { node, position } => {
                write!(f, "node {} starts at ({}, {}) outside its walk bounds", node, position.x, position.y)
            }
        }
    }
}

impl std::error::Error for MobilityError {}

#[derive(Debug)]
struct WalkState {
    walk: RandomWalk,
    velocity: (f64, f64),
    last_update: SimTime,
    next_direction_change: SimTime,
    rng: ChaCha8Rng,
}

impl WalkState {
    fn redraw(&mut self) {
        let heading = self.rng.gen_range(0.0..TAU);
        let speed = self.rng.gen_range(self.walk.min_speed..=self.walk.max_speed);
        self.velocity = (speed * heading.cos(), speed * heading.sin());
    }
}

/// Places nodes and integrates their motion.
#[derive(Debug)]
pub struct MobilityEngine {
    config: MobilityConfig,
    grid: Option<(GridLayout, u32)>,
    walks: BTreeMap<NodeId, WalkState>,
}

impl MobilityEngine {
    pub fn new(config: MobilityConfig) -> Result<Self, MobilityError> {
        if config.tick.is_zero() {
            return Err(MobilityError::ZeroInterval);
        }
        Ok(Self {
            config,
            grid: None,
            walks: BTreeMap::new(),
        })
    }

    pub fn tick(&self) -> Duration {
        self.config.tick
    }

    /// Assign grid positions to `nodes` in order. Repeated calls with the same
    /// layout continue where the previous call stopped.
    pub fn place_grid(&mut self, layout: GridLayout, count: usize) -> Result<Vec<Point>, MobilityError> {
        if layout.grid_width == 0 {
            return Err(MobilityError::InvalidLayout("grid width must be at least 1".into()));
        }
        if ![layout.min_x, layout.min_y, layout.delta_x, layout.delta_y].iter().all(|v| v.is_finite()) {
            return Err(MobilityError::InvalidLayout("coordinates must be finite".into()));
        }
        let start = match self.grid {
            Some((current, cursor)) if current == layout => cursor,
            _ => 0,
        };
        let positions: Vec<Point> = (start..start + count as u32).map(|i| layout.cell(i)).collect();
        self.grid = Some((layout, start + count as u32));
        Ok(positions)
    }

    /// Attach a motion model to a node currently at `position`.
    pub fn attach_motion(&mut self, node: NodeId, position: Point, model: MotionModel) -> Result<(), MobilityError> {
        let walk = match model {
            MotionModel::Stationary => {
                self.walks.remove(&node);
                return Ok(());
            }
            MotionModel::BoundedRandomWalk(walk) => walk,
        };
        self.validate(&walk)?;
        if !walk.bounds.contains(&position) {
            return Err(MobilityError::StartOutOfBounds { node, position });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(node as u64);
        self.walks.insert(
            node,
            WalkState {
                walk,
                velocity: (0.0, 0.0),
                last_update: SimTime::ZERO,
                next_direction_change: SimTime::ZERO,
                rng,
            },
        );
        Ok(())
    }

    fn validate(&self, walk: &RandomWalk) -> Result<(), MobilityError> {
        if !walk.bounds.is_valid() {
            return Err(MobilityError::InvalidBounds(walk.bounds));
        }
        if !(walk.min_speed.is_finite() && walk.max_speed.is_finite()) || walk.min_speed < 0.0 || walk.min_speed > walk.max_speed {
            return Err(MobilityError::InvalidSpeed {
                min: walk.min_speed,
                max: walk.max_speed,
            });
        }
        if walk.direction_change_interval.is_zero() {
            return Err(MobilityError::ZeroInterval);
        }
        if walk.max_speed * self.config.tick.as_secs_f64() > self.config.boundary_epsilon {
            return Err(MobilityError::TickTooCoarse {
                max_speed: walk.max_speed,
                tick: self.config.tick,
                epsilon: self.config.boundary_epsilon,
            });
        }
        Ok(())
    }

    /// Nodes that need periodic motion ticks, in id order.
    pub fn moving_nodes(&self) -> Vec<NodeId> {
        self.walks.keys().copied().collect()
    }

    /// Advance `node` to `now`, updating `position` in place.
    ///
    /// Returns `false` for stationary nodes, which never move.
    pub fn advance(&mut self, node: NodeId, now: SimTime, position: &mut Point) -> bool {
        let Some(state) = self.walks.get_mut(&node) else {
            return false;
        };
        let dt = now.saturating_duration_since(state.last_update).as_secs_f64();
        if dt > 0.0 {
            let moved = Point::new(position.x + state.velocity.0 * dt, position.y + state.velocity.1 * dt);
            let (reflected, velocity) = geometry::reflect(&state.walk.bounds, moved, state.velocity);
            *position = reflected;
            state.velocity = velocity;
        }
        state.last_update = now;
        while now >= state.next_direction_change {
            state.redraw();
            state.next_direction_change += state.walk.direction_change_interval;
            debug!("Node {} new velocity ({:.3}, {:.3}) m/s at {}", node, state.velocity.0, state.velocity.1, now);
        }
        true
    }
}
