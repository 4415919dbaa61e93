//! Scene description shared by the command line front end and the simulator.

pub mod presets;
pub mod scene;

pub use scene::load_scene;
