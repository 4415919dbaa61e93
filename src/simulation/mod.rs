//! Discrete-event simulation core.
//!
//! ## Module Organization
//!
//! - `time`, `scheduler`: simulated clock and the ordered event queue
//! - `types`: nodes, interfaces and packets
//! - `topology`: node/interface construction and link discovery
//! - `geometry`, `mobility`: positions, grid placement and bounded random walks
//! - `routing`: address assignment and static shortest-path routes
//! - `signal_calculations`: airtimes and the link budget
//! - `contention`: shared medium, collisions and the RTS/CTS handshake
//! - `echo`: UDP echo responder and requester
//! - `trace`: the time-ordered record of a run
//! - `network`: the driver tying everything onto one timeline
//!
//! ## Public API
//!
//! Build a [`network::Simulator`] from a scene and run it; exporters read the
//! finished state through [`network::Network`].

pub mod contention;
pub mod echo;
pub mod geometry;
pub mod mobility;
pub mod network;
pub mod routing;
pub mod scheduler;
pub mod signal_calculations;
pub mod time;
pub mod topology;
pub mod trace;
pub mod types;

pub use network::Simulator;
