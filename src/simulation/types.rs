//! Type definitions for the simulation.
//!
//! Contains the data structures shared across the simulation:
//! - Nodes, their display role and position
//! - Interfaces with their MAC mode and counters
//! - Packets travelling through the network

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub type NodeId = u32;
pub type InterfaceId = u32;

/// Time-to-live given to every packet created by an application.
pub const DEFAULT_TTL: u8 = 64;

/// Simple 2D point in metres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Role tag, used only for labeling in traces and the animation output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Server,
    Requester,
    Relay,
    AccessPoint,
}

impl Role {
    /// Default animation color for the role.
    pub fn default_color(&self) -> [u8; 3] {
        match self {
            Role::Server => [255, 0, 0],
            Role::Requester => [0, 255, 0],
            Role::Relay => [0, 0, 255],
            Role::AccessPoint => [66, 49, 137],
        }
    }

    /// Default label prefix for the role.
    pub fn default_prefix(&self) -> &'static str {
        match self {
            Role::Server => "SRV",
            Role::Requester => "CLI",
            Role::Relay => "HOC",
            Role::AccessPoint => "AP",
        }
    }
}

/// A simulated node.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: NodeId,
    pub role: Role,
    pub label: String,
    pub color: [u8; 3],
    pub position: Point,
    pub interfaces: Vec<InterfaceId>,
}

/// MAC mode of an interface. The network name (SSID) groups interfaces that
/// may exchange frames; stations additionally record their access point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacMode {
    AdHoc { ssid: String },
    Station { ssid: String, access_point: Option<InterfaceId> },
    AccessPoint { ssid: String },
}

impl MacMode {
    pub fn ssid(&self) -> &str {
        match self {
            MacMode::AdHoc { ssid } | MacMode::Station { ssid, .. } | MacMode::AccessPoint { ssid } => ssid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MacMode::AdHoc { .. } => "ad-hoc",
            MacMode::Station { .. } => "station",
            MacMode::AccessPoint { .. } => "access-point",
        }
    }
}

/// Per-interface MAC/PHY counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InterfaceCounters {
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub rts_sent: u64,
    pub reservations_failed: u64,
    pub drops: u64,
}

/// A network interface attached to exactly one node.
#[derive(Debug, Clone)]
pub struct Interface {
    pub interface_id: InterfaceId,
    pub node_id: NodeId,
    pub mac: MacMode,
    pub qos_supported: bool,
    pub address: Option<Ipv4Addr>,
    pub counters: InterfaceCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacketKind {
    EchoRequest,
    EchoReply,
}

/// An application packet (UDP datagram) travelling through the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub packet_id: u64,
    pub kind: PacketKind,
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination: Ipv4Addr,
    pub destination_port: u16,
    pub payload_size: u32,
    pub sequence: u32,
    pub ttl: u8,
}

/// IPv4 + UDP header bytes added on top of the application payload.
pub const IP_UDP_HEADER_BYTES: u32 = 20 + 8;

/// Largest UDP payload that fits a single IPv4 datagram.
pub const MAX_UDP_PAYLOAD: u32 = u16::MAX as u32 - IP_UDP_HEADER_BYTES;

impl Packet {
    /// Size of the IPv4 datagram carrying this packet.
    pub fn ip_size(&self) -> u32 {
        self.payload_size + IP_UDP_HEADER_BYTES
    }
}
