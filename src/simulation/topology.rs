//! Topology construction: nodes, interfaces and the MAC association graph.
//!
//! Interfaces are linked according to their MAC mode:
//! - ad-hoc interfaces sharing a network name form a full mesh,
//! - a station links only to the access point it associated with,
//! - interfaces with different network names never link.

use std::collections::BTreeMap;
use std::fmt;

use super::types::{Interface, InterfaceCounters, InterfaceId, MacMode, Node, NodeId, Point, Role};

/// Maximum SSID length in bytes (IEEE 802.11).
pub const MAX_SSID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacKind {
    AdHoc,
    Station,
    AccessPoint,
}

/// Immutable MAC configuration shared by every interface of one install call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacConfig {
    kind: MacKind,
    ssid: String,
    qos_supported: bool,
}

impl MacConfig {
    pub fn new(kind: MacKind, ssid: impl Into<String>, qos_supported: bool) -> Result<Self, TopologyError> {
        let ssid = ssid.into();
        if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
            return Err(TopologyError::InvalidSsid(ssid));
        }
        Ok(Self { kind, ssid, qos_supported })
    }

    fn mode(&self) -> MacMode {
        let ssid = self.ssid.clone();
        match self.kind {
            MacKind::AdHoc => MacMode::AdHoc { ssid },
            MacKind::Station => MacMode::Station { ssid, access_point: None },
            MacKind::AccessPoint => MacMode::AccessPoint { ssid },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    InvalidSsid(String),
    UnknownNode(NodeId),
    /// A station has no access point with the same network name.
    UnassociatedStation { interface: InterfaceId, ssid: String },
    Empty,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::InvalidSsid(ssid) => write!(f, "invalid network name {:?} (must be 1-{} bytes)", ssid, MAX_SSID_LEN),
            TopologyError::UnknownNode(node) => write!(f, "node {} does not exist", node),
            TopologyError::UnassociatedStation { interface, ssid } => {
                write!(f, "station interface {} has no access point with network name {:?}", interface, ssid)
            }
            TopologyError::Empty => write!(f, "topology contains no nodes"),
        }
    }
}

impl std::error::Error for TopologyError {}

/// Incrementally builds nodes and interfaces, then freezes them into a [`Topology`].
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    nodes: Vec<Node>,
    interfaces: Vec<Interface>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `count` nodes with sequential ids and the given role.
    pub fn build_nodes(&mut self, count: usize, role: Role) -> Vec<NodeId> {
        (0..count)
            .map(|_| {
                let node_id = self.nodes.len() as NodeId;
                self.nodes.push(Node {
                    node_id,
                    role,
                    label: format!("{}-{}", role.default_prefix(), node_id),
                    color: role.default_color(),
                    position: Point::default(),
                    interfaces: Vec::new(),
                });
                node_id
            })
            .collect()
    }

    /// Override the display role, label and color of a node.
    pub fn annotate(&mut self, node_id: NodeId, role: Role, label: &str, color: [u8; 3]) -> Result<(), TopologyError> {
        let node = self.nodes.get_mut(node_id as usize).ok_or(TopologyError::UnknownNode(node_id))?;
        node.role = role;
        node.label = label.to_string();
        node.color = color;
        Ok(())
    }

    /// Attach one interface per node, all configured with `config`.
    pub fn attach_interfaces(&mut self, nodes: &[NodeId], config: &MacConfig) -> Result<Vec<InterfaceId>, TopologyError> {
        let mut attached = Vec::with_capacity(nodes.len());
        for &node_id in nodes {
            let interface_id = self.interfaces.len() as InterfaceId;
            let node = self.nodes.get_mut(node_id as usize).ok_or(TopologyError::UnknownNode(node_id))?;
            node.interfaces.push(interface_id);
            self.interfaces.push(Interface {
                interface_id,
                node_id,
                mac: config.mode(),
                qos_supported: config.qos_supported,
                address: None,
                counters: InterfaceCounters::default(),
            });
            attached.push(interface_id);
        }
        Ok(attached)
    }

    /// Associate stations and compute the link graph.
    pub fn finalize(mut self) -> Result<Topology, TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::Empty);
        }

        let access_points: Vec<(InterfaceId, String)> = self
            .interfaces
            .iter()
            .filter_map(|iface| match &iface.mac {
                MacMode::AccessPoint { ssid } => Some((iface.interface_id, ssid.clone())),
                _ => None,
            })
            .collect();

        for iface in self.interfaces.iter_mut() {
            let interface_id = iface.interface_id;
            if let MacMode::Station { ssid, access_point } = &mut iface.mac {
                let ap = access_points.iter().find(|(_, ap_ssid)| ap_ssid == ssid).map(|(id, _)| *id);
                match ap {
                    Some(ap) => *access_point = Some(ap),
                    None => {
                        return Err(TopologyError::UnassociatedStation {
                            interface: interface_id,
                            ssid: ssid.clone(),
                        });
                    }
                }
            }
        }

        let mut links: BTreeMap<InterfaceId, Vec<InterfaceId>> = self.interfaces.iter().map(|iface| (iface.interface_id, Vec::new())).collect();
        for a in &self.interfaces {
            for b in &self.interfaces {
                if a.interface_id < b.interface_id && a.node_id != b.node_id && linked(&a.mac, &b.mac, a.interface_id, b.interface_id) {
                    links.entry(a.interface_id).or_default().push(b.interface_id);
                    links.entry(b.interface_id).or_default().push(a.interface_id);
                }
            }
        }
        for neighbors in links.values_mut() {
            neighbors.sort_unstable();
        }

        Ok(Topology {
            nodes: self.nodes,
            interfaces: self.interfaces,
            links,
        })
    }
}

fn linked(a: &MacMode, b: &MacMode, a_id: InterfaceId, b_id: InterfaceId) -> bool {
    match (a, b) {
        (MacMode::AdHoc { ssid: sa }, MacMode::AdHoc { ssid: sb }) => sa == sb,
        (MacMode::Station { access_point, .. }, MacMode::AccessPoint { .. }) => *access_point == Some(b_id),
        (MacMode::AccessPoint { .. }, MacMode::Station { access_point, .. }) => *access_point == Some(a_id),
        _ => false,
    }
}

/// Finalized, static topology.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    interfaces: Vec<Interface>,
    links: BTreeMap<InterfaceId, Vec<InterfaceId>>,
}

impl Topology {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(node_id as usize)
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(node_id as usize)
    }

    pub fn interface(&self, interface_id: InterfaceId) -> Option<&Interface> {
        self.interfaces.get(interface_id as usize)
    }

    pub fn interface_mut(&mut self, interface_id: InterfaceId) -> Option<&mut Interface> {
        self.interfaces.get_mut(interface_id as usize)
    }

    /// Interfaces directly linked to `interface_id`, sorted by id.
    pub fn neighbors(&self, interface_id: InterfaceId) -> &[InterfaceId] {
        self.links.get(&interface_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_linked(&self, a: InterfaceId, b: InterfaceId) -> bool {
        self.neighbors(a).binary_search(&b).is_ok()
    }

    /// Node owning the interface with the given address.
    pub fn node_has_address(&self, node_id: NodeId, address: std::net::Ipv4Addr) -> bool {
        self.node(node_id)
            .map(|node| node.interfaces.iter().any(|&i| self.interfaces[i as usize].address == Some(address)))
            .unwrap_or(false)
    }

    /// First address of a node, if any interface is addressed.
    pub fn primary_address(&self, node_id: NodeId) -> Option<std::net::Ipv4Addr> {
        self.node(node_id)?.interfaces.iter().find_map(|&i| self.interfaces[i as usize].address)
    }
}
