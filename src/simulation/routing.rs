//! IPv4 address assignment and static global routing.
//!
//! Routes are computed once, after addressing, by a breadth-first search from
//! every node over the undirected link graph. Neighbors are explored in
//! interface-id order, which makes tie-breaking between equal-length paths
//! deterministic.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;

use super::topology::Topology;
use super::types::{InterfaceId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    InvalidPrefix(u8),
    AddressesExhausted { network: Ipv4Addr, prefix_len: u8 },
    UnknownInterface(InterfaceId),
    UnaddressedInterface(InterfaceId),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::InvalidPrefix(len) => write!(f, "prefix length /{} is outside 1..=30", len),
            RoutingError::AddressesExhausted { network, prefix_len } => write!(f, "address block {}/{} is exhausted", network, prefix_len),
            RoutingError::UnknownInterface(id) => write!(f, "interface {} does not exist", id),
            RoutingError::UnaddressedInterface(id) => write!(f, "interface {} has no IPv4 address", id),
        }
    }
}

impl std::error::Error for RoutingError {}

/// Hands out consecutive host addresses from one block.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    network: u32,
    prefix_len: u8,
    next_host: u32,
}

impl AddressAllocator {
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Result<Self, RoutingError> {
        if !(1..=30).contains(&prefix_len) {
            return Err(RoutingError::InvalidPrefix(prefix_len));
        }
        let mask = u32::MAX << (32 - prefix_len);
        Ok(Self {
            network: u32::from(base) & mask,
            prefix_len,
            next_host: 1,
        })
    }

    fn host_count(&self) -> u32 {
        // Network and broadcast addresses are reserved.
        (1u32 << (32 - self.prefix_len)) - 2
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Next unused host address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, RoutingError> {
        if self.next_host > self.host_count() {
            return Err(RoutingError::AddressesExhausted {
                network: self.network(),
                prefix_len: self.prefix_len,
            });
        }
        let address = Ipv4Addr::from(self.network + self.next_host);
        self.next_host += 1;
        Ok(address)
    }

    /// Address the given interfaces, in order.
    pub fn assign(&mut self, topology: &mut Topology, interfaces: &[InterfaceId]) -> Result<Vec<Ipv4Addr>, RoutingError> {
        let mut assigned = Vec::with_capacity(interfaces.len());
        for &interface_id in interfaces {
            let address = self.allocate()?;
            let iface = topology.interface_mut(interface_id).ok_or(RoutingError::UnknownInterface(interface_id))?;
            iface.address = Some(address);
            assigned.push(address);
        }
        Ok(assigned)
    }
}

/// First hop toward a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Outgoing interface on the source node.
    pub interface: InterfaceId,
    /// Interface of the neighbor that receives the frame.
    pub next_hop: InterfaceId,
    pub next_node: NodeId,
    pub hops: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutingTable {
    routes: BTreeMap<(NodeId, Ipv4Addr), Route>,
}

impl RoutingTable {
    pub fn compute(topology: &Topology) -> Result<Self, RoutingError> {
        let mut address_of = BTreeMap::new();
        for iface in topology.interfaces() {
            let address = iface.address.ok_or(RoutingError::UnaddressedInterface(iface.interface_id))?;
            address_of.insert(iface.interface_id, address);
        }

        let mut routes = BTreeMap::new();
        for source in topology.nodes() {
            // first_hop[node] = (outgoing iface, neighbor iface, neighbor node, hops)
            let mut first_hop: BTreeMap<NodeId, Route> = BTreeMap::new();
            let mut queue = VecDeque::new();
            queue.push_back(source.node_id);

            while let Some(current) = queue.pop_front() {
                let Some(node) = topology.node(current) else { continue };
                let mut outgoing: Vec<(InterfaceId, InterfaceId)> = node
                    .interfaces
                    .iter()
                    .flat_map(|&local| topology.neighbors(local).iter().map(move |&remote| (local, remote)))
                    .collect();
                outgoing.sort_by_key(|&(local, remote)| (remote, local));

                for (local, remote) in outgoing {
                    let Some(neighbor) = topology.interface(remote).map(|i| i.node_id) else { continue };
                    if neighbor == source.node_id || first_hop.contains_key(&neighbor) {
                        continue;
                    }
                    let route = match first_hop.get(&current) {
                        Some(parent) => Route {
                            hops: parent.hops + 1,
                            ..*parent
                        },
                        None => Route {
                            interface: local,
                            next_hop: remote,
                            next_node: neighbor,
                            hops: 1,
                        },
                    };
                    first_hop.insert(neighbor, route);
                    queue.push_back(neighbor);
                }
            }

            for (destination, route) in &first_hop {
                if let Some(node) = topology.node(*destination) {
                    for iface in &node.interfaces {
                        if let Some(address) = address_of.get(iface) {
                            routes.insert((source.node_id, *address), *route);
                        }
                    }
                }
            }
        }
        Ok(Self { routes })
    }

    pub fn lookup(&self, source: NodeId, destination: Ipv4Addr) -> Option<&Route> {
        self.routes.get(&(source, destination))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::topology::{MacConfig, MacKind, TopologyBuilder};
    use crate::simulation::types::Role;

    fn infrastructure() -> (Topology, Vec<InterfaceId>, InterfaceId) {
        let mut builder = TopologyBuilder::new();
        let stations = builder.build_nodes(5, Role::Relay);
        let ap = builder.build_nodes(1, Role::AccessPoint);
        let sta_ifaces = builder
            .attach_interfaces(&stations, &MacConfig::new(MacKind::Station, "TLC2022", false).unwrap())
            .unwrap();
        let ap_iface = builder
            .attach_interfaces(&ap, &MacConfig::new(MacKind::AccessPoint, "TLC2022", false).unwrap())
            .unwrap()[0];
        (builder.finalize().unwrap(), sta_ifaces, ap_iface)
    }

    #[test]
    fn allocator_hands_out_consecutive_hosts() {
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(192, 168, 1, 0), 24).unwrap();
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(192, 168, 1, 2));
    }

    #[test]
    fn allocator_reports_exhaustion() {
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap();
        assert!(alloc.allocate().is_ok());
        assert!(alloc.allocate().is_ok());
        assert!(matches!(alloc.allocate(), Err(RoutingError::AddressesExhausted { .. })));
        assert_eq!(AddressAllocator::new(Ipv4Addr::new(10, 0, 0, 0), 31).unwrap_err(), RoutingError::InvalidPrefix(31));
    }

    #[test]
    fn stations_route_through_access_point() {
        let (mut topo, stas, ap) = infrastructure();
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(192, 168, 1, 0), 24).unwrap();
        alloc.assign(&mut topo, &stas).unwrap();
        assert_eq!(alloc.assign(&mut topo, &[ap]).unwrap(), vec![Ipv4Addr::new(192, 168, 1, 6)]);

        let table = RoutingTable::compute(&topo).unwrap();
        let route = table.lookup(3, Ipv4Addr::new(192, 168, 1, 1)).unwrap();
        assert_eq!(route.next_node, 5);
        assert_eq!(route.next_hop, ap);
        assert_eq!(route.hops, 2);
        let back = table.lookup(5, Ipv4Addr::new(192, 168, 1, 1)).unwrap();
        assert_eq!((back.next_node, back.hops), (0, 1));
        assert!(table.lookup(3, Ipv4Addr::new(192, 168, 1, 4)).is_none(), "no route to self");
    }

    #[test]
    fn recomputation_is_idempotent() {
        let (mut topo, stas, ap) = infrastructure();
        let mut alloc = AddressAllocator::new(Ipv4Addr::new(192, 168, 1, 0), 24).unwrap();
        alloc.assign(&mut topo, &stas).unwrap();
        alloc.assign(&mut topo, &[ap]).unwrap();
        let first = RoutingTable::compute(&topo).unwrap();
        assert_eq!(first, RoutingTable::compute(&topo).unwrap());
        assert_eq!(first.len(), 6 * 5);
    }

    #[test]
    fn unreachable_pairs_have_no_route_and_unaddressed_interfaces_fail() {
        let mut builder = TopologyBuilder::new();
        let a = builder.build_nodes(2, Role::Relay);
        let b = builder.build_nodes(1, Role::Relay);
        let mut ifaces = builder.attach_interfaces(&a, &MacConfig::new(MacKind::AdHoc, "one", false).unwrap()).unwrap();
        ifaces.extend(builder.attach_interfaces(&b, &MacConfig::new(MacKind::AdHoc, "two", false).unwrap()).unwrap());
        let mut topo = builder.finalize().unwrap();
        assert_eq!(RoutingTable::compute(&topo).unwrap_err(), RoutingError::UnaddressedInterface(0));

        let mut alloc = AddressAllocator::new(Ipv4Addr::new(192, 168, 1, 0), 24).unwrap();
        alloc.assign(&mut topo, &ifaces).unwrap();
        let table = RoutingTable::compute(&topo).unwrap();
        assert!(table.lookup(0, Ipv4Addr::new(192, 168, 1, 2)).is_some());
        assert!(table.lookup(0, Ipv4Addr::new(192, 168, 1, 3)).is_none());
    }
}
