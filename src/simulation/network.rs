//! Central driver wiring the components onto one event timeline.
//!
//! Build flow, each step announced with a status line:
//! 1) Create nodes and attach one interface per node with its MAC mode.
//! 2) Place nodes on the grid and attach their motion models.
//! 3) Number the interfaces and compute static routes.
//! 4) Install the echo applications and seed the timeline with their
//!    start/stop events, the mobility ticks and the position sampler.
//!
//! During the run every frame goes through the contention model; delivery
//! checks collisions and the link budget before handing the packet to the
//! receiving node, which either consumes it or forwards it along its route.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use log::{debug, info};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::contention::{Access, Contention, Frame, ReservationOutcome, TxId};
use super::echo::{EPHEMERAL_PORT_BASE, Requester, RequesterSpec, Responder, ResponderSpec};
use super::geometry;
use super::mobility::{MobilityConfig, MobilityEngine, MobilityError, MotionModel, RandomWalk};
use super::routing::{AddressAllocator, RoutingError, RoutingTable};
use super::scheduler::{Scheduler, SchedulerError};
use super::signal_calculations::{PhyParameters, SIFS, calculate_receiving_limit, calculate_rssi};
use super::time::SimTime;
use super::topology::{MacConfig, Topology, TopologyBuilder, TopologyError};
use super::trace::{AirFrame, AirFrameKind, DropReason, TraceKind, TraceLog, TraceRecord};
use super::types::{InterfaceId, NodeId, Packet, PacketKind};
use crate::common::scene::{self, MotionConfig, Scene};

/// Maximum overshoot past a walk boundary between two mobility ticks.
const BOUNDARY_EPSILON: f64 = 0.5;

/// Stream id of the link-budget RNG (mobility uses the node ids).
const LINK_STREAM: u64 = u64::MAX - 1;

/// Run-level knobs that are not part of the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub rts_cts_enabled: bool,
    pub seed: u64,
    pub mobility_tick: Duration,
    pub position_sample_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rts_cts_enabled: false,
            seed: 1,
            mobility_tick: Duration::from_millis(100),
            position_sample_interval: Duration::from_millis(250),
        }
    }
}

/// Configuration error detected while building the simulation.
#[derive(Debug)]
pub enum BuildError {
    Scene(String),
    Topology(TopologyError),
    Mobility(MobilityError),
    Routing(RoutingError),
    Scheduler(SchedulerError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Scene(msg) => write!(f, "invalid scene: {}", msg),
            BuildError::Topology(e) => write!(f, "topology error: {}", e),
            BuildError::Mobility(e) => write!(f, "mobility error: {}", e),
            BuildError::Routing(e) => write!(f, "routing error: {}", e),
            BuildError::Scheduler(e) => write!(f, "scheduling error: {}", e),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<TopologyError> for BuildError {
    fn from(e: TopologyError) -> Self {
        BuildError::Topology(e)
    }
}

impl From<MobilityError> for BuildError {
    fn from(e: MobilityError) -> Self {
        BuildError::Mobility(e)
    }
}

impl From<RoutingError> for BuildError {
    fn from(e: RoutingError) -> Self {
        BuildError::Routing(e)
    }
}

impl From<SchedulerError> for BuildError {
    fn from(e: SchedulerError) -> Self {
        BuildError::Scheduler(e)
    }
}

/// Everything that can happen on the timeline.
#[derive(Debug)]
pub enum Event {
    ResponderStart(usize),
    ResponderStop(usize),
    RequesterStart(usize),
    RequesterSend(usize),
    RequesterStop(usize),
    /// Application-originated packet leaving `node` (used for echo replies).
    Transmit { node: NodeId, packet: Packet },
    MacAttempt(InterfaceId),
    ReservationComplete { iface: InterfaceId, tx: TxId },
    TransmissionEnd { iface: InterfaceId, tx: TxId, frame: Frame },
    MobilityTick(NodeId),
    PositionSample,
}

/// Schedule `event` at `at`, or immediately if `at` already passed.
fn schedule_no_earlier(sched: &mut Scheduler<Event>, at: SimTime, event: Event) {
    let delay = at.saturating_duration_since(sched.now());
    sched.schedule(delay, event);
}

fn motion_model(motion: &MotionConfig) -> Result<MotionModel, BuildError> {
    Ok(match motion {
        MotionConfig::Stationary => MotionModel::Stationary,
        MotionConfig::RandomWalk {
            bounds,
            min_speed,
            max_speed,
            direction_change_interval,
        } => MotionModel::BoundedRandomWalk(RandomWalk {
            bounds: *bounds,
            min_speed: *min_speed,
            max_speed: *max_speed,
            direction_change_interval: scene::seconds(*direction_change_interval, "direction change interval").map_err(BuildError::Scene)?,
        }),
    })
}

/// Simulation state mutated by event handlers.
pub struct Network {
    scene_name: String,
    task: u32,
    rts_cts_enabled: bool,
    horizon: SimTime,
    position_interval: Duration,
    topology: Topology,
    routes: RoutingTable,
    mobility: MobilityEngine,
    contention: Contention,
    phy: PhyParameters,
    responders: Vec<Responder>,
    requesters: Vec<Requester>,
    trace: TraceLog,
    link_rng: ChaCha8Rng,
    next_packet_id: u64,
    capture_devices: Vec<InterfaceId>,
    captures: BTreeMap<InterfaceId, Vec<AirFrame>>,
    counters_window: (SimTime, SimTime),
}

impl Network {
    pub fn scene_name(&self) -> &str {
        &self.scene_name
    }

    pub fn task(&self) -> u32 {
        self.task
    }

    pub fn rts_cts_enabled(&self) -> bool {
        self.rts_cts_enabled
    }

    pub fn horizon(&self) -> SimTime {
        self.horizon
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn trace(&self) -> &TraceLog {
        &self.trace
    }

    pub fn responders(&self) -> &[Responder] {
        &self.responders
    }

    pub fn requesters(&self) -> &[Requester] {
        &self.requesters
    }

    pub fn capture_devices(&self) -> &[InterfaceId] {
        &self.capture_devices
    }

    pub fn counters_window(&self) -> (SimTime, SimTime) {
        self.counters_window
    }

    /// Frames overheard by a capture device, in air order.
    pub fn captured(&self, device: InterfaceId) -> &[AirFrame] {
        self.captures.get(&device).map(Vec::as_slice).unwrap_or(&[])
    }

    fn node_of(&self, iface: InterfaceId) -> Option<NodeId> {
        self.topology.interface(iface).map(|i| i.node_id)
    }

    fn schedule_initial(&mut self, sched: &mut Scheduler<Event>) -> Result<(), SchedulerError> {
        for (idx, responder) in self.responders.iter().enumerate() {
            sched.schedule_at(responder.spec().start, Event::ResponderStart(idx))?;
            sched.schedule_at(responder.spec().stop, Event::ResponderStop(idx))?;
        }
        for (idx, requester) in self.requesters.iter().enumerate() {
            sched.schedule_at(requester.spec().start, Event::RequesterStart(idx))?;
            sched.schedule_at(requester.spec().stop, Event::RequesterStop(idx))?;
        }
        for node in self.mobility.moving_nodes() {
            sched.schedule_at(SimTime::ZERO, Event::MobilityTick(node))?;
        }
        sched.schedule_at(SimTime::ZERO, Event::PositionSample)?;
        Ok(())
    }

    /// Process a single event.
    pub fn handle(&mut self, sched: &mut Scheduler<Event>, event: Event) {
        let now = sched.now();
        match event {
            Event::ResponderStart(idx) => {
                if let Some(responder) = self.responders.get_mut(idx) {
                    responder.start();
                }
            }
            Event::ResponderStop(idx) => {
                if let Some(responder) = self.responders.get_mut(idx) {
                    responder.stop();
                }
            }
            Event::RequesterStart(idx) => {
                if let Some(requester) = self.requesters.get_mut(idx) {
                    requester.start();
                    self.requester_send(sched, idx);
                }
            }
            Event::RequesterSend(idx) => self.requester_send(sched, idx),
            Event::RequesterStop(idx) => {
                if let Some(pending) = self.requesters.get_mut(idx).and_then(|r| r.stop(now)) {
                    sched.cancel(pending);
                }
            }
            Event::Transmit { node, packet } => {
                self.trace.record(TraceRecord::new(now, node, TraceKind::AppSend).with_packet(&packet));
                self.route_and_queue(sched, node, packet);
            }
            Event::MacAttempt(iface) => self.mac_attempt(sched, iface),
            Event::ReservationComplete { iface, tx } => self.reservation_complete(sched, iface, tx),
            Event::TransmissionEnd { iface, tx, frame } => self.transmission_end(sched, iface, tx, frame),
            Event::MobilityTick(node) => {
                if let Some(n) = self.topology.node_mut(node) {
                    let mut position = n.position;
                    if self.mobility.advance(node, now, &mut position) {
                        n.position = position;
                        let next = now + self.mobility.tick();
                        if next <= self.horizon {
                            sched.schedule(self.mobility.tick(), Event::MobilityTick(node));
                        }
                    }
                }
            }
            Event::PositionSample => {
                for node in self.topology.nodes() {
                    let position = node.position;
                    self.trace.record(TraceRecord::new(now, node.node_id, TraceKind::Position { x: position.x, y: position.y }));
                }
                if now + self.position_interval <= self.horizon {
                    sched.schedule(self.position_interval, Event::PositionSample);
                }
            }
        }
    }

    fn requester_send(&mut self, sched: &mut Scheduler<Event>, idx: usize) {
        let now = sched.now();
        let packet_id = self.next_packet_id;
        let Some(requester) = self.requesters.get_mut(idx) else { return };
        let Some(packet) = requester.next_request(now, packet_id) else { return };
        self.next_packet_id += 1;
        if let Some(at) = requester.follow_up(now) {
            let id = sched.schedule(at.saturating_duration_since(now), Event::RequesterSend(idx));
            requester.set_pending(id, at);
        }
        let node = requester.spec().node;
        self.trace.record(TraceRecord::new(now, node, TraceKind::AppSend).with_packet(&packet));
        self.route_and_queue(sched, node, packet);
    }

    fn route_and_queue(&mut self, sched: &mut Scheduler<Event>, node: NodeId, packet: Packet) {
        let now = sched.now();
        let Some(route) = self.routes.lookup(node, packet.destination).copied() else {
            self.drop_packet(now, node, None, &packet, DropReason::NoRoute);
            return;
        };
        let frame = Frame {
            packet,
            receiver: route.next_hop,
        };
        if let Some(at) = self.contention.enqueue(route.interface, frame, now) {
            schedule_no_earlier(sched, at, Event::MacAttempt(route.interface));
        }
    }

    fn mac_attempt(&mut self, sched: &mut Scheduler<Event>, iface: InterfaceId) {
        let now = sched.now();
        match self.contention.try_access(iface, now) {
            Access::Idle => {}
            Access::Deferred { retry_at } => schedule_no_earlier(sched, retry_at, Event::MacAttempt(iface)),
            Access::RtsStarted { tx, complete_at, frame } => {
                let Some(node) = self.node_of(iface) else { return };
                if let Some(i) = self.topology.interface_mut(iface) {
                    i.counters.rts_sent += 1;
                }
                let mut record = TraceRecord::new(now, node, TraceKind::RtsSent).on_interface(iface).with_packet(&frame.packet);
                if let Some(peer) = self.node_of(frame.receiver) {
                    record = record.with_peer(peer);
                }
                self.trace.record(record);
                let nav = self.phy.reservation_exchange() - self.phy.rts_airtime() + self.protected_airtime(&frame.packet);
                self.overhear(now, iface, frame.receiver, nav, AirFrameKind::Rts);
                schedule_no_earlier(sched, complete_at, Event::ReservationComplete { iface, tx });
            }
            Access::DataStarted { tx, end_at, frame } => self.start_data(sched, iface, tx, end_at, frame),
        }
    }

    fn start_data(&mut self, sched: &mut Scheduler<Event>, iface: InterfaceId, tx: TxId, end_at: SimTime, frame: Frame) {
        let now = sched.now();
        let Some(node) = self.node_of(iface) else { return };
        if let Some(i) = self.topology.interface_mut(iface) {
            i.counters.tx_frames += 1;
            i.counters.tx_bytes += frame.packet.ip_size() as u64;
        }
        let mut record = TraceRecord::new(now, node, TraceKind::Tx).on_interface(iface).with_packet(&frame.packet);
        if let Some(peer) = self.node_of(frame.receiver) {
            record = record.with_peer(peer);
        }
        self.trace.record(record);
        let nav = SIFS + self.phy.ack_airtime();
        self.overhear(now, iface, frame.receiver, nav, AirFrameKind::Data(frame.packet.clone()));
        schedule_no_earlier(sched, end_at, Event::TransmissionEnd { iface, tx, frame });
    }

    fn reservation_complete(&mut self, sched: &mut Scheduler<Event>, iface: InterfaceId, tx: TxId) {
        let now = sched.now();
        let Some(node) = self.node_of(iface) else { return };
        let (topology, phy, rng) = (&self.topology, &self.phy, &mut self.link_rng);
        let cts_heard = |frame: &Frame| match topology.interface(frame.receiver) {
            Some(receiver) => link_up(topology, phy, rng, node, receiver.node_id),
            None => false,
        };
        match self.contention.complete_reservation(iface, tx, now, cts_heard) {
            None => {}
            Some(ReservationOutcome::Granted { tx, end_at, frame }) => {
                self.trace
                    .record(TraceRecord::new(now, node, TraceKind::ReservationGranted).on_interface(iface).with_packet(&frame.packet));
                self.start_data(sched, iface, tx, end_at, frame);
            }
            Some(ReservationOutcome::Failed { retry_at, attempt, frame }) => {
                if let Some(i) = self.topology.interface_mut(iface) {
                    i.counters.reservations_failed += 1;
                }
                self.trace.record(
                    TraceRecord::new(now, node, TraceKind::ReservationFailed { attempt })
                        .on_interface(iface)
                        .with_packet(&frame.packet),
                );
                schedule_no_earlier(sched, retry_at, Event::MacAttempt(iface));
            }
            Some(ReservationOutcome::Exhausted { frame, next_at }) => {
                if let Some(i) = self.topology.interface_mut(iface) {
                    i.counters.reservations_failed += 1;
                }
                let attempt = self.contention.config().max_rts_retries;
                self.trace.record(
                    TraceRecord::new(now, node, TraceKind::ReservationFailed { attempt })
                        .on_interface(iface)
                        .with_packet(&frame.packet),
                );
                self.drop_packet(now, node, Some(iface), &frame.packet, DropReason::MediumAccessFailure);
                if let Some(at) = next_at {
                    schedule_no_earlier(sched, at, Event::MacAttempt(iface));
                }
            }
        }
    }

    fn transmission_end(&mut self, sched: &mut Scheduler<Event>, iface: InterfaceId, tx: TxId, frame: Frame) {
        let now = sched.now();
        let Some(outcome) = self.contention.complete_transmission(iface, tx, now) else { return };
        if let Some(at) = outcome.next_at {
            schedule_no_earlier(sched, at, Event::MacAttempt(iface));
        }
        let (Some(sender), Some(receiver)) = (self.node_of(iface), self.node_of(frame.receiver)) else { return };

        if outcome.transmission.collided {
            self.drop_packet(now, sender, Some(iface), &frame.packet, DropReason::Collision);
            return;
        }
        if !self.in_range(sender, receiver) {
            self.drop_packet(now, sender, Some(iface), &frame.packet, DropReason::OutOfRange);
            return;
        }

        if let Some(i) = self.topology.interface_mut(frame.receiver) {
            i.counters.rx_frames += 1;
            i.counters.rx_bytes += frame.packet.ip_size() as u64;
        }
        self.trace.record(
            TraceRecord::new(now, receiver, TraceKind::Rx)
                .on_interface(frame.receiver)
                .with_packet(&frame.packet)
                .with_peer(sender),
        );
        self.receive(sched, receiver, frame.packet);
    }

    fn in_range(&mut self, from: NodeId, to: NodeId) -> bool {
        link_up(&self.topology, &self.phy, &mut self.link_rng, from, to)
    }

    /// Medium time a reservation protects after the CTS: `data + SIFS + ACK`.
    fn protected_airtime(&self, packet: &Packet) -> Duration {
        self.phy.data_airtime(packet.ip_size()) + SIFS + self.phy.ack_airtime()
    }

    /// Hand a frame that just went on the air to every capture device that
    /// can hear it. Capture devices hear their own frames and anything sent
    /// from within the effective range at the start of the frame.
    fn overhear(&mut self, now: SimTime, transmitter: InterfaceId, receiver: InterfaceId, duration: Duration, kind: AirFrameKind) {
        let Some(origin) = self.node_of(transmitter).and_then(|n| self.topology.node(n)).map(|n| n.position) else { return };
        let range = self.phy.effective_distance() as f64;
        for (&device, frames) in self.captures.iter_mut() {
            let Some(listener) = self.topology.interface(device).and_then(|i| self.topology.node(i.node_id)) else { continue };
            if device == transmitter || geometry::distance(&origin, &listener.position) <= range {
                frames.push(AirFrame {
                    time: now,
                    transmitter,
                    receiver,
                    duration,
                    kind: kind.clone(),
                });
            }
        }
    }

    fn receive(&mut self, sched: &mut Scheduler<Event>, node: NodeId, mut packet: Packet) {
        if self.topology.node_has_address(node, packet.destination) {
            self.deliver_local(sched, node, packet);
            return;
        }
        let now = sched.now();
        packet.ttl = packet.ttl.saturating_sub(1);
        if packet.ttl == 0 {
            self.drop_packet(now, node, None, &packet, DropReason::TtlExpired);
            return;
        }
        self.trace.record(TraceRecord::new(now, node, TraceKind::Forward).with_packet(&packet));
        self.route_and_queue(sched, node, packet);
    }

    fn deliver_local(&mut self, sched: &mut Scheduler<Event>, node: NodeId, packet: Packet) {
        let now = sched.now();
        match packet.kind {
            PacketKind::EchoRequest => {
                let port = packet.destination_port;
                let Some(responder) = self.responders.iter_mut().find(|r| r.spec().node == node && r.spec().port == port) else {
                    self.drop_packet(now, node, None, &packet, DropReason::UnknownPort);
                    return;
                };
                match responder.handle_request(now, &packet, self.next_packet_id) {
                    Ok(reply) => {
                        self.next_packet_id += 1;
                        self.trace.record(TraceRecord::new(now, node, TraceKind::AppReceive).with_packet(&packet));
                        sched.schedule(Duration::ZERO, Event::Transmit { node, packet: reply });
                    }
                    Err(reason) => self.drop_packet(now, node, None, &packet, reason),
                }
            }
            PacketKind::EchoReply => {
                let port = packet.destination_port;
                let Some(requester) = self.requesters.iter_mut().find(|r| r.spec().node == node && r.local_port() == port) else {
                    self.drop_packet(now, node, None, &packet, DropReason::UnknownPort);
                    return;
                };
                requester.handle_reply(now, &packet);
                self.trace.record(TraceRecord::new(now, node, TraceKind::AppReceive).with_packet(&packet));
            }
        }
    }

    fn drop_packet(&mut self, now: SimTime, node: NodeId, iface: Option<InterfaceId>, packet: &Packet, reason: DropReason) {
        debug!("Node {} dropped packet {} at {}: {}", node, packet.packet_id, now, reason.name());
        let mut record = TraceRecord::new(now, node, TraceKind::Drop { reason }).with_packet(packet);
        if let Some(iface) = iface {
            if let Some(i) = self.topology.interface_mut(iface) {
                i.counters.drops += 1;
            }
            record = record.on_interface(iface);
        }
        self.trace.record(record);
    }
}

/// Link budget check between the current positions of two nodes.
fn link_up(topology: &Topology, phy: &PhyParameters, rng: &mut ChaCha8Rng, from: NodeId, to: NodeId) -> bool {
    let (Some(a), Some(b)) = (topology.node(from), topology.node(to)) else {
        return false;
    };
    let distance = geometry::distance(&a.position, &b.position) as f32;
    let rssi = calculate_rssi(distance, phy.tx_power_dbm, &phy.path_loss, rng);
    rssi >= calculate_receiving_limit(phy.data_rate_mbps, &phy.path_loss)
}

/// Owns the timeline and the network state.
pub struct Simulator {
    scheduler: Scheduler<Event>,
    network: Network,
    seed: u64,
}

impl Simulator {
    /// Validate `scene` and build every component. No event runs yet.
    pub fn build(scene: &Scene, options: &RunOptions) -> Result<Self, BuildError> {
        scene::validate_scene(scene).map_err(BuildError::Scene)?;
        if options.position_sample_interval.is_zero() {
            return Err(BuildError::Scene("position sample interval must be positive".into()));
        }
        let horizon = scene::sim_time(scene.horizon, "horizon").map_err(BuildError::Scene)?;

        info!("Create nodes.");
        let mut builder = TopologyBuilder::new();
        let mut group_nodes = Vec::with_capacity(scene.groups.len());
        for group in &scene.groups {
            let nodes = builder.build_nodes(group.count, group.default_role());
            for (&node, label) in nodes.iter().zip(&group.labels) {
                builder.annotate(node, label.role, &label.label, label.color.unwrap_or(label.role.default_color()))?;
            }
            group_nodes.push(nodes);
        }

        info!("Create and install channels.");
        let mut group_interfaces = Vec::with_capacity(scene.groups.len());
        for (group, nodes) in scene.groups.iter().zip(&group_nodes) {
            let ssid = group.ssid.as_deref().unwrap_or(&scene.ssid);
            let config = MacConfig::new(group.mac.into(), ssid, group.qos_supported)?;
            group_interfaces.push(builder.attach_interfaces(nodes, &config)?);
        }
        let mut topology = builder.finalize()?;
        let contention_config = super::contention::ContentionConfig {
            rts_cts_enabled: options.rts_cts_enabled,
            ..scene.contention
        };
        let contention = Contention::new(contention_config, scene.phy.clone(), options.seed);

        info!("Setup mobility.");
        let mut mobility = MobilityEngine::new(MobilityConfig {
            tick: options.mobility_tick,
            boundary_epsilon: BOUNDARY_EPSILON,
            seed: options.seed,
        })?;
        for (group, nodes) in scene.groups.iter().zip(&group_nodes) {
            let model = motion_model(&group.motion)?;
            let positions = mobility.place_grid(scene.grid, nodes.len())?;
            for (&node, position) in nodes.iter().zip(positions) {
                if let Some(n) = topology.node_mut(node) {
                    n.position = position;
                }
                mobility.attach_motion(node, position, model)?;
            }
        }

        info!("Internet stack.");
        debug!("{} nodes, {} interfaces", topology.nodes().len(), topology.interfaces().len());

        info!("Assign IPv4 Addresses.");
        let mut allocator = AddressAllocator::new(scene.address_block.base, scene.address_block.prefix_len)?;
        for interfaces in &group_interfaces {
            let assigned = allocator.assign(&mut topology, interfaces)?;
            debug!("Assigned {:?}", assigned);
        }

        info!("Create applications.");
        let address_of = |node: NodeId| topology.primary_address(node).ok_or_else(|| BuildError::Scene(format!("node {} has no address", node)));
        let mut responders = Vec::with_capacity(scene.responders.len());
        for config in &scene.responders {
            let spec = ResponderSpec {
                node: config.node,
                port: config.port,
                start: scene::sim_time(config.start, "responder start").map_err(BuildError::Scene)?,
                stop: scene::sim_time(config.stop, "responder stop").map_err(BuildError::Scene)?,
            };
            spec.validate().map_err(BuildError::Scene)?;
            responders.push(Responder::new(spec, address_of(config.node)?));
        }
        let mut next_port: BTreeMap<NodeId, u16> = BTreeMap::new();
        let mut requesters = Vec::with_capacity(scene.requesters.len());
        for config in &scene.requesters {
            let spec = RequesterSpec {
                node: config.node,
                target: address_of(config.target_node)?,
                port: config.port,
                packet_size: config.packet_size,
                max_packets: config.max_packets,
                interval: scene::seconds(config.interval, "requester interval").map_err(BuildError::Scene)?,
                start: scene::sim_time(config.start, "requester start").map_err(BuildError::Scene)?,
                stop: scene::sim_time(config.stop, "requester stop").map_err(BuildError::Scene)?,
            };
            spec.validate().map_err(BuildError::Scene)?;
            let port = next_port.entry(config.node).or_insert(EPHEMERAL_PORT_BASE);
            requesters.push(Requester::new(spec, address_of(config.node)?, *port));
            *port += 1;
        }

        info!("Enable static global routing.");
        let routes = RoutingTable::compute(&topology)?;
        debug!("{} routes", routes.len());

        let mut link_rng = ChaCha8Rng::seed_from_u64(options.seed);
        link_rng.set_stream(LINK_STREAM);
        let counters_window = (
            scene::sim_time(scene.counters_window.start, "counters window start").map_err(BuildError::Scene)?,
            scene::sim_time(scene.counters_window.stop, "counters window stop").map_err(BuildError::Scene)?,
        );

        let mut network = Network {
            scene_name: scene.name.clone(),
            task: scene.task,
            rts_cts_enabled: options.rts_cts_enabled,
            horizon,
            position_interval: options.position_sample_interval,
            topology,
            routes,
            mobility,
            contention,
            phy: scene.phy.clone(),
            responders,
            requesters,
            trace: TraceLog::new(),
            link_rng,
            next_packet_id: 0,
            capture_devices: scene.capture_devices.clone(),
            captures: scene.capture_devices.iter().map(|&device| (device, Vec::new())).collect(),
            counters_window,
        };
        let mut scheduler = Scheduler::new();
        network.schedule_initial(&mut scheduler)?;

        Ok(Self {
            scheduler,
            network,
            seed: options.seed,
        })
    }

    /// Drain the timeline up to the horizon. Returns `false` if the run was stopped early.
    pub fn run(&mut self) -> bool {
        info!("Run Simulation.");
        let horizon = self.network.horizon;
        let network = &mut self.network;
        let completed = self.scheduler.run(horizon, |sched, event| network.handle(sched, event));
        info!("Processed {} events, {} trace records", self.scheduler.executed(), self.network.trace.len());
        completed
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn executed_events(&self) -> u64 {
        self.scheduler.executed()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::presets;

    fn run(scene: &Scene, rts_cts_enabled: bool, seed: u64) -> Simulator {
        let options = RunOptions {
            rts_cts_enabled,
            seed,
            ..Default::default()
        };
        let mut sim = Simulator::build(scene, &options).unwrap();
        assert!(sim.run());
        sim
    }

    fn app_sends(trace: &TraceLog, node: NodeId, kind: PacketKind) -> Vec<SimTime> {
        trace
            .for_node(node)
            .filter(|r| r.kind == TraceKind::AppSend && r.packet.as_ref().is_some_and(|p| p.kind == kind))
            .map(|r| r.time)
            .collect()
    }

    fn app_receives(trace: &TraceLog, node: NodeId, kind: PacketKind) -> Vec<SimTime> {
        trace
            .for_node(node)
            .filter(|r| r.kind == TraceKind::AppReceive && r.packet.as_ref().is_some_and(|p| p.kind == kind))
            .map(|r| r.time)
            .collect()
    }

    #[test]
    fn identical_seeds_produce_identical_traces() {
        for scene in [presets::task1("TLC2022"), presets::task2("TLC2022")] {
            for rts in [false, true] {
                let a = run(&scene, rts, 5);
                let b = run(&scene, rts, 5);
                assert_eq!(a.network().trace().signature(), b.network().trace().signature());
                assert_eq!(a.network().trace().records(), b.network().trace().records());
            }
        }
        let a = run(&presets::task1("TLC2022"), false, 5);
        let c = run(&presets::task1("TLC2022"), false, 6);
        assert_ne!(a.network().trace().records(), c.network().trace().records(), "positions depend on the seed");
    }

    #[test]
    fn requesters_respect_count_and_window() {
        for scene in [presets::task1("TLC2022"), presets::task2("TLC2022")] {
            let sim = run(&scene, true, 1);
            for requester in sim.network().requesters() {
                let spec = requester.spec();
                let sends = app_sends(sim.network().trace(), spec.node, PacketKind::EchoRequest);
                assert!(sends.len() as u32 <= spec.max_packets);
                assert_eq!(sends.len(), 2);
                assert!(sends.iter().all(|t| *t >= spec.start && *t <= spec.stop), "{:?}", sends);
            }
        }
    }

    #[test]
    fn responder_replies_once_per_received_request() {
        for rts in [false, true] {
            let sim = run(&presets::task1("TLC2022"), rts, 3);
            let trace = sim.network().trace();
            let received = app_receives(trace, 0, PacketKind::EchoRequest);
            let replied = app_sends(trace, 0, PacketKind::EchoReply);
            assert_eq!(received, replied);
            assert_eq!(sim.network().responders()[0].stats().served as usize, received.len());
        }
    }

    #[test]
    fn reservation_flag_is_irrelevant_below_threshold() {
        let mut scene = presets::task1("TLC2022");
        for requester in &mut scene.requesters {
            requester.packet_size = 64;
        }
        let off = run(&scene, false, 2);
        let on = run(&scene, true, 2);
        assert_eq!(off.network().trace().records(), on.network().trace().records());
        assert!(!on.network().trace().records().iter().any(|r| r.kind == TraceKind::RtsSent));
    }

    #[test]
    fn ad_hoc_requester_gets_both_replies_without_contention() {
        let mut scene = presets::task1("TLC2022");
        scene.requesters.retain(|r| r.node == 4);
        let sim = run(&scene, false, 1);
        let trace = sim.network().trace();
        let sends = app_sends(trace, 4, PacketKind::EchoRequest);
        let replies = app_receives(trace, 4, PacketKind::EchoReply);
        assert_eq!(sends, vec![SimTime::from_secs(1), SimTime::from_secs(2)]);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|t| *t >= SimTime::from_secs(1) && *t <= SimTime::from_secs(3)));
        let stats = sim.network().requesters()[0].stats();
        assert_eq!((stats.sent, stats.replies, stats.lost), (2, 2, 0));
    }

    #[test]
    fn every_data_frame_follows_a_reservation_when_enabled() {
        let sim = run(&presets::task1("TLC2022"), true, 1);
        let trace = sim.network().trace();
        for node in [3, 4] {
            let mut reserved = false;
            let mut data_frames = 0;
            for record in trace.for_node(node) {
                match record.kind {
                    TraceKind::ReservationGranted | TraceKind::ReservationFailed { .. } => reserved = true,
                    TraceKind::Tx => {
                        assert!(reserved, "node {} sent data at {} without a reservation", node, record.time);
                        reserved = false;
                        data_frames += 1;
                    }
                    _ => {}
                }
            }
            assert!(data_frames > 0);
        }
    }

    #[test]
    fn handshake_resolves_simultaneous_requests() {
        // Node 4's second request and node 3's first one both leave at t = 2 s.
        let off = run(&presets::task1("TLC2022"), false, 1);
        let collisions = off.network().trace().drop_counts().get(&DropReason::Collision).copied().unwrap_or(0);
        assert!(collisions >= 2);

        let on = run(&presets::task1("TLC2022"), true, 1);
        let trace = on.network().trace();
        assert!(trace.records().iter().any(|r| matches!(r.kind, TraceKind::ReservationFailed { .. })));
        assert!(
            !trace
                .records()
                .iter()
                .any(|r| r.kind == TraceKind::Drop { reason: DropReason::Collision })
        );
        for requester in on.network().requesters() {
            let stats = requester.stats();
            assert_eq!(stats.replies + stats.late_replies, stats.sent);
        }
    }

    #[test]
    fn station_traffic_crosses_the_access_point() {
        let sim = run(&presets::task2("TLC2022"), false, 1);
        let trace = sim.network().trace();
        let first_request = trace
            .for_node(3)
            .find(|r| r.kind == TraceKind::AppSend)
            .and_then(|r| r.packet.clone())
            .unwrap();
        let hops: Vec<(NodeId, Option<NodeId>)> = trace
            .records()
            .iter()
            .filter(|r| r.kind == TraceKind::Tx && r.packet.as_ref().is_some_and(|p| p.packet_id == first_request.packet_id))
            .map(|r| (r.node, r.peer))
            .collect();
        assert_eq!(hops, vec![(3, Some(5)), (5, Some(0))]);
        assert!(trace.for_node(5).any(|r| r.kind == TraceKind::Forward));
        assert!(!trace.records().iter().any(|r| r.kind == TraceKind::Tx && r.node < 5 && r.peer.is_some_and(|p| p < 5)));
    }

    #[test]
    fn position_samples_cover_the_window() {
        let sim = run(&presets::task2("TLC2022"), false, 1);
        let samples: Vec<_> = sim.network().trace().records().iter().filter(|r| matches!(r.kind, TraceKind::Position { .. })).collect();
        assert_eq!(samples.len(), 6 * 29);
        assert_eq!(samples.last().map(|r| r.time), Some(SimTime::from_secs(7)));
        let ap: Vec<_> = samples.iter().filter(|r| r.node == 5).map(|r| r.kind.clone()).collect();
        assert!(ap.iter().all(|k| *k == TraceKind::Position { x: 10.0, y: 10.0 }), "access point is stationary on the sixth cell");
    }

    #[test]
    fn unassociated_station_fails_before_the_run() {
        let mut scene = presets::task2("TLC2022");
        scene.groups[1].ssid = Some("elsewhere".into());
        let err = Simulator::build(&scene, &RunOptions::default()).err().unwrap();
        assert!(matches!(err, BuildError::Topology(TopologyError::UnassociatedStation { .. })), "{}", err);
    }

    /// Two stationary ad-hoc nodes `spacing` metres apart; node 1 echoes off node 0.
    fn pair(spacing: f64) -> Scene {
        let mut scene = presets::task1("TLC2022");
        scene.grid.delta_x = spacing;
        scene.groups[0].count = 2;
        scene.groups[0].labels.truncate(2);
        scene.groups[0].motion = MotionConfig::Stationary;
        scene.requesters.truncate(1);
        scene.requesters[0].node = 1;
        scene.capture_devices = vec![0];
        scene
    }

    #[test]
    fn unreachable_receiver_never_answers_the_rts() {
        let sim = run(&pair(400.0), true, 1);
        let network = sim.network();
        let trace = network.trace();
        let max = network.contention.config().max_rts_retries;

        let attempts: Vec<u32> = trace
            .for_node(1)
            .filter_map(|r| match r.kind {
                TraceKind::ReservationFailed { attempt } => Some(attempt),
                _ => None,
            })
            .collect();
        let expected: Vec<u32> = (1..=max).chain(1..=max).collect();
        assert_eq!(attempts, expected);
        assert!(!trace.records().iter().any(|r| r.kind == TraceKind::ReservationGranted || r.kind == TraceKind::Tx));
        assert_eq!(trace.drop_counts().get(&DropReason::MediumAccessFailure), Some(&2));
        assert!(
            trace
                .for_interface(1)
                .filter(|r| r.kind == TraceKind::Drop { reason: DropReason::MediumAccessFailure })
                .all(|r| r.node == 1 && r.packet.as_ref().is_some_and(|p| p.kind == PacketKind::EchoRequest))
        );

        let counters = &network.topology().interface(1).unwrap().counters;
        assert_eq!(counters.rts_sent, 2 * max as u64);
        assert_eq!(counters.reservations_failed, 2 * max as u64);
        assert_eq!((counters.tx_frames, counters.drops), (0, 2));
        let stats = network.requesters()[0].stats();
        assert_eq!((stats.sent, stats.replies, stats.lost), (2, 0, 2));

        // Without the handshake the frames go out and are lost on the link instead.
        let off = run(&pair(400.0), false, 1);
        assert_eq!(off.network().trace().drop_counts().get(&DropReason::OutOfRange), Some(&2));
    }

    #[test]
    fn reachable_pair_is_granted_every_reservation() {
        let sim = run(&pair(50.0), true, 1);
        let trace = sim.network().trace();
        assert_eq!(trace.for_node(1).filter(|r| r.kind == TraceKind::ReservationGranted).count(), 2);
        assert!(!trace.records().iter().any(|r| matches!(r.kind, TraceKind::ReservationFailed { .. })));
        assert_eq!(sim.network().requesters()[0].stats().replies, 2);
    }

    #[test]
    fn traffic_to_another_network_is_dropped_at_the_source() {
        let mut scene = presets::task1("TLC2022");
        scene.groups[0].count = 3;
        scene.groups[0].labels.truncate(3);
        let mut other = scene.groups[0].clone();
        other.count = 2;
        other.ssid = Some("elsewhere".into());
        other.labels.clear();
        scene.groups.push(other);
        scene.requesters.truncate(1);
        scene.requesters[0].node = 4;

        let sim = run(&scene, false, 1);
        let trace = sim.network().trace();
        let drops: Vec<_> = trace.for_node(4).filter(|r| r.kind == TraceKind::Drop { reason: DropReason::NoRoute }).collect();
        assert_eq!(drops.len(), 2);
        assert!(drops.iter().all(|r| r.interface.is_none()));
        assert!(!trace.records().iter().any(|r| r.kind == TraceKind::Tx));
        assert_eq!(trace.drop_counts().len(), 1);

        let stats = sim.network().requesters()[0].stats();
        assert_eq!((stats.sent, stats.replies, stats.lost), (2, 0, 2));
        assert_eq!(sim.network().responders()[0].stats().served, 0);
    }

    #[test]
    fn requests_after_the_responder_stops_are_refused() {
        let mut scene = presets::task1("TLC2022");
        scene.responders[0].stop = 1.5;
        scene.requesters.retain(|r| r.node == 4);

        let sim = run(&scene, false, 1);
        let trace = sim.network().trace();
        let refused: Vec<_> = trace.for_node(0).filter(|r| r.kind == TraceKind::Drop { reason: DropReason::AppInactive }).collect();
        assert_eq!(refused.len(), 1);
        assert!(refused[0].time >= SimTime::from_secs(2));
        assert_eq!(refused[0].packet.as_ref().map(|p| p.sequence), Some(1));

        let responder = sim.network().responders()[0].stats();
        assert_eq!((responder.served, responder.refused), (1, 1));
        let requester = sim.network().requesters()[0].stats();
        assert_eq!((requester.sent, requester.replies, requester.lost), (2, 1, 1));
    }

    #[test]
    fn oversized_or_self_targeted_requesters_fail_the_build() {
        let mut scene = presets::task1("TLC2022");
        scene.requesters[0].packet_size = u32::MAX - 10;
        let err = Simulator::build(&scene, &RunOptions::default()).err().unwrap();
        assert!(matches!(err, BuildError::Scene(ref msg) if msg.contains("UDP limit")), "{}", err);

        let mut scene = presets::task1("TLC2022");
        scene.requesters[0].target_node = scene.requesters[0].node;
        assert!(matches!(Simulator::build(&scene, &RunOptions::default()), Err(BuildError::Scene(_))));
    }

    #[test]
    fn addresses_follow_creation_order() {
        let sim = run(&presets::task2("TLC2022"), false, 1);
        let topo = sim.network().topology();
        assert_eq!(topo.primary_address(0), Some("192.168.1.1".parse().unwrap()));
        assert_eq!(topo.primary_address(5), Some("192.168.1.6".parse().unwrap()));
        assert_eq!(sim.now(), SimTime::from_secs(7));
    }
}
