//! Append-only, time-ordered record of everything observable in a run.
//!
//! Recording is passive: it never schedules events and never changes the
//! outcome of the simulation. Exporters read the finished log.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use super::time::SimTime;
use super::types::{InterfaceId, NodeId, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    NoRoute,
    Collision,
    OutOfRange,
    MediumAccessFailure,
    AppInactive,
    UnknownPort,
    TtlExpired,
}

impl DropReason {
    pub fn name(&self) -> &'static str {
        match self {
            DropReason::NoRoute => "no-route",
            DropReason::Collision => "collision",
            DropReason::OutOfRange => "out-of-range",
            DropReason::MediumAccessFailure => "medium-access-failure",
            DropReason::AppInactive => "app-inactive",
            DropReason::UnknownPort => "unknown-port",
            DropReason::TtlExpired => "ttl-expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TraceKind {
    AppSend,
    AppReceive,
    Tx,
    Rx,
    Forward,
    RtsSent,
    ReservationGranted,
    ReservationFailed { attempt: u32 },
    Drop { reason: DropReason },
    Position { x: f64, y: f64 },
}

impl TraceKind {
    pub fn name(&self) -> &'static str {
        match self {
            TraceKind::AppSend => "app-send",
            TraceKind::AppReceive => "app-receive",
            TraceKind::Tx => "tx",
            TraceKind::Rx => "rx",
            TraceKind::Forward => "forward",
            TraceKind::RtsSent => "rts-sent",
            TraceKind::ReservationGranted => "reservation-granted",
            TraceKind::ReservationFailed { .. } => "reservation-failed",
            TraceKind::Drop { .. } => "drop",
            TraceKind::Position { .. } => "position",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub time: SimTime,
    pub node: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<InterfaceId>,
    #[serde(flatten)]
    pub kind: TraceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet: Option<Packet>,
    /// Other end of a link-level event (receiver of a Tx, sender of an Rx).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<NodeId>,
}

impl TraceRecord {
    pub fn new(time: SimTime, node: NodeId, kind: TraceKind) -> Self {
        Self {
            time,
            node,
            interface: None,
            kind,
            packet: None,
            peer: None,
        }
    }

    pub fn on_interface(mut self, interface: InterfaceId) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn with_packet(mut self, packet: &Packet) -> Self {
        self.packet = Some(packet.clone());
        self
    }

    pub fn with_peer(mut self, peer: NodeId) -> Self {
        self.peer = Some(peer);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct TraceLog {
    records: Vec<TraceRecord>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Records must arrive in non-decreasing time order.
    pub fn record(&mut self, record: TraceRecord) {
        debug_assert!(self.records.last().is_none_or(|last| last.time <= record.time), "trace records must be time ordered");
        self.records.push(record);
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `(time, kind, node)` sequence used to compare runs.
    pub fn signature(&self) -> Vec<(SimTime, &'static str, NodeId)> {
        self.records.iter().map(|r| (r.time, r.kind.name(), r.node)).collect()
    }

    pub fn for_node(&self, node: NodeId) -> impl Iterator<Item = &TraceRecord> {
        self.records.iter().filter(move |r| r.node == node)
    }

    pub fn for_interface(&self, interface: InterfaceId) -> impl Iterator<Item = &TraceRecord> {
        self.records.iter().filter(move |r| r.interface == Some(interface))
    }

    pub fn drop_counts(&self) -> BTreeMap<DropReason, u64> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            if let TraceKind::Drop { reason } = record.kind {
                *counts.entry(reason).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// What a capture device overheard.
#[derive(Debug, Clone, PartialEq)]
pub enum AirFrameKind {
    Rts,
    Data(Packet),
}

/// A frame put on the air within range of a capture device.
#[derive(Debug, Clone, PartialEq)]
pub struct AirFrame {
    pub time: SimTime,
    pub transmitter: InterfaceId,
    pub receiver: InterfaceId,
    /// Medium time the frame announces after its own end.
    pub duration: Duration,
    pub kind: AirFrameKind,
}
