//! UDP echo applications.
//!
//! A responder answers every request it receives while active with a reply
//! of the same size and sequence number. A requester sends a bounded number
//! of requests at a fixed interval inside its active window and matches the
//! replies by sequence number to measure round-trip times.
//!
//! Human-readable lines are logged at `info` on this module's target, which
//! the binary only enables in verbose mode.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use log::info;
use serde::Serialize;

use super::scheduler::EventId;
use super::time::SimTime;
use super::trace::DropReason;
use super::types::{DEFAULT_TTL, MAX_UDP_PAYLOAD, NodeId, Packet, PacketKind};

/// First ephemeral port handed to requesters on a node.
pub const EPHEMERAL_PORT_BASE: u16 = 49153;

#[derive(Debug, Clone, PartialEq)]
pub struct ResponderSpec {
    pub node: NodeId,
    pub port: u16,
    pub start: SimTime,
    pub stop: SimTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequesterSpec {
    pub node: NodeId,
    pub target: Ipv4Addr,
    pub port: u16,
    pub packet_size: u32,
    pub max_packets: u32,
    pub interval: Duration,
    pub start: SimTime,
    pub stop: SimTime,
}

fn validate_window(start: SimTime, stop: SimTime) -> Result<(), String> {
    if stop < start {
        return Err(format!("stop time {} is before start time {}", stop, start));
    }
    Ok(())
}

impl ResponderSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("responder port must be non-zero".into());
        }
        validate_window(self.start, self.stop)
    }
}

impl RequesterSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("requester target port must be non-zero".into());
        }
        if self.packet_size == 0 {
            return Err("packet size must be positive".into());
        }
        if self.packet_size > MAX_UDP_PAYLOAD {
            return Err(format!("packet size {} exceeds the UDP limit of {} bytes", self.packet_size, MAX_UDP_PAYLOAD));
        }
        if self.max_packets == 0 {
            return Err("max packets must be positive".into());
        }
        if self.interval.is_zero() {
            return Err("interval must be positive".into());
        }
        validate_window(self.start, self.stop)
    }
}

fn fmt_time(now: SimTime) -> String {
    format!("+{}s", now.as_secs_f64())
}

#[derive(Debug)]
pub struct Responder {
    spec: ResponderSpec,
    address: Ipv4Addr,
    active: bool,
    served: u64,
    refused: u64,
}

impl Responder {
    pub fn new(spec: ResponderSpec, address: Ipv4Addr) -> Self {
        Self {
            spec,
            address,
            active: false,
            served: 0,
            refused: 0,
        }
    }

    pub fn spec(&self) -> &ResponderSpec {
        &self.spec
    }

    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Build the reply for `request`, or the reason it is dropped.
    pub fn handle_request(&mut self, now: SimTime, request: &Packet, packet_id: u64) -> Result<Packet, DropReason> {
        if !self.active {
            self.refused += 1;
            return Err(DropReason::AppInactive);
        }
        info!(
            "At time {} server received {} bytes from {} port {}",
            fmt_time(now),
            request.payload_size,
            request.source,
            request.source_port
        );
        self.served += 1;
        let reply = Packet {
            packet_id,
            kind: PacketKind::EchoReply,
            source: self.address,
            source_port: self.spec.port,
            destination: request.source,
            destination_port: request.source_port,
            payload_size: request.payload_size,
            sequence: request.sequence,
            ttl: DEFAULT_TTL,
        };
        info!("At time {} server sent {} bytes to {} port {}", fmt_time(now), reply.payload_size, reply.destination, reply.destination_port);
        Ok(reply)
    }

    pub fn stats(&self) -> ResponderStats {
        ResponderStats {
            node: self.spec.node,
            port: self.spec.port,
            served: self.served,
            refused: self.refused,
        }
    }
}

#[derive(Debug)]
pub struct Requester {
    spec: RequesterSpec,
    address: Ipv4Addr,
    local_port: u16,
    running: bool,
    sent: u32,
    pending: Option<(EventId, SimTime)>,
    outstanding: BTreeMap<u32, SimTime>,
    replies: u32,
    late_replies: u32,
    rtts: Vec<Duration>,
}

impl Requester {
    pub fn new(spec: RequesterSpec, address: Ipv4Addr, local_port: u16) -> Self {
        Self {
            spec,
            address,
            local_port,
            running: false,
            sent: 0,
            pending: None,
            outstanding: BTreeMap::new(),
            replies: 0,
            late_replies: 0,
            rtts: Vec::new(),
        }
    }

    pub fn spec(&self) -> &RequesterSpec {
        &self.spec
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop the application. Returns the pending send to cancel, if it would
    /// fire after `now`; a send due exactly at `now` is kept.
    pub fn stop(&mut self, now: SimTime) -> Option<EventId> {
        self.running = false;
        match self.pending {
            Some((id, at)) if at > now => {
                self.pending = None;
                Some(id)
            }
            _ => None,
        }
    }

    /// Whether another request may be sent.
    pub fn can_send(&self) -> bool {
        self.sent < self.spec.max_packets
    }

    /// Remember the event of the next scheduled send.
    pub fn set_pending(&mut self, id: EventId, at: SimTime) {
        self.pending = Some((id, at));
    }

    /// Build the next request and advance the sequence number.
    pub fn next_request(&mut self, now: SimTime, packet_id: u64) -> Option<Packet> {
        self.pending = None;
        if !self.can_send() {
            return None;
        }
        let sequence = self.sent;
        self.sent += 1;
        self.outstanding.insert(sequence, now);
        info!("At time {} client sent {} bytes to {} port {}", fmt_time(now), self.spec.packet_size, self.spec.target, self.spec.port);
        Some(Packet {
            packet_id,
            kind: PacketKind::EchoRequest,
            source: self.address,
            source_port: self.local_port,
            destination: self.spec.target,
            destination_port: self.spec.port,
            payload_size: self.spec.packet_size,
            sequence,
            ttl: DEFAULT_TTL,
        })
    }

    /// Time of the follow-up send, if the application keeps going.
    pub fn follow_up(&self, now: SimTime) -> Option<SimTime> {
        (self.running && self.can_send()).then(|| now + self.spec.interval)
    }

    /// Account a reply. Replies after stop are counted as late.
    pub fn handle_reply(&mut self, now: SimTime, reply: &Packet) {
        info!("At time {} client received {} bytes from {} port {}", fmt_time(now), reply.payload_size, reply.source, reply.source_port);
        if let Some(sent_at) = self.outstanding.remove(&reply.sequence) {
            self.rtts.push(now.saturating_duration_since(sent_at));
        }
        if self.running {
            self.replies += 1;
        } else {
            self.late_replies += 1;
        }
    }

    pub fn stats(&self) -> RequesterStats {
        let mean_rtt_ms = if self.rtts.is_empty() {
            None
        } else {
            Some(self.rtts.iter().map(|d| d.as_secs_f64() * 1e3).sum::<f64>() / self.rtts.len() as f64)
        };
        RequesterStats {
            node: self.spec.node,
            target: self.spec.target,
            port: self.spec.port,
            sent: self.sent,
            replies: self.replies,
            late_replies: self.late_replies,
            lost: self.outstanding.len() as u32,
            mean_rtt_ms,
            max_rtt_ms: self.rtts.iter().map(|d| d.as_secs_f64() * 1e3).max_by(|a, b| a.total_cmp(b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResponderStats {
    pub node: NodeId,
    pub port: u16,
    pub served: u64,
    pub refused: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequesterStats {
    pub node: NodeId,
    pub target: Ipv4Addr,
    pub port: u16,
    pub sent: u32,
    pub replies: u32,
    pub late_replies: u32,
    pub lost: u32,
    pub mean_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
}
