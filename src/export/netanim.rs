//! NetAnim animation export.
//!
//! The file carries the node descriptions and colors, the sampled positions,
//! one wireless packet record per received frame and cumulative MAC counters
//! sampled once per second over the counters window.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use super::pcap::on_off;
use crate::simulation::network::Network;
use crate::simulation::time::SimTime;
use crate::simulation::trace::{TraceKind, TraceRecord};
use crate::simulation::types::{NodeId, Packet, PacketKind};

const NETANIM_VERSION: &str = "netanim-3.108";
const COUNTER_INTERVAL: Duration = Duration::from_secs(1);

/// Counters written for every node, in `ncId` order.
const COUNTERS: [&str; 4] = ["MacTx", "MacRx", "MacTxDrop", "RtsSent"];

/// `wireless-task<N>-rts-<on|off>.xml`
pub fn animation_file_name(task: u32, rts_cts_enabled: bool) -> String {
    format!("wireless-task{}-rts-{}.xml", task, on_off(rts_cts_enabled))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn meta_info(packet: &Packet) -> String {
    let kind = match packet.kind {
        PacketKind::EchoRequest => "EchoRequest",
        PacketKind::EchoReply => "EchoReply",
    };
    format!(
        "{} {}:{} > {}:{} seq={} size={} ttl={}",
        kind, packet.source, packet.source_port, packet.destination, packet.destination_port, packet.sequence, packet.payload_size, packet.ttl
    )
}

fn counter_index(kind: &TraceKind) -> Option<usize> {
    match kind {
        TraceKind::Tx => Some(0),
        TraceKind::Rx => Some(1),
        TraceKind::Drop { .. } => Some(2),
        TraceKind::RtsSent => Some(3),
        _ => None,
    }
}

/// Cumulative per-node counters at each sample instant of `window`.
fn counter_samples(records: &[TraceRecord], nodes: usize, window: (SimTime, SimTime)) -> Vec<(SimTime, Vec<[u64; 4]>)> {
    let (start, stop) = window;
    let mut samples = Vec::new();
    let mut totals = vec![[0u64; 4]; nodes];
    let mut next = records.iter().filter(|r| r.time >= start).peekable();
    let mut at = start;
    while at <= stop {
        while let Some(record) = next.next_if(|r| r.time <= at) {
            let counted = match record.kind {
                TraceKind::Drop { .. } => record.interface.is_some(),
                _ => true,
            };
            if let (true, Some(idx), Some(node)) = (counted, counter_index(&record.kind), totals.get_mut(record.node as usize)) {
                node[idx] += 1;
            }
        }
        samples.push((at, totals.clone()));
        at += COUNTER_INTERVAL;
    }
    samples
}

/// Render the animation document.
pub fn render(network: &Network) -> Result<String, std::fmt::Error> {
    let records = network.trace().records();
    let nodes = network.topology().nodes();

    let positions: Vec<(f64, f64)> = records
        .iter()
        .filter_map(|r| match r.kind {
            TraceKind::Position { x, y } => Some((x, y)),
            _ => None,
        })
        .chain(nodes.iter().map(|n| (n.position.x, n.position.y)))
        .collect();
    let min_x = positions.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let max_x = positions.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = positions.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = positions.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

    let mut initial: BTreeMap<NodeId, (f64, f64)> = BTreeMap::new();
    for record in records {
        if let TraceKind::Position { x, y } = record.kind {
            initial.entry(record.node).or_insert((x, y));
        }
    }

    let mut out = String::new();
    writeln!(out, "<anim ver=\"{}\" filetype=\"animation\" >", NETANIM_VERSION)?;
    writeln!(out, "<topology minX=\"{:.2}\" minY=\"{:.2}\" maxX=\"{:.2}\" maxY=\"{:.2}\">", min_x, min_y, max_x, max_y)?;
    for node in nodes {
        let (x, y) = initial.get(&node.node_id).copied().unwrap_or((node.position.x, node.position.y));
        writeln!(out, "<node id=\"{}\" sysId=\"0\" locX=\"{:.2}\" locY=\"{:.2}\" exists=\"1\" />", node.node_id, x, y)?;
    }
    for node in nodes {
        let [r, g, b] = node.color;
        writeln!(out, "<nu p=\"c\" t=\"0\" id=\"{}\" r=\"{}\" g=\"{}\" b=\"{}\" />", node.node_id, r, g, b)?;
        writeln!(out, "<nu p=\"d\" t=\"0\" id=\"{}\" descr=\"{}\" />", node.node_id, escape(&node.label))?;
    }
    writeln!(out, "</topology>")?;

    for (idx, name) in COUNTERS.iter().enumerate() {
        writeln!(out, "<ncs ncId=\"{}\" n=\"{}\" t=\"CounterDouble\" />", idx, name)?;
    }

    let mut last_tx: BTreeMap<(NodeId, u64), SimTime> = BTreeMap::new();
    let mut uid = 0u64;
    for record in records {
        match (&record.kind, &record.packet) {
            (TraceKind::Position { x, y }, _) => {
                writeln!(out, "<nu p=\"p\" t=\"{:.6}\" id=\"{}\" x=\"{:.2}\" y=\"{:.2}\" />", record.time.as_secs_f64(), record.node, x, y)?;
            }
            (TraceKind::Tx, Some(packet)) => {
                last_tx.insert((record.node, packet.packet_id), record.time);
            }
            (TraceKind::Rx, Some(packet)) => {
                let Some(sender) = record.peer else { continue };
                let sent = last_tx.get(&(sender, packet.packet_id)).copied().unwrap_or(record.time);
                let rx = record.time.as_secs_f64();
                writeln!(
                    out,
                    "<wpr uId=\"{}\" fId=\"{}\" fbTx=\"{:.9}\" lbTx=\"{:.9}\" meta-info=\"{}\" tId=\"{}\" fbRx=\"{:.9}\" lbRx=\"{:.9}\" />",
                    uid,
                    sender,
                    sent.as_secs_f64(),
                    rx,
                    escape(&meta_info(packet)),
                    record.node,
                    rx,
                    rx
                )?;
                uid += 1;
            }
            _ => {}
        }
    }

    for (at, totals) in counter_samples(records, nodes.len(), network.counters_window()) {
        for (node, values) in totals.iter().enumerate() {
            for (idx, value) in values.iter().enumerate() {
                writeln!(out, "<nc c=\"{}\" i=\"{}\" t=\"{:.6}\" v=\"{}\" />", idx, node, at.as_secs_f64(), value)?;
            }
        }
    }
    writeln!(out, "</anim>")?;
    Ok(out)
}

/// Write the animation file into `dir`.
pub fn write_animation(network: &Network, dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join(animation_file_name(network.task(), network.rts_cts_enabled()));
    let document = render(network).context("Failed to render animation")?;
    std::fs::write(&path, document).with_context(|| format!("Failed to write animation file: {}", path.display()))?;
    Ok(path)
}
