//! JSON trace and run summary.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

use super::pcap::on_off;
use crate::simulation::echo::{RequesterStats, ResponderStats};
use crate::simulation::network::Simulator;
use crate::simulation::types::{InterfaceCounters, InterfaceId, NodeId};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceSummary {
    pub interface: InterfaceId,
    pub node: NodeId,
    pub label: String,
    pub mac_mode: &'static str,
    pub ssid: String,
    pub address: Option<Ipv4Addr>,
    pub counters: InterfaceCounters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Summary {
    pub scenario: String,
    pub task: u32,
    pub rts_cts_enabled: bool,
    pub seed: u64,
    pub horizon_s: f64,
    pub executed_events: u64,
    pub trace_records: usize,
    pub requesters: Vec<RequesterStats>,
    pub responders: Vec<ResponderStats>,
    pub drops: BTreeMap<&'static str, u64>,
    pub interfaces: Vec<InterfaceSummary>,
}

impl Summary {
    pub fn from_simulator(sim: &Simulator) -> Self {
        let network = sim.network();
        let topology = network.topology();
        let interfaces = topology
            .interfaces()
            .iter()
            .map(|iface| InterfaceSummary {
                interface: iface.interface_id,
                node: iface.node_id,
                label: topology.node(iface.node_id).map(|n| n.label.clone()).unwrap_or_default(),
                mac_mode: iface.mac.name(),
                ssid: iface.mac.ssid().to_string(),
                address: iface.address,
                counters: iface.counters.clone(),
            })
            .collect();
        Self {
            scenario: network.scene_name().to_string(),
            task: network.task(),
            rts_cts_enabled: network.rts_cts_enabled(),
            seed: sim.seed(),
            horizon_s: network.horizon().as_secs_f64(),
            executed_events: sim.executed_events(),
            trace_records: network.trace().len(),
            requesters: network.requesters().iter().map(|r| r.stats()).collect(),
            responders: network.responders().iter().map(|r| r.stats()).collect(),
            drops: network.trace().drop_counts().into_iter().map(|(reason, count)| (reason.name(), count)).collect(),
            interfaces,
        }
    }
}

fn report_path(dir: &Path, scenario: &str, rts_cts_enabled: bool, what: &str) -> PathBuf {
    dir.join(format!("{}-{}-{}.json", scenario, on_off(rts_cts_enabled), what))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create file: {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value).with_context(|| format!("Failed to write JSON: {}", path.display()))
}

/// `<scenario>-<on|off>-trace.json`
pub fn write_trace(sim: &Simulator, dir: &Path) -> anyhow::Result<PathBuf> {
    let network = sim.network();
    let path = report_path(dir, network.scene_name(), network.rts_cts_enabled(), "trace");
    write_json(&path, network.trace())?;
    Ok(path)
}

/// `<scenario>-<on|off>-summary.json`
pub fn write_summary(sim: &Simulator, dir: &Path) -> anyhow::Result<PathBuf> {
    let network = sim.network();
    let path = report_path(dir, network.scene_name(), network.rts_cts_enabled(), "summary");
    write_json(&path, &Summary::from_simulator(sim))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::presets;
    use crate::simulation::network::RunOptions;

    fn simulate() -> Simulator {
        let mut scene = presets::task1("TLC2022");
        scene.requesters.retain(|r| r.node == 4);
        let mut sim = Simulator::build(&scene, &RunOptions::default()).unwrap();
        sim.run();
        sim
    }

    #[test]
    fn summary_reflects_the_run() {
        let sim = simulate();
        let summary = Summary::from_simulator(&sim);
        assert_eq!(summary.scenario, "task1");
        assert!(!summary.rts_cts_enabled);
        assert_eq!(summary.requesters.len(), 1);
        assert_eq!(summary.requesters[0].sent, 2);
        assert_eq!(summary.responders[0].served, 2);
        assert_eq!(summary.interfaces.len(), 5);
        assert_eq!(summary.interfaces[4].counters.tx_frames, 2);
        assert_eq!(summary.interfaces[0].mac_mode, summary.interfaces[1].mac_mode);
        assert!(summary.drops.is_empty());
    }

    #[test]
    fn writes_trace_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let sim = simulate();
        let trace = write_trace(&sim, dir.path()).unwrap();
        let summary = write_summary(&sim, dir.path()).unwrap();
        assert_eq!(trace, dir.path().join("task1-off-trace.json"));
        assert_eq!(summary, dir.path().join("task1-off-summary.json"));

        let records: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(trace).unwrap()).unwrap();
        assert_eq!(records.as_array().map(|a| a.len()), Some(sim.network().trace().len()));
        let summary: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(summary).unwrap()).unwrap();
        assert_eq!(summary["requesters"][0]["replies"], 2);
        assert_eq!(summary["interfaces"][0]["address"], "192.168.1.1");
    }
}
