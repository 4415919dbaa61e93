//! The two built-in scenarios.
//!
//! `task1` is an ad-hoc mesh of five nodes; `task2` puts five stations behind
//! one access point. Both run an echo responder on node 0 and two requesters
//! on nodes 3 and 4 for seven seconds.

use std::net::Ipv4Addr;

use super::scene::{AddressBlock, MacKindConfig, MotionConfig, NodeGroup, NodeLabel, RequesterConfig, ResponderConfig, Scene, Window};
use crate::simulation::contention::ContentionConfig;
use crate::simulation::mobility::GridLayout;
use crate::simulation::signal_calculations::PhyParameters;
use crate::simulation::types::Role;

fn grid() -> GridLayout {
    GridLayout {
        min_x: 0.0,
        min_y: 0.0,
        delta_x: 5.0,
        delta_y: 10.0,
        grid_width: 3,
    }
}

fn random_walk() -> MotionConfig {
    MotionConfig::RandomWalk {
        bounds: crate::simulation::geometry::Bounds::new(-90.0, 90.0, -90.0, 90.0),
        min_speed: 2.0,
        max_speed: 4.0,
        direction_change_interval: 1.0,
    }
}

fn label(role: Role, label: &str) -> NodeLabel {
    NodeLabel {
        role,
        label: label.to_string(),
        color: None,
    }
}

fn address_block() -> AddressBlock {
    AddressBlock {
        base: Ipv4Addr::new(192, 168, 1, 0),
        prefix_len: 24,
    }
}

/// Ad-hoc mesh: server on node 0, clients on nodes 3 and 4.
pub fn task1(ssid: &str) -> Scene {
    Scene {
        name: "task1".to_string(),
        task: 1,
        ssid: ssid.to_string(),
        horizon: 7.0,
        address_block: address_block(),
        grid: grid(),
        groups: vec![NodeGroup {
            count: 5,
            mac: MacKindConfig::AdHoc,
            ssid: None,
            qos_supported: false,
            motion: random_walk(),
            labels: vec![
                label(Role::Server, "SRV-0"),
                label(Role::Relay, "HOC-1"),
                label(Role::Relay, "HOC-2"),
                label(Role::Requester, "CLI-3"),
                label(Role::Requester, "CLI-4"),
            ],
        }],
        responders: vec![ResponderConfig {
            node: 0,
            port: 20,
            start: 0.0,
            stop: 7.0,
        }],
        requesters: vec![
            RequesterConfig {
                node: 4,
                target_node: 0,
                port: 20,
                packet_size: 512,
                max_packets: 2,
                interval: 1.0,
                start: 1.0,
                stop: 3.0,
            },
            RequesterConfig {
                node: 3,
                target_node: 0,
                port: 20,
                packet_size: 512,
                max_packets: 2,
                interval: 2.0,
                start: 2.0,
                stop: 5.0,
            },
        ],
        capture_devices: vec![2],
        phy: PhyParameters::default(),
        contention: ContentionConfig::default(),
        counters_window: Window { start: 0.0, stop: 7.0 },
    }
}

/// Infrastructure network: five stations associated with one stationary AP.
pub fn task2(ssid: &str) -> Scene {
    Scene {
        name: "task2".to_string(),
        task: 2,
        ssid: ssid.to_string(),
        horizon: 7.0,
        address_block: address_block(),
        grid: grid(),
        groups: vec![
            NodeGroup {
                count: 5,
                mac: MacKindConfig::Station,
                ssid: None,
                qos_supported: false,
                motion: random_walk(),
                labels: vec![
                    label(Role::Server, "SRV-0"),
                    label(Role::Relay, "STA-1"),
                    label(Role::Relay, "STA-2"),
                    label(Role::Requester, "CLI-3"),
                    label(Role::Requester, "CLI-4"),
                ],
            },
            NodeGroup {
                count: 1,
                mac: MacKindConfig::AccessPoint,
                ssid: None,
                qos_supported: false,
                motion: MotionConfig::Stationary,
                labels: vec![label(Role::AccessPoint, "AP")],
            },
        ],
        responders: vec![ResponderConfig {
            node: 0,
            port: 21,
            start: 0.0,
            stop: 7.0,
        }],
        requesters: vec![
            RequesterConfig {
                node: 3,
                target_node: 0,
                port: 21,
                packet_size: 512,
                max_packets: 2,
                interval: 2.0,
                start: 2.0,
                stop: 5.0,
            },
            RequesterConfig {
                node: 4,
                target_node: 0,
                port: 21,
                packet_size: 512,
                max_packets: 2,
                interval: 3.0,
                start: 1.0,
                stop: 5.0,
            },
        ],
        capture_devices: vec![4, 5],
        phy: PhyParameters::default(),
        contention: ContentionConfig::default(),
        counters_window: Window { start: 0.0, stop: 7.0 },
    }
}
