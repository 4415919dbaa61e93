//! Packet capture files (classic pcap, IEEE 802.11 link type).
//!
//! Capture devices listen promiscuously: every RTS and data frame they
//! overheard is written with a synthetic 802.11 header. Data frames carry an
//! LLC/SNAP header, then IPv4 and UDP headers, then a zero-filled payload of
//! the right size. Interface `n` uses the MAC address `00:00:00:00:00:<n+1>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use log::warn;

use crate::simulation::network::Network;
use crate::simulation::trace::{AirFrame, AirFrameKind};
use crate::simulation::types::{IP_UDP_HEADER_BYTES, InterfaceId, Packet};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION: (u16, u16) = (2, 4);
const SNAP_LEN: u32 = 65_535;
/// 802.11 frames without radiotap, no FCS.
pub const LINKTYPE_IEEE802_11: u32 = 105;
const UDP_PROTOCOL: u8 = 17;

/// Frame control, little endian on the wire: type/subtype then flags.
const FC_RTS: [u8; 2] = [0xb4, 0x00];
const FC_DATA: [u8; 2] = [0x08, 0x00];
const LLC_SNAP_IPV4: [u8; 8] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00, 0x08, 0x00];

/// `<scenario>-<on|off>-<device>.pcap`
pub fn capture_file_name(scenario: &str, rts_cts_enabled: bool, device: InterfaceId) -> String {
    format!("{}-{}-{}.pcap", scenario, on_off(rts_cts_enabled), device)
}

pub(crate) fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

pub fn mac_address(interface: InterfaceId) -> [u8; 6] {
    let id = (u64::from(interface) + 1).to_be_bytes();
    [id[2], id[3], id[4], id[5], id[6], id[7]]
}

fn duration_field(duration: Duration) -> u16 {
    // 0x7fff and above are not durations.
    duration.as_micros().min(0x7ffe) as u16
}

/// Internet checksum over an IPv4 header.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header.chunks(2).map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]))).sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Append the IPv4/UDP datagram carrying `packet` to `buf`.
///
/// Payloads are bounded by scene validation, so both length fields fit.
pub fn encode_datagram(packet: &Packet, buf: &mut BytesMut) {
    let total_len = packet.ip_size();
    let mut header = BytesMut::with_capacity(20);
    header.put_u8(0x45);
    header.put_u8(0);
    header.put_u16(total_len as u16);
    header.put_u16(packet.packet_id as u16);
    header.put_u16(0);
    header.put_u8(packet.ttl);
    header.put_u8(UDP_PROTOCOL);
    header.put_u16(0);
    header.put_slice(&packet.source.octets());
    header.put_slice(&packet.destination.octets());
    let checksum = ipv4_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.put_slice(&header);
    buf.put_u16(packet.source_port);
    buf.put_u16(packet.destination_port);
    buf.put_u16((packet.payload_size + 8) as u16);
    buf.put_u16(0);
    buf.put_bytes(0, (total_len - IP_UDP_HEADER_BYTES) as usize);
}

/// Append the 802.11 frame for `frame` to `buf`.
pub fn encode_frame(frame: &AirFrame, buf: &mut BytesMut) {
    let receiver = mac_address(frame.receiver);
    let transmitter = mac_address(frame.transmitter);
    match &frame.kind {
        AirFrameKind::Rts => {
            buf.put_slice(&FC_RTS);
            buf.put_u16_le(duration_field(frame.duration));
            buf.put_slice(&receiver);
            buf.put_slice(&transmitter);
        }
        AirFrameKind::Data(packet) => {
            buf.put_slice(&FC_DATA);
            buf.put_u16_le(duration_field(frame.duration));
            buf.put_slice(&receiver);
            buf.put_slice(&transmitter);
            buf.put_slice(&transmitter);
            buf.put_u16_le(((packet.packet_id & 0x0fff) as u16) << 4);
            buf.put_slice(&LLC_SNAP_IPV4);
            encode_datagram(packet, buf);
        }
    }
}

/// Whole capture file for the frames one device overheard, header included.
pub fn encode_capture(frames: &[AirFrame]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_u32_le(PCAP_MAGIC);
    buf.put_u16_le(PCAP_VERSION.0);
    buf.put_u16_le(PCAP_VERSION.1);
    buf.put_i32_le(0);
    buf.put_u32_le(0);
    buf.put_u32_le(SNAP_LEN);
    buf.put_u32_le(LINKTYPE_IEEE802_11);

    let mut encoded = BytesMut::new();
    for frame in frames {
        encoded.clear();
        encode_frame(frame, &mut encoded);
        let micros = frame.time.as_micros();
        buf.put_u32_le((micros / 1_000_000) as u32);
        buf.put_u32_le((micros % 1_000_000) as u32);
        buf.put_u32_le(encoded.len() as u32);
        buf.put_u32_le(encoded.len() as u32);
        buf.put_slice(&encoded);
    }
    buf
}

/// Write one capture file per configured device into `dir`.
pub fn write_captures(network: &Network, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for &device in network.capture_devices() {
        if network.topology().interface(device).is_none() {
            warn!("Capture device {} does not exist, skipping", device);
            continue;
        }
        let path = dir.join(capture_file_name(network.scene_name(), network.rts_cts_enabled(), device));
        let data = encode_capture(network.captured(device));
        std::fs::write(&path, &data).with_context(|| format!("Failed to write capture file: {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
