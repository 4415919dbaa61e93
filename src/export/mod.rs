//! Output files written after a run: packet captures, animation, JSON reports.

pub mod netanim;
pub mod pcap;
pub mod report;
