//! `cloudframe replay`: offline reassembly from a pcap file.
//!
//! Each UDP payload goes through the same decode + ingest path as live
//! traffic, with the packet timestamp standing in for the receive clock, so
//! eviction behaves exactly as it did when the capture was taken.

use anyhow::{Context, Result};
use cloudframe_ingest::{
    process_datagram, CompletedFrame, FrameReassembler, ReceiverMetrics, ReceiverMetricsSnapshot,
};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::capture::{ETH_HEADER_LEN, UDP_HEADER_LEN};
use crate::config::ReceiverConfig;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const LINUX_SLL_HEADER_LEN: usize = 16;
const IPPROTO_UDP: u8 = 17;

pub struct ReplayReport {
    pub packets: u64,
    /// UDP datagrams fed to the reassembler (after the port filter).
    pub datagrams: u64,
    pub frames: Vec<CompletedFrame>,
    pub metrics: ReceiverMetricsSnapshot,
}

/// Locate the UDP payload inside a captured link-layer frame.
/// Returns `(dst_port, payload)`, or None for anything that is not an
/// unfragmented IPv4/UDP packet.
pub fn udp_payload(frame: &[u8], datalink: DataLink) -> Option<(u16, &[u8])> {
    let ip = match datalink {
        DataLink::ETHERNET => {
            let mut offset = ETH_HEADER_LEN;
            let mut ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
            if ethertype == ETHERTYPE_VLAN {
                ethertype = u16::from_be_bytes([*frame.get(16)?, *frame.get(17)?]);
                offset += 4;
            }
            if ethertype != ETHERTYPE_IPV4 {
                return None;
            }
            frame.get(offset..)?
        }
        DataLink::LINUX_SLL => {
            let proto = u16::from_be_bytes([*frame.get(14)?, *frame.get(15)?]);
            if proto != ETHERTYPE_IPV4 {
                return None;
            }
            frame.get(LINUX_SLL_HEADER_LEN..)?
        }
        DataLink::RAW | DataLink::IPV4 => frame,
        _ => return None,
    };

    if ip.first()? >> 4 != 4 || *ip.get(9)? != IPPROTO_UDP {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let frag = u16::from_be_bytes([ip[6], ip[7]]);
    // More-fragments set or non-zero offset.
    if frag & 0x3fff != 0 {
        return None;
    }
    let ip_total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    let ip = ip.get(..ip_total.min(ip.len()))?;

    let udp = ip.get(ihl..)?;
    if udp.len() < UDP_HEADER_LEN {
        return None;
    }
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = (u16::from_be_bytes([udp[4], udp[5]]) as usize).clamp(UDP_HEADER_LEN, udp.len());
    Some((dst_port, &udp[UDP_HEADER_LEN..udp_len]))
}

/// Reassemble every frame in `path` using the delivery and timeout settings
/// from `config`. Completed frames are collected in delivery order.
pub fn replay_file(path: &Path, config: &ReceiverConfig, port: Option<u16>) -> Result<ReplayReport> {
    let file = File::open(path)
        .with_context(|| format!("failed to open pcap file: {}", path.display()))?;
    let mut reader = PcapReader::new(BufReader::new(file))
        .with_context(|| format!("not a pcap file: {}", path.display()))?;
    let datalink = reader.header().datalink;

    let reassembler =
        FrameReassembler::new(config.timeout_ns(), config.delivery, ReceiverMetrics::new());
    let (tx, rx) = crossbeam_channel::unbounded::<CompletedFrame>();

    let mut packets = 0u64;
    let mut datagrams = 0u64;
    while let Some(packet) = reader.next_packet() {
        let packet = packet.with_context(|| format!("corrupt pcap file: {}", path.display()))?;
        packets += 1;
        let Some((dst_port, payload)) = udp_payload(&packet.data, datalink) else {
            continue;
        };
        if port.is_some_and(|p| p != dst_port) {
            continue;
        }
        datagrams += 1;
        let ts_ns = packet.timestamp.as_nanos() as u64;
        process_datagram(config.protocol, payload, None, ts_ns, &reassembler, &tx);
    }
    drop(tx);

    Ok(ReplayReport {
        packets,
        datagrams,
        frames: rx.into_iter().collect(),
        metrics: reassembler.metrics().snapshot(),
    })
}

pub fn run(config: &ReceiverConfig, path: &Path, port: Option<u16>, verbose: bool) -> Result<()> {
    let report = replay_file(path, config, port)?;

    if verbose {
        for frame in &report.frames {
            println!("frame {:>10}  {:>8} points", frame.frame_id, frame.points.len());
        }
    }

    let m = &report.metrics;
    eprintln!(
        "{} packets, {} UDP datagrams → {} frames delivered ({} evicted, {} stale, {} duplicate chunks, {} rejected)",
        report.packets,
        report.datagrams,
        m.frames_delivered,
        m.frames_evicted,
        m.frames_dropped_stale,
        m.duplicate_chunks,
        m.rejected_total(),
    );
    println!("{}", serde_json::to_string_pretty(m)?);
    Ok(())
}
