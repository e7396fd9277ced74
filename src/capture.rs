//! Datagram recording to pcap.
//!
//! The receive loop copies each raw datagram into a bounded channel; a
//! `capture` thread wraps it in a minimal Ethernet + IPv4 + UDP frame and
//! appends it to a nanosecond-resolution pcap file that Wireshark and
//! `cloudframe replay` can both read. A full channel drops the copy, never
//! the datagram itself.

use anyhow::{Context, Result};
use cloudframe_ingest::metrics::now_ns;
use cloudframe_ingest::RawDatagram;
use crossbeam_channel::Receiver;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const ETH_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

fn ns_pcap_header() -> PcapHeader {
    PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: 65535,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::NanoSecond,
        endianness: Endianness::native(),
    }
}

fn ipv4_octets(ip: IpAddr) -> [u8; 4] {
    match ip {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(|v4| v4.octets()).unwrap_or([0; 4]),
    }
}

/// Wrap `payload` in Ethernet + IPv4 + UDP headers. Checksums are left zero.
pub fn build_frame(src: SocketAddr, dst_ip: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = ((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes();
    let ip_total = ((IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes();
    let src_ip = ipv4_octets(src.ip());
    let src_port = src.port().to_be_bytes();
    let dst_port = dst_port.to_be_bytes();

    let mut frame =
        Vec::with_capacity(ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len());

    // Ethernet: locally administered MACs, ethertype IPv4.
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame.extend_from_slice(&[0x08, 0x00]);

    frame.extend_from_slice(&[
        0x45, 0x00,
        ip_total[0], ip_total[1],
        0x00, 0x00, // ID
        0x40, 0x00, // don't fragment
        64, 0x11,   // TTL=64, proto=UDP
        0x00, 0x00, // checksum
    ]);
    frame.extend_from_slice(&src_ip);
    frame.extend_from_slice(&dst_ip);

    frame.extend_from_slice(&[
        src_port[0], src_port[1],
        dst_port[0], dst_port[1],
        udp_len[0], udp_len[1],
        0x00, 0x00,
    ]);
    frame.extend_from_slice(payload);
    frame
}

pub struct PcapRecorder {
    writer: PcapWriter<BufWriter<File>>,
    dst_ip: [u8; 4],
    /// Added to monotonic receive stamps to get wall-clock pcap timestamps.
    wall_offset_ns: u64,
    packets: u64,
}

impl PcapRecorder {
    /// Create (truncate) `path`. `dst_ip` is written as the destination of
    /// every recorded packet.
    pub fn create(path: &Path, dst_ip: IpAddr) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create pcap file: {}", path.display()))?;
        let writer = PcapWriter::with_header(BufWriter::new(file), ns_pcap_header())
            .with_context(|| format!("failed to write pcap header: {}", path.display()))?;
        let wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Ok(Self {
            writer,
            dst_ip: ipv4_octets(dst_ip),
            wall_offset_ns: wall_ns.saturating_sub(now_ns()),
            packets: 0,
        })
    }

    pub fn write(&mut self, dgram: &RawDatagram) -> Result<()> {
        let frame = build_frame(dgram.from, self.dst_ip, dgram.local_port, &dgram.data);
        let ts_ns = dgram.recv_ns.saturating_add(self.wall_offset_ns);
        let timestamp = Duration::new(ts_ns / 1_000_000_000, (ts_ns % 1_000_000_000) as u32);
        self.writer.write_packet(&PcapPacket::new(timestamp, frame.len() as u32, &frame))?;
        self.packets += 1;
        Ok(())
    }

    /// Flush buffered packets to disk.
    pub fn finish(self) -> Result<u64> {
        let packets = self.packets;
        self.writer.into_writer().flush()?;
        Ok(packets)
    }
}

/// Spawn the `capture` thread. It drains `rx` until every sender is dropped,
/// then flushes the file.
pub fn spawn_capture_thread(
    path: &Path,
    dst_ip: IpAddr,
    rx: Receiver<RawDatagram>,
) -> Result<JoinHandle<()>> {
    let mut recorder = PcapRecorder::create(path, dst_ip)?;
    let path_display = path.display().to_string();
    info!("recording datagrams to {}", path_display);

    let handle = std::thread::Builder::new()
        .name("capture".into())
        .spawn(move || {
            for dgram in &rx {
                if let Err(e) = recorder.write(&dgram) {
                    warn!("capture write error: {:#}", e);
                }
            }
            match recorder.finish() {
                Ok(n) => info!("recorded {} datagrams to {}", n, path_display),
                Err(e) => warn!("capture flush error: {:#}", e),
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_layout() {
        let src: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let payload = [0xaa_u8; 32];
        let frame = build_frame(src, [127, 0, 0, 1], 7000, &payload);

        assert_eq!(frame.len(), 14 + 20 + 8 + 32);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        let ip = &frame[14..34];
        assert_eq!(ip[0], 0x45);
        assert_eq!(u16::from_be_bytes([ip[2], ip[3]]), 20 + 8 + 32);
        assert_eq!(ip[9], 17);
        assert_eq!(&ip[12..16], &[10, 0, 0, 5]);
        assert_eq!(&ip[16..20], &[127, 0, 0, 1]);
        let udp = &frame[34..42];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 40000);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 7000);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]), 8 + 32);
        assert_eq!(&frame[42..], &payload);
    }

    #[test]
    fn test_ipv6_source_maps_to_zero() {
        let src: SocketAddr = "[::1]:9".parse().unwrap();
        let frame = build_frame(src, [0; 4], 1, &[]);
        assert_eq!(&frame[26..30], &[0, 0, 0, 0]);
    }
}
