//! UDP point-cloud receiver.
//!
//! Binds a UDP socket, decodes every datagram, feeds the reassembler, and
//! hands completed frames to a [`FrameSink`].
//!
//! ## Receive loop
//! * `SO_REUSEADDR` so a restarted listener can rebind immediately
//! * `SO_RCVBUF` sized for bursts of large frames (default 16 MiB); a warning
//!   is logged if the kernel clamps it well below the request
//! * 100 ms read timeout: the loop re-checks its running flag at least that
//!   often, so stopping never blocks on an idle socket
//!
//! Malformed datagrams are counted, logged, and dropped; they never reach the
//! reassembler.

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::diagnostic::Diagnostic;
use crate::json;
use crate::metrics;
use crate::reassembler::{CompletedFrame, FrameReassembler};
use crate::sink::FrameSink;
use crate::wire;

/// Largest possible UDP payload.
const PKT_CAP: usize = 65_536;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Datagram encoding accepted by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Chunked binary frames, reassembled.
    #[default]
    Binary,
    /// One JSON frame per datagram, no reassembly.
    Json,
}

/// Socket settings for a listener.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub bind_addr: IpAddr,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub recv_buffer_bytes: usize,
    pub protocol: WireProtocol,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 7000,
            recv_buffer_bytes: 16 * 1024 * 1024,
            protocol: WireProtocol::Binary,
        }
    }
}

/// Raw datagram copied off the receive loop for recording.
pub struct RawDatagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
    pub local_port: u16,
    pub recv_ns: u64,
}

/// Decode one datagram and push it through reassembly and delivery.
///
/// Returns the id of the frame handed to `sink`, if this datagram completed one.
/// Sink delivery happens after the reassembler lock is released.
pub fn process_datagram(
    protocol: WireProtocol,
    bytes: &[u8],
    from: Option<SocketAddr>,
    now_ns: u64,
    reassembler: &FrameReassembler,
    sink: &dyn FrameSink,
) -> Option<u32> {
    let metrics = reassembler.metrics();
    metrics.record_datagram(bytes.len());

    let frame = match protocol {
        WireProtocol::Binary => match wire::decode(bytes) {
            Ok((header, points)) => {
                tracing::trace!(
                    frame_id = header.frame_id,
                    chunk = header.chunk_index,
                    total_chunks = header.total_chunks,
                    points = header.points_in_chunk,
                    total_points = header.total_points,
                    "chunk"
                );
                reassembler.ingest(&header, points, now_ns)?
            }
            Err(e) => {
                metrics.record_rejection(e.kind());
                match from {
                    Some(addr) => tracing::warn!("{} from {}, ignoring", e, addr),
                    None => tracing::warn!("{}, ignoring", e),
                }
                reassembler.emit(Diagnostic::ParseRejected { kind: e.kind(), len: bytes.len(), from });
                return None;
            }
        },
        WireProtocol::Json => match json::decode_frame(bytes) {
            Ok(frame) => {
                metrics.frames_completed.fetch_add(1, Ordering::Relaxed);
                frame
            }
            Err(e) => {
                metrics.rejected_json.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}, ignoring", e);
                return None;
            }
        },
    };

    Some(deliver(frame, sink, reassembler))
}

fn deliver(frame: CompletedFrame, sink: &dyn FrameSink, reassembler: &FrameReassembler) -> u32 {
    let frame_id = frame.frame_id;
    let points = frame.points.len();
    let accepted = sink.deliver(frame);
    reassembler.metrics().record_delivery(points, accepted);
    if !accepted {
        tracing::debug!(frame_id, "sink rejected frame");
    }
    frame_id
}

pub struct FrameReceiver {
    socket: UdpSocket,
    protocol: WireProtocol,
    reassembler: Arc<FrameReassembler>,
    sink: Arc<dyn FrameSink>,
    running: Arc<AtomicBool>,
    /// Optional copy of every datagram for the pcap recorder.
    capture_tx: Option<Sender<RawDatagram>>,
}

impl FrameReceiver {
    /// Bind the socket described by `config`. Fails if the port is taken.
    pub fn bind(
        config: &ListenConfig,
        reassembler: Arc<FrameReassembler>,
        sink: Arc<dyn FrameSink>,
        running: Arc<AtomicBool>,
        capture_tx: Option<Sender<RawDatagram>>,
    ) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        if socket.set_recv_buffer_size(config.recv_buffer_bytes).is_ok() {
            if let Ok(actual) = socket.recv_buffer_size() {
                if actual < config.recv_buffer_bytes / 2 {
                    tracing::warn!(
                        "recv buffer is {}KB (wanted {}KB); \
                         raise it with: sysctl -w net.core.rmem_max={}",
                        actual / 1024,
                        config.recv_buffer_bytes / 1024,
                        config.recv_buffer_bytes * 2
                    );
                }
            }
        }

        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind UDP socket on {}", addr))?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(Self { socket, protocol: config.protocol, reassembler, sink, running, capture_tx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until the running flag is cleared.
    pub fn run(&mut self) -> Result<()> {
        let local_port = self.local_addr()?.port();
        tracing::info!("UDP listener started on port {}", local_port);

        let mut buf = vec![0u8; PKT_CAP];
        while self.running.load(Ordering::Relaxed) {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    tracing::error!("UDP recv error: {}", e);
                    continue;
                }
            };
            let now = metrics::now_ns();

            if let Some(ref tx) = self.capture_tx {
                let _ = tx.try_send(RawDatagram {
                    data: buf[..n].to_vec(),
                    from,
                    local_port,
                    recv_ns: now,
                });
            }

            process_datagram(
                self.protocol,
                &buf[..n],
                Some(from),
                now,
                &self.reassembler,
                self.sink.as_ref(),
            );
        }

        tracing::info!("UDP listener stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
