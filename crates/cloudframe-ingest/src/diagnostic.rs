//! Side-channel events describing datagrams and frames that were discarded.
//!
//! None of these are errors: each one means a single datagram or frame was
//! dropped and processing continued. They are sent with `try_send` on an
//! optional channel, so a slow or absent consumer never stalls ingestion.

use std::net::SocketAddr;

use crate::wire::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Datagram failed wire decoding and was discarded.
    ParseRejected { kind: ErrorKind, len: usize, from: Option<SocketAddr> },
    /// Frame stayed incomplete past the staleness timeout and its buffer was dropped.
    StaleFrameEvicted { frame_id: u32, received_chunks: usize, total_chunks: u16 },
    /// Frame completed but was not newer than the last delivered frame.
    StaleFrameDroppedAtDelivery { frame_id: u32, last_delivered: u32 },
    /// Chunk index already recorded for this frame; first copy wins.
    DuplicateChunkIgnored { frame_id: u32, chunk_index: u16 },
}
