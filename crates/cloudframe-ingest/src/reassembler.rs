//! Frame reassembly.
//!
//! Accepts decoded chunks from the receive loop, accumulates them per frame
//! identifier, and hands back the frame once every chunk index has arrived.
//! Chunks are stored keyed by index, so output order is ascending chunk index
//! no matter what order the network delivered them in.
//!
//! ## Lifecycle of a frame buffer
//! * created on the first chunk seen for an unknown `frame_id`
//! * mutated by each new chunk index; repeated indices are ignored (first copy wins)
//! * destroyed on completion, or on eviction once older than the staleness timeout
//!
//! Eviction runs at the start of every [`FrameReassembler::ingest`] call, so
//! memory stays bounded by (timeout × chunk arrival rate) without a sweeper thread.
//!
//! ## Delivery order
//! [`DeliveryPolicy::Monotonic`] never lets the consumer see frame ids go
//! backwards: a completed frame is delivered only if it is newer than the last
//! one delivered, compared by signed 32-bit difference so the id can wrap.
//! [`DeliveryPolicy::Unordered`] delivers every completed frame.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::diagnostic::Diagnostic;
use crate::metrics::ReceiverMetrics;
use crate::wire::{ChunkHeader, Point};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A fully reassembled frame, points in ascending chunk-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedFrame {
    pub frame_id: u32,
    pub points: Vec<Point>,
}

impl CompletedFrame {
    /// Positions only (x, y, z), for consumers that ignore intensity.
    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.points.iter().map(Point::position).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// Drop completed frames that are not newer than the last delivered one.
    #[default]
    Monotonic,
    /// Deliver every completed frame as soon as it completes.
    Unordered,
}

/// `true` if `candidate` comes after `last` in wrapping 32-bit id space.
///
/// `candidate - last` is read as a signed value, so `1` is newer than
/// `0xFFFF_FFFE` and anything within 2^31 behind `last` is older.
pub fn is_newer(candidate: u32, last: u32) -> bool {
    (candidate.wrapping_sub(last) as i32) > 0
}

// ---------------------------------------------------------------------------
// Per-frame state
// ---------------------------------------------------------------------------

struct FrameBuffer {
    total_chunks: u16,
    /// Capacity hint from the first chunk's header.
    total_points: u32,
    /// Chunk payloads keyed by chunk index. Key presence doubles as the
    /// received set; `len()` is the received-chunk count.
    chunks: BTreeMap<u16, Vec<Point>>,
    first_seen_ns: u64,
}

impl FrameBuffer {
    fn new(header: &ChunkHeader, now_ns: u64) -> Self {
        Self {
            total_chunks: header.total_chunks,
            total_points: header.total_points,
            chunks: BTreeMap::new(),
            first_seen_ns: now_ns,
        }
    }

    fn received_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn is_complete(&self) -> bool {
        self.received_chunks() >= self.total_chunks as usize
    }

    fn is_stale(&self, now_ns: u64, timeout_ns: u64) -> bool {
        now_ns.saturating_sub(self.first_seen_ns) > timeout_ns
    }

    /// Concatenate chunks `0..total_chunks` in ascending index order.
    /// Out-of-range indices count toward completion but contribute no points.
    fn into_points(self) -> Vec<Point> {
        let in_range = self.chunks.range(..self.total_chunks);
        let stored: usize = in_range.clone().map(|(_, c)| c.len()).sum();
        // Reserve the header hint, capped at what was actually received.
        let mut points = Vec::with_capacity((self.total_points as usize).min(stored));
        for (_, chunk) in in_range {
            points.extend_from_slice(chunk);
        }
        points
    }
}

/// Result of applying one chunk to the table, before any delivery decision.
enum Applied {
    Duplicate,
    Pending,
    Complete(Vec<Point>),
}

#[derive(Default)]
struct ReassemblerState {
    frames: HashMap<u32, FrameBuffer>,
    /// `Some` once any frame has been delivered.
    last_delivered: Option<u32>,
}

impl ReassemblerState {
    /// Remove and return `(frame_id, received, total)` for every stale buffer.
    fn evict_stale(&mut self, now_ns: u64, timeout_ns: u64) -> Vec<(u32, usize, u16)> {
        let mut evicted = Vec::new();
        self.frames.retain(|&frame_id, buf| {
            if buf.is_stale(now_ns, timeout_ns) {
                evicted.push((frame_id, buf.received_chunks(), buf.total_chunks));
                false
            } else {
                true
            }
        });
        evicted
    }

    fn apply(&mut self, header: &ChunkHeader, points: Vec<Point>, now_ns: u64) -> Applied {
        let frame = self
            .frames
            .entry(header.frame_id)
            .or_insert_with(|| FrameBuffer::new(header, now_ns));

        if frame.chunks.contains_key(&header.chunk_index) {
            return Applied::Duplicate;
        }
        frame.chunks.insert(header.chunk_index, points);

        if !frame.is_complete() {
            return Applied::Pending;
        }
        match self.frames.remove(&header.frame_id) {
            Some(buf) => Applied::Complete(buf.into_points()),
            None => Applied::Pending,
        }
    }

    /// Apply the delivery gate to a completed frame. On success the cursor advances.
    fn admit(&mut self, frame_id: u32, policy: DeliveryPolicy) -> Result<(), u32> {
        if policy == DeliveryPolicy::Monotonic {
            if let Some(last) = self.last_delivered {
                if !is_newer(frame_id, last) {
                    return Err(last);
                }
            }
        }
        self.last_delivered = Some(frame_id);
        Ok(())
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.last_delivered = None;
    }
}

// ---------------------------------------------------------------------------
// FrameReassembler
// ---------------------------------------------------------------------------

/// Thread-safe reassembly engine shared by the receive loop and its owner.
///
/// All mutable state sits behind one mutex. [`ingest`](Self::ingest) returns the
/// completed frame instead of delivering it, so callers hand it to a sink after
/// the lock is released.
pub struct FrameReassembler {
    state: Mutex<ReassemblerState>,
    timeout_ns: u64,
    policy: DeliveryPolicy,
    metrics: Arc<ReceiverMetrics>,
    diag_tx: Option<Sender<Diagnostic>>,
}

impl FrameReassembler {
    pub fn new(timeout_ns: u64, policy: DeliveryPolicy, metrics: Arc<ReceiverMetrics>) -> Self {
        Self {
            state: Mutex::new(ReassemblerState::default()),
            timeout_ns,
            policy,
            metrics,
            diag_tx: None,
        }
    }

    /// Forward diagnostics to `tx`. Full channels drop events silently.
    pub fn with_diagnostics(mut self, tx: Sender<Diagnostic>) -> Self {
        self.diag_tx = Some(tx);
        self
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    pub fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    pub fn metrics(&self) -> &Arc<ReceiverMetrics> {
        &self.metrics
    }

    fn lock(&self) -> MutexGuard<'_, ReassemblerState> {
        // No code path panics while holding the guard; a poisoned lock still
        // holds consistent state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn emit(&self, diag: Diagnostic) {
        if let Some(ref tx) = self.diag_tx {
            let _ = tx.try_send(diag);
        }
    }

    /// Apply one decoded chunk. Returns the frame if this chunk completed it
    /// and the delivery policy admits it.
    pub fn ingest(
        &self,
        header: &ChunkHeader,
        points: Vec<Point>,
        now_ns: u64,
    ) -> Option<CompletedFrame> {
        let mut state = self.lock();

        self.evict_locked(&mut state, now_ns);

        let points = match state.apply(header, points, now_ns) {
            Applied::Duplicate => {
                self.metrics.duplicate_chunks.fetch_add(1, Relaxed);
                tracing::debug!(
                    frame_id = header.frame_id,
                    chunk_index = header.chunk_index,
                    "duplicate chunk ignored"
                );
                self.emit(Diagnostic::DuplicateChunkIgnored {
                    frame_id: header.frame_id,
                    chunk_index: header.chunk_index,
                });
                return None;
            }
            Applied::Pending => {
                self.metrics.chunks_accepted.fetch_add(1, Relaxed);
                return None;
            }
            Applied::Complete(points) => {
                self.metrics.chunks_accepted.fetch_add(1, Relaxed);
                self.metrics.frames_completed.fetch_add(1, Relaxed);
                points
            }
        };

        if let Err(last_delivered) = state.admit(header.frame_id, self.policy) {
            self.metrics.frames_dropped_stale.fetch_add(1, Relaxed);
            tracing::debug!(
                frame_id = header.frame_id,
                last_delivered,
                "dropping stale frame"
            );
            self.emit(Diagnostic::StaleFrameDroppedAtDelivery {
                frame_id: header.frame_id,
                last_delivered,
            });
            return None;
        }
        drop(state);

        if tracing::enabled!(tracing::Level::DEBUG) {
            let preview: Vec<[f32; 4]> = points
                .iter()
                .take(3)
                .map(|p| [p.x, p.y, p.z, p.intensity])
                .collect();
            tracing::debug!(
                frame_id = header.frame_id,
                points = points.len(),
                ?preview,
                "frame complete"
            );
        }

        Some(CompletedFrame { frame_id: header.frame_id, points })
    }

    /// Drop every buffer older than the staleness timeout. Returns how many were dropped.
    pub fn evict_stale(&self, now_ns: u64) -> usize {
        let mut state = self.lock();
        self.evict_locked(&mut state, now_ns)
    }

    fn evict_locked(&self, state: &mut ReassemblerState, now_ns: u64) -> usize {
        let evicted = state.evict_stale(now_ns, self.timeout_ns);
        for &(frame_id, received_chunks, total_chunks) in &evicted {
            self.metrics.frames_evicted.fetch_add(1, Relaxed);
            tracing::warn!(
                "frame {} timed out ({}/{} chunks received), discarding",
                frame_id,
                received_chunks,
                total_chunks
            );
            self.emit(Diagnostic::StaleFrameEvicted { frame_id, received_chunks, total_chunks });
        }
        evicted.len()
    }

    /// Drop all in-flight buffers and forget the delivery cursor.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Number of frames currently mid-assembly.
    pub fn pending_frames(&self) -> usize {
        self.lock().frames.len()
    }

    /// Received-chunk count for an in-flight frame, or None if no buffer exists.
    pub fn received_chunks(&self, frame_id: u32) -> Option<usize> {
        self.lock().frames.get(&frame_id).map(FrameBuffer::received_chunks)
    }

    pub fn last_delivered(&self) -> Option<u32> {
        self.lock().last_delivered
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
