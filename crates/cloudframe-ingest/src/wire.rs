//! Point-chunk wire codec.
//!
//! Every datagram carries one chunk of a point-cloud frame: a fixed 16-byte
//! little-endian header followed by `points_in_chunk` packed points.
//!
//! ```text
//!   Byte   0        = msg_type        (u8, 0 = point chunk)
//!   Byte   1        = flags           (u8, reserved)
//!   Bytes  2 ..  5  = frame_id        (u32 LE, wraps at 2^32)
//!   Bytes  6 ..  7  = chunk_index     (u16 LE, 0-based)
//!   Bytes  8 ..  9  = total_chunks    (u16 LE)
//!   Bytes 10 .. 11  = points_in_chunk (u16 LE)
//!   Bytes 12 .. 15  = total_points    (u32 LE, capacity hint)
//!   Bytes 16 ..     = points_in_chunk × { f32 x, f32 y, f32 z, f32 intensity } LE
//! ```
//!
//! Decoding is a pure function: a rejected datagram leaves no state behind.

use serde::Serialize;
use thiserror::Error;

pub const HEADER_SIZE: usize = 16;
/// Four f32 components per point.
pub const BYTES_PER_POINT: usize = 16;
pub const MSG_TYPE_POINT_CHUNK: u8 = 0;

const TYPE_OFF: usize = 0;
const FLAGS_OFF: usize = 1;
const FRAME_ID_OFF: usize = 2;
const CHUNK_INDEX_OFF: usize = 6;
const TOTAL_CHUNKS_OFF: usize = 8;
const POINTS_IN_CHUNK_OFF: usize = 10;
const TOTAL_POINTS_OFF: usize = 12;

/// One point of a cloud: position plus sensor intensity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub intensity: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32, z: f32, intensity: f32) -> Self {
        Self { x, y, z, intensity }
    }

    pub fn position(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Parsed chunk header. `flags` is carried but never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub msg_type: u8,
    pub flags: u8,
    pub frame_id: u32,
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub points_in_chunk: u16,
    pub total_points: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Datagram shorter than the fixed header.
    TruncatedHeader,
    /// Header parsed but `msg_type` is not a point chunk.
    UnsupportedMessageType,
    /// Payload shorter than `points_in_chunk × 16` bytes.
    TruncatedPayload,
}

/// Why a datagram was rejected. Always recoverable: drop the datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("datagram too small: {len} bytes, header needs 16")]
    TruncatedHeader { len: usize },

    #[error("unsupported msg_type {msg_type}")]
    UnsupportedMessageType { msg_type: u8 },

    #[error(
        "payload too small: expected {expected} bytes for {points} points, got {actual} \
         (frame={frame_id} chunk={chunk_index}/{total_chunks})"
    )]
    TruncatedPayload {
        expected: usize,
        actual: usize,
        points: u16,
        frame_id: u32,
        chunk_index: u16,
        total_chunks: u16,
    },
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::TruncatedHeader { .. } => ErrorKind::TruncatedHeader,
            ParseError::UnsupportedMessageType { .. } => ErrorKind::UnsupportedMessageType,
            ParseError::TruncatedPayload { .. } => ErrorKind::TruncatedPayload,
        }
    }
}

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn read_f32(bytes: &[u8], off: usize) -> f32 {
    f32::from_bits(read_u32(bytes, off))
}

/// Parse the fixed header. Caller guarantees `bytes.len() >= HEADER_SIZE`.
fn parse_header(bytes: &[u8]) -> ChunkHeader {
    ChunkHeader {
        msg_type: bytes[TYPE_OFF],
        flags: bytes[FLAGS_OFF],
        frame_id: read_u32(bytes, FRAME_ID_OFF),
        chunk_index: read_u16(bytes, CHUNK_INDEX_OFF),
        total_chunks: read_u16(bytes, TOTAL_CHUNKS_OFF),
        points_in_chunk: read_u16(bytes, POINTS_IN_CHUNK_OFF),
        total_points: read_u32(bytes, TOTAL_POINTS_OFF),
    }
}

/// Decode one point-chunk datagram into its header and points.
///
/// Trailing bytes past the declared payload are ignored.
pub fn decode(bytes: &[u8]) -> Result<(ChunkHeader, Vec<Point>), ParseError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ParseError::TruncatedHeader { len: bytes.len() });
    }
    let header = parse_header(bytes);

    if header.msg_type != MSG_TYPE_POINT_CHUNK {
        return Err(ParseError::UnsupportedMessageType { msg_type: header.msg_type });
    }

    let expected = header.points_in_chunk as usize * BYTES_PER_POINT;
    let actual = bytes.len() - HEADER_SIZE;
    if actual < expected {
        return Err(ParseError::TruncatedPayload {
            expected,
            actual,
            points: header.points_in_chunk,
            frame_id: header.frame_id,
            chunk_index: header.chunk_index,
            total_chunks: header.total_chunks,
        });
    }

    let points = bytes[HEADER_SIZE..HEADER_SIZE + expected]
        .chunks_exact(BYTES_PER_POINT)
        .map(|p| Point {
            x: read_f32(p, 0),
            y: read_f32(p, 4),
            z: read_f32(p, 8),
            intensity: read_f32(p, 12),
        })
        .collect();

    Ok((header, points))
}

/// Encode a chunk datagram. `points_in_chunk` is taken from `points.len()`
/// (truncated to `u16::MAX` points); the header's own field is ignored.
pub fn encode_chunk(header: &ChunkHeader, points: &[Point]) -> Vec<u8> {
    let count = points.len().min(u16::MAX as usize);
    let mut buf = Vec::with_capacity(HEADER_SIZE + count * BYTES_PER_POINT);
    buf.push(header.msg_type);
    buf.push(header.flags);
    buf.extend_from_slice(&header.frame_id.to_le_bytes());
    buf.extend_from_slice(&header.chunk_index.to_le_bytes());
    buf.extend_from_slice(&header.total_chunks.to_le_bytes());
    buf.extend_from_slice(&(count as u16).to_le_bytes());
    buf.extend_from_slice(&header.total_points.to_le_bytes());
    for p in &points[..count] {
        buf.extend_from_slice(&p.x.to_le_bytes());
        buf.extend_from_slice(&p.y.to_le_bytes());
        buf.extend_from_slice(&p.z.to_le_bytes());
        buf.extend_from_slice(&p.intensity.to_le_bytes());
    }
    buf
}

/// Frame that cannot be described by one chunk header set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("frame of {points} points needs {chunks} chunks, the header allows 65535")]
    TooManyChunks { points: usize, chunks: usize },

    #[error("frame of {points} points does not fit the u32 total_points field")]
    TooManyPoints { points: usize },
}

/// Split a whole frame into encoded chunk datagrams in index order.
///
/// An empty frame still produces one zero-point chunk so the receiver sees it.
/// `points_per_chunk` is clamped to `1..=65535`.
pub fn split_frame(
    frame_id: u32,
    points: &[Point],
    points_per_chunk: usize,
) -> Result<Vec<Vec<u8>>, SplitError> {
    let total_points = u32::try_from(points.len())
        .map_err(|_| SplitError::TooManyPoints { points: points.len() })?;
    let per_chunk = points_per_chunk.clamp(1, u16::MAX as usize);
    let chunks: Vec<&[Point]> = if points.is_empty() {
        vec![points]
    } else {
        points.chunks(per_chunk).collect()
    };
    let total_chunks = u16::try_from(chunks.len()).map_err(|_| SplitError::TooManyChunks {
        points: points.len(),
        chunks: chunks.len(),
    })?;

    Ok(chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let header = ChunkHeader {
                msg_type: MSG_TYPE_POINT_CHUNK,
                flags: 0,
                frame_id,
                chunk_index: i as u16,
                total_chunks,
                points_in_chunk: chunk.len() as u16,
                total_points,
            };
            encode_chunk(&header, chunk)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_chunk(
        frame_id: u32,
        chunk_index: u16,
        total_chunks: u16,
        points: &[[f32; 4]],
    ) -> Vec<u8> {
        let header = ChunkHeader {
            msg_type: 0,
            flags: 0,
            frame_id,
            chunk_index,
            total_chunks,
            points_in_chunk: points.len() as u16,
            total_points: 0,
        };
        let pts: Vec<Point> = points.iter().map(|p| Point::new(p[0], p[1], p[2], p[3])).collect();
        encode_chunk(&header, &pts)
    }

    #[test]
    fn test_decode_too_short() {
        for len in [0usize, 1, 10, 15] {
            let err = decode(&vec![0u8; len]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TruncatedHeader);
            assert_eq!(err, ParseError::TruncatedHeader { len });
        }
    }

    #[test]
    fn test_decode_header_only_zero_points() {
        let bytes = make_chunk(7, 0, 1, &[]);
        assert_eq!(bytes.len(), HEADER_SIZE);
        let (hdr, pts) = decode(&bytes).expect("header-only chunk is valid");
        assert_eq!(hdr.frame_id, 7);
        assert_eq!(hdr.total_chunks, 1);
        assert!(pts.is_empty());
    }

    #[test]
    fn test_decode_field_offsets() {
        let mut bytes = vec![0u8; HEADER_SIZE + BYTES_PER_POINT];
        bytes[1] = 0xFF; // flags are ignored
        bytes[2..6].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        bytes[6..8].copy_from_slice(&3u16.to_le_bytes());
        bytes[8..10].copy_from_slice(&9u16.to_le_bytes());
        bytes[10..12].copy_from_slice(&1u16.to_le_bytes());
        bytes[12..16].copy_from_slice(&1234u32.to_le_bytes());
        bytes[16..20].copy_from_slice(&1.5f32.to_le_bytes());
        bytes[20..24].copy_from_slice(&(-2.0f32).to_le_bytes());
        bytes[24..28].copy_from_slice(&3.25f32.to_le_bytes());
        bytes[28..32].copy_from_slice(&0.75f32.to_le_bytes());

        let (hdr, pts) = decode(&bytes).unwrap();
        assert_eq!(hdr.flags, 0xFF);
        assert_eq!(hdr.frame_id, 0xDEADBEEF);
        assert_eq!(hdr.chunk_index, 3);
        assert_eq!(hdr.total_chunks, 9);
        assert_eq!(hdr.points_in_chunk, 1);
        assert_eq!(hdr.total_points, 1234);
        assert_eq!(pts, vec![Point::new(1.5, -2.0, 3.25, 0.75)]);
    }

    #[test]
    fn test_decode_unsupported_type() {
        let mut bytes = make_chunk(1, 0, 1, &[[1.0, 2.0, 3.0, 4.0]]);
        bytes[0] = 2;
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMessageType);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut bytes = make_chunk(5, 0, 1, &[[1.0, 1.0, 1.0, 1.0], [2.0, 2.0, 2.0, 2.0]]);
        bytes.truncate(bytes.len() - 1);
        match decode(&bytes).unwrap_err() {
            ParseError::TruncatedPayload { expected, actual, points, frame_id, .. } => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 31);
                assert_eq!(points, 2);
                assert_eq!(frame_id, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_declared_count_exceeds_payload() {
        let mut bytes = make_chunk(5, 0, 1, &[[1.0, 1.0, 1.0, 1.0]]);
        bytes[10..12].copy_from_slice(&500u16.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap_err().kind(), ErrorKind::TruncatedPayload);
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = make_chunk(5, 0, 1, &[[1.0, 2.0, 3.0, 4.0]]);
        bytes.extend_from_slice(&[0xAA; 7]);
        let (_, pts) = decode(&bytes).unwrap();
        assert_eq!(pts, vec![Point::new(1.0, 2.0, 3.0, 4.0)]);
    }

    #[test]
    fn test_example_datagram() {
        let bytes = make_chunk(42, 1, 2, &[[1.0, 2.0, 3.0, 0.5]]);
        let (hdr, pts) = decode(&bytes).unwrap();
        assert_eq!(hdr.frame_id, 42);
        assert_eq!(hdr.chunk_index, 1);
        assert_eq!(hdr.total_chunks, 2);
        assert_eq!(pts, vec![Point::new(1.0, 2.0, 3.0, 0.5)]);
    }

    #[test]
    fn test_split_frame_chunking() {
        let points: Vec<Point> = (0..10).map(|i| Point::new(i as f32, 0.0, 0.0, 1.0)).collect();
        let chunks = split_frame(99, &points, 4).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut rebuilt = Vec::new();
        for (i, c) in chunks.iter().enumerate() {
            let (hdr, pts) = decode(c).unwrap();
            assert_eq!(hdr.chunk_index as usize, i);
            assert_eq!(hdr.total_chunks, 3);
            assert_eq!(hdr.total_points, 10);
            rebuilt.extend(pts);
        }
        assert_eq!(rebuilt, points);
    }

    #[test]
    fn test_split_empty_frame() {
        let chunks = split_frame(1, &[], 100).unwrap();
        assert_eq!(chunks.len(), 1);
        let (hdr, pts) = decode(&chunks[0]).unwrap();
        assert_eq!(hdr.total_chunks, 1);
        assert!(pts.is_empty());
    }

    #[test]
    fn test_split_rejects_too_many_chunks() {
        let points = vec![Point::default(); u16::MAX as usize + 1];
        assert_eq!(
            split_frame(1, &points, 1),
            Err(SplitError::TooManyChunks { points: 65_536, chunks: 65_536 })
        );
        // The same frame fits once chunks hold two points each.
        let chunks = split_frame(1, &points, 2).unwrap();
        assert_eq!(chunks.len(), 32_768);
        let (hdr, _) = decode(chunks.last().unwrap()).unwrap();
        assert_eq!(hdr.chunk_index, 32_767);
        assert_eq!(hdr.total_chunks, 32_768);
        assert_eq!(hdr.total_points, 65_536);
    }
}
