//! JSON whole-frame datagrams.
//!
//! Senders that fit a full frame in one datagram can skip chunking and send
//! `{"frame_id": 12, "points": [[x, y, z, intensity], ...]}`. There is nothing
//! to reassemble, so this path never touches [`crate::FrameReassembler`].

use serde::Deserialize;
use thiserror::Error;

use crate::reassembler::CompletedFrame;
use crate::wire::Point;

#[derive(Debug, Error)]
pub enum JsonFrameError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("point {index} has {len} components, expected 3 or 4")]
    BadPoint { index: usize, len: usize },
}

#[derive(Deserialize)]
struct JsonFrame {
    frame_id: u32,
    #[serde(default)]
    points: Vec<Vec<f32>>,
}

/// Decode one JSON frame datagram. Points without an intensity get 1.0.
pub fn decode_frame(bytes: &[u8]) -> Result<CompletedFrame, JsonFrameError> {
    let raw: JsonFrame = serde_json::from_slice(bytes)?;
    let points = raw
        .points
        .iter()
        .enumerate()
        .map(|(index, p)| match p.as_slice() {
            &[x, y, z] => Ok(Point::new(x, y, z, 1.0)),
            &[x, y, z, i] => Ok(Point::new(x, y, z, i)),
            _ => Err(JsonFrameError::BadPoint { index, len: p.len() }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CompletedFrame { frame_id: raw.frame_id, points })
}
