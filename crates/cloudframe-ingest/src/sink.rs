//! Delivery sinks for completed frames.
//!
//! The receive loop calls [`FrameSink::deliver`] once per delivered frame,
//! always after the reassembler lock has been released. The core does not care
//! how many consumers sit behind a sink or which thread they run on.

use crossbeam_channel::Sender;

use crate::reassembler::CompletedFrame;

/// Positions-only view of a delivered frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFrame {
    pub frame_id: u32,
    pub positions: Vec<[f32; 3]>,
}

/// Destination for completed frames.
pub trait FrameSink: Send + Sync + 'static {
    /// Hand over one frame. Returns `false` only if the consumer is gone;
    /// the frame is then dropped. Runs on the receive thread.
    fn deliver(&self, frame: CompletedFrame) -> bool;
}

/// Queues every frame. An unbounded channel never blocks the receive thread;
/// a bounded one waits for room rather than losing a delivered frame.
impl FrameSink for Sender<CompletedFrame> {
    fn deliver(&self, frame: CompletedFrame) -> bool {
        self.send(frame).is_ok()
    }
}

/// Forwards only x/y/z of each frame to a channel.
pub struct PositionSink(pub Sender<PositionFrame>);

impl FrameSink for PositionSink {
    fn deliver(&self, frame: CompletedFrame) -> bool {
        let positions = frame.positions();
        self.0.send(PositionFrame { frame_id: frame.frame_id, positions }).is_ok()
    }
}

/// Calls a closure for every frame. The closure runs on the receive thread.
pub struct FnSink<F>(pub F);

impl<F> FrameSink for FnSink<F>
where
    F: Fn(CompletedFrame) + Send + Sync + 'static,
{
    fn deliver(&self, frame: CompletedFrame) -> bool {
        (self.0)(frame);
        true
    }
}

/// Broadcasts each frame to every registered sink.
#[derive(Default)]
pub struct FanOutSink {
    sinks: Vec<Box<dyn FrameSink>>,
}

impl FanOutSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl FrameSink for FanOutSink {
    /// Accepted if at least one sink took the frame.
    fn deliver(&self, frame: CompletedFrame) -> bool {
        let Some((last, rest)) = self.sinks.split_last() else {
            return false;
        };
        let mut accepted = false;
        for sink in rest {
            accepted |= sink.deliver(frame.clone());
        }
        accepted | last.deliver(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Point;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame(id: u32) -> CompletedFrame {
        CompletedFrame { frame_id: id, points: vec![Point::new(1.0, 2.0, 3.0, 0.25)] }
    }

    #[test]
    fn test_channel_sink_keeps_every_frame() {
        let (tx, rx) = crossbeam_channel::unbounded::<CompletedFrame>();
        for id in 1..=100 {
            assert!(tx.deliver(frame(id)));
        }
        let ids: Vec<u32> = rx.try_iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, (1..=100).collect::<Vec<u32>>());
    }

    #[test]
    fn test_channel_sink_disconnected() {
        let (tx, rx) = crossbeam_channel::bounded::<CompletedFrame>(1);
        drop(rx);
        assert!(!tx.deliver(frame(1)));
    }

    #[test]
    fn test_position_sink_strips_intensity() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let sink = PositionSink(tx);
        assert!(sink.deliver(frame(5)));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.frame_id, 5);
        assert_eq!(got.positions, vec![[1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_fan_out_reaches_every_sink() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let (full_tx, full_rx) = crossbeam_channel::bounded::<CompletedFrame>(4);
        let (pos_tx, pos_rx) = crossbeam_channel::bounded(4);

        let mut fan = FanOutSink::new();
        fan.add_sink(Box::new(full_tx));
        fan.add_sink(Box::new(PositionSink(pos_tx)));
        fan.add_sink(Box::new(FnSink(move |_f: CompletedFrame| {
            c.fetch_add(1, Ordering::Relaxed);
        })));
        assert_eq!(fan.len(), 3);

        assert!(fan.deliver(frame(9)));
        assert_eq!(full_rx.try_recv().unwrap().frame_id, 9);
        assert_eq!(pos_rx.try_recv().unwrap().frame_id, 9);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_empty_fan_out_rejects() {
        let fan = FanOutSink::new();
        assert!(fan.is_empty());
        assert!(!fan.deliver(frame(1)));
    }
}
