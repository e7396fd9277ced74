pub mod diagnostic;
pub mod json;
pub mod listener;
pub mod metrics;
pub mod reassembler;
pub mod receiver;
pub mod sink;
pub mod wire;

pub use diagnostic::Diagnostic;
pub use listener::Listener;
pub use metrics::{ReceiverMetrics, ReceiverMetricsSnapshot};
pub use reassembler::{is_newer, CompletedFrame, DeliveryPolicy, FrameReassembler};
pub use receiver::{process_datagram, FrameReceiver, ListenConfig, RawDatagram, WireProtocol};
pub use sink::{FanOutSink, FnSink, FrameSink, PositionFrame, PositionSink};
pub use wire::{ChunkHeader, ErrorKind, ParseError, Point, SplitError};
