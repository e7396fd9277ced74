//! `cloudframe listen`: live receiver.
//!
//! Starts a [`Listener`] on the configured port, consumes completed frames on
//! a `frame-consumer` thread, and every interval prints a one-line stats
//! summary to stderr. With `stats_log` set, the same numbers are appended as
//! a JSONL line so a long-running receiver leaves a history behind.

use anyhow::Result;
use chrono::{Local, SecondsFormat, Utc};
use cloudframe_ingest::{
    CompletedFrame, FrameReassembler, Listener, ReceiverMetrics, ReceiverMetricsSnapshot,
};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture;
use crate::config::ReceiverConfig;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Raw datagrams buffered on their way to the pcap writer.
const CAPTURE_CHANNEL_CAPACITY: usize = 8192;
const POLL: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct StatsLine<'a> {
    ts: String,
    interval_secs: f64,
    frames_per_sec: f64,
    datagrams_per_sec: f64,
    mbit_per_sec: f64,
    pending_frames: usize,
    last_frame_id: Option<u32>,
    totals: &'a ReceiverMetricsSnapshot,
}

fn per_sec(curr: u64, prev: u64, elapsed: f64) -> f64 {
    curr.saturating_sub(prev) as f64 / elapsed
}

fn make_line<'a>(
    c: &'a ReceiverMetricsSnapshot,
    p: &ReceiverMetricsSnapshot,
    elapsed: f64,
    reassembler: &FrameReassembler,
) -> StatsLine<'a> {
    StatsLine {
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        interval_secs: elapsed,
        frames_per_sec: per_sec(c.frames_delivered, p.frames_delivered, elapsed),
        datagrams_per_sec: per_sec(c.datagrams_received, p.datagrams_received, elapsed),
        mbit_per_sec: per_sec(c.bytes_received, p.bytes_received, elapsed) * 8.0 / 1e6,
        pending_frames: reassembler.pending_frames(),
        last_frame_id: reassembler.last_delivered(),
        totals: c,
    }
}

fn print_line(line: &StatsLine<'_>) {
    let t = line.totals;
    eprintln!(
        "[{}] {:>6.1} fps | {:>7.0} dgram/s | {:>7.1} Mbit/s | pending {:>3} | evicted {} | stale {} | dup {} | rejected {} | sink drops {}",
        Local::now().format("%H:%M:%S"),
        line.frames_per_sec,
        line.datagrams_per_sec,
        line.mbit_per_sec,
        line.pending_frames,
        t.frames_evicted,
        t.frames_dropped_stale,
        t.duplicate_chunks,
        t.rejected_total(),
        t.frames_sink_dropped,
    );
}

fn append_line(path: &Path, line: &StatsLine<'_>) {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut file) => {
            if let Ok(text) = serde_json::to_string(line) {
                let _ = writeln!(file, "{}", text);
            }
        }
        Err(e) => tracing::warn!("cannot append to {}: {}", path.display(), e),
    }
}

/// Summarise a frame for the debug log: point count plus axis-aligned bounds.
fn describe(frame: &CompletedFrame) -> String {
    if frame.points.is_empty() {
        return format!("frame {}: empty", frame.frame_id);
    }
    let mut lo = [f32::INFINITY; 3];
    let mut hi = [f32::NEG_INFINITY; 3];
    for p in &frame.points {
        for (axis, v) in p.position().into_iter().enumerate() {
            lo[axis] = lo[axis].min(v);
            hi[axis] = hi[axis].max(v);
        }
    }
    format!(
        "frame {}: {} points, bounds [{:.2}, {:.2}, {:.2}]..[{:.2}, {:.2}, {:.2}]",
        frame.frame_id,
        frame.points.len(),
        lo[0],
        lo[1],
        lo[2],
        hi[0],
        hi[1],
        hi[2]
    )
}

pub fn run(config: &ReceiverConfig, interval_secs: u64, port: Option<u16>) -> Result<()> {
    let mut listen_config = config.listen_config()?;
    if let Some(port) = port {
        listen_config.port = port;
    }
    let dst_ip = listen_config.bind_addr;

    let metrics = ReceiverMetrics::new();
    let reassembler = Arc::new(FrameReassembler::new(
        config.timeout_ns(),
        config.delivery,
        metrics.clone(),
    ));

    // Unbounded so no frame that passed the delivery gate is ever dropped.
    let (frame_tx, frame_rx) = crossbeam_channel::unbounded::<CompletedFrame>();
    let mut listener = Listener::new(listen_config, reassembler.clone(), Arc::new(frame_tx));

    let capture_handle = match &config.record_pcap {
        Some(path) => {
            let (cap_tx, cap_rx) = crossbeam_channel::bounded(CAPTURE_CHANNEL_CAPACITY);
            let handle = capture::spawn_capture_thread(Path::new(path), dst_ip, cap_rx)?;
            listener = listener.with_capture(cap_tx);
            Some(handle)
        }
        None => None,
    };

    let addr = listener.start()?;
    eprintln!(
        "cloudframe listen: {} on {}, {:?} delivery, {}s chunk timeout",
        match config.protocol {
            cloudframe_ingest::WireProtocol::Binary => "binary",
            cloudframe_ingest::WireProtocol::Json => "json",
        },
        addr,
        config.delivery,
        config.chunk_timeout_secs
    );
    if let Some(path) = &config.stats_log {
        eprintln!("Appending stats to {} every {}s.", path, interval_secs);
    }

    let consumer = std::thread::Builder::new()
        .name("frame-consumer".into())
        .spawn(move || {
            for frame in frame_rx {
                tracing::debug!("{}", describe(&frame));
            }
        })?;

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    let interval = Duration::from_secs(interval_secs.max(1));
    let mut prev = metrics.snapshot();
    let mut prev_time = Instant::now();

    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(POLL);
        let now = Instant::now();
        if now.duration_since(prev_time) < interval {
            continue;
        }
        let elapsed = now.duration_since(prev_time).as_secs_f64();
        prev_time = now;

        let curr = metrics.snapshot();
        let line = make_line(&curr, &prev, elapsed, &reassembler);
        print_line(&line);
        if let Some(path) = &config.stats_log {
            append_line(Path::new(path), &line);
        }
        prev = curr;
    }

    eprintln!();
    listener.stop();
    // Dropping the listener closes both the frame and capture channels.
    drop(listener);
    let _ = consumer.join();
    if let Some(handle) = capture_handle {
        let _ = handle.join();
    }

    let total = metrics.snapshot();
    eprintln!(
        "{} datagrams, {} frames delivered ({}), {} evicted, {} stale, {} rejected",
        total.datagrams_received,
        total.frames_delivered,
        total
            .delivery_pct()
            .map(|p| format!("{:.1}% of completed", p))
            .unwrap_or_else(|| "none completed".into()),
        total.frames_evicted,
        total.frames_dropped_stale,
        total.rejected_total(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudframe_ingest::{DeliveryPolicy, Point};

    #[test]
    fn test_describe_bounds() {
        let frame = CompletedFrame {
            frame_id: 3,
            points: vec![Point::new(-1.0, 0.0, 2.0, 1.0), Point::new(1.0, 5.0, -2.0, 1.0)],
        };
        assert_eq!(
            describe(&frame),
            "frame 3: 2 points, bounds [-1.00, 0.00, -2.00]..[1.00, 5.00, 2.00]"
        );
        assert_eq!(describe(&CompletedFrame { frame_id: 4, points: vec![] }), "frame 4: empty");
    }

    #[test]
    fn test_stats_line_rates() {
        let reassembler =
            FrameReassembler::new(1_000_000, DeliveryPolicy::Monotonic, ReceiverMetrics::new());
        let prev = ReceiverMetricsSnapshot {
            datagrams_received: 100,
            bytes_received: 1_000_000,
            frames_delivered: 10,
            ..Default::default()
        };
        let curr = ReceiverMetricsSnapshot {
            datagrams_received: 300,
            bytes_received: 3_500_000,
            frames_delivered: 30,
            ..Default::default()
        };
        let line = make_line(&curr, &prev, 2.0, &reassembler);
        assert!((line.frames_per_sec - 10.0).abs() < 1e-9);
        assert!((line.datagrams_per_sec - 100.0).abs() < 1e-9);
        assert!((line.mbit_per_sec - 10.0).abs() < 1e-9);
        assert_eq!(line.pending_frames, 0);

        let json: serde_json::Value = serde_json::to_value(&line).unwrap();
        assert_eq!(json["totals"]["frames_delivered"], 30);
        assert!(json["last_frame_id"].is_null());
    }

    #[test]
    fn test_append_line_writes_jsonl() {
        let path = std::env::temp_dir().join(format!("cloudframe-stats-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let reassembler =
            FrameReassembler::new(1_000_000, DeliveryPolicy::Monotonic, ReceiverMetrics::new());
        let snap = ReceiverMetricsSnapshot::default();
        append_line(&path, &make_line(&snap, &snap, 1.0, &reassembler));
        append_line(&path, &make_line(&snap, &snap, 1.0, &reassembler));

        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert!(v["ts"].as_str().unwrap().ends_with('Z'));
    }
}
