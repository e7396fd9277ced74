//! `cloudframe send`: synthetic point-cloud sender.
//!
//! Generates a rotating spiral on a sphere, splits each frame into chunk
//! datagrams and sends them at a fixed frame rate. `--shuffle` and
//! `--duplicate-pct` reproduce the reordering and duplication a real network
//! produces, so a local `cloudframe listen` can be checked end to end.

use anyhow::{Context, Result};
use cloudframe_ingest::wire::{split_frame, BYTES_PER_POINT, HEADER_SIZE};
use cloudframe_ingest::Point;
use rand::seq::SliceRandom;
use rand::Rng;
use std::f32::consts::PI;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65_507;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

pub struct SendOptions {
    pub target: String,
    pub points: usize,
    pub chunk_points: usize,
    pub fps: f64,
    pub frames: u64,
    pub start_id: u32,
    pub shuffle: bool,
    pub duplicate_pct: u8,
    pub json: bool,
}

/// Put one frame's datagrams into send order: optionally shuffled, with
/// roughly `duplicate_pct` percent of them repeated right after themselves.
fn send_order<R: Rng>(
    mut datagrams: Vec<Vec<u8>>,
    shuffle: bool,
    duplicate_pct: u8,
    rng: &mut R,
) -> Vec<Vec<u8>> {
    if shuffle {
        datagrams.shuffle(rng);
    }
    if duplicate_pct == 0 {
        return datagrams;
    }
    let mut ordered = Vec::with_capacity(datagrams.len());
    for dgram in datagrams {
        if rng.random_range(0..100u8) < duplicate_pct {
            ordered.push(dgram.clone());
        }
        ordered.push(dgram);
    }
    ordered
}

/// Points on a unit-radius spiral that winds from pole to pole, rotated
/// about the z axis by the frame number. Intensity runs 0..1 along the spiral.
pub fn spiral_cloud(frame_no: u64, n: usize) -> Vec<Point> {
    let spin = (frame_no % 3600) as f32 * 0.05;
    (0..n)
        .map(|i| {
            let t = if n > 1 { i as f32 / (n - 1) as f32 } else { 0.0 };
            let theta = t * PI;
            let phi = t * 40.0 * PI + spin;
            Point::new(
                theta.sin() * phi.cos(),
                theta.sin() * phi.sin(),
                theta.cos(),
                t,
            )
        })
        .collect()
}

fn json_datagram(frame_id: u32, points: &[Point]) -> Result<Vec<u8>> {
    let rows: Vec<[f32; 4]> = points.iter().map(|p| [p.x, p.y, p.z, p.intensity]).collect();
    Ok(serde_json::to_vec(&serde_json::json!({ "frame_id": frame_id, "points": rows }))?)
}

fn resolve(target: &str) -> Result<SocketAddr> {
    target
        .to_socket_addrs()
        .with_context(|| format!("invalid target address '{}'", target))?
        .next()
        .with_context(|| format!("'{}' did not resolve", target))
}

pub fn run(opts: &SendOptions) -> Result<()> {
    if opts.chunk_points == 0 {
        anyhow::bail!("--chunk-points must be at least 1");
    }
    if HEADER_SIZE + opts.chunk_points * BYTES_PER_POINT > MAX_DATAGRAM {
        anyhow::bail!(
            "--chunk-points {} exceeds the {}-byte UDP limit (max {})",
            opts.chunk_points,
            MAX_DATAGRAM,
            (MAX_DATAGRAM - HEADER_SIZE) / BYTES_PER_POINT
        );
    }
    if !(opts.fps > 0.0 && opts.fps.is_finite()) {
        anyhow::bail!("--fps must be a positive number");
    }

    let target = resolve(&opts.target)?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).context("failed to bind sender socket")?;
    let period = Duration::from_secs_f64(1.0 / opts.fps);
    let mut rng = rand::rng();

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    eprintln!(
        "sending {} points/frame at {} fps to {} ({})",
        opts.points,
        opts.fps,
        target,
        if opts.json { "json" } else { "binary" }
    );

    let started = Instant::now();
    let mut next_deadline = started;
    let mut frame_id = opts.start_id;
    let mut sent_frames = 0u64;
    let mut sent_datagrams = 0u64;

    while RUNNING.load(Ordering::SeqCst) && (opts.frames == 0 || sent_frames < opts.frames) {
        let points = spiral_cloud(sent_frames, opts.points);

        let datagrams = if opts.json {
            let body = json_datagram(frame_id, &points)?;
            if body.len() > MAX_DATAGRAM {
                anyhow::bail!(
                    "JSON frame is {} bytes, over the UDP limit; lower --points",
                    body.len()
                );
            }
            vec![body]
        } else {
            split_frame(frame_id, &points, opts.chunk_points)?
        };
        let datagrams = send_order(datagrams, opts.shuffle, opts.duplicate_pct, &mut rng);

        for dgram in &datagrams {
            socket.send_to(dgram, target)?;
        }
        sent_datagrams += datagrams.len() as u64;

        tracing::debug!(frame_id, datagrams = datagrams.len(), "frame sent");
        frame_id = frame_id.wrapping_add(1);
        sent_frames += 1;

        next_deadline += period;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        } else {
            // Running behind; don't try to catch up with a burst.
            next_deadline = now;
        }
    }

    let elapsed = started.elapsed().as_secs_f64().max(1e-9);
    eprintln!(
        "sent {} frames / {} datagrams in {:.1}s ({:.1} fps)",
        sent_frames,
        sent_datagrams,
        elapsed,
        sent_frames as f64 / elapsed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_spiral_cloud_on_unit_sphere() {
        let cloud = spiral_cloud(7, 500);
        assert_eq!(cloud.len(), 500);
        for p in &cloud {
            let r = (p.x * p.x + p.y * p.y + p.z * p.z).sqrt();
            assert!((r - 1.0).abs() < 1e-4);
            assert!((0.0..=1.0).contains(&p.intensity));
        }
        assert!((cloud[0].z - 1.0).abs() < 1e-6);
        assert!((cloud[499].z + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_spiral_cloud_rotates() {
        assert_ne!(spiral_cloud(0, 10), spiral_cloud(1, 10));
        assert_eq!(spiral_cloud(3, 10), spiral_cloud(3, 10));
        assert_eq!(spiral_cloud(0, 1).len(), 1);
        assert!(spiral_cloud(0, 0).is_empty());
    }

    fn tagged(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i]).collect()
    }

    #[test]
    fn test_send_order_plain() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(send_order(tagged(5), false, 0, &mut rng), tagged(5));
    }

    #[test]
    fn test_send_order_shuffle_is_permutation() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut order = send_order(tagged(50), true, 0, &mut rng);
        assert_ne!(order, tagged(50));
        order.sort_unstable();
        assert_eq!(order, tagged(50));
    }

    #[test]
    fn test_send_order_duplicates() {
        let mut rng = StdRng::seed_from_u64(7);
        let all = send_order(tagged(20), false, 100, &mut rng);
        assert_eq!(all.len(), 40);
        for pair in all.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }

        let some = send_order(tagged(200), true, 30, &mut rng);
        assert!(some.len() > 200 && some.len() < 400);
        let mut distinct = some.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct, tagged(200));
    }

    #[test]
    fn test_json_datagram_decodes() {
        let points = spiral_cloud(0, 3);
        let body = json_datagram(9, &points).unwrap();
        let frame = cloudframe_ingest::json::decode_frame(&body).unwrap();
        assert_eq!(frame.frame_id, 9);
        assert_eq!(frame.points.len(), points.len());
        for (a, b) in frame.points.iter().zip(&points) {
            assert!((a.x - b.x).abs() < 1e-6 && (a.intensity - b.intensity).abs() < 1e-6);
        }
    }
}
