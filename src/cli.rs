//! CLI definitions for cloudframe.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "cloudframe",
    version,
    about = "UDP point-cloud frame receiver\n\nReassembles chunked point-cloud frames from UDP datagrams and delivers each completed frame in order.",
    long_about = None
)]
pub struct Cli {
    /// Path to cloudframe.toml config file
    #[clap(long, short, default_value = "cloudframe.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Receive and reassemble frames, printing throughput stats (Ctrl-C to stop)
    Listen {
        /// Stats refresh interval in seconds
        #[clap(long, default_value = "5")]
        interval: u64,

        /// Override `listen_port` from the config file
        #[clap(long)]
        port: Option<u16>,
    },

    /// Send a synthetic rotating point cloud to a listener
    Send {
        /// Destination address
        #[clap(long, default_value = "127.0.0.1:7000")]
        target: String,

        /// Points per frame
        #[clap(long, default_value = "20000")]
        points: usize,

        /// Points per chunk datagram (1000 points = 16016 bytes)
        #[clap(long, default_value = "1000")]
        chunk_points: usize,

        /// Frames per second
        #[clap(long, default_value = "10")]
        fps: f64,

        /// Stop after this many frames (0 = run until Ctrl-C)
        #[clap(long, default_value = "0")]
        frames: u64,

        /// First frame id; set near u32::MAX to exercise wraparound
        #[clap(long, default_value = "0")]
        start_id: u32,

        /// Send each frame's chunks in random order
        #[clap(long)]
        shuffle: bool,

        /// Percentage of chunks to send twice
        #[clap(long, default_value = "0")]
        duplicate_pct: u8,

        /// Send whole frames as JSON datagrams instead of binary chunks
        #[clap(long)]
        json: bool,
    },

    /// Reassemble frames from a recorded pcap file
    Replay {
        /// Capture file (Ethernet, raw IPv4 or Linux cooked link type)
        pcap: PathBuf,

        /// Only use UDP datagrams sent to this port
        #[clap(long)]
        port: Option<u16>,

        /// Print every completed frame
        #[clap(long)]
        verbose: bool,
    },

    /// Print an example cloudframe.toml to stdout
    Init,
}
