//! `cloudframe.toml` configuration.

use anyhow::{Context, Result};
use cloudframe_ingest::{DeliveryPolicy, ListenConfig, WireProtocol};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Top-level receiver configuration. Every field has a default, so an empty
/// file is a valid config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiverConfig {
    /// Local address to bind.
    #[serde(default = "ReceiverConfig::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "ReceiverConfig::default_listen_port")]
    pub listen_port: u16,
    /// Incomplete frames older than this are discarded.
    #[serde(default = "ReceiverConfig::default_chunk_timeout_secs")]
    pub chunk_timeout_secs: f64,
    /// "monotonic" drops completed frames older than the last one delivered;
    /// "unordered" delivers every completed frame.
    #[serde(default)]
    pub delivery: DeliveryPolicy,
    /// "binary" (chunked) or "json" (one frame per datagram).
    #[serde(default)]
    pub protocol: WireProtocol,
    /// Requested SO_RCVBUF size.
    #[serde(default = "ReceiverConfig::default_recv_buffer_bytes")]
    pub recv_buffer_bytes: usize,
    /// Log every completed frame and duplicate chunk.
    #[serde(default)]
    pub debug_log: bool,
    /// Append a JSONL stats line here every `listen` interval. Omit to disable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_log: Option<String>,
    /// Record every received datagram to this pcap file. Omit to disable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_pcap: Option<String>,
}

impl ReceiverConfig {
    fn default_bind_addr() -> String { "0.0.0.0".into() }
    fn default_listen_port() -> u16 { 7000 }
    fn default_chunk_timeout_secs() -> f64 { 0.3 }
    fn default_recv_buffer_bytes() -> usize { 16 * 1024 * 1024 }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Example config printed by `cloudframe init`.
    pub fn default_example() -> Self {
        Self {
            stats_log: Some("/var/log/cloudframe.jsonl".into()),
            ..Self::default()
        }
    }

    pub fn listen_config(&self) -> Result<ListenConfig> {
        let bind_addr: IpAddr = self
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind_addr '{}'", self.bind_addr))?;
        Ok(ListenConfig {
            bind_addr,
            port: self.listen_port,
            recv_buffer_bytes: self.recv_buffer_bytes,
            protocol: self.protocol,
        })
    }

    pub fn timeout_ns(&self) -> u64 {
        cloudframe_ingest::metrics::secs_to_ns(self.chunk_timeout_secs)
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            listen_port: Self::default_listen_port(),
            chunk_timeout_secs: Self::default_chunk_timeout_secs(),
            delivery: DeliveryPolicy::default(),
            protocol: WireProtocol::default(),
            recv_buffer_bytes: Self::default_recv_buffer_bytes(),
            debug_log: false,
            stats_log: None,
            record_pcap: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: ReceiverConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.listen_port, 7000);
        assert_eq!(cfg.delivery, DeliveryPolicy::Monotonic);
        assert_eq!(cfg.protocol, WireProtocol::Binary);
        assert_eq!(cfg.timeout_ns(), 300_000_000);
        assert!(cfg.stats_log.is_none());

        let listen = cfg.listen_config().unwrap();
        assert_eq!(listen.bind_addr, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(listen.recv_buffer_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_parse_overrides() {
        let cfg: ReceiverConfig = toml::from_str(
            r#"
            bind_addr = "127.0.0.1"
            listen_port = 9100
            chunk_timeout_secs = 1.5
            delivery = "unordered"
            protocol = "json"
            record_pcap = "/tmp/frames.pcap"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.delivery, DeliveryPolicy::Unordered);
        assert_eq!(cfg.protocol, WireProtocol::Json);
        assert_eq!(cfg.timeout_ns(), 1_500_000_000);
        assert_eq!(cfg.record_pcap.as_deref(), Some("/tmp/frames.pcap"));
        let listen = cfg.listen_config().unwrap();
        assert_eq!(listen.port, 9100);
        assert_eq!(listen.bind_addr, IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn test_rejects_unknown_policy() {
        assert!(toml::from_str::<ReceiverConfig>(r#"delivery = "latest""#).is_err());
    }

    #[test]
    fn test_bad_bind_addr() {
        let cfg = ReceiverConfig { bind_addr: "not-an-ip".into(), ..ReceiverConfig::default() };
        assert!(cfg.listen_config().is_err());
    }

    #[test]
    fn test_example_round_trips() {
        let text = toml::to_string_pretty(&ReceiverConfig::default_example()).unwrap();
        let back: ReceiverConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.stats_log.as_deref(), Some("/var/log/cloudframe.jsonl"));
        assert!(back.record_pcap.is_none());
    }
}
