//! Explicit configuration surface. Nothing is read from ambient
//! environment by the library; `EngineConfig` is built with an explicit
//! constructor, not a `Default` that reaches into env vars or files.
//!
//! CLI flag parsing (`parse_args`) is kept only as the demo binary's
//! wiring; it is not part of the library's tested surface — CLI entry
//! points are an external consumer of this crate.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::number_tool::parse_human_readable_u32;

/// Explicit construction, covering the full wire/transport surface plus
/// two policy toggles left to the deployer.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tcp_bind_addr: Ipv4Addr,
    pub tcp_port: u16,
    pub md_multicast_group: Ipv4Addr,
    pub md_port: u16,
    pub md_interface: Ipv4Addr,
    pub md_ttl: u32,
    pub snapshot_interval: Duration,
    pub max_book_depth: usize,
    pub heartbeat_timeout: Duration,
    pub ring_capacity: usize,
    /// Whether a closed session's resting orders are auto-cancelled.
    /// Defaults to `false` — resting orders survive a disconnect.
    pub cancel_on_disconnect: bool,
}

impl EngineConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tcp_bind_addr: Ipv4Addr,
        tcp_port: u16,
        md_multicast_group: Ipv4Addr,
        md_port: u16,
        md_interface: Ipv4Addr,
        md_ttl: u32,
        snapshot_interval: Duration,
        max_book_depth: usize,
        heartbeat_timeout: Duration,
        ring_capacity: usize,
    ) -> Self {
        EngineConfig {
            tcp_bind_addr,
            tcp_port,
            md_multicast_group,
            md_port,
            md_interface,
            md_ttl,
            snapshot_interval,
            max_book_depth,
            heartbeat_timeout,
            ring_capacity,
            cancel_on_disconnect: false,
        }
    }

    pub fn with_cancel_on_disconnect(mut self, value: bool) -> Self {
        self.cancel_on_disconnect = value;
        self
    }
}

/// Minimal argv parser for the demo binary. Not part of the tested
/// library surface — CLI entry points are an external consumer.
pub fn parse_args(args: &[String]) -> Result<EngineConfig, String> {
    let mut tcp_port = None;
    let mut md_port = None;
    let mut ring_capacity_str = None;
    let mut max_depth = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--tcp-port" => {
                if i + 1 < args.len() {
                    tcp_port = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--md-port" => {
                if i + 1 < args.len() {
                    md_port = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--ring-capacity" => {
                if i + 1 < args.len() {
                    ring_capacity_str = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--max-depth" => {
                if i + 1 < args.len() {
                    max_depth = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    let tcp_port: u16 = tcp_port
        .unwrap_or_else(|| "9001".to_string())
        .parse()
        .map_err(|_| "invalid --tcp-port".to_string())?;
    let md_port: u16 = md_port
        .unwrap_or_else(|| "9900".to_string())
        .parse()
        .map_err(|_| "invalid --md-port".to_string())?;
    let ring_capacity =
        parse_human_readable_u32(ring_capacity_str.as_deref().unwrap_or("4096"))
            .map_err(|e| format!("invalid --ring-capacity: {e}"))? as usize;
    let max_depth: usize = max_depth
        .unwrap_or_else(|| "20".to_string())
        .parse()
        .map_err(|_| "invalid --max-depth".to_string())?;

    Ok(EngineConfig::new(
        Ipv4Addr::UNSPECIFIED,
        tcp_port,
        Ipv4Addr::new(239, 0, 0, 1),
        md_port,
        Ipv4Addr::UNSPECIFIED,
        1,
        Duration::from_millis(250),
        max_depth,
        Duration::from_secs(30),
        ring_capacity.next_power_of_two(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_defaults() {
        let config = parse_args(&[]).unwrap();
        assert_eq!(config.tcp_port, 9001);
        assert_eq!(config.md_port, 9900);
        assert!(!config.cancel_on_disconnect);
    }

    #[test]
    fn parse_args_human_readable_ring_capacity() {
        let args: Vec<String> = vec!["--ring-capacity".into(), "8k".into()];
        let config = parse_args(&args).unwrap();
        assert_eq!(config.ring_capacity, 8192);
    }
}
