//! Link, dialer, and listener configuration. Parses TOML into strongly-typed
//! structures; all durations are plain millisecond integers. Defaults define
//! the protocol baseline.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{Error, Result};

/// Binding string identifying this transport in router configuration.
pub const BINDING: &str = "transport";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Maximum unacknowledged data frames in flight per direction.
    pub window_capacity: usize,

    /// Delay before an unacknowledged frame is re-emitted, and between
    /// subsequent re-emissions.
    pub retransmit_delay_ms: u64,

    /// Socket read deadline. Expiry is not an error; it bounds how long a
    /// task can go without observing shutdown.
    pub read_timeout_ms: u64,

    /// Socket write deadline.
    pub write_timeout_ms: u64,

    /// Minimum spacing between ping requests.
    pub ping_interval_ms: u64,

    /// How often the pinger wakes to evaluate the interval and link health.
    pub ping_cycle_ms: u64,

    /// Declare the link unhealthy once the last echo lags the last request
    /// by more than this.
    pub unhealthy_after_ms: u64,

    /// Hello attempts before a dial fails.
    pub hello_attempts: u32,

    /// Depth of the outbound frame queue feeding the socket writer.
    pub outbound_queue_depth: usize,

    /// Depth of the trace record channel; records beyond it are dropped and
    /// counted as overruns.
    pub trace_queue_depth: usize,

    /// Emit per-link trace files.
    pub trace_enabled: bool,

    /// Directory for trace files; the working directory when unset.
    pub trace_dir: Option<PathBuf>,

    /// Optional bound on how long `send_*` may wait for window capacity.
    /// Unset means block until capacity or close.
    pub send_timeout_ms: Option<u64>,

    /// Datagram ceiling; frames above it are rejected at encode time.
    pub mtu: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            window_capacity: 32,
            retransmit_delay_ms: 20,
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            ping_interval_ms: 5_000,
            ping_cycle_ms: 500,
            unhealthy_after_ms: 15_000,
            hello_attempts: 3,
            outbound_queue_depth: 64,
            trace_queue_depth: 1_024,
            trace_enabled: true,
            trace_dir: None,
            send_timeout_ms: None,
            mtu: transwarp_wire::DEFAULT_MTU,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_capacity == 0 {
            return Err(Error::config("window_capacity must be at least 1"));
        }
        if self.mtu < transwarp_wire::frame::MESSAGE_SECTION_LEN + 1 {
            return Err(Error::config(format!("mtu too small [{}]", self.mtu)));
        }
        if self.ping_cycle_ms == 0 || self.ping_cycle_ms > self.ping_interval_ms {
            return Err(Error::config("ping_cycle_ms must be within ping_interval_ms"));
        }
        if self.outbound_queue_depth == 0 {
            return Err(Error::config("outbound_queue_depth must be at least 1"));
        }
        Ok(())
    }

    pub fn retransmit_delay(&self) -> Duration {
        Duration::from_millis(self.retransmit_delay_ms)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
    pub fn ping_cycle(&self) -> Duration {
        Duration::from_millis(self.ping_cycle_ms)
    }
    pub fn unhealthy_after(&self) -> Duration {
        Duration::from_millis(self.unhealthy_after_ms)
    }
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }
}

/// Listener-side configuration: where to accept, what to advertise.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_binding")]
    pub binding: String,
    pub bind_address: SocketAddr,
    /// Address peers should dial; surfaced to the control plane, unused by
    /// the transport itself.
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default)]
    pub link: LinkConfig,
}

impl ListenerConfig {
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            binding: BINDING.to_string(),
            bind_address,
            advertise_address: None,
            link: LinkConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_binding(&self.binding)?;
        self.link.validate()
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

/// Dialer-side configuration: local socket plus link tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DialerConfig {
    #[serde(default = "default_binding")]
    pub binding: String,
    #[serde(default = "default_dial_bind")]
    pub bind_address: SocketAddr,
    #[serde(default)]
    pub link: LinkConfig,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            binding: BINDING.to_string(),
            bind_address: default_dial_bind(),
            link: LinkConfig::default(),
        }
    }
}

impl DialerConfig {
    pub fn validate(&self) -> Result<()> {
        validate_binding(&self.binding)?;
        self.link.validate()
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_binding() -> String {
    BINDING.to_string()
}

fn default_dial_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn validate_binding(binding: &str) -> Result<()> {
    if binding != BINDING {
        return Err(Error::config(format!("unknown binding [{binding}]")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_the_baseline() {
        let config = LinkConfig::default();
        assert_eq!(config.window_capacity, 32);
        assert_eq!(config.retransmit_delay_ms, 20);
        assert_eq!(config.ping_interval_ms, 5_000);
        assert_eq!(config.ping_cycle_ms, 500);
        assert_eq!(config.read_timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn listener_config_parses_from_toml() {
        let config: ListenerConfig = toml::from_str(
            r#"
            binding = "transport"
            bind_address = "127.0.0.1:6001"
            advertise_address = "router-a:6001"

            [link]
            window_capacity = 4
            retransmit_delay_ms = 50
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.link.window_capacity, 4);
        assert_eq!(config.link.retransmit_delay_ms, 50);
        assert_eq!(config.link.ping_interval_ms, 5_000);
    }

    #[test]
    fn unknown_binding_rejected() {
        let config: ListenerConfig = toml::from_str(
            r#"
            binding = "tls"
            bind_address = "127.0.0.1:6001"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_window_rejected() {
        let config = LinkConfig {
            window_capacity: 0,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
