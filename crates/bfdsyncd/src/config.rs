//! Configuration file support for bfdsyncd
//!
//! Loads and validates bfdsyncd configuration from TOML files.
//! Default location: /etc/sonic/bfdsyncd.toml

use crate::error::{BfdError, Result};
use crate::types::{
    BfdSessionConfig, BFD_SESSION_DEFAULT_DETECT_MULTIPLIER, BFD_SESSION_DEFAULT_MIN_RX_US,
    BFD_SESSION_DEFAULT_MIN_TX_US, BFD_SESSION_DEFAULT_TOS,
};
use serde::{Deserialize, Serialize};
use sonic_shm_arena::{SegmentConfig, DEFAULT_SEGMENT_PATH};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/bfdsyncd.toml";

/// Shared segment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSection {
    /// Backing file of the shared session segment
    #[serde(default = "default_segment_path")]
    pub path: PathBuf,

    /// Number of BFD session slots
    #[serde(default = "default_bfd_session_capacity")]
    pub bfd_session_capacity: u32,

    /// Reattach to an existing segment instead of reinitialising it
    #[serde(default = "default_warm_restart")]
    pub warm_restart: bool,
}

/// Event intake configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeSection {
    /// Upper bound of one multiplexed wait in milliseconds
    #[serde(default = "default_wait_interval")]
    pub wait_interval_ms: u64,

    /// Depth of the packet and timeout channels
    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,

    /// Run detection timers in software in addition to hardware timeouts
    #[serde(default = "default_software_detection")]
    pub software_detection: bool,
}

/// Health poller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// UDP control packet listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerSection {
    #[serde(default = "default_listener_enabled")]
    pub enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
}

/// One statically configured session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub local_discriminator: u32,
    pub peer: IpAddr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<IpAddr>,

    #[serde(default)]
    pub multihop: bool,

    /// Desired minimum TX interval in microseconds
    #[serde(default = "default_tx_interval")]
    pub tx_interval_us: u32,

    /// Required minimum RX interval in microseconds
    #[serde(default = "default_rx_interval")]
    pub rx_interval_us: u32,

    #[serde(default = "default_multiplier")]
    pub multiplier: u8,

    #[serde(default = "default_tos")]
    pub tos: u8,
}

impl SessionEntry {
    pub fn to_session_config(&self) -> BfdSessionConfig {
        let mut config = BfdSessionConfig::new(self.local_discriminator, self.peer)
            .with_multihop(self.multihop)
            .with_min_tx(self.tx_interval_us)
            .with_min_rx(self.rx_interval_us)
            .with_multiplier(self.multiplier)
            .with_tos(self.tos);
        if let Some(src) = self.src {
            config = config.with_src_addr(src);
        }
        config
    }
}

/// Complete bfdsyncd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BfdsyncConfig {
    #[serde(default)]
    pub segment: SegmentSection,

    #[serde(default)]
    pub intake: IntakeSection,

    #[serde(default)]
    pub health: HealthSection,

    #[serde(default)]
    pub listener: ListenerSection,

    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

// Default functions
fn default_segment_path() -> PathBuf {
    PathBuf::from(DEFAULT_SEGMENT_PATH)
}

fn default_bfd_session_capacity() -> u32 {
    1024
}

fn default_warm_restart() -> bool {
    true
}

fn default_wait_interval() -> u64 {
    100
}

fn default_channel_depth() -> usize {
    1024
}

fn default_software_detection() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    5
}

fn default_listener_enabled() -> bool {
    true
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_tx_interval() -> u32 {
    BFD_SESSION_DEFAULT_MIN_TX_US
}

fn default_rx_interval() -> u32 {
    BFD_SESSION_DEFAULT_MIN_RX_US
}

fn default_multiplier() -> u8 {
    BFD_SESSION_DEFAULT_DETECT_MULTIPLIER
}

fn default_tos() -> u8 {
    BFD_SESSION_DEFAULT_TOS
}

// Default implementations
impl Default for SegmentSection {
    fn default() -> Self {
        Self {
            path: default_segment_path(),
            bfd_session_capacity: default_bfd_session_capacity(),
            warm_restart: default_warm_restart(),
        }
    }
}

impl Default for IntakeSection {
    fn default() -> Self {
        Self {
            wait_interval_ms: default_wait_interval(),
            channel_depth: default_channel_depth(),
            software_detection: default_software_detection(),
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            enabled: default_listener_enabled(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl BfdsyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                BfdError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(BfdError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BfdError::Config(e.to_string()))
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BfdError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn segment_config(&self) -> SegmentConfig {
        SegmentConfig::new(self.segment.path.clone()).with_warm_restart(self.segment.warm_restart)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.intake.wait_interval_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health.poll_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.segment.bfd_session_capacity == 0 {
            return Err(BfdError::Config(
                "bfd_session_capacity must be > 0".to_string(),
            ));
        }

        if self.intake.wait_interval_ms == 0 {
            return Err(BfdError::Config("wait_interval_ms must be > 0".to_string()));
        }

        if self.intake.channel_depth == 0 {
            return Err(BfdError::Config("channel_depth must be > 0".to_string()));
        }

        if self.health.poll_interval_secs == 0 {
            return Err(BfdError::Config(
                "poll_interval_secs must be > 0".to_string(),
            ));
        }

        if self.sessions.len() > self.segment.bfd_session_capacity as usize {
            return Err(BfdError::Config(format!(
                "{} sessions configured but capacity is {}",
                self.sessions.len(),
                self.segment.bfd_session_capacity
            )));
        }

        let mut seen = HashSet::new();
        for entry in &self.sessions {
            if !seen.insert(entry.local_discriminator) {
                return Err(BfdError::Config(format!(
                    "duplicate local_discriminator {}",
                    entry.local_discriminator
                )));
            }
            entry
                .to_session_config()
                .validate()
                .map_err(|e| BfdError::Config(e.to_string()))?;
        }

        Ok(())
    }
}
