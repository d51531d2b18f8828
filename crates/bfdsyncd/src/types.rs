//! BFD types and data structures.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use sonic_sai::{BfdSessionOid, SaiBfdSessionState};

use crate::error::{BfdError, Result};

/// Default desired minimum TX interval in microseconds.
pub const BFD_SESSION_DEFAULT_MIN_TX_US: u32 = 1_000_000;

/// Default required minimum RX interval in microseconds.
pub const BFD_SESSION_DEFAULT_MIN_RX_US: u32 = 1_000_000;

/// Default BFD detect multiplier.
pub const BFD_SESSION_DEFAULT_DETECT_MULTIPLIER: u8 = 3;

/// Default BFD Type of Service value.
pub const BFD_SESSION_DEFAULT_TOS: u8 = 192;

/// UDP destination port for single-hop control packets (RFC 5881).
pub const BFD_SINGLE_HOP_PORT: u16 = 3784;

/// UDP destination port for multihop control packets (RFC 5883).
pub const BFD_MULTIHOP_PORT: u16 = 4784;

/// TTL / hop limit a single-hop packet must arrive with.
pub const BFD_SINGLE_HOP_TTL: u8 = 255;

/// BFD session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BfdSessionState {
    /// Administratively disabled.
    AdminDown,
    /// Not yet established.
    #[default]
    Down,
    /// Initializing.
    Init,
    /// Session operational.
    Up,
}

impl BfdSessionState {
    /// Returns the 2-bit value carried in control packets.
    pub fn wire_value(&self) -> u8 {
        match self {
            Self::AdminDown => 0,
            Self::Down => 1,
            Self::Init => 2,
            Self::Up => 3,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AdminDown),
            1 => Some(Self::Down),
            2 => Some(Self::Init),
            3 => Some(Self::Up),
            _ => None,
        }
    }

    /// Returns the SAI value for this state.
    pub fn to_sai(&self) -> SaiBfdSessionState {
        match self {
            Self::AdminDown => SaiBfdSessionState::AdminDown,
            Self::Down => SaiBfdSessionState::Down,
            Self::Init => SaiBfdSessionState::Init,
            Self::Up => SaiBfdSessionState::Up,
        }
    }

    pub fn from_sai(state: SaiBfdSessionState) -> Self {
        match state {
            SaiBfdSessionState::AdminDown => Self::AdminDown,
            SaiBfdSessionState::Down => Self::Down,
            SaiBfdSessionState::Init => Self::Init,
            SaiBfdSessionState::Up => Self::Up,
        }
    }

    /// Returns the state DB string representation.
    pub fn state_db_string(&self) -> &'static str {
        match self {
            Self::AdminDown => "Admin_Down",
            Self::Down => "Down",
            Self::Init => "Init",
            Self::Up => "Up",
        }
    }
}

impl FromStr for BfdSessionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin_down" | "admindown" => Ok(Self::AdminDown),
            "down" => Ok(Self::Down),
            "init" => Ok(Self::Init),
            "up" => Ok(Self::Up),
            _ => Err(format!("Unknown BFD session state: {}", s)),
        }
    }
}

impl fmt::Display for BfdSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state_db_string())
    }
}

/// BFD session update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfdUpdate {
    /// External session handle.
    pub session: BfdSessionOid,
    pub local_discriminator: u32,
    pub peer: IpAddr,
    /// Newly observed state. `AdminDown` reports a peer or operator shutdown.
    pub state: BfdSessionState,
}

/// BFD session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfdSessionConfig {
    /// Caller-assigned local discriminator, non-zero and unique.
    pub local_discriminator: u32,
    pub peer_addr: IpAddr,
    pub src_addr: Option<IpAddr>,
    pub multihop: bool,
    /// Desired minimum TX interval in microseconds.
    pub min_tx_us: u32,
    /// Required minimum RX interval in microseconds.
    pub min_rx_us: u32,
    /// Detect multiplier.
    pub multiplier: u8,
    /// Type of Service.
    pub tos: u8,
}

impl BfdSessionConfig {
    /// Creates a new session config with default values.
    pub fn new(local_discriminator: u32, peer_addr: IpAddr) -> Self {
        Self {
            local_discriminator,
            peer_addr,
            src_addr: None,
            multihop: false,
            min_tx_us: BFD_SESSION_DEFAULT_MIN_TX_US,
            min_rx_us: BFD_SESSION_DEFAULT_MIN_RX_US,
            multiplier: BFD_SESSION_DEFAULT_DETECT_MULTIPLIER,
            tos: BFD_SESSION_DEFAULT_TOS,
        }
    }

    pub fn with_src_addr(mut self, addr: IpAddr) -> Self {
        self.src_addr = Some(addr);
        self
    }

    pub fn with_multihop(mut self, multihop: bool) -> Self {
        self.multihop = multihop;
        self
    }

    /// Sets the TX interval in microseconds.
    pub fn with_min_tx(mut self, us: u32) -> Self {
        self.min_tx_us = us;
        self
    }

    /// Sets the RX interval in microseconds.
    pub fn with_min_rx(mut self, us: u32) -> Self {
        self.min_rx_us = us;
        self
    }

    pub fn with_multiplier(mut self, multiplier: u8) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_discriminator == 0 {
            return Err(BfdError::InvalidConfig(
                "local discriminator must be non-zero".to_string(),
            ));
        }
        if self.multiplier == 0 {
            return Err(BfdError::InvalidConfig(format!(
                "session {}: multiplier must be non-zero",
                self.local_discriminator
            )));
        }
        if self.min_tx_us == 0 {
            return Err(BfdError::InvalidConfig(format!(
                "session {}: min_tx must be non-zero",
                self.local_discriminator
            )));
        }
        if let Some(src) = self.src_addr {
            if src.is_ipv4() != self.peer_addr.is_ipv4() {
                return Err(BfdError::InvalidConfig(format!(
                    "session {}: source {} and peer {} differ in address family",
                    self.local_discriminator, src, self.peer_addr
                )));
            }
        }
        Ok(())
    }
}

/// Explicit edit of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BfdSessionAttribute {
    /// Desired minimum TX interval in microseconds.
    LocalMinTx(u32),
    /// Required minimum RX interval in microseconds.
    LocalMinRx(u32),
    Multiplier(u8),
    Tos(u8),
    /// `true` shuts the session down administratively.
    AdminDown(bool),
}

impl BfdSessionAttribute {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::LocalMinTx(0) => Err(BfdError::InvalidConfig(
                "min_tx must be non-zero".to_string(),
            )),
            Self::Multiplier(0) => Err(BfdError::InvalidConfig(
                "multiplier must be non-zero".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Parses a field-value pair as written in config tables.
    pub fn parse_field(field: &str, value: &str) -> Result<Self> {
        let invalid = || BfdError::InvalidConfig(format!("Invalid {}: {}", field, value));
        let attr = match field {
            "tx_interval" => Self::LocalMinTx(value.parse().map_err(|_| invalid())?),
            "rx_interval" => Self::LocalMinRx(value.parse().map_err(|_| invalid())?),
            "multiplier" => Self::Multiplier(value.parse().map_err(|_| invalid())?),
            "tos" => Self::Tos(value.parse().map_err(|_| invalid())?),
            "admin_status" => match value {
                "down" => Self::AdminDown(true),
                "up" => Self::AdminDown(false),
                _ => return Err(invalid()),
            },
            _ => {
                return Err(BfdError::InvalidConfig(format!(
                    "Unknown BFD session field: {}",
                    field
                )))
            }
        };
        attr.validate()?;
        Ok(attr)
    }
}
