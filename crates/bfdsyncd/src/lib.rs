//! BFD Session Daemon
//!
//! Keeps BFD session records in a shared memory segment, runs the RFC 5880
//! liveness state machine over received control packets and detection
//! timeouts, and programs the results into the hardware offload adapter.
//! Records survive a process restart; after a warm attach the adapter is
//! reconciled with the segment.
//!
//! # Architecture
//!
//! - [`store`]: session records in the shared arena, addressed by handle
//! - [`fsm`]: pure transition table; computes a new record and effects
//! - [`orch`]: applies steps to the store, the adapter and the notifier
//! - [`intake`]: single-task event loop over packets, timeouts and timers
//! - [`listener`]: UDP receive side for single-hop and multi-hop sessions
//! - [`health`]: out-of-band segment probe and terminal failure reporting

pub mod audit;
pub mod config;
pub mod error;
pub mod fsm;
pub mod health;
pub mod intake;
pub mod listener;
pub mod orch;
pub mod packet;
pub mod record;
pub mod store;
pub mod timer;
pub mod types;

pub use audit::{init_logging, init_logging_pretty, AuditCategory, AuditOutcome, AuditRecord};
pub use config::{BfdsyncConfig, SessionEntry, DEFAULT_CONFIG_PATH};
pub use error::{BfdError, Result};
pub use fsm::{DiscardReason, Effect, Step, Verdict};
pub use health::{FailureReporter, HealthHandle, HealthPoller, HealthProbe, HealthStatus, SegmentFileProbe};
pub use intake::{EventIntake, IntakeSender};
pub use listener::{ListenerStats, PacketListener};
pub use orch::{
    BfdNotifier, BfdOrch, BfdOrchStats, PacketDisposition, ReconcileReport, TracingNotifier,
};
pub use packet::{ControlPacket, InboundPacket, PacketError};
pub use record::BfdSessionRecord;
pub use store::{session_layout, SessionPage, SessionRead, SessionStore};
pub use timer::DetectionTimers;
pub use types::*;
