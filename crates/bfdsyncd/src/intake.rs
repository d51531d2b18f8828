//! Event intake loop.
//!
//! A single task owns the [`BfdOrch`] and serves, in arrival order, inbound
//! control packets and hardware timeout events. The multiplexed wait is
//! bounded by the wait interval; every wake-up also expires software
//! detection timers. Per-session failures are logged and the loop carries
//! on. Terminal failures go to the [`FailureReporter`] and end the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sonic_sai::{BfdSessionOid, RawSaiObjectId};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::IntakeSection;
use crate::error::{BfdError, Result};
use crate::health::FailureReporter;
use crate::orch::{BfdOrch, PacketDisposition};
use crate::packet::InboundPacket;
use crate::record::BfdSessionRecord;
use crate::store::SessionRead;
use crate::timer::DetectionTimers;
use crate::types::{BfdSessionAttribute, BfdSessionState};

/// Producer side of the intake channels.
#[derive(Debug, Clone)]
pub struct IntakeSender {
    packets: mpsc::Sender<InboundPacket>,
    timeouts: mpsc::Sender<RawSaiObjectId>,
}

impl IntakeSender {
    /// Queues a packet; waits while the channel is full.
    pub async fn send_packet(&self, packet: InboundPacket) -> Result<()> {
        self.packets
            .send(packet)
            .await
            .map_err(|_| BfdError::ChannelClosed("packets"))
    }

    /// Queues a hardware timeout event carrying the session's correlation
    /// value, i.e. the raw session handle.
    pub async fn send_timeout(&self, correlation: RawSaiObjectId) -> Result<()> {
        self.timeouts
            .send(correlation)
            .await
            .map_err(|_| BfdError::ChannelClosed("timeouts"))
    }

    /// Queues a packet without waiting. Returns false if it was dropped.
    pub fn try_send_packet(&self, packet: InboundPacket) -> bool {
        self.packets.try_send(packet).is_ok()
    }
}

/// Intake loop state.
pub struct EventIntake {
    orch: BfdOrch,
    packets: mpsc::Receiver<InboundPacket>,
    timeouts: mpsc::Receiver<RawSaiObjectId>,
    shutdown: watch::Receiver<bool>,
    reporter: Arc<FailureReporter>,
    timers: DetectionTimers,
    wait_interval: Duration,
    software_detection: bool,
}

impl EventIntake {
    pub fn new(
        orch: BfdOrch,
        config: &IntakeSection,
        reporter: Arc<FailureReporter>,
    ) -> (Self, IntakeSender) {
        let depth = config.channel_depth.max(1);
        let (packets_tx, packets) = mpsc::channel(depth);
        let (timeouts_tx, timeouts) = mpsc::channel(depth);
        let intake = Self {
            orch,
            packets,
            timeouts,
            shutdown: reporter.subscribe(),
            reporter,
            timers: DetectionTimers::new(),
            wait_interval: Duration::from_millis(config.wait_interval_ms.max(1)),
            software_detection: config.software_detection,
        };
        let sender = IntakeSender {
            packets: packets_tx,
            timeouts: timeouts_tx,
        };
        (intake, sender)
    }

    pub fn orch(&self) -> &BfdOrch {
        &self.orch
    }

    pub fn orch_mut(&mut self) -> &mut BfdOrch {
        &mut self.orch
    }

    pub fn timers(&self) -> &DetectionTimers {
        &self.timers
    }

    /// Arms timers for every live session that has negotiated a detection
    /// time, e.g. after a warm attach.
    pub fn arm_existing(&mut self, now: Instant) -> Result<usize> {
        if !self.software_detection {
            return Ok(0);
        }
        let sessions = self.orch.store().read()?.all()?;
        let mut armed = 0;
        for (oid, record) in sessions {
            if !matches!(record.state, BfdSessionState::Init | BfdSessionState::Up) {
                continue;
            }
            if let Some(detection) = record.detection_time() {
                self.timers.arm(oid, now, detection);
                armed += 1;
            }
        }
        Ok(armed)
    }

    /// Arms `oid` while it is Init or Up with a detection time, else disarms it.
    fn retime(
        &mut self,
        oid: BfdSessionOid,
        state: BfdSessionState,
        detection_time: Option<Duration>,
        now: Instant,
    ) {
        match (state, detection_time) {
            (BfdSessionState::Init | BfdSessionState::Up, Some(detection))
                if self.software_detection =>
            {
                self.timers.arm(oid, now, detection);
            }
            _ => {
                self.timers.disarm(oid);
            }
        }
    }

    /// Runs one packet through the orchestrator and updates its timer.
    pub fn on_packet(&mut self, inbound: &InboundPacket, now: Instant) -> Result<()> {
        match self.orch.handle_packet(inbound)? {
            PacketDisposition::Applied {
                oid,
                state,
                detection_time,
                ..
            } => self.retime(oid, state, detection_time, now),
            PacketDisposition::Discarded { .. } | PacketDisposition::Unmatched => {}
        }
        Ok(())
    }

    /// Closes a session and drops its detection timer.
    pub fn remove_session(&mut self, oid: BfdSessionOid) -> Result<BfdSessionRecord> {
        self.timers.disarm(oid);
        self.orch.remove_session(oid)
    }

    /// Operator edit; an admin-down session stops being timed.
    pub fn set_attribute(
        &mut self,
        oid: BfdSessionOid,
        attr: BfdSessionAttribute,
        now: Instant,
    ) -> Result<BfdSessionRecord> {
        let record = self.orch.set_attribute(oid, attr)?;
        self.retime(oid, record.state, record.detection_time(), now);
        Ok(record)
    }

    pub fn on_timeout(&mut self, oid: BfdSessionOid) -> Result<()> {
        self.timers.disarm(oid);
        if let Some(previous) = self.orch.handle_timeout(oid)? {
            debug!(session = %oid, from = %previous, "session timed out");
        }
        Ok(())
    }

    /// Fires every software timer due at `now`.
    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        for oid in self.timers.expired(now) {
            let result = self.orch.handle_timeout(oid).map(|_| ());
            self.route(result, "detection_timer")?;
        }
        Ok(())
    }

    /// Keeps per-session errors local; hands terminal ones back.
    fn route(&self, result: Result<()>, event: &str) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_terminal() => Err(e),
            Err(e) if e.is_not_found() => {
                // Session removed while its event was queued
                debug!(event, error = %e, "event for stale session ignored");
                Ok(())
            }
            Err(e) => {
                warn!(event, error = %e, "event failed");
                Ok(())
            }
        }
    }

    /// Serves events until shutdown. Returns the orchestrator so the caller
    /// can detach the store.
    pub async fn run(mut self) -> Result<BfdOrch> {
        let mut tick = tokio::time::interval(self.wait_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            wait_interval_ms = self.wait_interval.as_millis() as u64,
            software_detection = self.software_detection,
            "event intake started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                Some(inbound) = self.packets.recv() => {
                    let result = self.on_packet(&inbound, Instant::now());
                    self.route(result, "packet")
                }
                Some(correlation) = self.timeouts.recv() => {
                    let oid = BfdSessionOid::from_raw_unchecked(correlation);
                    let result = self.on_timeout(oid);
                    self.route(result, "hardware_timeout")
                }
                _ = tick.tick() => self.on_tick(Instant::now()),
            };

            if let Err(e) = result {
                self.reporter.report("event_intake", e.to_string());
                return Err(e);
            }
        }

        info!(stats = ?self.orch.stats(), "event intake stopped");
        Ok(self.orch)
    }
}
