//! BfdOrch: executes liveness steps against the session store, the offload
//! adapter and the notification surface.
//!
//! Every public operation holds the store's exclusive lock for its whole
//! duration. A step is executed as: write the record, then run its effects
//! in order. An adapter failure stops the remaining effects and is returned
//! to the caller; the written record is not rolled back. The next packet or
//! timeout for the session brings hardware back in line.

use std::sync::Arc;

use sonic_sai::api::BfdOffloadApi;
use sonic_sai::{BfdRxSessionOid, BfdSessionOid, BfdTxSessionOid, SaiError, SaiResult};
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::error::{BfdError, Result};
use crate::fsm::{self, DiscardReason, Effect, Step, Verdict};
use crate::packet::InboundPacket;
use crate::record::BfdSessionRecord;
use crate::store::{SessionPage, SessionRead, SessionStore, StoreWriter};
use crate::types::{BfdSessionAttribute, BfdSessionConfig, BfdSessionState, BfdUpdate};
use crate::{audit_log, security_audit};

/// Receives session state changes.
pub trait BfdNotifier: Send + Sync {
    fn notify(&self, update: BfdUpdate);
}

/// Notifier that logs and audits every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl BfdNotifier for TracingNotifier {
    fn notify(&self, update: BfdUpdate) {
        info!(
            session = %update.session,
            local = update.local_discriminator,
            peer = %update.peer,
            state = %update.state,
            "BFD session {}",
            update.state.state_db_string()
        );

        let category = if update.state == BfdSessionState::AdminDown {
            AuditCategory::AdminAction
        } else {
            AuditCategory::ResourceModify
        };
        audit_log!(AuditRecord::new(category, "BfdOrch", "session_state_change")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(update.session.to_string())
            .with_object_type("bfd_session")
            .with_details(serde_json::json!({
                "local_discriminator": update.local_discriminator,
                "peer": update.peer.to_string(),
                "state": update.state.state_db_string(),
            })));
    }
}

/// BFD orchestrator statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BfdOrchStats {
    pub sessions_created: u64,
    pub sessions_removed: u64,
    /// Packets that reached the state machine.
    pub packets_accepted: u64,
    /// Packets a session refused during admission.
    pub packets_discarded: u64,
    /// Packets no session claimed.
    pub packets_unmatched: u64,
    pub timeouts: u64,
    pub state_changes: u64,
    pub adapter_failures: u64,
    /// Corrupted slots discovered by any operation.
    pub corruption_events: u64,
}

/// What became of one inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketDisposition {
    Applied {
        oid: BfdSessionOid,
        previous: BfdSessionState,
        state: BfdSessionState,
        /// Detection time after the step, used to re-arm the session's timer.
        detection_time: Option<std::time::Duration>,
    },
    Discarded {
        oid: BfdSessionOid,
        reason: DiscardReason,
    },
    Unmatched,
}

/// Outcome of [`BfdOrch::reconcile_after_attach`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions found in the segment.
    pub sessions: usize,
    /// Sessions whose hardware objects were edited in place.
    pub reprogrammed: usize,
    /// Sessions with at least one hardware object created anew.
    pub recreated: usize,
    /// Sessions the adapter refused.
    pub failed: Vec<BfdSessionOid>,
    /// Slots whose header failed validation.
    pub corrupted: Vec<BfdSessionOid>,
}

/// BFD orchestrator.
pub struct BfdOrch {
    store: SessionStore,
    offload: Arc<dyn BfdOffloadApi>,
    notifier: Arc<dyn BfdNotifier>,
    stats: BfdOrchStats,
}

impl std::fmt::Debug for BfdOrch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BfdOrch")
            .field("store", &self.store)
            .field("stats", &self.stats)
            .finish()
    }
}

impl BfdOrch {
    pub fn new(
        store: SessionStore,
        offload: Arc<dyn BfdOffloadApi>,
        notifier: Arc<dyn BfdNotifier>,
    ) -> Self {
        Self {
            store,
            offload,
            notifier,
            stats: BfdOrchStats::default(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn stats(&self) -> &BfdOrchStats {
        &self.stats
    }

    /// Hands the store back, e.g. to detach it on shutdown.
    pub fn into_store(self) -> SessionStore {
        self.store
    }

    /// Allocates a session and announces it Down in hardware.
    ///
    /// The slot is released again if the transmit session cannot be created.
    pub fn create_session(&mut self, config: &BfdSessionConfig) -> Result<BfdSessionOid> {
        let result = self.create_session_inner(config);
        match &result {
            Ok(oid) => {
                self.stats.sessions_created += 1;
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "BfdOrch",
                    "create_session"
                )
                .with_outcome(AuditOutcome::Success)
                .with_object_id(oid.to_string())
                .with_object_type("bfd_session")
                .with_details(serde_json::json!({
                    "local_discriminator": config.local_discriminator,
                    "peer": config.peer_addr.to_string(),
                    "multihop": config.multihop,
                    "tx_interval_us": config.min_tx_us,
                    "rx_interval_us": config.min_rx_us,
                    "multiplier": config.multiplier,
                })));
            }
            Err(e) => {
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "BfdOrch",
                    "create_session"
                )
                .with_object_id(config.local_discriminator.to_string())
                .with_object_type("bfd_session")
                .with_error(e.to_string()));
            }
        }
        self.observe("create_session", result)
    }

    fn create_session_inner(&mut self, config: &BfdSessionConfig) -> Result<BfdSessionOid> {
        config.validate()?;
        let mut w = self.store.write()?;
        let mut record = BfdSessionRecord::new(config);
        let oid = w.insert(&record)?;

        match self.offload.create_or_edit_tx(&record.offload_view()) {
            Ok(tx) => {
                record.tx_session = tx;
                w.update(oid, &record)?;
                debug!(session = %oid, tx = %tx, "created bfd session");
                Ok(oid)
            }
            Err(e) => {
                w.remove(oid)?;
                Err(e.into())
            }
        }
    }

    /// Removes the hardware objects, then frees the slot.
    ///
    /// If the adapter refuses, the slot is kept so the removal can be retried.
    pub fn remove_session(&mut self, oid: BfdSessionOid) -> Result<BfdSessionRecord> {
        let result = self.remove_session_inner(oid);
        match &result {
            Ok(record) => {
                self.stats.sessions_removed += 1;
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceDelete,
                    "BfdOrch",
                    "remove_session"
                )
                .with_outcome(AuditOutcome::Success)
                .with_object_id(oid.to_string())
                .with_object_type("bfd_session")
                .with_details(serde_json::json!({
                    "local_discriminator": record.local_discriminator,
                    "peer": record.peer_addr.to_string(),
                    "last_state": record.state.state_db_string(),
                })));
            }
            Err(e) => {
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceDelete,
                    "BfdOrch",
                    "remove_session"
                )
                .with_object_id(oid.to_string())
                .with_object_type("bfd_session")
                .with_error(e.to_string()));
            }
        }
        self.observe("remove_session", result)
    }

    fn remove_session_inner(&mut self, oid: BfdSessionOid) -> Result<BfdSessionRecord> {
        let mut w = self.store.write()?;
        let record = w.get(oid)?;

        if record.tx_session.is_valid() || record.rx_session.is_valid() {
            match self
                .offload
                .remove_session(record.tx_session, record.rx_session)
            {
                Ok(()) => {}
                Err(SaiError::NotFound { item }) => {
                    // Already gone in hardware, e.g. after an adapter restart
                    warn!(session = %oid, item = %item, "offload objects already removed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        w.remove(oid)
    }

    pub fn get_session(&self, oid: BfdSessionOid) -> Result<BfdSessionRecord> {
        self.store.read()?.get(oid)
    }

    /// One page of live sessions; see [`SessionRead::list`].
    pub fn list_sessions(&self, resume_from: u32, limit: usize) -> Result<SessionPage> {
        self.store.read()?.list(resume_from, limit)
    }

    /// Live sessions. Corrupted slots are neither live nor free.
    pub fn session_count(&self) -> Result<u32> {
        self.store.read()?.live_count()
    }

    /// Applies an operator edit. Returns the record as stored afterwards.
    pub fn set_attribute(
        &mut self,
        oid: BfdSessionOid,
        attr: BfdSessionAttribute,
    ) -> Result<BfdSessionRecord> {
        let result = self.set_attribute_inner(oid, attr);
        if let BfdSessionAttribute::AdminDown(down) = attr {
            let record = AuditRecord::new(AuditCategory::AdminAction, "BfdOrch", "set_admin_state")
                .with_object_id(oid.to_string())
                .with_object_type("bfd_session")
                .with_details(serde_json::json!({ "admin_down": down }));
            match &result {
                Ok(_) => {
                    audit_log!(record.with_outcome(AuditOutcome::Success));
                }
                Err(e) => {
                    audit_log!(record.with_error(e.to_string()));
                }
            }
        }
        self.observe("set_attribute", result)
    }

    fn set_attribute_inner(
        &mut self,
        oid: BfdSessionOid,
        attr: BfdSessionAttribute,
    ) -> Result<BfdSessionRecord> {
        attr.validate()?;
        let mut w = self.store.write()?;
        let record = w.get(oid)?;
        match fsm::on_attribute(&record, &attr) {
            Some(step) => execute(
                &mut w,
                self.offload.as_ref(),
                self.notifier.as_ref(),
                &mut self.stats,
                oid,
                step,
            ),
            None => Ok(record),
        }
    }

    /// Demultiplexes an inbound packet and runs its session's step.
    ///
    /// Sessions are found by Your Discriminator when the peer knows it,
    /// otherwise by the packet's source address.
    pub fn handle_packet(&mut self, inbound: &InboundPacket) -> Result<PacketDisposition> {
        let result = self.handle_packet_inner(inbound);
        self.observe("handle_packet", result)
    }

    fn handle_packet_inner(&mut self, inbound: &InboundPacket) -> Result<PacketDisposition> {
        let mut w = self.store.write()?;
        let pkt = &inbound.packet;
        let found = if pkt.your_discriminator != 0 {
            w.find_by_local_discriminator(pkt.your_discriminator)?
        } else {
            w.find_by_peer(inbound.source, inbound.multihop)?
        };

        let Some((oid, record)) = found else {
            self.stats.packets_unmatched += 1;
            debug!(
                source = %inbound.source,
                my = pkt.my_discriminator,
                your = pkt.your_discriminator,
                "no session for packet"
            );
            return Ok(PacketDisposition::Unmatched);
        };

        match fsm::on_packet(&record, inbound) {
            Verdict::Discard(reason) => {
                self.stats.packets_discarded += 1;
                debug!(session = %oid, source = %inbound.source, %reason, "packet discarded");
                Ok(PacketDisposition::Discarded { oid, reason })
            }
            Verdict::Apply(step) => {
                self.stats.packets_accepted += 1;
                let previous = step.previous;
                let record = execute(
                    &mut w,
                    self.offload.as_ref(),
                    self.notifier.as_ref(),
                    &mut self.stats,
                    oid,
                    step,
                )?;
                Ok(PacketDisposition::Applied {
                    oid,
                    previous,
                    state: record.state,
                    detection_time: record.detection_time(),
                })
            }
        }
    }

    /// Detection timer expiry for `oid`.
    ///
    /// Returns the state the session left, or `None` when it was already
    /// Down.
    pub fn handle_timeout(&mut self, oid: BfdSessionOid) -> Result<Option<BfdSessionState>> {
        let result = self.handle_timeout_inner(oid);
        self.observe("handle_timeout", result)
    }

    fn handle_timeout_inner(&mut self, oid: BfdSessionOid) -> Result<Option<BfdSessionState>> {
        let mut w = self.store.write()?;
        let record = w.get(oid)?;
        let Some(step) = fsm::on_timeout(&record) else {
            return Ok(None);
        };

        self.stats.timeouts += 1;
        let previous = step.previous;
        info!(
            session = %oid,
            local = record.local_discriminator,
            remote = record.remote_discriminator,
            "detection time expired in {}",
            previous
        );
        execute(
            &mut w,
            self.offload.as_ref(),
            self.notifier.as_ref(),
            &mut self.stats,
            oid,
            step,
        )?;
        Ok(Some(previous))
    }

    /// Brings hardware in line with the segment after a warm attach.
    ///
    /// Outstanding poll/final flags are dropped, every session's transmit
    /// object is edited (or created when its handle is unknown to the
    /// adapter), and receive objects are refreshed for sessions that had one
    /// or are Up. Corrupted slots are reported and left alone.
    pub fn reconcile_after_attach(&mut self) -> Result<ReconcileReport> {
        let result = self.reconcile_inner();
        match &result {
            Ok(report) => {
                audit_log!(AuditRecord::new(
                    AuditCategory::WarmRestart,
                    "BfdOrch",
                    "reconcile_after_attach"
                )
                .with_outcome(if report.failed.is_empty() {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Failure
                })
                .with_correlation_id(format!("generation-{}", self.store.segment().generation()))
                .with_details(serde_json::json!({
                    "sessions": report.sessions,
                    "reprogrammed": report.reprogrammed,
                    "recreated": report.recreated,
                    "failed": report.failed.len(),
                    "corrupted": report.corrupted.len(),
                })));
            }
            Err(e) => {
                security_audit!(AuditRecord::new(
                    AuditCategory::WarmRestart,
                    "BfdOrch",
                    "reconcile_after_attach"
                )
                .with_error(e.to_string()));
            }
        }
        self.observe("reconcile_after_attach", result)
    }

    fn reconcile_inner(&mut self) -> Result<ReconcileReport> {
        let mut w = self.store.write()?;
        let mut report = ReconcileReport::default();

        for oid in w.corrupted()? {
            self.stats.corruption_events += 1;
            security_audit!(AuditRecord::new(
                AuditCategory::Integrity,
                "BfdOrch",
                "slot_corrupted"
            )
            .with_object_id(oid.to_string())
            .with_object_type("bfd_session")
            .with_error("slot header failed validation after attach"));
            report.corrupted.push(oid);
        }

        let sessions = w.all()?;
        report.sessions = sessions.len();
        for (oid, mut record) in sessions {
            record.poll_pending = false;
            record.final_pending = false;

            match reprogram(self.offload.as_ref(), oid, &mut record) {
                Ok(true) => report.recreated += 1,
                Ok(false) => report.reprogrammed += 1,
                Err(e) => {
                    self.stats.adapter_failures += 1;
                    warn!(session = %oid, error = %e, "could not reprogram session after attach");
                    report.failed.push(oid);
                }
            }
            w.update(oid, &record)?;
        }

        info!(
            sessions = report.sessions,
            reprogrammed = report.reprogrammed,
            recreated = report.recreated,
            failed = report.failed.len(),
            corrupted = report.corrupted.len(),
            "reconciled sessions after attach"
        );
        Ok(report)
    }

    /// Counts and reports failures common to every operation.
    fn observe<T>(&mut self, action: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_corruption() {
                self.stats.corruption_events += 1;
                security_audit!(AuditRecord::new(AuditCategory::Integrity, "BfdOrch", action)
                    .with_object_type("bfd_session")
                    .with_error(e.to_string()));
            } else if matches!(e, BfdError::AdapterFailure(_)) {
                self.stats.adapter_failures += 1;
            }
        }
        result
    }
}

/// Writes the step's record, then runs its effects in order.
///
/// Handles the adapter returns are written back even when a later effect
/// fails. Returns the record as stored.
fn execute(
    w: &mut StoreWriter<'_>,
    offload: &dyn BfdOffloadApi,
    notifier: &dyn BfdNotifier,
    stats: &mut BfdOrchStats,
    oid: BfdSessionOid,
    step: Step,
) -> Result<BfdSessionRecord> {
    let changed = step.state_changed();
    let Step {
        previous,
        mut record,
        effects,
        ..
    } = step;

    w.update(oid, &record)?;
    if changed {
        stats.state_changes += 1;
        debug!(session = %oid, from = %previous, to = %record.state, "bfd state change");
    }

    let handles = (record.tx_session, record.rx_session);
    let outcome = run_effects(offload, notifier, oid, &mut record, &effects);
    if (record.tx_session, record.rx_session) != handles {
        w.update(oid, &record)?;
    }

    match outcome {
        Ok(()) => Ok(record),
        Err(e) => {
            warn!(
                session = %oid,
                state = %record.state,
                error = %e,
                "offload call failed, remaining effects skipped"
            );
            Err(e.into())
        }
    }
}

fn run_effects(
    offload: &dyn BfdOffloadApi,
    notifier: &dyn BfdNotifier,
    oid: BfdSessionOid,
    record: &mut BfdSessionRecord,
    effects: &[Effect],
) -> SaiResult<()> {
    for effect in effects {
        match *effect {
            Effect::EditTx | Effect::CreateOrEditTx => {
                record.tx_session = offload.create_or_edit_tx(&record.offload_view())?;
            }
            Effect::AckPoll => {
                record.final_pending = true;
                let answered = offload.create_or_edit_tx(&record.offload_view());
                record.final_pending = false;
                record.tx_session = answered?;
                record.tx_session = offload.create_or_edit_tx(&record.offload_view())?;
            }
            Effect::EditRx => {
                record.rx_session =
                    offload.create_or_edit_rx(&record.offload_view(), oid.as_raw())?;
            }
            Effect::Notify(state) => notifier.notify(BfdUpdate {
                session: oid,
                local_discriminator: record.local_discriminator,
                peer: record.peer_addr,
                state,
            }),
        }
    }
    Ok(())
}

/// Re-programs one session after attach. Returns true if an object had to
/// be created because the adapter no longer knew its handle.
fn reprogram(
    offload: &dyn BfdOffloadApi,
    oid: BfdSessionOid,
    record: &mut BfdSessionRecord,
) -> SaiResult<bool> {
    let mut recreated = false;

    let tx = match offload.create_or_edit_tx(&record.offload_view()) {
        Err(SaiError::NotFound { .. }) if record.tx_session.is_valid() => {
            record.tx_session = BfdTxSessionOid::NULL;
            recreated = true;
            offload.create_or_edit_tx(&record.offload_view())?
        }
        other => other?,
    };
    record.tx_session = tx;

    if record.rx_session.is_valid() || record.state == BfdSessionState::Up {
        let rx = match offload.create_or_edit_rx(&record.offload_view(), oid.as_raw()) {
            Err(SaiError::NotFound { .. }) if record.rx_session.is_valid() => {
                record.rx_session = BfdRxSessionOid::NULL;
                recreated = true;
                offload.create_or_edit_rx(&record.offload_view(), oid.as_raw())?
            }
            other => other?,
        };
        record.rx_session = rx;
    }
    Ok(recreated)
}
