//! Safe wrapper for the SAI BFD offload API.
//!
//! The ASIC runs BFD as two independent objects per session: a transmit
//! session that generates control packets at the negotiated rate and a
//! receive session that expects them and raises a timeout event when they
//! stop. The control plane only creates or edits those objects when the
//! negotiated parameters or the advertised state change.

use std::collections::HashMap;
use std::net::IpAddr;

use log::debug;
use parking_lot::Mutex;

use crate::error::{SaiError, SaiResult};
use crate::types::{
    BfdRxSessionOid, BfdTxSessionOid, RawSaiObjectId, SaiBfdSessionState,
};

/// Everything the ASIC needs to program one BFD session.
///
/// `tx_session` / `rx_session` carry the handles of already-programmed
/// objects; a null handle asks the adapter to create the object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BfdOffloadSession {
    pub local_discriminator: u32,
    pub remote_discriminator: u32,
    /// State advertised in transmitted packets.
    pub state: SaiBfdSessionState,
    /// Local detection multiplier.
    pub multiplier: u8,
    /// Detection multiplier learned from the peer.
    pub remote_multiplier: u8,
    /// Local desired minimum TX interval in microseconds.
    pub min_tx_us: u32,
    /// Local required minimum RX interval in microseconds.
    pub min_rx_us: u32,
    pub remote_min_tx_us: u32,
    pub remote_min_rx_us: u32,
    pub remote_min_echo_rx_us: u32,
    /// Set the P bit in transmitted packets.
    pub poll: bool,
    /// Set the F bit in transmitted packets.
    pub final_flag: bool,
    pub multihop: bool,
    pub peer_addr: Option<IpAddr>,
    pub src_addr: Option<IpAddr>,
    pub tos: u8,
    pub tx_session: BfdTxSessionOid,
    pub rx_session: BfdRxSessionOid,
}

/// Create/edit contract exposed by the forwarding ASIC.
///
/// Implementations must be callable from the single event-intake thread
/// while the session store's exclusive lock is held; they are treated as
/// bounded synchronous calls.
pub trait BfdOffloadApi: Send + Sync {
    /// Creates the transmit session, or edits it when `session.tx_session`
    /// is set. Returns the (possibly new) transmit handle.
    fn create_or_edit_tx(&self, session: &BfdOffloadSession) -> SaiResult<BfdTxSessionOid>;

    /// Creates or edits the receive session. `correlation` is echoed back
    /// in asynchronous timeout events so they can be matched to the
    /// control-plane session.
    fn create_or_edit_rx(
        &self,
        session: &BfdOffloadSession,
        correlation: RawSaiObjectId,
    ) -> SaiResult<BfdRxSessionOid>;

    /// Removes whichever of the two objects exist.
    fn remove_session(&self, tx: BfdTxSessionOid, rx: BfdRxSessionOid) -> SaiResult<()>;
}

#[derive(Debug, Default)]
struct SoftwareTables {
    next_oid: RawSaiObjectId,
    tx: HashMap<RawSaiObjectId, BfdOffloadSession>,
    rx: HashMap<RawSaiObjectId, (BfdOffloadSession, RawSaiObjectId)>,
}

impl SoftwareTables {
    fn alloc_oid(&mut self) -> RawSaiObjectId {
        self.next_oid += 1;
        self.next_oid
    }
}

/// In-memory offload table used when no ASIC is attached.
///
/// It validates handles the same way the hardware does (editing an unknown
/// handle fails with `ItemNotFound`) but generates no packets.
#[derive(Debug, Default)]
pub struct SoftwareBfdOffload {
    tables: Mutex<SoftwareTables>,
}

impl SoftwareBfdOffload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last programmed parameters of a transmit session.
    pub fn tx_session(&self, oid: BfdTxSessionOid) -> Option<BfdOffloadSession> {
        self.tables.lock().tx.get(&oid.as_raw()).cloned()
    }

    /// Returns the last programmed parameters and correlation of a receive session.
    pub fn rx_session(&self, oid: BfdRxSessionOid) -> Option<(BfdOffloadSession, RawSaiObjectId)> {
        self.tables.lock().rx.get(&oid.as_raw()).cloned()
    }

    pub fn tx_count(&self) -> usize {
        self.tables.lock().tx.len()
    }

    pub fn rx_count(&self) -> usize {
        self.tables.lock().rx.len()
    }
}

impl BfdOffloadApi for SoftwareBfdOffload {
    fn create_or_edit_tx(&self, session: &BfdOffloadSession) -> SaiResult<BfdTxSessionOid> {
        let mut tables = self.tables.lock();
        let raw = if session.tx_session.is_valid() {
            let raw = session.tx_session.as_raw();
            if !tables.tx.contains_key(&raw) {
                return Err(SaiError::not_found(format!("bfd tx session {}", session.tx_session)));
            }
            raw
        } else {
            tables.alloc_oid()
        };

        debug!(
            "bfd tx 0x{:x}: disc {}/{} state {:?} poll {} final {}",
            raw,
            session.local_discriminator,
            session.remote_discriminator,
            session.state,
            session.poll,
            session.final_flag
        );
        tables.tx.insert(raw, session.clone());
        Ok(BfdTxSessionOid::from_raw_unchecked(raw))
    }

    fn create_or_edit_rx(
        &self,
        session: &BfdOffloadSession,
        correlation: RawSaiObjectId,
    ) -> SaiResult<BfdRxSessionOid> {
        let mut tables = self.tables.lock();
        let raw = if session.rx_session.is_valid() {
            let raw = session.rx_session.as_raw();
            if !tables.rx.contains_key(&raw) {
                return Err(SaiError::not_found(format!("bfd rx session {}", session.rx_session)));
            }
            raw
        } else {
            tables.alloc_oid()
        };

        debug!(
            "bfd rx 0x{:x}: disc {}/{} remote mult {} remote tx {}us correlation 0x{:x}",
            raw,
            session.local_discriminator,
            session.remote_discriminator,
            session.remote_multiplier,
            session.remote_min_tx_us,
            correlation
        );
        tables.rx.insert(raw, (session.clone(), correlation));
        Ok(BfdRxSessionOid::from_raw_unchecked(raw))
    }

    fn remove_session(&self, tx: BfdTxSessionOid, rx: BfdRxSessionOid) -> SaiResult<()> {
        let mut tables = self.tables.lock();
        if tx.is_valid() && tables.tx.remove(&tx.as_raw()).is_none() {
            return Err(SaiError::not_found(format!("bfd tx session {}", tx)));
        }
        if rx.is_valid() && tables.rx.remove(&rx.as_raw()).is_none() {
            return Err(SaiError::not_found(format!("bfd rx session {}", rx)));
        }
        Ok(())
    }
}
