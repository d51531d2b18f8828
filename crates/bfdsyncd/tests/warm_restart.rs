//! Session records surviving a process restart on a file-backed segment.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use sonic_bfdsyncd::{
    BfdOrch, BfdSessionAttribute, BfdSessionConfig, BfdSessionState, ControlPacket,
    InboundPacket, PacketDisposition, SessionStore, TracingNotifier, BFD_SINGLE_HOP_TTL,
};
use sonic_sai::api::SoftwareBfdOffload;
use sonic_sai::BfdSessionOid;
use sonic_shm_arena::{SegmentConfig, SegmentOrigin};
use tempfile::TempDir;

const PEER: &str = "192.0.2.2";
const CAPACITY: u32 = 4;

fn open(path: &Path, warm: bool, capacity: u32) -> sonic_bfdsyncd::Result<SessionStore> {
    SessionStore::open(
        &SegmentConfig::new(path).with_warm_restart(warm),
        capacity,
    )
}

fn orch(store: SessionStore, offload: &Arc<SoftwareBfdOffload>) -> BfdOrch {
    BfdOrch::new(store, offload.clone(), Arc::new(TracingNotifier))
}

fn from_peer(state: BfdSessionState, your: u32) -> InboundPacket {
    InboundPacket::new(
        ControlPacket {
            state,
            my_discriminator: 200,
            your_discriminator: your,
            ..Default::default()
        },
        PEER.parse().unwrap(),
        Some(BFD_SINGLE_HOP_TTL),
    )
}

/// Creates session 100 and brings it Up against peer 200.
fn bring_up(orch: &mut BfdOrch) -> BfdSessionOid {
    let oid = orch
        .create_session(&BfdSessionConfig::new(100, PEER.parse().unwrap()))
        .unwrap();
    orch.handle_packet(&from_peer(BfdSessionState::Init, 100))
        .unwrap();
    assert_eq!(
        orch.get_session(oid).unwrap().state,
        BfdSessionState::Up
    );
    oid
}

#[test]
fn test_reattach_preserves_sessions_and_reprograms_adapter() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bfd.seg");

    let first_offload = Arc::new(SoftwareBfdOffload::new());
    let mut first = orch(open(&path, true, CAPACITY).unwrap(), &first_offload);
    assert_eq!(first.store().origin(), SegmentOrigin::Created);
    let oid = bring_up(&mut first);
    let before = first.get_session(oid).unwrap();
    first.into_store().detach().unwrap();

    // New process, new adapter that knows none of the old handles
    let offload = Arc::new(SoftwareBfdOffload::new());
    let mut second = orch(open(&path, true, CAPACITY).unwrap(), &offload);
    assert_eq!(second.store().origin(), SegmentOrigin::Attached);

    let report = second.reconcile_after_attach().unwrap();
    assert_eq!(report.sessions, 1);
    assert_eq!(report.recreated, 1);
    assert!(report.failed.is_empty());
    assert!(report.corrupted.is_empty());

    let after = second.get_session(oid).unwrap();
    assert_eq!(after.state, BfdSessionState::Up);
    assert_eq!(after.remote_discriminator, before.remote_discriminator);
    assert_eq!(after.detection_time(), before.detection_time());

    let tx = offload.tx_session(after.tx_session).unwrap();
    assert_eq!(tx.local_discriminator, 100);
    assert_eq!(tx.remote_discriminator, 200);
    let (_, correlation) = offload.rx_session(after.rx_session).unwrap();
    assert_eq!(correlation, oid.as_raw());

    // The same handle keeps working for the peer's next packet
    let next = second
        .handle_packet(&from_peer(BfdSessionState::Up, 100))
        .unwrap();
    assert!(matches!(
        next,
        PacketDisposition::Applied {
            state: BfdSessionState::Up,
            ..
        }
    ));
    second.into_store().destroy().unwrap();
}

#[test]
fn test_reattach_drops_outstanding_poll() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bfd.seg");

    let offload = Arc::new(SoftwareBfdOffload::new());
    let mut first = orch(open(&path, true, CAPACITY).unwrap(), &offload);
    let oid = bring_up(&mut first);
    let record = first
        .set_attribute(oid, BfdSessionAttribute::LocalMinTx(300_000))
        .unwrap();
    assert!(record.poll_pending);
    first.into_store().detach().unwrap();

    let mut second = orch(open(&path, true, CAPACITY).unwrap(), &offload);
    let report = second.reconcile_after_attach().unwrap();
    assert_eq!(report.reprogrammed, 1);

    let record = second.get_session(oid).unwrap();
    assert!(!record.poll_pending);
    assert!(!record.final_pending);
    assert_eq!(record.min_tx_us, 300_000);
    assert!(!offload.tx_session(record.tx_session).unwrap().poll);
}

#[test]
fn test_cold_start_discards_sessions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bfd.seg");

    let offload = Arc::new(SoftwareBfdOffload::new());
    let mut first = orch(open(&path, true, CAPACITY).unwrap(), &offload);
    bring_up(&mut first);
    first.into_store().detach().unwrap();

    let second = orch(open(&path, false, CAPACITY).unwrap(), &offload);
    assert_eq!(second.store().origin(), SegmentOrigin::Created);
    assert_eq!(second.session_count().unwrap(), 0);
}

#[test]
fn test_capacity_change_refuses_attach() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bfd.seg");

    let offload = Arc::new(SoftwareBfdOffload::new());
    let mut first = orch(open(&path, true, CAPACITY).unwrap(), &offload);
    bring_up(&mut first);
    first.into_store().detach().unwrap();

    let err = open(&path, true, CAPACITY * 2).unwrap_err();
    assert!(err.is_terminal());

    // The original geometry still attaches
    let store = open(&path, true, CAPACITY).unwrap();
    assert_eq!(store.origin(), SegmentOrigin::Attached);
}
