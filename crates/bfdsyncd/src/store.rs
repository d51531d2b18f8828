//! Session store: BFD session records in the shared arena.
//!
//! Records are addressed from outside only by [`BfdSessionOid`], the packed
//! arena index. [`SessionStore::read`] takes the shared segment lock and
//! [`SessionStore::write`] the exclusive one; everything done through one
//! writer is a single atomic step for every other reader.

use std::net::IpAddr;

use sonic_sai::BfdSessionOid;
use sonic_shm_arena::{
    ArenaError, ArenaIndex, ArenaRead, ArenaWrite, SegmentConfig, SegmentLayout, SegmentOrigin,
    SegmentReadGuard, SegmentWriteGuard, SharedSegment,
};
use tracing::warn;

use crate::error::{BfdError, Result};
use crate::record::{BfdSessionRecord, BFD_SESSION, BFD_SESSION_RECORD_LEN};

/// Segment geometry for `capacity` sessions.
pub fn session_layout(capacity: u32) -> Result<SegmentLayout> {
    Ok(SegmentLayout::builder()
        .register(BFD_SESSION, "bfd_session", BFD_SESSION_RECORD_LEN, capacity)
        .build()?)
}

pub fn oid_of(index: ArenaIndex) -> BfdSessionOid {
    BfdSessionOid::from_raw_unchecked(index.to_raw())
}

pub fn index_of(oid: BfdSessionOid) -> Result<ArenaIndex> {
    ArenaIndex::from_raw(oid.as_raw())
        .ok_or_else(|| ArenaError::NotFound(format!("malformed session handle {}", oid)).into())
}

fn not_found_as_none<T>(result: std::result::Result<T, ArenaError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ArenaError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// One page of [`SessionRead::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionPage {
    pub sessions: Vec<(BfdSessionOid, BfdSessionRecord)>,
    /// Slot to resume from, `None` once the table is exhausted.
    pub next: Option<u32>,
}

/// Queries available under either lock mode.
pub trait SessionRead {
    type Arena: ArenaRead;

    fn arena(&self) -> &Self::Arena;

    fn get(&self, oid: BfdSessionOid) -> Result<BfdSessionRecord> {
        Ok(self.arena().load(index_of(oid)?)?)
    }

    fn find_by_local_discriminator(
        &self,
        discriminator: u32,
    ) -> Result<Option<(BfdSessionOid, BfdSessionRecord)>> {
        let found = self
            .arena()
            .find_object::<BfdSessionRecord, _>(0, |r| r.local_discriminator == discriminator);
        Ok(not_found_as_none(found)?.map(|(index, record)| (oid_of(index), record)))
    }

    /// First session to `peer` in the given hop mode.
    fn find_by_peer(
        &self,
        peer: IpAddr,
        multihop: bool,
    ) -> Result<Option<(BfdSessionOid, BfdSessionRecord)>> {
        let found = self
            .arena()
            .find_object::<BfdSessionRecord, _>(0, |r| r.peer_addr == peer && r.multihop == multihop);
        Ok(not_found_as_none(found)?.map(|(index, record)| (oid_of(index), record)))
    }

    /// Up to `limit` sessions starting at slot `resume_from`.
    fn list(&self, resume_from: u32, limit: usize) -> Result<SessionPage> {
        let mut page = SessionPage::default();
        let mut resume = resume_from;
        while page.sessions.len() < limit {
            match self.arena().find_object::<BfdSessionRecord, _>(resume, |_| true) {
                Ok((index, record)) => {
                    resume = index.slot() + 1;
                    page.sessions.push((oid_of(index), record));
                }
                Err(ArenaError::NotFound(_)) => return Ok(page),
                Err(e) => return Err(e.into()),
            }
        }
        page.next = Some(resume);
        Ok(page)
    }

    fn all(&self) -> Result<Vec<(BfdSessionOid, BfdSessionRecord)>> {
        Ok(self.list(0, usize::MAX)?.sessions)
    }

    fn free_count(&self) -> Result<u32> {
        Ok(self.arena().free_count(BFD_SESSION)?)
    }

    /// Sessions in valid, occupied slots.
    fn live_count(&self) -> Result<u32> {
        Ok(self.arena().occupied(BFD_SESSION)?.len() as u32)
    }

    fn capacity(&self) -> Result<u32> {
        Ok(self.arena().capacity(BFD_SESSION)?)
    }

    fn corrupted(&self) -> Result<Vec<BfdSessionOid>> {
        Ok(self
            .arena()
            .corrupted_slots(BFD_SESSION)?
            .into_iter()
            .map(oid_of)
            .collect())
    }
}

/// Shared-lock view.
pub struct StoreReader<'a> {
    guard: SegmentReadGuard<'a>,
}

impl<'a> SessionRead for StoreReader<'a> {
    type Arena = SegmentReadGuard<'a>;

    fn arena(&self) -> &Self::Arena {
        &self.guard
    }
}

/// Exclusive-lock view.
pub struct StoreWriter<'a> {
    guard: SegmentWriteGuard<'a>,
}

impl<'a> SessionRead for StoreWriter<'a> {
    type Arena = SegmentWriteGuard<'a>;

    fn arena(&self) -> &Self::Arena {
        &self.guard
    }
}

impl StoreWriter<'_> {
    /// Reserves a slot and writes `record` into it.
    pub fn insert(&mut self, record: &BfdSessionRecord) -> Result<BfdSessionOid> {
        if record.local_discriminator == 0 {
            return Err(BfdError::InvalidConfig(
                "local discriminator must be non-zero".to_string(),
            ));
        }
        if let Some((oid, _)) = self.find_by_local_discriminator(record.local_discriminator)? {
            return Err(BfdError::SessionExists(format!(
                "local discriminator {} in use by {}",
                record.local_discriminator, oid
            )));
        }
        let index = self.guard.insert(record)?;
        Ok(oid_of(index))
    }

    pub fn update(&mut self, oid: BfdSessionOid, record: &BfdSessionRecord) -> Result<()> {
        Ok(self.guard.store(index_of(oid)?, record)?)
    }

    /// Frees the slot and returns what it held.
    pub fn remove(&mut self, oid: BfdSessionOid) -> Result<BfdSessionRecord> {
        let index = index_of(oid)?;
        let record = match self.guard.load::<BfdSessionRecord>(index) {
            Ok(record) => record,
            Err(e @ ArenaError::Codec { .. }) => {
                warn!(session = %oid, error = %e, "freeing undecodable session");
                self.guard.free(index)?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        self.guard.free(index)?;
        Ok(record)
    }
}

/// Handle over the session segment.
#[derive(Debug)]
pub struct SessionStore {
    segment: SharedSegment,
}

impl SessionStore {
    /// Opens or attaches the file-backed store.
    pub fn open(config: &SegmentConfig, capacity: u32) -> Result<Self> {
        let segment = SharedSegment::open(config, session_layout(capacity)?)?;
        Ok(Self { segment })
    }

    /// Process-private store.
    pub fn anonymous(capacity: u32) -> Result<Self> {
        let segment = SharedSegment::anonymous(session_layout(capacity)?)?;
        Ok(Self { segment })
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    pub fn origin(&self) -> SegmentOrigin {
        self.segment.origin()
    }

    pub fn read(&self) -> Result<StoreReader<'_>> {
        Ok(StoreReader {
            guard: self.segment.read()?,
        })
    }

    pub fn write(&self) -> Result<StoreWriter<'_>> {
        Ok(StoreWriter {
            guard: self.segment.write()?,
        })
    }

    /// Leaves the segment in place for the next warm start.
    pub fn detach(self) -> Result<()> {
        Ok(self.segment.detach()?)
    }

    pub fn destroy(self) -> Result<()> {
        Ok(self.segment.destroy()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BfdSessionConfig, BfdSessionState};
    use pretty_assertions::assert_eq;

    fn record(local: u32, peer: &str) -> BfdSessionRecord {
        BfdSessionRecord::new(&BfdSessionConfig::new(local, peer.parse().unwrap()))
    }

    #[test]
    fn test_insert_get_update_remove() {
        let store = SessionStore::anonymous(4).unwrap();
        let mut w = store.write().unwrap();

        let oid = w.insert(&record(100, "10.0.0.2")).unwrap();
        let mut rec = w.get(oid).unwrap();
        assert_eq!(rec.state, BfdSessionState::Down);

        rec.state = BfdSessionState::Init;
        rec.remote_discriminator = 200;
        w.update(oid, &rec).unwrap();
        assert_eq!(w.get(oid).unwrap(), rec);

        assert_eq!(w.remove(oid).unwrap(), rec);
        let err = w.get(oid).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_duplicate_discriminator_rejected() {
        let store = SessionStore::anonymous(4).unwrap();
        let mut w = store.write().unwrap();
        w.insert(&record(100, "10.0.0.2")).unwrap();

        let err = w.insert(&record(100, "10.0.0.3")).unwrap_err();
        assert!(matches!(err, BfdError::SessionExists(_)));
        assert!(matches!(
            w.insert(&record(0, "10.0.0.3")),
            Err(BfdError::InvalidConfig(_))
        ));
        assert_eq!(w.free_count().unwrap(), 3);
    }

    #[test]
    fn test_store_full() {
        let store = SessionStore::anonymous(1).unwrap();
        let mut w = store.write().unwrap();
        w.insert(&record(1, "10.0.0.2")).unwrap();

        let err = w.insert(&record(2, "10.0.0.3")).unwrap_err();
        assert!(matches!(
            err,
            BfdError::Arena(ArenaError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_lookup_by_discriminator_and_peer() {
        let store = SessionStore::anonymous(4).unwrap();
        let (a, b) = {
            let mut w = store.write().unwrap();
            (
                w.insert(&record(100, "10.0.0.2")).unwrap(),
                w.insert(&record(101, "fc00::2")).unwrap(),
            )
        };

        let r = store.read().unwrap();
        assert_eq!(r.find_by_local_discriminator(101).unwrap().unwrap().0, b);
        assert!(r.find_by_local_discriminator(7).unwrap().is_none());
        assert_eq!(
            r.find_by_peer("10.0.0.2".parse().unwrap(), false).unwrap().unwrap().0,
            a
        );
        assert!(r.find_by_peer("10.0.0.9".parse().unwrap(), false).unwrap().is_none());
        assert!(r.find_by_peer("10.0.0.2".parse().unwrap(), true).unwrap().is_none());
    }

    #[test]
    fn test_peer_lookup_separates_hop_modes() {
        let store = SessionStore::anonymous(4).unwrap();
        let peer: IpAddr = "10.0.0.2".parse().unwrap();
        let (single, multi) = {
            let mut w = store.write().unwrap();
            let single = w.insert(&record(100, "10.0.0.2")).unwrap();
            let multi = w
                .insert(&BfdSessionRecord::new(
                    &BfdSessionConfig::new(101, peer).with_multihop(true),
                ))
                .unwrap();
            (single, multi)
        };

        let r = store.read().unwrap();
        assert_eq!(r.find_by_peer(peer, false).unwrap().unwrap().0, single);
        let (oid, found) = r.find_by_peer(peer, true).unwrap().unwrap();
        assert_eq!(oid, multi);
        assert_eq!(found.local_discriminator, 101);
        assert_eq!(r.live_count().unwrap(), 2);
    }

    #[test]
    fn test_list_pages() {
        let store = SessionStore::anonymous(8).unwrap();
        {
            let mut w = store.write().unwrap();
            for local in 1..=5 {
                w.insert(&record(local, "10.0.0.2")).unwrap();
            }
            let third = w.find_by_local_discriminator(3).unwrap().unwrap().0;
            w.remove(third).unwrap();
        }

        let r = store.read().unwrap();
        let first = r.list(0, 2).unwrap();
        let locals: Vec<_> = first.sessions.iter().map(|(_, s)| s.local_discriminator).collect();
        assert_eq!(locals, vec![1, 2]);

        let second = r.list(first.next.unwrap(), 10).unwrap();
        let locals: Vec<_> = second.sessions.iter().map(|(_, s)| s.local_discriminator).collect();
        assert_eq!(locals, vec![4, 5]);
        assert_eq!(second.next, None);
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let store = SessionStore::anonymous(2).unwrap();
        let r = store.read().unwrap();
        assert!(r.get(BfdSessionOid::from_raw_unchecked(0x0000_0001_0000_0000)).is_err());
        assert!(r.get(BfdSessionOid::from_raw_unchecked(0x0007_0000_0000_0000)).is_err());
    }
}
