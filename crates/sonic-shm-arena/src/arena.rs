//! Arena operations over a mapped segment.
//!
//! [`ArenaRead`] and [`ArenaWrite`] are implemented by the segment guards,
//! so every operation runs under the segment lock the guard holds. No
//! operation hands out payload bytes of a slot whose header fails
//! validation.

use std::io;
use std::ops::Range;

use log::{error, warn};

use crate::error::{ArenaError, ArenaResult};
use crate::layout::{ArenaIndex, ObjectType, SegmentLayout, TypeDescriptor};
use crate::slot::{self, SlotState, SLOT_HEADER_LEN};

/// A value stored by copy in one arena slot.
pub trait ArenaObject: Sized {
    /// Type whose slots hold this object.
    const OBJECT_TYPE: ObjectType;
    /// Bytes `encode` writes; the type must be registered with at least this size.
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut [u8]) -> io::Result<()>;
    fn decode(buf: &[u8]) -> io::Result<Self>;
}

struct SlotLocation {
    slot: Range<usize>,
    elem_size: usize,
}

impl SlotLocation {
    fn payload(&self) -> Range<usize> {
        let start = self.slot.start + SLOT_HEADER_LEN;
        start..start + self.elem_size
    }
}

fn descriptor(layout: &SegmentLayout, object_type: ObjectType) -> ArenaResult<&TypeDescriptor> {
    layout
        .descriptor(object_type)
        .ok_or_else(|| ArenaError::NotFound(format!("{} is not registered", object_type)))
}

fn locate(layout: &SegmentLayout, index: ArenaIndex) -> ArenaResult<SlotLocation> {
    let desc = descriptor(layout, index.object_type())?;
    if index.slot() >= desc.capacity {
        return Err(ArenaError::NotFound(format!(
            "slot {} beyond capacity {}",
            index,
            desc.capacity
        )));
    }
    let start = desc.slot_offset(index.slot());
    Ok(SlotLocation {
        slot: start..start + desc.stride(),
        elem_size: desc.elem_size as usize,
    })
}

fn check_type<T: ArenaObject>(index: ArenaIndex) -> ArenaResult<()> {
    if index.object_type() != T::OBJECT_TYPE {
        return Err(ArenaError::NotFound(format!(
            "{} does not hold {}",
            index,
            T::OBJECT_TYPE
        )));
    }
    Ok(())
}

/// Validates the header and requires the slot to be occupied by the
/// generation `index` was issued for.
fn check_live(slot_bytes: &[u8], index: ArenaIndex) -> ArenaResult<()> {
    match slot::validate(slot_bytes, index)? {
        SlotState::Occupied if slot::generation(slot_bytes) == index.generation() => Ok(()),
        _ => Err(ArenaError::NotInUse(index)),
    }
}

fn codec_error(index: ArenaIndex, err: io::Error) -> ArenaError {
    ArenaError::Codec {
        index,
        message: err.to_string(),
    }
}

/// Operations available under the shared lock.
pub trait ArenaRead {
    fn layout(&self) -> &SegmentLayout;
    fn bytes(&self) -> &[u8];

    fn capacity(&self, object_type: ObjectType) -> ArenaResult<u32> {
        Ok(descriptor(self.layout(), object_type)?.capacity)
    }

    /// Returns the payload of a live slot.
    ///
    /// An index from before the slot was last freed is [`ArenaError::NotInUse`]
    /// even if the slot has been claimed again since.
    fn access(&self, index: ArenaIndex) -> ArenaResult<&[u8]> {
        let loc = locate(self.layout(), index)?;
        let bytes = self.bytes();
        check_live(&bytes[loc.slot.clone()], index)?;
        Ok(&bytes[loc.payload()])
    }

    /// Scans from `resume_from` for the first live slot matching `predicate`.
    ///
    /// Free and corrupted slots are skipped; corrupted ones are logged.
    fn find<P>(&self, object_type: ObjectType, resume_from: u32, mut predicate: P) -> ArenaResult<ArenaIndex>
    where
        P: FnMut(ArenaIndex, &[u8]) -> bool,
    {
        let desc = descriptor(self.layout(), object_type)?;
        let bytes = self.bytes();
        for n in resume_from..desc.capacity {
            let index = ArenaIndex::new(object_type, n);
            let start = desc.slot_offset(n);
            let slot_bytes = &bytes[start..start + desc.stride()];
            match slot::validate(slot_bytes, index) {
                Ok(SlotState::Occupied) => {
                    let index = index.with_generation(slot::generation(slot_bytes));
                    let payload = &slot_bytes[SLOT_HEADER_LEN..SLOT_HEADER_LEN + desc.elem_size as usize];
                    if predicate(index, payload) {
                        return Ok(index);
                    }
                }
                Ok(SlotState::Free) => {}
                Err(e) => warn!("{} ({}): skipping during scan: {}", index, desc.name, e),
            }
        }
        Err(ArenaError::NotFound(format!(
            "no matching {} from slot {}",
            desc.name, resume_from
        )))
    }

    /// Number of valid, unused slots. Corrupted slots count as neither.
    fn free_count(&self, object_type: ObjectType) -> ArenaResult<u32> {
        let desc = descriptor(self.layout(), object_type)?;
        let bytes = self.bytes();
        let free = (0..desc.capacity)
            .filter(|&n| {
                let start = desc.slot_offset(n);
                matches!(
                    slot::validate(&bytes[start..start + desc.stride()], ArenaIndex::new(object_type, n)),
                    Ok(SlotState::Free)
                )
            })
            .count();
        Ok(free as u32)
    }

    /// Indexes of all live slots of `object_type`, in slot order.
    fn occupied(&self, object_type: ObjectType) -> ArenaResult<Vec<ArenaIndex>> {
        let mut live = Vec::new();
        let mut resume = 0;
        loop {
            match self.find(object_type, resume, |_, _| true) {
                Ok(index) => {
                    live.push(index);
                    resume = index.slot() + 1;
                }
                Err(ArenaError::NotFound(_)) => return Ok(live),
                Err(e) => return Err(e),
            }
        }
    }

    /// Indexes of every slot whose header fails validation.
    fn corrupted_slots(&self, object_type: ObjectType) -> ArenaResult<Vec<ArenaIndex>> {
        let desc = descriptor(self.layout(), object_type)?;
        let bytes = self.bytes();
        Ok((0..desc.capacity)
            .map(|n| ArenaIndex::new(object_type, n))
            .filter(|index| {
                let start = desc.slot_offset(index.slot());
                slot::validate(&bytes[start..start + desc.stride()], *index).is_err()
            })
            .collect())
    }

    fn load<T: ArenaObject>(&self, index: ArenaIndex) -> ArenaResult<T> {
        check_type::<T>(index)?;
        T::decode(self.access(index)?).map_err(|e| codec_error(index, e))
    }

    /// Typed [`find`](ArenaRead::find). Slots that fail to decode are skipped.
    fn find_object<T, P>(&self, resume_from: u32, mut predicate: P) -> ArenaResult<(ArenaIndex, T)>
    where
        T: ArenaObject,
        P: FnMut(&T) -> bool,
    {
        let mut found = None;
        let index = self.find(T::OBJECT_TYPE, resume_from, |index, bytes| match T::decode(bytes) {
            Ok(object) if predicate(&object) => {
                found = Some(object);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("{}: undecodable payload: {}", index, e);
                false
            }
        })?;
        found
            .map(|object| (index, object))
            .ok_or_else(|| ArenaError::NotFound(format!("{}", index)))
    }
}

/// Operations that need the exclusive lock.
pub trait ArenaWrite: ArenaRead {
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Claims the first free slot of `object_type`.
    ///
    /// Every visited header is validated before its `used` flag is trusted;
    /// hitting a corrupted slot fails the call instead of skipping it.
    fn allocate(&mut self, object_type: ObjectType) -> ArenaResult<ArenaIndex> {
        let (capacity, stride, name, first) = {
            let desc = descriptor(self.layout(), object_type)?;
            (desc.capacity, desc.stride(), desc.name, desc.slot_offset(0))
        };
        let bytes = self.bytes_mut();
        for n in 0..capacity {
            let index = ArenaIndex::new(object_type, n);
            let start = first + stride * n as usize;
            let slot_bytes = &mut bytes[start..start + stride];
            match slot::validate(slot_bytes, index) {
                Ok(SlotState::Free) => {
                    slot_bytes[SLOT_HEADER_LEN..].fill(0);
                    slot::set_used(slot_bytes, true);
                    return Ok(index.with_generation(slot::generation(slot_bytes)));
                }
                Ok(SlotState::Occupied) => {}
                Err(e) => {
                    error!("{} ({}): allocation aborted: {}", index, name, e);
                    return Err(e);
                }
            }
        }
        Err(ArenaError::ResourceExhausted {
            object_type,
            capacity,
        })
    }

    /// Releases a live slot, scrubs its payload and retires `index`.
    fn free(&mut self, index: ArenaIndex) -> ArenaResult<()> {
        let loc = locate(self.layout(), index)?;
        let slot_bytes = &mut self.bytes_mut()[loc.slot];
        check_live(slot_bytes, index)?;
        slot_bytes[SLOT_HEADER_LEN..].fill(0);
        slot::set_used(slot_bytes, false);
        slot::bump_generation(slot_bytes);
        Ok(())
    }

    fn access_mut(&mut self, index: ArenaIndex) -> ArenaResult<&mut [u8]> {
        let loc = locate(self.layout(), index)?;
        let payload = loc.payload();
        let bytes = self.bytes_mut();
        check_live(&bytes[loc.slot], index)?;
        Ok(&mut bytes[payload])
    }

    fn store<T: ArenaObject>(&mut self, index: ArenaIndex, object: &T) -> ArenaResult<()> {
        check_type::<T>(index)?;
        let payload = self.access_mut(index)?;
        if payload.len() < T::ENCODED_LEN {
            return Err(ArenaError::Codec {
                index,
                message: format!("slot holds {} bytes, object needs {}", payload.len(), T::ENCODED_LEN),
            });
        }
        object.encode(payload).map_err(|e| codec_error(index, e))
    }

    /// Allocates a slot and writes `object` into it in one step.
    fn insert<T: ArenaObject>(&mut self, object: &T) -> ArenaResult<ArenaIndex> {
        let index = self.allocate(T::OBJECT_TYPE)?;
        if let Err(e) = self.store(index, object) {
            self.free(index)?;
            return Err(e);
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
    use pretty_assertions::assert_eq;

    const COUNTER: ObjectType = ObjectType::new(9);

    #[derive(Debug, PartialEq)]
    struct Counter(u64);

    impl ArenaObject for Counter {
        const OBJECT_TYPE: ObjectType = COUNTER;
        const ENCODED_LEN: usize = 8;

        fn encode(&self, mut buf: &mut [u8]) -> io::Result<()> {
            buf.write_u64::<LittleEndian>(self.0)
        }

        fn decode(mut buf: &[u8]) -> io::Result<Self> {
            Ok(Counter(buf.read_u64::<LittleEndian>()?))
        }
    }

    /// Plain in-memory region for exercising the traits without a mapping.
    struct Region {
        layout: SegmentLayout,
        bytes: Vec<u8>,
    }

    impl Region {
        fn new(capacity: u32) -> Self {
            let layout = SegmentLayout::builder()
                .register(COUNTER, "counter", Counter::ENCODED_LEN, capacity)
                .build()
                .unwrap();
            let mut bytes = vec![0u8; layout.total_len()];
            let desc = layout.descriptor(COUNTER).unwrap().clone();
            for n in 0..capacity {
                let start = desc.slot_offset(n);
                slot::stamp(&mut bytes[start..start + desc.stride()], COUNTER);
            }
            Self { layout, bytes }
        }

        fn smash_canary(&mut self, slot_no: u32) {
            let start = self.layout.descriptor(COUNTER).unwrap().slot_offset(slot_no);
            self.bytes[start] ^= 0xff;
        }
    }

    impl ArenaRead for Region {
        fn layout(&self) -> &SegmentLayout {
            &self.layout
        }
        fn bytes(&self) -> &[u8] {
            &self.bytes
        }
    }

    impl ArenaWrite for Region {
        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.bytes
        }
    }

    #[test]
    fn test_exhaustion_and_slot_reuse() {
        let mut region = Region::new(3);
        let indexes: Vec<_> = (0..3).map(|_| region.allocate(COUNTER).unwrap()).collect();

        let err = region.allocate(COUNTER).unwrap_err();
        assert!(matches!(err, ArenaError::ResourceExhausted { capacity: 3, .. }));

        region.free(indexes[1]).unwrap();
        assert_eq!(region.free_count(COUNTER).unwrap(), 1);
        let reused = region.allocate(COUNTER).unwrap();
        assert_eq!(reused.slot(), indexes[1].slot());
        assert_eq!(reused.generation(), indexes[1].generation() + 1);
        assert!(region.allocate(COUNTER).is_err());
    }

    #[test]
    fn test_freed_slot_reports_not_in_use() {
        let mut region = Region::new(2);
        let index = region.insert(&Counter(42)).unwrap();
        assert_eq!(region.load::<Counter>(index).unwrap(), Counter(42));

        region.free(index).unwrap();
        assert!(matches!(region.access(index), Err(ArenaError::NotInUse(_))));
        assert!(matches!(region.free(index), Err(ArenaError::NotInUse(_))));
    }

    #[test]
    fn test_reused_slot_does_not_leak_previous_payload() {
        let mut region = Region::new(1);
        let index = region.insert(&Counter(7)).unwrap();
        region.free(index).unwrap();

        let again = region.allocate(COUNTER).unwrap();
        assert_eq!(again.slot(), index.slot());
        assert_eq!(region.load::<Counter>(again).unwrap(), Counter(0));
    }

    #[test]
    fn test_stale_index_never_reaches_new_occupant() {
        let mut region = Region::new(1);
        let old = region.insert(&Counter(100)).unwrap();
        region.free(old).unwrap();
        let new = region.insert(&Counter(300)).unwrap();
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new, old);

        assert!(matches!(region.access(old), Err(ArenaError::NotInUse(_))));
        assert!(matches!(region.load::<Counter>(old), Err(ArenaError::NotInUse(_))));
        assert!(matches!(region.store(old, &Counter(1)), Err(ArenaError::NotInUse(_))));
        assert!(matches!(region.free(old), Err(ArenaError::NotInUse(_))));

        // The occupant is untouched and its own handle round-trips
        assert_eq!(region.load::<Counter>(new).unwrap(), Counter(300));
        let raw = ArenaIndex::from_raw(new.to_raw()).unwrap();
        assert_eq!(region.load::<Counter>(raw).unwrap(), Counter(300));
        assert_eq!(region.find(COUNTER, 0, |_, _| true).unwrap(), new);
        assert_eq!(region.occupied(COUNTER).unwrap(), vec![new]);
    }

    #[test]
    fn test_corrupted_slot_fails_only_itself() {
        let mut region = Region::new(4);
        let live: Vec<_> = (0..4u64).map(|v| region.insert(&Counter(v)).unwrap()).collect();
        region.smash_canary(2);

        for (n, index) in live.iter().enumerate() {
            let result = region.access(*index);
            if n == 2 {
                assert!(result.unwrap_err().is_corruption());
                assert!(region.free(*index).unwrap_err().is_corruption());
                assert!(region.store(*index, &Counter(1)).unwrap_err().is_corruption());
            } else {
                assert!(result.is_ok());
            }
        }

        assert_eq!(region.corrupted_slots(COUNTER).unwrap(), vec![live[2]]);

        // Scans skip the damaged slot
        let (found, value) = region.find_object::<Counter, _>(0, |c| c.0 == 3).unwrap();
        assert_eq!((found, value), (live[3], Counter(3)));

        region.free(live[0]).unwrap();
        region.free(live[3]).unwrap();
        assert_eq!(region.free_count(COUNTER).unwrap(), 2);
        region.free(live[1]).unwrap();
        assert_eq!(region.free_count(COUNTER).unwrap(), 3);
    }

    #[test]
    fn test_allocation_stops_at_corruption() {
        let mut region = Region::new(3);
        region.allocate(COUNTER).unwrap();
        region.smash_canary(1);

        assert!(region.allocate(COUNTER).unwrap_err().is_corruption());
    }

    #[test]
    fn test_find_resumes_from_slot() {
        let mut region = Region::new(5);
        for v in [10u64, 11, 10, 12, 10] {
            region.insert(&Counter(v)).unwrap();
        }

        let mut seen = Vec::new();
        let mut resume = 0;
        while let Ok(index) = region.find(COUNTER, resume, |_, bytes| bytes[0] == 10) {
            seen.push(index.slot());
            resume = index.slot() + 1;
        }
        assert_eq!(seen, vec![0, 2, 4]);
    }

    #[test]
    fn test_out_of_range_and_foreign_type() {
        let region = Region::new(2);
        let beyond = ArenaIndex::new(COUNTER, 2);
        assert!(matches!(region.access(beyond), Err(ArenaError::NotFound(_))));

        let unknown = ArenaIndex::new(ObjectType::new(77), 0);
        assert!(matches!(region.access(unknown), Err(ArenaError::NotFound(_))));
        assert!(region.free_count(ObjectType::new(77)).is_err());
    }
}
