//! Tagged slot headers.
//!
//! Every slot starts with an 8-byte header
//! `{canary: u32, used: u8, _: u8, generation: u16}`.
//! The canary is derived from the owning type, so a header is only trusted
//! when it carries exactly its own type's canary. Zero-filled memory never
//! passes because no type's canary is zero.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ArenaError, ArenaResult};
use crate::layout::{ArenaIndex, ObjectType};

/// Size of the slot header in bytes.
pub const SLOT_HEADER_LEN: usize = 8;

const CANARY_SEED: u32 = 0x5afe_c0de;
const USED_OFFSET: usize = 4;
const GENERATION_OFFSET: usize = 6;

/// Canary stamped into every slot of `object_type`.
pub fn canary_for(object_type: ObjectType) -> u32 {
    CANARY_SEED.wrapping_add(u32::from(object_type.as_raw()).wrapping_mul(0x0001_0001))
}

/// Validated state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Occupied,
}

/// Validates a slot header against the expected canary.
pub(crate) fn validate(slot: &[u8], index: ArenaIndex) -> ArenaResult<SlotState> {
    let expected = canary_for(index.object_type());
    let found = LittleEndian::read_u32(&slot[..4]);
    if found != expected {
        return Err(ArenaError::Corrupted {
            index,
            detail: format!("canary 0x{:08x}, expected 0x{:08x}", found, expected),
        });
    }
    match slot[USED_OFFSET] {
        0 => Ok(SlotState::Free),
        1 => Ok(SlotState::Occupied),
        other => Err(ArenaError::Corrupted {
            index,
            detail: format!("used flag {}", other),
        }),
    }
}

/// Writes a fresh header. Used when the segment is created.
pub(crate) fn stamp(slot: &mut [u8], object_type: ObjectType) {
    LittleEndian::write_u32(&mut slot[..4], canary_for(object_type));
    slot[USED_OFFSET..SLOT_HEADER_LEN].fill(0);
}

pub(crate) fn set_used(slot: &mut [u8], used: bool) {
    slot[USED_OFFSET] = u8::from(used);
}

/// Reuse generation of a slot whose header has been validated.
pub(crate) fn generation(slot: &[u8]) -> u16 {
    LittleEndian::read_u16(&slot[GENERATION_OFFSET..SLOT_HEADER_LEN])
}

/// Advances the generation so handles issued before a `free` go stale.
pub(crate) fn bump_generation(slot: &mut [u8]) {
    let next = generation(slot).wrapping_add(1);
    LittleEndian::write_u16(&mut slot[GENERATION_OFFSET..SLOT_HEADER_LEN], next);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canary_distinct_and_non_zero() {
        let mut seen = std::collections::HashSet::new();
        for id in 1..=u16::MAX {
            let canary = canary_for(ObjectType::new(id));
            assert_ne!(canary, 0);
            assert!(seen.insert(canary));
        }
    }

    #[test]
    fn test_stamp_then_validate() {
        let ty = ObjectType::new(5);
        let index = ArenaIndex::new(ty, 0);
        let mut slot = [0u8; 16];

        assert!(validate(&slot, index).unwrap_err().is_corruption());

        stamp(&mut slot, ty);
        assert_eq!(validate(&slot, index).unwrap(), SlotState::Free);

        set_used(&mut slot, true);
        assert_eq!(validate(&slot, index).unwrap(), SlotState::Occupied);
    }

    #[test]
    fn test_foreign_canary_is_corruption() {
        let mut slot = [0u8; 16];
        stamp(&mut slot, ObjectType::new(1));
        set_used(&mut slot, true);

        // Same bytes presented as a slot of another type
        let forged = ArenaIndex::new(ObjectType::new(2), 0);
        assert!(validate(&slot, forged).unwrap_err().is_corruption());
    }

    #[test]
    fn test_garbage_used_flag_is_corruption() {
        let ty = ObjectType::new(1);
        let mut slot = [0u8; 16];
        stamp(&mut slot, ty);
        slot[USED_OFFSET] = 0x7f;
        let err = validate(&slot, ArenaIndex::new(ty, 0)).unwrap_err();
        assert!(err.to_string().contains("used flag 127"));
    }

    #[test]
    fn test_generation_survives_used_flag() {
        let ty = ObjectType::new(1);
        let mut slot = [0u8; 16];
        stamp(&mut slot, ty);
        assert_eq!(generation(&slot), 0);

        bump_generation(&mut slot);
        bump_generation(&mut slot);
        set_used(&mut slot, true);
        assert_eq!(generation(&slot), 2);
        assert_eq!(validate(&slot, ArenaIndex::new(ty, 0)).unwrap(), SlotState::Occupied);

        // Wraps instead of overflowing
        LittleEndian::write_u16(&mut slot[GENERATION_OFFSET..SLOT_HEADER_LEN], u16::MAX);
        bump_generation(&mut slot);
        assert_eq!(generation(&slot), 0);
    }
}
