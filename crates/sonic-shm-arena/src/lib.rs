//! Typed fixed-capacity object arenas in a shared memory segment.
//!
//! A segment holds one block of equally sized slots per registered object
//! type. Every slot carries a header with a canary derived from its type,
//! checked before the slot's contents are trusted; a damaged or forged
//! slot is reported as [`ArenaError::Corrupted`] and never read.
//!
//! # Architecture
//!
//! - [`layout`]: type registry, slot geometry and the on-segment header
//! - [`segment`]: the mapped segment, its lock and its attach lifecycle
//! - [`arena`]: allocate / free / access / find / free-count
//!
//! # Example
//!
//! ```
//! use sonic_shm_arena::{ArenaRead, ArenaWrite, ObjectType, SegmentLayout, SharedSegment};
//!
//! const ROUTE: ObjectType = ObjectType::new(1);
//!
//! let layout = SegmentLayout::builder()
//!     .register(ROUTE, "route", 32, 2)
//!     .build()
//!     .unwrap();
//! let segment = SharedSegment::anonymous(layout).unwrap();
//!
//! let index = segment.write().unwrap().allocate(ROUTE).unwrap();
//! assert_eq!(segment.read().unwrap().free_count(ROUTE).unwrap(), 1);
//!
//! segment.write().unwrap().free(index).unwrap();
//! assert!(segment.read().unwrap().access(index).is_err());
//! ```

pub mod arena;
pub mod error;
pub mod layout;
pub mod segment;
pub mod slot;

pub use arena::{ArenaObject, ArenaRead, ArenaWrite};
pub use error::{ArenaError, ArenaResult};
pub use layout::{ArenaIndex, ObjectType, SegmentHeader, SegmentLayout, TypeDescriptor};
pub use segment::{
    SegmentConfig, SegmentOrigin, SegmentReadGuard, SegmentWriteGuard, SharedSegment,
    DEFAULT_SEGMENT_PATH,
};
pub use slot::SlotState;
