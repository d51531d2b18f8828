//! Type-safe SAI object ID wrappers.
//!
//! BFD offload hands out three kinds of identifiers: the control-plane
//! session handle (which packs a shared-arena index) and the ASIC-resident
//! transmit and receive sessions. Keeping them as distinct types means a
//! receive handle can never be passed where a transmit handle is expected.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Raw SAI object ID type (matches sai_object_id_t in C).
pub type RawSaiObjectId = u64;

/// Marker trait for SAI object kinds.
pub trait SaiObjectKind: Send + Sync + 'static {
    /// Returns the SAI object type name for debugging.
    fn type_name() -> &'static str;
}

/// A type-safe SAI object ID.
///
/// # Examples
///
/// ```
/// use sonic_sai::{BfdRxSessionOid, BfdTxSessionOid};
///
/// let tx = BfdTxSessionOid::from_raw(0x2a).unwrap();
/// let rx = BfdRxSessionOid::from_raw(0x2a).unwrap();
///
/// // Same raw value, different types:
/// // fn takes_tx(_: BfdTxSessionOid) {}
/// // takes_tx(rx);  // Error: expected BfdTxSessionOid
/// assert_eq!(tx.as_raw(), rx.as_raw());
/// ```
#[derive(Clone, Copy)]
pub struct SaiObjectId<T: SaiObjectKind> {
    raw: RawSaiObjectId,
    _marker: PhantomData<T>,
}

impl<T: SaiObjectKind> SaiObjectId<T> {
    /// The null object ID (SAI_NULL_OBJECT_ID).
    pub const NULL: Self = Self {
        raw: 0,
        _marker: PhantomData,
    };

    /// Creates an object ID from a raw value, `None` for the null ID.
    pub fn from_raw(raw: RawSaiObjectId) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self {
                raw,
                _marker: PhantomData,
            })
        }
    }

    /// Creates an object ID from a raw value, including null.
    pub const fn from_raw_unchecked(raw: RawSaiObjectId) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub const fn as_raw(&self) -> RawSaiObjectId {
        self.raw
    }

    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }

    pub const fn is_valid(&self) -> bool {
        self.raw != 0
    }
}

impl<T: SaiObjectKind> fmt::Debug for SaiObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:016x})", T::type_name(), self.raw)
    }
}

impl<T: SaiObjectKind> fmt::Display for SaiObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.raw)
    }
}

impl<T: SaiObjectKind> PartialEq for SaiObjectId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: SaiObjectKind> Eq for SaiObjectId<T> {}

impl<T: SaiObjectKind> Hash for SaiObjectId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: SaiObjectKind> Default for SaiObjectId<T> {
    fn default() -> Self {
        Self::NULL
    }
}

// ============================================================================
// Object Kind Markers
// ============================================================================

macro_rules! define_object_kind {
    ($name:ident, $type_name:literal, $oid_alias:ident) => {
        /// Marker type for SAI $type_name objects.
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl SaiObjectKind for $name {
            fn type_name() -> &'static str {
                $type_name
            }
        }

        /// Type alias for $type_name object IDs.
        pub type $oid_alias = SaiObjectId<$name>;
    };
}

define_object_kind!(BfdSessionKind, "BfdSession", BfdSessionOid);
define_object_kind!(BfdTxSessionKind, "BfdTxSession", BfdTxSessionOid);
define_object_kind!(BfdRxSessionKind, "BfdRxSession", BfdRxSessionOid);

/// SAI BFD session state values (`sai_bfd_session_state_t`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SaiBfdSessionState {
    AdminDown = 0,
    #[default]
    Down = 1,
    Init = 2,
    Up = 3,
}

impl SaiBfdSessionState {
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::AdminDown),
            1 => Some(Self::Down),
            2 => Some(Self::Init),
            3 => Some(Self::Up),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}
