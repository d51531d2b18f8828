//! Safe Rust bindings for the SAI BFD offload surface.
//!
//! This crate provides type-safe wrappers around the parts of the SAI C API
//! the BFD daemon touches: object identifiers, adapter errors, and the
//! transmit/receive session offload contract.
//!
//! # Architecture
//!
//! - [`types`]: type-safe object IDs and SAI enum values
//! - [`error`]: adapter error type
//! - [`api`]: the BFD offload contract and a software implementation
//!
//! # Example
//!
//! ```
//! use sonic_sai::api::{BfdOffloadApi, BfdOffloadSession, SoftwareBfdOffload};
//! use sonic_sai::SaiResult;
//!
//! fn announce(api: &dyn BfdOffloadApi, session: &BfdOffloadSession) -> SaiResult<()> {
//!     let tx = api.create_or_edit_tx(session)?;
//!     assert!(tx.is_valid());
//!     Ok(())
//! }
//!
//! let api = SoftwareBfdOffload::new();
//! announce(&api, &BfdOffloadSession::default()).unwrap();
//! ```

pub mod api;
pub mod error;
pub mod types;

pub use types::{
    BfdRxSessionKind, BfdRxSessionOid, BfdSessionKind, BfdSessionOid, BfdTxSessionKind,
    BfdTxSessionOid, RawSaiObjectId, SaiBfdSessionState, SaiObjectId, SaiObjectKind,
};

pub use error::{SaiError, SaiResult};
