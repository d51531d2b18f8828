//! Safe wrappers for SAI API functions.
//!
//! - [`bfd`]: BFD transmit/receive session offload

pub mod bfd;

pub use bfd::{BfdOffloadApi, BfdOffloadSession, SoftwareBfdOffload};
