//! # CONDUIT Core
//!
//! Foundational types shared by the hardware layer and the command
//! submission layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      conduit-core                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │   Ring / Sync       │  │
//! │  │  (taxonomy, │  │ (GpuAddr,   │  │ (RingIndex, gates,  │  │
//! │  │   kinds)    │  │  ByteSize)  │  │  spin loops)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod ring;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, ErrorKind, Result};
pub use ring::{Ring, RingIndex, SENTINEL_SLOTS};
pub use sync::{AdmissionLock, CountingGate, LockKind, SpinConfig, SpinLoop};
pub use types::*;
