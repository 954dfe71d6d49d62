#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `qpu-device` is the lowest layer of the workspace. It models the two capabilities the
//! host needs from the co-processor: memory that is addressable by both the ARM core and
//! the QPUs, and a way to start a batch of QPU programs and wait for them to finish.
//!
//! # Architecture
//!
//! - **DeviceAllocator**: allocate, lock, map and release shared memory
//! - **DeviceAllocation**: RAII owner of one locked and mapped region
//! - **DeviceControl**: enable, disable and execute
//! - **DeviceClaim**: guard that keeps the QPUs enabled for its lifetime
//! - **Mailbox**: hardware backend talking to the VideoCore firmware (Linux only)
//! - **FakeDevice**: deterministic in-memory backend for tests and development hosts
//!
//! # Quick Start
//!
//! ```rust
//! use qpu_device::{DeviceAllocation, FakeDevice};
//!
//! let device = FakeDevice::new();
//! let mut region = DeviceAllocation::new(&device, 64, 4096).unwrap();
//! region.as_bytes_mut()[0] = 42;
//! assert_eq!(region.as_bytes()[0], 42);
//! drop(region);
//! assert!(device.stats().is_balanced());
//! ```

/// Allocator module containing the shared memory abstraction.
///
/// This module provides the [`DeviceAllocator`] trait and the [`DeviceAllocation`] owner.
pub mod allocator;

/// Control module containing the job execution abstraction.
pub mod control;

/// Error types for device operations.
pub mod error;

/// In-memory device used when no VideoCore is present.
pub mod fake;

/// VideoCore property mailbox backend.
#[cfg(target_os = "linux")]
pub mod mailbox;

pub use crate::allocator::{BusAddress, DeviceAllocation, DeviceAllocator, MemHandle};
pub use crate::control::{Device, DeviceClaim, DeviceControl};
pub use crate::error::DeviceError;
pub use crate::fake::{FakeDevice, FakeExecution, FakeStats, WorkerLaunch};
#[cfg(target_os = "linux")]
pub use crate::mailbox::{Mailbox, MailboxConfig};

/// Alignment used for every shared allocation, matching the firmware page size.
pub const DEFAULT_ALIGNMENT: usize = 4096;
