#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! A [`Buffer`] is at the same time an `f32` array on the ARM side and a region the QPUs
//! reach by bus address. Both views refer to the same physical bytes, so a product the
//! QPUs write into a buffer is visible to the host without any copy.
//!
//! # Quick Start
//!
//! ```rust
//! use qpu_device::FakeDevice;
//! use qpu_tensor::{all_close, Buffer, Dimensions};
//!
//! let device = FakeDevice::new();
//! let mut a = Buffer::new(Dimensions::from([2, 3]), &device).unwrap();
//! a.set_name("a");
//! a.fill(1.0);
//! assert_eq!(a.as_slice(), &[1.0; 6]);
//! assert!(all_close(&a, &a, 0.0));
//! assert_eq!(a.debug_string(), "Buffer a - [2, 3]");
//! ```

/// Shared CPU/QPU buffer.
pub mod buffer;

/// Shape descriptor.
pub mod dims;

/// Error types for buffer operations.
pub mod error;

/// Tolerance-based buffer comparison.
pub mod verify;

pub use crate::buffer::{Buffer, Quantization};
pub use crate::dims::{Dimensions, MAX_DIMENSIONS};
pub use crate::error::TensorError;
pub use crate::verify::{all_close, compare, verify, Comparison, DEFAULT_TOLERANCE};
