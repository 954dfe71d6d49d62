#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! [`qpu_sgemm`] runs `C := alpha * Aᵀ * B + beta * C` on the twelve QPUs of the
//! VideoCore IV, with the operands in shared [`qpu_tensor::Buffer`]s. [`naive_sgemm`] and
//! [`library_sgemm`] compute the same product on the ARM core and serve as correctness
//! and timing references. [`run_gemm_benchmark`] ties the three together.
//!
//! # Quick Start
//!
//! ```rust
//! use qpu_blas::emulator::sgemm_emulator;
//! use qpu_blas::{qpu_sgemm, DispatchOptions, Order, QpuProgram, Transpose};
//! use qpu_device::FakeDevice;
//! use qpu_tensor::{Buffer, Dimensions};
//!
//! let device = FakeDevice::new().with_execution(sgemm_emulator());
//! let program = QpuProgram::from_words("sgemm", &[0, 0], 32).unwrap();
//!
//! // A is stored k x m = 3 x 2, B is k x n = 3 x 2, C is m x n = 2 x 2
//! let mut a = Buffer::new(Dimensions::from([2, 3]), &device).unwrap();
//! let mut b = Buffer::new(Dimensions::from([2, 3]), &device).unwrap();
//! let mut c = Buffer::new(Dimensions::from([2, 2]), &device).unwrap();
//! a.fill(1.0);
//! b.fill(2.0);
//!
//! qpu_sgemm(
//!     &device, &program, &DispatchOptions::default(),
//!     Order::ColMajor, Transpose::Trans, Transpose::NoTrans,
//!     2, 2, 3,
//!     1.0, &a, 3, &b, 3,
//!     0.0, &mut c, 2,
//! ).unwrap();
//! assert_eq!(c.as_slice(), &[6.0; 4]);
//! ```

/// The GEMM benchmark harness.
pub mod benchmark;

/// QPU job dispatch.
pub mod dispatch;

/// Host emulation of the float GEMM program.
pub mod emulator;

/// Error types for dispatches and the harness.
pub mod error;

/// CPU GEMM oracles and the CBLAS enums.
pub mod gemm;

/// Layout of the composite job region.
pub mod layout;

/// The per-worker parameter table.
pub mod params;

/// QPU program blobs.
pub mod program;

pub use crate::benchmark::{run_gemm_benchmark, BenchmarkConfig, BenchmarkReport};
pub use crate::dispatch::{qpu_sgemm, DispatchOptions, DispatchReport, SCRATCH_SENTINEL};
pub use crate::error::{BenchmarkError, DispatchError};
pub use crate::gemm::{library_sgemm, naive_sgemm, Order, Transpose};
pub use crate::layout::{JobLayout, Span};
pub use crate::params::{ParameterTable, UNIFORM_COUNT};
pub use crate::program::QpuProgram;
