#![doc = env!("CARGO_PKG_DESCRIPTION")]

#[doc(inline)]
pub use qpu_device as device;

#[doc(inline)]
pub use qpu_tensor as tensor;

#[doc(inline)]
pub use qpu_blas as blas;
