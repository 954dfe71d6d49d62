use qpu_device::DeviceError;
use thiserror::Error;

/// An error type for buffer operations.
#[derive(Debug, Error)]
pub enum TensorError {
    /// The shared memory backing the buffer could not be obtained.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Only 8, 16 and 32 bits per element are supported.
    #[error("Unsupported number of bits per element: {0}")]
    UnsupportedBitWidth(u32),

    /// The two buffers have different ranks.
    #[error("Buffers have different numbers of dimensions - {0} vs {1}")]
    RankMismatch(String, String),

    /// The two buffers have the same rank but different extents.
    #[error("Buffers are different sizes - {0} vs {1}")]
    ShapeMismatch(String, String),
}

impl TensorError {
    /// Returns true if the error means the device memory is exhausted.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::Device(e) => e.is_out_of_memory(),
            _ => false,
        }
    }
}
