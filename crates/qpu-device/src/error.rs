use std::time::Duration;

use thiserror::Error;

use crate::allocator::BusAddress;

/// An error type for device memory and job control operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The firmware could not provide a region of the requested size.
    #[error("Unable to allocate {size} bytes of GPU memory")]
    AllocationFailed {
        /// Requested size in bytes
        size: usize,
    },

    /// The allocation exists but could not be locked to a bus address.
    #[error("Unable to lock GPU memory handle {0}")]
    LockFailed(u32),

    /// The bus address could not be mapped into the process.
    #[error("Unable to map {size} bytes at bus address {bus}")]
    MapFailed {
        /// Bus address that was requested
        bus: BusAddress,
        /// Size of the requested mapping in bytes
        size: usize,
    },

    /// The handle does not name a live allocation.
    #[error("Unknown GPU memory handle {0}")]
    InvalidHandle(u32),

    /// The bus address is not inside a locked allocation.
    #[error("Bus address {0} is not backed by a locked allocation")]
    InvalidAddress(BusAddress),

    /// Releasing a firmware resource reported a non-zero status.
    #[error("Mailbox {operation} failed with status {status:#x}")]
    ReleaseFailed {
        /// The release step that failed
        operation: &'static str,
        /// Status word returned by the firmware
        status: u32,
    },

    /// The QPUs are already claimed by another client.
    #[error("QPU is already in use")]
    Busy,

    /// Enabling the QPUs reported a non-zero status.
    #[error("QPU enable failed with status {0:#x}")]
    EnableFailed(u32),

    /// A job was submitted while the QPUs were not enabled.
    #[error("QPU is not enabled")]
    NotEnabled,

    /// The firmware reported that the job did not complete.
    #[error("QPU execution failed with status {0:#x}")]
    ExecutionFailed(u32),

    /// No completion was signalled before the timeout elapsed.
    #[error("QPU execution timed out after {0:?}")]
    Timeout(Duration),

    /// The mailbox or memory device node returned an OS error.
    #[error("Mailbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Returns true if the error means the device memory is exhausted.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }

    /// Returns true if the QPUs could not be claimed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Busy | Self::EnableFailed(_))
    }
}
