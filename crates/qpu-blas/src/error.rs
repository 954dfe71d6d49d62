use qpu_device::DeviceError;
use qpu_tensor::TensorError;
use thiserror::Error;

/// An error type for QPU dispatches.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A device primitive failed, including the QPUs being claimed elsewhere and the
    /// job timing out.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// An operand has no bus address the QPUs could reach.
    #[error("{0} is not resident in shared memory")]
    NotDeviceResident(String),

    /// The program was built for a different element width than the operand holds.
    #[error("Program {program} expects {expected}-bit elements, {buffer} has {actual}")]
    UnsupportedElementWidth {
        /// Program name.
        program: String,
        /// Operand description.
        buffer: String,
        /// Element width the program reads.
        expected: u32,
        /// Element width of the operand.
        actual: u32,
    },

    /// The program code is larger than the QPU code window.
    #[error("Program {name} is {size} bytes, the limit is {limit}")]
    ProgramTooLarge {
        /// Program name.
        name: String,
        /// Code size in bytes.
        size: usize,
        /// Largest accepted size in bytes.
        limit: usize,
    },

    /// The program code is empty or not a whole number of instructions.
    #[error("Invalid program {0}: code must be a non-empty sequence of 64-bit instructions")]
    InvalidProgram(String),

    /// A size or leading dimension does not fit in a 32-bit uniform.
    #[error("{name} = {value} does not fit in a uniform")]
    ArgumentOutOfRange {
        /// Argument name.
        name: &'static str,
        /// Rejected value.
        value: usize,
    },

    /// The program file could not be read.
    #[error("Failed to read program: {0}")]
    Io(#[from] std::io::Error),
}

/// An error type for the benchmark harness.
#[derive(Debug, Error)]
pub enum BenchmarkError {
    /// An operand could not be allocated or the outputs could not be compared.
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// The QPU dispatch failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
