use std::path::Path;

use crate::error::DispatchError;

/// Largest program accepted, in bytes.
pub const MAX_CODE_SIZE: usize = 8192;

/// Size of one QPU instruction in bytes.
pub const INSTRUCTION_SIZE: usize = 8;

/// A compiled QPU program.
///
/// The code is opaque to the host: it is copied into shared memory and started by bus
/// address. The element width records how the program reads its `A` operand, so a
/// float program is never handed a quantized matrix and the other way around.
///
/// # Example
///
/// ```
/// use qpu_blas::QpuProgram;
///
/// let program = QpuProgram::from_words("nop", &[0x0000_0000, 0x1000_0000], 32).unwrap();
/// assert_eq!(program.len(), 8);
/// assert_eq!(program.bits_per_element(), 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QpuProgram {
    name: String,
    code: Vec<u8>,
    bits_per_element: u32,
}

impl QpuProgram {
    /// Creates a program from its code bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is empty, not a whole number of instructions, or
    /// larger than [`MAX_CODE_SIZE`].
    pub fn new(
        name: impl Into<String>,
        code: Vec<u8>,
        bits_per_element: u32,
    ) -> Result<Self, DispatchError> {
        let name = name.into();
        if code.is_empty() || code.len() % INSTRUCTION_SIZE != 0 {
            return Err(DispatchError::InvalidProgram(name));
        }
        if code.len() > MAX_CODE_SIZE {
            return Err(DispatchError::ProgramTooLarge {
                name,
                size: code.len(),
                limit: MAX_CODE_SIZE,
            });
        }
        Ok(Self {
            name,
            code,
            bits_per_element,
        })
    }

    /// Creates a program from 32-bit code words, as an assembler emits them.
    pub fn from_words(
        name: impl Into<String>,
        words: &[u32],
        bits_per_element: u32,
    ) -> Result<Self, DispatchError> {
        let code = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        Self::new(name, code, bits_per_element)
    }

    /// Loads a program binary from disk. The file name becomes the program name.
    pub fn from_file(path: impl AsRef<Path>, bits_per_element: u32) -> Result<Self, DispatchError> {
        let path = path.as_ref();
        let code = std::fs::read(path)?;
        log::debug!("Loaded {} bytes of QPU code from {}", code.len(), path.display());
        Self::new(path.display().to_string(), code, bits_per_element)
    }

    /// Program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Code bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Code size in bytes.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Always false; empty programs are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Element width of the `A` operand the program reads.
    pub fn bits_per_element(&self) -> u32 {
        self.bits_per_element
    }
}
