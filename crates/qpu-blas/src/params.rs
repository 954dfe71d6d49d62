use qpu_device::BusAddress;

/// Words in one parameter table.
pub const UNIFORM_COUNT: usize = 15;

/// The uniforms one worker reads when it starts, in the order the GEMM programs
/// consume them.
///
/// Floats travel as their raw bit patterns and addresses as bus addresses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterTable {
    /// Rows of `op(A)` and `C`.
    pub m: u32,
    /// Columns of `B` and `C`.
    pub n: u32,
    /// Columns of `op(A)`, rows of `B`.
    pub k: u32,
    /// Scale of the product.
    pub alpha: f32,
    /// Bus address of `A`.
    pub a: BusAddress,
    /// Value a quantized `A` element of zero stands for.
    pub a_min: f32,
    /// Span of values a quantized `A` covers.
    pub a_range: f32,
    /// Leading dimension of `A`.
    pub lda: u32,
    /// Bus address of `B`.
    pub b: BusAddress,
    /// Leading dimension of `B`.
    pub ldb: u32,
    /// Scale of the previous `C`.
    pub beta: f32,
    /// Bus address of `C`.
    pub c: BusAddress,
    /// Leading dimension of `C`.
    pub ldc: u32,
    /// Bus address of the worker's scratch area.
    pub scratch: BusAddress,
    /// Index of the worker in the batch.
    pub worker_index: u32,
}

impl ParameterTable {
    /// Encodes the table as the words written to shared memory.
    pub fn to_words(&self) -> [u32; UNIFORM_COUNT] {
        [
            self.m,
            self.n,
            self.k,
            self.alpha.to_bits(),
            self.a.as_u32(),
            self.a_min.to_bits(),
            self.a_range.to_bits(),
            self.lda,
            self.b.as_u32(),
            self.ldb,
            self.beta.to_bits(),
            self.c.as_u32(),
            self.ldc,
            self.scratch.as_u32(),
            self.worker_index,
        ]
    }

    /// Decodes a table read back from shared memory.
    pub fn from_words(words: &[u32; UNIFORM_COUNT]) -> Self {
        Self {
            m: words[0],
            n: words[1],
            k: words[2],
            alpha: f32::from_bits(words[3]),
            a: BusAddress(words[4]),
            a_min: f32::from_bits(words[5]),
            a_range: f32::from_bits(words[6]),
            lda: words[7],
            b: BusAddress(words[8]),
            ldb: words[9],
            beta: f32::from_bits(words[10]),
            c: BusAddress(words[11]),
            ldc: words[12],
            scratch: BusAddress(words[13]),
            worker_index: words[14],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order() {
        let table = ParameterTable {
            m: 96,
            n: 3025,
            k: 363,
            alpha: 1.0,
            a: BusAddress(0xc000_1000),
            a_min: 0.0,
            a_range: 1.0,
            lda: 363,
            b: BusAddress(0xc010_0000),
            ldb: 363,
            beta: 0.0,
            c: BusAddress(0xc020_0000),
            ldc: 96,
            scratch: BusAddress(0xc030_0040),
            worker_index: 7,
        };
        let words = table.to_words();
        assert_eq!(&words[..3], &[96, 3025, 363]);
        assert_eq!(words[3], 0x3f80_0000);
        assert_eq!(words[4], 0xc000_1000);
        assert_eq!(words[6], 0x3f80_0000);
        assert_eq!(words[10], 0);
        assert_eq!(words[13], 0xc030_0040);
        assert_eq!(words[14], 7);
        assert_eq!(ParameterTable::from_words(&words), table);
    }
}
