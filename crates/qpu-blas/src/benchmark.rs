use std::time::{Duration, Instant};

use qpu_device::Device;
use qpu_tensor::{verify, Buffer, Comparison, Dimensions, DEFAULT_TOLERANCE};

use crate::{
    dispatch::{qpu_sgemm, DispatchOptions, DispatchReport},
    error::{BenchmarkError, DispatchError},
    gemm::{library_sgemm, naive_sgemm, Order, Transpose},
    program::QpuProgram,
};

/// The problem the harness runs.
///
/// The defaults are the first convolution layer of a classic image network unrolled into a
/// matrix product: 3025 patches of 363 values against 96 filters.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    /// Rows of the input, one per patch.
    pub input_height: usize,
    /// Values per patch, the shared dimension of the product.
    pub input_channels: usize,
    /// Rows of the weights, one per filter.
    pub output_channels: usize,
    /// Lowest random operand value.
    pub min_value: f32,
    /// Upper bound of the random operand values.
    pub max_value: f32,
    /// Largest absolute difference still counted as agreement.
    pub tolerance: f32,
    /// Render the outputs to stderr with at most this many elements each.
    pub print_max_elements: Option<usize>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            input_height: 3025,
            input_channels: 363,
            output_channels: 96,
            min_value: 0.0,
            max_value: 1.0,
            tolerance: DEFAULT_TOLERANCE,
            print_max_elements: None,
        }
    }
}

/// Timings and agreement of the three GEMM paths.
#[derive(Debug)]
pub struct BenchmarkReport {
    /// Time spent in the naive oracle.
    pub naive_elapsed: Duration,
    /// Time spent in the library oracle.
    pub library_elapsed: Duration,
    /// Outcome of the QPU dispatch.
    pub dispatch: Result<DispatchReport, DispatchError>,
    /// Naive output against the QPU output.
    pub naive_vs_qpu: Comparison,
    /// Library output against the QPU output.
    pub library_vs_qpu: Comparison,
}

impl BenchmarkReport {
    /// Returns true if the QPU ran and both oracles agree with it.
    pub fn passed(&self) -> bool {
        self.dispatch.is_ok() && self.naive_vs_qpu.is_close() && self.library_vs_qpu.is_close()
    }
}

/// Runs the naive, QPU and library products on one random problem and compares them.
///
/// The weights are the `A` operand, used transposed, and the input is `B`, so the output
/// holds one row of `output_channels` values per input row. A failed dispatch is recorded
/// in the report rather than aborting, and the comparisons then show the disagreement. All
/// buffers are released before returning, whatever the outcome.
///
/// # Errors
///
/// Returns an error if an operand cannot be allocated.
pub fn run_gemm_benchmark<D: Device>(
    device: &D,
    program: &QpuProgram,
    options: &DispatchOptions,
    config: &BenchmarkConfig,
) -> Result<BenchmarkReport, BenchmarkError> {
    let named = |dims: [usize; 2], name: &str| -> Result<Buffer<D>, BenchmarkError> {
        let mut buffer = Buffer::new(Dimensions::from(dims), device)?;
        buffer.set_name(name);
        Ok(buffer)
    };

    let mut input = named([config.input_height, config.input_channels], "input")?;
    input.populate_with_random_values(config.min_value, config.max_value);
    let mut weights = named([config.output_channels, config.input_channels], "weights")?;
    weights.populate_with_random_values(config.min_value, config.max_value);

    let output_dims = [config.input_height, config.output_channels];
    let mut naive_output = named(output_dims, "naive_output")?;
    let mut qpu_output = named(output_dims, "qpu_output")?;
    let mut library_output = named(output_dims, "library_output")?;

    let m = config.output_channels;
    let n = config.input_height;
    let k = config.input_channels;
    let (lda, ldb, ldc) = (k, k, m);
    log::info!("GEMM m={m} n={n} k={k}: {weights} x {input}");

    let start = Instant::now();
    naive_sgemm(
        Order::ColMajor,
        Transpose::Trans,
        Transpose::NoTrans,
        m,
        n,
        k,
        1.0,
        weights.as_slice(),
        lda,
        input.as_slice(),
        ldb,
        0.0,
        naive_output.as_mut_slice(),
        ldc,
    );
    let naive_elapsed = start.elapsed();
    log::info!("Naive took {}ms", naive_elapsed.as_millis());

    let dispatch = qpu_sgemm(
        device,
        program,
        options,
        Order::ColMajor,
        Transpose::Trans,
        Transpose::NoTrans,
        m,
        n,
        k,
        1.0,
        &weights,
        lda,
        &input,
        ldb,
        0.0,
        &mut qpu_output,
        ldc,
    );

    let start = Instant::now();
    library_sgemm(
        Order::ColMajor,
        Transpose::Trans,
        Transpose::NoTrans,
        m,
        n,
        k,
        1.0,
        weights.as_slice(),
        lda,
        input.as_slice(),
        ldb,
        0.0,
        library_output.as_mut_slice(),
        ldc,
    );
    let library_elapsed = start.elapsed();
    log::info!("Library took {}ms", library_elapsed.as_millis());

    let naive_vs_qpu = verify(&naive_output, &qpu_output, config.tolerance)?;
    let library_vs_qpu = verify(&library_output, &qpu_output, config.tolerance)?;

    if let Some(max_elements) = config.print_max_elements {
        for output in [&naive_output, &qpu_output, &library_output] {
            output.print_contents(max_elements);
        }
    }

    Ok(BenchmarkReport {
        naive_elapsed,
        library_elapsed,
        dispatch,
        naive_vs_qpu,
        library_vs_qpu,
    })
}
