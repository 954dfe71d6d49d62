use std::time::{Duration, Instant};

use qpu_device::{BusAddress, Device, DeviceAllocation, DeviceClaim, DEFAULT_ALIGNMENT};
use qpu_tensor::Buffer;

use crate::{
    error::DispatchError,
    gemm::{required_len, Order, Transpose},
    layout::JobLayout,
    params::{ParameterTable, UNIFORM_COUNT},
    program::QpuProgram,
};

/// Value the scratch areas hold before the workers start.
pub const SCRATCH_SENTINEL: u32 = 0xdead_beef;

/// Options controlling one QPU dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// Number of QPUs to start.
    pub worker_count: u32,
    /// How long to wait for all workers to finish.
    pub timeout: Duration,
    /// Skip the L2 cache flush before starting.
    pub no_flush: bool,
    /// Fill the scratch areas with [`SCRATCH_SENTINEL`] and read them back afterwards.
    pub debug_scratch: bool,
    /// Words of scratch each worker gets for diagnostics.
    pub scratch_words: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            worker_count: 12,
            timeout: Duration::from_millis(10_000),
            no_flush: true,
            debug_scratch: false,
            scratch_words: 16,
        }
    }
}

impl DispatchOptions {
    /// Sets the number of QPUs to start.
    pub fn with_worker_count(mut self, worker_count: u32) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Sets the completion timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets whether the L2 cache flush is skipped.
    pub fn with_no_flush(mut self, no_flush: bool) -> Self {
        self.no_flush = no_flush;
        self
    }

    /// Sets whether the scratch areas are sentinel-filled and read back.
    pub fn with_debug_scratch(mut self, debug_scratch: bool) -> Self {
        self.debug_scratch = debug_scratch;
        self
    }

    /// Sets the scratch size per worker, in words.
    pub fn with_scratch_words(mut self, scratch_words: usize) -> Self {
        self.scratch_words = scratch_words;
        self
    }
}

/// What a successful dispatch reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// The region plan used.
    pub layout: JobLayout,
    /// Time from claiming the QPUs to releasing them.
    pub elapsed: Duration,
    /// The scratch words of each worker as read back after execution. Empty unless
    /// [`DispatchOptions::debug_scratch`] is set.
    pub scratch: Vec<Vec<u32>>,
}

impl DispatchReport {
    /// Returns true if `worker` changed its first scratch word.
    pub fn worker_touched_scratch(&self, worker: usize) -> bool {
        self.scratch
            .get(worker)
            .and_then(|words| words.first())
            .is_some_and(|&w| w != SCRATCH_SENTINEL)
    }

    /// Renders the scratch dump, one line per word.
    pub fn scratch_dump(&self) -> String {
        let mut out = String::new();
        for (worker, words) in self.scratch.iter().enumerate() {
            for (index, &word) in words.iter().enumerate() {
                out.push_str(&scratch_line(worker, index, word));
                out.push('\n');
            }
        }
        out
    }
}

fn scratch_line(worker: usize, index: usize, word: u32) -> String {
    format!(
        "{worker}:{index}={:.6} (0x{word:08x}, {})",
        f32::from_bits(word),
        word as i32
    )
}

fn uniform(name: &'static str, value: usize) -> Result<u32, DispatchError> {
    u32::try_from(value).map_err(|_| DispatchError::ArgumentOutOfRange { name, value })
}

fn device_address<A: Device>(buffer: &Buffer<A>) -> Result<BusAddress, DispatchError> {
    buffer.bus_address().ok_or_else(|| {
        let e = DispatchError::NotDeviceResident(buffer.debug_string());
        log::error!("{e}");
        e
    })
}

fn write_words(bytes: &mut [u8], words: &[u32]) {
    for (dst, word) in bytes.chunks_exact_mut(4).zip(words) {
        dst.copy_from_slice(&word.to_ne_bytes());
    }
}

fn read_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

/// Computes `C := alpha * Aᵀ * B + beta * C` on the QPUs.
///
/// All three operands must live in shared memory. `A` is stored `k` x `m` column-major
/// with leading dimension `lda` and may be quantized if the program reads quantized
/// elements; `B` is `k` x `n` and `C` is `m` x `n`, both column-major 32-bit floats.
/// When the call returns successfully the product is in `C`.
///
/// The QPUs are claimed before anything is allocated, then one region holding the trigger
/// messages, the code, one parameter table per worker and one scratch area per worker is
/// built and all workers are started in a single blocking call. The region is released
/// and the QPUs disabled on every path out of this function. With
/// [`DispatchOptions::debug_scratch`] the scratch areas start out holding
/// [`SCRATCH_SENTINEL`] and are copied into the report and the debug log afterwards.
///
/// # Panics
///
/// Panics unless `order` is [`Order::ColMajor`], `trans_a` is [`Transpose::Trans`] and
/// `trans_b` is [`Transpose::NoTrans`], or if an operand is too small for its shape.
///
/// # Errors
///
/// Returns an error if `options` asks for zero workers, if an operand is not device
/// resident, if the program and `A`
/// disagree on the element width, if the QPUs cannot be claimed, if the job region
/// cannot be allocated, or if the workers fail or time out. Failures are not retried.
#[allow(clippy::too_many_arguments)]
pub fn qpu_sgemm<D: Device>(
    device: &D,
    program: &QpuProgram,
    options: &DispatchOptions,
    order: Order,
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &Buffer<D>,
    lda: usize,
    b: &Buffer<D>,
    ldb: usize,
    beta: f32,
    c: &mut Buffer<D>,
    ldc: usize,
) -> Result<DispatchReport, DispatchError> {
    assert_eq!(order, Order::ColMajor, "Unsupported order");
    assert_eq!(trans_a, Transpose::Trans, "Unsupported transpose for A");
    assert_eq!(trans_b, Transpose::NoTrans, "Unsupported transpose for B");
    assert!(a.len() >= required_len(order, k, m, lda), "A size mismatch");
    assert!(b.len() >= required_len(order, k, n, ldb), "B size mismatch");
    assert!(c.len() >= required_len(order, m, n, ldc), "C size mismatch");

    if a.bits_per_element() != program.bits_per_element() {
        return Err(DispatchError::UnsupportedElementWidth {
            program: program.name().to_string(),
            buffer: a.debug_string(),
            expected: program.bits_per_element(),
            actual: a.bits_per_element(),
        });
    }
    if options.worker_count == 0 {
        return Err(DispatchError::ArgumentOutOfRange {
            name: "worker_count",
            value: 0,
        });
    }
    let a_bus = device_address(a)?;
    let b_bus = device_address(b)?;
    let c_bus = device_address(c)?;
    let (a_min, a_range) = a
        .quantization()
        .map_or((0.0, 1.0), |q| (q.min, q.range()));

    let base_table = ParameterTable {
        m: uniform("m", m)?,
        n: uniform("n", n)?,
        k: uniform("k", k)?,
        alpha,
        a: a_bus,
        a_min,
        a_range,
        lda: uniform("lda", lda)?,
        b: b_bus,
        ldb: uniform("ldb", ldb)?,
        beta,
        c: c_bus,
        ldc: uniform("ldc", ldc)?,
        scratch: BusAddress(0),
        worker_index: 0,
    };

    let start = Instant::now();
    let claim = DeviceClaim::acquire(device)?;

    let worker_count = options.worker_count as usize;
    let layout = JobLayout::plan(
        worker_count,
        program.len(),
        UNIFORM_COUNT,
        options.scratch_words,
    );
    log::debug!(
        "Job region for {}: {} bytes, {layout:?}",
        program.name(),
        layout.total_size()
    );

    let mut region = DeviceAllocation::new(claim.device(), layout.total_size(), DEFAULT_ALIGNMENT)
        .inspect_err(|e| log::error!("Failed to allocate the QPU job region: {e}"))?;
    let base = region.bus_address();
    log::debug!("Job region {:?} at {base}", region.handle());

    let fill = if options.debug_scratch {
        SCRATCH_SENTINEL
    } else {
        0
    };
    let bytes = region.as_bytes_mut();
    bytes[layout.code.range()].copy_from_slice(program.code());
    for worker in 0..worker_count {
        let scratch = layout.scratch_for(worker);
        write_words(&mut bytes[scratch.range()], &vec![fill; layout.scratch_words()]);

        let table = ParameterTable {
            scratch: if scratch.len == 0 {
                BusAddress(0)
            } else {
                base.offset(scratch.offset)
            },
            worker_index: worker as u32,
            ..base_table
        };
        let uniforms = layout.uniforms_for(worker);
        write_words(&mut bytes[uniforms.range()], &table.to_words());

        write_words(
            &mut bytes[layout.message(worker).range()],
            &[
                base.offset(uniforms.offset).as_u32(),
                base.offset(layout.code.offset).as_u32(),
            ],
        );
    }

    let result = claim.device().execute(
        options.worker_count,
        base.offset(layout.messages.offset),
        options.no_flush,
        options.timeout,
    );

    let scratch: Vec<Vec<u32>> = if options.debug_scratch {
        (0..worker_count)
            .map(|worker| read_words(&region.as_bytes()[layout.scratch_for(worker).range()]))
            .collect()
    } else {
        Vec::new()
    };
    for (worker, words) in scratch.iter().enumerate() {
        for (index, &word) in words.iter().enumerate() {
            log::debug!("{}", scratch_line(worker, index, word));
        }
    }

    drop(region);
    drop(claim);
    let elapsed = start.elapsed();
    log::info!("QPU took {}ms", elapsed.as_millis());

    result.inspect_err(|e| log::error!("QPU dispatch of {} failed: {e}", program.name()))?;

    Ok(DispatchReport {
        layout,
        elapsed,
        scratch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qpu_device::{DeviceError, FakeDevice, FakeExecution};
    use qpu_tensor::Dimensions;

    fn program() -> QpuProgram {
        QpuProgram::from_words("test", &[0, 0x1000_0000, 0, 0x3000_0000], 32)
            .expect("valid program")
    }

    fn operands(
        device: &FakeDevice,
        m: usize,
        n: usize,
        k: usize,
    ) -> (Buffer<FakeDevice>, Buffer<FakeDevice>, Buffer<FakeDevice>) {
        let tensor =
            |dims: [usize; 2]| Buffer::new(Dimensions::from(dims), device).expect("allocation");
        (tensor([m, k]), tensor([n, k]), tensor([n, m]))
    }

    #[test]
    fn test_uniforms_and_messages_reach_the_workers() -> Result<(), DispatchError> {
        let device = FakeDevice::new().with_execution(FakeExecution::Emulate(std::sync::Arc::new(
            |device: &FakeDevice, launch: &qpu_device::WorkerLaunch| -> Result<(), DeviceError> {
                let mut words = [0u32; UNIFORM_COUNT];
                for (i, word) in words.iter_mut().enumerate() {
                    *word = device.read_word(launch.uniforms.offset(i * 4))?;
                }
                let table = ParameterTable::from_words(&words);
                assert_eq!((table.m, table.n, table.k), (3, 4, 5));
                assert_eq!((table.lda, table.ldb, table.ldc), (5, 5, 3));
                assert_eq!(table.worker_index, launch.worker);
                assert_eq!(device.read_word(launch.code.offset(4))?, 0x1000_0000);
                assert_eq!(device.read_word(table.scratch)?, SCRATCH_SENTINEL);
                device.write_word(table.scratch, launch.worker * 10)
            },
        )));
        let (a, b, mut c) = operands(&device, 3, 4, 5);
        let options = DispatchOptions::default()
            .with_worker_count(4)
            .with_debug_scratch(true);

        let report = qpu_sgemm(
            &device,
            &program(),
            &options,
            Order::ColMajor,
            Transpose::Trans,
            Transpose::NoTrans,
            3,
            4,
            5,
            1.0,
            &a,
            5,
            &b,
            5,
            0.0,
            &mut c,
            3,
        )?;

        assert_eq!(report.scratch.len(), 4);
        assert_eq!(report.scratch[3][0], 30);
        assert_eq!(report.scratch[3][1], SCRATCH_SENTINEL);
        assert!((0..4).all(|w| report.worker_touched_scratch(w)));
        assert!(!report.worker_touched_scratch(4));
        assert!(report.scratch_dump().starts_with("0:0=0.000000 (0x00000000, 0)\n"));
        assert!(!device.is_enabled());
        assert_eq!(device.live_allocations(), 3);
        Ok(())
    }

    #[test]
    fn test_element_width_mismatch_is_rejected_before_claiming() -> Result<(), DispatchError> {
        let device = FakeDevice::new();
        let (a, b, mut c) = operands(&device, 2, 2, 2);
        let program = QpuProgram::from_words("q8", &[0, 0], 8)?;
        let result = qpu_sgemm(
            &device,
            &program,
            &DispatchOptions::default(),
            Order::ColMajor,
            Transpose::Trans,
            Transpose::NoTrans,
            2,
            2,
            2,
            1.0,
            &a,
            2,
            &b,
            2,
            0.0,
            &mut c,
            2,
        );
        assert!(matches!(
            result,
            Err(DispatchError::UnsupportedElementWidth {
                expected: 8,
                actual: 32,
                ..
            })
        ));
        assert_eq!(device.stats().enables, 0);
        Ok(())
    }

    #[test]
    fn test_host_only_operand_is_rejected() -> Result<(), DispatchError> {
        let device = FakeDevice::new();
        let (a, _, mut c) = operands(&device, 2, 2, 2);
        let mut host = vec![0.0f32; 4];
        // SAFETY: host outlives the buffer and holds 4 elements
        let b = unsafe {
            Buffer::<FakeDevice>::from_raw_parts(
                Dimensions::from([2, 2]),
                std::ptr::NonNull::new(host.as_mut_ptr()).expect("non-null"),
                None,
            )
        };
        let result = qpu_sgemm(
            &device,
            &program(),
            &DispatchOptions::default(),
            Order::ColMajor,
            Transpose::Trans,
            Transpose::NoTrans,
            2,
            2,
            2,
            1.0,
            &a,
            2,
            &b,
            2,
            0.0,
            &mut c,
            2,
        );
        assert!(matches!(result, Err(DispatchError::NotDeviceResident(_))));
        assert!(!device.is_enabled());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "Unsupported transpose for A")]
    fn test_untransposed_a_is_a_precondition() {
        let device = FakeDevice::new();
        let (a, b, mut c) = operands(&device, 2, 2, 2);
        let _ = qpu_sgemm(
            &device,
            &program(),
            &DispatchOptions::default(),
            Order::ColMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            2,
            2,
            2,
            1.0,
            &a,
            2,
            &b,
            2,
            0.0,
            &mut c,
            2,
        );
    }

    #[test]
    fn test_options_builder() {
        let options = DispatchOptions::default()
            .with_worker_count(4)
            .with_timeout(Duration::from_millis(5))
            .with_no_flush(false)
            .with_debug_scratch(true)
            .with_scratch_words(2);
        assert_eq!(options.worker_count, 4);
        assert_eq!(options.timeout, Duration::from_millis(5));
        assert!(!options.no_flush);
        assert!(options.debug_scratch);
        assert_eq!(options.scratch_words, 2);
        assert_eq!(DispatchOptions::default().worker_count, 12);
    }

    #[test]
    fn test_zero_workers_is_rejected_before_claiming() {
        let device = FakeDevice::new();
        let (a, b, mut c) = operands(&device, 2, 2, 2);
        let result = qpu_sgemm(
            &device,
            &program(),
            &DispatchOptions::default().with_worker_count(0),
            Order::ColMajor,
            Transpose::Trans,
            Transpose::NoTrans,
            2,
            2,
            2,
            1.0,
            &a,
            2,
            &b,
            2,
            0.0,
            &mut c,
            2,
        );
        assert!(matches!(
            result,
            Err(DispatchError::ArgumentOutOfRange {
                name: "worker_count",
                value: 0
            })
        ));
        assert_eq!(device.stats().enables, 0);
        assert_eq!(device.live_allocations(), 3);
    }

    #[test]
    fn test_scratch_line_matches_the_dump_format() {
        assert_eq!(scratch_line(0, 1, 0x3f80_0000), "0:1=1.000000 (0x3f800000, 1065353216)");
        assert_eq!(
            scratch_line(2, 0, SCRATCH_SENTINEL),
            format!("2:0={:.6} (0xdeadbeef, -559038737)", f32::from_bits(SCRATCH_SENTINEL))
        );
    }
}
