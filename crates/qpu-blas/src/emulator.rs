//! Host stand-in for the 32-bit float GEMM program.
//!
//! Installed on a [`FakeDevice`], it lets the dispatcher and the harness run end to end
//! without VideoCore hardware. Each worker reads its parameter table from the bus exactly
//! as the device program does and computes the output columns it owns.

use std::sync::Arc;

use qpu_device::{DeviceError, FakeDevice, FakeExecution, WorkerLaunch};

use crate::params::{ParameterTable, UNIFORM_COUNT};

/// Runs one worker of the float GEMM program against the fake's memory.
///
/// Worker `w` of `N` computes every column `j` of `C` with `j % N == w`, reading `A` as
/// stored `k` x `m` with leading dimension `lda`. With `k == 0` each column becomes
/// `beta * C`. It then writes its index and the number
/// of columns it computed into the first two words of its scratch area, which must hold
/// at least two words unless its address is zero.
///
/// # Errors
///
/// Returns [`DeviceError::InvalidAddress`] if the table points outside shared memory.
pub fn emulate_sgemm_worker(device: &FakeDevice, launch: &WorkerLaunch) -> Result<(), DeviceError> {
    let mut words = [0u32; UNIFORM_COUNT];
    for (i, word) in words.iter_mut().enumerate() {
        *word = device.read_word(launch.uniforms.offset(i * 4))?;
    }
    let table = ParameterTable::from_words(&words);
    let (m, n, k) = (table.m as usize, table.n as usize, table.k as usize);
    let (lda, ldb, ldc) = (table.lda as usize, table.ldb as usize, table.ldc as usize);

    let mut columns = 0u32;
    if m > 0 {
        let a = if k > 0 {
            device.read_f32s(table.a, lda * (m - 1) + k)?
        } else {
            Vec::new()
        };
        for j in (launch.worker as usize..n).step_by(launch.worker_count.max(1) as usize) {
            let b = device.read_f32s(table.b.offset(4 * ldb * j), k)?;
            let c_column = table.c.offset(4 * ldc * j);
            let previous = if table.beta == 0.0 {
                None
            } else {
                Some(device.read_f32s(c_column, m)?)
            };

            let column: Vec<f32> = (0..m)
                .map(|i| {
                    let total: f32 = match k {
                        0 => 0.0,
                        _ => a[lda * i..lda * i + k].iter().zip(&b).map(|(x, y)| x * y).sum(),
                    };
                    match &previous {
                        Some(c) => table.alpha * total + table.beta * c[i],
                        None => table.alpha * total,
                    }
                })
                .collect();
            device.write_f32s(c_column, &column)?;
            columns += 1;
        }
    }

    if table.scratch.as_u32() != 0 {
        device.write_word(table.scratch, table.worker_index)?;
        device.write_word(table.scratch.offset(4), columns)?;
    }
    Ok(())
}

/// Returns the execution behaviour that runs [`emulate_sgemm_worker`] for every worker.
///
/// # Example
///
/// ```
/// use qpu_blas::emulator::sgemm_emulator;
/// use qpu_device::FakeDevice;
///
/// let device = FakeDevice::new().with_execution(sgemm_emulator());
/// ```
pub fn sgemm_emulator() -> FakeExecution {
    FakeExecution::Emulate(Arc::new(emulate_sgemm_worker))
}
