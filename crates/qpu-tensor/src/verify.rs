use qpu_device::DeviceAllocator;

use crate::{buffer::Buffer, error::TensorError};

/// Tolerance used when none is given.
pub const DEFAULT_TOLERANCE: f32 = 1e-6;

/// The outcome of an element-wise comparison of two buffers of the same shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    /// Number of elements compared.
    pub element_count: usize,
    /// Number of elements whose absolute difference exceeds the tolerance.
    pub different_count: usize,
    /// Sum of the finite absolute differences.
    pub total_delta: f64,
    /// Tolerance the comparison was made with.
    pub tolerance: f32,
}

impl Comparison {
    /// Returns true if every element is within the tolerance.
    pub fn is_close(&self) -> bool {
        self.different_count == 0
    }

    /// Returns the share of differing elements, in percent.
    pub fn different_percentage(&self) -> f64 {
        100.0 * self.different_count as f64 / self.element_count as f64
    }

    /// Returns the mean absolute difference over all elements.
    pub fn mean_delta(&self) -> f64 {
        self.total_delta / self.element_count as f64
    }
}

/// Returns the elements as `f32`; reduced-precision buffers yield their stored codes.
fn element_values<A: DeviceAllocator>(buffer: &Buffer<A>) -> Vec<f32> {
    let bytes = buffer.as_bytes();
    match buffer.bits_per_element() {
        8 => bytes.iter().map(|&code| code as f32).collect(),
        16 => bytes
            .chunks_exact(2)
            .map(|w| u16::from_ne_bytes([w[0], w[1]]) as f32)
            .collect(),
        _ => buffer.as_slice().to_vec(),
    }
}

/// Compares two buffers element by element.
///
/// An element differs when its absolute difference is above `tolerance`. A NaN only
/// matches a NaN with the same bit pattern, so a buffer always matches itself.
/// Reduced-precision buffers are compared by their stored codes.
///
/// # Errors
///
/// Returns an error if the buffers differ in rank, in any extent or in element width.
/// No element is read in that case.
pub fn compare<A: DeviceAllocator, B: DeviceAllocator>(
    a: &Buffer<A>,
    b: &Buffer<B>,
    tolerance: f32,
) -> Result<Comparison, TensorError> {
    let (a_dims, b_dims) = (a.dims(), b.dims());
    if a_dims.rank() != b_dims.rank() {
        return Err(TensorError::RankMismatch(a.debug_string(), b.debug_string()));
    }
    if a_dims != b_dims {
        return Err(TensorError::ShapeMismatch(a.debug_string(), b.debug_string()));
    }
    if a.bits_per_element() != b.bits_per_element() {
        let width = if a.bits_per_element() == 32 {
            b.bits_per_element()
        } else {
            a.bits_per_element()
        };
        return Err(TensorError::UnsupportedBitWidth(width));
    }

    let mut comparison = Comparison {
        element_count: a_dims.element_count(),
        different_count: 0,
        total_delta: 0.0,
        tolerance,
    };
    let (a_values, b_values) = (element_values(a), element_values(b));
    for (&a_value, &b_value) in a_values.iter().zip(&b_values) {
        let delta = (a_value - b_value).abs();
        if delta.is_nan() {
            if a_value.to_bits() != b_value.to_bits() {
                comparison.different_count += 1;
            }
            continue;
        }
        if delta > tolerance {
            comparison.different_count += 1;
        }
        comparison.total_delta += delta as f64;
    }
    Ok(comparison)
}

/// Compares two buffers like [`compare`] and logs a warning when they disagree.
///
/// The warning carries the share of differing elements and the mean difference. A
/// mismatch is never treated as fatal.
///
/// # Errors
///
/// Returns an error if the buffers differ in rank, in any extent or in element width.
pub fn verify<A: DeviceAllocator, B: DeviceAllocator>(
    a: &Buffer<A>,
    b: &Buffer<B>,
    tolerance: f32,
) -> Result<Comparison, TensorError> {
    let comparison = compare(a, b, tolerance)?;
    if !comparison.is_close() {
        log::warn!(
            "Buffers contained {:.6}% different values ({}), mean delta = {:.6} - {} vs {}",
            comparison.different_percentage(),
            comparison.different_count,
            comparison.mean_delta(),
            a,
            b
        );
    }
    Ok(comparison)
}

/// Returns true if both buffers have the same shape and every element is within
/// `tolerance`.
///
/// Mismatches are logged as in [`verify`].
///
/// # Example
///
/// ```
/// use qpu_device::FakeDevice;
/// use qpu_tensor::{all_close, Buffer, Dimensions, DEFAULT_TOLERANCE};
///
/// let device = FakeDevice::new();
/// let mut a = Buffer::new(Dimensions::from([4]), &device).unwrap();
/// let mut b = Buffer::new(Dimensions::from([4]), &device).unwrap();
/// a.fill(1.0);
/// b.fill(1.0);
/// assert!(all_close(&a, &b, DEFAULT_TOLERANCE));
/// b.as_mut_slice()[2] = 1.5;
/// assert!(!all_close(&a, &b, DEFAULT_TOLERANCE));
/// ```
pub fn all_close<A: DeviceAllocator, B: DeviceAllocator>(
    a: &Buffer<A>,
    b: &Buffer<B>,
    tolerance: f32,
) -> bool {
    match verify(a, b, tolerance) {
        Ok(comparison) => comparison.is_close(),
        Err(e) => {
            log::warn!("{e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dims::Dimensions;
    use approx::assert_relative_eq;
    use qpu_device::FakeDevice;

    fn buffer(device: &FakeDevice, dims: Dimensions, values: &[f32]) -> Buffer<FakeDevice> {
        let mut buffer = Buffer::new(dims, device).expect("allocation");
        buffer.as_mut_slice().copy_from_slice(values);
        buffer
    }

    #[test]
    fn test_all_close_is_reflexive() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut x = Buffer::new(Dimensions::from([16, 16]), &device)?;
        x.populate_with_random_values(-100.0, 100.0);
        x.as_mut_slice()[3] = f32::NAN;
        for tolerance in [0.0, 1e-6, 1.0] {
            assert!(all_close(&x, &x, tolerance));
        }
        Ok(())
    }

    #[test]
    fn test_single_difference_is_counted() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let dims = Dimensions::from([2, 2]);
        let a = buffer(&device, dims, &[1.0, 2.0, 3.0, 4.0]);
        let b = buffer(&device, dims, &[1.0, 2.0, 3.5, 4.0]);

        assert!(!all_close(&a, &b, 0.1));
        let comparison = compare(&a, &b, 0.1)?;
        assert_eq!(comparison.different_count, 1);
        assert_relative_eq!(comparison.different_percentage(), 25.0);
        assert_relative_eq!(comparison.mean_delta(), 0.125);

        assert!(all_close(&a, &b, 0.5));
        Ok(())
    }

    #[test]
    fn test_nan_differs_from_number() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let dims = Dimensions::from([2]);
        let a = buffer(&device, dims, &[1.0, 2.0]);
        let b = buffer(&device, dims, &[1.0, f32::NAN]);
        assert_eq!(compare(&a, &b, 1.0)?.different_count, 1);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_reads_nothing() {
        let device = FakeDevice::new();
        let a = buffer(&device, Dimensions::from([6]), &[0.0; 6]);
        let b = buffer(&device, Dimensions::from([2, 3]), &[0.0; 6]);
        let c = buffer(&device, Dimensions::from([3, 2]), &[0.0; 6]);
        let d = buffer(&device, Dimensions::from([2]), &[0.0; 2]);

        assert!(matches!(compare(&a, &b, 0.0), Err(TensorError::RankMismatch(..))));
        assert!(matches!(compare(&b, &c, 0.0), Err(TensorError::ShapeMismatch(..))));
        assert!(matches!(compare(&a, &d, 0.0), Err(TensorError::ShapeMismatch(..))));
        assert!(!all_close(&a, &d, 0.0));
        assert!(!all_close(&b, &c, 1.0));
    }

    #[test]
    fn test_quantized_buffers_compare_by_code() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let dims = Dimensions::from([4]);
        let q8 = Buffer::new_quantized(dims, 0.0, 1.0, 8, &device)?;
        assert!(all_close(&q8, &q8, 0.0));

        let mut q16 = Buffer::new_quantized(dims, 0.0, 1.0, 16, &device)?;
        let other = Buffer::new_quantized(dims, 0.0, 1.0, 16, &device)?;
        let bus = q16.bus_address().expect("owned buffers are shared");
        device.write_word(bus, 0x0003_0000)?;
        assert!(all_close(&q16, &q16, 0.0));
        assert_eq!(compare(&q16, &other, 2.0)?.different_count, 1);
        assert!(all_close(&q16, &other, 3.0));

        let f = buffer(&device, dims, &[0.0; 4]);
        assert!(matches!(
            compare(&f, &q8, 1.0),
            Err(TensorError::UnsupportedBitWidth(8))
        ));
        assert!(!all_close(&q8, &f, 1.0));
        q16.set_name("q16");
        assert!(!all_close(&q16, &q8, 1.0));
        Ok(())
    }
}
