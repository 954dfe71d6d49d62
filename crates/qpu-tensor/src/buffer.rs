use std::{fmt::Write, ptr::NonNull};

use qpu_device::{BusAddress, DeviceAllocation, DeviceAllocator, DEFAULT_ALIGNMENT};
use rand::Rng;

use crate::{dims::Dimensions, error::TensorError};

/// Buffers with fewer elements than this are always printed in full.
const PRINT_ALL_THRESHOLD: usize = 5000;

/// The value range of a reduced-precision buffer.
///
/// Only recorded and passed along; no arithmetic in this workspace depends on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
    /// Value represented by the smallest stored code.
    pub min: f32,
    /// Value represented by the largest stored code.
    pub max: f32,
}

impl Quantization {
    /// Returns `max - min`.
    pub fn range(&self) -> f32 {
        self.max - self.min
    }
}

enum BufferData<A: DeviceAllocator> {
    Owned(DeviceAllocation<A>),
    Borrowed {
        ptr: NonNull<u8>,
        bus: Option<BusAddress>,
    },
}

/// A shaped array that the ARM core and the QPUs address as the same bytes.
///
/// An owning buffer allocates, locks and maps its memory on creation and releases it on
/// drop. A buffer built from raw parts is a view over memory owned elsewhere and releases
/// nothing.
pub struct Buffer<A: DeviceAllocator> {
    dims: Dimensions,
    data: BufferData<A>,
    bits_per_element: u32,
    quantization: Option<Quantization>,
    name: String,
}

fn byte_count(dims: &Dimensions, bits_per_element: u32) -> usize {
    (dims.element_count() * bits_per_element as usize).div_ceil(8)
}

fn check_bits(bits_per_element: u32) -> Result<(), TensorError> {
    match bits_per_element {
        8 | 16 | 32 => Ok(()),
        bits => Err(TensorError::UnsupportedBitWidth(bits)),
    }
}

impl<A: DeviceAllocator> Buffer<A> {
    /// Allocates an `f32` buffer in shared memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared memory cannot be allocated, locked or mapped. The
    /// failure is also logged.
    pub fn new(dims: Dimensions, allocator: &A) -> Result<Self, TensorError> {
        Self::allocate(dims, 32, None, allocator)
    }

    /// Allocates a reduced-precision buffer in shared memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `bits_per_element` is not 8, 16 or 32, or if the shared memory
    /// cannot be obtained.
    pub fn new_quantized(
        dims: Dimensions,
        min: f32,
        max: f32,
        bits_per_element: u32,
        allocator: &A,
    ) -> Result<Self, TensorError> {
        check_bits(bits_per_element)?;
        Self::allocate(
            dims,
            bits_per_element,
            Some(Quantization { min, max }),
            allocator,
        )
    }

    fn allocate(
        dims: Dimensions,
        bits_per_element: u32,
        quantization: Option<Quantization>,
        allocator: &A,
    ) -> Result<Self, TensorError> {
        let size = byte_count(&dims, bits_per_element);
        let region = DeviceAllocation::new(allocator, size, DEFAULT_ALIGNMENT)?;
        Ok(Self {
            dims,
            data: BufferData::Owned(region),
            bits_per_element,
            quantization,
            name: "None".to_string(),
        })
    }

    /// Wraps `f32` memory owned by someone else.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads and writes of `dims.element_count()` floats for the
    /// lifetime of the buffer, and `bus`, if given, must address the same bytes.
    pub unsafe fn from_raw_parts(
        dims: Dimensions,
        data: NonNull<f32>,
        bus: Option<BusAddress>,
    ) -> Self {
        Self {
            dims,
            data: BufferData::Borrowed {
                ptr: data.cast(),
                bus,
            },
            bits_per_element: 32,
            quantization: None,
            name: "None".to_string(),
        }
    }

    /// Wraps reduced-precision memory owned by someone else.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads and writes of the packed element bytes for the
    /// lifetime of the buffer, and `bus`, if given, must address the same bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bits_per_element` is not 8, 16 or 32.
    pub unsafe fn from_quantized_raw_parts(
        dims: Dimensions,
        data: NonNull<u8>,
        min: f32,
        max: f32,
        bits_per_element: u32,
        bus: Option<BusAddress>,
    ) -> Result<Self, TensorError> {
        check_bits(bits_per_element)?;
        Ok(Self {
            dims,
            data: BufferData::Borrowed { ptr: data, bus },
            bits_per_element,
            quantization: Some(Quantization { min, max }),
            name: "None".to_string(),
        })
    }

    /// Returns the shape.
    #[inline]
    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    /// Returns the name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the name used in diagnostics.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Returns `"Buffer <name> - <dims>"`, reflecting the current name and shape.
    pub fn debug_string(&self) -> String {
        self.to_string()
    }

    /// Returns the number of bits each element occupies.
    #[inline]
    pub fn bits_per_element(&self) -> u32 {
        self.bits_per_element
    }

    /// Returns the value range of a reduced-precision buffer.
    #[inline]
    pub fn quantization(&self) -> Option<Quantization> {
        self.quantization
    }

    /// Returns true if the buffer releases its memory on drop.
    #[inline]
    pub fn does_own_data(&self) -> bool {
        matches!(self.data, BufferData::Owned(_))
    }

    /// Returns the bus address the QPUs use for the first element, if the memory is shared.
    pub fn bus_address(&self) -> Option<BusAddress> {
        match &self.data {
            BufferData::Owned(region) => Some(region.bus_address()),
            BufferData::Borrowed { bus, .. } => *bus,
        }
    }

    /// Returns the number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.element_count()
    }

    /// Returns true if the buffer has no elements, which a valid shape never allows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the size of the element data in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        byte_count(&self.dims, self.bits_per_element)
    }

    /// Returns the CPU pointer to the element data.
    pub fn as_ptr(&self) -> *const u8 {
        match &self.data {
            BufferData::Owned(region) => region.as_ptr(),
            BufferData::Borrowed { ptr, .. } => ptr.as_ptr(),
        }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        match &self.data {
            BufferData::Owned(region) => region.as_ptr(),
            BufferData::Borrowed { ptr, .. } => ptr.as_ptr(),
        }
    }

    /// Returns the raw element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the pointer is valid for byte_len bytes while self lives
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.byte_len()) }
    }

    /// Returns the elements.
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not hold 32-bit floats.
    pub fn as_slice(&self) -> &[f32] {
        assert_eq!(
            self.bits_per_element, 32,
            "{} holds {}-bit elements, not f32",
            self, self.bits_per_element
        );
        // SAFETY: shared memory is page aligned and valid for len floats while self lives
        unsafe { std::slice::from_raw_parts(self.as_ptr().cast::<f32>(), self.len()) }
    }

    /// Returns the elements mutably.
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not hold 32-bit floats.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        assert_eq!(
            self.bits_per_element, 32,
            "{} holds {}-bit elements, not f32",
            self, self.bits_per_element
        );
        let len = self.len();
        // SAFETY: as in as_slice, and &mut self guarantees exclusive host access
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr().cast::<f32>(), len) }
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: f32) {
        self.as_mut_slice().fill(value);
    }

    /// Fills the buffer with values drawn uniformly from `[min, max)`.
    ///
    /// Uses the thread-local generator; results differ between runs.
    pub fn populate_with_random_values(&mut self, min: f32, max: f32) {
        self.populate_with_rng(&mut rand::rng(), min, max);
    }

    /// Fills the buffer with values drawn uniformly from `[min, max)` using `rng`.
    pub fn populate_with_rng<R: Rng>(&mut self, rng: &mut R, min: f32, max: f32) {
        for value in self.as_mut_slice() {
            *value = (max - min) * rng.random::<f32>() + min;
        }
    }

    /// Writes [`Buffer::contents_string`] to stderr.
    pub fn print_contents(&self, max_elements: usize) {
        eprint!("{}", self.contents_string(max_elements));
    }

    /// Renders the buffer as nested brackets.
    ///
    /// Buffers of rank one to three are rendered element by element. When `max_elements`
    /// is non-zero and the buffer holds at least 5000 elements, only the first and last
    /// `max_elements / 2` entries of each axis are shown. A leading axis of extent one is
    /// treated as a batch of a single image and shown as one extra level of brackets.
    pub fn contents_string(&self, max_elements: usize) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.render(&mut out, max_elements);
        out
    }

    fn render(&self, out: &mut String, mut max_elements: usize) -> std::fmt::Result {
        writeln!(out, "{self} : ")?;
        if self.bits_per_element != 32 {
            return writeln!(
                out,
                "Printing of {}-bit quantized buffers is not supported",
                self.bits_per_element
            );
        }

        let mut dims = self.dims;
        if dims.element_count() < PRINT_ALL_THRESHOLD {
            max_elements = 0;
        }
        let is_single_image = dims.rank() > 1 && dims[0] == 1;
        if is_single_image {
            dims = dims.remove_dimensions(1);
            write!(out, "[")?;
        }

        let data = self.as_slice();
        let value = |indices: &[usize]| data[dims.offset(indices)];

        match dims.rank() {
            1 => {
                render_row(out, dims[0], max_elements, |out, x| {
                    write!(out, "{:.10}", value(&[x]))
                })?;
            }
            2 => {
                render_rows(out, dims[0], max_elements, |out, y| {
                    render_row(out, dims[1], max_elements, |out, x| {
                        write!(out, "{:.10}", value(&[y, x]))
                    })
                })?;
            }
            3 => {
                render_rows(out, dims[0], max_elements, |out, y| {
                    render_row(out, dims[1], max_elements, |out, x| {
                        write!(out, "(")?;
                        for channel in 0..dims[2] {
                            if channel > 0 {
                                write!(out, ", ")?;
                            }
                            write!(out, "{:.10}", value(&[y, x, channel]))?;
                        }
                        write!(out, ")")
                    })
                })?;
            }
            rank => {
                writeln!(
                    out,
                    "Printing of buffers with {rank} dimensions is not supported"
                )?;
            }
        }

        if is_single_image {
            write!(out, "]")?;
        }
        writeln!(out)
    }
}

/// Returns the indices of an axis hidden behind an ellipsis.
fn elided(extent: usize, max_elements: usize) -> Option<std::ops::Range<usize>> {
    if max_elements == 0 {
        return None;
    }
    let keep = max_elements / 2;
    (extent > 2 * keep).then(|| keep..extent - keep)
}

fn render_row(
    out: &mut String,
    width: usize,
    max_elements: usize,
    mut element: impl FnMut(&mut String, usize) -> std::fmt::Result,
) -> std::fmt::Result {
    let hidden = elided(width, max_elements);
    write!(out, "[")?;
    for x in 0..width {
        if let Some(hidden) = &hidden {
            if x == hidden.start {
                write!(out, "...")?;
            }
            if hidden.contains(&x) {
                continue;
            }
        }
        if x > 0 {
            write!(out, ", ")?;
        }
        element(out, x)?;
    }
    write!(out, "]")
}

fn render_rows(
    out: &mut String,
    height: usize,
    max_elements: usize,
    mut row: impl FnMut(&mut String, usize) -> std::fmt::Result,
) -> std::fmt::Result {
    let hidden = elided(height, max_elements);
    write!(out, "[")?;
    for y in 0..height {
        if let Some(hidden) = &hidden {
            if y == hidden.start {
                writeln!(out, "...")?;
            }
            if hidden.contains(&y) {
                continue;
            }
        }
        row(out, y)?;
        if y + 1 < height {
            writeln!(out, ",")?;
        }
    }
    write!(out, "]")
}

impl<A: DeviceAllocator> std::fmt::Display for Buffer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer {} - {}", self.name, self.dims)
    }
}

impl<A: DeviceAllocator> std::fmt::Debug for Buffer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("dims", &self.dims)
            .field("bits_per_element", &self.bits_per_element)
            .field("quantization", &self.quantization)
            .field("does_own_data", &self.does_own_data())
            .field("bus_address", &self.bus_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qpu_device::FakeDevice;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_buffer_shares_bytes_with_bus() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(Dimensions::from([2, 2]), &device)?;
        buffer.as_mut_slice().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let bus = buffer.bus_address().expect("owned buffers are shared");
        assert_eq!(device.read_f32(bus.offset(8))?, 3.0);
        device.write_f32(bus.offset(12), 9.5)?;
        assert_eq!(buffer.as_slice()[3], 9.5);

        assert!(buffer.does_own_data());
        assert_eq!(buffer.byte_len(), 16);
        assert_eq!(bus.as_u32() % 4096, 0);
        Ok(())
    }

    #[test]
    fn test_buffer_releases_on_drop() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let buffer = Buffer::new(Dimensions::from([8]), &device)?;
        assert_eq!(device.live_allocations(), 1);
        drop(buffer);
        assert_eq!(device.live_allocations(), 0);
        assert!(device.stats().is_balanced());
        Ok(())
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let device = FakeDevice::new().with_memory_limit(16);
        let result = Buffer::new(Dimensions::from([100]), &device);
        assert!(matches!(&result, Err(e) if e.is_out_of_memory()));
    }

    #[test]
    fn test_borrowed_buffer_releases_nothing() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut owner = Buffer::new(Dimensions::from([2, 3]), &device)?;
        owner.fill(2.0);
        let ptr = NonNull::new(owner.as_mut_slice().as_mut_ptr()).expect("non-null");

        // SAFETY: owner outlives the view and is not touched while it is alive
        let view = unsafe {
            Buffer::<FakeDevice>::from_raw_parts(
                Dimensions::from([6]),
                ptr,
                owner.bus_address(),
            )
        };
        assert!(!view.does_own_data());
        assert_eq!(view.as_slice(), &[2.0; 6]);
        assert_eq!(view.bus_address(), owner.bus_address());
        drop(view);

        assert_eq!(device.live_allocations(), 1);
        assert_eq!(device.stats().frees, 0);
        Ok(())
    }

    #[test]
    fn test_quantized_metadata() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let buffer = Buffer::new_quantized(Dimensions::from([3, 5]), -1.0, 3.0, 8, &device)?;
        assert_eq!(buffer.bits_per_element(), 8);
        assert_eq!(buffer.byte_len(), 15);
        let quantization = buffer.quantization().expect("quantized");
        assert_relative_eq!(quantization.range(), 4.0);
        assert!(buffer.contents_string(8).contains("not supported"));

        assert!(matches!(
            Buffer::new_quantized(Dimensions::from([4]), 0.0, 1.0, 12, &device),
            Err(TensorError::UnsupportedBitWidth(12))
        ));
        Ok(())
    }

    #[test]
    fn test_quantized_view_releases_nothing() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut owner = Buffer::new(Dimensions::from([4]), &device)?;
        owner.fill(1.0);
        let ptr = NonNull::new(owner.as_mut_ptr()).expect("non-null");

        // SAFETY: owner outlives the view and holds 16 bytes, enough for 8 16-bit codes
        let view = unsafe {
            Buffer::<FakeDevice>::from_quantized_raw_parts(
                Dimensions::from([8]),
                ptr,
                -2.0,
                2.0,
                16,
                owner.bus_address(),
            )?
        };
        assert!(!view.does_own_data());
        assert_eq!(view.bits_per_element(), 16);
        assert_eq!(view.byte_len(), 16);
        assert_eq!(view.as_bytes(), owner.as_bytes());
        let quantization = view.quantization().expect("quantized");
        assert_eq!(quantization, Quantization { min: -2.0, max: 2.0 });
        assert_relative_eq!(quantization.range(), 4.0);
        drop(view);

        assert_eq!(device.live_allocations(), 1);
        assert_eq!(device.stats().frees, 0);

        // SAFETY: the width is rejected before anything is wrapped
        let rejected = unsafe {
            Buffer::<FakeDevice>::from_quantized_raw_parts(
                Dimensions::from([8]),
                ptr,
                0.0,
                1.0,
                4,
                None,
            )
        };
        assert!(matches!(rejected, Err(TensorError::UnsupportedBitWidth(4))));
        Ok(())
    }

    #[test]
    fn test_debug_string_tracks_name() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(Dimensions::from([3025, 363]), &device)?;
        assert_eq!(buffer.debug_string(), "Buffer None - [3025, 363]");
        buffer.set_name("input");
        assert_eq!(buffer.debug_string(), "Buffer input - [3025, 363]");
        buffer.set_name(String::from("weights"));
        let text = buffer.debug_string();
        assert!(text.contains("weights"));
        assert!(!text.contains("input"));
        assert!(text.contains("[3025, 363]"));
        Ok(())
    }

    #[test]
    fn test_random_values_in_range() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(Dimensions::from([1000]), &device)?;
        buffer.populate_with_random_values(-2.0, 3.0);
        assert!(buffer.as_slice().iter().all(|v| (-2.0..3.0).contains(v)));

        let mut rng = StdRng::seed_from_u64(7);
        buffer.populate_with_rng(&mut rng, -1.0, 1.0);
        assert!(buffer.as_slice().iter().all(|v| (-1.0..1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn test_contents_small_matrix() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(Dimensions::from([2, 2]), &device)?;
        buffer.set_name("m");
        buffer.as_mut_slice().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            buffer.contents_string(8),
            "Buffer m - [2, 2] : \n\
             [[1.0000000000, 2.0000000000],\n\
             [3.0000000000, 4.0000000000]]\n"
        );
        Ok(())
    }

    #[test]
    fn test_contents_single_image_is_unwrapped() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(Dimensions::from([1, 1, 2]), &device)?;
        buffer.set_name("img");
        buffer.fill(0.5);
        assert_eq!(
            buffer.contents_string(0),
            "Buffer img - [1, 1, 2] : \n[[[0.5000000000, 0.5000000000]]]\n"
        );
        Ok(())
    }

    #[test]
    fn test_contents_large_buffer_is_elided() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let mut buffer = Buffer::new(Dimensions::from([10000]), &device)?;
        for (i, v) in buffer.as_mut_slice().iter_mut().enumerate() {
            *v = i as f32;
        }
        let text = buffer.contents_string(4);
        assert!(text.contains("[0.0000000000, 1.0000000000..., 9998.0000000000, 9999.0000000000]"));
        assert!(!text.contains("5000.0000000000"));

        let full = buffer.contents_string(0);
        assert!(full.contains("5000.0000000000"));
        Ok(())
    }

    #[test]
    fn test_contents_rank_four_not_supported() -> Result<(), TensorError> {
        let device = FakeDevice::new();
        let buffer = Buffer::new(Dimensions::from([2, 2, 2, 2]), &device)?;
        assert!(buffer
            .contents_string(8)
            .contains("Printing of buffers with 4 dimensions is not supported"));
        Ok(())
    }
}
