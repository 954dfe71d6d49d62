use std::ptr::NonNull;

use crate::error::DeviceError;

/// An address in the VideoCore bus address space.
///
/// This is the address the QPUs use to reach a byte of shared memory. The ARM core
/// reaches the same byte through the pointer returned by [`DeviceAllocator::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusAddress(pub u32);

impl BusAddress {
    /// Returns the raw 32-bit address.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the address `offset` bytes further on.
    ///
    /// # Panics
    ///
    /// Panics if the result does not fit the 32-bit bus address space.
    #[inline]
    pub fn offset(self, offset: usize) -> Self {
        let offset = u32::try_from(offset).expect("bus offset exceeds 32 bits");
        Self(
            self.0
                .checked_add(offset)
                .expect("bus address overflowed 32 bits"),
        )
    }
}

impl std::fmt::Display for BusAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// An opaque firmware handle naming one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u32);

/// A trait for allocating memory shared between the ARM core and the QPUs.
///
/// The lifecycle of a region is `allocate` → `lock` → `map`, released in the reverse
/// order `unmap` → `unlock` → `free`. [`DeviceAllocation`] drives that sequence.
pub trait DeviceAllocator: Clone {
    /// Allocates `size` bytes aligned to `alignment`.
    fn allocate(&self, size: usize, alignment: usize) -> Result<MemHandle, DeviceError>;

    /// Pins the allocation and returns its bus address.
    fn lock(&self, handle: MemHandle) -> Result<BusAddress, DeviceError>;

    /// Unpins an allocation previously locked.
    fn unlock(&self, handle: MemHandle) -> Result<(), DeviceError>;

    /// Releases the allocation.
    fn free(&self, handle: MemHandle) -> Result<(), DeviceError>;

    /// Maps `size` bytes starting at `bus` into the process address space.
    fn map(&self, bus: BusAddress, size: usize) -> Result<NonNull<u8>, DeviceError>;

    /// Removes a mapping created by [`DeviceAllocator::map`].
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a single call to `map` on this allocator and the
    /// memory must not be accessed afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize);
}

/// One region of shared memory, locked and mapped for its whole lifetime.
///
/// Creating it runs the full acquire sequence and unwinds the completed steps if a later
/// step fails. Dropping it unmaps the CPU view, unlocks and frees the allocation, so the
/// region is released on every exit path of the code holding it.
pub struct DeviceAllocation<A: DeviceAllocator> {
    allocator: A,
    handle: MemHandle,
    bus: BusAddress,
    ptr: NonNull<u8>,
    size: usize,
}

impl<A: DeviceAllocator> DeviceAllocation<A> {
    /// Allocates, locks and maps a region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that failed. Steps that had already completed
    /// are released before returning.
    pub fn new(allocator: &A, size: usize, alignment: usize) -> Result<Self, DeviceError> {
        let handle = allocator.allocate(size, alignment).inspect_err(|e| {
            log::error!("{e}");
        })?;

        let bus = match allocator.lock(handle) {
            Ok(bus) => bus,
            Err(e) => {
                log::error!("{e}");
                release(allocator, handle, false);
                return Err(e);
            }
        };

        let ptr = match allocator.map(bus, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                log::error!("{e}");
                release(allocator, handle, true);
                return Err(e);
            }
        };

        Ok(Self {
            allocator: allocator.clone(),
            handle,
            bus,
            ptr,
            size,
        })
    }

    /// Returns the bus address of the first byte.
    #[inline]
    pub fn bus_address(&self) -> BusAddress {
        self.bus
    }

    /// Returns the firmware handle.
    #[inline]
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the CPU pointer to the first byte.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the region as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr is mapped for size bytes until drop
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Returns the region as mutable bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is mapped for size bytes until drop and &mut self is exclusive
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

fn release<A: DeviceAllocator>(allocator: &A, handle: MemHandle, locked: bool) {
    if locked {
        if let Err(e) = allocator.unlock(handle) {
            log::warn!("{e}");
        }
    }
    if let Err(e) = allocator.free(handle) {
        log::warn!("{e}");
    }
}

impl<A: DeviceAllocator> Drop for DeviceAllocation<A> {
    fn drop(&mut self) {
        // SAFETY: ptr and size come from the map call in new
        unsafe { self.allocator.unmap(self.ptr, self.size) };
        release(&self.allocator, self.handle, true);
    }
}

impl<A: DeviceAllocator> std::fmt::Debug for DeviceAllocation<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("handle", &self.handle)
            .field("bus", &self.bus)
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeDevice;

    #[test]
    fn test_allocation_roundtrip() -> Result<(), DeviceError> {
        let device = FakeDevice::new();
        let mut region = DeviceAllocation::new(&device, 100, 4096)?;
        assert_eq!(region.size(), 100);
        assert_eq!(region.bus_address().as_u32() % 4096, 0);
        region.as_bytes_mut().fill(7);
        assert_eq!(device.read_word(region.bus_address())?, 0x0707_0707);
        drop(region);

        let stats = device.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.maps, 1);
        assert!(stats.is_balanced());
        Ok(())
    }

    #[test]
    fn test_live_allocations_have_distinct_handles() -> Result<(), DeviceError> {
        let device = FakeDevice::new();
        let first = DeviceAllocation::new(&device, 64, 4096)?;
        let second = DeviceAllocation::new(&device, 64, 4096)?;
        assert_ne!(first.handle(), second.handle());
        assert_ne!(first.bus_address(), second.bus_address());
        Ok(())
    }

    #[test]
    fn test_allocation_failure_leaves_nothing_behind() {
        let device = FakeDevice::new().with_memory_limit(1024);
        let result = DeviceAllocation::new(&device, 4096, 4096);
        assert!(matches!(
            result,
            Err(DeviceError::AllocationFailed { size: 4096 })
        ));
        let stats = device.stats();
        assert_eq!(stats.allocations, 0);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_bus_address_offset() {
        let bus = BusAddress(0xc000_0000);
        assert_eq!(bus.offset(0x10), BusAddress(0xc000_0010));
        assert_eq!(bus.to_string(), "0xc0000000");
    }
}
