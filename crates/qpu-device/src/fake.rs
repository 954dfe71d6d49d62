//! A deterministic, in-memory stand-in for the VideoCore.
//!
//! Shared memory is ordinary page-aligned host memory handed out at synthetic bus
//! addresses, and every firmware call is counted so tests can check that each acquire
//! step is paired with its release. What happens when a job is executed is configurable
//! through [`FakeExecution`].

use std::{
    alloc::{self, Layout},
    collections::BTreeMap,
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    allocator::{BusAddress, DeviceAllocator, MemHandle},
    control::DeviceControl,
    error::DeviceError,
    DEFAULT_ALIGNMENT,
};

/// First bus address handed out, in the uncached alias of SDRAM.
const FAKE_BUS_BASE: u32 = 0xc000_0000;

/// The launch parameters of one worker, decoded from its trigger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLaunch {
    /// Position of the worker's message in the batch.
    pub worker: u32,
    /// Number of workers started together.
    pub worker_count: u32,
    /// Bus address of the worker's uniforms.
    pub uniforms: BusAddress,
    /// Bus address of the program code.
    pub code: BusAddress,
}

/// Callback that plays the part of one QPU running its program.
pub type WorkerHook =
    Arc<dyn Fn(&FakeDevice, &WorkerLaunch) -> Result<(), DeviceError> + Send + Sync>;

/// What the fake does when a job is executed.
#[derive(Clone, Default)]
pub enum FakeExecution {
    /// Every worker completes immediately without touching memory.
    #[default]
    Complete,
    /// No worker ever signals completion, so the call reports a timeout.
    Stall,
    /// The firmware returns the given non-zero status.
    Fail(u32),
    /// Each worker runs the hook in turn, in message order.
    Emulate(WorkerHook),
}

impl std::fmt::Debug for FakeExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "Complete"),
            Self::Stall => write!(f, "Stall"),
            Self::Fail(status) => write!(f, "Fail({status:#x})"),
            Self::Emulate(_) => write!(f, "Emulate(..)"),
        }
    }
}

/// Number of calls made to each firmware primitive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FakeStats {
    /// Successful allocations
    pub allocations: usize,
    /// Frees
    pub frees: usize,
    /// Successful locks
    pub locks: usize,
    /// Unlocks
    pub unlocks: usize,
    /// Successful maps
    pub maps: usize,
    /// Unmaps
    pub unmaps: usize,
    /// Successful enables
    pub enables: usize,
    /// Disables
    pub disables: usize,
    /// Executions submitted while enabled
    pub executions: usize,
}

impl FakeStats {
    /// Returns true if every acquire has been matched by its release.
    pub fn is_balanced(&self) -> bool {
        self.allocations == self.frees
            && self.locks == self.unlocks
            && self.maps == self.unmaps
            && self.enables == self.disables
    }
}

struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
    bus: BusAddress,
    size: usize,
    locked: bool,
}

impl Region {
    fn contains(&self, bus: BusAddress, len: usize) -> bool {
        bus.0 >= self.bus.0 && (bus.0 - self.bus.0) as usize + len <= self.size
    }
}

// SAFETY: the region exclusively owns its heap block and is only reached through the
// device mutex
unsafe impl Send for Region {}

struct FakeState {
    regions: BTreeMap<u32, Region>,
    next_handle: u32,
    next_bus: u32,
    live_bytes: usize,
    memory_limit: Option<usize>,
    enabled: bool,
    foreign_claim: bool,
    execution: FakeExecution,
    stats: FakeStats,
}

impl Drop for FakeState {
    fn drop(&mut self) {
        for (_, region) in std::mem::take(&mut self.regions) {
            // SAFETY: ptr and layout were created together in allocate
            unsafe { alloc::dealloc(region.ptr.as_ptr(), region.layout) };
        }
    }
}

/// An in-memory device with counted firmware calls.
///
/// Clones share the same memory and counters.
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    /// Creates a device whose jobs complete immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                regions: BTreeMap::new(),
                next_handle: 1,
                next_bus: FAKE_BUS_BASE,
                live_bytes: 0,
                memory_limit: None,
                enabled: false,
                foreign_claim: false,
                execution: FakeExecution::Complete,
                stats: FakeStats::default(),
            })),
        }
    }

    /// Sets what happens when a job is executed.
    pub fn with_execution(self, execution: FakeExecution) -> Self {
        self.state().execution = execution;
        self
    }

    /// Fails allocations that would take the live total above `bytes`.
    pub fn with_memory_limit(self, bytes: usize) -> Self {
        self.state().memory_limit = Some(bytes);
        self
    }

    /// Pretends another client already holds the QPUs.
    pub fn with_foreign_claim(self) -> Self {
        self.state().foreign_claim = true;
        self
    }

    /// Returns the call counters.
    pub fn stats(&self) -> FakeStats {
        self.state().stats
    }

    /// Returns true while the QPUs are claimed by this client.
    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Returns the number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state().regions.len()
    }

    /// Reads the 32-bit word at `bus`.
    pub fn read_word(&self, bus: BusAddress) -> Result<u32, DeviceError> {
        let ptr = self.translate(bus, 4)?;
        // SAFETY: translate checked that 4 bytes at ptr belong to a live region
        Ok(unsafe { ptr.cast::<u32>().read_unaligned() })
    }

    /// Writes the 32-bit word at `bus`.
    pub fn write_word(&self, bus: BusAddress, value: u32) -> Result<(), DeviceError> {
        let ptr = self.translate(bus, 4)?;
        // SAFETY: translate checked that 4 bytes at ptr belong to a live region
        unsafe { ptr.cast::<u32>().write_unaligned(value) };
        Ok(())
    }

    /// Reads the word at `bus` as an `f32`.
    pub fn read_f32(&self, bus: BusAddress) -> Result<f32, DeviceError> {
        self.read_word(bus).map(f32::from_bits)
    }

    /// Writes `value` at `bus` as an `f32`.
    pub fn write_f32(&self, bus: BusAddress, value: f32) -> Result<(), DeviceError> {
        self.write_word(bus, value.to_bits())
    }

    /// Copies `count` consecutive `f32` values starting at `bus`.
    pub fn read_f32s(&self, bus: BusAddress, count: usize) -> Result<Vec<f32>, DeviceError> {
        let ptr = self.translate(bus, count * 4)?;
        // SAFETY: translate checked that count * 4 bytes at ptr belong to a live region
        let bytes = unsafe { std::slice::from_raw_parts(ptr, count * 4) };
        Ok(bytes
            .chunks_exact(4)
            .map(|w| f32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }

    /// Writes consecutive `f32` values starting at `bus`.
    pub fn write_f32s(&self, bus: BusAddress, values: &[f32]) -> Result<(), DeviceError> {
        let ptr = self.translate(bus, values.len() * 4)?;
        // SAFETY: translate checked that the destination belongs to a live region
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, values.len() * 4) };
        for (dst, value) in bytes.chunks_exact_mut(4).zip(values) {
            dst.copy_from_slice(&value.to_ne_bytes());
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn translate(&self, bus: BusAddress, len: usize) -> Result<*mut u8, DeviceError> {
        let state = self.state();
        let ptr = state
            .regions
            .values()
            .find(|r| r.locked && r.contains(bus, len))
            // SAFETY: contains() keeps the offset inside the region
            .map(|r| unsafe { r.ptr.as_ptr().add((bus.0 - r.bus.0) as usize) });
        ptr.ok_or(DeviceError::InvalidAddress(bus))
    }
}

impl DeviceAllocator for FakeDevice {
    fn allocate(&self, size: usize, alignment: usize) -> Result<MemHandle, DeviceError> {
        let mut state = self.state();
        let failed = DeviceError::AllocationFailed { size };
        if size == 0 {
            return Err(failed);
        }
        if let Some(limit) = state.memory_limit {
            if state.live_bytes + size > limit {
                return Err(failed);
            }
        }

        let align = alignment.max(DEFAULT_ALIGNMENT).next_power_of_two();
        let Ok(layout) = Layout::from_size_align(size, align) else {
            return Err(failed);
        };
        let Ok(align32) = u32::try_from(align) else {
            return Err(failed);
        };
        let Some(bus) = state
            .next_bus
            .checked_add(align32 - 1)
            .map(|b| b & !(align32 - 1))
        else {
            return Err(failed);
        };
        let Some(next_bus) = u32::try_from(size).ok().and_then(|s| bus.checked_add(s)) else {
            return Err(failed);
        };

        // SAFETY: layout has a non-zero size
        let Some(ptr) = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }) else {
            return Err(failed);
        };

        let handle = state.next_handle;
        state.next_handle += 1;
        state.next_bus = next_bus;
        state.live_bytes += size;
        state.stats.allocations += 1;
        state.regions.insert(
            handle,
            Region {
                ptr,
                layout,
                bus: BusAddress(bus),
                size,
                locked: false,
            },
        );
        Ok(MemHandle(handle))
    }

    fn lock(&self, handle: MemHandle) -> Result<BusAddress, DeviceError> {
        let mut state = self.state();
        let region = state
            .regions
            .get_mut(&handle.0)
            .ok_or(DeviceError::LockFailed(handle.0))?;
        region.locked = true;
        let bus = region.bus;
        state.stats.locks += 1;
        Ok(bus)
    }

    fn unlock(&self, handle: MemHandle) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.stats.unlocks += 1;
        let region = state
            .regions
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidHandle(handle.0))?;
        region.locked = false;
        Ok(())
    }

    fn free(&self, handle: MemHandle) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.stats.frees += 1;
        let region = state
            .regions
            .remove(&handle.0)
            .ok_or(DeviceError::InvalidHandle(handle.0))?;
        state.live_bytes -= region.size;
        // SAFETY: ptr and layout were created together in allocate
        unsafe { alloc::dealloc(region.ptr.as_ptr(), region.layout) };
        Ok(())
    }

    fn map(&self, bus: BusAddress, size: usize) -> Result<NonNull<u8>, DeviceError> {
        let ptr = self
            .translate(bus, size)
            .map_err(|_| DeviceError::MapFailed { bus, size })?;
        self.state().stats.maps += 1;
        NonNull::new(ptr).ok_or(DeviceError::MapFailed { bus, size })
    }

    unsafe fn unmap(&self, _ptr: NonNull<u8>, _size: usize) {
        self.state().stats.unmaps += 1;
    }
}

impl DeviceControl for FakeDevice {
    fn enable(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.foreign_claim || state.enabled {
            return Err(DeviceError::Busy);
        }
        state.enabled = true;
        state.stats.enables += 1;
        Ok(())
    }

    fn disable(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.stats.disables += 1;
        if !state.enabled {
            return Err(DeviceError::NotEnabled);
        }
        state.enabled = false;
        Ok(())
    }

    fn execute(
        &self,
        worker_count: u32,
        messages: BusAddress,
        _no_flush: bool,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        let execution = {
            let mut state = self.state();
            if !state.enabled {
                return Err(DeviceError::NotEnabled);
            }
            state.stats.executions += 1;
            state.execution.clone()
        };

        let mut launches = Vec::with_capacity(worker_count as usize);
        for worker in 0..worker_count {
            let message = messages.offset(worker as usize * 8);
            launches.push(WorkerLaunch {
                worker,
                worker_count,
                uniforms: BusAddress(self.read_word(message)?),
                code: BusAddress(self.read_word(message.offset(4))?),
            });
        }

        match execution {
            FakeExecution::Complete => Ok(()),
            FakeExecution::Stall => Err(DeviceError::Timeout(timeout)),
            FakeExecution::Fail(status) => Err(DeviceError::ExecutionFailed(status)),
            FakeExecution::Emulate(hook) => launches.iter().try_for_each(|l| hook(self, l)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DeviceAllocation;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_bus_addresses_do_not_overlap() -> Result<(), DeviceError> {
        let device = FakeDevice::new();
        let a = DeviceAllocation::new(&device, 10, 4096)?;
        let b = DeviceAllocation::new(&device, 5000, 4096)?;
        let c = DeviceAllocation::new(&device, 10, 4096)?;
        assert!(a.bus_address().as_u32() + 10 <= b.bus_address().as_u32());
        assert!(b.bus_address().as_u32() + 5000 <= c.bus_address().as_u32());
        assert_eq!(c.bus_address().as_u32() % 4096, 0);
        assert_eq!(device.live_allocations(), 3);
        Ok(())
    }

    #[test]
    fn test_word_access_through_bus() -> Result<(), DeviceError> {
        let device = FakeDevice::new();
        let region = DeviceAllocation::new(&device, 16, 4096)?;
        device.write_f32(region.bus_address().offset(8), 1.5)?;
        assert_eq!(device.read_f32(region.bus_address().offset(8))?, 1.5);
        assert_eq!(&region.as_bytes()[8..12], &1.5f32.to_ne_bytes());
        assert!(matches!(
            device.read_word(region.bus_address().offset(14)),
            Err(DeviceError::InvalidAddress(_))
        ));
        Ok(())
    }

    #[test]
    fn test_freed_memory_is_unreachable() -> Result<(), DeviceError> {
        let device = FakeDevice::new();
        let bus = DeviceAllocation::new(&device, 16, 4096)?.bus_address();
        assert!(device.read_word(bus).is_err());
        assert_eq!(device.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn test_execute_requires_claim() -> Result<(), DeviceError> {
        let device = FakeDevice::new();
        let region = DeviceAllocation::new(&device, 8, 4096)?;
        let result = device.execute(1, region.bus_address(), true, Duration::from_secs(1));
        assert!(matches!(result, Err(DeviceError::NotEnabled)));
        Ok(())
    }

    #[test]
    fn test_stall_reports_timeout() -> Result<(), DeviceError> {
        let device = FakeDevice::new().with_execution(FakeExecution::Stall);
        let region = DeviceAllocation::new(&device, 8, 4096)?;
        device.enable()?;
        let timeout = Duration::from_millis(250);
        let result = device.execute(1, region.bus_address(), true, timeout);
        assert!(matches!(result, Err(DeviceError::Timeout(t)) if t == timeout));
        device.disable()?;
        Ok(())
    }

    #[test]
    fn test_emulate_decodes_messages() -> Result<(), DeviceError> {
        let seen = Arc::new(AtomicU32::new(0));
        let hook_seen = seen.clone();
        let device = FakeDevice::new().with_execution(FakeExecution::Emulate(Arc::new(
            move |_: &FakeDevice, launch: &WorkerLaunch| -> Result<(), DeviceError> {
                assert_eq!(launch.worker_count, 2);
                assert_eq!(launch.code, BusAddress(0xabcd));
                hook_seen.fetch_add(launch.uniforms.as_u32(), Ordering::SeqCst);
                Ok(())
            },
        )));

        let region = DeviceAllocation::new(&device, 16, 4096)?;
        let bus = region.bus_address();
        for (i, word) in [10u32, 0xabcd, 20, 0xabcd].into_iter().enumerate() {
            device.write_word(bus.offset(i * 4), word)?;
        }
        device.enable()?;
        device.execute(2, bus, true, Duration::from_secs(1))?;
        device.disable()?;

        assert_eq!(seen.load(Ordering::SeqCst), 30);
        assert_eq!(device.stats().executions, 1);
        Ok(())
    }
}
