use std::time::Duration;

use crate::{allocator::BusAddress, allocator::DeviceAllocator, error::DeviceError};

/// A trait for starting programs on the QPUs.
pub trait DeviceControl {
    /// Claims and powers up the QPUs.
    fn enable(&self) -> Result<(), DeviceError>;

    /// Releases the QPUs.
    fn disable(&self) -> Result<(), DeviceError>;

    /// Launches `worker_count` programs and blocks until all of them finish.
    ///
    /// # Arguments
    ///
    /// * `worker_count` - Number of QPUs to start.
    /// * `messages` - Bus address of `worker_count` trigger messages, each two words:
    ///   the bus address of the worker's uniforms followed by the bus address of its code.
    /// * `no_flush` - Skip the L2 cache flush before starting.
    /// * `timeout` - How long to wait for completion.
    ///
    /// # Errors
    ///
    /// Returns an error if any worker did not complete within `timeout`. There is no
    /// partial completion: the batch as a whole either finished or failed.
    fn execute(
        &self,
        worker_count: u32,
        messages: BusAddress,
        no_flush: bool,
        timeout: Duration,
    ) -> Result<(), DeviceError>;
}

/// A co-processor that provides both shared memory and job control.
pub trait Device: DeviceAllocator + DeviceControl {}

impl<T: DeviceAllocator + DeviceControl> Device for T {}

/// Keeps the QPUs enabled for as long as it lives.
///
/// The QPUs are a process-wide resource; pairing enable with disable through a guard
/// releases them on every exit path, including early returns with `?`.
#[must_use = "the QPUs are disabled as soon as the claim is dropped"]
pub struct DeviceClaim<'a, C: DeviceControl + ?Sized> {
    device: &'a C,
}

impl<'a, C: DeviceControl + ?Sized> DeviceClaim<'a, C> {
    /// Enables the QPUs.
    ///
    /// # Errors
    ///
    /// Returns an error if the QPUs cannot be claimed, for example because another
    /// client already holds them.
    pub fn acquire(device: &'a C) -> Result<Self, DeviceError> {
        device.enable().inspect_err(|e| {
            log::error!("QPU enable failed: {e}");
        })?;
        log::info!("QPU enabled");
        Ok(Self { device })
    }

    /// Returns the claimed device.
    pub fn device(&self) -> &C {
        self.device
    }
}

impl<C: DeviceControl + ?Sized> Drop for DeviceClaim<'_, C> {
    fn drop(&mut self) {
        match self.device.disable() {
            Ok(()) => log::info!("QPU disabled"),
            Err(e) => log::warn!("QPU disable failed: {e}"),
        }
    }
}
