//! Access to the VideoCore through the firmware property mailbox.
//!
//! Memory is requested from the GPU with the property interface on `/dev/vcio` and made
//! visible to the ARM core by mapping the matching physical pages through `/dev/mem`.
//! Both nodes usually require root.

use std::{
    fs::{File, OpenOptions},
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::PathBuf,
    ptr::NonNull,
    sync::Arc,
    time::Duration,
};

use crate::{
    allocator::{BusAddress, DeviceAllocator, MemHandle},
    control::DeviceControl,
    error::DeviceError,
};

const MAJOR_NUM: u64 = 100;

/// `_IOWR(MAJOR_NUM, 0, char *)`
const IOCTL_MBOX_PROPERTY: u64 = (3 << 30)
    | ((std::mem::size_of::<*mut libc::c_char>() as u64) << 16)
    | (MAJOR_NUM << 8);

const PROCESS_REQUEST: u32 = 0x0000_0000;
const END_TAG: u32 = 0x0000_0000;

const TAG_ALLOCATE_MEMORY: u32 = 0x0003_000c;
const TAG_LOCK_MEMORY: u32 = 0x0003_000d;
const TAG_UNLOCK_MEMORY: u32 = 0x0003_000e;
const TAG_RELEASE_MEMORY: u32 = 0x0003_000f;
const TAG_EXECUTE_QPU: u32 = 0x0003_0011;
const TAG_ENABLE_QPU: u32 = 0x0003_0012;

/// Bits of a bus address that select the cache alias rather than the physical page.
const BUS_ALIAS_MASK: u32 = 0xc000_0000;

/// Configuration of the mailbox backend.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Path of the firmware mailbox device.
    pub vcio_path: PathBuf,
    /// Path of the physical memory device.
    pub mem_path: PathBuf,
    /// Flags passed with every allocation.
    ///
    /// `0xc` (direct, uncached) suits the BCM2835; `0x4` (coherent) suits later SoCs.
    pub mem_flags: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            vcio_path: PathBuf::from("/dev/vcio"),
            mem_path: PathBuf::from("/dev/mem"),
            mem_flags: 0xc,
        }
    }
}

impl MailboxConfig {
    /// Sets the allocation flags.
    pub fn with_mem_flags(mut self, mem_flags: u32) -> Self {
        self.mem_flags = mem_flags;
        self
    }
}

struct MailboxInner {
    vcio: File,
    mem: File,
    config: MailboxConfig,
}

/// The VideoCore reached through the firmware property mailbox.
///
/// Clones share the same open device nodes.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    /// Opens the mailbox and the physical memory device.
    ///
    /// # Errors
    ///
    /// Returns an error if either device node cannot be opened.
    pub fn open(config: MailboxConfig) -> Result<Self, DeviceError> {
        let vcio = File::open(&config.vcio_path).inspect_err(|e| {
            log::error!("Can't open {}: {e}", config.vcio_path.display());
        })?;
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&config.mem_path)
            .inspect_err(|e| {
                log::error!("Can't open {}: {e}", config.mem_path.display());
            })?;
        Ok(Self {
            inner: Arc::new(MailboxInner { vcio, mem, config }),
        })
    }

    /// Returns the configuration the mailbox was opened with.
    pub fn config(&self) -> &MailboxConfig {
        &self.inner.config
    }

    /// Sends a single-tag property request and returns the first response word.
    fn property(&self, tag: u32, request: &[u32]) -> Result<u32, DeviceError> {
        let value_bytes = (request.len().max(1) * 4) as u32;
        let mut message = Vec::with_capacity(request.len() + 6);
        message.extend_from_slice(&[0, PROCESS_REQUEST, tag, value_bytes, value_bytes]);
        message.extend_from_slice(request);
        message.push(END_TAG);
        message[0] = (message.len() * 4) as u32;

        // SAFETY: message is a valid property buffer that outlives the call
        let ret = unsafe {
            libc::ioctl(
                self.inner.vcio.as_raw_fd(),
                IOCTL_MBOX_PROPERTY as _,
                message.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(message[5])
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl DeviceAllocator for Mailbox {
    fn allocate(&self, size: usize, alignment: usize) -> Result<MemHandle, DeviceError> {
        let failed = || DeviceError::AllocationFailed { size };
        let size32 = u32::try_from(size).map_err(|_| failed())?;
        let align32 = u32::try_from(alignment).map_err(|_| failed())?;
        let handle = self.property(
            TAG_ALLOCATE_MEMORY,
            &[size32, align32, self.inner.config.mem_flags],
        )?;
        if handle == 0 {
            return Err(failed());
        }
        Ok(MemHandle(handle))
    }

    fn lock(&self, handle: MemHandle) -> Result<BusAddress, DeviceError> {
        match self.property(TAG_LOCK_MEMORY, &[handle.0])? {
            0 => Err(DeviceError::LockFailed(handle.0)),
            bus => Ok(BusAddress(bus)),
        }
    }

    fn unlock(&self, handle: MemHandle) -> Result<(), DeviceError> {
        match self.property(TAG_UNLOCK_MEMORY, &[handle.0])? {
            0 => Ok(()),
            status => Err(DeviceError::ReleaseFailed {
                operation: "unlock",
                status,
            }),
        }
    }

    fn free(&self, handle: MemHandle) -> Result<(), DeviceError> {
        match self.property(TAG_RELEASE_MEMORY, &[handle.0])? {
            0 => Ok(()),
            status => Err(DeviceError::ReleaseFailed {
                operation: "free",
                status,
            }),
        }
    }

    fn map(&self, bus: BusAddress, size: usize) -> Result<NonNull<u8>, DeviceError> {
        let phys = (bus.0 & !BUS_ALIAS_MASK) as usize;
        let offset = phys % page_size();
        let base = phys - offset;

        // SAFETY: mapping a fresh range chosen by the kernel, checked below
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size + offset,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.inner.mem.as_raw_fd(),
                base as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            log::error!(
                "mmap of {size} bytes at {bus} failed: {}",
                std::io::Error::last_os_error()
            );
            return Err(DeviceError::MapFailed { bus, size });
        }

        // SAFETY: offset is inside the mapping that was just created
        let ptr = unsafe { ptr.cast::<u8>().add(offset) };
        NonNull::new(ptr).ok_or(DeviceError::MapFailed { bus, size })
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        let offset = ptr.as_ptr() as usize % page_size();
        let base = ptr.as_ptr().sub(offset);
        if libc::munmap(base.cast::<libc::c_void>(), size + offset) == -1 {
            log::error!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

impl DeviceControl for Mailbox {
    fn enable(&self) -> Result<(), DeviceError> {
        match self.property(TAG_ENABLE_QPU, &[1])? {
            0 => Ok(()),
            status => Err(DeviceError::EnableFailed(status)),
        }
    }

    fn disable(&self) -> Result<(), DeviceError> {
        match self.property(TAG_ENABLE_QPU, &[0])? {
            0 => Ok(()),
            status => Err(DeviceError::ReleaseFailed {
                operation: "disable",
                status,
            }),
        }
    }

    fn execute(
        &self,
        worker_count: u32,
        messages: BusAddress,
        no_flush: bool,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        match self.property(
            TAG_EXECUTE_QPU,
            &[worker_count, messages.0, no_flush as u32, timeout_ms],
        )? {
            0 => Ok(()),
            status => Err(DeviceError::ExecutionFailed(status)),
        }
    }
}
