//! Raw shared memory backed by Linux memfd.
//!
//! [`SharedMemory`] owns an anonymous memfd and, once mapped, a shared
//! read/write mapping of it. It knows nothing about locking or purging; the
//! discardable layer builds on top of it.
//!
//! The fd and the mapping have independent lifetimes: closing the handle
//! keeps the mapping alive until the value is dropped, which lets a process
//! hand out the fd, close its own copy to save descriptors, and keep using
//! the memory.

use super::page::align_to_page;
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// A cross-process handle to a shared memory region.
///
/// Wraps the memfd plus the usable size recorded by the sender. The fd can
/// be sent to another process with [`send_handle`](super::ipc::send_handle).
#[derive(Debug)]
pub struct SharedMemoryHandle {
    fd: OwnedFd,
    size: usize,
}

impl SharedMemoryHandle {
    /// Wrap an fd received from elsewhere.
    pub fn new(fd: OwnedFd, size: usize) -> Self {
        Self { fd, size }
    }

    /// Usable size recorded by the process that created the handle.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Split into the owned fd and the recorded size.
    pub fn into_parts(self) -> (OwnedFd, usize) {
        (self.fd, self.size)
    }
}

impl AsFd for SharedMemoryHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

/// Anonymous shared memory (memfd) with an optional mapping.
pub struct SharedMemory {
    /// The memfd, `None` once closed.
    fd: Option<OwnedFd>,
    /// The mmap'd region, `None` until mapped.
    mapping: Option<Mapping>,
    /// Optional name (for debugging).
    name: Option<String>,
}

impl SharedMemory {
    /// An empty value with no storage.
    pub fn new() -> Self {
        Self {
            fd: None,
            mapping: None,
            name: None,
        }
    }

    /// Attach to an existing memfd, typically one received from another
    /// process. Nothing is mapped yet.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd: Some(fd),
            mapping: None,
            name: None,
        }
    }

    /// Allocate fresh storage of `size` bytes, rounded up to whole pages.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name for the memfd (visible in `/proc/self/fd/`).
    /// * `size` - Size in bytes. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create` or `ftruncate` fails, or if storage
    /// already exists.
    pub fn create(&mut self, name: &str, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        if self.fd.is_some() || self.mapping.is_some() {
            return Err(Error::AllocationFailed(
                "shared memory already has storage".into(),
            ));
        }
        let size = align_to_page(size)
            .ok_or_else(|| Error::AllocationFailed(format!("size {size} overflows")))?;

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        self.fd = Some(fd);
        self.name = Some(name.to_string());
        Ok(())
    }

    /// Map `size` bytes (rounded up to whole pages) of the storage.
    ///
    /// # Errors
    ///
    /// Fails if the handle is closed, already mapped, smaller than the
    /// requested mapping, or if `mmap` fails.
    pub fn map(&mut self, size: usize) -> Result<()> {
        let fd = self.fd.as_ref().ok_or(Error::Closed)?;
        if self.mapping.is_some() {
            return Err(Error::AlreadyMapped);
        }
        if size == 0 {
            return Err(Error::InvalidSegment(
                "mapping size must be greater than 0".into(),
            ));
        }
        let len = align_to_page(size)
            .ok_or_else(|| Error::InvalidSegment(format!("size {size} overflows")))?;

        // Touching pages past EOF would raise SIGBUS, refuse up front.
        let storage = rustix::fs::fstat(fd)?.st_size as u64;
        if storage < len as u64 {
            return Err(Error::InvalidSegment(format!(
                "mapping of {len} bytes exceeds storage of {storage} bytes"
            )));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        self.mapping = Some(Mapping { ptr, len });
        Ok(())
    }

    /// Base address of the mapping.
    pub fn memory(&self) -> Option<NonNull<u8>> {
        self.mapping.as_ref().map(|m| m.ptr)
    }

    /// Size of the mapping actually established (0 when unmapped).
    pub fn mapped_size(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    /// Borrow the open handle, if any.
    pub fn handle(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Duplicate the handle (close-on-exec) so it can be given to another
    /// process.
    pub fn duplicate_handle(&self) -> Result<OwnedFd> {
        let fd = self.fd.as_ref().ok_or(Error::Closed)?;
        Ok(rustix::io::fcntl_dupfd_cloexec(fd, 0)?)
    }

    /// Current size of the backing storage in bytes.
    pub fn storage_size(&self) -> Result<u64> {
        let fd = self.fd.as_ref().ok_or(Error::Closed)?;
        Ok(rustix::fs::fstat(fd)?.st_size as u64)
    }

    /// Resize the backing storage.
    ///
    /// Shrinking releases the pages past `size` to the OS. Growing again
    /// afterwards yields zero-filled pages.
    pub fn set_storage_size(&self, size: u64) -> Result<()> {
        let fd = self.fd.as_ref().ok_or(Error::Closed)?;
        rustix::fs::ftruncate(fd, size)?;
        Ok(())
    }

    /// Close the handle. The mapping, if any, stays valid until drop.
    ///
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        self.fd = None;
    }

    /// Whether the handle has been closed (or never existed).
    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Get the debug name given at creation.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("fd", &self.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .field("mapped_size", &self.mapped_size())
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            unsafe {
                let _ = rustix::mm::munmap(mapping.ptr.as_ptr().cast(), mapping.len);
            }
        }
        // fd is automatically closed when OwnedFd is dropped
    }
}

// SAFETY: SharedMemory is Send + Sync because:
// - The mapping is process-wide and can be accessed from any thread
// - The fd is reference-counted by the kernel
// - Every method that mutates the value takes &mut self
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page::page_size;

    #[test]
    fn test_shared_memory_create_and_map() {
        let mut shm = SharedMemory::new();
        shm.create("test-shm", 4096).unwrap();
        assert_eq!(shm.name(), Some("test-shm"));
        assert!(shm.memory().is_none());

        shm.map(4096).unwrap();
        assert!(shm.memory().is_some());
        assert!(shm.mapped_size() >= 4096);
        assert_eq!(shm.mapped_size() % page_size(), 0);
    }

    #[test]
    fn test_shared_memory_zero_size_fails() {
        let mut shm = SharedMemory::new();
        assert!(shm.create("test", 0).is_err());
    }

    #[test]
    fn test_shared_memory_map_without_handle_fails() {
        let mut shm = SharedMemory::new();
        assert!(matches!(shm.map(4096), Err(Error::Closed)));
    }

    #[test]
    fn test_shared_memory_map_twice_fails() {
        let mut shm = SharedMemory::new();
        shm.create("test-twice", 4096).unwrap();
        shm.map(4096).unwrap();
        assert!(matches!(shm.map(4096), Err(Error::AlreadyMapped)));
    }

    #[test]
    fn test_shared_memory_map_beyond_storage_fails() {
        let mut shm = SharedMemory::new();
        shm.create("test-small", page_size()).unwrap();
        assert!(matches!(
            shm.map(4 * page_size()),
            Err(Error::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_shared_memory_modifications_visible() {
        let mut shm1 = SharedMemory::new();
        shm1.create("test-shared", 4096).unwrap();
        shm1.map(4096).unwrap();

        // Duplicate fd to simulate another process
        let mut shm2 = SharedMemory::from_fd(shm1.duplicate_handle().unwrap());
        shm2.map(4096).unwrap();

        unsafe {
            *shm1.memory().unwrap().as_ptr() = 77;
            assert_eq!(*shm2.memory().unwrap().as_ptr(), 77);

            *shm2.memory().unwrap().as_ptr().add(100) = 88;
            assert_eq!(*shm1.memory().unwrap().as_ptr().add(100), 88);
        }
    }

    #[test]
    fn test_shared_memory_close_keeps_mapping() {
        let mut shm = SharedMemory::new();
        shm.create("test-close", 4096).unwrap();
        shm.map(4096).unwrap();

        shm.close();
        shm.close();
        assert!(shm.is_closed());
        assert!(shm.handle().is_none());
        assert!(shm.duplicate_handle().is_err());

        unsafe {
            *shm.memory().unwrap().as_ptr() = 5;
            assert_eq!(*shm.memory().unwrap().as_ptr(), 5);
        }
    }

    #[test]
    fn test_shared_memory_shrink_releases_content() {
        let page = page_size();
        let mut shm = SharedMemory::new();
        shm.create("test-shrink", 2 * page).unwrap();
        shm.map(2 * page).unwrap();

        let ptr = shm.memory().unwrap().as_ptr();
        unsafe {
            *ptr = 1;
            *ptr.add(page) = 2;
        }

        shm.set_storage_size(page as u64).unwrap();
        shm.set_storage_size(2 * page as u64).unwrap();
        assert_eq!(shm.storage_size().unwrap(), 2 * page as u64);

        unsafe {
            assert_eq!(*ptr, 1);
            assert_eq!(*ptr.add(page), 0);
        }
    }
}
