//! Executable memory management using mmap.
//!
//! Thunk regions are anonymous private mappings: written while RW, flipped
//! to RX, and finally handed over to the generated code, which unmaps its
//! own region after the call it performs.

use std::ptr::{self, NonNull};

/// Error type for memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of executable memory allocated via mmap.
///
/// The memory is initially writable. Call `make_executable()` to make it
/// executable (and read-only) before calling the generated code. Dropping
/// the block unmaps it; `into_raw()` gives up that responsibility.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of memory of at least `size` bytes.
    /// The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        // Round up to page size
        let page_size = page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        let ptr = mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the mapping. This is the length `munmap` needs,
    /// not the number of bytes written.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the memory is executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Write bytes to the memory at the given offset.
    /// Returns an error if the memory is executable or if the write would overflow.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }

        match offset.checked_add(data.len()) {
            Some(end) if end <= self.size => {}
            _ => return Err(MemoryError::InvalidSize),
        }

        // SAFETY: the range was checked against the mapping above, and
        // `data` cannot alias a mapping this struct owns exclusively.
        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Make the memory executable (and read-only).
    /// After this call, the memory can no longer be written to.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };

        if result != 0 {
            tracing::warn!(size = self.size, "mprotect to RX failed");
            return Err(MemoryError::ProtectionFailed);
        }

        self.executable = true;
        Ok(())
    }

    /// Give up ownership of the mapping without unmapping it.
    ///
    /// Returns the base address and the mapped length. Whoever holds these
    /// is now responsible for calling `munmap` with exactly that length.
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let raw = (self.ptr, self.size);
        std::mem::forget(self);
        raw
    }

    /// Re-adopt a mapping previously released with [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    /// `ptr` and `size` must come from `into_raw` on an executable block, and
    /// nothing else may unmap or use the mapping afterwards.
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Self {
            ptr,
            size,
            executable: true,
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The mapping is owned exclusively and not tied to the allocating thread.
unsafe impl Send for ExecutableMemory {}

/// Get the page size for the current system.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// Allocate memory using mmap.
fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        tracing::warn!(size, "mmap of thunk region failed");
        return Err(MemoryError::AllocationFailed);
    }

    NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
}
