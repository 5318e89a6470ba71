//! Address space reservations for the heaps and probes of the host machine.
//!
//! A [Reservation] owns one contiguous range of zeroed, read-write memory. Its tail can
//! be handed back to the OS with [Reservation::decommit] when a heap shrinks without the
//! range moving.

/// Contiguous range of anonymous memory, released on drop.
pub struct Reservation {
    base: *mut u8,
    len: usize,
}

impl Reservation {
    /// Returns `None` when the OS refuses `len` bytes.
    pub fn new(len: usize) -> Option<Self> {
        let base = unsafe { os::reserve(len) }?;
        Some(Self { base, len })
    }

    pub fn start(&self) -> *mut u8 {
        self.base
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        addr >= self.base as usize && addr < self.base as usize + self.len
    }

    /// Drops the backing pages of `[from, from + len)`. They read as zero afterwards.
    pub fn decommit(&self, from: *mut u8, len: usize) {
        debug_assert!(
            len == 0 || (self.contains(from) && self.contains(unsafe { from.add(len - 1) }))
        );
        if len != 0 {
            unsafe { os::decommit(from, len) }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe { os::release(self.base, self.len) }
    }
}

pub use os::{page_size, physical_memory};

#[cfg(unix)]
mod os {
    use libc::{c_int, c_void};

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NORESERVE: c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NORESERVE: c_int = 0;

    pub unsafe fn reserve(len: usize) -> Option<*mut u8> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | NORESERVE;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        match libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0) {
            libc::MAP_FAILED => None,
            base => {
                libc::madvise(base, len, libc::MADV_SEQUENTIAL);
                Some(base.cast())
            }
        }
    }

    pub unsafe fn decommit(from: *mut u8, len: usize) {
        libc::madvise(from as *mut c_void, len, libc::MADV_DONTNEED);
    }

    pub unsafe fn release(base: *mut u8, len: usize) {
        libc::munmap(base as *mut c_void, len);
    }

    pub fn page_size() -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        }
    }

    /// Installed RAM, or `usize::MAX` when it cannot be determined.
    pub fn physical_memory() -> usize {
        match unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) } {
            n if n > 0 => (n as usize).saturating_mul(page_size()),
            _ => usize::MAX,
        }
    }
}

#[cfg(windows)]
mod os {
    use std::mem::{size_of, MaybeUninit};
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        sysinfoapi::{GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    unsafe fn commit(at: *mut u8, len: usize, flags: u32) -> *mut u8 {
        VirtualAlloc(at.cast(), len, flags, PAGE_READWRITE).cast()
    }

    pub unsafe fn reserve(len: usize) -> Option<*mut u8> {
        let base = commit(std::ptr::null_mut(), len, MEM_RESERVE | MEM_COMMIT);
        if base.is_null() {
            None
        } else {
            Some(base)
        }
    }

    pub unsafe fn decommit(from: *mut u8, len: usize) {
        VirtualFree(from.cast(), len, MEM_DECOMMIT);
        commit(from, len, MEM_COMMIT);
    }

    pub unsafe fn release(base: *mut u8, _len: usize) {
        VirtualFree(base.cast(), 0, MEM_RELEASE);
    }

    pub fn page_size() -> usize {
        let mut info = MaybeUninit::uninit();
        unsafe {
            GetSystemInfo(info.as_mut_ptr());
            info.assume_init().dwPageSize as usize
        }
    }

    pub fn physical_memory() -> usize {
        let mut status = MaybeUninit::<MEMORYSTATUSEX>::zeroed();
        unsafe {
            (*status.as_mut_ptr()).dwLength = size_of::<MEMORYSTATUSEX>() as u32;
            if GlobalMemoryStatusEx(status.as_mut_ptr()) == 0 {
                return usize::MAX;
            }
            status.assume_init().ullTotalPhys as usize
        }
    }
}
