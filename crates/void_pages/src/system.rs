//! Operating-system page source
//!
//! Regions come straight from the kernel's virtual memory API, so they are
//! page aligned and zero filled on every supported platform.

use core::ptr::NonNull;

use crate::{round_to_pages, PageError, PageRegion, PageResult, PageSource};

/// Low level memory calls, one implementation per platform
trait PlatformMemory {
    /// Map `len` bytes, `None` if the syscall fails
    unsafe fn map(len: usize) -> Option<NonNull<u8>>;

    /// Unmap `len` bytes starting at `addr`
    unsafe fn unmap(addr: *mut u8, len: usize);

    /// Virtual memory page size in bytes
    fn query_page_size() -> usize;
}

/// Page source backed by the operating system
#[derive(Debug, Clone, Copy)]
pub struct SystemPages {
    page_size: usize,
}

impl SystemPages {
    pub fn new() -> Self {
        Self {
            page_size: Self::query_page_size(),
        }
    }
}

impl Default for SystemPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for SystemPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn request_pages(&self, min_size: usize) -> PageResult<PageRegion> {
        if min_size == 0 {
            return Err(PageError::ZeroSize);
        }
        let len = round_to_pages(min_size, self.page_size).ok_or(PageError::Overflow)?;

        match unsafe { Self::map(len) } {
            Some(ptr) => {
                log::trace!("Mapped {} bytes at {:p}", len, ptr);
                // Safety: the mapping is `len` bytes, read-write, and unshared
                Ok(unsafe { PageRegion::from_raw(ptr, len) })
            }
            None => {
                log::warn!("Page request of {} bytes refused by the OS", len);
                Err(PageError::Exhausted { requested: len })
            }
        }
    }

    fn release_pages(&self, region: PageRegion) {
        log::trace!("Unmapping {:?}", region);
        unsafe { Self::unmap(region.as_ptr(), region.len()) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, SystemPages};

    use core::ptr::NonNull;
    use libc::{c_int, c_void, off_t, size_t};

    impl PlatformMemory for SystemPages {
        unsafe fn map(len: usize) -> Option<NonNull<u8>> {
            const ADDR: *mut c_void = core::ptr::null_mut::<c_void>();
            // Read-write, private, not file backed
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let addr = unsafe { libc::mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

            match addr {
                libc::MAP_FAILED => None,
                addr => NonNull::new(addr.cast::<u8>()),
            }
        }

        unsafe fn unmap(addr: *mut u8, len: usize) {
            unsafe {
                libc::munmap(addr.cast::<c_void>(), len as size_t);
            }
        }

        fn query_page_size() -> usize {
            match unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } {
                size if size > 0 => size as usize,
                _ => 4096,
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{PlatformMemory, SystemPages};

    use core::ffi::c_void;
    use core::mem::MaybeUninit;
    use core::ptr::NonNull;

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for SystemPages {
        unsafe fn map(len: usize) -> Option<NonNull<u8>> {
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, Memory::PAGE_READWRITE);
                NonNull::new(addr.cast::<u8>())
            }
        }

        unsafe fn unmap(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE);
            }
        }

        fn query_page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let pages = SystemPages::new();
        assert!(pages.page_size().is_power_of_two());
    }

    #[test]
    fn test_request_rounds_and_zero_fills() {
        let pages = SystemPages::new();
        let mut region = pages.request_pages(100).unwrap();

        assert_eq!(region.len(), pages.page_size());
        assert_eq!(region.base_addr() % pages.page_size(), 0);
        assert!(region.as_slice().iter().all(|b| *b == 0));

        region.as_mut_slice()[0] = 0xAB;
        assert_eq!(region.as_slice()[0], 0xAB);

        pages.release_pages(region);
    }

    #[test]
    fn test_zero_request_fails() {
        let pages = SystemPages::new();
        assert_eq!(pages.request_pages(0).unwrap_err(), PageError::ZeroSize);
    }
}
