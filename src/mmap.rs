//! OS memory mapping for region slabs.

#[cfg(unix)]
pub mod _unix {
    use std::ptr::null_mut;

    pub struct Mmap {
        start: *mut u8,
        size: usize,
        align_offset: usize,
    }

    // The mapping is uniquely owned; concurrent access to its pages is
    // synchronized by whichever space owns the region built on top of it.
    unsafe impl Send for Mmap {}
    unsafe impl Sync for Mmap {}

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                size: 0,
                align_offset: 0,
            }
        }

        /// Reserve `size` readable/writable bytes whose start is aligned to
        /// `align`. Over-maps by one alignment unit to guarantee the fit.
        pub fn new(size: usize, align: usize) -> Self {
            unsafe {
                let total = size + align;
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    total as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap failed");
                }
                let start = map as *mut u8;
                let align_offset = align - (start as usize) % align;
                Self {
                    start,
                    size: total,
                    align_offset,
                }
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn aligned_start(&self) -> *mut u8 {
            unsafe { self.start.add(self.align_offset) }
        }

        pub fn end(&self) -> *mut u8 {
            unsafe { self.start.add(self.size) }
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    libc::munmap(self.start as *mut _, self.size as _);
                }
            }
        }
    }
}

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        size: usize,
        align_offset: usize,
    }

    unsafe impl Send for Mmap {}
    unsafe impl Sync for Mmap {}

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                size: 0,
                align_offset: 0,
            }
        }

        pub fn new(size: usize, align: usize) -> Self {
            unsafe {
                let total = size + align;
                let mem = VirtualAlloc(
                    null_mut(),
                    total,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
                let start = mem as *mut u8;
                let align_offset = align - (start as usize) % align;
                Self {
                    start,
                    size: total,
                    align_offset,
                }
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn aligned_start(&self) -> *mut u8 {
            unsafe { self.start.add(self.align_offset) }
        }

        pub fn end(&self) -> *mut u8 {
            unsafe { self.start.add(self.size) }
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    VirtualFree(self.start.cast(), 0, MEM_RELEASE);
                }
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
