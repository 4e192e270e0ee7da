use std::io::{Error, Result};

use crate::util::constants::BYTES_IN_PAGE;
use crate::util::conversions;
use crate::util::Address;

/// An owned, zeroed, page-aligned region of raw memory obtained from the
/// OS with an anonymous mapping. The region never moves for its lifetime
/// and is unmapped on drop, which is what gives every allocation carved
/// out of it a stable address.
pub struct RawRegion {
    base: Address,
    size: usize,
}

impl RawRegion {
    /// Request a fresh zeroed region of at least `size` bytes.
    pub fn acquire(size: usize) -> Result<RawRegion> {
        let size = conversions::raw_align_up(size, BYTES_IN_PAGE);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(RawRegion {
            base: Address::from_mut_ptr(ptr),
            size,
        })
    }

    /// The first byte of the region.
    pub fn base(&self) -> Address {
        self.base
    }

    /// The mapped size in bytes. May exceed the requested size due to page
    /// rounding.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for RawRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.to_mut_ptr(), self.size);
        }
    }
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}
