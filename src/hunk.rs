//! The hunk allocator: one large contiguous region with stack allocators
//! coming from both ends toward the middle.
//!
//! One side is designated the temporary side. Temporary memory can be
//! freed in any order, but only the stack top is reclaimed immediately;
//! the rest waits for [`Hunk::clear_temp`]. A high-water mark records the
//! most temp memory ever in use on each side. When no temp memory is
//! live, the permanent and temp sides can be switched, so memory already
//! touched by temp loads gets reused for permanent storage. Permanent
//! allocations are steered to the side with the greater touched-but-
//! unused slack, which minimizes the total pages the process ever
//! touches across level loads.
//!
//! Temp memory must never be live on both ends at once, or the middle
//! would fragment; the bank swap refusing to run while temp is live is
//! what enforces that.

use std::mem;

use crate::error::MemoryError;
use crate::util::constants::{BYTES_IN_WORD, CACHELINE_BYTES};
use crate::util::conversions;
use crate::util::memory::{self, RawRegion};
use crate::util::Address;

/// Stamped into the in-band header of a live temporary allocation.
pub(crate) const HUNK_MAGIC: u32 = 0x8953_7892;
/// Replaces [`HUNK_MAGIC`] once the temporary allocation is freed.
pub(crate) const HUNK_FREE_MAGIC: u32 = 0x8953_7893;

/// In-band header prefixing every temporary allocation. `size` includes
/// the header.
#[repr(C)]
#[derive(Copy, Clone)]
struct HunkHeader {
    magic: u32,
    size: u32,
}

const HUNK_HEADER_BYTES: usize = mem::size_of::<HunkHeader>();

/// Cursor state for one end of the hunk. All fields are byte offsets
/// from that end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Bank {
    /// Saved permanent cursor for scoped rollback.
    pub mark: usize,
    /// Top of the permanent stack.
    pub permanent: usize,
    /// Top of the temporary stack; equals `permanent` when no temp is
    /// live on this side.
    pub temp: usize,
    /// The highest `temp` ever observed on this side.
    pub temp_highwater: usize,
}

impl Bank {
    /// Touched-but-unused space on this side, the quantity the bank-swap
    /// heuristic compares.
    fn slack(&self) -> usize {
        self.temp_highwater.saturating_sub(self.permanent)
    }
}

/// Side preference for a permanent hunk allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Preference {
    Low,
    High,
    DontCare,
}

/// The hunk. See the module documentation for the design.
pub struct Hunk {
    #[allow(dead_code)] // owns the mapping; dropped with the hunk
    region: RawRegion,
    /// Cacheline-aligned base of the usable range.
    base: Address,
    total: usize,
    low: Bank,
    high: Bank,
    permanent_is_low: bool,
}

impl Hunk {
    /// Carve a hunk of `total` usable bytes out of a fresh raw region.
    /// Failure to acquire the region is fatal.
    pub fn new(total: usize) -> Hunk {
        let region = RawRegion::acquire(total + CACHELINE_BYTES - 1).unwrap_or_else(|e| {
            panic!("Hunk data failed to allocate {} bytes: {}", total, e);
        });
        let base = region.base().align_up(CACHELINE_BYTES);
        let mut hunk = Hunk {
            region,
            base,
            total,
            low: Bank::default(),
            high: Bank::default(),
            permanent_is_low: true,
        };
        hunk.clear();
        debug!("hunk: initialized with {} bytes", total);
        hunk
    }

    /// Reset both banks to empty and restore the boot-time role
    /// assignment: low side permanent, high side temp.
    pub fn clear(&mut self) {
        self.low = Bank::default();
        self.high = Bank::default();
        self.permanent_is_low = true;
        debug!("hunk: cleared");
    }

    fn permanent_bank(&self) -> Bank {
        if self.permanent_is_low {
            self.low
        } else {
            self.high
        }
    }

    fn permanent_bank_mut(&mut self) -> &mut Bank {
        if self.permanent_is_low {
            &mut self.low
        } else {
            &mut self.high
        }
    }

    fn temp_bank(&self) -> Bank {
        if self.permanent_is_low {
            self.high
        } else {
            self.low
        }
    }

    fn temp_bank_mut(&mut self) -> &mut Bank {
        if self.permanent_is_low {
            &mut self.high
        } else {
            &mut self.low
        }
    }

    /// Exchange the permanent and temp roles if the temp side has the
    /// greater touched-but-unused slack. Never swaps while any temp
    /// allocation is live.
    fn swap_banks(&mut self) {
        let temp = self.temp_bank();

        // can't swap banks if there is any temp already allocated
        if temp.temp != temp.permanent {
            return;
        }

        if temp.slack() > self.permanent_bank().slack() {
            self.permanent_is_low = !self.permanent_is_low;
            trace!(
                "hunk: swapped banks, permanent side is now {}",
                if self.permanent_is_low { "low" } else { "high" }
            );
        }
    }

    /// Allocate permanent (until the hunk is cleared) zero-filled memory,
    /// rounded to a cacheline.
    ///
    /// Arguments:
    /// * `size`: the number of bytes requested.
    /// * `preference`: which end to allocate from. Honored only when no
    ///   temp memory is live; `DontCare` lets the swap heuristic choose.
    pub fn alloc(&mut self, size: usize, preference: Preference) -> Result<Address, MemoryError> {
        // can't honor a preference if there is any temp allocated
        let temp = self.temp_bank();
        if preference == Preference::DontCare || temp.temp != temp.permanent {
            self.swap_banks();
        } else if preference == Preference::Low && !self.permanent_is_low {
            self.swap_banks();
        } else if preference == Preference::High && self.permanent_is_low {
            self.swap_banks();
        }

        let size = conversions::raw_align_up(size, CACHELINE_BYTES);

        if self.low.temp + self.high.temp + size > self.total {
            return Err(MemoryError::HunkExhausted { size });
        }

        let buf = if self.permanent_is_low {
            let buf = self.base + self.low.permanent;
            self.low.permanent += size;
            buf
        } else {
            self.high.permanent += size;
            self.base + self.total - self.high.permanent
        };
        let bank = self.permanent_bank_mut();
        bank.temp = bank.permanent;

        memory::zero(buf, size);
        trace!("hunk: permanent allocation of {} bytes at {}", size, buf);
        Ok(buf)
    }

    /// Allocate temporary memory from the temp side. The contents are
    /// not zeroed; callers load files straight over them. Frees are
    /// LIFO-optimal: see [`Hunk::free_temp`].
    pub fn allocate_temp(&mut self, size: usize) -> Result<Address, MemoryError> {
        self.swap_banks();

        let size = conversions::raw_align_up(size, BYTES_IN_WORD) + HUNK_HEADER_BYTES;

        if self.temp_bank().temp + self.permanent_bank().permanent + size > self.total {
            return Err(MemoryError::HunkTempExhausted { size });
        }

        let buf = if !self.permanent_is_low {
            // temp side is low
            let buf = self.base + self.low.temp;
            self.low.temp += size;
            buf
        } else {
            self.high.temp += size;
            self.base + self.total - self.high.temp
        };

        let bank = self.temp_bank_mut();
        if bank.temp > bank.temp_highwater {
            bank.temp_highwater = bank.temp;
        }

        unsafe {
            buf.store(HunkHeader {
                magic: HUNK_MAGIC,
                size: size as u32,
            })
        };
        trace!("hunk: temp allocation of {} bytes at {}", size, buf);
        Ok(buf + HUNK_HEADER_BYTES)
    }

    /// Free a temporary allocation. A wrong header magic is fatal. Only
    /// the topmost block actually retracts the cursor; blocks freed out
    /// of order stay claimed until [`Hunk::clear_temp`].
    pub fn free_temp(&mut self, ptr: Address) {
        let header_addr = ptr - HUNK_HEADER_BYTES;
        let mut header: HunkHeader = unsafe { header_addr.load() };
        if header.magic != HUNK_MAGIC {
            panic!("Hunk_FreeTempMemory: bad magic");
        }
        header.magic = HUNK_FREE_MAGIC;
        unsafe { header_addr.store(header) };

        let size = header.size as usize;
        if !self.permanent_is_low {
            // temp side is low
            if header_addr == self.base + self.low.temp - size {
                self.low.temp -= size;
            }
        } else if header_addr == self.base + self.total - self.high.temp {
            self.high.temp -= size;
        }
    }

    /// Release all temporary memory on the temp side at once.
    pub fn clear_temp(&mut self) {
        let bank = self.temp_bank_mut();
        bank.temp = bank.permanent;
    }

    /// Record both banks' permanent cursors. The engine calls this after
    /// the level and its collateral are fully loaded.
    pub fn set_mark(&mut self) {
        self.low.mark = self.low.permanent;
        self.high.mark = self.high.permanent;
    }

    /// Roll both banks back to their marks, releasing everything
    /// allocated since [`Hunk::set_mark`].
    pub fn clear_to_mark(&mut self) {
        self.low.permanent = self.low.mark;
        self.low.temp = self.low.mark;
        self.high.permanent = self.high.mark;
        self.high.temp = self.high.mark;
    }

    /// Whether any mark has been recorded.
    pub fn check_mark(&self) -> bool {
        self.low.mark != 0 || self.high.mark != 0
    }

    /// Bytes not yet claimed by either side.
    pub fn memory_remaining(&self) -> usize {
        let low = self.low.permanent.max(self.low.temp);
        let high = self.high.permanent.max(self.high.temp);
        self.total - (low + high)
    }

    /// Total usable bytes.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The cacheline-aligned base of the usable range.
    pub fn base(&self) -> Address {
        self.base
    }

    /// Snapshot of the low bank's cursors.
    pub fn low_bank(&self) -> Bank {
        self.low
    }

    /// Snapshot of the high bank's cursors.
    pub fn high_bank(&self) -> Bank {
        self.high
    }

    /// Which side permanent allocations are currently served from.
    pub fn permanent_is_low(&self) -> bool {
        self.permanent_is_low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_HUNK_BYTES: usize = 1 << 20;

    fn fresh_hunk() -> Hunk {
        Hunk::new(TEST_HUNK_BYTES)
    }

    #[test]
    fn fresh_hunk_state() {
        let hunk = fresh_hunk();
        assert!(hunk.base().is_aligned_to(CACHELINE_BYTES));
        assert!(hunk.permanent_is_low());
        assert!(!hunk.check_mark());
        assert_eq!(hunk.memory_remaining(), TEST_HUNK_BYTES);
    }

    #[test]
    fn permanent_alloc_is_zeroed_and_cacheline_rounded() {
        let mut hunk = fresh_hunk();
        let a = hunk.alloc(100, Preference::Low).unwrap();
        assert!(a.is_aligned_to(CACHELINE_BYTES));
        for i in 0..128 {
            assert_eq!(unsafe { (a + i).load::<u8>() }, 0);
        }
        assert_eq!(hunk.low_bank().permanent, 128);
        assert_eq!(hunk.low_bank().temp, 128);
    }

    #[test]
    fn preference_triggers_swap_only_when_slack_favors_it() {
        // a preference is a hint: it runs the swap heuristic, which only
        // moves the permanent side where touched-but-unused space waits
        let mut hunk = fresh_hunk();
        let a = hunk.alloc(64, Preference::High).unwrap();
        assert!(hunk.permanent_is_low(), "no slack on high, no swap");
        assert_eq!(a, hunk.base());

        // touch the high side with temp traffic, then ask again
        let t = hunk.allocate_temp(256).unwrap();
        hunk.free_temp(t);
        let b = hunk.alloc(64, Preference::High).unwrap();
        assert!(!hunk.permanent_is_low());
        assert_eq!(b, hunk.base() + hunk.total() - 64usize);
        assert_eq!(hunk.high_bank().permanent, 64);
    }

    #[test]
    fn alloc_beyond_capacity_is_recoverable() {
        let mut hunk = fresh_hunk();
        let err = hunk.alloc(TEST_HUNK_BYTES + 1, Preference::Low);
        assert!(matches!(err, Err(MemoryError::HunkExhausted { .. })));
        // the failed request must not move any cursor
        assert_eq!(hunk.low_bank(), Bank::default());
        assert_eq!(hunk.high_bank(), Bank::default());
    }

    #[test]
    fn temp_alloc_beyond_capacity_is_recoverable() {
        let mut hunk = fresh_hunk();
        let err = hunk.allocate_temp(TEST_HUNK_BYTES);
        assert!(matches!(err, Err(MemoryError::HunkTempExhausted { .. })));
    }

    #[test]
    fn temp_lifo_reclamation() {
        // temp-allocate T1, T2, T3; freeing out of order reclaims
        // nothing, freeing the top retracts, clear_temp resets
        let mut hunk = fresh_hunk();
        let t1 = hunk.allocate_temp(100).unwrap();
        let t2 = hunk.allocate_temp(200).unwrap();
        let t3 = hunk.allocate_temp(300).unwrap();
        let t1_size = 104 + HUNK_HEADER_BYTES;
        let t2_size = 200 + HUNK_HEADER_BYTES;
        let t3_size = 304 + HUNK_HEADER_BYTES;
        let full = t1_size + t2_size + t3_size;
        assert_eq!(hunk.high_bank().temp, full);

        hunk.free_temp(t2); // out of order: cursor unchanged
        assert_eq!(hunk.high_bank().temp, full);

        hunk.free_temp(t3); // top: retracts by its size
        assert_eq!(hunk.high_bank().temp, t1_size + t2_size);

        hunk.free_temp(t1); // not the top (t2 still occupies space)
        assert_eq!(hunk.high_bank().temp, t1_size + t2_size);

        hunk.clear_temp();
        assert_eq!(hunk.high_bank().temp, hunk.high_bank().permanent);
        assert_eq!(hunk.high_bank().temp_highwater, full);
    }

    #[test]
    #[should_panic(expected = "bad magic")]
    fn double_temp_free_is_fatal() {
        let mut hunk = fresh_hunk();
        let t = hunk.allocate_temp(64).unwrap();
        hunk.free_temp(t);
        hunk.free_temp(t);
    }

    #[test]
    fn side_swap_heuristic() {
        // permanent allocations on low, temp traffic on high, then a
        // dontcare allocation lands on the side with the greater
        // touched-but-unused slack
        let mut hunk = fresh_hunk();
        for _ in 0..5 {
            hunk.alloc(100, Preference::Low).unwrap();
        }
        hunk.set_mark();
        assert!(hunk.check_mark());

        let t1 = hunk.allocate_temp(200).unwrap();
        let t2 = hunk.allocate_temp(200).unwrap();
        let t3 = hunk.allocate_temp(200).unwrap();
        assert!(hunk.permanent_is_low());
        hunk.free_temp(t3);
        hunk.free_temp(t2);
        hunk.free_temp(t1);

        let p = hunk.alloc(100, Preference::DontCare).unwrap();
        assert!(!hunk.permanent_is_low());
        assert_eq!(p, hunk.base() + hunk.total() - 128usize);
    }

    #[test]
    fn no_swap_while_temp_is_live() {
        let mut hunk = fresh_hunk();
        hunk.alloc(100, Preference::Low).unwrap();
        let _t = hunk.allocate_temp(100).unwrap();
        // high side has live temp; preference and heuristic both yield
        hunk.alloc(100, Preference::High).unwrap();
        assert!(hunk.permanent_is_low());
        hunk.alloc(100, Preference::DontCare).unwrap();
        assert!(hunk.permanent_is_low());
    }

    #[test]
    fn mark_round_trip_restores_cursors() {
        let mut hunk = fresh_hunk();
        hunk.alloc(128, Preference::Low).unwrap();
        hunk.alloc(128, Preference::Low).unwrap();
        hunk.set_mark();
        let low = hunk.low_bank();
        let high = hunk.high_bank();

        hunk.alloc(4096, Preference::Low).unwrap();
        hunk.alloc(4096, Preference::DontCare).unwrap();
        hunk.clear_to_mark();

        assert_eq!(hunk.low_bank().permanent, low.permanent);
        assert_eq!(hunk.low_bank().temp, low.permanent);
        assert_eq!(hunk.high_bank().permanent, high.permanent);
        assert_eq!(hunk.high_bank().temp, high.permanent);
    }

    #[test]
    fn clear_resets_roles_and_marks() {
        let mut hunk = fresh_hunk();
        hunk.alloc(100, Preference::High).unwrap();
        hunk.set_mark();
        hunk.clear();
        assert!(hunk.permanent_is_low());
        assert!(!hunk.check_mark());
        assert_eq!(hunk.memory_remaining(), TEST_HUNK_BYTES);
    }

    #[test]
    fn memory_remaining_counts_both_sides() {
        let mut hunk = fresh_hunk();
        hunk.alloc(128, Preference::Low).unwrap();
        let _t = hunk.allocate_temp(100).unwrap();
        let temp_size = 104 + HUNK_HEADER_BYTES;
        assert_eq!(
            hunk.memory_remaining(),
            TEST_HUNK_BYTES - 128 - temp_size
        );
    }

    #[test]
    fn permanent_cursor_is_monotonic_and_highwater_never_falls() {
        let mut hunk = fresh_hunk();
        let mut last_perm = 0;
        let mut last_highwater = 0;
        for i in 0..16 {
            hunk.alloc(64 + i, Preference::Low).unwrap();
            let bank = hunk.low_bank();
            assert!(bank.permanent >= last_perm);
            last_perm = bank.permanent;

            let t = hunk.allocate_temp(32 * (i + 1)).unwrap();
            let temp_bank = hunk.high_bank();
            assert!(temp_bank.temp_highwater >= last_highwater);
            last_highwater = temp_bank.temp_highwater;
            hunk.free_temp(t);
        }
    }
}
