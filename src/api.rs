//! The engine-facing operation surface.
//!
//! The allocators are plain values ([`MemorySystem`] ties the three of
//! them together), and the engine's expectation of one main zone, one
//! small zone and one hunk per process is served by the free functions
//! in this module, which operate on a process-wide [`MemorySystem`]
//! installed by [`init`]. The singleton sits behind a mutex purely to
//! satisfy Rust's requirements for globals; no allocator operation ever
//! blocks or yields.

use std::sync::Mutex;

use crate::error::MemoryError;
use crate::hunk::{Hunk, Preference};
use crate::tag::Tag;
use crate::util::options::{Options, SMALL_ZONE_BYTES};
use crate::util::{conversions, memory, Address};
use crate::zone::{static_tags, Block, Zone, ZoneKind, ZoneStats, ZONEID};

/// The three allocators of one engine process, initialized in the fixed
/// order small zone, main zone, hunk. The hunk comes up last; until it
/// does, temporary hunk requests transparently fall back to the main
/// zone so early file loads need no second code path.
pub struct MemorySystem {
    smallzone: Zone,
    mainzone: Zone,
    hunk: Option<Hunk>,
}

impl MemorySystem {
    /// Build the small and main zones. Failure to acquire either region
    /// is fatal.
    pub fn new(options: &Options) -> MemorySystem {
        let smallzone = Zone::new(SMALL_ZONE_BYTES, ZoneKind::Small, false);
        let mainzone = Zone::new(
            conversions::mbytes_to_bytes(options.zone_megs),
            ZoneKind::Main,
            true,
        );
        MemorySystem {
            smallzone,
            mainzone,
            hunk: None,
        }
    }

    /// Build the hunk. Called after the zones so the temp fallback has
    /// somewhere to go in between. Failure to acquire the region is
    /// fatal.
    pub fn init_hunk(&mut self, options: &Options) {
        self.hunk = Some(Hunk::new(conversions::mbytes_to_bytes(options.hunk_megs)));
    }

    fn zone_for(&mut self, tag: Tag) -> &mut Zone {
        if tag == Tag::Small {
            &mut self.smallzone
        } else {
            &mut self.mainzone
        }
    }

    /// Allocate zero-filled memory from the main zone, tagged `GENERAL`.
    pub fn malloc(&mut self, size: usize) -> Result<Address, MemoryError> {
        let buf = self.tag_malloc(size, Tag::General)?;
        memory::zero(buf, size);
        Ok(buf)
    }

    /// Allocate from the small zone. Not zero-filled.
    pub fn small_malloc(&mut self, size: usize) -> Result<Address, MemoryError> {
        self.tag_malloc(size, Tag::Small)
    }

    /// Allocate with an explicit owner tag, routed to the zone the tag
    /// belongs to. Not zero-filled.
    pub fn tag_malloc(&mut self, size: usize, tag: Tag) -> Result<Address, MemoryError> {
        self.zone_for(tag).tag_malloc(size, tag)
    }

    /// Release a zone allocation, routing by the owner tag in its
    /// header. Freeing a `STATIC` singleton is a no-op; freeing null is
    /// a recoverable error; anything corrupt is fatal.
    pub fn free(&mut self, ptr: Address) -> Result<(), MemoryError> {
        if ptr.is_zero() {
            return Err(MemoryError::NullPointer);
        }
        let block = Block::from_payload(ptr);
        if block.id() != ZONEID {
            panic!("Z_Free: freed a pointer without ZONEID");
        }
        if block.tag_raw() == Tag::Static as u32 {
            return Ok(());
        }
        if block.tag_raw() == Tag::Small as u32 {
            self.smallzone.free(ptr)
        } else {
            self.mainzone.free(ptr)
        }
    }

    /// Free every block owned by `tag` in the zone it routes to,
    /// returning the number of blocks freed.
    pub fn free_tags(&mut self, tag: Tag) -> usize {
        self.zone_for(tag).free_tags(tag)
    }

    /// Bytes still available in the main zone.
    pub fn available_memory(&self) -> usize {
        self.mainzone.available()
    }

    /// Duplicate a string into the small zone, NUL-terminated. The empty
    /// string and single digits come from the compile-time `STATIC`
    /// singletons instead of consuming zone memory.
    pub fn copy_string(&mut self, s: &str) -> Result<Address, MemoryError> {
        if let Some(singleton) = static_tags::lookup(s) {
            return Ok(singleton);
        }
        let buf = self.small_malloc(s.len() + 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), buf.to_mut_ptr::<u8>(), s.len());
            (buf + s.len()).store(b'\0');
        }
        Ok(buf)
    }

    /// Run the main zone's integrity check. Violations are fatal.
    pub fn check_heap(&self) {
        self.mainzone.check_heap();
    }

    /// Snapshot statistics for the requested zone.
    pub fn zone_stats(&self, kind: ZoneKind) -> ZoneStats {
        match kind {
            ZoneKind::Main => self.mainzone.stats(),
            ZoneKind::Small => self.smallzone.stats(),
        }
    }

    /// Allocate permanent hunk memory. Fatal before [`Self::init_hunk`].
    pub fn hunk_alloc(
        &mut self,
        size: usize,
        preference: Preference,
    ) -> Result<Address, MemoryError> {
        match &mut self.hunk {
            Some(hunk) => hunk.alloc(size, preference),
            None => panic!("Hunk_Alloc: Hunk memory system not initialized"),
        }
    }

    /// Allocate temporary hunk memory. Before the hunk exists this
    /// falls back to a zero-filled main-zone allocation, so the file
    /// system can load the early configuration files through the same
    /// call.
    pub fn hunk_allocate_temp(&mut self, size: usize) -> Result<Address, MemoryError> {
        match &mut self.hunk {
            Some(hunk) => hunk.allocate_temp(size),
            None => self.malloc(size),
        }
    }

    /// Free temporary hunk memory, or delegate to the zone free when the
    /// allocation came from the fallback path.
    pub fn hunk_free_temp(&mut self, ptr: Address) -> Result<(), MemoryError> {
        match &mut self.hunk {
            Some(hunk) => {
                hunk.free_temp(ptr);
                Ok(())
            }
            None => self.free(ptr),
        }
    }

    /// Record both hunk banks' permanent cursors.
    pub fn hunk_set_mark(&mut self) {
        if let Some(hunk) = &mut self.hunk {
            hunk.set_mark();
        }
    }

    /// Roll both hunk banks back to their marks.
    pub fn hunk_clear_to_mark(&mut self) {
        if let Some(hunk) = &mut self.hunk {
            hunk.clear_to_mark();
        }
    }

    /// Whether any hunk mark has been recorded.
    pub fn hunk_check_mark(&self) -> bool {
        self.hunk.as_ref().is_some_and(Hunk::check_mark)
    }

    /// Reset the whole hunk.
    pub fn hunk_clear(&mut self) {
        if let Some(hunk) = &mut self.hunk {
            hunk.clear();
        }
    }

    /// Release all temporary hunk memory at once.
    pub fn hunk_clear_temp(&mut self) {
        if let Some(hunk) = &mut self.hunk {
            hunk.clear_temp();
        }
    }

    /// Bytes not yet claimed by either hunk side.
    pub fn hunk_memory_remaining(&self) -> usize {
        self.hunk.as_ref().map_or(0, Hunk::memory_remaining)
    }

    /// Whether the hunk has been initialized yet.
    pub fn hunk_initialized(&self) -> bool {
        self.hunk.is_some()
    }
}

lazy_static! {
    static ref MEMORY: Mutex<Option<MemorySystem>> = Mutex::new(None);
}

fn with<R>(f: impl FnOnce(&mut MemorySystem) -> R) -> R {
    let mut guard = MEMORY.lock().unwrap();
    let memory = guard
        .as_mut()
        .expect("memory system not initialized, call init() first");
    f(memory)
}

/// Initialize the process-wide memory system: small zone, then main
/// zone, then hunk, with sizes taken from the environment (see
/// [`Options`]). Installs a logger unless the embedder already did.
/// Calling it again is a no-op.
pub fn init() {
    match crate::util::logger::try_init() {
        Ok(_) => debug!("tagheap initialized the logger"),
        Err(_) => debug!("a logger was already initialized by the embedder"),
    }
    let options = Options::from_env();
    let mut guard = MEMORY.lock().unwrap();
    if guard.is_some() {
        warn!("memory system is already initialized");
        return;
    }
    let mut memory = MemorySystem::new(&options);
    memory.init_hunk(&options);
    info!(
        "memory system up: {} MB zone, {} MB hunk",
        options.zone_megs, options.hunk_megs
    );
    *guard = Some(memory);
}

/// Allocate zero-filled memory from the main zone, tagged `GENERAL`.
///
/// Arguments:
/// * `size`: the number of bytes requested.
pub fn z_malloc(size: usize) -> Result<Address, MemoryError> {
    with(|memory| memory.malloc(size))
}

/// Allocate from the small zone, tagged `SMALL`. Not zero-filled.
///
/// Arguments:
/// * `size`: the number of bytes requested.
pub fn s_malloc(size: usize) -> Result<Address, MemoryError> {
    with(|memory| memory.small_malloc(size))
}

/// Allocate with an explicit owner tag. Not zero-filled.
///
/// Arguments:
/// * `size`: the number of bytes requested.
/// * `tag`: the owner; `SMALL` routes to the small zone, everything else
///   to the main zone. `FREE` is fatal.
pub fn z_tag_malloc(size: usize, tag: Tag) -> Result<Address, MemoryError> {
    with(|memory| memory.tag_malloc(size, tag))
}

/// Release a zone allocation.
pub fn z_free(ptr: Address) -> Result<(), MemoryError> {
    with(|memory| memory.free(ptr))
}

/// Free every block owned by `tag`, returning how many were freed.
pub fn z_free_tags(tag: Tag) -> usize {
    with(|memory| memory.free_tags(tag))
}

/// Bytes still available in the main zone.
pub fn z_available_memory() -> usize {
    with(|memory| memory.available_memory())
}

/// Duplicate a string, serving the empty string and single digits from
/// the compile-time singletons.
pub fn copy_string(s: &str) -> Result<Address, MemoryError> {
    with(|memory| memory.copy_string(s))
}

/// Snapshot statistics for the requested zone.
pub fn zone_stats(kind: ZoneKind) -> ZoneStats {
    with(|memory| memory.zone_stats(kind))
}

/// Allocate permanent (until the hunk is cleared) zero-filled hunk
/// memory.
///
/// Arguments:
/// * `size`: the number of bytes requested; rounded to a cacheline.
/// * `preference`: which end of the hunk to prefer.
pub fn hunk_alloc(size: usize, preference: Preference) -> Result<Address, MemoryError> {
    with(|memory| memory.hunk_alloc(size, preference))
}

/// Allocate temporary hunk memory (LIFO). Not zero-filled.
pub fn hunk_allocate_temp(size: usize) -> Result<Address, MemoryError> {
    with(|memory| memory.hunk_allocate_temp(size))
}

/// Free temporary hunk memory.
pub fn hunk_free_temp(ptr: Address) -> Result<(), MemoryError> {
    with(|memory| memory.hunk_free_temp(ptr))
}

/// Record both hunk banks' permanent cursors. The server calls this
/// after the level is fully loaded.
pub fn hunk_set_mark() {
    with(|memory| memory.hunk_set_mark())
}

/// Roll both hunk banks back to their marks. The client calls this
/// before a renderer or sound-system restart.
pub fn hunk_clear_to_mark() {
    with(|memory| memory.hunk_clear_to_mark())
}

/// Whether any hunk mark has been recorded.
pub fn hunk_check_mark() -> bool {
    with(|memory| memory.hunk_check_mark())
}

/// Reset the whole hunk. The server calls this before loading a new
/// level.
pub fn hunk_clear() {
    with(|memory| memory.hunk_clear())
}

/// Release all temporary hunk memory at once.
pub fn hunk_clear_temp() {
    with(|memory| memory.hunk_clear_temp())
}

/// Bytes not yet claimed by either hunk side.
pub fn hunk_memory_remaining() -> usize {
    with(|memory| memory.hunk_memory_remaining())
}
