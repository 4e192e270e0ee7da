//! The zone allocator: a general-purpose small-object allocator with
//! tagged owners.
//!
//! There is never any space between blocks, and there will never be two
//! contiguous free blocks. The zone calls are pretty much only used for
//! small strings and structures; all big things go on the hunk.
//!
//! Bookkeeping is in-band: every payload is prefixed by a block header
//! threaded into one circular, sentinel-terminated block list per zone,
//! and free blocks additionally carry a pair of free-list links in their
//! first payload bytes, threading them through one of three segregated
//! free lists.
//! A zone grows by appending whole segments; a zero-size separator block
//! between segments keeps coalescing from walking across the gap.

mod block;
pub mod static_tags;

use enum_map::EnumMap;
use memoffset::offset_of;
use std::mem;

use crate::error::MemoryError;
use crate::tag::Tag;
use crate::util::constants::{BYTES_IN_GBYTE, BYTES_IN_WORD};
use crate::util::conversions;
use crate::util::memory::{self, RawRegion};
use crate::util::Address;

pub(crate) use self::block::{Block, ZONEID};
use self::block::{
    node_links, set_node_next, set_node_prev, BlockHeader, FreeNode, FreeSentinel, FREE_NODE_BYTES,
    GUARD_BYTES, HEADER_BYTES,
};

/// Free blocks smaller than this are left attached to the allocation
/// instead of being split off. Raised at init if the in-band records
/// would not fit.
const MIN_FRAGMENT: usize = 64;

/// Upper total-size bound of the small free-list bucket.
const SMALL_BUCKET_BYTES: usize = 64;
/// Upper total-size bound of the medium free-list bucket.
const MEDIUM_BUCKET_BYTES: usize = 128;

/// Segment growth granularity: new segments are rounded up to 2 MiB.
const SEGMENT_GRANULE_BYTES: usize = 1 << 21;

/// In-band record placed at the base of a zone's first segment. The
/// remainder of the segment is carved into blocks.
#[repr(C)]
struct ZoneHeader {
    /// Total bytes belonging to the zone, including this record and any
    /// appended segments.
    size: usize,
    /// Total bytes held by non-free blocks.
    used: usize,
    /// Start/end cap of the circular block list.
    blocklist: BlockHeader,
    free_small: FreeSentinel,
    free_medium: FreeSentinel,
    free_large: FreeSentinel,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Bucket {
    Small,
    Medium,
    Large,
}

fn bucket_for(size: usize) -> Bucket {
    if size <= SMALL_BUCKET_BYTES {
        Bucket::Small
    } else if size <= MEDIUM_BUCKET_BYTES {
        Bucket::Medium
    } else {
        Bucket::Large
    }
}

/// Which zone a `Zone` value is serving, for routing and diagnostics.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ZoneKind {
    /// The growable zone for general dynamic allocation.
    Main,
    /// The fixed zone for small strings that would fragment the main zone.
    Small,
}

impl ZoneKind {
    pub fn name(self) -> &'static str {
        match self {
            ZoneKind::Main => "main",
            ZoneKind::Small => "small",
        }
    }
}

/// Point-in-time snapshot of a zone's block population.
#[derive(Debug, Clone)]
pub struct ZoneStats {
    /// Total bytes belonging to the zone.
    pub size: usize,
    /// Bytes held by non-free blocks, separators included.
    pub used: usize,
    /// Number of blocks, separators excluded.
    pub blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Bytes held by free blocks.
    pub free_bytes: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
    /// Number of segments backing the zone.
    pub segments: usize,
    /// Bytes held by live blocks, keyed by owner tag.
    pub tag_bytes: EnumMap<Tag, usize>,
}

/// One zone. See the module documentation for the block-level layout.
pub struct Zone {
    kind: ZoneKind,
    /// Base of the first segment, where the in-band [`ZoneHeader`] lives.
    base: Address,
    segments: Vec<RawRegion>,
    growable: bool,
    min_fragment: usize,
}

impl Zone {
    /// Create a zone over a fresh raw region of `size` bytes.
    ///
    /// Arguments:
    /// * `size`: the byte size of the zone, including its in-band record.
    /// * `kind`: which zone this is, used for routing diagnostics.
    /// * `growable`: whether exhaustion appends a new segment (main zone)
    ///   or is fatal (small zone).
    ///
    /// Failure to acquire the initial region is fatal.
    pub fn new(size: usize, kind: ZoneKind, growable: bool) -> Zone {
        assert!(
            size >= mem::size_of::<ZoneHeader>() + MIN_FRAGMENT,
            "Z_ClearZone: {} byte zone is too small to hold any block",
            size
        );
        let region = RawRegion::acquire(size).unwrap_or_else(|e| {
            panic!("Zone data failed to allocate {} bytes: {}", size, e);
        });
        let mut zone = Zone {
            kind,
            base: region.base(),
            segments: vec![region],
            growable,
            min_fragment: MIN_FRAGMENT,
        };
        zone.clear_zone(size);
        debug!("{} zone: initialized with {} bytes", kind.name(), size);
        zone
    }

    /// Lay out the freshly acquired region: the in-band record at its
    /// base, the remainder as one free block.
    fn clear_zone(&mut self, size: usize) {
        // every split must leave room for a header and a free node
        let needed = HEADER_BYTES + FREE_NODE_BYTES;
        if self.min_fragment < needed {
            self.min_fragment = conversions::raw_align_up(needed, BYTES_IN_WORD);
        }

        let sentinel = self.blocklist();
        let block = Block::from_header(self.base + mem::size_of::<ZoneHeader>());
        sentinel.store_header(BlockHeader {
            prev: block.header_addr(),
            next: block.header_addr(),
            size: 0,
            tag: Tag::General as u32, // in-use, so free never merges into it
            id: -ZONEID,
        });
        block.store_header(BlockHeader {
            prev: sentinel.header_addr(),
            next: sentinel.header_addr(),
            size: size - mem::size_of::<ZoneHeader>(),
            tag: Tag::Free as u32,
            id: ZONEID,
        });
        self.set_zone_size(size);
        self.set_zone_used(0);

        for bucket in [Bucket::Small, Bucket::Medium, Bucket::Large] {
            self.init_freelist(bucket);
        }
        self.insert_free(block);
    }

    // --- in-band zone record accessors ---

    fn zone_size(&self) -> usize {
        unsafe { (self.base + offset_of!(ZoneHeader, size)).load() }
    }

    fn set_zone_size(&mut self, size: usize) {
        unsafe { (self.base + offset_of!(ZoneHeader, size)).store(size) }
    }

    fn zone_used(&self) -> usize {
        unsafe { (self.base + offset_of!(ZoneHeader, used)).load() }
    }

    fn set_zone_used(&mut self, used: usize) {
        unsafe { (self.base + offset_of!(ZoneHeader, used)).store(used) }
    }

    /// The block-list sentinel.
    fn blocklist(&self) -> Block {
        Block::from_header(self.base + offset_of!(ZoneHeader, blocklist))
    }

    /// The node address of a free-list sentinel. List links point at
    /// nodes, so sentinels and real free blocks are interchangeable in
    /// the walk.
    fn freelist(&self, bucket: Bucket) -> Address {
        let sentinel = match bucket {
            Bucket::Small => offset_of!(ZoneHeader, free_small),
            Bucket::Medium => offset_of!(ZoneHeader, free_medium),
            Bucket::Large => offset_of!(ZoneHeader, free_large),
        };
        self.base + sentinel + offset_of!(FreeSentinel, node)
    }

    fn init_freelist(&mut self, bucket: Bucket) {
        let node = self.freelist(bucket);
        // zero the dummy header in front of the sentinel node
        Block::from_node(node).store_header(BlockHeader {
            prev: Address::ZERO,
            next: Address::ZERO,
            size: 0,
            tag: Tag::Free as u32,
            id: 0,
        });
        block::set_node_links(node, FreeNode { prev: node, next: node });
    }

    // --- free-list maintenance ---

    fn insert_free(&mut self, block: Block) {
        debug_assert!(
            block.size() >= HEADER_BYTES + FREE_NODE_BYTES,
            "InsertFree: bad block size: {}",
            block.size()
        );
        let node = block.payload();
        let prev = self.freelist(bucket_for(block.size()));
        let next = node_links(prev).next;
        set_node_next(prev, node);
        set_node_prev(next, node);
        block::set_node_links(node, FreeNode { prev, next });
    }

    fn remove_free(block: Block) {
        let node = block.payload();
        let FreeNode { prev, next } = node_links(node);
        debug_assert!(
            !prev.is_zero() && !next.is_zero() && prev != node && next != node,
            "RemoveFree: bad pointers prev: {}, next: {}",
            prev,
            next
        );
        set_node_next(prev, next);
        set_node_prev(next, prev);
    }

    /// First-fit search through the segregated lists, escalating to the
    /// next larger bucket when one is exhausted. Runs out of the large
    /// bucket into segment growth.
    fn search_free(&mut self, size: usize) -> Result<Block, MemoryError> {
        let mut node = node_links(self.freelist(bucket_for(size))).next;
        loop {
            if node == self.freelist(Bucket::Large) {
                node = self.new_segment(size)?;
            } else if node == self.freelist(Bucket::Small) {
                node = node_links(self.freelist(Bucket::Medium)).next;
                continue;
            } else if node == self.freelist(Bucket::Medium) {
                node = node_links(self.freelist(Bucket::Large)).next;
                continue;
            }
            let base = Block::from_node(node);
            node = node_links(node).next;
            if base.size() >= size {
                return Ok(base);
            }
        }
    }

    /// Append a fresh segment holding one free block of at least `size`
    /// bytes, preceded by a separator so the new block can never merge
    /// with the previous segment's tail.
    fn new_segment(&mut self, size: usize) -> Result<Address, MemoryError> {
        if !self.growable {
            panic!(
                "Z_Malloc: failed on allocation of {} bytes from the {} zone",
                size,
                self.kind.name()
            );
        }

        let size = conversions::raw_align_up(size, SEGMENT_GRANULE_BYTES);
        let alloc_size = size + HEADER_BYTES;
        let region = match RawRegion::acquire(alloc_size) {
            Ok(region) => region,
            Err(e) => {
                warn!(
                    "{} zone: segment growth of {} bytes failed: {}",
                    self.kind.name(),
                    alloc_size,
                    e
                );
                return Err(MemoryError::ZoneGrowFailed {
                    zone: self.kind.name(),
                    size,
                });
            }
        };

        let sentinel = self.blocklist();
        let prev = sentinel.prev();
        let sep = Block::from_header(region.base());
        let block = Block::from_header(region.base() + HEADER_BYTES);

        prev.set_next(sep);
        sep.store_header(BlockHeader {
            prev: prev.header_addr(),
            next: block.header_addr(),
            size: 0,
            tag: Tag::General as u32,
            id: -ZONEID,
        });
        block.store_header(BlockHeader {
            prev: sep.header_addr(),
            next: sentinel.header_addr(),
            size,
            tag: Tag::Free as u32,
            id: ZONEID,
        });
        sentinel.set_prev(block);

        self.set_zone_size(self.zone_size() + alloc_size);
        self.set_zone_used(self.zone_used() + HEADER_BYTES);
        self.segments.push(region);
        self.insert_free(block);

        debug!(
            "{} zone: appended a {} byte segment",
            self.kind.name(),
            size
        );
        Ok(block.payload())
    }

    /// Allocate `size` bytes owned by `tag`. The returned memory is not
    /// zero-filled.
    pub fn tag_malloc(&mut self, size: usize, tag: Tag) -> Result<Address, MemoryError> {
        if tag == Tag::Free {
            panic!("Z_TagMalloc: tried to use with TAG_FREE");
        }

        // a later free must have room to thread free-list links
        let mut size = size.max(FREE_NODE_BYTES);
        size += HEADER_BYTES + GUARD_BYTES;
        size = conversions::raw_align_up(size, BYTES_IN_WORD);

        let base = self.search_free(size)?;
        Self::remove_free(base);

        let extra = base.size() - size;
        if extra >= self.min_fragment {
            // there will be a free fragment after the allocated block
            let fragment = Block::from_header(base.header_addr() + size);
            let after = base.next();
            fragment.store_header(BlockHeader {
                prev: base.header_addr(),
                next: after.header_addr(),
                size: extra,
                tag: Tag::Free as u32,
                id: ZONEID,
            });
            after.set_prev(fragment);
            base.set_next(fragment);
            base.set_size(size);
            self.insert_free(fragment);
        }

        self.set_zone_used(self.zone_used() + base.size());
        base.set_tag(tag);
        base.set_id(ZONEID);
        base.stamp_guard();

        trace!(
            "{} zone: allocated {} bytes for {} at {}",
            self.kind.name(),
            base.size(),
            tag,
            base.payload()
        );
        Ok(base.payload())
    }

    /// Release the allocation at `ptr`. Freeing null is a recoverable
    /// error; a corrupt header, a double free or a clobbered trailing
    /// guard is fatal. Freeing a `STATIC` singleton is a no-op.
    pub fn free(&mut self, ptr: Address) -> Result<(), MemoryError> {
        if ptr.is_zero() {
            return Err(MemoryError::NullPointer);
        }
        self.free_block(Block::from_payload(ptr));
        Ok(())
    }

    pub(crate) fn free_block(&mut self, block: Block) {
        let mut block = block;
        if block.id() != ZONEID {
            panic!("Z_Free: freed a pointer without ZONEID");
        }
        if block.tag_raw() == Tag::Free as u32 {
            panic!("Z_Free: freed a freed pointer");
        }
        if block.tag_raw() == Tag::Static as u32 {
            return;
        }
        if !block.guard_intact() {
            panic!("Z_Free: memory block wrote past end");
        }

        self.set_zone_used(self.zone_used() - block.size());

        // poison the payload so stale references trip over themselves
        memory::set(block.payload(), 0xaa, block.size() - HEADER_BYTES);

        block.set_tag(Tag::Free);
        block.set_id(ZONEID);

        let prev = block.prev();
        if prev.tag_raw() == Tag::Free as u32 {
            Self::remove_free(prev);
            Self::merge(prev, block);
            block = prev;
        }

        let next = block.next();
        if next.tag_raw() == Tag::Free as u32 {
            Self::remove_free(next);
            Self::merge(block, next);
        }

        self.insert_free(block);
    }

    /// Absorb `next` into `curr`. Both must be adjacent list neighbors.
    fn merge(curr: Block, next: Block) {
        curr.set_size(curr.size() + next.size());
        let after = next.next();
        curr.set_next(after);
        after.set_prev(curr);
    }

    /// Free every block owned by `tag`, returning how many were freed.
    /// `STATIC` is never a valid argument.
    pub fn free_tags(&mut self, tag: Tag) -> usize {
        if tag == Tag::Static {
            panic!("Z_FreeTags( TAG_STATIC )");
        }
        let sentinel = self.blocklist();
        let mut count = 0;
        let mut block = sentinel.next();
        loop {
            if block.tag_raw() == tag as u32 && block.id() == ZONEID {
                // freeing may merge the block into a free predecessor;
                // resume the walk from whichever block survives
                let resume = if block.prev().tag_raw() == Tag::Free as u32 {
                    block.prev()
                } else {
                    block
                };
                self.free_block(block);
                block = resume;
                count += 1;
            }
            if block.next() == sentinel {
                break;
            }
            block = block.next();
        }
        debug!(
            "{} zone: freed {} blocks tagged {}",
            self.kind.name(),
            count,
            tag
        );
        count
    }

    /// Walk the whole block list and verify its invariants: blocks touch
    /// their successor (except across a segment separator), back links
    /// are consistent, and no two free blocks are adjacent. Violations
    /// are fatal.
    pub fn check_heap(&self) {
        let sentinel = self.blocklist();
        let mut block = sentinel.next();
        loop {
            if block.next() == sentinel {
                break; // all blocks have been hit
            }
            if block.end() != block.next().header_addr() {
                let next = block.next();
                if next.size() == 0 && next.id() == -ZONEID && next.tag_raw() == Tag::General as u32
                {
                    block = next; // a new segment follows the separator
                } else {
                    panic!("Z_CheckHeap: block size does not touch the next block");
                }
            }
            if block.next().prev() != block {
                panic!("Z_CheckHeap: next block doesn't have proper back link");
            }
            if block.tag_raw() == Tag::Free as u32 && block.next().tag_raw() == Tag::Free as u32 {
                panic!("Z_CheckHeap: two consecutive free blocks");
            }
            block = block.next();
        }
    }

    /// Bytes still available. A growable zone is effectively unlimited
    /// and reports a flat 1 GiB.
    pub fn available(&self) -> usize {
        if self.growable {
            BYTES_IN_GBYTE
        } else {
            self.zone_size() - self.zone_used()
        }
    }

    /// Total bytes held by non-free blocks.
    pub fn used(&self) -> usize {
        self.zone_used()
    }

    /// Total bytes belonging to the zone.
    pub fn size(&self) -> usize {
        self.zone_size()
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// Snapshot block-population statistics, including per-tag byte
    /// totals for live blocks.
    pub fn stats(&self) -> ZoneStats {
        let mut stats = ZoneStats {
            size: self.zone_size(),
            used: self.zone_used(),
            blocks: 0,
            free_blocks: 0,
            free_bytes: 0,
            largest_free: 0,
            segments: self.segments.len(),
            tag_bytes: EnumMap::default(),
        };
        let sentinel = self.blocklist();
        let mut block = sentinel.next();
        while block != sentinel {
            if block.id() == -ZONEID {
                // segment separator
                block = block.next();
                continue;
            }
            stats.blocks += 1;
            let tag = block.tag();
            if tag == Tag::Free {
                stats.free_blocks += 1;
                stats.free_bytes += block.size();
                stats.largest_free = stats.largest_free.max(block.size());
            } else {
                stats.tag_bytes[tag] += block.size();
            }
            block = block.next();
        }
        stats
    }
}
