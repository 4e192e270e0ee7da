use std::mem;

use crate::tag::Tag;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// Integrity word stamped into every block header. Segment separators
/// carry the negated value so coalescing can never walk across them.
pub(crate) const ZONEID: i32 = 0x1d4a11;

/// Bytes reserved at the end of every allocated block for the trailing
/// guard word, verified on free.
pub(crate) const GUARD_BYTES: usize = 4;

/// In-band header prefixing every block, including the list sentinels.
/// `size` is the total byte count of the block: header, payload, any
/// interior padding and the trailing guard.
#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct BlockHeader {
    pub prev: Address,
    pub next: Address,
    pub size: usize,
    pub tag: u32,
    pub id: i32,
}

pub(crate) const HEADER_BYTES: usize = mem::size_of::<BlockHeader>();

impl BlockHeader {
    /// Header for a compile-time `STATIC` singleton: no links, valid id.
    pub const fn static_singleton(size: usize) -> BlockHeader {
        BlockHeader {
            prev: Address::ZERO,
            next: Address::ZERO,
            size,
            tag: Tag::Static as u32,
            id: ZONEID,
        }
    }
}

/// Free-list links threaded through the first payload bytes of a free
/// block. Every allocation is padded up so this always fits.
#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct FreeNode {
    pub prev: Address,
    pub next: Address,
}

pub(crate) const FREE_NODE_BYTES: usize = mem::size_of::<FreeNode>();

/// Head of one segregated free list. The dummy header in front of the
/// node keeps the layout identical to a real block header followed by
/// its payload-resident free node, so `Block::from_node` works uniformly
/// on sentinels and real blocks.
#[repr(C)]
pub(crate) struct FreeSentinel {
    pub header: BlockHeader,
    pub node: FreeNode,
}

/// Handle to an in-band block, wrapping the address of its header. All
/// header and free-node traffic goes through this type; nothing outside
/// the zone module can reach a header or payload independently.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Block(Address);

impl Block {
    pub fn from_header(addr: Address) -> Block {
        debug_assert!(addr.is_aligned_to(BYTES_IN_WORD));
        Block(addr)
    }

    /// Recover the block from a payload pointer handed back to a caller.
    pub fn from_payload(payload: Address) -> Block {
        Block::from_header(payload.sub(HEADER_BYTES))
    }

    /// Recover the block from the address of its free-list node.
    pub fn from_node(node: Address) -> Block {
        Block::from_header(node.sub(HEADER_BYTES))
    }

    pub fn header_addr(self) -> Address {
        self.0
    }

    /// The first payload byte; for a free block this is also its
    /// free-list node.
    pub fn payload(self) -> Address {
        self.0.add(HEADER_BYTES)
    }

    /// One past the last byte of the block.
    pub fn end(self) -> Address {
        self.0 + self.size()
    }

    fn header(self) -> BlockHeader {
        unsafe { self.0.load() }
    }

    pub fn store_header(self, header: BlockHeader) {
        unsafe { self.0.store(header) }
    }

    pub fn prev(self) -> Block {
        Block(self.header().prev)
    }

    pub fn next(self) -> Block {
        Block(self.header().next)
    }

    pub fn size(self) -> usize {
        self.header().size
    }

    pub fn tag_raw(self) -> u32 {
        self.header().tag
    }

    pub fn tag(self) -> Tag {
        let raw = self.tag_raw();
        Tag::from_u32(raw)
            .unwrap_or_else(|| panic!("invalid tag {:#x} in block header at {}", raw, self.0))
    }

    pub fn id(self) -> i32 {
        self.header().id
    }

    pub fn set_prev(self, prev: Block) {
        let mut h = self.header();
        h.prev = prev.0;
        self.store_header(h);
    }

    pub fn set_next(self, next: Block) {
        let mut h = self.header();
        h.next = next.0;
        self.store_header(h);
    }

    pub fn set_size(self, size: usize) {
        let mut h = self.header();
        h.size = size;
        self.store_header(h);
    }

    pub fn set_tag(self, tag: Tag) {
        let mut h = self.header();
        h.tag = tag as u32;
        self.store_header(h);
    }

    pub fn set_id(self, id: i32) {
        let mut h = self.header();
        h.id = id;
        self.store_header(h);
    }

    /// Stamp the trailing guard word.
    pub fn stamp_guard(self) {
        unsafe { (self.end().sub(GUARD_BYTES)).store(ZONEID) }
    }

    /// Verify the trailing guard word is intact.
    pub fn guard_intact(self) -> bool {
        unsafe { (self.end().sub(GUARD_BYTES)).load::<i32>() == ZONEID }
    }
}

/// Load the free-list links of the node at `node` (a payload address or
/// a sentinel's node field).
pub(crate) fn node_links(node: Address) -> FreeNode {
    unsafe { node.load() }
}

pub(crate) fn set_node_links(node: Address, links: FreeNode) {
    unsafe { node.store(links) }
}

pub(crate) fn set_node_prev(node: Address, prev: Address) {
    let mut links = node_links(node);
    links.prev = prev;
    set_node_links(node, links);
}

pub(crate) fn set_node_next(node: Address, next: Address) {
    let mut links = node_links(node);
    links.next = next;
    set_node_links(node, links);
}
