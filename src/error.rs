use thiserror::Error;

/// The recoverable allocator failures. These abort the current operation
/// and surface to the caller, who owns any retry or degraded-mode policy.
/// Integrity violations (bad header id, double free, guard corruption,
/// heap-check failures) are not represented here: they are fatal and
/// panic at the detection site.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// Freeing a null pointer.
    #[error("Z_Free: NULL pointer")]
    NullPointer,

    /// A growable zone could not obtain a new segment from the OS.
    #[error("Z_Malloc: failed on allocation of {size} bytes from the {zone} zone")]
    ZoneGrowFailed {
        /// Which zone the request was routed to.
        zone: &'static str,
        /// The padded block size that could not be satisfied.
        size: usize,
    },

    /// A permanent hunk allocation would overrun the region.
    #[error("Hunk_Alloc failed on {size}")]
    HunkExhausted {
        /// The cacheline-rounded size that could not be satisfied.
        size: usize,
    },

    /// A temporary hunk allocation would overrun the region.
    #[error("Hunk_AllocateTempMemory: failed on {size}")]
    HunkTempExhausted {
        /// The header-inclusive size that could not be satisfied.
        size: usize,
    },
}
