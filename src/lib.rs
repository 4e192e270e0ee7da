//! Memory subsystem of a game engine, replacing generic system
//! allocation on the hot path with two purpose-built allocators:
//!
//! * the **zone** — a general-purpose small-object allocator with tagged
//!   owners, in-band headers, segregated free lists with coalescing, and
//!   on-demand segment growth. Pretty much only used for small strings
//!   and structures.
//! * the **hunk** — one large region with stack allocators coming from
//!   both ends toward the middle, holding everything loaded per level.
//!   Permanent allocations take one end, LIFO temporary file-load
//!   scratch takes the other, and a side-swap heuristic keeps the total
//!   touched pages low across level loads.
//!
//! The design is single-threaded by contract: operations are synchronous
//! and never yield, and every address handed out is stable until it is
//! freed. The [`api`] module exposes the engine-facing operations over a
//! process-wide instance; the [`Zone`] and [`Hunk`] types can also be
//! used as plain values.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod api;
mod error;
pub mod hunk;
mod tag;
pub mod util;
pub mod zone;

pub use crate::error::MemoryError;
pub use crate::hunk::{Bank, Hunk, Preference};
pub use crate::tag::Tag;
pub use crate::util::address::Address;
pub use crate::util::options::Options;
pub use crate::zone::{Zone, ZoneKind, ZoneStats};
