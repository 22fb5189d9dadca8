//! Homes for [`Block`] records.
//!
//! Both stores here implement [`BlockStore`]'s compare-and-swap by taking
//! a store-wide write lock for the duration of one record update. That
//! lock is private to the store; the coordinator's allocation lock is a
//! different thing entirely.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::helpe::*;

#[inline(always)]
fn matches_filter(block: &Block, filter: &[BlockStatus]) -> bool {
    filter.is_empty() || filter.contains(&block.status)
}

/// The compare-and-swap both stores perform under their write lock.
#[inline(always)]
fn swap_status(
    block:      &mut Block,
    expected:   BlockStatus,
    new:        BlockStatus,
    at:         DateTime<Utc>,
) -> bool {
    if block.status != expected || !expected.can_become(new) {
        return false;
    }
    block.apply_transition(new, at);

    true
}
