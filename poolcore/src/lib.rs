//! Welcome to `poolcore`!
//!
//! Many independent workers brute-force one huge key space together. This
//! crate decides which sub-range each of them scans next: it carves the
//! puzzle range into non-overlapping [`Block`]s, hands them out under a
//! global lock, takes them back when their owner goes silent, and audits
//! what was handed out after the fact.

mod block;
mod range;

pub mod analyze;
pub mod config;
pub mod coordinator;
pub mod helpe;
pub mod intervals;
pub mod lock;
pub mod sampler;
pub mod store;

pub use crate::helpe::*;

/// A half-open interval `[start, end)` of keys.
///
/// Keys live in spaces as wide as 2^256, so both ends are arbitrary
/// precision integers ([`KeyInt`]). Nothing in this crate narrows them to
/// a machine word.
///
/// Ranges order by [`start`](BigRange::start) first and
/// [`end`](BigRange::end) second, which is the order every sweep in the
/// crate walks them in.
///
/// > ***ATTENTION:*** the fields are public so that stores and parsers can
/// > move ranges around freely. That also means an inverted range can exist
/// > in memory. [`BigRange::new`] is the gatekeeper: it refuses inverted
/// > bounds, and [`BigRange::length`] re-checks on every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "range::RangeRepr", into = "range::RangeRepr")]
pub struct BigRange {
    // Field order matters: the derived `Ord` is (start, end).
    pub start:  KeyInt,
    pub end:    KeyInt,
}

/// A claimed or historical sub-range of the puzzle range.
///
/// Blocks are never deleted. A block is born [`Active`](BlockStatus::Active)
/// and ends its life either [`Completed`](BlockStatus::Completed) (the range
/// stays reserved forever) or [`Expired`](BlockStatus::Expired) (the range
/// goes back to the free pool). Either way the record stays around for
/// auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id:             BlockId,
    pub range:          BigRange,
    pub status:         BlockStatus,
    /// Whoever asked for the block. Opaque to us.
    pub owner:          OwnerToken,
    pub created_at:     DateTime<Utc>,
    /// Past this instant an [`Active`](BlockStatus::Active) block may be
    /// reclaimed.
    pub expires_at:     DateTime<Utc>,
    /// Only ever set by the transition to [`Completed`](BlockStatus::Completed).
    #[serde(default)]
    pub completed_at:   Option<DateTime<Utc>>,
}
