pub use std::{
    sync::Arc,
    collections::{HashMap, BTreeMap},
    path::{Path, PathBuf},
    fmt,
    time::{Duration, Instant},
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use rayon::prelude::*;
pub use indexmap::IndexMap;
pub use clap::{Parser, Subcommand};
pub use num_bigint::BigUint;
pub use num_traits::{Zero, One, ToPrimitive, CheckedSub, Num};
pub use chrono::{DateTime, Utc};
pub use serde::{Serialize, Deserialize};
pub use rand::Rng;
pub use tracing::{debug, info, warn, instrument};

pub use crate::{BigRange, Block,
    range::{parse_key, parse_hex_key, format_key, format_key_padded},
    intervals::IntervalSet,
    sampler::{WeightedSegmentSampler, SizePolicy, SizeRequest, uniform_below},
    store::{MemoryStore, FileStore},
    lock::{MemoryLock, FileLock, LockGuard, LockPolicy},
    coordinator::{AllocationCoordinator, AllocatorConfig},
    config::PoolConfig,
};

/// The unit of the key space. Puzzle spaces reach 2^256, so this has to be
/// an arbitrary precision integer. A fixed-width type here would silently
/// truncate ranges.
pub type KeyInt = BigUint;

pub type PoolResult<T> = Result<T, PoolError>;

/// Opaque, unique block identifier. Assigned once, at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifies the worker a block was handed to. We never look inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(pub String);

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Where a [`Block`] is in its life.
///
/// ```text
/// (none) --> ACTIVE --> COMPLETED
///               \-----> EXPIRED
/// ```
///
/// [`Completed`](BlockStatus::Completed) and [`Expired`](BlockStatus::Expired)
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    Active,
    Completed,
    Expired,
}

impl BlockStatus {
    pub const ALL: [BlockStatus; 3] = [Self::Active, Self::Completed, Self::Expired];

    /// Statuses whose ranges nobody else may be handed.
    pub const RESERVING: [BlockStatus; 2] = [Self::Active, Self::Completed];

    #[inline(always)]
    pub fn is_terminal(self) -> bool {
        match self {
            Self::Active    => false,
            Self::Completed => true,
            Self::Expired   => true,
        }
    }

    /// Whether the state machine allows going from `self` to `next`.
    #[inline(always)]
    pub fn can_become(self, next: BlockStatus) -> bool {
        match (self, next) {
            (Self::Active, Self::Completed) => true,
            (Self::Active, Self::Expired)   => true,
            _                               => false,
        }
    }

    #[inline(always)]
    pub fn reserves(self) -> bool {
        Self::RESERVING.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active    => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Expired   => "EXPIRED",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can go wrong in the core.
///
/// Callers should branch on [`PoolError::is_retryable`]: a busy lock or a
/// flaky store is worth another try. An exhausted key space is not.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid range {start:#x}..{end:#x}")]
    InvalidRange {
        start:  KeyInt,
        end:    KeyInt,
    },
    #[error("no free segment can hold a block of {size} keys")]
    NoAvailableSegment {
        size:   KeyInt,
    },
    #[error("lock `{key}` could not be acquired within {waited:?}")]
    LockTimeout {
        key:    String,
        waited: Duration,
    },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("block {0} not found")]
    NotFound(BlockId),
    #[error("block {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id:     BlockId,
        from:   BlockStatus,
        to:     BlockStatus,
    },
    #[error("`{0}` is not a valid key or length")]
    InvalidNumber(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::StoreUnavailable(_))
    }
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("malformed store document: {e}"))
    }
}

//---START COLLABORATOR INTERFACES
// The core never talks to a database or a lock server directly. It is
// handed something implementing the traits below. `store` and `lock` ship
// in-memory and file-backed versions; anything else (SQL, Redis, ...) only
// has to honour the same contracts.

/// Persistent home of every [`Block`] ever created.
///
/// Implementations must make [`update_block_status`](BlockStore::update_block_status)
/// a single atomic compare-and-swap per block id. `complete` and
/// `expire_stale` rely on that instead of the global lock.
pub trait BlockStore: Send + Sync {
    /// All blocks whose status is in `filter`, oldest first. An empty
    /// filter means every block.
    fn list_blocks(&self, filter: &[BlockStatus]) -> PoolResult<Vec<Block>>;
    fn get_block(&self, id: &BlockId) -> PoolResult<Option<Block>>;
    fn insert_block(&self, block: Block) -> PoolResult<Block>;
    /// Moves block `id` to `new` iff it is currently `expected`. Returns
    /// `false` when the status did not match or the id is unknown. That is
    /// a benign race, not an error.
    fn update_block_status(
        &self,
        id:         &BlockId,
        expected:   BlockStatus,
        new:        BlockStatus,
        at:         DateTime<Utc>,
    ) -> PoolResult<bool>;
}

/// Token proving ownership of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// A lease-style mutual exclusion primitive: atomic set-if-absent on
/// `acquire`, token-checked `release`. A lease lapses on its own
/// after `ttl`, so a crashed holder cannot wedge the system.
pub trait AllocLock: Send + Sync {
    /// Returns `None` if somebody else holds a live lease on `key`.
    fn acquire(&self, key: &str, ttl: Duration) -> PoolResult<Option<LockToken>>;
    /// Returns `false` if `token` no longer owns `key` (the lease lapsed
    /// and maybe got taken over).
    fn release(&self, key: &str, token: &LockToken) -> PoolResult<bool>;
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn list_blocks(&self, filter: &[BlockStatus]) -> PoolResult<Vec<Block>> {
        (**self).list_blocks(filter)
    }
    fn get_block(&self, id: &BlockId) -> PoolResult<Option<Block>> {
        (**self).get_block(id)
    }
    fn insert_block(&self, block: Block) -> PoolResult<Block> {
        (**self).insert_block(block)
    }
    fn update_block_status(
        &self,
        id:         &BlockId,
        expected:   BlockStatus,
        new:        BlockStatus,
        at:         DateTime<Utc>,
    ) -> PoolResult<bool> {
        (**self).update_block_status(id, expected, new, at)
    }
}

impl<T: AllocLock + ?Sized> AllocLock for Arc<T> {
    fn acquire(&self, key: &str, ttl: Duration) -> PoolResult<Option<LockToken>> {
        (**self).acquire(key, ttl)
    }
    fn release(&self, key: &str, token: &LockToken) -> PoolResult<bool> {
        (**self).release(key, token)
    }
}

/// Source of "now". Swappable so tests can travel in time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
//---END COLLABORATOR INTERFACES

/// Installs the stderr log subscriber shared by the binaries. `RUST_LOG`
/// overrides the default `info` level.
pub fn init_tracing() {
    use std::io::IsTerminal;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .with(filter)
        .try_init()
    {
        eprintln!("Unable to set up logging: {e:?}");
    }
}
