use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};

use crate::{helpe::*, sampler::reclaim_placement};

/// At most this many expired blocks, oldest first, are considered for
/// reclamation on each allocation.
const RECLAIM_SCAN_LIMIT: usize = 200;

/// Knobs of an [`AllocationCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// How long a worker may sit on a block before it can be reclaimed.
    pub block_ttl:          Duration,
    pub lock:               LockPolicy,
    /// Try to hand previously expired ranges out again before drawing a
    /// fresh placement.
    pub reclaim_expired:    bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_ttl:          Duration::from_secs(12 * 60 * 60),
            lock:               LockPolicy::default(),
            reclaim_expired:    false,
        }
    }
}

/// Hands out blocks and drives them through their life.
///
/// Only [`allocate`](Self::allocate) takes the global lock: it is the one
/// read-compute-write sequence where two callers could otherwise end up
/// with overlapping blocks. Every other transition is a per-block
/// compare-and-swap in the store.
pub struct AllocationCoordinator<S: BlockStore, L: AllocLock> {
    store:  S,
    lock:   L,
    config: AllocatorConfig,
    clock:  Arc<dyn Clock>,
    rng:    Mutex<StdRng>,
}

impl<S: BlockStore, L: AllocLock> AllocationCoordinator<S, L> {
    pub fn new(store: S, lock: L, config: AllocatorConfig) -> Self {
        Self {
            store,
            lock,
            config,
            clock:  Arc::new(SystemClock),
            rng:    Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Makes placements reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Claims a fresh block of a size drawn from `sizes` for `owner`.
    pub fn allocate(
        &self,
        owner:  &OwnerToken,
        puzzle: &BigRange,
        sizes:  &SizePolicy,
    ) -> PoolResult<Block> {
        self.allocate_sized(owner, puzzle, sizes, &SizeRequest::Policy)
    }

    /// Claims a fresh block for `owner` somewhere in `puzzle`.
    ///
    /// The whole sequence below runs under the allocation lock, which is
    /// given back on every way out of this function:
    ///
    /// 1. ACTIVE blocks past their deadline are expired on the spot.
    /// 2. Free space is what ACTIVE and COMPLETED blocks leave of `puzzle`.
    /// 3. A drawn size is clamped to the free space left. An
    ///    [`Exact`](SizeRequest::Exact) one is not: if it does not fit, the
    ///    call fails with [`PoolError::NoAvailableSegment`].
    /// 4. With reclamation on, an expired range that still fits is reused.
    ///    A drawn size may come back as short as half of itself this way,
    ///    an exact one never. Otherwise the placement comes from a
    ///    [`WeightedSegmentSampler`].
    /// 5. The block is persisted as ACTIVE.
    #[instrument(skip_all, fields(owner = %owner, puzzle = %puzzle))]
    pub fn allocate_sized(
        &self,
        owner:      &OwnerToken,
        puzzle:     &BigRange,
        sizes:      &SizePolicy,
        request:    &SizeRequest,
    ) -> PoolResult<Block> {
        if puzzle.length()?.is_zero() {
            return Err(PoolError::InvalidRange {
                start:  puzzle.start.clone(),
                end:    puzzle.end.clone(),
            });
        }
        let ttl = chrono::Duration::from_std(self.config.block_ttl)
            .map_err(|e| PoolError::InvalidConfig(format!("block TTL: {e}")))?;

        let guard = LockGuard::acquire(&self.lock, &self.config.lock)?;
        let now = self.clock.now();

        let reserved = self.reserved_ranges(now)?;
        let free = reserved.free_segments(puzzle)?;
        debug!(reserved = reserved.len(), free = free.len(), "computed free space");

        let range = {
            let mut rng = self.rng.lock();
            let wanted = request.resolve(sizes, &mut *rng)?;
            match self.reclaim(&free, &wanted, request)? {
                Some(r) => {
                    info!(range = %r, "reusing expired range");
                    r
                },
                None    => {
                    let sampler = match request {
                        SizeRequest::Policy     => WeightedSegmentSampler::new(&free, wanted)?,
                        SizeRequest::Exact(_)   => WeightedSegmentSampler::exact(&free, wanted)?,
                    };
                    sampler.sample(&mut *rng)?.range
                },
            }
        };

        let block = self.store.insert_block(Block::new_active(range, owner.clone(), now, now + ttl)?)?;
        if guard.outlived_ttl() {
            warn!(
                key = %self.config.lock.key,
                ttl = ?self.config.lock.ttl,
                "allocation outlived its lock lease, overlaps are possible"
            );
        }
        drop(guard);

        info!(id = %block.id, range = %block.range, expires_at = %block.expires_at, "block allocated");
        Ok(block)
    }

    /// Records that the work on `id` was accepted. Validating `proof` is
    /// somebody else's job; it arrives here already trusted.
    #[instrument(skip(self, proof))]
    pub fn complete(&self, id: &BlockId, proof: &str) -> PoolResult<Block> {
        debug!(proof_len = proof.len(), "completing block");
        let block = self.transition(id, BlockStatus::Completed)?;
        info!(range = %block.range, "block completed");

        Ok(block)
    }

    /// Lets the owner of `id` give it up before its deadline. The range
    /// goes straight back to the free pool.
    #[instrument(skip(self))]
    pub fn release(&self, id: &BlockId) -> PoolResult<Block> {
        let block = self.transition(id, BlockStatus::Expired)?;
        info!(range = %block.range, "block released");

        Ok(block)
    }

    /// Expires every ACTIVE block whose deadline lies before `now`. Blocks
    /// that somebody else transitioned in the meantime are skipped.
    /// Returns how many blocks this call expired.
    #[instrument(skip(self))]
    pub fn expire_stale(&self, now: DateTime<Utc>) -> PoolResult<usize> {
        let mut expired = 0;
        for block in self.store.list_blocks(&[BlockStatus::Active])? {
            if !block.is_stale_at(now) { continue; }
            if self.store.update_block_status(&block.id, BlockStatus::Active, BlockStatus::Expired, now)? {
                info!(id = %block.id, range = %block.range, "block expired");
                expired += 1;
            } else {
                debug!(id = %block.id, "block changed under the sweep, skipping");
            }
        }

        Ok(expired)
    }

    /// The newest ACTIVE block of `owner` that is still within its
    /// deadline, if any.
    pub fn active_for(&self, owner: &OwnerToken) -> PoolResult<Option<Block>> {
        let now = self.clock.now();
        Ok(self.store
            .list_blocks(&[BlockStatus::Active])?
            .into_iter()
            .filter(|b| b.is_owned_by(owner) && !b.is_stale_at(now))
            .max_by(|a, b| a.created_at.cmp(&b.created_at)))
    }

    /// Free space of `puzzle` as the next allocation would see it. Takes no
    /// lock, so the answer may be stale by the time it arrives.
    pub fn free_segments(&self, puzzle: &BigRange) -> PoolResult<Vec<BigRange>> {
        let now = self.clock.now();
        let reserved = IntervalSet::from_ranges(self.store
            .list_blocks(&BlockStatus::RESERVING)?
            .into_iter()
            .filter(|b| !b.is_stale_at(now))
            .map(|b| b.range))?;

        reserved.free_segments(puzzle)
    }

    /// Every block in the store, for analytics.
    pub fn snapshot(&self) -> PoolResult<Vec<Block>> {
        self.store.list_blocks(&[])
    }

    /// Ranges nobody may be handed, expiring overdue blocks on the way.
    fn reserved_ranges(&self, now: DateTime<Utc>) -> PoolResult<IntervalSet> {
        let mut reserved = IntervalSet::new();
        for block in self.store.list_blocks(&BlockStatus::RESERVING)? {
            if !block.is_stale_at(now) {
                reserved.insert(block.range)?;
                continue;
            }
            if self.store.update_block_status(&block.id, BlockStatus::Active, BlockStatus::Expired, now)? {
                info!(id = %block.id, range = %block.range, "block expired lazily");
                continue;
            }
            // Lost a race: whatever it became decides whether it still
            // reserves its range.
            match self.store.get_block(&block.id)? {
                Some(fresh) if fresh.reserves() => { reserved.insert(fresh.range)?; },
                _   => {},
            }
        }

        Ok(reserved)
    }

    fn reclaim(&self, free: &[BigRange], size: &KeyInt, request: &SizeRequest) -> PoolResult<Option<BigRange>> {
        if !self.config.reclaim_expired {
            return Ok(None);
        }
        let expired = self.store
            .list_blocks(&[BlockStatus::Expired])?
            .into_iter()
            .sorted_by(|a, b| a.expires_at.cmp(&b.expires_at))
            .take(RECLAIM_SCAN_LIMIT)
            .map(|b| b.range)
            .collect_vec();
        let shortest = match request {
            SizeRequest::Policy     => size >> 1u32,
            SizeRequest::Exact(_)   => size.clone(),
        };

        Ok(reclaim_placement(&expired, free, size, &shortest))
    }

    /// The shared path of `complete` and `release`: only ACTIVE blocks may
    /// move, and losing the compare-and-swap reports what the block turned
    /// into instead.
    fn transition(&self, id: &BlockId, to: BlockStatus) -> PoolResult<Block> {
        let now = self.clock.now();
        let current = self.store
            .get_block(id)?
            .ok_or_else(|| PoolError::NotFound(id.clone()))?;
        let refused = |from| PoolError::InvalidTransition {
            id:     id.clone(),
            from,
            to,
        };
        if !current.status.can_become(to) {
            return Err(refused(current.status));
        }
        if !self.store.update_block_status(id, current.status, to, now)? {
            let raced = self.store
                .get_block(id)?
                .ok_or_else(|| PoolError::NotFound(id.clone()))?;
            warn!(%id, status = %raced.status, "lost a transition race");
            return Err(refused(raced.status));
        }

        self.store
            .get_block(id)?
            .ok_or_else(|| PoolError::NotFound(id.clone()))
    }
}
