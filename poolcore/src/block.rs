use crate::helpe::*;

impl Block {
    /// Creates a fresh [`BlockStatus::Active`] block. Refuses empty or
    /// inverted ranges: a block must contain at least one key.
    pub fn new_active(
        range:      BigRange,
        owner:      OwnerToken,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> PoolResult<Self> {
        if range.length()?.is_zero() {
            return Err(PoolError::InvalidRange {
                start:  range.start,
                end:    range.end,
            });
        }

        Ok(Self {
            id:             BlockId::generate(),
            range,
            status:         BlockStatus::Active,
            owner,
            created_at,
            expires_at,
            completed_at:   None,
        })
    }

    /// Returns `true` if the block is still claimed but its deadline has
    /// passed.
    #[inline(always)]
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BlockStatus::Active && self.expires_at < now
    }

    /// Returns `true` if the block's range may not be handed to anyone else.
    #[inline(always)]
    pub fn reserves(&self) -> bool {
        self.status.reserves()
    }

    #[inline(always)]
    pub fn is_owned_by(&self, owner: &OwnerToken) -> bool {
        &self.owner == owner
    }

    /// Applies the bookkeeping of a status change, which is all the stores
    /// need to do once their compare-and-swap succeeded:
    ///
    /// - completion stamps `completed_at`;
    /// - expiry pulls `expires_at` forward to `at` if that is earlier, so an
    ///   abandoned block shows when it was actually let go.
    pub fn apply_transition(&mut self, new: BlockStatus, at: DateTime<Utc>) {
        debug_assert!(self.status.can_become(new), "Illegal transition requested");
        match new {
            BlockStatus::Completed  => { self.completed_at = Some(at); },
            BlockStatus::Expired    => {
                if at < self.expires_at {
                    self.expires_at = at;
                }
            },
            BlockStatus::Active     => {},
        }
        self.status = new;
    }
}
