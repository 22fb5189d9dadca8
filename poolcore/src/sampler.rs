use rand::RngCore;

use crate::{helpe::*, intervals::total_length};

/// Draws a uniform integer in `[0, bound)`.
///
/// Fixed-width generators reduced modulo `bound` favour small remainders,
/// and `bound` may be hundreds of bits wide anyway. So we draw exactly
/// `bits(bound)` random bits and start over whenever the result lands at or
/// beyond `bound`. Every value below `bound` is equally likely, and fewer
/// than two rounds are needed on average.
pub fn uniform_below<R: Rng + ?Sized>(rng: &mut R, bound: &KeyInt) -> PoolResult<KeyInt> {
    if bound.is_zero() {
        return Err(PoolError::InvalidRange {
            start:  KeyInt::zero(),
            end:    KeyInt::zero(),
        });
    }
    if bound.is_one() {
        return Ok(KeyInt::zero());
    }

    let bits = bound.bits();
    let num_bytes = bits.div_ceil(8) as usize;
    // Big-endian buffer: the excess bits live in the first byte.
    let top_mask = 0xffu8 >> (num_bytes as u64 * 8 - bits);
    let mut buf = vec![0u8; num_bytes];
    loop {
        rng.fill_bytes(&mut buf);
        buf[0] &= top_mask;
        let cand = KeyInt::from_bytes_be(&buf);
        if &cand < bound {
            break Ok(cand);
        }
    }
}

/// Where block sizes come from when the caller does not insist on one:
/// uniform in `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizePolicy {
    min:    KeyInt,
    max:    KeyInt,
}

impl SizePolicy {
    /// `min` is raised to 1, `max` to `min`.
    pub fn new(min: KeyInt, max: KeyInt) -> Self {
        let min = if min.is_zero() { KeyInt::one() } else { min };
        let max = if max < min { min.clone() } else { max };

        Self { min, max }
    }

    pub fn fixed(size: KeyInt) -> Self {
        Self::new(size.clone(), size)
    }

    pub fn min(&self) -> &KeyInt {
        &self.min
    }

    pub fn max(&self) -> &KeyInt {
        &self.max
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> PoolResult<KeyInt> {
        let span = &self.max - &self.min + KeyInt::one();
        Ok(&self.min + uniform_below(rng, &span)?)
    }
}

/// What a single allocation asks for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SizeRequest {
    /// Draw from the configured [`SizePolicy`].
    #[default]
    Policy,
    /// This many keys, please.
    Exact(KeyInt),
}

impl SizeRequest {
    pub fn resolve<R: Rng + ?Sized>(&self, policy: &SizePolicy, rng: &mut R) -> PoolResult<KeyInt> {
        match self {
            Self::Policy    => policy.draw(rng),
            Self::Exact(s)  => {
                if s.is_zero() {
                    Err(PoolError::InvalidConfig(String::from("requested block length must be at least 1")))
                } else { Ok(s.clone()) }
            },
        }
    }
}

/// A chosen spot for a new block, together with the free segment it was
/// carved out of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub segment:    BigRange,
    pub range:      BigRange,
}

/// Picks where a block of a given size goes among the free segments.
///
/// A segment of length `L` offers `L - S + 1` distinct starting offsets for
/// a block of size `S`; that count is its weight. Choosing a segment in
/// proportion to its weight and then an offset uniformly inside it makes
/// every valid placement across the whole key space equally likely. So
/// the space drains evenly instead of piling up on whatever small gaps
/// happen to be left.
#[derive(Debug, Clone)]
pub struct WeightedSegmentSampler {
    size:           KeyInt,
    // (segment, weight), in ascending segment order.
    candidates:     Vec<(BigRange, KeyInt)>,
    total_weight:   KeyInt,
}

impl WeightedSegmentSampler {
    /// Prepares sampling of `size`-key blocks over `free`.
    ///
    /// A `size` larger than all free space put together is clamped down to
    /// it. Fails with [`PoolError::NoAvailableSegment`] if nothing is free,
    /// or if no single segment is long enough. In that case the space is
    /// too fragmented for `size`, and we never shrink the request silently.
    pub fn new(free: &[BigRange], size: KeyInt) -> PoolResult<Self> {
        let free_total = total_length(free)?;
        if free_total.is_zero() {
            return Err(PoolError::NoAvailableSegment { size });
        }
        Self::build(free, size.min(free_total))
    }

    /// Like [`new`](Self::new) but `size` is taken as is, never clamped.
    pub fn exact(free: &[BigRange], size: KeyInt) -> PoolResult<Self> {
        Self::build(free, size)
    }

    fn build(free: &[BigRange], size: KeyInt) -> PoolResult<Self> {
        if size.is_zero() {
            return Err(PoolError::InvalidConfig(String::from("block length must be at least 1")));
        }

        let mut candidates = vec![];
        let mut total_weight = KeyInt::zero();
        for seg in free {
            let len = seg.length()?;
            if let Some(w) = (len + KeyInt::one()).checked_sub(&size) {
                if w.is_zero() { continue; }
                total_weight += &w;
                candidates.push((seg.clone(), w));
            }
        }
        if candidates.is_empty() {
            return Err(PoolError::NoAvailableSegment { size });
        }

        Ok(Self {
            size,
            candidates,
            total_weight,
        })
    }

    /// The block size actually sampled, after clamping.
    pub fn size(&self) -> &KeyInt {
        &self.size
    }

    pub fn total_weight(&self) -> &KeyInt {
        &self.total_weight
    }

    pub fn candidates(&self) -> impl Iterator<Item = (&BigRange, &KeyInt)> {
        self.candidates.iter().map(|(s, w)| (s, w))
    }

    /// Index into [`candidates`](Self::candidates) of a weighted-random
    /// segment: the first whose running weight sum exceeds a uniform draw
    /// in `[0, total_weight)`.
    pub fn pick_segment<R: Rng + ?Sized>(&self, rng: &mut R) -> PoolResult<usize> {
        let target = uniform_below(rng, &self.total_weight)?;
        let mut acc = KeyInt::zero();
        for (idx, (_, w)) in self.candidates.iter().enumerate() {
            acc += w;
            if target < acc {
                return Ok(idx);
            }
        }
        // Only reachable if `total_weight` disagrees with the candidates.
        Err(PoolError::NoAvailableSegment { size: self.size.clone() })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> PoolResult<Placement> {
        let (segment, weight) = &self.candidates[self.pick_segment(rng)?];
        let start = &segment.start + uniform_below(rng, weight)?;
        let end = &start + &self.size;
        debug_assert!(end <= segment.end, "Placement spills out of its segment");

        Ok(Placement {
            segment:    segment.clone(),
            range:      BigRange { start, end },
        })
    }
}

/// Tries to hand a previously expired range out again.
///
/// Each expired range is intersected with every free segment. Pieces
/// shorter than `shortest` are useless. A usable piece yields a block of
/// `min(size, piece)` keys at its start. We prefer the block closest to
/// `size`; the first best candidate in `expired` order wins, so callers
/// pass their oldest expiries first.
///
/// Drawn sizes accept `size / 2`. An explicit length passes `size` itself,
/// so it comes back whole or not at all.
///
/// Everything returned lies inside a free segment.
pub fn reclaim_placement(
    expired:    &[BigRange],
    free:       &[BigRange],
    size:       &KeyInt,
    shortest:   &KeyInt,
) -> Option<BigRange> {
    let mut best: Option<(KeyInt, BigRange)> = None;

    for (iv, seg) in expired.iter().cartesian_product(free.iter()) {
        let Some(piece) = iv.intersection(seg) else { continue };
        let piece_len = &piece.end - &piece.start;
        if piece_len.is_zero() || &piece_len < shortest { continue; }
        let len = (&piece_len).min(size).clone();
        let diff = size - &len;
        let better = match &best {
            None            => true,
            Some((d, _))    => diff < *d,
        };
        if better {
            let end = &piece.start + &len;
            best = Some((diff, BigRange { start: piece.start, end }));
        }
    }

    best.map(|(_, r)| r)
}
