use crate::helpe::*;

/// A sorted, non-overlapping union of [`BigRange`]s considered *reserved*.
///
/// Two kept intervals never overlap nor touch: inserting a range that
/// reaches an existing one (`new.start <= existing.end` and vice versa)
/// fuses them. Empty ranges are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    merged: Vec<BigRange>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the set in one pass: stable sort by start, then fold left to
    /// right. Reserved ranges may overlap each other arbitrarily, which
    /// is exactly what is expected to come out of a store holding the odd
    /// historical duplicate.
    pub fn from_ranges<I>(ranges: I) -> PoolResult<Self>
    where I: IntoIterator<Item = BigRange> {
        let mut sorted = vec![];
        for r in ranges {
            // Inverted ranges are structural errors, never silently dropped.
            if r.length()?.is_zero() { continue; }
            sorted.push(r);
        }
        sorted.sort();

        let mut merged: Vec<BigRange> = Vec::with_capacity(sorted.len());
        for r in sorted {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => {
                    if r.end > last.end {
                        last.end = r.end;
                    }
                },
                _   => { merged.push(r); }
            }
        }

        Ok(Self { merged })
    }

    /// Inserts `range`, fusing it with every interval it overlaps or
    /// touches. Inserting the same range twice changes nothing.
    pub fn insert(&mut self, range: BigRange) -> PoolResult<()> {
        if range.length()?.is_zero() {
            return Ok(());
        }
        // First interval that could possibly fuse: everything before it
        // ends strictly before our start.
        let lo = self.merged.partition_point(|r| r.end < range.start);
        // One past the last interval that could fuse: it starts at or
        // before our end.
        let hi = self.merged.partition_point(|r| r.start <= range.end);

        if lo >= hi {
            self.merged.insert(lo, range);
        } else {
            let fused = self.merged[lo..hi]
                .iter()
                .fold(range, |acc, r| {
                    acc.merge(r).unwrap_or(acc)
                });
            self.merged.splice(lo..hi, std::iter::once(fused));
        }

        debug_assert!(self.is_canonical(), "IntervalSet lost its shape");
        Ok(())
    }

    /// The complement of the set within `bound`, in ascending order.
    ///
    /// A cursor starts at `bound.start` and walks the reserved intervals
    /// left to right: every time an interval begins beyond the cursor, the
    /// gap in between is free. Whatever is left past the last interval is
    /// the trailing free segment.
    pub fn free_segments(&self, bound: &BigRange) -> PoolResult<Vec<BigRange>> {
        bound.length()?;
        let mut res = vec![];
        let mut cursor = &bound.start;

        for r in &self.merged {
            if r.end <= *cursor { continue; }
            if r.start >= bound.end { break; }
            if r.start > *cursor {
                res.push(BigRange {
                    start:  cursor.clone(),
                    end:    r.start.clone(),
                });
            }
            cursor = &r.end;
            if *cursor >= bound.end { break; }
        }
        if *cursor < bound.end {
            res.push(BigRange {
                start:  cursor.clone(),
                end:    bound.end.clone(),
            });
        }

        Ok(res)
    }

    /// Total number of reserved keys.
    pub fn total_length(&self) -> KeyInt {
        self.merged
            .iter()
            .map(|r| &r.end - &r.start)
            .sum()
    }

    pub fn contains(&self, key: &KeyInt) -> bool {
        let idx = self.merged.partition_point(|r| r.end <= *key);
        self.merged
            .get(idx)
            .is_some_and(|r| r.contains(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BigRange> {
        self.merged.iter()
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    fn is_canonical(&self) -> bool {
        self.merged
            .iter()
            .tuple_windows()
            .all(|(a, b)| a.start < a.end && a.end < b.start)
    }
}

/// Sums the lengths of `segments`.
pub fn total_length(segments: &[BigRange]) -> PoolResult<KeyInt> {
    segments
        .iter()
        .map(|s| s.length())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn r(s: u64, e: u64) -> BigRange {
        BigRange::from_u64(s, e).unwrap()
    }

    fn set(ranges: &[(u64, u64)]) -> IntervalSet {
        IntervalSet::from_ranges(ranges.iter().map(|&(s, e)| r(s, e))).unwrap()
    }

    #[test]
    fn completed_block_splits_the_puzzle() {
        let reserved = set(&[(0x10, 0x20)]);
        let free = reserved.free_segments(&r(0x0, 0x100)).unwrap();
        assert_eq!(free, vec![r(0x0, 0x10), r(0x20, 0x100)]);
    }

    #[test]
    fn overlapping_and_adjacent_inputs_are_fused() {
        let reserved = set(&[(30, 40), (0, 10), (5, 12), (12, 15), (35, 36)]);
        assert_eq!(reserved.iter().cloned().collect_vec(), vec![r(0, 15), r(30, 40)]);
        assert_eq!(reserved.total_length(), KeyInt::from(25u8));
        assert_eq!(
            reserved.free_segments(&r(0, 50)).unwrap(),
            vec![r(15, 30), r(40, 50)]
        );
    }

    #[test]
    fn insert_fuses_neighbours() {
        let mut s = set(&[(0, 5), (10, 15), (20, 25)]);
        s.insert(r(5, 10)).unwrap();
        assert_eq!(s.iter().cloned().collect_vec(), vec![r(0, 15), r(20, 25)]);
        s.insert(r(17, 18)).unwrap();
        assert_eq!(s.len(), 3);
        s.insert(r(14, 30)).unwrap();
        assert_eq!(s.iter().cloned().collect_vec(), vec![r(0, 30)]);
        s.insert(r(3, 3)).unwrap();
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn insert_is_idempotent() {
        let bound = r(0, 1000);
        let mut once = set(&[(100, 200), (500, 510)]);
        once.insert(r(300, 400)).unwrap();
        let mut twice = once.clone();
        twice.insert(r(300, 400)).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.free_segments(&bound).unwrap(), twice.free_segments(&bound).unwrap());
    }

    #[test]
    fn reserved_ranges_outside_bound_are_clipped() {
        let reserved = set(&[(0, 10), (40, 60), (95, 200)]);
        assert_eq!(
            reserved.free_segments(&r(5, 100)).unwrap(),
            vec![r(10, 40), r(60, 95)]
        );
        assert!(set(&[(0, 200)]).free_segments(&r(5, 100)).unwrap().is_empty());
        assert_eq!(
            IntervalSet::new().free_segments(&r(5, 100)).unwrap(),
            vec![r(5, 100)]
        );
    }

    #[test]
    fn inverted_input_is_an_error() {
        let inverted = BigRange { start: KeyInt::from(9u8), end: KeyInt::from(3u8) };
        assert!(IntervalSet::from_ranges([inverted.clone()]).is_err());
        assert!(IntervalSet::new().insert(inverted.clone()).is_err());
        assert!(IntervalSet::new().free_segments(&inverted).is_err());
    }

    #[test]
    fn every_point_is_either_reserved_or_free() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..300 {
            let bound_start = rng.gen_range(0..20u64);
            let bound = r(bound_start, bound_start + rng.gen_range(1..120u64));
            let raw = (0..rng.gen_range(0..12))
                .map(|_| {
                    let s = rng.gen_range(0..150u64);
                    r(s, s + rng.gen_range(0..30u64))
                })
                .collect_vec();

            // Both construction paths must agree.
            let bulk = IntervalSet::from_ranges(raw.clone()).unwrap();
            let mut incremental = IntervalSet::new();
            for x in raw.iter().cloned() {
                incremental.insert(x).unwrap();
            }
            assert_eq!(bulk, incremental);

            let free = bulk.free_segments(&bound).unwrap();
            assert!(free.iter().tuple_windows().all(|(a, b)| a.end < b.start));
            for p in bound_start..bound_start + 120 {
                let key = KeyInt::from(p);
                if !bound.contains(&key) { continue; }
                let reserved = raw.iter().any(|x| x.contains(&key));
                let in_free = free.iter().filter(|f| f.contains(&key)).count();
                assert_eq!(bulk.contains(&key), reserved);
                assert_eq!(in_free, if reserved { 0 } else { 1 }, "point {p}");
            }
        }
    }
}
