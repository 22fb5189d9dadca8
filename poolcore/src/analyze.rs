//! Read-only audits over a snapshot of blocks.
//!
//! Nothing here touches a store or a lock: every function takes the blocks
//! it should look at, so a stale snapshot gives a stale (but consistent)
//! answer. Blocks whose range is empty or inverted are left out of every
//! figure except the status counts.

use crate::{helpe::*, range::{serialize_key, serialize_opt_key}};

/// Bins of the start-position histogram in [`summarize`].
pub const SUMMARY_BINS: usize = 256;

/// Completion of one bin of the puzzle range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinCoverage {
    pub index:      usize,
    pub range:      BigRange,
    #[serde(serialize_with = "serialize_key")]
    pub size:       KeyInt,
    /// Keys of the bin covered by COMPLETED blocks.
    #[serde(serialize_with = "serialize_key")]
    pub completed:  KeyInt,
    pub percent:    f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StatusCounts {
    pub active:     usize,
    pub completed:  usize,
    pub expired:    usize,
}

impl StatusCounts {
    fn bump(&mut self, status: BlockStatus) {
        match status {
            BlockStatus::Active     => self.active += 1,
            BlockStatus::Completed  => self.completed += 1,
            BlockStatus::Expired    => self.expired += 1,
        }
    }
}

/// Everything an operator wants to see at a glance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub total:      usize,
    pub by_status:  StatusCounts,
    pub duplicates: usize,
    pub overlaps:   usize,
    #[serde(serialize_with = "serialize_key")]
    pub total_size: KeyInt,
    #[serde(serialize_with = "serialize_opt_key")]
    pub min_size:   Option<KeyInt>,
    #[serde(serialize_with = "serialize_opt_key")]
    pub max_size:   Option<KeyInt>,
    #[serde(serialize_with = "serialize_opt_key")]
    pub avg_size:   Option<KeyInt>,
    /// Start positions over [`SUMMARY_BINS`] bins.
    pub buckets:    Vec<usize>,
}

fn well_formed(blocks: &[Block]) -> impl Iterator<Item = &Block> {
    blocks.iter().filter(|b| !b.range.is_empty())
}

/// Number of distinct `(start, end)` keys held by more than one block.
///
/// Any such key means a range got handed out twice. Statuses are ignored:
/// a duplicate is worth reporting even if one copy already expired.
pub fn find_duplicates(blocks: &[Block]) -> usize {
    well_formed(blocks)
        .counts_by(|b| &b.range)
        .values()
        .filter(|&&c| c > 1)
        .count()
}

/// Number of ACTIVE/COMPLETED blocks that, in start order, begin before
/// their predecessor ends. Only neighbours are compared.
pub fn find_overlaps(blocks: &[Block]) -> usize {
    well_formed(blocks)
        .filter(|b| b.reserves())
        .map(|b| &b.range)
        .sorted()
        .tuple_windows()
        .filter(|(prev, next)| next.start < prev.end)
        .count()
}

fn check_bins(bound: &BigRange, bin_count: usize) -> PoolResult<KeyInt> {
    let len = bound.length()?;
    if len.is_zero() {
        return Err(PoolError::InvalidRange {
            start:  bound.start.clone(),
            end:    bound.end.clone(),
        });
    }
    if bin_count == 0 {
        return Err(PoolError::InvalidConfig(String::from("bin count must be at least 1")));
    }

    Ok(len)
}

/// Counts block starts per bin: bin `floor(rel * bin_count / len)` of
/// `bound`, where `rel` is the start's offset from `bound.start` (zero for
/// starts below it). Starts at or past `bound.end` land in the last bin.
pub fn histogram(blocks: &[Block], bound: &BigRange, bin_count: usize) -> PoolResult<Vec<usize>> {
    let len = check_bins(bound, bin_count)?;
    let last = bin_count - 1;
    let mut buckets = vec![0; bin_count];
    for b in well_formed(blocks) {
        let rel = bound.offset_of(&b.range.start);
        let idx = (rel * bin_count / &len)
            .to_usize()
            .map_or(last, |i| i.min(last));
        buckets[idx] += 1;
    }

    Ok(buckets)
}

/// Cuts `bound` into `n` contiguous bins of `len / n` keys. The first
/// `len % n` bins get one extra key.
pub fn split_bins(bound: &BigRange, n: usize) -> PoolResult<Vec<BigRange>> {
    let len = check_bins(bound, n)?;
    let base = &len / n;
    let rem = (&len % n).to_usize().unwrap_or_default();
    let mut cursor = bound.start.clone();

    Ok((0..n)
        .map(|i| {
            let size = if i < rem { &base + 1u32 } else { base.clone() };
            let end = &cursor + size;
            BigRange {
                start:  std::mem::replace(&mut cursor, end.clone()),
                end,
            }
        })
        .collect())
}

/// One bin per bit of the puzzle's upper bound, between 1 and 256.
pub fn default_bin_count(bound: &BigRange) -> usize {
    (bound.end.bits() as usize).clamp(1, 256)
}

/// How much of every bin COMPLETED blocks cover.
///
/// A block spanning several bins counts in each for its share only, and a
/// bin's tally never exceeds its size. Overlapping COMPLETED blocks would
/// otherwise push a bin past 100%.
pub fn coverage_by_bin(blocks: &[Block], bound: &BigRange, bin_count: usize) -> PoolResult<Vec<BinCoverage>> {
    let bins = split_bins(bound, bin_count)?;
    let completed = IntervalSet::from_ranges(well_formed(blocks)
        .filter(|b| b.status == BlockStatus::Completed)
        .map(|b| b.range.clone()))?;

    bins.into_par_iter()
        .enumerate()
        .map(|(index, range)| -> PoolResult<BinCoverage> {
            let size = range.length()?;
            let covered: KeyInt = completed
                .iter()
                .map(|c| c.intersection_length(&range))
                .sum();
            let covered = covered.min(size.clone());
            let percent = if size.is_zero() { 0.0 } else {
                // Four decimals survive the trip through f64.
                (&covered * 1_000_000u32 / &size)
                    .to_f64()
                    .unwrap_or_default() / 10_000.0
            };
            Ok(BinCoverage {
                index,
                range,
                size,
                completed: covered,
                percent,
            })
        })
        .collect()
}

/// Blocks touching bin `index` of `bound` cut into `bin_count`, in start
/// order.
pub fn blocks_in_bin<'a>(
    blocks:     &'a [Block],
    bound:      &BigRange,
    bin_count:  usize,
    index:      usize,
) -> PoolResult<Vec<&'a Block>> {
    if index >= bin_count {
        return Err(PoolError::InvalidConfig(format!("bin {index} is out of 0..{bin_count}")));
    }
    let bins = split_bins(bound, bin_count)?;
    let bin = &bins[index];

    Ok(well_formed(blocks)
        .filter(|b| b.range.intersects(bin))
        .sorted_by(|a, b| a.range.cmp(&b.range))
        .collect())
}

/// The whole report in one go.
pub fn summarize(blocks: &[Block], bound: &BigRange) -> PoolResult<PoolSummary> {
    let mut by_status = StatusCounts::default();
    for b in blocks {
        by_status.bump(b.status);
    }

    let sizes = well_formed(blocks)
        .map(|b| b.range.length())
        .collect::<PoolResult<Vec<_>>>()?;
    let total_size: KeyInt = sizes.iter().sum();
    let avg_size = if sizes.is_empty() { None } else { Some(&total_size / sizes.len()) };

    Ok(PoolSummary {
        total:      blocks.len(),
        by_status,
        duplicates: find_duplicates(blocks),
        overlaps:   find_overlaps(blocks),
        min_size:   sizes.iter().min().cloned(),
        max_size:   sizes.iter().max().cloned(),
        avg_size,
        total_size,
        buckets:    histogram(blocks, bound, SUMMARY_BINS)?,
    })
}

/// Where a key sits inside `bound`, in percent with two decimals. Keys
/// below the bound count as 0%.
pub fn relative_percent(bound: &BigRange, key: &KeyInt) -> PoolResult<f64> {
    let len = check_bins(bound, 1)?;
    let scaled = bound.offset_of(key) * 10_000u32 / len;

    Ok(scaled.to_f64().unwrap_or_default() / 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementSample {
    pub range:      BigRange,
    pub percent:    f64,
}

/// How a batch of placements spreads over the puzzle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpreadReport {
    pub samples:    Vec<PlacementSample>,
    pub mean:       f64,
    /// Population standard deviation of the percents.
    pub stddev:     f64,
    /// Samples per 10% slice of the puzzle.
    pub deciles:    [usize; 10],
}

/// Summarises where `placements` start relative to `bound`. Uniform
/// placements should average near 50% with a spread near 28.9%.
pub fn placement_spread(placements: &[BigRange], bound: &BigRange) -> PoolResult<SpreadReport> {
    let samples = placements
        .iter()
        .map(|r| -> PoolResult<PlacementSample> {
            Ok(PlacementSample {
                range:      r.clone(),
                percent:    relative_percent(bound, &r.start)?,
            })
        })
        .collect::<PoolResult<Vec<_>>>()?;

    let n = samples.len().max(1) as f64;
    let mean = samples.iter().map(|s| s.percent).sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s.percent - mean).powi(2)).sum::<f64>() / n;
    let mut deciles = [0; 10];
    for s in &samples {
        deciles[((s.percent / 10.0) as usize).min(9)] += 1;
    }

    Ok(SpreadReport {
        samples,
        mean,
        stddev: variance.sqrt(),
        deciles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn r(s: u64, e: u64) -> BigRange {
        BigRange::from_u64(s, e).unwrap()
    }

    fn k(v: u64) -> KeyInt {
        KeyInt::from(v)
    }

    fn block(s: u64, e: u64, status: BlockStatus) -> Block {
        let t = DateTime::from_timestamp(0, 0).unwrap();
        let mut b = Block::new_active(r(s, e), "w".into(), t, t).unwrap();
        if status != BlockStatus::Active {
            b.apply_transition(status, t);
        }
        b
    }

    #[test]
    fn duplicates_count_keys_not_copies() {
        let blocks = [
            block(0, 10, BlockStatus::Completed),
            block(0, 10, BlockStatus::Expired),
            block(0, 10, BlockStatus::Active),
            block(20, 30, BlockStatus::Active),
            block(20, 30, BlockStatus::Active),
            block(40, 50, BlockStatus::Active),
        ];
        assert_eq!(find_duplicates(&blocks), 2);
        assert_eq!(find_duplicates(&blocks[3..]), 1);
        assert_eq!(find_duplicates(&[]), 0);
    }

    #[test]
    fn overlaps_ignore_expired_blocks() {
        let blocks = [
            block(0, 10, BlockStatus::Completed),
            block(5, 15, BlockStatus::Active),
            block(15, 20, BlockStatus::Active),
            block(16, 30, BlockStatus::Expired),
            block(40, 50, BlockStatus::Completed),
        ];
        assert_eq!(find_overlaps(&blocks), 1);

        // Touching is fine, nesting is not.
        let nested = [
            block(0, 100, BlockStatus::Completed),
            block(10, 20, BlockStatus::Active),
            block(100, 110, BlockStatus::Active),
        ];
        assert_eq!(find_overlaps(&nested), 1);
    }

    #[test]
    fn histogram_places_starts() {
        let bound = r(100, 200);
        let blocks = [
            block(100, 101, BlockStatus::Active),
            block(124, 130, BlockStatus::Active),
            block(125, 130, BlockStatus::Completed),
            block(199, 200, BlockStatus::Expired),
            // Below and beyond the bound.
            block(0, 5, BlockStatus::Active),
            block(500, 505, BlockStatus::Active),
        ];
        assert_eq!(histogram(&blocks, &bound, 4).unwrap(), vec![3, 1, 0, 2]);
        assert_eq!(histogram(&blocks, &bound, 1).unwrap(), vec![6]);
        assert!(histogram(&blocks, &bound, 0).is_err());
        assert!(histogram(&blocks, &r(5, 5), 4).is_err());
    }

    #[rstest]
    #[case(r(0, 10), 3, vec![r(0, 4), r(4, 7), r(7, 10)])]
    #[case(r(5, 13), 4, vec![r(5, 7), r(7, 9), r(9, 11), r(11, 13)])]
    #[case(r(0, 2), 3, vec![r(0, 1), r(1, 2), r(2, 2)])]
    fn bins_cover_the_bound(#[case] bound: BigRange, #[case] n: usize, #[case] want: Vec<BigRange>) {
        assert_eq!(split_bins(&bound, n).unwrap(), want);
    }

    #[rstest]
    #[case(0x0, 0x1, 1)]
    #[case(0x0, 0x100, 9)]
    #[case(0x40, 0x80, 8)]
    fn bin_count_follows_bit_length(#[case] s: u64, #[case] e: u64, #[case] want: usize) {
        assert_eq!(default_bin_count(&r(s, e)), want);
    }

    #[test]
    fn bin_count_caps_at_256() {
        let top = KeyInt::one() << 300u32;
        assert_eq!(default_bin_count(&BigRange::new(KeyInt::zero(), top).unwrap()), 256);
    }

    #[test]
    fn coverage_counts_completed_share_per_bin() {
        let bound = r(0, 100);
        let blocks = [
            // Spans bins 0 and 1.
            block(20, 30, BlockStatus::Completed),
            // Overlaps the first one: must not count twice.
            block(22, 28, BlockStatus::Completed),
            block(60, 80, BlockStatus::Active),
            block(75, 100, BlockStatus::Expired),
        ];
        let cov = coverage_by_bin(&blocks, &bound, 4).unwrap();
        assert_eq!(cov.len(), 4);
        assert_eq!(cov.iter().map(|c| c.completed.clone()).collect_vec(), vec![k(5), k(5), k(0), k(0)]);
        assert_eq!(cov[0].range, r(0, 25));
        assert_eq!(cov[1].size, k(25));
        assert!((cov[0].percent - 20.0).abs() < 1e-9);
        assert_eq!(cov[3].percent, 0.0);

        let full = coverage_by_bin(&[block(0, 100, BlockStatus::Completed)], &bound, 3).unwrap();
        assert!(full.iter().all(|c| (c.percent - 100.0).abs() < 1e-9));
    }

    #[test]
    fn bin_listing() {
        let bound = r(0, 100);
        let blocks = [
            block(60, 70, BlockStatus::Active),
            block(20, 30, BlockStatus::Completed),
            block(45, 55, BlockStatus::Expired),
            block(0, 10, BlockStatus::Active),
        ];
        let found = blocks_in_bin(&blocks, &bound, 2, 1).unwrap();
        assert_eq!(found.iter().map(|b| b.range.clone()).collect_vec(), vec![r(45, 55), r(60, 70)]);
        assert!(blocks_in_bin(&blocks, &bound, 2, 2).is_err());
    }

    #[test]
    fn summary_of_a_small_pool() {
        let bound = r(0, 256);
        let blocks = [
            block(0, 10, BlockStatus::Completed),
            block(5, 9, BlockStatus::Active),
            block(0, 10, BlockStatus::Expired),
            block(255, 256, BlockStatus::Active),
        ];
        let s = summarize(&blocks, &bound).unwrap();
        assert_eq!(s.total, 4);
        assert_eq!(s.by_status, StatusCounts { active: 2, completed: 1, expired: 1 });
        assert_eq!((s.duplicates, s.overlaps), (1, 1));
        assert_eq!(s.total_size, k(25));
        assert_eq!(s.min_size, Some(k(1)));
        assert_eq!(s.max_size, Some(k(10)));
        assert_eq!(s.avg_size, Some(k(6)));
        assert_eq!(s.buckets.len(), SUMMARY_BINS);
        assert_eq!((s.buckets[0], s.buckets[5], s.buckets[255]), (2, 1, 1));

        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["byStatus"]["ACTIVE"], 2);
        assert_eq!(json["totalSize"], "0x19");

        let empty = summarize(&[], &bound).unwrap();
        assert_eq!((empty.min_size, empty.avg_size), (None, None));
    }

    #[test]
    fn spread_of_placements() {
        let bound = r(1_000, 2_000);
        assert_eq!(relative_percent(&bound, &k(1_250)).unwrap(), 25.0);
        assert_eq!(relative_percent(&bound, &k(0)).unwrap(), 0.0);
        assert_eq!(relative_percent(&bound, &k(1_333)).unwrap(), 33.3);

        let report = placement_spread(&[r(1_000, 1_010), r(1_500, 1_510), r(1_990, 2_000)], &bound).unwrap();
        assert_eq!(report.samples.len(), 3);
        assert!((report.mean - 49.667).abs() < 1e-3, "{}", report.mean);
        assert_eq!(report.deciles, [1, 0, 0, 0, 0, 1, 0, 0, 0, 1]);
        assert!(report.stddev > 40.0 && report.stddev < 41.0, "{}", report.stddev);

        let none = placement_spread(&[], &bound).unwrap();
        assert_eq!((none.mean, none.stddev), (0.0, 0.0));
    }
}
