// ABOUTME: Splits an integer key span into consecutive closed chunks
// ABOUTME: Chunks never overlap, never leave gaps, and stop cleanly at i64::MAX

/// Iterator over `[lo, hi]` chunks covering `min..=max`.
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    next: Option<i64>,
    max: i64,
    span: i64,
}

/// Partition `min..=max` into closed intervals of `size` keys.
///
/// The last interval may be shorter. `min > max` yields nothing; `size` of 0
/// is treated as 1.
pub fn chunk_ranges(min: i64, max: i64, size: u64) -> ChunkRanges {
    let span = i64::try_from(size).unwrap_or(i64::MAX).max(1);
    ChunkRanges {
        next: (min <= max).then_some(min),
        max,
        span,
    }
}

/// Number of chunks `chunk_ranges(min, max, size)` will produce.
pub fn chunk_count(min: i64, max: i64, size: u64) -> u64 {
    if min > max {
        return 0;
    }
    let width = (max as i128 - min as i128) as u128 + 1;
    let size = size.clamp(1, i64::MAX as u64) as u128;
    width.div_ceil(size).min(u64::MAX as u128) as u64
}

impl Iterator for ChunkRanges {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        let lo = self.next?;
        let hi = lo.saturating_add(self.span - 1).min(self.max);
        self.next = if hi >= self.max { None } else { Some(hi + 1) };
        Some((lo, hi))
    }
}
