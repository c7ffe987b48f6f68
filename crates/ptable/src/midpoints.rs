//! Sampled keys kept in memory to narrow on-disk binary searches.

use crate::entry::IndexEntry;
use crate::error::Result;

type Key = (u64, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Midpoint {
    key: Key,
    index: u64,
}

/// Up to `2^depth` keys sampled evenly across a table, always including the
/// first and the last entry.
#[derive(Debug, Default)]
pub(crate) struct Midpoints {
    points: Vec<Midpoint>,
}

impl Midpoints {
    /// Samples the table through `read_at`.
    ///
    /// Returns `Ok(None)` if the sampled keys are not in table order, which
    /// means the entry section is damaged.
    pub(crate) fn build<F>(count: u64, depth: u32, mut read_at: F) -> Result<Option<Self>>
    where
        F: FnMut(u64) -> Result<IndexEntry>,
    {
        if depth == 0 || count == 0 {
            return Ok(Some(Self::default()));
        }
        let wanted = (1u64 << depth).min(count).max(count.min(2));
        let mut points = Vec::with_capacity(wanted as usize);
        for k in 0..wanted {
            let index = if wanted == 1 {
                0
            } else {
                (u128::from(k) * u128::from(count - 1) / u128::from(wanted - 1)) as u64
            };
            let key = read_at(index)?.key();
            if points.last().is_some_and(|prev: &Midpoint| key > prev.key) {
                return Ok(None);
            }
            points.push(Midpoint { key, index });
        }
        Ok(Some(Self { points }))
    }

    pub(crate) fn len(&self) -> usize {
        self.points.len()
    }

    /// Narrows the search for the first index whose key fails `before`.
    ///
    /// `before` must be true for a (possibly empty) prefix of the table in
    /// table order. The answer lies in the returned inclusive `[lo, hi]`,
    /// where `hi == count` means every entry satisfies `before`.
    pub(crate) fn window<P>(&self, count: u64, before: P) -> (u64, u64)
    where
        P: Fn(Key) -> bool,
    {
        if self.points.is_empty() {
            return (0, count);
        }
        let p = self.points.partition_point(|m| before(m.key));
        let lo = if p == 0 { 0 } else { self.points[p - 1].index + 1 };
        let hi = match self.points.get(p) {
            Some(m) => m.index,
            None => count,
        };
        (lo, hi)
    }
}
