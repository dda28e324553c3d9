use std::{fmt::Display, num::NonZeroU32};

use crate::{PartitionError, Result};

/// Return the range partition for `rating`.
///
/// Shorthand for building a [`RangePartitioning`] and calling
/// [`RangePartitioning::index_of()`]; see there for the interval rules.
pub fn range_partition_index(rating: f64, partition_count: u32, max_rating: f64) -> Result<u32> {
    RangePartitioning::new(partition_count, max_rating)?.index_of(rating)
}

/// Splits the rating domain `[0, max_rating]` into equal-width intervals.
///
/// With `delta = max_rating / N`, partition 0 covers the closed interval
/// `[0, delta]` and every partition `i > 0` covers `(i * delta, (i + 1) *
/// delta]`. A rating sitting exactly on an interior boundary therefore
/// belongs to the lower partition, and 0 is claimed by partition 0 only.
///
/// Boundaries are always computed by [`Self::boundary()`], so the upper bound
/// of partition `i` and the lower bound of partition `i + 1` are the same
/// float and the intervals cannot gap or overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangePartitioning {
    partition_count: NonZeroU32,
    max_rating: f64,
    delta: f64,
}

impl RangePartitioning {
    pub fn new(partition_count: u32, max_rating: f64) -> Result<Self> {
        let partition_count = NonZeroU32::new(partition_count)
            .ok_or(PartitionError::InvalidPartitionCount { partition_count })?;
        if !max_rating.is_finite() || max_rating <= 0.0 {
            return Err(PartitionError::InvalidMaxRating { max_rating });
        }

        Ok(Self {
            partition_count,
            max_rating,
            delta: max_rating / f64::from(partition_count.get()),
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count.get()
    }

    pub fn max_rating(&self) -> f64 {
        self.max_rating
    }

    /// Width of each interval.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// The `k`-th boundary, `k * delta`, with boundary `N` pinned to exactly
    /// `max_rating`.
    ///
    /// A rating equal to `boundary(k)` belongs to partition `k - 1`. This
    /// holds for the value returned here, not for `k * max_rating / N`: the
    /// two can round to different floats, and the quotient may then land in
    /// partition `k`.
    pub fn boundary(&self, k: u32) -> f64 {
        if k >= self.partition_count() {
            self.max_rating
        } else {
            f64::from(k) * self.delta
        }
    }

    /// The interval covered by partition `index`, or `None` when `index` is
    /// not a partition of this set.
    pub fn interval(&self, index: u32) -> Option<RangeInterval> {
        (index < self.partition_count()).then(|| RangeInterval {
            index,
            lower: self.boundary(index),
            upper: self.boundary(index + 1),
            lower_inclusive: index == 0,
        })
    }

    /// All intervals, in partition order.
    pub fn intervals(&self) -> impl Iterator<Item = RangeInterval> + use<> {
        let this = *self;
        (0..this.partition_count()).filter_map(move |i| this.interval(i))
    }

    /// Return the partition owning `rating`.
    ///
    /// The starting guess is `floor(rating / delta)`. A rating that is an
    /// exact multiple of `delta` sits on the open lower bound of that guess
    /// and moves down one partition (unless it is partition 0). The guess is
    /// then settled against [`Self::boundary()`] so the answer always agrees
    /// with [`RangeInterval::contains()`], even where the division rounds.
    ///
    /// # Errors
    ///
    /// Ratings below 0, above `max_rating`, or NaN are rejected with
    /// [`PartitionError::OutOfRange`] before any index is computed.
    pub fn index_of(&self, rating: f64) -> Result<u32> {
        if !(0.0..=self.max_rating).contains(&rating) {
            return Err(PartitionError::OutOfRange {
                rating,
                max_rating: self.max_rating,
            });
        }

        let last = self.partition_count() - 1;
        // Saturating float to int conversion; rating / delta is non-negative.
        let mut index = ((rating / self.delta).floor() as u32).min(last);

        while index > 0 && rating <= self.boundary(index) {
            index -= 1;
        }
        while index < last && rating > self.boundary(index + 1) {
            index += 1;
        }

        Ok(index)
    }
}

/// The slice of the rating domain owned by a single range partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeInterval {
    index: u32,
    lower: f64,
    upper: f64,
    lower_inclusive: bool,
}

impl RangeInterval {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    /// Whether [`Self::lower()`] is part of the interval. Only true for
    /// partition 0.
    pub fn lower_inclusive(&self) -> bool {
        self.lower_inclusive
    }

    pub fn contains(&self, rating: f64) -> bool {
        let above_lower = if self.lower_inclusive {
            rating >= self.lower
        } else {
            rating > self.lower
        };
        above_lower && rating <= self.upper
    }
}

impl Display for RangeInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = if self.lower_inclusive { '[' } else { '(' };
        write!(f, "{open}{}, {}]", self.lower, self.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, MAX_RATING};
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_five_partitions_of_five() {
        let p = RangePartitioning::new(5, MAX_RATING).unwrap();
        assert_eq!(p.delta(), 1.0);

        assert_eq!(p.index_of(0.0).unwrap(), 0);
        assert_eq!(p.index_of(0.5).unwrap(), 0);
        assert_eq!(p.index_of(1.0).unwrap(), 0);
        assert_eq!(p.index_of(1.5).unwrap(), 1);
        assert_eq!(p.index_of(2.0).unwrap(), 1);
        assert_eq!(p.index_of(4.0).unwrap(), 3);
        assert_eq!(p.index_of(4.5).unwrap(), 4);
        assert_eq!(p.index_of(5.0).unwrap(), 4);
    }

    #[test]
    fn test_shorthand_matches_struct() {
        assert_eq!(range_partition_index(2.0, 5, 5.0).unwrap(), 1);
        assert_eq!(range_partition_index(3.5, 3, 5.0).unwrap(), 2);
        assert_eq!(range_partition_index(5.0, 1, 5.0).unwrap(), 0);
    }

    #[test]
    fn test_out_of_range() {
        for n in [1, 2, 3, 5, 7] {
            for rating in [-0.01, 5.01, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
                let err = range_partition_index(rating, n, 5.0).unwrap_err();
                assert_matches!(err, PartitionError::OutOfRange { .. });
                assert_eq!(err.kind(), ErrorKind::OutOfRange);
            }
        }
    }

    #[test]
    fn test_invalid_arguments() {
        assert_matches!(
            range_partition_index(1.0, 0, 5.0),
            Err(PartitionError::InvalidPartitionCount { partition_count: 0 })
        );
        for max in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = RangePartitioning::new(3, max).unwrap_err();
            assert_matches!(err, PartitionError::InvalidMaxRating { .. });
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn test_intervals() {
        let p = RangePartitioning::new(4, 5.0).unwrap();
        let intervals = p.intervals().collect::<Vec<_>>();
        assert_eq!(intervals.len(), 4);

        assert!(intervals[0].lower_inclusive());
        assert!(intervals[1..].iter().all(|i| !i.lower_inclusive()));
        assert_eq!(intervals[0].lower(), 0.0);
        assert_eq!(intervals[3].upper(), 5.0);
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].upper(), pair[1].lower());
        }

        assert_eq!(intervals[0].to_string(), "[0, 1.25]");
        assert_eq!(intervals[1].to_string(), "(1.25, 2.5]");
        assert!(p.interval(4).is_none());
    }

    #[test]
    fn test_boundary_law_uses_delta_multiples() {
        let p = RangePartitioning::new(11, 5.0).unwrap();
        assert_eq!(p.index_of(p.boundary(5)).unwrap(), 4);

        // rounds above 5 * (5 / 11)
        let quotient = 5.0 * 5.0 / 11.0;
        assert!(quotient > p.boundary(5));
        assert_eq!(p.index_of(quotient).unwrap(), 5);
        assert!(p.interval(5).unwrap().contains(quotient));
    }

    #[test]
    fn test_last_boundary_is_exact_max() {
        let p = RangePartitioning::new(3, 5.0).unwrap();
        assert_eq!(p.boundary(3), 5.0);
        assert_eq!(p.index_of(5.0).unwrap(), 2);
    }

    proptest! {
        /// Every rating in the domain is owned by exactly one interval, and
        /// that interval is the one `index_of` picks.
        #[test]
        fn prop_intervals_partition_domain(
            n in 1u32..50,
            max in 0.5f64..100.0,
            frac in 0.0f64..=1.0,
        ) {
            let p = RangePartitioning::new(n, max).unwrap();
            let rating = (frac * max).min(max);

            let owners = p
                .intervals()
                .filter(|i| i.contains(rating))
                .map(|i| i.index())
                .collect::<Vec<_>>();
            prop_assert_eq!(owners.len(), 1);
            prop_assert_eq!(owners[0], p.index_of(rating).unwrap());
        }

        /// A rating on boundary k belongs to partition k - 1, and 0 belongs
        /// to partition 0.
        #[test]
        fn prop_boundary_law(n in 1u32..50, max in 0.5f64..100.0) {
            let p = RangePartitioning::new(n, max).unwrap();
            prop_assert_eq!(p.index_of(p.boundary(0)).unwrap(), 0);
            for k in 1..=n {
                prop_assert_eq!(p.index_of(p.boundary(k)).unwrap(), k - 1);
            }
        }

        #[test]
        fn prop_never_exceeds_last_partition(n in 1u32..50, frac in 0.0f64..=1.0) {
            let idx = range_partition_index(frac * 5.0, n, 5.0).unwrap();
            prop_assert!(idx < n);
        }
    }
}
