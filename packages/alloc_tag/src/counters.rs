use std::sync::atomic::{self, AtomicI64, AtomicU64};

/// We use `Relaxed` ordering for all counter operations because counters are only ever
/// summed for reporting and never used to synchronize access to other memory. Updates happen
/// on every tagged allocation, so they must cost no more than a plain atomic add.
const COUNTER_ORDERING: atomic::Ordering = atomic::Ordering::Relaxed;

/// Live byte and call counters of one allocation tag.
///
/// Counters may be updated concurrently from any number of threads, including from contexts
/// that must never block. Updates are lock-free.
///
/// The byte counter is signed: a free accounted against a tag before the matching allocation
/// becomes visible may transiently drive it below zero.
///
/// # Example
///
/// ```
/// use alloc_tag::TagCounters;
///
/// let counters = TagCounters::new();
///
/// // One call allocating 4 units of 64 bytes.
/// counters.add(4, 64);
/// counters.sub(1, 64);
///
/// let snapshot = counters.read();
/// assert_eq!(snapshot.bytes(), 192);
/// assert_eq!(snapshot.calls(), 1);
/// ```
#[derive(Debug, Default)]
pub struct TagCounters {
    bytes: AtomicI64,
    calls: AtomicU64,
}

impl TagCounters {
    /// Creates a new set of counters with zero bytes and zero calls.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: AtomicI64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Accounts for one call that allocated `count` units of `size` bytes each.
    #[inline]
    pub fn add(&self, count: usize, size: usize) {
        self.bytes
            .fetch_add(bytes_of(count, size), COUNTER_ORDERING);
        self.calls.fetch_add(1, COUNTER_ORDERING);
    }

    /// Accounts for `count` freed units of `size` bytes each.
    ///
    /// The call counter is not touched.
    #[inline]
    pub fn sub(&self, count: usize, size: usize) {
        self.sub_bytes(bytes_of(count, size));
    }

    /// Subtracts `bytes` from the live byte counter without touching the call counter.
    #[inline]
    pub fn sub_bytes(&self, bytes: i64) {
        self.bytes.fetch_sub(bytes, COUNTER_ORDERING);
    }

    /// Increments the call counter without touching the live byte counter.
    #[inline]
    pub fn inc_calls(&self) {
        self.calls.fetch_add(1, COUNTER_ORDERING);
    }

    /// Takes a snapshot of the current state.
    ///
    /// No synchronization is assumed - the two fields of the snapshot are not guaranteed to
    /// be consistent with each other. Each field has a value that was extant at some recent
    /// point in time.
    #[must_use]
    #[inline]
    pub fn read(&self) -> CountersSnapshot {
        CountersSnapshot {
            bytes: self.bytes.load(COUNTER_ORDERING),
            calls: self.calls.load(COUNTER_ORDERING),
        }
    }
}

/// Point-in-time values of a [`TagCounters`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct CountersSnapshot {
    bytes: i64,
    calls: u64,
}

impl CountersSnapshot {
    /// Live bytes accounted to the tag.
    #[must_use]
    #[inline]
    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    /// Number of accounted calls.
    #[must_use]
    #[inline]
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

// Crate policy is to mangle data rather than panic on values that do not fit, as the
// accounting must never compromise the allocator it observes.
#[expect(
    clippy::cast_possible_wrap,
    reason = "wrapping is intentional - see above comment"
)]
#[inline]
fn bytes_of(count: usize, size: usize) -> i64 {
    (count as i64).wrapping_mul(size as i64)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(TagCounters: Send, Sync);

    #[test]
    fn new_counters_are_zero() {
        let counters = TagCounters::new();

        assert_eq!(counters.read(), CountersSnapshot::default());
    }

    #[test]
    fn add_counts_bytes_and_one_call() {
        let counters = TagCounters::new();

        counters.add(3, 100);
        counters.add(1, 8);

        let snapshot = counters.read();
        assert_eq!(snapshot.bytes(), 308);
        assert_eq!(snapshot.calls(), 2);
    }

    #[test]
    fn sub_leaves_calls_alone() {
        let counters = TagCounters::new();

        counters.add(2, 4096);
        counters.sub(2, 4096);

        let snapshot = counters.read();
        assert_eq!(snapshot.bytes(), 0);
        assert_eq!(snapshot.calls(), 1);
    }

    #[test]
    fn bytes_may_go_negative() {
        let counters = TagCounters::new();

        counters.sub_bytes(10);

        assert_eq!(counters.read().bytes(), -10);
    }

    #[test]
    fn inc_calls_leaves_bytes_alone() {
        let counters = TagCounters::new();

        counters.inc_calls();
        counters.inc_calls();

        let snapshot = counters.read();
        assert_eq!(snapshot.bytes(), 0);
        assert_eq!(snapshot.calls(), 2);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 10_000;

        let counters = TagCounters::new();

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ITERATIONS {
                        counters.add(2, 16);
                        counters.sub(1, 16);
                    }
                });
            }
        });

        let snapshot = counters.read();
        assert_eq!(snapshot.bytes(), 16 * (THREADS * ITERATIONS) as i64);
        assert_eq!(snapshot.calls(), (THREADS * ITERATIONS) as u64);
    }
}
