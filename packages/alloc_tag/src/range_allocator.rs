use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{Error, Result, TagRef};

/// Who owns a range of the arena.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RangeOwner<O> {
    /// The range holds the records of a live owner.
    Live(O),

    /// The owner is gone but some records in the range still account for live bytes,
    /// so the range cannot be reused yet.
    Unloaded,

    /// Alignment and prepend bytes placed in front of the range that follows.
    Padding,
}

/// One occupied range of the arena.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeEntry<O> {
    range: Range<usize>,
    owner: RangeOwner<O>,
}

impl<O> RangeEntry<O> {
    /// The occupied byte offsets. Never empty.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// The owner of the range.
    #[must_use]
    pub fn owner(&self) -> &RangeOwner<O> {
        &self.owner
    }
}

/// Immutable view of the occupied ranges of an arena, ordered by start offset.
///
/// Any offset not covered by an entry is free.
#[derive(Clone, Debug)]
pub struct RangeIndex<O> {
    entries: BTreeMap<usize, RangeEntry<O>>,
}

impl<O> RangeIndex<O>
where
    O: Clone + Eq,
{
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Occupied ranges in ascending order.
    pub fn entries(&self) -> impl Iterator<Item = &RangeEntry<O>> {
        self.entries.values()
    }

    /// Number of occupied ranges, padding included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the whole arena is free.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry covering `offset`, if the offset is occupied.
    #[must_use]
    pub fn entry_at(&self, offset: usize) -> Option<&RangeEntry<O>> {
        self.entries
            .range(..=offset)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.range.contains(&offset))
    }

    /// Start offsets of all ranges owned by `owner`.
    fn starts_owned_by(&self, owner: &O) -> Vec<usize> {
        self.entries
            .values()
            .filter(|entry| matches!(&entry.owner, RangeOwner::Live(o) if o == owner))
            .map(|entry| entry.range.start)
            .collect()
    }

    /// Start offsets of all unloaded ranges.
    fn unloaded_starts(&self) -> Vec<usize> {
        self.entries
            .values()
            .filter(|entry| entry.owner == RangeOwner::Unloaded)
            .map(|entry| entry.range.start)
            .collect()
    }

    /// Finds the lowest free gap of at least `size` bytes below `capacity`.
    fn find_gap(&self, capacity: usize, size: usize) -> Option<usize> {
        let mut cursor = 0_usize;

        for entry in self.entries.values() {
            if entry.range.start.saturating_sub(cursor) >= size {
                return Some(cursor);
            }

            cursor = entry.range.end;
        }

        (capacity.saturating_sub(cursor) >= size).then_some(cursor)
    }

    fn insert(&mut self, range: Range<usize>, owner: RangeOwner<O>) {
        debug_assert!(!range.is_empty());
        self.entries.insert(range.start, RangeEntry { range, owner });
    }

    fn remove(&mut self, start: usize) -> Option<RangeEntry<O>> {
        self.entries.remove(&start)
    }

    fn relabel(&mut self, start: usize, owner: RangeOwner<O>) {
        if let Some(entry) = self.entries.get_mut(&start) {
            entry.owner = owner;
        }
    }

    /// Removes the padding entry that ends exactly at `start`, if there is one.
    fn remove_padding_before(&mut self, start: usize) {
        let padding_start = self
            .entries
            .range(..start)
            .next_back()
            .filter(|(_, entry)| entry.owner == RangeOwner::Padding && entry.range.end == start)
            .map(|(padding_start, _)| *padding_start);

        if let Some(padding_start) = padding_start {
            self.entries.remove(&padding_start);
        }
    }
}

/// A range handed out by [`RangeAllocator::reserve()`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Reservation {
    offset: usize,
    size: usize,
}

impl Reservation {
    /// Offset of the first byte of the payload. Satisfies the requested alignment.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the payload in bytes, excluding prepended bytes and padding.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The payload byte offsets.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        // Cannot overflow: the allocator only hands out ranges inside its capacity.
        self.offset..self.offset.wrapping_add(self.size)
    }
}

/// The records stored in arena ranges, as seen by the [`RangeAllocator`].
///
/// The allocator only manages offsets. It asks its contents whether a range still
/// accounts for live bytes before reusing it.
pub trait RangeContents: Debug + Send + Sync {
    /// Returns the first record in `range` whose byte counter is not zero.
    fn first_in_use(&self, range: Range<usize>) -> Option<TagRef>;

    /// Drops all records in `range`. Called when the range is freed for reuse.
    fn discard(&self, range: Range<usize>);
}

/// Carves owner-specific ranges out of one fixed-size arena of byte offsets.
///
/// Readers take lock-free snapshots of the occupied ranges via [`snapshot()`][1]. Writers
/// are serialized and publish a modified copy of the index when done.
///
/// [1]: RangeAllocator::snapshot
#[derive(Debug)]
pub struct RangeAllocator<O, C> {
    capacity: usize,

    // Requests smaller than this are not tracked at all.
    min_size: usize,

    index: ArcSwap<RangeIndex<O>>,

    // Highest payload end ever handed out. Never decreases.
    high_water: AtomicUsize,

    writer: Mutex<()>,

    contents: C,
}

impl<O, C> RangeAllocator<O, C>
where
    O: Clone + Eq + Debug,
    C: RangeContents,
{
    /// Creates an allocator for the offsets `0..capacity` with every offset free.
    ///
    /// A `min_size` of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize, min_size: usize, contents: C) -> Self {
        Self {
            capacity,
            min_size: min_size.max(1),
            index: ArcSwap::from_pointee(RangeIndex::new()),
            high_water: AtomicUsize::new(0),
            writer: Mutex::new(()),
            contents,
        }
    }

    /// Size of the arena in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Smallest request that is tracked.
    #[must_use]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Highest payload end ever handed out.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water.load(atomic::Ordering::Relaxed)
    }

    /// The records stored in the arena.
    #[must_use]
    pub fn contents(&self) -> &C {
        &self.contents
    }

    /// A consistent view of the occupied ranges at some recent point in time.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RangeIndex<O>> {
        self.index.load_full()
    }

    /// Reserves `size` payload bytes for `owner`, preceded by `prepend` bytes, with the
    /// payload start aligned to `align` (0 and 1 both mean unaligned).
    ///
    /// Returns `Ok(None)` if `size` is below [`min_size()`][1], meaning the request is
    /// not tracked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `align` is not a power of two and
    /// [`Error::OutOfSpace`] if no free range fits even after reclaiming unloaded ranges
    /// that are no longer in use.
    ///
    /// [1]: Self::min_size
    pub fn reserve(
        &self,
        owner: O,
        size: usize,
        prepend: usize,
        align: usize,
    ) -> Result<Option<Reservation>> {
        if size < self.min_size {
            return Ok(None);
        }

        let align = align.max(1);

        if !align.is_power_of_two() {
            return Err(Error::invalid_argument(
                align.to_string(),
                "alignment must be a power of two",
            ));
        }

        let requested = size.checked_add(prepend).ok_or(Error::OutOfSpace {
            requested: usize::MAX,
            capacity: self.capacity,
        })?;

        let _writer = self.writer.lock();
        let mut index = RangeIndex::clone(&self.index.load());

        let mut cleaned_up = false;

        let (gap_start, offset) = loop {
            if let Some(placement) = self.place(&index, size, prepend, align) {
                break placement;
            }

            if cleaned_up {
                // Reclaimed ranges stay reclaimed even though the request failed.
                self.index.store(Arc::new(index));

                warn!(
                    ?owner,
                    requested,
                    capacity = self.capacity,
                    "tag arena is out of space"
                );

                return Err(Error::OutOfSpace {
                    requested,
                    capacity: self.capacity,
                });
            }

            self.reclaim_unused(&mut index);
            cleaned_up = true;
        };

        // Cannot overflow: the placement lies within capacity.
        let end = offset.wrapping_add(size);

        if offset != gap_start {
            index.insert(gap_start..offset, RangeOwner::Padding);
        }

        index.insert(offset..end, RangeOwner::Live(owner.clone()));
        self.index.store(Arc::new(index));

        self.high_water.fetch_max(end, atomic::Ordering::Relaxed);

        debug!(?owner, offset, size, prepend, align, "reserved tag range");

        Ok(Some(Reservation { offset, size }))
    }

    /// Finds the gap start and aligned payload offset for a request.
    fn place(
        &self,
        index: &RangeIndex<O>,
        size: usize,
        prepend: usize,
        align: usize,
    ) -> Option<(usize, usize)> {
        let exact = prepend.checked_add(size)?;

        if let Some(gap_start) = index.find_gap(self.capacity, exact) {
            let offset = gap_start.checked_add(prepend)?;

            if offset.checked_next_multiple_of(align) == Some(offset) {
                return Some((gap_start, offset));
            }
        }

        let padded = exact.checked_add(align.wrapping_sub(1))?;
        let gap_start = index.find_gap(self.capacity, padded)?;
        let offset = gap_start
            .checked_add(prepend)?
            .checked_next_multiple_of(align)?;

        Some((gap_start, offset))
    }

    /// Gives back all ranges of `owner`.
    ///
    /// Ranges whose records no longer account for any bytes are freed immediately. The
    /// others are marked unloaded and reclaimed by a later [`cleanup()`][1] once their
    /// bytes drop to zero. Padding in front of a released range is freed either way.
    ///
    /// Does nothing if `force_keep` is set, leaving the ranges to the owner for good.
    ///
    /// [1]: Self::cleanup
    pub fn release(&self, owner: &O, force_keep: bool) {
        if force_keep {
            debug!(?owner, "keeping tag ranges of owner that is still in use");
            return;
        }

        let _writer = self.writer.lock();
        let mut index = RangeIndex::clone(&self.index.load());

        for start in index.starts_owned_by(owner) {
            let Some(range) = index.entry_at(start).map(RangeEntry::range) else {
                continue;
            };

            if let Some(tag) = self.contents.first_in_use(range.clone()) {
                info!(
                    ?owner,
                    tag = %tag.code(),
                    bytes = tag.read().bytes(),
                    "tag still has bytes allocated at unload"
                );

                index.relabel(start, RangeOwner::Unloaded);
            } else {
                index.remove(start);
                self.contents.discard(range.clone());

                debug!(?owner, ?range, "freed tag range");
            }

            index.remove_padding_before(start);
        }

        self.index.store(Arc::new(index));
    }

    /// Hands all ranges of `old` over to `new`.
    pub fn replace_owner(&self, old: &O, new: O) {
        let _writer = self.writer.lock();
        let mut index = RangeIndex::clone(&self.index.load());

        for start in index.starts_owned_by(old) {
            index.relabel(start, RangeOwner::Live(new.clone()));
        }

        self.index.store(Arc::new(index));
    }

    /// Frees every unloaded range whose records no longer account for any bytes.
    pub fn cleanup(&self) {
        let _writer = self.writer.lock();
        let mut index = RangeIndex::clone(&self.index.load());

        self.reclaim_unused(&mut index);

        self.index.store(Arc::new(index));
    }

    // Counters are read without synchronization, so a range may be judged in use a
    // moment after its last bytes were freed. It is then reclaimed by a later pass.
    fn reclaim_unused(&self, index: &mut RangeIndex<O>) {
        for start in index.unloaded_starts() {
            let Some(range) = index.entry_at(start).map(RangeEntry::range) else {
                continue;
            };

            if self.contents.first_in_use(range.clone()).is_none() {
                index.remove(start);
                self.contents.discard(range.clone());

                debug!(?range, "reclaimed unloaded tag range");
            }
        }
    }
}
