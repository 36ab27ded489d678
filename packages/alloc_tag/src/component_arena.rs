use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::{
    AllocTag, CodeTag, ComponentId, RangeAllocator, RangeContents, RangeIndex, Reservation, Result,
    SectionHooks, TagRef,
};

/// Tag records of the arena, keyed by their offset.
#[derive(Debug, Default)]
pub(crate) struct TagStore {
    records: RwLock<BTreeMap<usize, Arc<AllocTag>>>,
}

impl TagStore {
    fn get(&self, offset: usize) -> Option<Arc<AllocTag>> {
        self.records.read().get(&offset).map(Arc::clone)
    }

    fn insert(&self, offset: usize, tag: Arc<AllocTag>) {
        self.records.write().insert(offset, tag);
    }
}

impl RangeContents for TagStore {
    fn first_in_use(&self, range: Range<usize>) -> Option<TagRef> {
        self.records
            .read()
            .range(range)
            .map(|(_, tag)| tag)
            .find(|tag| tag.read().bytes() != 0)
            .map(|tag| TagRef::from(Arc::clone(tag)))
    }

    fn discard(&self, range: Range<usize>) {
        let mut records = self.records.write();

        let mut tail = records.split_off(&range.start);
        let mut after = tail.split_off(&range.end);
        records.append(&mut after);
    }
}

/// Storage for the tag records of dynamically loaded components.
///
/// One fixed-size arena holds the records of all loaded components. Each component gets a
/// contiguous range sized for its tags, with the record of tag `i` at
/// `range.start + i * record_size`.
///
/// When a component unloads while some of its tags still account for live bytes, its range
/// is kept until those bytes are freed, so that the remaining frees are attributed to the
/// right call sites. Such ranges are reclaimed the next time the arena runs out of space.
#[derive(Debug)]
pub struct ComponentArena {
    ranges: RangeAllocator<ComponentId, TagStore>,
    record_size: usize,
}

impl ComponentArena {
    /// Creates an arena with room for `max_tags` records of `record_size` bytes each.
    #[must_use]
    pub fn new(max_tags: usize, record_size: usize) -> Self {
        let record_size = record_size.max(1);
        let capacity = max_tags.saturating_mul(record_size);

        info!(max_tags, record_size, capacity, "reserved component tag arena");

        Self {
            ranges: RangeAllocator::new(capacity, record_size, TagStore::default()),
            record_size,
        }
    }

    /// Size of one tag record in bytes.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Size of the arena in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ranges.capacity()
    }

    /// Highest offset ever used by a component.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.ranges.high_water()
    }

    /// The ranges currently occupied.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RangeIndex<ComponentId>> {
        self.ranges.snapshot()
    }

    /// The record stored at `offset`, if any.
    #[must_use]
    pub fn tag_at(&self, offset: usize) -> Option<TagRef> {
        self.ranges.contents().get(offset).map(TagRef::from)
    }

    /// Reclaims the ranges of unloaded components whose tags no longer account for any
    /// bytes.
    pub fn cleanup(&self) {
        self.ranges.cleanup();
    }
}

impl SectionHooks for ComponentArena {
    fn needs_section_mem(&self, size: usize) -> bool {
        size >= self.record_size
    }

    fn alloc_section_mem(
        &self,
        component: ComponentId,
        size: usize,
        prepend: usize,
        align: usize,
    ) -> Result<Option<Reservation>> {
        self.ranges.reserve(component, size, prepend, align)
    }

    fn populate_section(&self, reservation: Reservation, tags: Vec<CodeTag>) -> Vec<TagRef> {
        reservation
            .range()
            .step_by(self.record_size)
            .zip(tags)
            .map(|(offset, code)| {
                let tag = Arc::new(AllocTag::new(code));
                self.ranges.contents().insert(offset, Arc::clone(&tag));
                TagRef::from(tag)
            })
            .collect()
    }

    fn free_section_mem(&self, component: ComponentId, still_in_use: bool) {
        self.ranges.release(&component, still_in_use);
    }

    fn component_replaced(&self, old: ComponentId, new: ComponentId) {
        self.ranges.replace_owner(&old, new);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Error, RangeOwner};

    assert_impl_all!(ComponentArena: Send, Sync);

    const RECORD: usize = 32;

    fn codes(count: u32) -> Vec<CodeTag> {
        (0..count)
            .map(|line| CodeTag::owned("comp.rs", line, "f"))
            .collect()
    }

    fn load(arena: &ComponentArena, id: ComponentId, count: u32) -> (Reservation, Vec<TagRef>) {
        let size = count as usize * RECORD;
        let reservation = arena.alloc_section_mem(id, size, 0, 0).unwrap().unwrap();
        let tags = arena.populate_section(reservation, codes(count));
        (reservation, tags)
    }

    #[test]
    fn capacity_is_max_tags_times_record_size() {
        let arena = ComponentArena::new(100, RECORD);

        assert_eq!(arena.capacity(), 3200);
        assert_eq!(arena.record_size(), RECORD);
    }

    #[test]
    fn too_small_sections_are_not_stored() {
        let arena = ComponentArena::new(100, RECORD);

        assert!(!arena.needs_section_mem(RECORD - 1));
        assert!(arena.needs_section_mem(RECORD));
        assert_eq!(
            arena
                .alloc_section_mem(ComponentId::unique(), RECORD - 1, 0, 0)
                .unwrap(),
            None
        );
    }

    #[test]
    fn records_are_placed_at_record_offsets() {
        let arena = ComponentArena::new(100, RECORD);
        let (reservation, tags) = load(&arena, ComponentId::unique(), 3);

        assert_eq!(tags.len(), 3);

        for (index, tag) in tags.iter().enumerate() {
            let offset = reservation.offset() + index * RECORD;
            assert_eq!(&arena.tag_at(offset).unwrap(), tag);
        }

        assert!(arena.tag_at(reservation.offset() + 1).is_none());
        assert_eq!(arena.high_water(), 3 * RECORD);
    }

    #[test]
    fn unload_with_live_bytes_keeps_records() {
        let arena = ComponentArena::new(100, RECORD);
        let id = ComponentId::unique();
        let (reservation, tags) = load(&arena, id, 2);
        tags[1].counters().add(1, 4096);

        arena.free_section_mem(id, false);

        let snapshot = arena.snapshot();
        let entry = snapshot.entry_at(reservation.offset()).unwrap();
        assert_eq!(entry.owner(), &RangeOwner::Unloaded);
        assert_eq!(
            arena.tag_at(reservation.offset() + RECORD).unwrap(),
            tags[1]
        );

        tags[1].counters().sub(1, 4096);
        arena.cleanup();

        assert!(arena.snapshot().is_empty());
        assert!(arena.tag_at(reservation.offset()).is_none());
    }

    #[test]
    fn reused_offset_gets_fresh_record() {
        let arena = ComponentArena::new(100, RECORD);
        let first_id = ComponentId::unique();
        let (first_reservation, first_tags) = load(&arena, first_id, 1);
        arena.free_section_mem(first_id, false);

        let (second_reservation, second_tags) = load(&arena, ComponentId::unique(), 1);

        assert_eq!(first_reservation, second_reservation);
        assert_ne!(first_tags[0], second_tags[0]);

        // The old record is still usable through references taken before the unload.
        first_tags[0].counters().add(1, 8);
        assert_eq!(second_tags[0].read().bytes(), 0);
    }

    #[test]
    fn exhausted_arena_reports_out_of_space() {
        let arena = ComponentArena::new(2, RECORD);
        let id = ComponentId::unique();
        let (_, tags) = load(&arena, id, 2);
        tags[0].counters().add(1, 1);
        arena.free_section_mem(id, false);

        let result = arena.alloc_section_mem(ComponentId::unique(), RECORD, 0, 0);

        assert!(matches!(result, Err(Error::OutOfSpace { .. })));
    }

    #[test]
    fn replaced_component_owns_range() {
        let arena = ComponentArena::new(100, RECORD);
        let old = ComponentId::unique();
        let new = ComponentId::unique();
        let (reservation, _) = load(&arena, old, 1);

        arena.component_replaced(old, new);

        let snapshot = arena.snapshot();
        assert_eq!(
            snapshot.entry_at(reservation.offset()).unwrap().owner(),
            &RangeOwner::Live(new)
        );
    }

    #[test]
    fn discard_only_touches_given_range() {
        let store = TagStore::default();

        for offset in [0, 32, 64, 96] {
            store.insert(offset, Arc::new(AllocTag::new(CodeTag::new("a.rs", 1, "f"))));
        }

        store.discard(32..96);

        assert!(store.get(0).is_some());
        assert!(store.get(32).is_none());
        assert!(store.get(64).is_none());
        assert!(store.get(96).is_some());
    }
}
