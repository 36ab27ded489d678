//! Integration tests for page-granularity accounting through `AllocProfiler`.

use std::sync::Arc;

use alloc_tag::{
    AllocProfiler, AllocTag, CodeTag, Config, CountersSnapshot, Error, PageId, ProfilingMode,
    TagRef,
};

const PAGE_SIZE: usize = 4096;

fn profiler(mode: ProfilingMode) -> AllocProfiler {
    profiler_with_checks(mode, true)
}

fn profiler_with_checks(mode: ProfilingMode, debug_checks: bool) -> AllocProfiler {
    AllocProfiler::new(
        &Config::builder()
            .profiling(mode)
            .page_count(32)
            .page_size(PAGE_SIZE)
            .debug_checks(debug_checks)
            .build(),
    )
}

fn tag(function: &'static str) -> TagRef {
    TagRef::from(Arc::new(AllocTag::new(CodeTag::new(
        "mm/pages.rs",
        1,
        function,
    ))))
}

#[test]
fn split_block_freed_page_by_page_balances_bytes() {
    let profiler = profiler(ProfilingMode::Enabled);
    let tag = tag("split_block");

    // One call allocating four pages.
    profiler.on_pages_allocated(PageId::new(4), 2, &tag);
    assert_eq!(tag.read().bytes(), 4 * PAGE_SIZE as i64);

    profiler.on_pages_split(PageId::new(4), 4);

    for index in 4..8 {
        assert_eq!(profiler.page_tag(PageId::new(index)), Some(tag.clone()));
        profiler.on_pages_freed(PageId::new(index), 0);
    }

    let counters = tag.read();
    assert_eq!(counters.bytes(), 0);
    // One call for the allocation plus one for each page split off it.
    assert_eq!(counters.calls(), 4);

    for index in 4..8 {
        assert!(profiler.page_tag(PageId::new(index)).is_none());
    }
}

#[test]
fn free_via_read_and_sub_pages() {
    let profiler = profiler(ProfilingMode::Enabled);
    let tag = tag("deferred_free");

    profiler.on_pages_allocated(PageId::new(0), 1, &tag);

    let owner = profiler.page_tag(PageId::new(0)).unwrap();
    profiler.pages().clear(PageId::new(0));
    profiler.pages().sub_pages(&owner, 2);

    assert_eq!(tag.read().bytes(), 0);
    assert!(profiler.page_tag(PageId::new(0)).is_none());

    // The cleared page frees without charging anyone.
    profiler.on_pages_freed(PageId::new(0), 1);
    assert_eq!(tag.read().bytes(), 0);
}

#[test]
fn disabled_profiling_changes_nothing() {
    let profiler = profiler(ProfilingMode::Disabled);
    let tag = tag("disabled");

    profiler.on_pages_allocated(PageId::new(0), 2, &tag);
    profiler.on_pages_split(PageId::new(0), 4);
    profiler.on_pages_freed(PageId::new(0), 2);
    profiler.account_alloc(&tag, 100);

    assert!(profiler.page_tag(PageId::new(0)).is_none());
    assert_eq!(tag.read(), CountersSnapshot::default());
}

#[test]
fn enabling_at_runtime_starts_tracking() {
    let profiler = profiler_with_checks(ProfilingMode::Disabled, false);
    let tag = tag("late");

    profiler.on_pages_allocated(PageId::new(1), 0, &tag);
    profiler.switch().write_control("1\n").unwrap();
    profiler.on_pages_allocated(PageId::new(2), 0, &tag);

    assert!(profiler.page_tag(PageId::new(1)).is_none());
    assert_eq!(profiler.page_tag(PageId::new(2)), Some(tag.clone()));
    assert_eq!(tag.read().bytes(), PAGE_SIZE as i64);
}

#[test]
fn debug_checks_keep_startup_state() {
    let profiler = profiler(ProfilingMode::Disabled);
    let tag = tag("debug_checked");

    profiler.on_pages_allocated(PageId::new(0), 0, &tag);

    assert!(matches!(
        profiler.switch().write_control("1\n"),
        Err(Error::Locked)
    ));
    assert!(matches!(
        profiler.switch().set_enabled(true),
        Err(Error::Locked)
    ));
    assert_eq!(profiler.switch().read_control(), "0");

    // The page was never tagged and must not be released from anyone.
    profiler.on_pages_freed(PageId::new(0), 0);
    assert!(profiler.page_tag(PageId::new(0)).is_none());
    assert_eq!(tag.read(), CountersSnapshot::default());
}

#[test]
fn never_mode_cannot_be_enabled() {
    let profiler = profiler(ProfilingMode::Never);
    let tag = tag("never");

    assert!(profiler.switch().write_control("1").is_err());
    assert_eq!(profiler.switch().read_control(), "0");

    profiler.on_pages_allocated(PageId::new(0), 0, &tag);
    assert_eq!(tag.read(), CountersSnapshot::default());
}

#[test]
fn untracked_pages_are_ignored() {
    let profiler = profiler(ProfilingMode::Enabled);
    let tag = tag("out_of_range");

    profiler.on_pages_allocated(PageId::new(1000), 0, &tag);
    profiler.on_pages_freed(PageId::new(1000), 0);

    assert!(profiler.page_tag(PageId::new(1000)).is_none());
    assert_eq!(tag.read(), CountersSnapshot::default());
}
