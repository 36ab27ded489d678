//! Integration tests for loading and unloading components through `AllocProfiler`.

#![allow(clippy::indexing_slicing, reason = "panic is fine in tests")]

use alloc_tag::{
    AllocProfiler, CodeTag, Component, ComponentId, Config, Error, RangeOwner, alloc_tag,
};

fn profiler(max_tags: usize) -> AllocProfiler {
    AllocProfiler::new(&Config::builder().max_tags(max_tags).page_count(64).build())
}

fn component(name: &str, tag_count: u32) -> Component {
    let tags = (0..tag_count)
        .map(|line| CodeTag::owned(format!("{name}/lib.rs"), line, "alloc"))
        .collect();

    Component::new(name, tags)
}

fn live_owners(profiler: &AllocProfiler) -> Vec<ComponentId> {
    profiler
        .arena()
        .snapshot()
        .entries()
        .filter_map(|entry| match entry.owner() {
            RangeOwner::Live(id) => Some(*id),
            _ => None,
        })
        .collect()
}

#[test]
fn unload_of_idle_component_frees_its_storage() {
    let profiler = profiler(100);

    let loaded = profiler.load_component(component("idle", 4)).unwrap();
    assert_eq!(live_owners(&profiler), vec![loaded.id()]);

    assert!(profiler.unload_component(loaded.id(), false));

    assert!(profiler.arena().snapshot().is_empty());
    assert_eq!(profiler.category().tag_count(), 0);
}

#[test]
fn unload_of_busy_component_keeps_storage_until_freed() {
    let profiler = profiler(100);

    let loaded = profiler.load_component(component("busy", 2)).unwrap();
    let busy = loaded.tags()[1].clone();
    profiler.account_alloc(&busy, 512);

    profiler.unload_component(loaded.id(), false);

    // The tag is gone from the report but its storage stays reserved.
    assert_eq!(profiler.category().tag_count(), 0);
    let snapshot = profiler.arena().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(matches!(
        snapshot.entries().next().unwrap().owner(),
        RangeOwner::Unloaded
    ));

    // Frees after the unload are still charged to the right tag.
    profiler.account_free(&busy, 512);
    assert_eq!(busy.read().bytes(), 0);

    profiler.arena().cleanup();
    assert!(profiler.arena().snapshot().is_empty());
}

#[test]
fn still_in_use_component_keeps_storage_for_good() {
    let profiler = profiler(100);

    let loaded = profiler.load_component(component("pinned", 1)).unwrap();

    profiler.unload_component(loaded.id(), true);
    profiler.arena().cleanup();

    assert_eq!(live_owners(&profiler), vec![loaded.id()]);
}

#[test]
fn replaced_component_unloads_under_new_identity() {
    let profiler = profiler(100);

    let loaded = profiler.load_component(component("old", 2)).unwrap();
    let successor = ComponentId::unique();

    profiler.replace_component(loaded.id(), successor);
    assert_eq!(live_owners(&profiler), vec![successor]);

    assert!(!profiler.unload_component(loaded.id(), false));
    assert!(profiler.unload_component(successor, false));
    assert!(profiler.arena().snapshot().is_empty());
}

#[test]
fn full_arena_is_reclaimed_once_tags_drain() {
    let profiler = profiler(4);

    let first = profiler.load_component(component("first", 4)).unwrap();
    let leaked = first.tags()[0].clone();
    profiler.account_alloc(&leaked, 64);
    profiler.unload_component(first.id(), false);

    let result = profiler.load_component(component("second", 4));
    assert!(matches!(result, Err(Error::OutOfSpace { .. })));

    profiler.account_free(&leaked, 64);

    let second = profiler.load_component(component("second", 4)).unwrap();
    assert_eq!(live_owners(&profiler), vec![second.id()]);
    assert_eq!(profiler.arena().high_water(), profiler.arena().capacity());
}

#[test]
fn aligned_component_storage_is_aligned() {
    let profiler = profiler(100);

    profiler.load_component(component("unaligned", 1)).unwrap();
    let aligned = profiler
        .load_component(component("aligned", 2).with_layout(8, 256))
        .unwrap();

    let reservation = aligned.reservation().unwrap();
    assert_eq!(reservation.offset() % 256, 0);
}

#[test]
fn bad_alignment_is_rejected() {
    let profiler = profiler(100);

    let result = profiler.load_component(component("odd", 1).with_layout(0, 3));

    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    assert_eq!(profiler.category().tag_count(), 0);
}

#[test]
fn component_without_tags_is_not_registered() {
    let profiler = profiler(100);

    let loaded = profiler.load_component(component("empty", 0)).unwrap();

    assert!(loaded.tags().is_empty());
    assert!(loaded.reservation().is_none());
    assert!(!profiler.unload_component(loaded.id(), false));
}

#[test]
fn report_lists_builtin_then_component_tags() {
    let profiler = profiler(100);
    let builtin = alloc_tag!("boot_alloc");
    profiler.register_builtin([builtin]);
    profiler.account_alloc(builtin, 100);

    let loaded = profiler.load_component(component("drv", 1)).unwrap();
    profiler.account_alloc(&loaded.tags()[0], 7);

    let mut report = String::new();
    profiler.allocinfo(0).write_to(&mut report).unwrap();

    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "allocinfo - version: 1.0");
    assert_eq!(lines[1], "#     <size>  <calls> <tag info>");
    assert!(lines[2].starts_with("         100        1 "));
    assert!(lines[2].ends_with(" func:boot_alloc "));
    assert_eq!(lines[3], "           7        1 drv/lib.rs:0 [drv] func:alloc ");

    let resumed: Vec<_> = profiler.allocinfo(1).collect();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].bytes(), 7);
}
