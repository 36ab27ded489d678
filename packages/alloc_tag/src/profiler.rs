use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    AllocInfo, AllocTag, CategoryDescriptor, Component, ComponentArena, ComponentId, Config,
    LoadedComponent, PageId, PageTagTable, ProfilingSwitch, Result, TagBytes, TagCategory,
    TagRef, TagRegistry,
};

/// Name of the tag category that holds allocation tags.
pub const ALLOC_TAG_CATEGORY: &str = "alloc_tags";

/// Allocation profiling by call site, ready to be wired into a host allocator.
///
/// The host calls the component lifecycle hooks when it loads and unloads components, the
/// accounting hooks on every tagged allocation and free, and the page hooks from its page
/// allocator. The report is read via [`allocinfo()`][1].
///
/// [1]: Self::allocinfo
///
/// # Example
///
/// ```
/// use alloc_tag::{AllocProfiler, CodeTag, Component, Config, PageId};
///
/// let profiler = AllocProfiler::new(&Config::builder().max_tags(1000).build());
///
/// let component = Component::new("netdrv", vec![CodeTag::owned("drivers/net.rs", 12, "rx_alloc")]);
/// let loaded = profiler.load_component(component).unwrap();
/// let rx_alloc = &loaded.tags()[0];
///
/// // Order 2 means four pages.
/// profiler.on_pages_allocated(PageId::new(8), 2, rx_alloc);
/// assert_eq!(rx_alloc.read().bytes(), 4 * 4096);
///
/// let top = profiler.top_users(1, true);
/// assert_eq!(top[0].tag(), rx_alloc);
///
/// profiler.on_pages_freed(PageId::new(8), 2);
/// assert_eq!(rx_alloc.read().bytes(), 0);
///
/// profiler.unload_component(loaded.id(), false);
/// ```
#[derive(Debug)]
pub struct AllocProfiler {
    switch: Arc<ProfilingSwitch>,
    registry: TagRegistry,
    category: Arc<TagCategory>,
    arena: Arc<ComponentArena>,
    pages: PageTagTable,
}

impl AllocProfiler {
    /// Sets up profiling as described by `config`.
    ///
    /// If profiling is off for good ([`ProfilingMode::Never`][1]), no page records are
    /// created. If [`Config::debug_checks()`] is set, the switch cannot be toggled at
    /// runtime.
    ///
    /// [1]: crate::ProfilingMode::Never
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let switch = Arc::new(if config.debug_checks() {
            ProfilingSwitch::read_only(config.profiling())
        } else {
            ProfilingSwitch::new(config.profiling())
        });

        let record_size = size_of::<AllocTag>();
        let arena = Arc::new(ComponentArena::new(config.max_tags(), record_size));

        let registry = TagRegistry::new();
        let hooks = Arc::clone(&arena);
        let category = registry.register_category(
            CategoryDescriptor::new(ALLOC_TAG_CATEGORY, record_size).with_hooks(hooks),
        );

        let page_count = if switch.is_supported() {
            config.page_count()
        } else {
            0
        };

        let pages = PageTagTable::new(
            page_count,
            config.page_size(),
            config.debug_checks(),
            Arc::clone(&switch),
        );

        info!(
            profiling = ?config.profiling(),
            max_tags = config.max_tags(),
            page_count,
            page_size = config.page_size(),
            "allocation profiling initialized"
        );

        Self {
            switch,
            registry,
            category,
            arena,
            pages,
        }
    }

    /// The global on/off switch.
    #[must_use]
    pub fn switch(&self) -> &ProfilingSwitch {
        &self.switch
    }

    /// Shorthand for `self.switch().is_enabled()`.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    /// All tag categories.
    #[must_use]
    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    /// The category holding allocation tags.
    #[must_use]
    pub fn category(&self) -> &TagCategory {
        &self.category
    }

    /// Storage for the tags of loaded components.
    #[must_use]
    pub fn arena(&self) -> &ComponentArena {
        &self.arena
    }

    /// Per-page tag records.
    #[must_use]
    pub fn pages(&self) -> &PageTagTable {
        &self.pages
    }

    /// Registers tags that are part of the host itself.
    pub fn register_builtin<I>(&self, tags: I)
    where
        I: IntoIterator<Item = &'static AllocTag>,
    {
        self.category.register_builtin(tags);
    }

    /// Whether `size` bytes of component tags would be stored in the tag arena.
    #[must_use]
    pub fn needs_storage(&self, size: usize) -> bool {
        self.category.needs_section_mem(size)
    }

    /// Loads the tags of a component.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`][1] if the tag arena cannot hold the tags of the
    /// component and [`Error::InvalidArgument`][2] if the requested alignment is not a
    /// power of two.
    ///
    /// [1]: crate::Error::OutOfSpace
    /// [2]: crate::Error::InvalidArgument
    pub fn load_component(&self, component: Component) -> Result<LoadedComponent> {
        self.category.load_component(component)
    }

    /// Unloads the tags of a component. Returns whether the component had registered tags.
    ///
    /// If `still_in_use` is set, the storage of the tags is kept for good. Otherwise it is
    /// reused once the tags no longer account for any bytes.
    pub fn unload_component(&self, id: ComponentId, still_in_use: bool) -> bool {
        self.category.unload_component(id, still_in_use)
    }

    /// Transfers the tags of component `old` to component `new`.
    pub fn replace_component(&self, old: ComponentId, new: ComponentId) {
        self.category.replace_component(old, new);
    }

    /// Accounts for one allocation of `size` bytes at the call site of `tag`.
    #[inline]
    pub fn account_alloc(&self, tag: &AllocTag, size: usize) {
        if self.switch.is_enabled() {
            tag.counters().add(1, size);
        }
    }

    /// Accounts for freeing `size` bytes allocated at the call site of `tag`.
    #[inline]
    pub fn account_free(&self, tag: &AllocTag, size: usize) {
        if self.switch.is_enabled() {
            tag.counters().sub(1, size);
        }
    }

    /// Attributes a block of `2^order` pages starting at `page` to `requester`.
    pub fn on_pages_allocated(&self, page: PageId, order: u32, requester: &TagRef) {
        if let Some(count) = pages_in_order(order) {
            self.pages.attach(page, requester, count);
        }
    }

    /// Releases a block of `2^order` pages starting at `page` from its tag.
    pub fn on_pages_freed(&self, page: PageId, order: u32) {
        if let Some(count) = pages_in_order(order) {
            self.pages.detach(page, count);
        }
    }

    /// Attributes all `count` pages of a split block to the tag of its first page.
    pub fn on_pages_split(&self, page: PageId, count: usize) {
        self.pages.split(page, count);
    }

    /// The tag `page` is attributed to, if any.
    #[must_use]
    pub fn page_tag(&self, page: PageId) -> Option<TagRef> {
        self.pages.read(page)
    }

    /// Returns up to `count` allocation tags with the most live bytes, largest first.
    ///
    /// If `can_sleep` is false and a component is being loaded or unloaded, returns an
    /// empty list instead of waiting.
    #[must_use]
    pub fn top_users(&self, count: usize, can_sleep: bool) -> Vec<TagBytes> {
        self.category.top_users(count, can_sleep)
    }

    /// Opens the allocation report at record `position`, blocking component loads and
    /// unloads until the report is dropped.
    #[must_use]
    pub fn allocinfo(&self, position: usize) -> AllocInfo<'_> {
        AllocInfo::new(self.category.lock(), position)
    }
}

fn pages_in_order(order: u32) -> Option<usize> {
    let count = 1_usize.checked_shl(order);

    if count.is_none() {
        warn!(order, "page block order out of range");
    }

    count
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{CodeTag, CountersSnapshot, Error, ProfilingMode, alloc_tag};

    assert_impl_all!(AllocProfiler: Send, Sync);

    #[test]
    fn allocation_category_is_registered() {
        let profiler = AllocProfiler::new(&Config::default());

        let category = profiler.registry().category(ALLOC_TAG_CATEGORY).unwrap();

        assert_eq!(category.tag_size(), size_of::<AllocTag>());
        assert!(profiler.needs_storage(size_of::<AllocTag>()));
        assert!(!profiler.needs_storage(size_of::<AllocTag>() - 1));
    }

    #[test]
    fn never_mode_has_no_page_records() {
        let config = Config::builder().profiling(ProfilingMode::Never).build();

        let profiler = AllocProfiler::new(&config);

        assert_eq!(profiler.pages().page_count(), 0);
        assert!(!profiler.is_enabled());
    }

    #[test]
    fn accounting_follows_switch() {
        let profiler = AllocProfiler::new(&Config::builder().debug_checks(false).build());
        let tag = AllocTag::new(CodeTag::new("a.rs", 1, "f"));

        profiler.account_alloc(&tag, 64);
        profiler.switch().set_enabled(false).unwrap();
        profiler.account_alloc(&tag, 64);
        profiler.account_free(&tag, 64);
        profiler.switch().set_enabled(true).unwrap();
        profiler.account_free(&tag, 32);

        assert_eq!(tag.read().bytes(), 32);
        assert_eq!(tag.read().calls(), 1);
    }

    #[test]
    fn debug_checks_make_switch_read_only() {
        let config = Config::builder()
            .profiling(ProfilingMode::Disabled)
            .debug_checks(true)
            .page_count(4)
            .build();
        let profiler = AllocProfiler::new(&config);
        let tag = TagRef::from(alloc_tag!("debug_mode"));

        profiler.on_pages_allocated(PageId::new(0), 0, &tag);

        assert!(matches!(
            profiler.switch().write_control("1"),
            Err(Error::Locked)
        ));
        assert!(!profiler.is_enabled());

        profiler.on_pages_freed(PageId::new(0), 0);
        assert_eq!(tag.read(), CountersSnapshot::default());
    }

    #[test]
    fn runtime_toggle_allowed_without_debug_checks() {
        let config = Config::builder()
            .profiling(ProfilingMode::Disabled)
            .debug_checks(false)
            .build();
        let profiler = AllocProfiler::new(&config);

        profiler.switch().write_control("1").unwrap();

        assert!(profiler.is_enabled());
        assert!(profiler.switch().is_writable());
    }

    #[test]
    fn huge_order_is_ignored() {
        let profiler = AllocProfiler::new(&Config::builder().page_count(4).build());
        let tag = TagRef::from(alloc_tag!("huge"));

        profiler.on_pages_allocated(PageId::new(0), 200, &tag);

        assert!(profiler.page_tag(PageId::new(0)).is_none());
        assert_eq!(tag.read().calls(), 0);
    }
}
