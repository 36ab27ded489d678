use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::{AllocTag, Error, ProfilingSwitch, Result, TagRef};

/// Index of a physical memory page.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PageId(usize);

impl PageId {
    /// Creates a page ID from the page index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The page index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// The page `count` pages after this one, or `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: usize) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
enum PageRecord {
    /// Never tagged, or the tag was released with its bytes.
    #[default]
    Unset,

    /// Explicitly cleared without accounting.
    Empty,

    Tagged(TagRef),
}

/// Exclusive access to the tag record of one page.
///
/// The record stays locked until the handle is dropped.
#[derive(Debug)]
pub struct PageTagHandle<'a> {
    page: PageId,
    record: MutexGuard<'a, PageRecord>,
}

impl PageTagHandle<'_> {
    /// The page this handle grants access to.
    #[must_use]
    pub fn page(&self) -> PageId {
        self.page
    }

    /// The tag the page is attributed to, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&TagRef> {
        match &*self.record {
            PageRecord::Tagged(tag) => Some(tag),
            PageRecord::Unset | PageRecord::Empty => None,
        }
    }

    /// Whether the record was explicitly cleared without accounting.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        matches!(*self.record, PageRecord::Empty)
    }

    /// Attributes the page to `tag`. No counters are touched.
    pub fn update(&mut self, tag: TagRef) {
        *self.record = PageRecord::Tagged(tag);
    }

    /// Marks the record as cleared without accounting. No counters are touched.
    pub fn clear(&mut self) {
        *self.record = PageRecord::Empty;
    }

    /// Resets the record, returning the tag the page was attributed to.
    pub fn take(&mut self) -> Option<TagRef> {
        match mem::take(&mut *self.record) {
            PageRecord::Tagged(tag) => Some(tag),
            PageRecord::Unset | PageRecord::Empty => None,
        }
    }
}

/// Attributes physical memory pages to the tags that allocated them.
///
/// Every page has its own record, so operations on different pages never contend. All
/// operations do nothing while profiling is disabled.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use alloc_tag::{PageId, PageTagTable, ProfilingMode, ProfilingSwitch, TagRef, alloc_tag};
///
/// let switch = Arc::new(ProfilingSwitch::new(ProfilingMode::Enabled));
/// let pages = PageTagTable::new(16, 4096, false, switch);
/// let tag = TagRef::from(alloc_tag!("fill_cache"));
///
/// pages.attach(PageId::new(3), &tag, 2);
/// assert_eq!(tag.read().bytes(), 8192);
/// assert_eq!(pages.read(PageId::new(3)), Some(tag.clone()));
///
/// pages.detach(PageId::new(3), 2);
/// assert_eq!(tag.read().bytes(), 0);
/// ```
#[derive(Debug)]
pub struct PageTagTable {
    records: Box<[Mutex<PageRecord>]>,
    page_size: usize,

    // Log suspicious transitions, like tagging a page that was never released.
    debug_checks: bool,

    switch: Arc<ProfilingSwitch>,
}

impl PageTagTable {
    /// Creates records for `page_count` pages of `page_size` bytes each.
    #[must_use]
    pub fn new(
        page_count: usize,
        page_size: usize,
        debug_checks: bool,
        switch: Arc<ProfilingSwitch>,
    ) -> Self {
        Self {
            records: (0..page_count)
                .map(|_| Mutex::new(PageRecord::Unset))
                .collect(),
            page_size,
            debug_checks,
            switch,
        }
    }

    /// Number of pages that have a record.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.records.len()
    }

    /// Size of one page in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Locks the record of `page`.
    ///
    /// Unlike the other operations, this works even while profiling is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `page` has no record.
    pub fn handle(&self, page: PageId) -> Result<PageTagHandle<'_>> {
        let record = self
            .records
            .get(page.index())
            .ok_or(Error::InvalidHandle { page })?;

        Ok(PageTagHandle {
            page,
            record: record.lock(),
        })
    }

    // Invalid handles are a defect of the caller. Tracking degrades to a no-op.
    fn enabled_handle(&self, page: PageId) -> Option<PageTagHandle<'_>> {
        if !self.switch.is_enabled() {
            return None;
        }

        match self.handle(page) {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(%page, %error, "page tag operation on untracked page");
                None
            }
        }
    }

    /// Attributes `count` pages starting at `page` to `tag`, accounting for one call
    /// allocating them all.
    ///
    /// Only the first page is tagged. Use [`split()`][1] to tag the others.
    ///
    /// [1]: Self::split
    pub fn attach(&self, page: PageId, tag: &TagRef, count: usize) {
        let Some(mut handle) = self.enabled_handle(page) else {
            return;
        };

        if self.debug_checks {
            if let Some(previous) = handle.tag() {
                warn!(%page, previous = %previous.code(), "page tag was not cleared before tagging");
            }
        }

        handle.update(tag.clone());
        tag.counters().add(count, self.page_size);
    }

    /// Releases `count` pages starting at `page` from the tag of the first page.
    ///
    /// The call counter is not touched.
    pub fn detach(&self, page: PageId, count: usize) {
        let Some(mut handle) = self.enabled_handle(page) else {
            return;
        };

        if handle.is_cleared() {
            handle.take();
            return;
        }

        match handle.take() {
            Some(tag) => tag.counters().sub(count, self.page_size),
            None => {
                if self.debug_checks {
                    warn!(%page, "page tag was not set when releasing pages");
                }
            }
        }
    }

    /// After splitting a block of `count` pages starting at `page`, attributes every page
    /// of the block to the tag of the first one.
    ///
    /// Each page beyond the first counts as one additional call, as each will be freed
    /// separately. No bytes are accounted.
    pub fn split(&self, page: PageId, count: usize) {
        let Some(first) = self.enabled_handle(page) else {
            return;
        };

        let Some(tag) = first.tag().cloned() else {
            return;
        };

        // The first record stays locked, so pages are locked in ascending order.
        for offset in 1..count {
            let Some(next) = page.checked_add(offset) else {
                break;
            };

            let Some(mut handle) = self.enabled_handle(next) else {
                continue;
            };

            if self.debug_checks {
                if let Some(previous) = handle.tag() {
                    warn!(
                        page = %next,
                        previous = %previous.code(),
                        "page tag was not cleared before split"
                    );
                }
            }

            handle.update(tag.clone());
            tag.counters().inc_calls();
        }

        drop(first);
    }

    /// The tag `page` is attributed to, if any.
    #[must_use]
    pub fn read(&self, page: PageId) -> Option<TagRef> {
        let handle = self.enabled_handle(page)?;

        let tag = handle.tag().cloned();

        if self.debug_checks && tag.is_none() && !handle.is_cleared() {
            warn!(%page, "page tag was not set when reading it");
        }

        tag
    }

    /// Clears the record of `page` without any accounting.
    pub fn clear(&self, page: PageId) {
        if let Some(mut handle) = self.enabled_handle(page) {
            handle.clear();
        }
    }

    /// Subtracts the bytes of `count` pages from `tag`, typically one obtained via
    /// [`read()`][1] before the pages were freed.
    ///
    /// [1]: Self::read
    pub fn sub_pages(&self, tag: &AllocTag, count: usize) {
        if self.switch.is_enabled() {
            tag.counters().sub(count, self.page_size);
        }
    }
}
