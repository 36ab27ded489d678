use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::{AllocTag, CodeTag, Reservation, Result, TagRef};

/// Global counter for generating unique component IDs.
static COMPONENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a dynamically loaded component.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ComponentId(u64);

impl ComponentId {
    /// Generates an ID that no other component in the process has.
    #[must_use]
    pub fn unique() -> Self {
        Self(COMPONENT_ID_COUNTER.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component#{}", self.0)
    }
}

/// Storage management callbacks of a tag category whose component tags are not kept
/// inside the components themselves.
pub trait SectionHooks: Debug + Send + Sync {
    /// Whether tags occupying `size` bytes are stored by the hooks at all.
    fn needs_section_mem(&self, size: usize) -> bool;

    /// Reserves storage for `size` bytes of tags of `component`.
    ///
    /// Returns `Ok(None)` if the tags are not tracked by the hooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be reserved.
    fn alloc_section_mem(
        &self,
        component: ComponentId,
        size: usize,
        prepend: usize,
        align: usize,
    ) -> Result<Option<Reservation>>;

    /// Creates the tag records for `tags` in the reserved storage.
    fn populate_section(&self, reservation: Reservation, tags: Vec<CodeTag>) -> Vec<TagRef>;

    /// Gives back the storage of `component`, unless `still_in_use` says to keep it.
    fn free_section_mem(&self, component: ComponentId, still_in_use: bool);

    /// Transfers the storage of `old` to `new`.
    fn component_replaced(&self, old: ComponentId, new: ComponentId);
}

/// Static description of a tag category.
#[derive(Clone, Debug)]
pub struct CategoryDescriptor {
    name: &'static str,
    tag_size: usize,
    hooks: Option<Arc<dyn SectionHooks>>,
}

impl CategoryDescriptor {
    /// Describes a category whose tags take `tag_size` bytes each.
    #[must_use]
    pub fn new(name: &'static str, tag_size: usize) -> Self {
        Self {
            name,
            tag_size,
            hooks: None,
        }
    }

    /// Attaches storage management callbacks to the category.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn SectionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

/// A component that is about to be loaded, with the call sites it contains.
#[derive(Clone, Debug)]
pub struct Component {
    id: ComponentId,
    name: Arc<str>,
    tags: Vec<CodeTag>,
    prepend: usize,
    align: usize,
}

impl Component {
    /// Describes a component with a fresh unique ID and unaligned tag storage.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, tags: Vec<CodeTag>) -> Self {
        Self {
            id: ComponentId::unique(),
            name: name.into(),
            tags,
            prepend: 0,
            align: 1,
        }
    }

    /// Requests `prepend` bytes in front of the tag storage and the storage start to be
    /// aligned to `align` bytes.
    #[must_use]
    pub fn with_layout(mut self, prepend: usize, align: usize) -> Self {
        self.prepend = prepend;
        self.align = align;
        self
    }

    /// The ID of the component.
    #[must_use]
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// The name of the component.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The call sites contained in the component.
    #[must_use]
    pub fn tags(&self) -> &[CodeTag] {
        &self.tags
    }
}

/// The tags of a component that has been loaded into a [`TagCategory`].
#[derive(Clone, Debug)]
pub struct LoadedComponent {
    id: ComponentId,
    tags: Arc<[TagRef]>,
    reservation: Option<Reservation>,
}

impl LoadedComponent {
    /// The ID of the component.
    #[must_use]
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// The tag records of the component, in the order of its call sites.
    #[must_use]
    pub fn tags(&self) -> &[TagRef] {
        &self.tags
    }

    /// Where the section hooks stored the tags, if they stored them.
    #[must_use]
    pub fn reservation(&self) -> Option<Reservation> {
        self.reservation
    }
}

#[derive(Debug)]
struct ComponentEntry {
    // None for built-in tags.
    id: Option<ComponentId>,
    tags: Arc<[TagRef]>,
}

#[derive(Debug, Default)]
struct ComponentList {
    entries: Vec<ComponentEntry>,
}

/// A category of tags, with the tags of all loaded components in load order.
///
/// Reporting takes the read lock via [`lock()`][1] or [`try_lock()`][2]. Loading,
/// unloading and replacing components takes the write lock.
///
/// [1]: Self::lock
/// [2]: Self::try_lock
#[derive(Debug)]
pub struct TagCategory {
    descriptor: CategoryDescriptor,
    components: RwLock<ComponentList>,
}

impl TagCategory {
    fn new(descriptor: CategoryDescriptor) -> Self {
        Self {
            descriptor,
            components: RwLock::new(ComponentList::default()),
        }
    }

    /// The name of the category.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    /// Size of one tag record in bytes.
    #[must_use]
    pub fn tag_size(&self) -> usize {
        self.descriptor.tag_size
    }

    /// Number of tags currently registered, built-in tags included.
    #[must_use]
    pub fn tag_count(&self) -> usize {
        self.components
            .read()
            .entries
            .iter()
            .map(|entry| entry.tags.len())
            .sum()
    }

    /// Whether `size` bytes of tags would be stored by the category's section hooks.
    #[must_use]
    pub fn needs_section_mem(&self, size: usize) -> bool {
        self.descriptor
            .hooks
            .as_ref()
            .is_some_and(|hooks| hooks.needs_section_mem(size))
    }

    /// Registers tags that are part of the host itself and are never unloaded.
    pub fn register_builtin<I>(&self, tags: I)
    where
        I: IntoIterator<Item = &'static AllocTag>,
    {
        let tags: Arc<[TagRef]> = tags.into_iter().map(TagRef::from).collect();

        if tags.is_empty() {
            return;
        }

        self.components
            .write()
            .entries
            .push(ComponentEntry { id: None, tags });
    }

    /// Loads the tags of `component`.
    ///
    /// If the section hooks store the tags, the records are created in the storage the
    /// hooks reserve. Otherwise each tag gets a standalone record.
    ///
    /// # Errors
    ///
    /// Returns the error of the section hooks if they fail to reserve storage. The
    /// component is not registered in that case.
    pub fn load_component(&self, component: Component) -> Result<LoadedComponent> {
        let Component {
            id,
            name,
            tags,
            prepend,
            align,
        } = component;

        let codes: Vec<CodeTag> = tags.iter().map(|tag| tag.in_component(&name)).collect();
        let size = codes.len().saturating_mul(self.tag_size());

        let mut reservation = None;

        let records: Arc<[TagRef]> = match &self.descriptor.hooks {
            Some(hooks) if !codes.is_empty() && hooks.needs_section_mem(size) => {
                match hooks.alloc_section_mem(id, size, prepend, align)? {
                    Some(reserved) => {
                        reservation = Some(reserved);
                        hooks.populate_section(reserved, codes).into()
                    }
                    None => standalone_records(codes),
                }
            }
            _ => standalone_records(codes),
        };

        if !records.is_empty() {
            self.components.write().entries.push(ComponentEntry {
                id: Some(id),
                tags: Arc::clone(&records),
            });
        }

        debug!(
            category = self.name(),
            component = %id,
            name = &*name,
            tags = records.len(),
            "loaded component tags"
        );

        Ok(LoadedComponent {
            id,
            tags: records,
            reservation,
        })
    }

    /// Unregisters the tags of a component and gives back their storage, unless
    /// `still_in_use` says to keep it.
    ///
    /// Returns whether the component had registered tags.
    pub fn unload_component(&self, id: ComponentId, still_in_use: bool) -> bool {
        let found = {
            let mut components = self.components.write();
            let before = components.entries.len();
            components.entries.retain(|entry| entry.id != Some(id));
            components.entries.len() != before
        };

        if let Some(hooks) = &self.descriptor.hooks {
            hooks.free_section_mem(id, still_in_use);
        }

        debug!(category = self.name(), component = %id, found, "unloaded component tags");

        found
    }

    /// Transfers the tags of component `old` to component `new`.
    pub fn replace_component(&self, old: ComponentId, new: ComponentId) {
        {
            let mut components = self.components.write();

            for entry in &mut components.entries {
                if entry.id == Some(old) {
                    entry.id = Some(new);
                }
            }
        }

        if let Some(hooks) = &self.descriptor.hooks {
            hooks.component_replaced(old, new);
        }
    }

    /// Returns a cursor over all tags, blocking until the category can be read.
    ///
    /// Components cannot be loaded or unloaded while the cursor exists.
    #[must_use]
    pub fn lock(&self) -> TagCursor<'_> {
        TagCursor::new(self.components.read())
    }

    /// Returns a cursor over all tags, or `None` if a component is being loaded or
    /// unloaded right now.
    #[must_use]
    pub fn try_lock(&self) -> Option<TagCursor<'_>> {
        self.components.try_read().map(TagCursor::new)
    }

    /// Returns up to `count` tags with the most live bytes, largest first.
    ///
    /// If `can_sleep` is false and the category is locked for writing, returns an empty
    /// list instead of waiting.
    #[must_use]
    pub fn top_users(&self, count: usize, can_sleep: bool) -> Vec<TagBytes> {
        let cursor = if can_sleep {
            self.lock()
        } else {
            match self.try_lock() {
                Some(cursor) => cursor,
                None => return Vec::new(),
            }
        };

        let mut top: Vec<TagBytes> = Vec::new();

        if count == 0 {
            return top;
        }

        for tag in cursor {
            let bytes = tag.read().bytes();

            let position = top
                .iter()
                .position(|entry| bytes > entry.bytes)
                .unwrap_or(top.len());

            if position < count {
                if top.len() == count {
                    top.pop();
                }

                top.insert(position, TagBytes { tag, bytes });
            }
        }

        top
    }
}

fn standalone_records(codes: Vec<CodeTag>) -> Arc<[TagRef]> {
    codes
        .into_iter()
        .map(|code| TagRef::from(Arc::new(AllocTag::new(code))))
        .collect()
}

/// Cursor over the tags of a [`TagCategory`] in load order.
///
/// Holds the category read lock until dropped.
pub struct TagCursor<'a> {
    components: RwLockReadGuard<'a, ComponentList>,
    entry_index: usize,
    tag_index: usize,
}

impl<'a> TagCursor<'a> {
    fn new(components: RwLockReadGuard<'a, ComponentList>) -> Self {
        Self {
            components,
            entry_index: 0,
            tag_index: 0,
        }
    }

    /// Skips up to `n` tags. Returns how many were skipped.
    pub fn seek(&mut self, n: usize) -> usize {
        let mut skipped = 0;

        while skipped < n && self.next().is_some() {
            skipped = skipped.wrapping_add(1);
        }

        skipped
    }
}

impl Iterator for TagCursor<'_> {
    type Item = TagRef;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.components.entries.get(self.entry_index)?;

            if let Some(tag) = entry.tags.get(self.tag_index) {
                self.tag_index = self.tag_index.wrapping_add(1);
                return Some(tag.clone());
            }

            self.entry_index = self.entry_index.wrapping_add(1);
            self.tag_index = 0;
        }
    }
}

impl Debug for TagCursor<'_> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagCursor")
            .field("components", &self.components.entries.len())
            .field("entry_index", &self.entry_index)
            .field("tag_index", &self.tag_index)
            .finish()
    }
}

/// A tag with the live bytes it accounted for when it was inspected.
#[derive(Clone, Debug)]
pub struct TagBytes {
    tag: TagRef,
    bytes: i64,
}

impl TagBytes {
    /// The tag.
    #[must_use]
    pub fn tag(&self) -> &TagRef {
        &self.tag
    }

    /// Live bytes of the tag when it was inspected.
    #[must_use]
    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

/// The set of all tag categories.
#[derive(Debug, Default)]
pub struct TagRegistry {
    categories: RwLock<Vec<Arc<TagCategory>>>,
}

impl TagRegistry {
    /// Creates a registry without categories.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new category. A category registered earlier under the same name stays
    /// registered but is shadowed in [`category()`][1] lookups.
    ///
    /// [1]: Self::category
    pub fn register_category(&self, descriptor: CategoryDescriptor) -> Arc<TagCategory> {
        let category = Arc::new(TagCategory::new(descriptor));

        self.categories.write().push(Arc::clone(&category));

        debug!(name = category.name(), "registered tag category");

        category
    }

    /// Looks up the most recently registered category with the given name.
    #[must_use]
    pub fn category(&self, name: &str) -> Option<Arc<TagCategory>> {
        self.categories
            .read()
            .iter()
            .rev()
            .find(|category| category.name() == name)
            .map(Arc::clone)
    }
}
