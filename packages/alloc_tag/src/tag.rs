use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::Arc;

use crate::{CountersSnapshot, TagCounters};

/// Static description of an allocation call site.
///
/// Rendered as `file:line [component] func:function`, where the component part is omitted
/// for call sites that are not part of a dynamically loaded component.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CodeTag {
    file: Cow<'static, str>,
    line: u32,
    function: Cow<'static, str>,
    component: Option<Arc<str>>,
}

impl CodeTag {
    /// Creates a call site descriptor from static strings.
    ///
    /// This can be used in `static` items, which is how the [`alloc_tag!`][crate::alloc_tag]
    /// macro declares call site tags.
    #[must_use]
    pub const fn new(file: &'static str, line: u32, function: &'static str) -> Self {
        Self {
            file: Cow::Borrowed(file),
            line,
            function: Cow::Borrowed(function),
            component: None,
        }
    }

    /// Creates a call site descriptor from runtime strings, typically ones read from the
    /// metadata of a component that is being loaded.
    #[must_use]
    pub fn owned(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        Self {
            file: Cow::Owned(file.into()),
            line,
            function: Cow::Owned(function.into()),
            component: None,
        }
    }

    /// Returns a copy of the descriptor that names `component` as the owner of the call site.
    #[must_use]
    pub(crate) fn in_component(&self, component: &Arc<str>) -> Self {
        Self {
            component: Some(Arc::clone(component)),
            ..self.clone()
        }
    }

    /// Source file of the call site.
    #[must_use]
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Source line of the call site.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Function that contains the call site.
    #[must_use]
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Name of the component that contains the call site, if it belongs to one.
    #[must_use]
    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }
}

impl fmt::Display for CodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(component) => write!(
                f,
                "{}:{} [{component}] func:{}",
                self.file, self.line, self.function
            ),
            None => write!(f, "{}:{} func:{}", self.file, self.line, self.function),
        }
    }
}

/// An allocation call site with its live byte and call counters.
///
/// Built-in call sites are typically declared as statics via [`alloc_tag!`][crate::alloc_tag].
/// Call sites of dynamically loaded components are stored in the component tag arena and
/// handed out as [`TagRef`] when the component is loaded.
#[derive(Debug)]
pub struct AllocTag {
    code: CodeTag,
    counters: TagCounters,
}

impl AllocTag {
    /// Creates a tag for the described call site with zeroed counters.
    #[must_use]
    pub const fn new(code: CodeTag) -> Self {
        Self {
            code,
            counters: TagCounters::new(),
        }
    }

    /// The call site this tag describes.
    #[must_use]
    pub fn code(&self) -> &CodeTag {
        &self.code
    }

    /// The counters of this tag.
    #[must_use]
    pub fn counters(&self) -> &TagCounters {
        &self.counters
    }

    /// Shorthand for `self.counters().read()`.
    #[must_use]
    pub fn read(&self) -> CountersSnapshot {
        self.counters.read()
    }
}

/// Declares a static [`AllocTag`] for the current call site and evaluates to a
/// `&'static AllocTag` referencing it.
///
/// The function name defaults to the current module path. Pass a string literal to name
/// the function explicitly.
///
/// # Example
///
/// ```
/// use alloc_tag::{AllocTag, alloc_tag};
///
/// fn load_config() -> &'static AllocTag {
///     alloc_tag!("load_config")
/// }
///
/// let tag = load_config();
/// tag.counters().add(1, 512);
///
/// assert_eq!(tag.code().function(), "load_config");
/// assert_eq!(tag.read().bytes(), 512);
/// ```
#[macro_export]
macro_rules! alloc_tag {
    () => {
        $crate::alloc_tag!(::core::module_path!())
    };
    ($function:expr) => {{
        static TAG: $crate::AllocTag = $crate::AllocTag::new($crate::CodeTag::new(
            ::core::file!(),
            ::core::line!(),
            $function,
        ));
        &TAG
    }};
}

/// A shared reference to an [`AllocTag`].
///
/// The referenced tag is either a static built-in tag or a tag record owned by the
/// component tag arena. Records stay alive for as long as any reference to them exists,
/// even after the arena has reclaimed and reused their storage for a different component.
///
/// Two references are equal if they reference the same tag record.
#[derive(Clone, Debug)]
pub struct TagRef {
    inner: TagRefInner,
}

#[derive(Clone, Debug)]
enum TagRefInner {
    Static(&'static AllocTag),
    Shared(Arc<AllocTag>),
}

impl TagRef {
    /// Whether both references point to the same tag record.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        ptr::eq(&**self, &**other)
    }
}

impl Deref for TagRef {
    type Target = AllocTag;

    #[inline]
    fn deref(&self) -> &Self::Target {
        match &self.inner {
            TagRefInner::Static(tag) => tag,
            TagRefInner::Shared(tag) => tag,
        }
    }
}

impl From<&'static AllocTag> for TagRef {
    #[inline]
    fn from(tag: &'static AllocTag) -> Self {
        Self {
            inner: TagRefInner::Static(tag),
        }
    }
}

impl From<Arc<AllocTag>> for TagRef {
    #[inline]
    fn from(tag: Arc<AllocTag>) -> Self {
        Self {
            inner: TagRefInner::Shared(tag),
        }
    }
}

impl PartialEq for TagRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for TagRef {}
