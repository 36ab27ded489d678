use crate::{Error, ProfilingMode, Result};

/// Default maximum number of tags that dynamically loaded components may store in the
/// tag arena at the same time.
pub const DEFAULT_MAX_TAGS: usize = 100_000;

/// Default size of a memory page in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of pages that have a tag record.
pub const DEFAULT_PAGE_COUNT: usize = 1 << 16;

/// Startup parameter selecting the [`ProfilingMode`].
pub const PROFILING_PARAMETER: &str = "sysctl.vm.mem_profiling";

/// Startup parameter setting [`Config::max_tags()`].
pub const MAX_TAGS_PARAMETER: &str = "max_module_alloc_tags";

/// Startup configuration of an [`AllocProfiler`][crate::AllocProfiler].
///
/// Create one via [`Config::builder()`] or parse it from startup arguments with
/// [`Config::from_boot_args()`].
///
/// # Example
///
/// ```
/// use alloc_tag::{Config, ProfilingMode};
///
/// let config = Config::builder()
///     .max_tags(1000)
///     .profiling(ProfilingMode::Disabled)
///     .build();
///
/// assert_eq!(config.max_tags(), 1000);
/// assert_eq!(config.profiling(), ProfilingMode::Disabled);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    max_tags: usize,
    profiling: ProfilingMode,
    page_count: usize,
    page_size: usize,
    debug_checks: bool,
}

impl Config {
    /// Creates a builder for configuring a [`Config`], starting from the defaults.
    #[inline]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Parses whitespace-separated `key=value` startup arguments on top of the defaults.
    ///
    /// Recognized keys are `sysctl.vm.mem_profiling` (`never` or a boolean literal) and
    /// `max_module_alloc_tags` (an unsigned integer with optional `0x` or `0` radix prefix).
    /// Other arguments are ignored, as they belong to other subsystems.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a recognized parameter has no value or a
    /// malformed one.
    ///
    /// # Example
    ///
    /// ```
    /// use alloc_tag::{Config, ProfilingMode};
    ///
    /// let config =
    ///     Config::from_boot_args("quiet sysctl.vm.mem_profiling=never max_module_alloc_tags=0x100")
    ///         .unwrap();
    ///
    /// assert_eq!(config.profiling(), ProfilingMode::Never);
    /// assert_eq!(config.max_tags(), 256);
    /// ```
    pub fn from_boot_args(args: &str) -> Result<Self> {
        let mut builder = Self::builder();

        for arg in args.split_whitespace() {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (arg, None),
            };

            match key {
                PROFILING_PARAMETER => {
                    let value = value.ok_or_else(|| {
                        Error::invalid_argument(arg, "parameter requires a value")
                    })?;
                    builder = builder.profiling(ProfilingMode::parse(value)?);
                }
                MAX_TAGS_PARAMETER => {
                    let value = value.ok_or_else(|| {
                        Error::invalid_argument(arg, "parameter requires a value")
                    })?;
                    builder = builder.max_tags(parse_unsigned(value)?);
                }
                _ => {}
            }
        }

        Ok(builder.build())
    }

    /// Maximum number of tags that loaded components may store in the tag arena.
    #[must_use]
    pub fn max_tags(&self) -> usize {
        self.max_tags
    }

    /// Startup profiling mode.
    #[must_use]
    pub fn profiling(&self) -> ProfilingMode {
        self.profiling
    }

    /// Number of pages that have a tag record.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Size of one page in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether page tag operations log suspicious transitions, such as tagging a page
    /// whose previous tag was never released.
    ///
    /// Profiling cannot be toggled at runtime while the checks are active.
    #[must_use]
    pub fn debug_checks(&self) -> bool {
        self.debug_checks
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for creating an instance of [`Config`].
#[derive(Debug)]
#[must_use]
pub struct ConfigBuilder {
    max_tags: usize,
    profiling: ProfilingMode,
    page_count: usize,
    page_size: usize,
    debug_checks: bool,
}

impl ConfigBuilder {
    fn new() -> Self {
        Self {
            max_tags: DEFAULT_MAX_TAGS,
            profiling: ProfilingMode::default(),
            page_count: DEFAULT_PAGE_COUNT,
            page_size: DEFAULT_PAGE_SIZE,
            debug_checks: cfg!(debug_assertions),
        }
    }

    /// Sets the maximum number of tags that loaded components may store in the tag arena.
    ///
    /// Zero is valid and means no component tags can be tracked.
    pub fn max_tags(mut self, max_tags: usize) -> Self {
        self.max_tags = max_tags;
        self
    }

    /// Sets the startup profiling mode.
    pub fn profiling(mut self, profiling: ProfilingMode) -> Self {
        self.profiling = profiling;
        self
    }

    /// Sets the number of pages that have a tag record.
    pub fn page_count(mut self, page_count: usize) -> Self {
        self.page_count = page_count;
        self
    }

    /// Sets the size of one page in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    pub fn page_size(mut self, page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size must be a power of two, got {page_size}"
        );
        self.page_size = page_size;
        self
    }

    /// Enables or disables logging of suspicious page tag transitions. While enabled, the
    /// profiling switch rejects runtime toggles.
    ///
    /// Enabled by default in debug builds.
    pub fn debug_checks(mut self, enabled: bool) -> Self {
        self.debug_checks = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            max_tags: self.max_tags,
            profiling: self.profiling,
            page_count: self.page_count,
            page_size: self.page_size,
            debug_checks: self.debug_checks,
        }
    }
}

/// Parses an unsigned integer, detecting the radix from its prefix: `0x` for hexadecimal,
/// a leading `0` for octal and decimal otherwise. A leading `+` and one trailing newline
/// are accepted.
pub(crate) fn parse_unsigned(value: &str) -> Result<usize> {
    let digits = value.strip_suffix('\n').unwrap_or(value);
    let digits = digits.strip_prefix('+').unwrap_or(digits);

    let (radix, digits) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, digits.get(1..).unwrap_or_default())
    } else {
        (10, digits)
    };

    // from_str_radix accepts its own sign prefix, which would let "++1" through.
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(Error::invalid_argument(value, "not an unsigned integer"));
    }

    usize::from_str_radix(digits, radix)
        .map_err(|inner| Error::invalid_argument(value, inner.to_string()))
}
