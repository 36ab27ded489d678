use std::str::FromStr;
use std::sync::atomic::{self, AtomicBool};

use crate::{Error, Result};

/// Whether profiling is enabled when no startup setting says otherwise.
pub const ENABLED_BY_DEFAULT: bool = true;

/// Startup setting of allocation profiling.
///
/// Parsed from the value of the `sysctl.vm.mem_profiling` startup parameter, which is
/// either `never` or a boolean literal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ProfilingMode {
    /// Profiling is enabled and may be disabled at runtime.
    Enabled,

    /// Profiling is disabled and may be enabled at runtime.
    Disabled,

    /// Profiling is disabled and can never be enabled. No page tag records are allocated.
    Never,
}

impl ProfilingMode {
    /// Parses a startup parameter value: `never` or a boolean literal.
    ///
    /// # Example
    ///
    /// ```
    /// use alloc_tag::ProfilingMode;
    ///
    /// assert_eq!(ProfilingMode::parse("never").unwrap(), ProfilingMode::Never);
    /// assert_eq!(ProfilingMode::parse("off").unwrap(), ProfilingMode::Disabled);
    /// assert_eq!(ProfilingMode::parse("1").unwrap(), ProfilingMode::Enabled);
    /// assert!(ProfilingMode::parse("").is_err());
    /// ```
    pub fn parse(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::invalid_argument(
                value,
                "profiling mode must not be empty",
            ));
        }

        if value.starts_with("never") {
            return Ok(Self::Never);
        }

        if parse_bool(value)? {
            Ok(Self::Enabled)
        } else {
            Ok(Self::Disabled)
        }
    }
}

impl Default for ProfilingMode {
    fn default() -> Self {
        if ENABLED_BY_DEFAULT {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl FromStr for ProfilingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parses a boolean literal.
///
/// Only the first one or two characters are significant: `y`, `t` and `1` mean true,
/// `n`, `f` and `0` mean false, `on` means true and `of` (as in `off`) means false.
/// Letters are matched case-insensitively.
pub fn parse_bool(value: &str) -> Result<bool> {
    let mut chars = value.chars().map(|c| c.to_ascii_lowercase());

    match (chars.next(), chars.next()) {
        (Some('y' | 't' | '1'), _) | (Some('o'), Some('n')) => Ok(true),
        (Some('n' | 'f' | '0'), _) | (Some('o'), Some('f')) => Ok(false),
        _ => Err(Error::invalid_argument(value, "not a boolean literal")),
    }
}

/// Global on/off switch of allocation profiling.
///
/// Every tagging hot path checks the switch before doing any work, so that tracking
/// costs a single atomic load while disabled.
///
/// A switch created in [`ProfilingMode::Never`] is latched off: it cannot be toggled. A
/// switch created via [`read_only()`][1] keeps its startup state for good.
///
/// [1]: Self::read_only
#[derive(Debug)]
pub struct ProfilingSwitch {
    enabled: AtomicBool,

    // Whether profiling can be enabled at all. Never changes after creation.
    supported: bool,

    // Whether the runtime control accepts writes. Never changes after creation.
    writable: bool,
}

impl ProfilingSwitch {
    /// Creates a switch in the state described by the startup mode.
    #[must_use]
    pub fn new(mode: ProfilingMode) -> Self {
        Self {
            enabled: AtomicBool::new(mode == ProfilingMode::Enabled),
            supported: mode != ProfilingMode::Never,
            writable: mode != ProfilingMode::Never,
        }
    }

    /// Creates a switch in the state described by the startup mode that rejects every
    /// runtime toggle.
    ///
    /// Used when page tag debug checks are active: pages allocated while profiling was off
    /// have no tag, so freeing them after a toggle would be reported as a defect.
    #[must_use]
    pub fn read_only(mode: ProfilingMode) -> Self {
        Self {
            writable: false,
            ..Self::new(mode)
        }
    }

    /// Whether allocations are currently being tagged.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        // Relaxed: toggling takes effect "soon" on other threads, which is all a
        // runtime switch promises. No data is published through the flag.
        self.enabled.load(atomic::Ordering::Relaxed)
    }

    /// Whether profiling can be enabled at all, either at startup or at runtime.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Whether the switch may be toggled at runtime.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Enables or disables tagging at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`] if the switch was latched off at startup or is read-only.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if !self.writable {
            return Err(Error::Locked);
        }

        self.enabled.store(enabled, atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Reads the runtime control value: `1` if enabled, `0` if disabled.
    #[must_use]
    pub fn read_control(&self) -> &'static str {
        if self.is_enabled() { "1" } else { "0" }
    }

    /// Writes the runtime control value, a boolean literal optionally followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`] if the switch was latched off at startup or is read-only,
    /// and [`Error::InvalidArgument`] if the value is not a boolean literal.
    pub fn write_control(&self, value: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::Locked);
        }

        self.set_enabled(parse_bool(value.trim_end_matches('\n'))?)
    }
}

impl Default for ProfilingSwitch {
    fn default() -> Self {
        Self::new(ProfilingMode::default())
    }
}
