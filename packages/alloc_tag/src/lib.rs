#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Attributes memory allocations to the call sites that made them and tracks live bytes and
//! call counts per call site, so that memory usage can be broken down by origin rather than
//! observed only in aggregate.
//!
//! Allocations may come from the host itself or from components that are loaded and unloaded
//! at runtime. Tracking is near-free while disabled and cheap while enabled: every update is
//! a relaxed atomic operation on the counters of one tag.
//!
//! # Tags
//!
//! Each allocation call site is described by an [`AllocTag`]. Call sites of the host are
//! declared as statics with the [`alloc_tag!`] macro:
//!
//! ```
//! use alloc_tag::{AllocProfiler, Config, alloc_tag};
//!
//! let profiler = AllocProfiler::new(&Config::default());
//!
//! let tag = alloc_tag!("load_settings");
//! profiler.register_builtin([tag]);
//!
//! profiler.account_alloc(tag, 256);
//! profiler.account_alloc(tag, 128);
//! profiler.account_free(tag, 256);
//!
//! assert_eq!(tag.read().bytes(), 128);
//! assert_eq!(tag.read().calls(), 2);
//! ```
//!
//! # Components
//!
//! The tags of dynamically loaded components live in a fixed-size arena sized by
//! [`Config::max_tags()`]. When a component unloads while some of its allocations are still
//! alive, its tags stay in the arena until those allocations are freed.
//!
//! ```
//! use alloc_tag::{AllocProfiler, CodeTag, Component, Config};
//!
//! let profiler = AllocProfiler::new(&Config::default());
//!
//! let component = Component::new(
//!     "netdrv",
//!     vec![
//!         CodeTag::owned("drivers/net.rs", 40, "rx_refill"),
//!         CodeTag::owned("drivers/net.rs", 95, "tx_queue_init"),
//!     ],
//! );
//!
//! let loaded = profiler.load_component(component).unwrap();
//! profiler.account_alloc(&loaded.tags()[0], 2048);
//!
//! let top = profiler.top_users(1, true);
//! assert_eq!(top[0].bytes(), 2048);
//! assert_eq!(
//!     top[0].tag().code().to_string(),
//!     "drivers/net.rs:40 [netdrv] func:rx_refill"
//! );
//!
//! profiler.unload_component(loaded.id(), false);
//! ```
//!
//! # Pages
//!
//! Memory handed out in whole pages is attributed per page via [`PageTagTable`], so that the
//! free path can find the tag to charge without the caller knowing it.
//!
//! # Configuration
//!
//! [`Config`] is either built via [`Config::builder()`] or parsed from startup arguments with
//! [`Config::from_boot_args()`]. Profiling can be switched at runtime via
//! [`ProfilingSwitch`], unless it was switched off for good at startup.

mod component_arena;
mod config;
mod counters;
mod error;
mod page_tag;
mod profiler;
mod range_allocator;
mod registry;
mod report;
mod switch;
mod tag;

pub use component_arena::*;
pub use config::*;
pub use counters::*;
pub use error::*;
pub use page_tag::*;
pub use profiler::*;
pub use range_allocator::*;
pub use registry::*;
pub use report::*;
pub use switch::*;
pub use tag::*;
