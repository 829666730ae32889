//! # Marrow
//!
//! In-process automatic memory management, built from two cooperating
//! facilities:
//!
//! - **Tracing collector** ([`gc`]): a mark-and-sweep garbage collector
//!   over `[header | payload]` blocks. Handles classify themselves as
//!   roots or heap-embedded edges by where their storage lives, cycles are
//!   reclaimed, and collection runs on allocation pressure and at process
//!   exit.
//! - **Atomic shared pointers** ([`shared`]): reference-counted handles
//!   with weak references, a per-object shared/exclusive lock serialising
//!   destruction against dereferences, and sentinel-guarded control blocks.
//!
//! The two interoperate at the source level: a managed record may embed
//! handles of either kind as fields.
//!
//! ## Example
//!
//! ```rust,ignore
//! use marrow::{collect_now, new_value_with, Gc};
//!
//! struct Node {
//!     next: Gc<Node>,
//! }
//!
//! let a = new_value_with(|| Node { next: Gc::null() })?;
//! let b = new_value_with(|| Node { next: Gc::null() })?;
//! a.next.set(&b);
//! b.next.set(&a); // a cycle; the collector reclaims it
//! drop(a);
//! drop(b);
//! collect_now();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod gc;
pub mod log;
pub mod shared;
pub mod shim;

// Re-exports
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use gc::{
    collect_now, gc_stats, live_object_count, new_array, new_value, new_value_with, AllocError,
    Gc, GcStats,
};
pub use log::{LogFormat, LogLevel};
pub use shared::{
    make_shared, make_shared_array, shared_stats, ReadGuard, SafetyViolation, Shared, SharedStats,
    WriteGuard,
};
pub use shim::{new_calloc, new_malloc, ShimPtr};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialise the runtime with an explicit configuration.
pub fn init_with_config(config: RuntimeConfig) {
    config::install(config);
}

/// Initialise the runtime from `MARROW_*` environment variables.
///
/// See [`config::RuntimeConfig::from_env`] for the variable list.
pub fn init_from_env() {
    config::install(RuntimeConfig::from_env());
}
