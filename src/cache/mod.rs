//! Canopy Aggregate Caches
//!
//! Keeps per-category aggregates correct under post and category mutation:
//!
//! - **Post counts**: direct counts only; recursive counts derived on read.
//! - **Activity**: per-day histograms; patched per post, invalidated on moves.
//! - **File stats**: attachment totals; merged along ancestor chains on moves.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `canopy.toml`:
//!
//! ```toml
//! [cache]
//! enable_activity = true
//! enable_file_stats = true
//! async_derived = true
//! # ... see config.rs for all options
//! ```

mod activity;
mod config;
mod coordinator;
mod dispatcher;
mod events;
mod file_stats;
mod post_counts;

pub use activity::{
    ActivityCache, ActivityCacheStats, ActivityHandler, ActivityKey, ActivityStats,
    ActivityWindow, ActivityWindowSpec,
};
pub use config::{
    CacheConfig, DEFAULT_ACTIVITY_WINDOW_MONTHS, DEFAULT_DISPATCH_BATCH_LIMIT,
    MAX_ACTIVITY_WINDOW_MONTHS,
};
pub use coordinator::{
    CacheAvailability, CacheCoordinator, CoordinatorError, CoordinatorStats, FeatureState,
    MutationGuard, PostCountAudit,
};
pub use dispatcher::{
    DispatchReport, EventDispatcher, EventHandler, HandlerError, HandlerFailure,
};
pub use events::{AncestorChains, CacheEvent, Epoch, EpochCounter, EventKind, EventQueue, EventType};
pub use file_stats::{FileStatsCache, FileStatsCacheStats, FileStatsHandler, MergeSign};
pub use post_counts::{PostCountCache, PostCountHandler, PostCountStats};
