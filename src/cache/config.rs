//! Cache configuration.
//!
//! Controls which optional aggregate caches run and how derived events are
//! delivered, via the `[cache]` section of `canopy.toml`.

pub const DEFAULT_ACTIVITY_WINDOW_MONTHS: u8 = 12;
pub const DEFAULT_DISPATCH_BATCH_LIMIT: usize = 100;

/// Longest activity window a caller may request.
pub const MAX_ACTIVITY_WINDOW_MONTHS: u8 = 36;

/// Cache configuration, built from the validated `[cache]` settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable the per-day activity cache.
    pub enable_activity: bool,
    /// Enable the attachment statistics cache.
    pub enable_file_stats: bool,
    /// Deliver activity and file-stats events through the async queue.
    /// Post counts are always updated synchronously.
    pub async_derived: bool,
    /// Length of the window warmed at startup.
    pub activity_window_months: u8,
    /// Maximum events handled per async worker wake-up.
    pub dispatch_batch_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_activity: true,
            enable_file_stats: true,
            async_derived: true,
            activity_window_months: DEFAULT_ACTIVITY_WINDOW_MONTHS,
            dispatch_batch_limit: DEFAULT_DISPATCH_BATCH_LIMIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_activity: settings.enable_activity,
            enable_file_stats: settings.enable_file_stats,
            async_derived: settings.async_derived,
            activity_window_months: settings.activity_window_months,
            dispatch_batch_limit: settings.dispatch_batch_limit,
        }
    }
}

impl CacheConfig {
    /// Every cache enabled, all events delivered synchronously.
    pub fn synchronous() -> Self {
        Self {
            async_derived: false,
            ..Self::default()
        }
    }

    /// Returns true if either optional cache is enabled.
    pub fn any_optional_enabled(&self) -> bool {
        self.enable_activity || self.enable_file_stats
    }

    /// Window length clamped to `1..=MAX_ACTIVITY_WINDOW_MONTHS`.
    pub fn activity_window_months_clamped(&self) -> u8 {
        self.activity_window_months
            .clamp(1, MAX_ACTIVITY_WINDOW_MONTHS)
    }

    /// Batch limit, clamping to 1 if zero.
    pub fn dispatch_batch_limit_non_zero(&self) -> usize {
        self.dispatch_batch_limit.max(1)
    }
}
