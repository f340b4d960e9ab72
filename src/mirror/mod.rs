//! Client Mirror
//!
//! A browser-side copy of server aggregates, kept fresh by applying the
//! outcomes the server returns after each mutation. There is no push
//! channel: anything the mirror cannot patch it drops, and the next read
//! refetches it.

mod cache;
mod keys;
mod policy;

pub use cache::{
    CacheEntry, Clock, InvalidatePattern, ManualClock, MirrorCache, SystemClock,
};
pub use keys::MirrorKeys;
pub use policy::{ClientMirror, MirrorReport};
