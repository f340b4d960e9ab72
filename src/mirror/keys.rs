//! Key conventions for mirrored aggregates.
//!
//! | Aggregate  | Key                                                  |
//! |------------|------------------------------------------------------|
//! | file stats | `file-stats:{node}:{flat\|recursive}`                |
//! | activity   | `activity:{node\|all}:{flat\|recursive}:{anchor}:{months}` |
//! | post count | `post-count:{node}:{flat\|recursive}`                |

use time::{Date, macros::format_description};

use crate::cache::{ActivityKey, ActivityWindowSpec};
use crate::domain::{ActivityScope, NodeId};

pub struct MirrorKeys;

impl MirrorKeys {
    pub fn file_stats(node: NodeId, recursive: bool) -> String {
        format!("file-stats:{node}:{}", view(recursive))
    }

    pub fn post_count(node: NodeId, recursive: bool) -> String {
        format!("post-count:{node}:{}", view(recursive))
    }

    pub fn activity(key: &ActivityKey) -> String {
        format!(
            "activity:{}:{}:{}:{}",
            key.scope,
            view(key.recursive),
            key.window.anchor,
            key.window.months
        )
    }

    /// Prefix pattern covering every window of one scope and view.
    pub fn activity_pattern(scope: ActivityScope, recursive: bool) -> String {
        format!("activity:{scope}:{}:*", view(recursive))
    }

    /// Inverse of [`MirrorKeys::activity`].
    pub fn parse_activity(key: &str) -> Option<ActivityKey> {
        let mut parts = key.strip_prefix("activity:")?.split(':');
        let scope = match parts.next()? {
            "all" => ActivityScope::All,
            raw => ActivityScope::Node(NodeId::new(raw.parse().ok()?)),
        };
        let recursive = match parts.next()? {
            "flat" => false,
            "recursive" => true,
            _ => return None,
        };
        let anchor = Date::parse(parts.next()?, format_description!("[year]-[month]-[day]")).ok()?;
        let months = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(ActivityKey::new(
            scope,
            recursive,
            ActivityWindowSpec::new(anchor, months),
        ))
    }
}

fn view(recursive: bool) -> &'static str {
    if recursive { "recursive" } else { "flat" }
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    #[test]
    fn activity_keys_parse_back() {
        let key = ActivityKey::recursive(NodeId::new(4), ActivityWindowSpec::new(date!(2024 - 03 - 01), 6));
        let formatted = MirrorKeys::activity(&key);
        assert_eq!(formatted, "activity:4:recursive:2024-03-01:6");
        assert_eq!(MirrorKeys::parse_activity(&formatted), Some(key));

        let all = ActivityKey::all(ActivityWindowSpec::new(date!(2023 - 11 - 01), 12));
        assert_eq!(
            MirrorKeys::parse_activity(&MirrorKeys::activity(&all)),
            Some(all)
        );
    }

    #[test]
    fn malformed_activity_keys_are_rejected() {
        assert_eq!(MirrorKeys::parse_activity("activity:4:sideways:2024-03-01:6"), None);
        assert_eq!(MirrorKeys::parse_activity("file-stats:4:flat"), None);
        assert_eq!(MirrorKeys::parse_activity("activity:4:flat:2024-03-01:6:extra"), None);
    }

    #[test]
    fn scalar_keys() {
        assert_eq!(MirrorKeys::file_stats(NodeId::new(2), true), "file-stats:2:recursive");
        assert_eq!(MirrorKeys::post_count(NodeId::new(9), false), "post-count:9:flat");
        assert_eq!(
            MirrorKeys::activity_pattern(ActivityScope::All, true),
            "activity:all:recursive:*"
        );
    }
}
