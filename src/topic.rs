//! # Topic Matching
//!
//! Hierarchical topic-filter matching shared by the subscription registry and
//! the message router.
//!
//! Topics and filters are sequences of levels separated by `/`. In a filter,
//! `+` matches exactly one level and `#` (only legal as the last level)
//! matches the remaining levels, including none at all.

/// Level separator.
pub const LEVEL_SEPARATOR: char = '/';
/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Returns `true` if `topic` is matched by `filter`.
///
/// Malformed input never matches: an empty topic or filter, a topic name that
/// contains a wildcard character, a `#` that is not the last filter level, or a
/// wildcard mixed with other characters inside one level.
///
/// Topics starting with `$` are reserved for the broker and are not matched by
/// a filter whose first level is a wildcard.
///
/// ```
/// use myrtio_ota::topic::matches;
///
/// assert!(matches("a/b/c", "a/+/c"));
/// assert!(matches("a/b/c/d", "a/#"));
/// assert!(!matches("a/b", "a/+/+"));
/// assert!(!matches("a/b/c", "a/b"));
/// ```
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.is_empty() || filter.is_empty() {
        return false;
    }
    if topic.contains(['+', '#']) {
        return false;
    }
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split(LEVEL_SEPARATOR);
    let mut filter_levels = filter.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return filter_levels.next().is_none(),
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(expected), Some(level)) => {
                if !is_literal_level(expected) || expected != level {
                    return false;
                }
            }
            (None, None) => return true,
            // One side ran out of levels before the other.
            _ => return false,
        }
    }
}

/// Returns `true` if `filter` is a well-formed topic filter.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        match level {
            MULTI_LEVEL_WILDCARD => return levels.peek().is_none(),
            SINGLE_LEVEL_WILDCARD => {}
            other if !is_literal_level(other) => return false,
            _ => {}
        }
    }
    true
}

/// Returns `true` if every topic matched by `filter` is also matched by
/// `family`.
///
/// Both arguments are filters. A `+` in `family` covers any single level of
/// `filter`, including a `+`, and a trailing `#` covers whatever remains. A
/// wildcard in `filter` is only covered by a wildcard in `family`.
///
/// ```
/// use myrtio_ota::topic::covers;
///
/// assert!(covers("a/b/c", "a/+/#"));
/// assert!(covers("a/+/c/#", "a/+/#"));
/// assert!(!covers("a/#", "a/+/c"));
/// ```
pub fn covers(filter: &str, family: &str) -> bool {
    if !is_valid_filter(filter) || !is_valid_filter(family) {
        return false;
    }
    if filter.starts_with('$') && family.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut family_levels = family.split(LEVEL_SEPARATOR);

    loop {
        match (family_levels.next(), filter_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(_), Some(MULTI_LEVEL_WILDCARD)) => return false,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(expected), Some(level)) => {
                if expected != level {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn is_literal_level(level: &str) -> bool {
    !level.contains(['+', '#'])
}
