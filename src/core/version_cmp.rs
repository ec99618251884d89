//! Version ordering
//!
//! Semver when both sides parse (a leading `v` is ignored), plain string
//! ordering otherwise.

use std::cmp::Ordering;

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (
        semver::Version::parse(a.trim_start_matches('v')),
        semver::Version::parse(b.trim_start_matches('v')),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Sort versions newest first.
pub fn sort_newest_first(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_versions(b, a));
}
