//! Companion-app version compatibility.
//!
//! Addon versions are compared by major number only: two versions are
//! compatible when both expose a parseable major component and the majors
//! match. Ordering between versions uses the numeric version code.

/// Returns the major component of a dotted version name.
///
/// An optional leading `v` is accepted. Names without a `.` are rejected,
/// so `"2"` yields `None` while `"v2.0"` yields `Some(2)`.
pub fn major_version(ver: &str) -> Option<u64> {
    let body = ver.strip_prefix('v').unwrap_or(ver);
    let (major, _) = body.split_once('.')?;
    major.parse().ok()
}

/// Returns true if both versions are present and share the same major number.
pub fn is_semantic_version_compatible(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.and_then(major_version), b.and_then(major_version)) {
        (Some(va), Some(vb)) => va == vb,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_version_plain() {
        assert_eq!(major_version("1.4"), Some(1));
        assert_eq!(major_version("12.0.3"), Some(12));
    }

    #[test]
    fn major_version_with_prefix() {
        assert_eq!(major_version("v2.1"), Some(2));
    }

    #[test]
    fn major_version_rejects_malformed() {
        assert_eq!(major_version("2"), None);
        assert_eq!(major_version(""), None);
        assert_eq!(major_version("v.1"), None);
        assert_eq!(major_version("beta.1"), None);
    }

    #[test]
    fn compatible_same_major() {
        assert!(is_semantic_version_compatible(Some("1.4"), Some("1.0")));
        assert!(is_semantic_version_compatible(Some("v1.4"), Some("1.9.2")));
    }

    #[test]
    fn incompatible_versions() {
        assert!(!is_semantic_version_compatible(Some("1.4"), Some("2.0")));
        assert!(!is_semantic_version_compatible(Some("1.4"), None));
        assert!(!is_semantic_version_compatible(None, None));
        assert!(!is_semantic_version_compatible(Some("1"), Some("1")));
    }
}
