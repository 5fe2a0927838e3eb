// Identity Name Sanitizer
//
// Maps arbitrary identity names onto a bounded, filesystem-safe directory
// segment. The mapping is pure: the same identity always resolves to the same
// isolated area.

use serde::Serialize;
use std::fmt;

/// Characters that are invalid in a path segment on at least one platform
const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Maximum segment length in characters
pub const MAX_SEGMENT_CHARS: usize = 50;

/// Segment used when a name collapses to nothing usable
pub const FALLBACK_SEGMENT: &str = "account";

/// A sanitized, non-empty directory segment derived from an identity name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SafeSegment {
    value: String,
    fallback: bool,
}

impl SafeSegment {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// True when the identity name was degenerate and the fallback was used
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

impl AsRef<str> for SafeSegment {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl AsRef<std::path::Path> for SafeSegment {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.value)
    }
}

impl fmt::Display for SafeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Sanitize an identity name into a [`SafeSegment`]
///
/// Reserved characters and control characters become `_`, surrounding
/// whitespace is trimmed and the result is cut to [`MAX_SEGMENT_CHARS`]
/// characters. Names that end up empty, or that would resolve to `.`/`..`,
/// are replaced by [`FALLBACK_SEGMENT`].
pub fn sanitize(identity: &str) -> SafeSegment {
    let replaced: String = identity
        .chars()
        .map(|c| if RESERVED_CHARS.contains(&c) { '_' } else { c })
        .collect();

    // Trim before masking control characters so surrounding newlines and
    // tabs are stripped rather than turned into underscores.
    let value: String = replaced
        .trim()
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .take(MAX_SEGMENT_CHARS)
        .collect();

    if value.is_empty() || value.chars().all(|c| c == '.') {
        tracing::warn!(
            "Identity name {:?} has no usable characters, using fallback segment",
            identity
        );
        return SafeSegment {
            value: FALLBACK_SEGMENT.to_string(),
            fallback: true,
        };
    }

    SafeSegment {
        value,
        fallback: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reserved_characters_replaced() {
        assert_eq!(sanitize("a<b>c:d\"e/f\\g|h?i*j").as_str(), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn test_whitespace_trimmed() {
        assert_eq!(sanitize("  player one  ").as_str(), "player one");
    }

    #[test]
    fn test_surrounding_newlines_stripped_inner_controls_masked() {
        assert_eq!(sanitize("\n alice\tbob \n").as_str(), "alice_bob");
    }

    #[test]
    fn test_truncated_to_limit() {
        let long = "x".repeat(80);
        assert_eq!(sanitize(&long).as_str().chars().count(), MAX_SEGMENT_CHARS);
    }

    #[test]
    fn test_truncation_counts_characters_not_bytes() {
        let long = "é".repeat(60);
        let seg = sanitize(&long);
        assert_eq!(seg.as_str().chars().count(), MAX_SEGMENT_CHARS);
    }

    #[test]
    fn test_empty_uses_fallback() {
        let seg = sanitize("   ");
        assert_eq!(seg.as_str(), FALLBACK_SEGMENT);
        assert!(seg.is_fallback());
    }

    #[test]
    fn test_dot_names_use_fallback() {
        assert_eq!(sanitize("..").as_str(), FALLBACK_SEGMENT);
        assert_eq!(sanitize(".").as_str(), FALLBACK_SEGMENT);
        assert_eq!(sanitize("...a").as_str(), "...a");
    }

    #[test]
    fn test_only_reserved_characters_is_not_degenerate() {
        let seg = sanitize("???");
        assert_eq!(seg.as_str(), "___");
        assert!(!seg.is_fallback());
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_deterministic(name in ".*") {
            prop_assert_eq!(sanitize(&name), sanitize(&name));
        }

        #[test]
        fn prop_segment_is_safe(name in ".*") {
            let seg = sanitize(&name);
            let s = seg.as_str();
            prop_assert!(!s.is_empty());
            prop_assert!(s.chars().count() <= MAX_SEGMENT_CHARS);
            prop_assert!(!s.chars().any(|c| RESERVED_CHARS.contains(&c) || c.is_control()));
            prop_assert!(s != "." && s != "..");
        }
    }
}
