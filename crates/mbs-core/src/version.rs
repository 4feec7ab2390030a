use std::cmp::Ordering;
use std::fmt;

/// Dotted numeric version of arbitrary arity.
///
/// Missing trailing components compare as `0`, so `1.2` and `1.2.0` are equal.
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Parse a version string. Never fails.
    ///
    /// A leading non-digit prefix (`v`, `release-`) is stripped, then each
    /// `.`-separated segment contributes its leading run of digits. Segments
    /// without digits count as `0`; digit runs too large for `u64` saturate.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let trimmed = text
            .trim()
            .trim_start_matches(|ch: char| !ch.is_ascii_digit());

        let components = trimmed.split('.').map(parse_segment).collect();
        Self { components }
    }

    #[must_use]
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

fn parse_segment(segment: &str) -> u64 {
    let digits_end = segment
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(segment.len());
    let digits = &segment[..digits_end];

    if digits.is_empty() {
        0
    } else {
        digits.parse().unwrap_or(u64::MAX)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| {
                let left = self.components.get(i).copied().unwrap_or(0);
                let right = other.components.get(i).copied().unwrap_or(0);
                left.cmp(&right)
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for component in &self.components {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{component}")?;
            first = false;
        }
        Ok(())
    }
}

#[must_use]
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

#[must_use]
pub fn is_newer(candidate: &Version, current: &Version) -> bool {
    candidate.is_newer_than(current)
}

/// String form of [`is_newer`] for callers holding raw tags.
#[must_use]
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    is_newer(&Version::parse(candidate), &Version::parse(current))
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{Version, compare, is_newer, is_newer_version};

    #[test]
    fn test_version_comparison() {
        assert!(is_newer_version("1.0.1", "1.0.0"));
        assert!(is_newer_version("1.1.0", "1.0.0"));
        assert!(is_newer_version("2.0.0", "1.9.9"));
        assert!(is_newer_version("1.2", "1.1.9"));
        assert!(is_newer_version("1", "0.99.0"));
        assert!(is_newer_version("1.0.0.1", "1.0.0"));
        assert!(is_newer_version("1.10.0", "1.9.0"));
        assert!(!is_newer_version("1.0.0", "1.0.0"));
        assert!(!is_newer_version("1.2", "1.2.0"));
        assert!(!is_newer_version("1.0.0", "1.0.1"));
        assert!(!is_newer_version("0.9.0", "1.0.0"));
    }

    #[test]
    fn leading_prefix_is_ignored() {
        for raw in ["1.2.3", "0.0.1", "10", "2.0.0-rc1", ""] {
            assert_eq!(
                Version::parse(&format!("v{raw}")),
                Version::parse(raw),
                "prefix changed the parse of {raw:?}"
            );
        }
        assert_eq!(Version::parse("V2.3.0").components(), &[2, 3, 0]);
        assert_eq!(Version::parse("release-4.1").components(), &[4, 1]);
    }

    #[test]
    fn suffixes_and_garbage_degrade_to_numbers() {
        assert_eq!(Version::parse("1.2.0-beta").components(), &[1, 2, 0]);
        assert_eq!(Version::parse("3.4+build.7").components(), &[3, 4, 7]);
        assert_eq!(Version::parse("1..3").components(), &[1, 0, 3]);
        assert_eq!(Version::parse("1.x.3").components(), &[1, 0, 3]);
        assert_eq!(Version::parse("garbage").components(), &[0]);
        assert_eq!(
            Version::parse("99999999999999999999999.1").components(),
            &[u64::MAX, 1]
        );
    }

    #[test]
    fn equality_pads_with_zeros() {
        assert_eq!(Version::parse("1.2"), Version::parse("1.2.0.0"));
        assert_eq!(
            compare(&Version::parse("1.2.0"), &Version::parse("1.2")),
            Ordering::Equal
        );
        assert_ne!(Version::parse("1.2"), Version::parse("1.2.1"));
    }

    #[test]
    fn is_newer_is_irreflexive_and_transitive() {
        let versions: Vec<Version> = ["0.9", "1.0.0", "1.0.1", "1.1", "1.1.0.1", "2", "v2.0.1"]
            .iter()
            .map(|raw| Version::parse(raw))
            .collect();

        for a in &versions {
            assert!(!is_newer(a, a), "{a} should not be newer than itself");
            for b in &versions {
                for c in &versions {
                    if is_newer(a, b) && is_newer(b, c) {
                        assert!(is_newer(a, c), "{a} > {b} > {c} but not {a} > {c}");
                    }
                }
            }
        }
    }

    #[test]
    fn display_joins_components() {
        assert_eq!(Version::parse("v1.2.0").to_string(), "1.2.0");
        assert_eq!(Version::parse("7").to_string(), "7");
    }
}
