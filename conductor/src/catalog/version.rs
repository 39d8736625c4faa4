//! Loose version ordering for bundle and prototype versions.
//!
//! Bundle versions are free-form (`"2.4"`, `"3.1.2-1"`, `"1.0.0_rc2"`), so
//! strict semver parsing is not an option. Segments are split on `.`, `-`
//! and `_`; numeric segments compare numerically, others lexically, and a
//! numeric segment sorts after a textual one.

use std::cmp::Ordering;

use crate::catalog::definition::VersionBounds;

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Number(u64),
    Text(&'a str),
}

fn segments(version: &str) -> Vec<Segment<'_>> {
    version
        .split(['.', '-', '_'])
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u64>() {
            Ok(n) => Segment::Number(n),
            Err(_) => Segment::Text(s),
        })
        .collect()
}

pub fn compare(a: &str, b: &str) -> Ordering {
    let left = segments(a);
    let right = segments(b);

    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l, r) {
            (Segment::Number(x), Segment::Number(y)) => x.cmp(y),
            (Segment::Text(x), Segment::Text(y)) => x.cmp(y),
            (Segment::Number(_), Segment::Text(_)) => Ordering::Greater,
            (Segment::Text(_), Segment::Number(_)) => Ordering::Less,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Whether `version` satisfies every declared bound
pub fn within(version: &str, bounds: &VersionBounds) -> bool {
    if let Some(min) = &bounds.min {
        if compare(version, min) == Ordering::Less {
            return false;
        }
    }
    if let Some(min) = &bounds.min_strict {
        if compare(version, min) != Ordering::Greater {
            return false;
        }
    }
    if let Some(max) = &bounds.max {
        if compare(version, max) == Ordering::Greater {
            return false;
        }
    }
    if let Some(max) = &bounds.max_strict {
        if compare(version, max) != Ordering::Less {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1.0", "1.0", Ordering::Equal)]
    #[case("1.10", "1.9", Ordering::Greater)]
    #[case("2.4", "2.4.1", Ordering::Less)]
    #[case("3.1.2-1", "3.1.2-2", Ordering::Less)]
    #[case("1.0.0_rc2", "1.0.0", Ordering::Greater)]
    #[case("1.0.a", "1.0.1", Ordering::Less)]
    fn test_compare(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(compare(a, b), expected);
    }

    #[test]
    fn test_within_bounds() {
        let bounds = VersionBounds {
            min: Some("1.0".into()),
            max_strict: Some("2.0".into()),
            ..VersionBounds::default()
        };
        assert!(within("1.0", &bounds));
        assert!(within("1.9.9", &bounds));
        assert!(!within("2.0", &bounds));
        assert!(!within("0.9", &bounds));
    }
}
