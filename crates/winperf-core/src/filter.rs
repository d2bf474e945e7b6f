//! Include/exclude instance filters.
//!
//! Both patterns are anchored as `^(?:pattern)$`, so they must match the
//! whole instance path. An instance is kept iff it matches `include` and does
//! not match `exclude`.

use regex::Regex;

/// Default include pattern: any non-empty name.
pub const DEFAULT_INCLUDE: &str = ".+";

/// Default exclude pattern: matches only the empty string.
pub const DEFAULT_EXCLUDE: &str = "";

/// A compiled include/exclude pair. Immutable once built.
#[derive(Debug, Clone)]
pub struct InstanceFilter {
    include: Regex,
    exclude: Regex,
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl InstanceFilter {
    pub fn new(include: &str, exclude: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            include: anchored(include)?,
            exclude: anchored(exclude)?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_every_named_instance() {
        let filter = InstanceFilter::new(DEFAULT_INCLUDE, DEFAULT_EXCLUDE).unwrap();
        assert!(filter.matches("w3wp"));
        assert!(filter.matches("/Microsoft/Windows/Defrag/ScheduledDefrag"));
        assert!(!filter.matches(""));
    }

    #[test]
    fn patterns_are_anchored() {
        let filter = InstanceFilter::new("w3wp", "").unwrap();
        assert!(filter.matches("w3wp"));
        assert!(!filter.matches("w3wp#1"));
        assert!(!filter.matches("xw3wp"));

        // Alternation stays inside the anchors.
        let filter = InstanceFilter::new("a|b", "").unwrap();
        assert!(filter.matches("a"));
        assert!(!filter.matches("ab"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = InstanceFilter::new("/Microsoft/.+", "/Microsoft/Windows/.+").unwrap();
        assert!(filter.matches("/Microsoft/Office/Update"));
        assert!(!filter.matches("/Microsoft/Windows/Defrag"));
        assert!(!filter.matches("/Backup"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(InstanceFilter::new("(", "").is_err());
        assert!(InstanceFilter::new(".+", "[").is_err());
    }

    #[test]
    fn matches_iff_include_and_not_exclude_over_generated_grid() {
        let patterns = [
            "", ".+", ".*", "w3wp", "w3wp.*", ".*#[0-9]+", "/Microsoft/.+", "a|b", "[a-c]+",
            "dotnet|w3wp#1",
        ];
        let paths = [
            "", "a", "b", "ab", "abc", "w3wp", "w3wp#1", "w3wp#12", "dotnet", "/Microsoft/x",
            "/Microsoft/", "/Backup", "cab", "x#",
        ];

        for include in patterns {
            let inc = Regex::new(&format!("^(?:{})$", include)).unwrap();
            for exclude in patterns {
                let exc = Regex::new(&format!("^(?:{})$", exclude)).unwrap();
                let filter = InstanceFilter::new(include, exclude).unwrap();
                for path in paths {
                    let expected = inc.is_match(path) && !exc.is_match(path);
                    assert_eq!(
                        filter.matches(path),
                        expected,
                        "include={:?} exclude={:?} path={:?}",
                        include,
                        exclude,
                        path
                    );
                }
            }
        }
    }
}
