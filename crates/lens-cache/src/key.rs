use std::fmt;

/// Canonical, segment-structured cache key.
///
/// Prefix matching compares whole segments, so `repository/4` never matches
/// `repository/42`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    segments: Vec<String>,
}

impl CacheKey {
    pub(crate) fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::CacheKey;

    fn key(parts: &[&str]) -> CacheKey {
        CacheKey::from_segments(parts.iter().map(|part| part.to_string()).collect())
    }

    #[test]
    fn unit_starts_with_matches_whole_segments_only() {
        let commits = key(&["repository", "42", "commits", "page=1"]);
        assert!(commits.starts_with(&key(&["repository", "42"])));
        assert!(!commits.starts_with(&key(&["repository", "4"])));
        assert!(commits.starts_with(&commits));
        assert_eq!(commits.to_string(), "repository/42/commits/page=1");
    }
}
