//! Key pattern matching for `find_keys`
//!
//! Patterns are compiled into literal segments separated by `*` wildcards.
//! Every other character, including regex metacharacters, matches itself.

/// Compiled glob pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    segments: Vec<String>,
    anchored_start: bool,
    anchored_end: bool,
}

impl GlobPattern {
    pub fn compile(pattern: &str) -> Self {
        let segments: Vec<String> = pattern
            .split('*')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            segments,
            anchored_start: !pattern.starts_with('*'),
            anchored_end: !pattern.ends_with('*'),
        }
    }

    pub fn is_match(&self, key: &str) -> bool {
        if self.segments.is_empty() {
            // Either "" (matches only "") or only wildcards (matches anything)
            return !(self.anchored_start && self.anchored_end) || key.is_empty();
        }

        let mut rest = key;
        let last = self.segments.len() - 1;

        for (i, segment) in self.segments.iter().enumerate() {
            if i == 0 && self.anchored_start {
                match rest.strip_prefix(segment.as_str()) {
                    Some(tail) => rest = tail,
                    None => return false,
                }
                if i == last && self.anchored_end {
                    return rest.is_empty();
                }
                continue;
            }

            if i == last && self.anchored_end {
                return rest.ends_with(segment.as_str());
            }

            match rest.find(segment.as_str()) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }

        true
    }
}

/// Pattern plus optional exclusion pattern
#[derive(Debug, Clone)]
pub struct KeyFilter {
    include: GlobPattern,
    exclude: Option<GlobPattern>,
}

impl KeyFilter {
    pub fn new(pattern: &str, anti_pattern: Option<&str>) -> Self {
        Self {
            include: GlobPattern::compile(pattern),
            exclude: anti_pattern.map(GlobPattern::compile),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.include.is_match(key) && !self.exclude.as_ref().is_some_and(|e| e.is_match(key))
    }
}
