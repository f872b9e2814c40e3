//! Wildcard matching for header values such as `Content-Type`.
//!
//! Supports a single `*`: exact (`text/html`), prefix (`text/*`),
//! suffix (`*+json`), prefix-and-suffix (`application/*json`) and
//! match-all (`*`). Multiple wildcards are rejected.

/// Error for unsupported pattern syntax.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("multiple wildcards are not supported: {0}")]
pub struct PatternError(pub String);

/// A compiled single-wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
    PrefixSuffix { prefix: String, suffix: String },
}

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let Some(first) = pattern.find('*') else {
            return Ok(Pattern::Exact(pattern.to_string()));
        };
        if pattern == "*" {
            return Ok(Pattern::Any);
        }
        let last = pattern.rfind('*').unwrap_or(first);
        if first != last {
            return Err(PatternError(pattern.to_string()));
        }
        let (prefix, suffix) = (&pattern[..first], &pattern[first + 1..]);
        Ok(match (prefix.is_empty(), suffix.is_empty()) {
            (true, _) => Pattern::Suffix(suffix.to_string()),
            (false, true) => Pattern::Prefix(prefix.to_string()),
            (false, false) => Pattern::PrefixSuffix {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            },
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(p) => value == p,
            Pattern::Prefix(p) => value.starts_with(p.as_str()),
            Pattern::Suffix(s) => value.ends_with(s.as_str()),
            Pattern::PrefixSuffix { prefix, suffix } => {
                value.len() >= prefix.len() + suffix.len()
                    && value.starts_with(prefix.as_str())
                    && value.ends_with(suffix.as_str())
            }
        }
    }
}

/// Matches when any contained pattern matches.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn any_of<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, value: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(value))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
