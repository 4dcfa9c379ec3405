use std::fmt;

/// A parsed domain pattern from a `[[domain]]` rule
///
/// Two forms are supported:
/// 1. Exact: `example.com` matches only `example.com`
/// 2. Wildcard: `*.example.com` matches `example.com` itself and any
///    subdomain at any depth (`blog.example.com`, `api.v2.example.com`)
///
/// Patterns are lowercased on parse; candidates are expected to be lowercase
/// already (see [`crate::url::extract_domain`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainPattern {
    Exact(String),
    Suffix(String),
}

impl DomainPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_lowercase();
        match pattern.strip_prefix("*.") {
            Some(base) => Self::Suffix(base.to_string()),
            None => Self::Exact(pattern),
        }
    }

    /// Checks whether `domain` falls under this pattern
    ///
    /// # Examples
    ///
    /// ```
    /// use sumi_conductor::url::DomainPattern;
    ///
    /// let pattern = DomainPattern::parse("*.example.com");
    /// assert!(pattern.matches("example.com"));
    /// assert!(pattern.matches("api.v2.example.com"));
    /// assert!(!pattern.matches("myexample.com"));
    /// ```
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            Self::Exact(exact) => domain == exact,
            Self::Suffix(base) => {
                domain == base
                    || (domain.len() > base.len()
                        && domain.ends_with(base.as_str())
                        && domain.as_bytes()[domain.len() - base.len() - 1] == b'.')
            }
        }
    }

    /// Exact patterns outrank wildcards; longer wildcards outrank shorter ones
    pub fn specificity(&self) -> usize {
        match self {
            Self::Exact(_) => usize::MAX,
            Self::Suffix(base) => base.len(),
        }
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => write!(f, "{}", exact),
            Self::Suffix(base) => write!(f, "*.{}", base),
        }
    }
}

/// Returns the value of the most specific pattern matching `domain`
///
/// Ties keep the earliest entry, so config order decides between equally
/// specific rules.
pub fn most_specific<'a, T>(
    rules: impl IntoIterator<Item = &'a (DomainPattern, T)>,
    domain: &str,
) -> Option<&'a T>
where
    T: 'a,
{
    let mut best: Option<&'a (DomainPattern, T)> = None;
    for rule in rules {
        if !rule.0.matches(domain) {
            continue;
        }
        match best {
            Some(current) if current.0.specificity() >= rule.0.specificity() => {}
            _ => best = Some(rule),
        }
    }
    best.map(|(_, value)| value)
}
