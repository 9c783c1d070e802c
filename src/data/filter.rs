use std::fmt;
use super::{ArchivePath, DataError};

/// One component of a filter pattern: a literal path component or a
/// single-component wildcard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Any,
    Literal(String),
}

impl Segment {
    fn matches(&self, component: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Literal(s) => s == component,
        }
    }

    // Whether every component this segment admits is also admitted by
    // `other`.
    fn covered_by(&self, other: &Segment) -> bool {
        match (other, self) {
            (Segment::Any, _) => true,
            (Segment::Literal(a), Segment::Literal(b)) => a == b,
            (Segment::Literal(_), Segment::Any) => false,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Any => write!(f, "*"),
            Segment::Literal(s) => write!(f, "{}", s),
        }
    }
}

/// A pattern over archive path components.
///
/// A pattern matches a path if the two agree componentwise over the
/// shorter of their lengths, so `foo` matches `foo`, `foo/sub` and
/// `foo/sub/bar` but not `foobar`. Trailing wildcards are stripped on
/// construction, which makes `foo` and `foo/*` the same filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Filter {
    Nothing,
    Everything,
    Pattern(Vec<Segment>),
}

impl Filter {
    /// Builds the canonical filter for a segment list: trailing
    /// wildcards are dropped, and a pattern of nothing but wildcards is
    /// `Everything`.
    pub fn pattern(mut segments: Vec<Segment>) -> Filter {
        while segments.last() == Some(&Segment::Any) {
            segments.pop();
        }
        if segments.is_empty() {
            Filter::Everything
        } else {
            Filter::Pattern(segments)
        }
    }

    pub fn parse(s: &str) -> Result<Filter, DataError> {
        match s {
            "EVERYTHING" => return Ok(Filter::Everything),
            "NOTHING" => return Ok(Filter::Nothing),
            _ => {}
        }
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Err(DataError::InvalidFilter(s.to_string()));
        }
        let mut segments = Vec::new();
        for component in trimmed.split('/') {
            match component {
                "" | "." | ".." => return Err(DataError::InvalidFilter(s.to_string())),
                "*" => segments.push(Segment::Any),
                c => segments.push(Segment::Literal(c.to_string())),
            }
        }
        Ok(Filter::pattern(segments))
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Filter::Nothing)
    }

    /// Whether this filter matches the path per the prefix semantics.
    pub fn matches(&self, path: &ArchivePath) -> bool {
        match self {
            Filter::Nothing => false,
            Filter::Everything => true,
            Filter::Pattern(segments) => {
                let components = path.components();
                let len = segments.len().min(components.len());
                segments[..len]
                    .iter()
                    .zip(&components[..len])
                    .all(|(segment, component)| segment.matches(component))
            }
        }
    }

    /// Whether the pattern is satisfied exactly, with no leftover
    /// components on either side.
    pub fn matches_only(&self, path: &ArchivePath) -> bool {
        match self {
            Filter::Nothing => false,
            Filter::Everything => true,
            Filter::Pattern(segments) => {
                segments.len() == path.components().len() && self.matches(path)
            }
        }
    }

    /// Whether every path `other` matches is also matched by `self`.
    pub fn includes(&self, other: &Filter) -> bool {
        match (self, other) {
            (_, Filter::Nothing) => true,
            (Filter::Everything, _) => true,
            (Filter::Nothing, _) => false,
            (_, Filter::Everything) => false,
            (Filter::Pattern(own), Filter::Pattern(other)) => {
                own.len() <= other.len()
                    && own
                        .iter()
                        .zip(other.iter())
                        .all(|(own, other)| other.covered_by(own))
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Nothing => write!(f, "NOTHING"),
            Filter::Everything => write!(f, "EVERYTHING"),
            Filter::Pattern(segments) => {
                for (i, segment) in segments.iter().enumerate() {
                    if i > 0 {
                        write!(f, "/")?;
                    }
                    write!(f, "{}", segment)?;
                }
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The union of filters describing everything one node wants.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    filters: Vec<Filter>,
}

impl Predicate {
    pub fn nothing() -> Self {
        Predicate { filters: Vec::new() }
    }

    pub fn everything() -> Self {
        Predicate {
            filters: vec![Filter::Everything],
        }
    }

    pub fn of(filter: Filter) -> Self {
        let mut predicate = Self::nothing();
        predicate.add(filter);
        predicate
    }

    pub fn add(&mut self, filter: Filter) {
        if filter.is_nothing() {
            return;
        }
        if self.filters.iter().any(|f| f.includes(&filter)) {
            return;
        }
        self.filters.retain(|f| !filter.includes(f));
        self.filters.push(filter);
    }

    pub fn matches(&self, path: &ArchivePath) -> bool {
        self.filters.iter().any(|f| f.matches(path))
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_nothing(&self) -> bool {
        self.filters.is_empty()
    }

    /// A predicate is bounded when it names a finite set of exact
    /// paths, which is what makes "all desired data received" decidable.
    pub fn is_bounded(&self) -> bool {
        !self.filters.is_empty()
            && self.filters.iter().all(|f| match f {
                Filter::Pattern(segments) => {
                    segments.iter().all(|s| matches!(s, Segment::Literal(_)))
                }
                _ => false,
            })
    }

    /// The exact paths of a bounded predicate.
    pub fn exact_paths(&self) -> Vec<ArchivePath> {
        self.filters
            .iter()
            .filter_map(|f| match f {
                Filter::Pattern(segments) => ArchivePath::from_components(
                    segments
                        .iter()
                        .map(|s| match s {
                            Segment::Literal(c) => c.clone(),
                            Segment::Any => String::new(),
                        })
                        .collect(),
                )
                .ok(),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filters.is_empty() {
            return write!(f, "NOTHING");
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", filter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ArchivePath {
        ArchivePath::parse(s).unwrap()
    }

    #[test]
    fn test_subtree_matching() {
        let filter = Filter::parse("foo").unwrap();
        assert!(filter.matches(&path("foo")));
        assert!(filter.matches(&path("foo/sub")));
        assert!(filter.matches(&path("foo/sub/bar")));
        assert!(!filter.matches(&path("foobar")));
        assert!(!filter.matches(&path("bar/foo")));
    }

    #[test]
    fn test_wildcard_matches_single_component() {
        let filter = Filter::parse("*/logs").unwrap();
        assert!(filter.matches(&path("a/logs")));
        assert!(filter.matches(&path("b/logs/x")));
        assert!(!filter.matches(&path("a/data")));
    }

    #[test]
    fn test_trailing_wildcards_are_equal() {
        assert_eq!(Filter::parse("foo").unwrap(), Filter::parse("foo/*").unwrap());
        assert_eq!(Filter::parse("*").unwrap(), Filter::Everything);
    }

    #[test]
    fn test_matches_only_implies_matches() {
        let filters = [
            Filter::parse("foo").unwrap(),
            Filter::parse("foo/*").unwrap(),
            Filter::parse("*/logs").unwrap(),
            Filter::Everything,
        ];
        let paths = [path("foo"), path("foo/sub"), path("a/logs"), path("x")];
        for filter in &filters {
            for p in &paths {
                if filter.matches_only(p) {
                    assert!(filter.matches(p), "{} matchesOnly {} but not matches", filter, p);
                }
            }
        }
    }

    #[test]
    fn test_includes_implies_matches() {
        let wide = Filter::parse("foo").unwrap();
        let narrow = Filter::parse("foo/sub").unwrap();
        assert!(wide.includes(&narrow));
        assert!(!narrow.includes(&wide));
        for p in [path("foo"), path("foo/sub"), path("foo/sub/x")] {
            if narrow.matches(&p) {
                assert!(wide.matches(&p));
            }
        }
    }

    #[test]
    fn test_includes_wildcards() {
        let any = Filter::parse("*/logs").unwrap();
        let literal = Filter::parse("host/logs").unwrap();
        assert!(any.includes(&literal));
        assert!(!literal.includes(&any));
        assert!(Filter::Everything.includes(&any));
        assert!(any.includes(&Filter::Nothing));
        assert!(!Filter::Nothing.includes(&any));
    }

    #[test]
    fn test_includes_is_a_partial_order() {
        let a = Filter::parse("a").unwrap();
        let b = Filter::parse("b").unwrap();
        assert!(a.includes(&a));
        assert!(!a.includes(&b));
        assert!(!b.includes(&a));
    }

    #[test]
    fn test_predicate_union_and_bounds() {
        let mut predicate = Predicate::nothing();
        assert!(!predicate.matches(&path("a")));
        predicate.add(Filter::parse("data/file-1").unwrap());
        predicate.add(Filter::parse("data/file-2").unwrap());
        assert!(predicate.is_bounded());
        assert!(predicate.matches(&path("data/file-1")));
        assert!(!predicate.matches(&path("data/file-3")));
        assert_eq!(predicate.exact_paths().len(), 2);

        predicate.add(Filter::parse("data").unwrap());
        // The subtree filter swallows both exact paths.
        assert_eq!(predicate.filters().len(), 1);
        assert!(!predicate.is_bounded());
    }

    #[test]
    fn test_predicate_dedup_on_add() {
        let mut predicate = Predicate::of(Filter::Everything);
        predicate.add(Filter::parse("foo").unwrap());
        assert_eq!(predicate.filters(), &[Filter::Everything]);
    }
}
