//! Tag glob matching: `*` (one segment), `**` (zero or more segments), and
//! `{a,b,c}` alternation within a segment. No regex dependency — the grammar
//! is small enough that a hand-rolled segment-wise comparator is clearer and
//! faster than compiling through a general regex engine.

/// One segment of a compiled pattern.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Star,
    DoubleStar,
    Alternation(Vec<String>),
}

/// A compiled tag-matching pattern, e.g. `app.*.error` or `{app,web}.**`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    segments: Vec<Segment>,
    source: String,
}

impl Pattern {
    pub fn compile(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|raw| {
                if raw == "*" {
                    Segment::Star
                } else if raw == "**" {
                    Segment::DoubleStar
                } else if raw.starts_with('{') && raw.ends_with('}') {
                    let inner = &raw[1..raw.len() - 1];
                    Segment::Alternation(inner.split(',').map(str::to_owned).collect())
                } else {
                    Segment::Literal(raw.to_owned())
                }
            })
            .collect();
        Self {
            segments,
            source: pattern.to_owned(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns whether `tag` (a dot-separated identifier) matches this
    /// pattern. `**` may consume zero or more tag segments, including none,
    /// so `a.**.b` matches `a.b` as well as `a.x.y.b`.
    pub fn matches(&self, tag: &str) -> bool {
        let tag_segments: Vec<&str> = tag.split('.').collect();
        match_segments(&self.segments, &tag_segments)
    }
}

fn match_segments(pattern: &[Segment], tag: &[&str]) -> bool {
    match pattern.split_first() {
        None => tag.is_empty(),
        Some((Segment::DoubleStar, rest)) => {
            // Try consuming 0, 1, 2, ... segments with `**`.
            (0..=tag.len()).any(|n| match_segments(rest, &tag[n..]))
        }
        Some((seg, rest)) => match tag.split_first() {
            None => false,
            Some((head, tag_rest)) => segment_matches(seg, head) && match_segments(rest, tag_rest),
        },
    }
}

fn segment_matches(segment: &Segment, value: &str) -> bool {
    match segment {
        Segment::Literal(lit) => lit == value,
        Segment::Star => true,
        Segment::DoubleStar => unreachable!("handled in match_segments"),
        Segment::Alternation(options) => options.iter().any(|opt| opt == value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_matches_exactly() {
        let p = Pattern::compile("app.access");
        assert!(p.matches("app.access"));
        assert!(!p.matches("app.access.extra"));
        assert!(!p.matches("app.error"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        let p = Pattern::compile("app.*");
        assert!(p.matches("app.access"));
        assert!(!p.matches("app"));
        assert!(!p.matches("app.access.extra"));
    }

    #[test]
    fn double_star_matches_zero_or_more_segments() {
        let p = Pattern::compile("app.**");
        assert!(p.matches("app"));
        assert!(p.matches("app.access"));
        assert!(p.matches("app.access.error.detail"));
        assert!(!p.matches("other"));
    }

    #[test]
    fn double_star_in_the_middle() {
        let p = Pattern::compile("a.**.z");
        assert!(p.matches("a.z"));
        assert!(p.matches("a.x.z"));
        assert!(p.matches("a.x.y.z"));
        assert!(!p.matches("a.x.y"));
    }

    #[test]
    fn alternation_matches_any_listed_option() {
        let p = Pattern::compile("{app,web}.error");
        assert!(p.matches("app.error"));
        assert!(p.matches("web.error"));
        assert!(!p.matches("db.error"));
    }
}
