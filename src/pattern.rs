//! Segmented channel-name matching.
//!
//! Names and patterns are dot-separated segments. `*` matches exactly one
//! non-empty segment, `>` matches one or more trailing segments and is
//! legal only in the final position. A pattern without either token is a
//! literal name.

/// Returns true when the pattern contains a wildcard segment.
#[must_use]
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('.').any(|segment| segment == "*" || segment == ">")
}

/// Structural validity of a pattern: non-empty segments and `>` only as
/// the final segment. Literal names pass the same check.
#[must_use]
pub fn is_valid(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let mut segments = pattern.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return false;
        }
        if segment == ">" && segments.peek().is_some() {
            return false;
        }
    }
    true
}

/// Matches a channel name against a pattern. Iterates segments in lock
/// step without allocating.
#[must_use]
pub fn matches(pattern: &str, name: &str) -> bool {
    let mut name_segments = name.split('.');
    let mut pattern_iter = pattern.split('.').peekable();
    loop {
        match pattern_iter.next() {
            None => return name_segments.next().is_none(),
            Some(">") => {
                if pattern_iter.peek().is_some() {
                    return false;
                }
                // One or more trailing segments, each non-empty.
                let mut seen = false;
                for segment in name_segments {
                    if segment.is_empty() {
                        return false;
                    }
                    seen = true;
                }
                return seen;
            }
            Some("*") => match name_segments.next() {
                Some(segment) if !segment.is_empty() => {}
                _ => return false,
            },
            Some(literal) => match name_segments.next() {
                Some(segment) if segment == literal => {}
                _ => return false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns() {
        assert!(matches("a.b", "a.b"));
        assert!(!matches("a.b", "a.b.c"));
        assert!(!matches("a.b", "a"));
        assert!(!matches("a.b", "a.c"));
    }

    #[test]
    fn single_segment_star() {
        assert!(matches("orders.*", "orders.new"));
        assert!(matches("orders.*", "orders.cancelled"));
        assert!(!matches("orders.*", "orders"));
        assert!(!matches("orders.*", "orders.shipped.fedex"));
        assert!(matches("*.new", "orders.new"));
        assert!(!matches("*.new", "new"));
        assert!(matches("orders.*.confirmed", "orders.123.confirmed"));
        assert!(!matches("orders.*.confirmed", "orders.confirmed"));
        assert!(matches("*.*.done", "a.b.done"));
        assert!(!matches("*.*.done", "a.done"));
        assert!(!matches("*.*.done", "a.b.c.done"));
    }

    #[test]
    fn trailing_tail() {
        assert!(matches("orders.>", "orders.new"));
        assert!(matches("orders.>", "orders.shipped.fedex"));
        assert!(!matches("orders.>", "orders"));
        assert!(!matches("orders.>", "payments.new"));
    }

    #[test]
    fn star_requires_non_empty_segment() {
        assert!(!matches("orders.*", "orders."));
        assert!(!matches("*", ""));
    }

    #[test]
    fn wildcard_detection() {
        assert!(is_wildcard("orders.*"));
        assert!(is_wildcard("orders.>"));
        assert!(!is_wildcard("orders.new"));
        assert!(!is_wildcard("a*b"));
    }

    #[test]
    fn validity() {
        assert!(is_valid("orders.*.confirmed"));
        assert!(is_valid("orders.>"));
        assert!(!is_valid(">.orders"));
        assert!(!is_valid("orders..new"));
        assert!(!is_valid(""));
    }
}
