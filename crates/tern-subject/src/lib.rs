// Subject validation and wildcard matching.
//
// Subjects are dot-separated tokens. Subscription patterns may use `*` to
// match exactly one token and a trailing `>` to match one or more tokens.
use std::fmt;

pub const TOKEN_SEPARATOR: char = '.';
pub const SINGLE_WILDCARD: &str = "*";
pub const TAIL_WILDCARD: &str = ">";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("subject is empty")]
    Empty,
    #[error("subject {0:?} contains an empty token")]
    EmptyToken(String),
    #[error("subject {0:?} contains whitespace")]
    Whitespace(String),
    #[error("wildcard '>' must be the last token in {0:?}")]
    TailNotLast(String),
    #[error("subject {0:?} contains a wildcard; publish subjects must be literal")]
    WildcardInSubject(String),
}

/// Decide whether `subject` is matched by `pattern`.
///
/// Malformed patterns or subjects never match.
///
/// ```
/// use tern_subject::matches;
///
/// assert!(matches("foo.*", "foo.bar"));
/// assert!(matches("foo.>", "foo.bar.baz"));
/// assert!(!matches("foo.>", "foo"));
/// assert!(!matches("*", "foo.bar"));
/// ```
pub fn matches(pattern: &str, subject: &str) -> bool {
    if pattern.is_empty() || subject.is_empty() {
        return false;
    }
    let mut pattern_tokens = pattern.split(TOKEN_SEPARATOR).peekable();
    let mut subject_tokens = subject.split(TOKEN_SEPARATOR);

    while let Some(p) = pattern_tokens.next() {
        if p.is_empty() {
            return false;
        }
        if p == TAIL_WILDCARD {
            // '>' is only legal last and needs at least one remaining token.
            if pattern_tokens.peek().is_some() {
                return false;
            }
            let mut remaining = 0usize;
            for s in subject_tokens.by_ref() {
                if !is_valid_subject_token(s) {
                    return false;
                }
                remaining += 1;
            }
            return remaining > 0;
        }
        let Some(s) = subject_tokens.next() else {
            return false;
        };
        if !is_valid_subject_token(s) {
            return false;
        }
        if p != SINGLE_WILDCARD && p != s {
            return false;
        }
    }

    subject_tokens.next().is_none()
}

fn is_valid_subject_token(token: &str) -> bool {
    !token.is_empty() && token != SINGLE_WILDCARD && token != TAIL_WILDCARD
}

/// Validate a subscription pattern (wildcards allowed).
pub fn validate_pattern(pattern: &str) -> Result<()> {
    check_common(pattern)?;
    let mut tokens = pattern.split(TOKEN_SEPARATOR).peekable();
    while let Some(token) = tokens.next() {
        if token == TAIL_WILDCARD && tokens.peek().is_some() {
            return Err(Error::TailNotLast(pattern.to_string()));
        }
    }
    Ok(())
}

/// Validate a publish subject (no wildcards).
pub fn validate_subject(subject: &str) -> Result<()> {
    check_common(subject)?;
    if subject
        .split(TOKEN_SEPARATOR)
        .any(|token| token == SINGLE_WILDCARD || token == TAIL_WILDCARD)
    {
        return Err(Error::WildcardInSubject(subject.to_string()));
    }
    Ok(())
}

fn check_common(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Empty);
    }
    if value.chars().any(char::is_whitespace) {
        return Err(Error::Whitespace(value.to_string()));
    }
    if value.split(TOKEN_SEPARATOR).any(str::is_empty) {
        return Err(Error::EmptyToken(value.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

/// A validated, pre-tokenised subscription pattern.
///
/// ```
/// use tern_subject::SubjectPattern;
///
/// let pattern: SubjectPattern = "orders.*.created".parse().expect("pattern");
/// assert!(pattern.matches("orders.eu.created"));
/// assert!(!pattern.matches("orders.eu.deleted"));
/// assert!(!pattern.is_literal());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        validate_pattern(pattern)?;
        let tokens = pattern
            .split(TOKEN_SEPARATOR)
            .map(|token| match token {
                SINGLE_WILDCARD => Token::Single,
                TAIL_WILDCARD => Token::Tail,
                literal => Token::Literal(literal.to_string()),
            })
            .collect();
        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.tokens
            .iter()
            .all(|token| matches!(token, Token::Literal(_)))
    }

    pub fn matches(&self, subject: &str) -> bool {
        if subject.is_empty() {
            return false;
        }
        let mut subject_tokens = subject.split(TOKEN_SEPARATOR);
        for token in &self.tokens {
            match token {
                Token::Tail => {
                    let mut remaining = 0usize;
                    for s in subject_tokens.by_ref() {
                        if !is_valid_subject_token(s) {
                            return false;
                        }
                        remaining += 1;
                    }
                    return remaining > 0;
                }
                Token::Single => match subject_tokens.next() {
                    Some(s) if is_valid_subject_token(s) => {}
                    _ => return false,
                },
                Token::Literal(literal) => match subject_tokens.next() {
                    Some(s) if s == literal => {}
                    _ => return false,
                },
            }
        }
        subject_tokens.next().is_none()
    }
}

impl std::str::FromStr for SubjectPattern {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::new(input)
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_only_identical_subjects() {
        for (pattern, subject) in [
            ("foo", "foo"),
            ("foo.bar", "foo.bar"),
            ("a.b.c.d", "a.b.c.d"),
        ] {
            assert!(matches(pattern, subject), "{pattern} vs {subject}");
        }
        assert!(!matches("foo", "bar"));
        assert!(!matches("foo.bar", "foo"));
        assert!(!matches("foo", "foo.bar"));
        assert!(!matches("Foo", "foo"));
    }

    #[test]
    fn single_wildcard_matches_one_token() {
        assert!(matches("*", "foo"));
        assert!(!matches("*", "foo.bar"));
        assert!(matches("foo.bar.*", "foo.bar.1"));
        assert!(!matches("foo.bar.*", "foo.baz"));
        assert!(!matches("foo.bar.*", "foo.bar"));
        assert!(matches("*.*.*", "foo.bar.baz"));
        assert!(matches("foo.*.baz", "foo.x.baz"));
    }

    #[test]
    fn tail_wildcard_requires_a_trailing_token() {
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(matches("foo.>", "foo.bar"));
        assert!(!matches("foo.>", "bar"));
        assert!(!matches("foo.>", "foo"));
        assert!(matches(">", "anything.at.all"));
    }

    #[test]
    fn malformed_input_never_matches() {
        assert!(!matches("", "foo"));
        assert!(!matches("foo", ""));
        assert!(!matches("foo..bar", "foo..bar"));
        assert!(!matches("foo.>.bar", "foo.x.bar"));
        assert!(!matches("*", "*"));
        assert!(!matches("foo.*", "foo."));
    }

    #[test]
    fn validate_pattern_rejects_bad_shapes() {
        assert!(validate_pattern("foo.*.>").is_ok());
        assert_eq!(validate_pattern(""), Err(Error::Empty));
        assert!(matches!(
            validate_pattern("foo.>.bar"),
            Err(Error::TailNotLast(_))
        ));
        assert!(matches!(
            validate_pattern("foo..bar"),
            Err(Error::EmptyToken(_))
        ));
        assert!(matches!(
            validate_pattern("foo bar"),
            Err(Error::Whitespace(_))
        ));
    }

    #[test]
    fn validate_subject_rejects_wildcards() {
        assert!(validate_subject("foo.bar").is_ok());
        assert!(matches!(
            validate_subject("foo.*"),
            Err(Error::WildcardInSubject(_))
        ));
        assert!(matches!(
            validate_subject(">"),
            Err(Error::WildcardInSubject(_))
        ));
    }

    #[test]
    fn compiled_pattern_agrees_with_free_function() {
        let patterns = ["foo", "*", "foo.*", "foo.>", "*.bar.>", "a.*.c"];
        let subjects = ["foo", "bar", "foo.bar", "foo.bar.baz", "x.bar.y", "a.b.c"];
        for pattern in patterns {
            let compiled = SubjectPattern::new(pattern).expect("pattern");
            for subject in subjects {
                assert_eq!(
                    compiled.matches(subject),
                    matches(pattern, subject),
                    "{pattern} vs {subject}"
                );
            }
        }
    }

    #[test]
    fn literal_detection() {
        assert!(SubjectPattern::new("foo.bar").expect("p").is_literal());
        assert!(!SubjectPattern::new("foo.>").expect("p").is_literal());
        assert_eq!(SubjectPattern::new("a.b").expect("p").to_string(), "a.b");
    }
}
