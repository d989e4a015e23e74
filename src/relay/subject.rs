//! Subject validation and pattern matching.
//!
//! Subjects are dot-delimited tokens in `[A-Za-z0-9_-]`. Subscriber patterns
//! may additionally use `*` (exactly one token) and a terminal `>` (one or
//! more trailing tokens). Patterns compile once to a vector of token
//! matchers; matching is a linear walk with early termination.

use thiserror::Error;

use crate::error::{DomainError, ErrorCode};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject must not be empty")]
    Empty,
    #[error("empty token in subject {0:?}")]
    EmptyToken(String),
    #[error("invalid character in token {0:?}")]
    BadToken(String),
    #[error("wildcard {0:?} is not allowed in a published subject")]
    WildcardInSubject(String),
    #[error("'>' must be the terminal token")]
    TailNotTerminal,
}

impl From<SubjectError> for DomainError {
    fn from(err: SubjectError) -> Self {
        DomainError::new(ErrorCode::InvalidSubject, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenMatcher {
    Literal(String),
    AnyOne,
    TailAny,
}

/// A compiled subscriber pattern.
#[derive(Debug, Clone)]
pub struct SubjectPattern {
    raw: String,
    matchers: Vec<TokenMatcher>,
}

fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a concrete subject (no wildcards), as used on publish and for
/// endpoint registration.
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(SubjectError::EmptyToken(subject.to_string()));
        }
        if token == "*" || token == ">" {
            return Err(SubjectError::WildcardInSubject(token.to_string()));
        }
        if !valid_token(token) {
            return Err(SubjectError::BadToken(token.to_string()));
        }
    }
    Ok(())
}

impl SubjectPattern {
    /// Compile a subscriber pattern, validating wildcard placement.
    pub fn compile(pattern: &str) -> Result<Self, SubjectError> {
        if pattern.is_empty() {
            return Err(SubjectError::Empty);
        }
        let tokens: Vec<&str> = pattern.split('.').collect();
        let mut matchers = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            let matcher = match *token {
                "" => return Err(SubjectError::EmptyToken(pattern.to_string())),
                "*" => TokenMatcher::AnyOne,
                ">" => {
                    if i + 1 != tokens.len() {
                        return Err(SubjectError::TailNotTerminal);
                    }
                    TokenMatcher::TailAny
                }
                literal => {
                    if !valid_token(literal) {
                        return Err(SubjectError::BadToken(literal.to_string()));
                    }
                    TokenMatcher::Literal(literal.to_string())
                }
            };
            matchers.push(matcher);
        }
        Ok(Self {
            raw: pattern.to_string(),
            matchers,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Does this pattern contain any wildcard? Endpoints require none.
    pub fn is_concrete(&self) -> bool {
        self.matchers
            .iter()
            .all(|m| matches!(m, TokenMatcher::Literal(_)))
    }

    /// Match a concrete subject against the compiled pattern.
    pub fn matches(&self, subject: &str) -> bool {
        let mut tokens = subject.split('.');
        for matcher in &self.matchers {
            match matcher {
                TokenMatcher::TailAny => {
                    // `>` needs at least one remaining token.
                    return tokens.next().is_some();
                }
                TokenMatcher::AnyOne => {
                    if tokens.next().is_none() {
                        return false;
                    }
                }
                TokenMatcher::Literal(expected) => match tokens.next() {
                    Some(token) if token == expected => {}
                    _ => return false,
                },
            }
        }
        tokens.next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn validates_concrete_subjects() {
        assert!(validate_subject("a.b.c").is_ok());
        assert!(validate_subject("relay.agent.A-1_x").is_ok());
        assert_eq!(validate_subject(""), Err(SubjectError::Empty));
        assert!(validate_subject("a..b").is_err());
        assert!(validate_subject(".a").is_err());
        assert!(validate_subject("a.").is_err());
        assert!(validate_subject("a.*.c").is_err());
        assert!(validate_subject("a.>").is_err());
        assert!(validate_subject("a.b!c").is_err());
    }

    #[test]
    fn compiles_and_rejects_patterns() {
        assert!(SubjectPattern::compile("a.b.c").is_ok());
        assert!(SubjectPattern::compile("a.*.c").is_ok());
        assert!(SubjectPattern::compile("a.b.>").is_ok());
        assert_eq!(
            SubjectPattern::compile("a.>.c").unwrap_err(),
            SubjectError::TailNotTerminal
        );
        assert!(SubjectPattern::compile("a..b").is_err());
        assert!(SubjectPattern::compile("").is_err());
    }

    #[test]
    fn star_matches_exactly_one_token() {
        let pattern = SubjectPattern::compile("a.*.c").unwrap();
        assert!(pattern.matches("a.b.c"));
        assert!(!pattern.matches("a.c"));
        assert!(!pattern.matches("a.b.x.c"));
    }

    #[test]
    fn tail_matches_one_or_more_tokens() {
        let pattern = SubjectPattern::compile("a.b.>").unwrap();
        assert!(pattern.matches("a.b.c"));
        assert!(pattern.matches("a.b.c.d.e"));
        assert!(!pattern.matches("a.b"));
        assert!(!pattern.matches("x.b.c"));
    }

    #[test]
    fn literal_patterns_match_exactly() {
        let pattern = SubjectPattern::compile("a.b.c").unwrap();
        assert!(pattern.matches("a.b.c"));
        assert!(!pattern.matches("a.b"));
        assert!(!pattern.matches("a.b.c.d"));
        assert!(pattern.is_concrete());
        assert!(!SubjectPattern::compile("a.*").unwrap().is_concrete());
    }

    proptest! {
        /// A concrete subject always matches itself as a pattern.
        #[test]
        fn subject_matches_itself(tokens in prop::collection::vec("[a-z0-9_-]{1,8}", 1..6)) {
            let subject = tokens.join(".");
            prop_assume!(validate_subject(&subject).is_ok());
            let pattern = SubjectPattern::compile(&subject).unwrap();
            prop_assert!(pattern.matches(&subject));
        }

        /// `prefix.>` matches every deeper subject under the prefix.
        #[test]
        fn tail_matches_any_extension(
            prefix in prop::collection::vec("[a-z0-9]{1,6}", 1..4),
            tail in prop::collection::vec("[a-z0-9]{1,6}", 1..4),
        ) {
            let pattern = SubjectPattern::compile(&format!("{}.>", prefix.join("."))).unwrap();
            let subject = format!("{}.{}", prefix.join("."), tail.join("."));
            prop_assert!(pattern.matches(&subject));
        }
    }
}
