//! Dot-separated subjects and wildcard filters.
//!
//! A subject is a sequence of non-empty tokens separated by `.`. Filters may
//! additionally use `*` to match exactly one token and a trailing `>` to match
//! one or more remaining tokens.

use crate::error::LogError;

const SINGLE: &str = "*";
const TAIL: &str = ">";

/// Validate a concrete (publishable) subject.
pub fn validate_subject(subject: &str) -> Result<(), LogError> {
    if !tokens_valid(subject) || subject.split('.').any(|t| t == SINGLE || t == TAIL) {
        return Err(LogError::InvalidSubject {
            subject: subject.to_string(),
        });
    }
    Ok(())
}

/// Validate a filter, which may contain wildcards.
pub fn validate_filter(filter: &str) -> Result<(), LogError> {
    if !tokens_valid(filter) {
        return Err(LogError::InvalidSubject {
            subject: filter.to_string(),
        });
    }
    let tokens: Vec<&str> = filter.split('.').collect();
    if let Some(pos) = tokens.iter().position(|t| *t == TAIL) {
        if pos != tokens.len() - 1 {
            return Err(LogError::InvalidSubject {
                subject: filter.to_string(),
            });
        }
    }
    Ok(())
}

fn tokens_valid(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && !t.chars().any(char::is_whitespace))
}

/// Returns true if `subject` is matched by `filter`.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut f = filter.split('.');
    let mut s = subject.split('.');
    loop {
        match (f.next(), s.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(SINGLE), Some(_)) => continue,
            (Some(ft), Some(st)) if ft == st => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Turn an arbitrary name into a single subject token.
pub fn sanitize_token(name: &str) -> String {
    let token: String = name
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_match() {
        assert!(subject_matches("app.sync.posts", "app.sync.posts"));
        assert!(!subject_matches("app.sync.posts", "app.sync.users"));
        assert!(!subject_matches("app.sync", "app.sync.posts"));
    }

    #[test]
    fn test_single_wildcard() {
        assert!(subject_matches("app.*.posts", "app.sync.posts"));
        assert!(!subject_matches("app.*", "app.sync.posts"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(subject_matches("app.sync.>", "app.sync.posts"));
        assert!(subject_matches("app.sync.>", "app.sync._realtime"));
        assert!(subject_matches("app.sync.>", "app.sync.a.b.c"));
        assert!(!subject_matches("app.sync.>", "app.sync"));
        assert!(!subject_matches("app.sync.>", "other.sync.posts"));
    }

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("app.sync.posts").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("app..posts").is_err());
        assert!(validate_subject("app.sync.*").is_err());
        assert!(validate_subject("app sync").is_err());
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("app.sync.>").is_ok());
        assert!(validate_filter("app.*.posts").is_ok());
        assert!(validate_filter("app.>.posts").is_err());
    }

    #[test]
    fn test_sanitize_token() {
        assert_eq!(sanitize_token("posts"), "posts");
        assert_eq!(sanitize_token("my.posts"), "my_posts");
        assert_eq!(sanitize_token("a b*c>"), "a_b_c_");
        assert_eq!(sanitize_token(""), "_");
    }

    proptest! {
        #[test]
        fn prop_tail_filter_matches_any_extension(
            prefix in "[a-z]{1,8}",
            rest in proptest::collection::vec("[a-z0-9_]{1,8}", 1..5),
        ) {
            let subject = format!("{}.sync.{}", prefix, rest.join("."));
            let filter = format!("{}.sync.>", prefix);
            prop_assert!(subject_matches(&filter, &subject));
        }

        #[test]
        fn prop_sanitized_token_is_valid_subject(name in ".{0,24}") {
            let subject = format!("app.sync.{}", sanitize_token(&name));
            prop_assert!(validate_subject(&subject).is_ok());
        }
    }
}
