//! Topic pattern matching for the optional wildcard mode.
//!
//! Topics are `.`-separated. In a pattern `*` matches exactly one segment and
//! `>` matches one or more trailing segments.

use crate::error::{PubSubError, PubSubResult};

/// Check that a subscription pattern is well formed.
///
/// # Errors
///
/// Returns [`PubSubError::InvalidTopic`] for empty patterns, empty segments,
/// or a `>` that is not the last segment.
pub fn validate_pattern(pattern: &str) -> PubSubResult<()> {
    let invalid = || PubSubError::InvalidTopic(pattern.to_string());

    if pattern.is_empty() {
        return Err(invalid());
    }

    let segments: Vec<&str> = pattern.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(invalid());
        }
        if *segment == ">" && i != segments.len() - 1 {
            return Err(invalid());
        }
        if segment.len() > 1 && (segment.contains('*') || segment.contains('>')) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Whether `topic` matches `pattern`.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('.');
    let mut topic_parts = topic.split('.');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("orders", "orders"));
        assert!(!topic_matches("orders", "orders.eu"));
        assert!(topic_matches("orders.*", "orders.eu"));
        assert!(!topic_matches("orders.*", "orders.eu.paris"));
        assert!(!topic_matches("orders.*", "orders"));
        assert!(topic_matches("orders.>", "orders.eu.paris"));
        assert!(!topic_matches("orders.>", "orders"));
        assert!(topic_matches("*.eu.>", "orders.eu.paris"));
        assert!(topic_matches(">", "anything.at.all"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("a.b.c").is_ok());
        assert!(validate_pattern("a.*.>").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("a..b").is_err());
        assert!(validate_pattern("a.>.b").is_err());
        assert!(validate_pattern("a.b*").is_err());
    }
}
