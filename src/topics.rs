//! Topic canonicalization, filter matching and identifier validation
//!
//! Device topics on the broker bridge are rooted at `/devices/{device}`. Filters
//! follow MQTT 3.1.1 wildcard rules: `+` matches exactly one level, `#` matches
//! the remaining levels and is only a wildcard in the last position.

use thiserror::Error;

pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Check whether a concrete published topic matches a subscription filter
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        let filter_level = filter_levels.next();
        let topic_level = topic_levels.next();

        match filter_level {
            Some("#") if filter_levels.peek().is_none() => return true,
            Some(level) => match topic_level {
                None => return false,
                Some(_) if level == "+" => continue,
                Some(actual) if actual == level => continue,
                Some(_) => return false,
            },
            None => return topic_level.is_none(),
        }
    }
}

/// Whether a filter contains wildcard levels
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

/// Validate one path segment of a device identity (project, region, registry, device)
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(kind));
    }

    for ch in value.chars() {
        if ch == '/' || ch == '+' || ch == '#' || ch.is_whitespace() || ch.is_control() {
            return Err(ValidationError::InvalidChar { kind, ch });
        }
    }

    Ok(())
}

/// Identity validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{kind} contains invalid character: '{ch}'")]
    InvalidChar { kind: &'static str, ch: char },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_no_consecutive_slashes(topic in ".*") {
            let result = canonicalize_topic(&topic);
            prop_assert!(!result.contains("//"), "No consecutive slashes allowed: {}", result);
        }

        #[test]
        fn concrete_topic_matches_itself(topic in "(/[a-z0-9-]{1,8}){1,5}") {
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn hash_filter_matches_any_suffix(
            prefix in "/devices/[a-z]{1,8}",
            suffix in "(/[a-z0-9]{1,8}){0,4}"
        ) {
            let filter = format!("{prefix}/#");
            let topic = format!("{prefix}{suffix}");
            prop_assert!(topic_matches(&topic, &filter), "{} should match {}", topic, filter);
        }
    }

    #[test]
    fn test_device_topic_examples() {
        assert_eq!(
            canonicalize_topic("devices//test-device/config/"),
            "/devices/test-device/config"
        );
        assert_eq!(canonicalize_topic(""), "/");
        assert_eq!(canonicalize_topic("//"), "/");
    }

    #[test]
    fn test_exact_matching() {
        assert!(topic_matches("/devices/d/config", "/devices/d/config"));
        assert!(!topic_matches("/devices/d/config", "/devices/d/events"));
        assert!(!topic_matches("/devices/d/config/x", "/devices/d/config"));
        assert!(!topic_matches("/devices/d", "/devices/d/config"));
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(topic_matches("/devices/d/commands/reboot", "/devices/d/commands/#"));
        assert!(topic_matches("/devices/d/commands", "/devices/d/commands/#"));
        assert!(topic_matches("/devices/d/commands/a/b", "/devices/d/commands/#"));
        assert!(topic_matches("/devices/d/config", "/devices/+/config"));
        assert!(!topic_matches("/devices/d/x/config", "/devices/+/config"));
        assert!(topic_matches("/devices/d/config", "#"));

        // '#' in the middle is a literal level
        assert!(!topic_matches("/devices/d/config", "/devices/#/config"));
    }

    #[test]
    fn test_is_wildcard_filter() {
        assert!(is_wildcard_filter("/devices/d/commands/#"));
        assert!(is_wildcard_filter("/devices/+/config"));
        assert!(!is_wildcard_filter("/devices/d/config"));
        assert!(!is_wildcard_filter("/devices/d#/config"));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("device", "test-device").is_ok());
        assert!(validate_identifier("region", "us-central1").is_ok());
        assert!(validate_identifier("project", "my_project.1").is_ok());

        assert_eq!(
            validate_identifier("device", ""),
            Err(ValidationError::Empty("device"))
        );
        assert_eq!(
            validate_identifier("device", "a/b"),
            Err(ValidationError::InvalidChar {
                kind: "device",
                ch: '/'
            })
        );
        assert!(validate_identifier("registry", "reg#1").is_err());
        assert!(validate_identifier("registry", "reg+1").is_err());
        assert!(validate_identifier("registry", "reg 1").is_err());
    }
}
