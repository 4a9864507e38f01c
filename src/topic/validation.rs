//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names must not contain wildcards (+ or #)
//! - Topic filters may contain wildcards
//! - `#` must occupy the last level on its own
//! - `+` must occupy an entire level
//! - Byte length and level count are bounded by configuration
//! - Topics starting with `$` are reserved; clients may only use the
//!   configured system prefixes

/// Limits applied to client supplied topic names and filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLimits {
    /// Maximum topic length in bytes (0 = protocol maximum of 65535)
    pub max_length: usize,
    /// Maximum number of `/`-separated levels (0 = unlimited)
    pub max_levels: usize,
    /// `$` prefixes clients may publish or subscribe to
    pub system_prefixes: Vec<String>,
}

impl Default for TopicLimits {
    fn default() -> Self {
        Self {
            max_length: 255,
            max_levels: 8,
            system_prefixes: Vec::new(),
        }
    }
}

impl TopicLimits {
    /// Limits that only enforce the protocol rules
    pub fn unbounded() -> Self {
        Self {
            max_length: 0,
            max_levels: 0,
            system_prefixes: Vec::new(),
        }
    }

    fn check_common(&self, topic: &str) -> Result<(), &'static str> {
        if topic.is_empty() {
            return Err("topic cannot be empty");
        }

        let max_length = if self.max_length == 0 {
            65535
        } else {
            self.max_length
        };
        if topic.len() > max_length {
            return Err("topic exceeds maximum length");
        }

        if topic.contains('\0') {
            return Err("topic cannot contain null character");
        }

        if self.max_levels > 0 && topic.split('/').count() > self.max_levels {
            return Err("topic exceeds maximum allowed levels");
        }

        if topic.starts_with('$')
            && !self
                .system_prefixes
                .iter()
                .any(|prefix| topic.starts_with(prefix.as_str()))
        {
            return Err("reserved $ topic");
        }

        Ok(())
    }
}

/// Validate a topic name (used in PUBLISH and will messages)
pub fn validate_topic_name(topic: &str, limits: &TopicLimits) -> Result<(), &'static str> {
    limits.check_common(topic)?;

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE and permission rules)
pub fn validate_topic_filter(filter: &str, limits: &TopicLimits) -> Result<(), &'static str> {
    limits.check_common(filter)?;
    validate_wildcards(filter)
}

/// Check wildcard placement only
pub fn validate_wildcards(filter: &str) -> Result<(), &'static str> {
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// - `/` is the level separator; empty levels are significant
/// - `+` matches exactly one level, including an empty one
/// - `#` matches zero or more trailing levels
/// - `$` topics don't match filters starting with `+` or `#`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn limits() -> TopicLimits {
        TopicLimits::default()
    }

    #[test]
    fn test_validate_topic_name() {
        let limits = limits();
        assert!(validate_topic_name("test", &limits).is_ok());
        assert!(validate_topic_name("test/topic", &limits).is_ok());
        assert!(validate_topic_name("/test/topic", &limits).is_ok());
        assert!(validate_topic_name("test/topic/", &limits).is_ok());
        assert!(validate_topic_name("Case/Sensitive", &limits).is_ok());

        assert!(validate_topic_name("", &limits).is_err());
        assert!(validate_topic_name("a\0b", &limits).is_err());
        assert!(validate_topic_name("test+topic", &limits).is_err());
        assert!(validate_topic_name("test#topic", &limits).is_err());
        assert!(validate_topic_name("test/+/topic", &limits).is_err());
        assert!(validate_topic_name("test/#", &limits).is_err());
    }

    #[test_case("++"; "double plus")]
    #[test_case("+a"; "plus prefix")]
    #[test_case("a+b"; "plus infix")]
    #[test_case("#/a"; "hash not last")]
    #[test_case("a/#/b"; "hash in middle")]
    #[test_case("a#"; "hash suffix")]
    #[test_case("a/b#"; "hash glued")]
    #[test_case(""; "empty")]
    #[test_case("a/\0"; "nul")]
    fn test_illegal_filters(filter: &str) {
        assert!(validate_topic_filter(filter, &limits()).is_err());
    }

    #[test_case("#"; "hash")]
    #[test_case("+"; "plus")]
    #[test_case("a/+/b"; "plus middle")]
    #[test_case("a/#"; "hash tail")]
    #[test_case("+/+/+"; "all plus")]
    #[test_case("/"; "two empty levels")]
    fn test_legal_filters(filter: &str) {
        assert!(validate_topic_filter(filter, &limits()).is_ok());
    }

    #[test]
    fn test_max_levels() {
        let limits = TopicLimits {
            max_levels: 8,
            ..TopicLimits::unbounded()
        };
        assert!(validate_topic_name("1/2/3/4/5/6/7/8", &limits).is_ok());
        assert!(validate_topic_name("1/2/3/4/5/6/7/8/9", &limits).is_err());
        // Empty levels still count
        assert!(validate_topic_name("/2/3/4/5/6/7/8", &limits).is_ok());
        assert!(validate_topic_name("/2/3/4/5/6/7/8/", &limits).is_err());
        // `#` counts as a level
        assert!(validate_topic_filter("1/2/3/4/5/6/7/#", &limits).is_ok());
        assert!(validate_topic_filter("1/2/3/4/5/6/7/8/#", &limits).is_err());
    }

    #[test]
    fn test_max_length() {
        let limits = TopicLimits {
            max_length: 10,
            ..TopicLimits::unbounded()
        };
        assert!(validate_topic_name(&"a".repeat(10), &limits).is_ok());
        assert!(validate_topic_name(&"a".repeat(11), &limits).is_err());
        // Length is in bytes, not characters
        assert!(validate_topic_name(&"é".repeat(5), &limits).is_ok());
        assert!(validate_topic_name(&"é".repeat(6), &limits).is_err());

        let unbounded = TopicLimits::unbounded();
        assert!(validate_topic_name(&"a".repeat(65535), &unbounded).is_ok());
        assert!(validate_topic_name(&"a".repeat(65536), &unbounded).is_err());
    }

    #[test]
    fn test_system_prefixes() {
        let mut limits = limits();
        assert!(validate_topic_name("$123", &limits).is_err());
        assert!(validate_topic_name("$edge.function/123", &limits).is_err());
        assert!(validate_topic_filter("$SYS/#", &limits).is_err());

        limits.system_prefixes = vec!["$SYS/".to_string()];
        assert!(validate_topic_filter("$SYS/#", &limits).is_ok());
        assert!(validate_topic_name("$SYS/uptime", &limits).is_ok());
        assert!(validate_topic_name("$other", &limits).is_err());
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("test", "test"));
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));
        assert!(!topic_matches_filter("Case/Sensitive", "case/sensitive"));

        assert!(topic_matches_filter("a/b", "a/+"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));
        assert!(!topic_matches_filter("a", "a/+"));
        assert!(topic_matches_filter("a/", "a/+"));
        assert!(topic_matches_filter("a//b", "a/+/b"));

        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "a/#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(!topic_matches_filter("ab", "a/#"));
        assert!(topic_matches_filter("anything/at/all", "#"));

        assert!(!topic_matches_filter("$rule/test", "+/test"));
        assert!(!topic_matches_filter("$rule/test", "#"));
        assert!(topic_matches_filter("$rule/test", "$rule/+"));
        assert!(topic_matches_filter("$rule/test", "$rule/#"));
    }

    mod properties {
        use super::super::*;
        use crate::topic::TopicTrie;
        use proptest::prelude::*;

        fn level() -> impl Strategy<Value = String> {
            prop_oneof![Just(String::new()), "[a-c]{1,2}"]
        }

        fn topic() -> impl Strategy<Value = String> {
            prop::collection::vec(level(), 1..5).prop_map(|l| l.join("/"))
        }

        fn filter() -> impl Strategy<Value = String> {
            (
                prop::collection::vec(prop_oneof![level(), Just("+".to_string())], 1..5),
                any::<bool>(),
            )
                .prop_map(|(mut l, hash)| {
                    if hash {
                        l.push("#".to_string());
                    }
                    l.join("/")
                })
        }

        proptest! {
            #[test]
            fn trie_agrees_with_matcher(topic in topic(), filter in filter()) {
                let mut trie = TopicTrie::new();
                trie.insert(&filter, ());
                let mut hit = false;
                trie.matches(&topic, |_| hit = true);
                prop_assert_eq!(hit, topic_matches_filter(&topic, &filter));
            }

            #[test]
            fn generated_filters_are_valid(filter in filter()) {
                prop_assert!(validate_wildcards(&filter).is_ok());
            }
        }
    }
}
