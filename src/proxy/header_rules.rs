//! Custom response headers scoped to path patterns.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Headers applied to responses whose path matches `for`.
///
/// Patterns use `*` for any suffix and `:name` for one path segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    #[serde(rename = "for")]
    pub path: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl HeaderRule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

fn pattern_regex(pattern: &str) -> Option<Regex> {
    let trimmed = pattern.trim_end_matches('/');
    let mut expression = String::from("^");
    for (i, segment) in trimmed.split('/').enumerate() {
        if i > 0 {
            expression.push('/');
        }
        if segment == "*" {
            expression.push_str(".*");
        } else if segment.starts_with(':') {
            expression.push_str("[^/]+");
        } else {
            let escaped: Vec<String> = segment.split('*').map(|part| regex::escape(part)).collect();
            expression.push_str(&escaped.join(".*"));
        }
    }
    expression.push_str("/?$");
    match Regex::new(&expression) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!("Ignoring header rule for {}: {}", pattern, err);
            None
        }
    }
}

/// Compiled header rules.
#[derive(Debug, Clone, Default)]
pub struct HeaderRules {
    rules: Vec<(Regex, BTreeMap<String, String>)>,
}

impl HeaderRules {
    pub fn new(rules: &[HeaderRule]) -> Self {
        Self {
            rules: rules
                .iter()
                .filter_map(|rule| pattern_regex(&rule.path).map(|regex| (regex, rule.values.clone())))
                .collect(),
        }
    }

    /// Headers for `path`; later rules override earlier ones.
    pub fn for_path(&self, path: &str) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        for (regex, values) in &self.rules {
            if regex.is_match(path) {
                for (name, value) in values {
                    headers.insert(name.to_ascii_lowercase(), value.clone());
                }
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns() {
        let rules = HeaderRules::new(&[
            HeaderRule::new("/*").header("X-Frame-Options", "DENY"),
            HeaderRule::new("/blog/:slug").header("Cache-Control", "public"),
            HeaderRule::new("/assets/*.css").header("Cache-Control", "immutable"),
        ]);

        let root = rules.for_path("/");
        assert_eq!(root.get("x-frame-options").map(String::as_str), Some("DENY"));
        assert!(root.get("cache-control").is_none());

        let post = rules.for_path("/blog/hello/");
        assert_eq!(post.get("cache-control").map(String::as_str), Some("public"));
        assert!(rules.for_path("/blog/a/b").get("cache-control").is_none());

        let css = rules.for_path("/assets/site.css");
        assert_eq!(css.get("cache-control").map(String::as_str), Some("immutable"));
    }

    #[test]
    fn test_later_rule_wins() {
        let rules = HeaderRules::new(&[
            HeaderRule::new("/*").header("x-a", "1"),
            HeaderRule::new("/docs/*").header("x-a", "2"),
        ]);
        assert_eq!(rules.for_path("/docs/intro")["x-a"], "2");
        assert_eq!(rules.for_path("/other")["x-a"], "1");
    }
}
