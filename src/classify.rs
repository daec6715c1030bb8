use regex::Regex;

use crate::model::RateLimitRule;

/// Derives the stable `"METHOD /path"` key used for API-level rate limits.
///
/// Upper-cases the method, strips the query string, and strips a trailing
/// slash (preserving `/` for the root path).
pub fn identify(method: &str, path: &str) -> String {
    let clean_path = path.split('?').next().unwrap_or("");
    let clean_path = clean_path.strip_suffix('/').unwrap_or(clean_path);
    let clean_path = if clean_path.is_empty() { "/" } else { clean_path };
    format!("{} {}", method.to_uppercase(), clean_path)
}

/// One `{pattern, rule}` entry in the ordered pattern list. `{name}` matches a
/// single path segment; `*` matches any suffix including slashes.
#[derive(Debug, Clone)]
pub struct ApiPattern {
    pub pattern: String,
    pub method: Option<String>,
    pub rule: RateLimitRule,
    regex: Regex,
}

impl ApiPattern {
    pub fn new(pattern: &str, method: Option<String>, rule: RateLimitRule) -> Self {
        Self {
            pattern: pattern.to_string(),
            method,
            rule,
            regex: compile_pattern(pattern),
        }
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        self.regex.is_match(path)
    }
}

fn compile_pattern(pattern: &str) -> Regex {
    // `{name}` -> one path segment, `*` -> any suffix, everything else literal.
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                while let Some(&n) = chars.peek() {
                    chars.next();
                    if n == '}' {
                        break;
                    }
                }
                out.push_str("[^/]+");
            }
            '*' => out.push_str(".*"),
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).expect("pattern compiles to a valid regex")
}

/// Splits an `apiIdentifier` of the form `"METHOD /path"` back into its parts.
pub fn split_api_identifier(api_id: &str) -> (&str, &str) {
    api_id.split_once(' ').unwrap_or((api_id, "/"))
}

/// Resolves the rate-limit rule to apply for a given `apiIdentifier`/path pair:
/// exact map entries win unconditionally; otherwise the first matching pattern
/// in declared order.
pub fn resolve_api_rule<'a>(
    method: &str,
    path: &str,
    exact: &'a std::collections::HashMap<String, RateLimitRule>,
    api_identifier: &str,
    patterns: &'a [ApiPattern],
) -> Option<&'a RateLimitRule> {
    if let Some(rule) = exact.get(api_identifier) {
        return Some(rule);
    }
    patterns
        .iter()
        .find(|p| p.matches(method, path))
        .map(|p| &p.rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn identify_upper_cases_strips_query_and_trailing_slash() {
        assert_eq!(identify("get", "/v1/models?x=1"), "GET /v1/models");
        assert_eq!(identify("post", "/v1/chat/"), "POST /v1/chat");
        assert_eq!(identify("get", "/"), "GET /");
        assert_eq!(identify("get", ""), "GET /");
    }

    #[test]
    fn identify_is_idempotent_on_an_already_clean_path() {
        let once = identify("GET", "/v1/models/");
        let twice = identify("GET", &once.split_once(' ').unwrap().1.to_string());
        assert_eq!(once, twice);
    }

    #[test]
    fn exact_map_wins_over_patterns() {
        let mut exact = HashMap::new();
        exact.insert("GET /v1/models".to_string(), RateLimitRule::new(Some(1), None, None));
        let patterns = vec![ApiPattern::new(
            "/v1/*",
            None,
            RateLimitRule::new(Some(99), None, None),
        )];
        let rule = resolve_api_rule("GET", "/v1/models", &exact, "GET /v1/models", &patterns).unwrap();
        assert_eq!(rule.max_concurrent, Some(1));
    }

    #[test]
    fn first_matching_pattern_wins() {
        let exact = HashMap::new();
        let patterns = vec![
            ApiPattern::new("/v1/models/{id}", None, RateLimitRule::new(Some(1), None, None)),
            ApiPattern::new("/v1/*", None, RateLimitRule::new(Some(2), None, None)),
        ];
        let rule = resolve_api_rule(
            "GET",
            "/v1/models/abc",
            &exact,
            "GET /v1/models/abc",
            &patterns,
        )
        .unwrap();
        assert_eq!(rule.max_concurrent, Some(1));
    }

    #[test]
    fn pattern_method_mismatch_skips() {
        let exact = HashMap::new();
        let patterns = vec![ApiPattern::new(
            "/v1/*",
            Some("POST".to_string()),
            RateLimitRule::new(Some(1), None, None),
        )];
        assert!(resolve_api_rule("GET", "/v1/models", &exact, "GET /v1/models", &patterns).is_none());
    }
}
