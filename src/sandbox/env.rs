//! Child-process environment redaction
//!
//! The only credential-leak defense on the subprocess path; the container
//! path additionally benefits from filesystem isolation.

use std::collections::HashMap;

use crate::config::EnvFilterConfig;

/// Build a redacted environment for a child process from the current
/// process environment.
pub fn filtered_environment(config: &EnvFilterConfig) -> HashMap<String, String> {
    filter_vars(std::env::vars(), config)
}

/// Filter an arbitrary variable set: drop exact-match protected names and
/// any name containing a protected substring (case-insensitive).
/// Operational variables (`PATH`, `HOME`, shell vars) pass through because
/// they match no rule.
pub fn filter_vars(
    vars: impl IntoIterator<Item = (String, String)>,
    config: &EnvFilterConfig,
) -> HashMap<String, String> {
    vars.into_iter()
        .filter(|(name, _)| {
            if config.protected_keys.iter().any(|key| key == name) {
                return false;
            }
            let upper = name.to_uppercase();
            !config
                .protected_substrings
                .iter()
                .any(|sub| upper.contains(&sub.to_uppercase()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_strips_exact_protected_keys() {
        let config = EnvFilterConfig::default();
        let filtered = filter_vars(
            vars(&[("ANTHROPIC_API_KEY", "sk-123"), ("LANG", "en_US.UTF-8")]),
            &config,
        );
        assert!(!filtered.contains_key("ANTHROPIC_API_KEY"));
        assert!(filtered.contains_key("LANG"));
    }

    #[test]
    fn test_strips_substring_matches_case_insensitively() {
        let config = EnvFilterConfig::default();
        let filtered = filter_vars(
            vars(&[
                ("AWS_SECRET_ACCESS_KEY", "x"),
                ("github_token", "x"),
                ("DbPassword", "x"),
                ("MY_CREDENTIALS_FILE", "x"),
                ("EDITOR", "vi"),
            ]),
            &config,
        );
        assert!(!filtered.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!filtered.contains_key("github_token"));
        assert!(!filtered.contains_key("DbPassword"));
        assert!(!filtered.contains_key("MY_CREDENTIALS_FILE"));
        assert!(filtered.contains_key("EDITOR"));
    }

    #[test]
    fn test_preserves_operational_vars() {
        let config = EnvFilterConfig::default();
        let filtered = filter_vars(
            vars(&[
                ("PATH", "/usr/bin:/bin"),
                ("HOME", "/home/op"),
                ("SHELL", "/bin/bash"),
                ("TERM", "xterm-256color"),
            ]),
            &config,
        );
        assert_eq!(filtered.len(), 4);
        assert_eq!(filtered.get("PATH").map(|s| s.as_str()), Some("/usr/bin:/bin"));
    }
}
