use regex::{Regex, RegexBuilder};

use super::types::TableKey;
use crate::{Error, Result};

/// Subscription filter over `schema.table` names.
///
/// The expression is a comma separated list of regular expressions, each
/// matched case-insensitively against the whole `schema.table` string. An
/// empty expression subscribes to everything.
///
/// The expression is split on every comma, so a pattern cannot contain a
/// `{m,n}` repetition; write `{m}` or spell out the alternatives instead.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    patterns: Vec<Regex>,
}

impl SubscriptionFilter {
    pub fn parse(expression: &str) -> Result<Self> {
        let patterns = expression
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                RegexBuilder::new(&format!("^(?:{})$", part))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Config(format!("invalid filter pattern '{}': {}", part, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn matches(&self, key: &TableKey) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let name = key.to_string();
        self.patterns.iter().any(|pattern| pattern.is_match(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commas_always_separate_patterns() {
        // `{1,2}` is cut into `db\.t{1` and `2}`, which is not a valid pattern.
        assert!(matches!(SubscriptionFilter::parse(r"db\.t{1,2}"), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = SubscriptionFilter::parse("").unwrap();
        assert!(filter.matches(&TableKey::new("any", "thing")));
    }

    #[test]
    fn test_schema_wildcard() {
        let filter = SubscriptionFilter::parse(r"shop\..*").unwrap();
        assert!(filter.matches(&TableKey::new("shop", "orders")));
        assert!(!filter.matches(&TableKey::new("crm", "orders")));
    }

    #[test]
    fn test_list_of_tables_full_match() {
        let filter = SubscriptionFilter::parse(r"db\.users, db\.orders").unwrap();
        assert!(filter.matches(&TableKey::new("db", "users")));
        assert!(filter.matches(&TableKey::new("DB", "Orders")));
        assert!(!filter.matches(&TableKey::new("db", "users_archive")));
    }

    #[test]
    fn test_invalid_pattern_is_a_config_error() {
        let result = SubscriptionFilter::parse("db\\.(users");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
