//! `WatchRule.query` validation: the JSON stays schemaless on disk, but
//! nothing malformed gets past `validate_rule_query`.

use crate::error::CoreError;
use crate::store::rules::RuleQuery;

const VALID_SOURCES: &[&str] = &["discogs", "ebay", "mock"];
const MIN_POLL_INTERVAL_SECONDS: i64 = 30;
const MAX_POLL_INTERVAL_SECONDS: i64 = 86_400;

/// Validate and normalize a rule's query in place: lower-cases and dedupes
/// `sources`, trims `keywords`, drops empties. Returns an error describing
/// the first violation found. A rule with empty sources or
/// entirely-whitespace keywords must not be accepted.
pub fn validate_rule_query(query: &mut RuleQuery) -> Result<(), CoreError> {
    query.keywords = query
        .keywords
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if query.keywords.is_empty() {
        return Err(CoreError::Validation(
            "keywords must contain at least one non-empty entry".into(),
        ));
    }

    let mut sources: Vec<String> = Vec::new();
    for raw in &query.sources {
        let lower = raw.trim().to_lowercase();
        if !VALID_SOURCES.contains(&lower.as_str()) {
            return Err(CoreError::Validation(format!("unknown provider source: {raw}")));
        }
        if !sources.contains(&lower) {
            sources.push(lower);
        }
    }
    if sources.is_empty() {
        return Err(CoreError::Validation(
            "sources must contain at least one provider".into(),
        ));
    }
    query.sources = sources;

    if let Some(max_price) = query.max_price {
        if max_price < 0.0 {
            return Err(CoreError::Validation("max_price must be >= 0".into()));
        }
    }

    Ok(())
}

pub fn validate_poll_interval_seconds(seconds: i64) -> Result<(), CoreError> {
    if !(MIN_POLL_INTERVAL_SECONDS..=MAX_POLL_INTERVAL_SECONDS).contains(&seconds) {
        return Err(CoreError::Validation(format!(
            "poll_interval_seconds must be between {MIN_POLL_INTERVAL_SECONDS} and {MAX_POLL_INTERVAL_SECONDS}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(keywords: Vec<&str>, sources: Vec<&str>) -> RuleQuery {
        RuleQuery {
            keywords: keywords.into_iter().map(String::from).collect(),
            sources: sources.into_iter().map(String::from).collect(),
            max_price: None,
            min_condition: None,
            currency: None,
        }
    }

    #[test]
    fn rejects_whitespace_only_keywords() {
        let mut q = query(vec!["", "   "], vec!["discogs"]);
        assert!(validate_rule_query(&mut q).is_err());
    }

    #[test]
    fn rejects_empty_sources() {
        let mut q = query(vec!["primus"], vec![]);
        assert!(validate_rule_query(&mut q).is_err());
    }

    #[test]
    fn rejects_unknown_source() {
        let mut q = query(vec!["primus"], vec!["musicstack"]);
        assert!(validate_rule_query(&mut q).is_err());
    }

    #[test]
    fn normalizes_case_and_dedupes_sources() {
        let mut q = query(vec!["primus", " vinyl "], vec!["Discogs", "DISCOGS", "eBay"]);
        validate_rule_query(&mut q).unwrap();
        assert_eq!(q.keywords, vec!["primus", "vinyl"]);
        assert_eq!(q.sources, vec!["discogs", "ebay"]);
    }

    #[test]
    fn poll_interval_bounds() {
        assert!(validate_poll_interval_seconds(29).is_err());
        assert!(validate_poll_interval_seconds(30).is_ok());
        assert!(validate_poll_interval_seconds(86_400).is_ok());
        assert!(validate_poll_interval_seconds(86_401).is_err());
    }
}
