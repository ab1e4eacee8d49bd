use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;

use crate::config::HeaderConfig;
use crate::types::{DispatchError, Result};

/// Apply a provider's header rules on top of `base`.
///
/// `drop` runs first, then `add` (only where absent), then `force`.
pub fn apply_header_rules(base: HeaderMap, config: &HeaderConfig) -> Result<HeaderMap> {
    let mut headers = base;

    for header_name in &config.drop {
        headers.remove(&parse_name(header_name)?);
    }

    for (key, value) in &config.add {
        let name = parse_name(key)?;
        if !headers.contains_key(&name) {
            headers.insert(name, parse_value(key, value)?);
        }
    }

    for (key, value) in &config.force {
        headers.insert(parse_name(key)?, parse_value(key, value)?);
    }

    Ok(headers)
}

fn parse_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_str(name)
        .map_err(|e| DispatchError::Header(format!("Invalid header name '{}': {}", name, e)))
}

fn parse_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DispatchError::Header(format!("Invalid header value for '{}': {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        headers.insert("user-agent", "llm-dispatch".parse().unwrap());
        headers
    }

    #[test]
    fn test_no_rules_no_changes() {
        let result = apply_header_rules(base_headers(), &HeaderConfig::default()).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.get("authorization").unwrap(), "Bearer secret");
    }

    #[test]
    fn test_drop_headers() {
        let config = HeaderConfig {
            drop: vec!["authorization".to_string(), "user-agent".to_string()],
            ..HeaderConfig::default()
        };
        let result = apply_header_rules(base_headers(), &config).unwrap();

        assert_eq!(result.len(), 1);
        assert!(result.get("authorization").is_none());
    }

    #[test]
    fn test_add_does_not_override() {
        let mut add = HashMap::new();
        add.insert("x-org".to_string(), "acme".to_string());
        add.insert("content-type".to_string(), "text/plain".to_string());
        let config = HeaderConfig {
            add,
            ..HeaderConfig::default()
        };
        let result = apply_header_rules(base_headers(), &config).unwrap();

        assert_eq!(result.len(), 4);
        assert_eq!(result.get("content-type").unwrap(), "application/json");
        assert_eq!(result.get("x-org").unwrap(), "acme");
    }

    #[test]
    fn test_force_overrides() {
        let mut force = HashMap::new();
        force.insert("user-agent".to_string(), "custom".to_string());
        let config = HeaderConfig {
            force,
            drop: vec!["authorization".to_string()],
            ..HeaderConfig::default()
        };
        let result = apply_header_rules(base_headers(), &config).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.get("user-agent").unwrap(), "custom");
    }

    #[test]
    fn test_invalid_header_name() {
        let config = HeaderConfig {
            drop: vec!["bad header".to_string()],
            ..HeaderConfig::default()
        };
        let err = apply_header_rules(HeaderMap::new(), &config).unwrap_err();
        assert!(matches!(err, DispatchError::Header(_)));
    }
}
