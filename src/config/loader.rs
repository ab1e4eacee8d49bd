use super::models::Config;
use crate::types::{DispatchError, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref())
        .map_err(|e| DispatchError::Config(format!("Failed to read config file: {}", e)))?;

    let is_json = path.as_ref().extension().and_then(|s| s.to_str()) == Some("json");
    parse_config(&content, is_json)
}

/// Parse configuration text, expanding `${VAR}` references first.
pub fn parse_config(content: &str, is_json: bool) -> Result<Config> {
    let expanded = expand_env_vars(content);

    let config: Config = if is_json {
        serde_json::from_str(&expanded)
            .map_err(|e| DispatchError::Config(format!("Failed to parse JSON config: {}", e)))?
    } else {
        serde_yaml::from_str(&expanded)
            .map_err(|e| DispatchError::Config(format!("Failed to parse YAML config: {}", e)))?
    };

    config
        .validate()
        .map_err(|e| DispatchError::Config(format!("Invalid configuration: {}", e)))?;

    Ok(config)
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Match ${VAR_NAME} or ${VAR_NAME:-default}
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
            .expect("env var pattern is a valid regex")
    })
}

fn expand_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |cap: &regex::Captures| {
            let var_name = &cap[1];
            let default_value = cap.get(3).map(|m| m.as_str());

            std::env::var(var_name)
                .ok()
                .or_else(|| default_value.map(|s| s.to_string()))
                .unwrap_or_else(|| {
                    tracing::warn!(
                        "Environment variable '{}' not found and no default provided",
                        var_name
                    );
                    String::new()
                })
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;

    #[test]
    fn test_expand_env_vars_simple() {
        std::env::set_var("DISPATCH_TEST_VAR", "test_value");
        let input = "key: ${DISPATCH_TEST_VAR}";
        let output = expand_env_vars(input);
        assert_eq!(output, "key: test_value");
        std::env::remove_var("DISPATCH_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        std::env::remove_var("DISPATCH_MISSING_VAR");
        let input = "key: ${DISPATCH_MISSING_VAR:-default_value}";
        let output = expand_env_vars(input);
        assert_eq!(output, "key: default_value");
    }

    #[test]
    fn test_expand_env_vars_multiple() {
        std::env::set_var("DISPATCH_VAR1", "value1");
        std::env::set_var("DISPATCH_VAR2", "value2");
        let input = "key1: ${DISPATCH_VAR1}, key2: ${DISPATCH_VAR2}";
        let output = expand_env_vars(input);
        assert_eq!(output, "key1: value1, key2: value2");
        std::env::remove_var("DISPATCH_VAR1");
        std::env::remove_var("DISPATCH_VAR2");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        std::env::remove_var("DISPATCH_MISSING");
        let input = "key: ${DISPATCH_MISSING}";
        let output = expand_env_vars(input);
        assert_eq!(output, "key: ");
    }

    #[test]
    fn test_parse_yaml_with_defaults() {
        let yaml = r#"
providers:
  - id: primary
    priority: 0
    backend_type: openai
    endpoint: https://api.openai.com/v1/chat/completions
    api_key: ${DISPATCH_PARSE_KEY:-sk-test}
    circuit_breaker:
      failure_threshold: 5
      open_timeout_ms: 60000
  - id: secondary
    priority: 1
    backend_type: anthropic
    endpoint: https://api.anthropic.com/v1/messages
    timeout_ms: 8000
    retry:
      max_attempts: 2
    circuit_breaker:
      failure_threshold: 3
      open_timeout_ms: 30000
    models:
      high: claude-sonnet-4-5
      low: claude-haiku-4-5
"#;
        let config = parse_config(yaml, false).unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.providers[0].timeout_ms, 10_000);
        assert_eq!(config.providers[1].backend_type, BackendType::Anthropic);
        assert_eq!(config.providers[1].retry.max_attempts, 2);
        assert_eq!(config.providers[1].retry.max_backoff_ms, 10_000);
        assert_eq!(config.providers[1].circuit_breaker.failure_threshold, 3);
        assert_eq!(config.rate_limits.dispatch.max_requests, 20);
        assert_eq!(config.rate_limits.admin.max_requests, 10);
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.governor.lat_high_ms, 700);
        assert_eq!(config.offline.replies.len(), 3);
        assert!(config.pricing.contains_key("gpt-4o-mini"));
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "providers": [
                {"id": "local", "backend_type": "ollama", "endpoint": "http://localhost:11434/api/chat"}
            ],
            "cache": {"capacity": 10}
        }"#;
        let config = parse_config(json, true).unwrap();
        assert_eq!(config.providers[0].backend_type, BackendType::Ollama);
        assert_eq!(config.cache.capacity, 10);
    }

    #[test]
    fn test_parse_rejects_invalid() {
        let yaml = "providers: []\n";
        match parse_config(yaml, false) {
            Err(DispatchError::Config(message)) => assert!(message.contains("Invalid")),
            other => panic!("Expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sample_config_loads() {
        let config = load_config(concat!(env!("CARGO_MANIFEST_DIR"), "/config/config.yaml")).unwrap();

        assert_eq!(config.providers.len(), 3);
        let local = &config.providers[2];
        assert_eq!(local.backend_type, BackendType::Ollama);
        if std::env::var("OLLAMA_URL").is_err() {
            assert!(local.endpoint.ends_with("/api/chat"));
        }
        assert!(config.server.dispatch_deadline() < config.server.request_timeout());
    }
}
