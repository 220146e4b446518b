use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let stages = &config.stages;
    if !(0.0..=1.0).contains(&stages.min_confidence) {
        return Err(ConfigError::Validation {
            message: format!("stages.minConfidence must be within [0, 1], got {}", stages.min_confidence),
        });
    }

    for (name, backend) in [
        ("ocr", &config.backends.ocr),
        ("translation", &config.backends.translation),
        ("extraction", &config.backends.extraction),
    ] {
        if backend.model.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("backends.{}.model may not be empty", name),
            });
        }
        if !backend.base_url.starts_with("http://") && !backend.base_url.starts_with("https://") {
            return Err(ConfigError::Validation {
                message: format!("backends.{}.baseUrl must be an http(s) URL", name),
            });
        }
    }

    if config.retry.probe_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.probeAttempts must be at least 1".to_string(),
        });
    }

    if config.queue.max_batch_pages < 1 {
        return Err(ConfigError::Validation {
            message: "queue.maxBatchPages must be at least 1".to_string(),
        });
    }

    if config.worker.concurrency == 0 {
        return Err(ConfigError::Validation {
            message: "worker.concurrency must be at least 1".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffKind, LogFormat};

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();
        assert_eq!(config.stages.min_translation_chars, 50);
        assert_eq!(config.stages.min_confidence, 0.5);
        assert_eq!(config.stages.max_candidates, 3);
        assert_eq!(config.retry.probe_attempts, 3);
        assert_eq!(config.retry.backoff, BackoffKind::Fixed);
        assert_eq!(config.backends.ocr.timeout_secs, 120);
        assert_eq!(
            config.backends.ocr.credentials.env_var.as_deref(),
            Some("OPENAI_API_KEY")
        );
        assert!(config.worker.concurrency >= 1);
        assert_eq!(config.queue.max_batch_pages, 2000);
    }

    #[test]
    fn test_full_config() {
        let config = load_config_from_str(
            r#"{
                "version": "1.0",
                "databasePath": "/var/lib/arbor/ingest.db",
                "server": { "listenAddr": "0.0.0.0:9000", "allowedOrigins": ["https://admin.example"] },
                "storage": { "root": "/srv/objects", "publicBaseUrl": "https://cdn.example/kb" },
                "backends": {
                    "ocr": { "model": "gpt-4o", "apiKeyFile": "/run/secrets/ocr", "timeoutSecs": 90 },
                    "translation": { "baseUrl": "http://localhost:11434/v1", "model": "llama3" }
                },
                "retry": { "probeAttempts": 5, "probeBackoffMs": 0, "backoff": "exponential" },
                "stages": { "minConfidence": 0.6 },
                "queue": { "maxBatchPages": 400 },
                "worker": { "enabled": false, "concurrency": 2 },
                "logging": { "level": "debug", "format": "json" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.backends.ocr.credentials.file.as_deref(), Some("/run/secrets/ocr"));
        assert_eq!(config.backends.ocr.credentials.env_var, None);
        assert_eq!(config.backends.translation.model, "llama3");
        assert_eq!(config.retry.backoff, BackoffKind::Exponential);
        assert_eq!(config.queue.max_batch_pages, 400);
        assert!(!config.worker.enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_key_rejected_by_schema() {
        let err = load_config_from_str(r#"{ "version": "1.0", "workers": 4 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_out_of_range_confidence_rejected() {
        let err =
            load_config_from_str(r#"{ "version": "1.0", "stages": { "minConfidence": 1.5 } }"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::SchemaValidation { .. }));
    }

    #[test]
    fn test_unsupported_version() {
        let err = load_config_from_str(r#"{ "version": "2.0" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_non_http_backend_rejected() {
        let err = load_config_from_str(
            r#"{ "version": "1.0", "backends": { "ocr": { "baseUrl": "ftp://x" } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbor-ingest.json");
        std::fs::write(&path, r#"{ "version": "1.0" }"#).unwrap();
        assert!(load_config(&path).is_ok());
        assert!(matches!(
            load_config(dir.path().join("missing.json")),
            Err(ConfigError::ReadFile { .. })
        ));
    }
}
