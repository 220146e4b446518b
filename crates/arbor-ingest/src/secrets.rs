//! Backend credential resolution.
//!
//! A credential is referenced from config as a [`SecretRef`] and resolved
//! from the first non-empty source in priority order:
//!
//! 1. **Direct value** (`apiKey`), convenient for local runs
//! 2. **File** (`apiKeyFile`), the mounted-secret pattern
//! 3. **Environment variable** (`apiKeyEnvVar`)
//!
//! Resolution happens when a stage is invoked, so a missing key fails that
//! call as a configuration error before any network or database work.

use secrecy::SecretString;

use crate::config::SecretRef;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("no credential source configured for {name}")]
    NoSourceProvided { name: String },

    #[error("failed to read credential file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("environment variable '{name}' is not set")]
    EnvVarNotSet { name: String },

    #[error("environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },

    #[error("credential for {name} resolved to an empty value")]
    Empty { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Resolves `secret` for the credential called `name` (used in errors only).
pub fn resolve_secret(name: &str, secret: &SecretRef) -> Result<SecretString> {
    let value = if let Some(direct) = non_empty(secret.value.as_deref()) {
        direct.trim().to_string()
    } else if let Some(path) = non_empty(secret.file.as_deref()) {
        let expanded = expand_home(path);
        std::fs::read_to_string(&expanded)
            .map_err(|source| SecretError::FileReadError {
                path: expanded,
                source,
            })?
            .trim()
            .to_string()
    } else if let Some(var) = non_empty(secret.env_var.as_deref()) {
        match std::env::var(var) {
            Ok(value) => value.trim().to_string(),
            Err(std::env::VarError::NotPresent) => {
                return Err(SecretError::EnvVarNotSet {
                    name: var.to_string(),
                })
            }
            Err(std::env::VarError::NotUnicode(_)) => {
                return Err(SecretError::EnvVarNotUnicode {
                    name: var.to_string(),
                })
            }
        }
    } else {
        return Err(SecretError::NoSourceProvided {
            name: name.to_string(),
        });
    };

    if value.is_empty() {
        return Err(SecretError::Empty {
            name: name.to_string(),
        });
    }
    Ok(SecretString::from(value))
}

/// Whether at least one source is configured. Used by config validation.
pub fn has_secret_source(secret: &SecretRef) -> bool {
    non_empty(secret.value.as_deref()).is_some()
        || non_empty(secret.file.as_deref()).is_some()
        || non_empty(secret.env_var.as_deref()).is_some()
}

/// Expands a leading `~` to the home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
