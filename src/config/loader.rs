//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::EdgeConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<EdgeConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: EdgeConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_valid_file() {
        let file = write("name = \"edge\"\n[dns]\nenabled = true\n");
        let config = load_config(file.path()).unwrap();
        assert!(config.dns.enabled);
    }

    #[test]
    fn reports_parse_and_validation_errors() {
        let file = write("name = 3");
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));

        let file = write("name = \"\"");
        let err = load_config(file.path()).unwrap_err();
        assert_eq!(err.to_string(), "Validation failed: name: must not be empty");

        let err = load_config(Path::new("/nonexistent/edgy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
