//! Configuration loading helpers
//!
//! Stage and database settings are plain `serde` structs; these helpers read them
//! from TOML files and apply environment variable overrides.

use crate::error::{CommonError, Result};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;

/// Deserialize a TOML file into `T`
pub fn read_toml_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|source| CommonError::Toml {
        path: path.display().to_string(),
        source,
    })
}

/// Read and parse an environment variable.
///
/// Returns `Ok(None)` when the variable is unset and an error when it is set but
/// cannot be parsed, so a typo in the environment never silently falls back to a
/// default.
pub fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CommonError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Read an environment variable, falling back to `default` when unset
pub fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(env_parse(key)?.unwrap_or(default))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        size: usize,
    }

    #[test]
    fn test_read_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"events\"\nsize = 3").unwrap();

        let sample: Sample = read_toml_file(file.path()).unwrap();
        assert_eq!(sample.name, "events");
        assert_eq!(sample.size, 3);
    }

    #[test]
    fn test_read_toml_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = ").unwrap();

        let err = read_toml_file::<Sample>(file.path()).unwrap_err();
        assert!(matches!(err, CommonError::Toml { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_env_parse() {
        std::env::set_var("PGSTAGE_TEST_ENV_PARSE", "42");
        assert_eq!(env_parse::<u32>("PGSTAGE_TEST_ENV_PARSE").unwrap(), Some(42));

        std::env::set_var("PGSTAGE_TEST_ENV_PARSE", "forty-two");
        assert!(env_parse::<u32>("PGSTAGE_TEST_ENV_PARSE").is_err());

        std::env::remove_var("PGSTAGE_TEST_ENV_PARSE");
        assert_eq!(env_parse::<u32>("PGSTAGE_TEST_ENV_PARSE").unwrap(), None);
        assert_eq!(env_or("PGSTAGE_TEST_ENV_PARSE", 7u32).unwrap(), 7);
    }
}
