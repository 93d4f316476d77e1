use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::utils;

pub const CONF_DIR: &str = "cimon";
pub const CONF_FILENAME: &str = "cimon.toml";

/// Configuration file structure for `cimon`.
///
/// The file lists provider instances under `[providers]`; each entry may
/// carry credentials and a request-rate limit:
///
/// ```toml
/// [[providers.gitlab]]
/// url = "https://gitlab.com"
/// token_from_process = "pass show gitlab-api-token"
/// max_requests_per_second = 5
///
/// [[providers.github]]
/// token = "ghp_..."
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub providers: ProvidersConfiguration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfiguration {
    #[serde(default)]
    pub github: Vec<ProviderConfiguration>,
    #[serde(default)]
    pub gitlab: Vec<ProviderConfiguration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfiguration {
    pub name: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
    pub token_from_process: Option<String>,
    pub max_requests_per_second: Option<f64>,
}

impl Configuration {
    /// Candidate configuration file locations, in precedence order.
    pub fn default_paths() -> Vec<PathBuf> {
        utils::xdg_config_locations(&format!("{CONF_DIR}/{CONF_FILENAME}"))
    }

    /// Load the configuration from the first existing path.
    ///
    /// Returns the parsed configuration and whether a file was found; when
    /// none exists the default provider set (one GitHub and one GitLab
    /// instance, no credentials) is returned so that the dashboard still
    /// works against public repositories.
    pub fn from_paths(paths: &[PathBuf]) -> Result<(Configuration, bool)> {
        for path in paths {
            let contents = match std::fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Error::Io(err)),
            };
            let config = Self::parse(&contents, path)?;
            return Ok((config, true));
        }

        Ok((Configuration::default_providers(), false))
    }

    fn parse(contents: &str, path: &Path) -> Result<Configuration> {
        toml::from_str(contents)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }

    fn default_providers() -> Configuration {
        Configuration {
            providers: ProvidersConfiguration {
                github: vec![ProviderConfiguration::default()],
                gitlab: vec![ProviderConfiguration::default()],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_providers() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[providers.gitlab]]
name = "work"
url = "https://gitlab.example.com"
token = "glpat-test-token"
max_requests_per_second = 5.0

[[providers.gitlab]]

[[providers.github]]
token_from_process = "echo token"
"#
        )
        .unwrap();

        let (config, found) =
            Configuration::from_paths(&[file.path().to_path_buf()]).unwrap();
        assert!(found);
        assert_eq!(config.providers.gitlab.len(), 2);
        assert_eq!(config.providers.github.len(), 1);

        let work = &config.providers.gitlab[0];
        assert_eq!(work.name.as_deref(), Some("work"));
        assert_eq!(work.url.as_deref(), Some("https://gitlab.example.com"));
        assert_eq!(work.token.as_deref(), Some("glpat-test-token"));
        assert_eq!(work.max_requests_per_second, Some(5.0));

        assert_eq!(
            config.providers.github[0].token_from_process.as_deref(),
            Some("echo token")
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let (config, found) =
            Configuration::from_paths(&[PathBuf::from("/does/not/exist/cimon.toml")]).unwrap();
        assert!(!found);
        assert_eq!(config.providers.github.len(), 1);
        assert_eq!(config.providers.gitlab.len(), 1);
        assert!(config.providers.gitlab[0].token.is_none());
    }

    #[test]
    fn test_malformed_file_is_a_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "providers = 42").unwrap();

        let result = Configuration::from_paths(&[file.path().to_path_buf()]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_later_paths_are_fallbacks() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[[providers.gitlab]]\nname = \"fallback\"").unwrap();

        let paths = vec![
            PathBuf::from("/does/not/exist/cimon.toml"),
            file.path().to_path_buf(),
        ];
        let (config, found) = Configuration::from_paths(&paths).unwrap();
        assert!(found);
        assert_eq!(config.providers.gitlab[0].name.as_deref(), Some("fallback"));
    }
}
