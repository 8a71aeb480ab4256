//! Configuration management

use std::{env, path::Path};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mtls::MtlsConfig;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Certificate authority configuration
    pub mtls: MtlsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or holds out-of-range values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // PAYMENTS_GATEWAY_MTLS__CERT_PATH=... overrides mtls.cert_path
        figment = figment.merge(Env::prefixed("PAYMENTS_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars()?;
        config.mtls.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in path-like values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("Invalid expansion pattern: {e}")))?;

        self.mtls.cert_path = Self::expand_string(&re, &self.mtls.cert_path);
        self.mtls.san_domain = Self::expand_string(&re, &self.mtls.san_domain);
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.mtls.ca_common_name, "Payments Gateway Agent CA");
        assert!(config.env_files.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/gateway.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "mtls:\n  cert_path: /var/lib/gateway/certs\n  certificate_validity_days: 30\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.mtls.cert_path, "/var/lib/gateway/certs");
        assert_eq!(config.mtls.certificate_validity_days, 30);
        assert_eq!(config.mtls.san_domain, "agents.local");
    }

    #[test]
    fn test_load_rejects_zero_validity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "mtls:\n  certificate_validity_days: 0\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn test_expand_string_with_default() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let out = Config::expand_string(&re, "${PGW_TEST_UNSET_ROOT:-/srv}/certs");
        assert_eq!(out, "/srv/certs");
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "PGW_TEST_CERT_ROOT=/opt/gateway").unwrap();
        drop(f);

        let mut config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            mtls: MtlsConfig {
                cert_path: "${PGW_TEST_CERT_ROOT}/certs".to_string(),
                ..MtlsConfig::default()
            },
        };
        config.load_env_files();
        config.expand_env_vars().unwrap();
        assert_eq!(config.mtls.cert_path, "/opt/gateway/certs");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        // Should not panic
        config.load_env_files();
    }

    #[test]
    fn test_env_files_deserialized_from_yaml() {
        let yaml = r#"
env_files:
  - ~/.payments-gateway/secrets.env
mtls:
  san_domain: agents.example
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.env_files, vec!["~/.payments-gateway/secrets.env"]);
        assert_eq!(config.mtls.san_domain, "agents.example");
    }
}
