//! Configuration sources used at startup and on reload

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::env::{EnvLookup, ProcessEnv};
use crate::model::RouterConfig;
use crate::{ConfigError, Result};

/// Something that can (re)produce a complete, validated [`RouterConfig`]
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<RouterConfig>;

    /// Human readable origin, used in logs
    fn describe(&self) -> String;
}

/// TOML file on disk, with environment-variable overrides applied
pub struct TomlFileSource {
    path: PathBuf,
    env: Arc<dyn EnvLookup>,
}

impl TomlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_env(path, Arc::new(ProcessEnv))
    }

    pub fn with_env(path: impl Into<PathBuf>, env: Arc<dyn EnvLookup>) -> Self {
        Self { path: path.into(), env }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for TomlFileSource {
    fn load(&self) -> Result<RouterConfig> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut config = RouterConfig::from_toml_str(&raw)?;
        config.apply_env(self.env.as_ref());
        config.validate()?;

        info!(
            path = %self.path.display(),
            environment = %config.environment,
            endpoints = config.endpoints.len(),
            "Loaded router configuration"
        );
        Ok(config)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// In-memory configuration, returned as-is
#[derive(Debug, Clone)]
pub struct StaticSource(RouterConfig);

impl StaticSource {
    pub fn new(config: RouterConfig) -> Self {
        Self(config)
    }
}

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<RouterConfig> {
        self.0.validate()?;
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use std::io::Write;

    #[test]
    fn test_load_from_file_with_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[endpoints.scrape]
url = "http://scraper.internal/run"
"#
        )
        .unwrap();

        let env = MapEnv::new()
            .with("CR_ENVIRONMENT", "production")
            .with("CR_ENDPOINT_SCRAPE_MAX_RETRIES", "1");
        let source = TomlFileSource::with_env(file.path(), Arc::new(env));
        let config = source.load().unwrap();

        assert_eq!(config.environment, "production");
        assert_eq!(config.effective_overrides()["scrape"].max_retries, Some(1));
        assert!(source.describe().starts_with("file:"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let source = TomlFileSource::with_env("/definitely/not/here.toml", Arc::new(MapEnv::new()));
        assert!(matches!(source.load(), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router\nmax_concurrent_requests = ").unwrap();
        let source = TomlFileSource::with_env(file.path(), Arc::new(MapEnv::new()));
        assert!(matches!(source.load(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_static_source_validates() {
        let mut config = RouterConfig::default();
        assert!(StaticSource::new(config.clone()).load().is_ok());
        config.router.max_concurrent_requests = 0;
        assert!(StaticSource::new(config).load().is_err());
    }
}
