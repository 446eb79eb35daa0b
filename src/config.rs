use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{DataStore, PostgresConfig, PostgresStore, SqliteStore, DEFAULT_BUSY_TIMEOUT};
use crate::guard::{GuardPolicy, DEFAULT_MAX_ROWS};
use crate::llm::ModelProvider;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub guard: GuardConfig,
    pub store: StoreConfig,
    pub model: ModelConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub max_rows: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Postgres,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Sqlite => write!(f, "sqlite"),
            StoreKind::Postgres => write!(f, "postgres"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreKind::Sqlite),
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            other => Err(format!("unknown store kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub sqlite: SqliteConfig,
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    pub busy_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("olist.db"),
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Inferred from the model name and API key when unset.
    pub provider: Option<ModelProvider>,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: None,
            name: String::from("gemini-1.5-flash"),
            api_key: None,
            timeout_secs: 60,
            temperature: 0.1,
        }
    }
}

impl ModelConfig {
    pub fn resolved_provider(&self) -> ModelProvider {
        self.provider
            .unwrap_or_else(|| ModelProvider::infer(&self.name, self.api_key.as_deref()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub timeout_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { timeout_secs: 20 }
    }
}

impl QueryConfig {
    /// `None` when disabled with 0.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("askql").join("config.toml"))
    }

    /// Defaults, then the config file, then environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply environment overrides through `lookup`, so tests can supply
    /// their own environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("DB_PATH") {
            self.store.sqlite.path = PathBuf::from(path);
        }
        if let Some(name) = get("MODEL_NAME") {
            self.model.name = name;
        }
        if let Some(provider) = get("MODEL_PROVIDER") {
            self.model.provider = Some(provider.parse().map_err(anyhow::Error::msg)?);
        }
        if let Some(key) = get("GEMINI_API_KEY").or_else(|| get("OPENROUTER_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Some(rows) = get("MAX_ROWS") {
            self.guard.max_rows = rows
                .trim()
                .parse()
                .with_context(|| format!("MAX_ROWS must be a positive integer, got '{}'", rows))?;
        }
        if let Some(secs) = get("SQL_QUERY_TIMEOUT") {
            self.query.timeout_secs = secs.trim().parse().with_context(|| {
                format!("SQL_QUERY_TIMEOUT must be a number of seconds, got '{}'", secs)
            })?;
        }
        if let Some(password) = get("PGPASSWORD") {
            self.store.postgres.password = password;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.policy()?;
        Ok(())
    }

    pub fn policy(&self) -> Result<GuardPolicy> {
        GuardPolicy::new(self.guard.max_rows)
    }

    pub fn data_store(&self) -> Arc<dyn DataStore> {
        let store: Arc<dyn DataStore> = match self.store.kind {
            StoreKind::Sqlite => Arc::new(
                SqliteStore::new(&self.store.sqlite.path)
                    .with_busy_timeout(Duration::from_secs(self.store.sqlite.busy_timeout_secs)),
            ),
            StoreKind::Postgres => Arc::new(PostgresStore::new(self.store.postgres.clone())),
        };
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.guard.max_rows, 500);
        assert_eq!(config.store.kind, StoreKind::Sqlite);
        assert_eq!(config.store.sqlite.path, PathBuf::from("olist.db"));
        assert_eq!(config.model.name, "gemini-1.5-flash");
        assert_eq!(config.query.timeout(), Some(Duration::from_secs(20)));
        assert_eq!(config.model.resolved_provider(), ModelProvider::Offline);
    }

    #[test]
    fn test_partial_file() {
        let config: AppConfig = toml::from_str(
            r#"
            [guard]
            max_rows = 50

            [store]
            kind = "postgres"

            [store.postgres]
            host = "db.internal"
            ssl_mode = "require"
            "#,
        )
        .unwrap();
        assert_eq!(config.guard.max_rows, 50);
        assert_eq!(config.store.kind, StoreKind::Postgres);
        assert_eq!(config.store.postgres.host, "db.internal");
        assert_eq!(config.store.postgres.port, 5432);
        assert_eq!(config.model.timeout_secs, 60);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("DB_PATH", "/data/olist.db"),
                ("MODEL_NAME", "mistralai/mixtral-8x7b"),
                ("OPENROUTER_API_KEY", "or-key"),
                ("MAX_ROWS", "100"),
                ("SQL_QUERY_TIMEOUT", "5"),
            ]))
            .unwrap();
        assert_eq!(config.store.sqlite.path, PathBuf::from("/data/olist.db"));
        assert_eq!(config.guard.max_rows, 100);
        assert_eq!(config.query.timeout_secs, 5);
        assert_eq!(config.model.resolved_provider(), ModelProvider::OpenRouter);
    }

    #[test]
    fn test_gemini_key_preferred() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[("GEMINI_API_KEY", "g"), ("OPENROUTER_API_KEY", "o")]))
            .unwrap();
        assert_eq!(config.model.api_key.as_deref(), Some("g"));
        assert_eq!(config.model.resolved_provider(), ModelProvider::Gemini);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let mut config = AppConfig::default();
        assert!(config.apply_env(env(&[("MAX_ROWS", "lots")])).is_err());
        let mut config = AppConfig::default();
        assert!(config.apply_env(env(&[("MODEL_PROVIDER", "bard")])).is_err());
        let mut config = AppConfig::default();
        config.apply_env(env(&[("MAX_ROWS", "0")])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = AppConfig::default();
        config.model.api_key = Some("secret".into());
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[query]\ntimeout_secs = 0\n").unwrap();
        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.query.timeout(), None);
        assert!(AppConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
