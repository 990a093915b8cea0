use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::db::DEFAULT_DB_PATH;
use crate::llm::factory::FactoryOptions;
use crate::llm::gemini::DEFAULT_GEMINI_BASE;
use crate::vault::{CredentialVault, VaultError, ENCRYPTION_KEY_ENV};

pub const DB_PATH_ENV: &str = "DIAGRAMHUB_DB_PATH";
pub const GEMINI_BASE_ENV: &str = "GEMINI_API_BASE";
pub const REQUEST_TIMEOUT_ENV: &str = "AI_REQUEST_TIMEOUT_SECS";
pub const CORS_ORIGINS_ENV: &str = "BACKEND_CORS_ORIGINS";

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CORS_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost:5173"];

/**
 * \brief 进程级配置，来自环境变量，CLI 参数可逐项覆盖。
 */
#[derive(Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub encryption_key: Option<String>,
    pub gemini_base_url: String,
    pub request_timeout: Duration,
    pub cors_origins: Vec<String>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_path", &self.database_path)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("gemini_base_url", &self.gemini_base_url)
            .field("request_timeout", &self.request_timeout)
            .field("cors_origins", &self.cors_origins)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            encryption_key: None,
            gemini_base_url: DEFAULT_GEMINI_BASE.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /**
     * \brief 通过任意查找函数构造，空值视为未设置。
     */
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let request_timeout = match get(REQUEST_TIMEOUT_ENV) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!(value = %raw, "invalid {}, using default", REQUEST_TIMEOUT_ENV);
                    defaults.request_timeout
                }
            },
            None => defaults.request_timeout,
        };

        Self {
            database_path: get(DB_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            encryption_key: get(ENCRYPTION_KEY_ENV),
            gemini_base_url: get(GEMINI_BASE_ENV).unwrap_or(defaults.gemini_base_url),
            request_timeout,
            cors_origins: get(CORS_ORIGINS_ENV)
                .map(|raw| parse_origins(&raw))
                .unwrap_or(defaults.cors_origins),
        }
    }

    pub fn vault(&self) -> Result<CredentialVault, VaultError> {
        match &self.encryption_key {
            Some(material) => CredentialVault::from_key_material(material),
            None => Err(VaultError::MissingKey),
        }
    }

    pub fn factory_options(&self) -> FactoryOptions {
        FactoryOptions {
            gemini_base_url: self.gemini_base_url.clone(),
            request_timeout: self.request_timeout,
            ..FactoryOptions::default()
        }
    }
}

/** \brief 逗号分隔的来源列表，兼容 JSON 数组写法。 */
fn parse_origins(raw: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
        return list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
