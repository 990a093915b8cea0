use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/** \brief Provider 参数表（temperature、top_p、max_output_tokens 等）。 */
pub type ParameterMap = BTreeMap<String, Value>;

/** \brief 新建配置时使用的默认模型。 */
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-lite";

/** \brief 新建/更新/测试时 API Key 的最小长度。 */
pub const MIN_API_KEY_LEN: usize = 10;

/**
 * \brief AI Provider 类型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    Claude,
    DeepSeek,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::DeepSeek => "deepseek",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "openai" => Ok(ProviderKind::OpenAi),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/**
 * \brief 生成内容的目标语言，默认西班牙语。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Es => "es",
            Language::En => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "es" => Ok(Language::Es),
            "en" => Ok(Language::En),
            other => Err(format!("unsupported language: {}", other)),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_diagram_type() -> String {
    "mermaid".to_string()
}

/**
 * \brief 单个用户对单个 Provider 的配置（持久化形态，API Key 为密文）。
 */
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /** \brief 稳定标识，旧文档缺失时在读取时补齐 */
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub provider: ProviderKind,
    /** \brief Vault 加密后的密文 */
    #[serde(rename = "api_key")]
    pub encrypted_api_key: String,
    pub model: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub parameters: ParameterMap,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("is_active", &self.is_active)
            .field("is_default", &self.is_default)
            .field("parameters", &self.parameters)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/**
 * \brief 用户 AI 设置聚合根，整体读写。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAiSettings {
    pub user_id: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub auto_generate_on_save: bool,
    #[serde(default)]
    pub default_provider: Option<ProviderKind>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UserAiSettings {
    pub fn new(user_id: &str, now: OffsetDateTime) -> Self {
        Self {
            user_id: user_id.to_string(),
            providers: Vec::new(),
            auto_generate_on_save: false,
            default_provider: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn position_of(&self, id: Uuid) -> Option<usize> {
        self.providers.iter().position(|p| p.id == id)
    }

    pub fn default_entry(&self) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.is_default)
    }

    pub fn has_active_provider(&self) -> bool {
        self.providers.iter().any(|p| p.is_active)
    }

    /**
     * \brief 将指定下标设为唯一默认项，并同步冗余的 default_provider 字段。
     */
    pub fn make_default(&mut self, index: usize) {
        for (i, p) in self.providers.iter_mut().enumerate() {
            p.is_default = i == index;
        }
        self.default_provider = self.providers.get(index).map(|p| p.provider);
    }
}

/**
 * \brief Provider 定位方式：稳定 ID，或兼容旧接口的列表下标。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRef {
    Index(usize),
    Id(Uuid),
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderRef::Index(i) => write!(f, "at index {}", i),
            ProviderRef::Id(id) => write!(f, "{}", id),
        }
    }
}

/**
 * \brief 新增 Provider 的请求体（明文 Key，仅在内存中短暂存在）。
 */
#[derive(Clone, Deserialize)]
pub struct NewProvider {
    pub provider: ProviderKind,
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub parameters: ParameterMap,
    #[serde(default)]
    pub is_default: bool,
}

impl NewProvider {
    pub fn new(provider: ProviderKind, api_key: &str, model: &str) -> Self {
        Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            display_name: None,
            parameters: ParameterMap::new(),
            is_default: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_api_key_len(&self.api_key)?;
        if self.model.trim().is_empty() {
            return Err("model must not be empty".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for NewProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewProvider")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("display_name", &self.display_name)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/**
 * \brief 部分更新：未提供的字段保持原值；仅在提供新 Key 时重新加密。
 */
#[derive(Clone, Default, Deserialize)]
pub struct ProviderUpdate {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub parameters: Option<ParameterMap>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub is_default: Option<bool>,
}

impl ProviderUpdate {
    /** \brief 空字符串视为未提供新 Key。 */
    pub fn new_api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(key) = self.new_api_key() {
            validate_api_key_len(key)?;
        }
        if matches!(self.model.as_deref(), Some(m) if m.trim().is_empty()) {
            return Err("model must not be empty".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderUpdate")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("display_name", &self.display_name)
            .field("parameters", &self.parameters)
            .field("is_active", &self.is_active)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/**
 * \brief 解密后的 Provider 配置，只在构造客户端的调用链中流转。
 */
#[derive(Clone)]
pub struct DecryptedProvider {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub parameters: ParameterMap,
    pub display_name: Option<String>,
    pub is_default: bool,
}

impl DecryptedProvider {
    pub fn from_config(config: &ProviderConfig, api_key: String) -> Self {
        Self {
            id: config.id,
            provider: config.provider,
            api_key,
            model: config.model.clone(),
            parameters: config.parameters.clone(),
            display_name: config.display_name.clone(),
            is_default: config.is_default,
        }
    }
}

impl fmt::Debug for DecryptedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedProvider")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/**
 * \brief 对外展示的 Provider（Key 已脱敏）。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ProviderView {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub is_active: bool,
    pub is_default: bool,
    pub parameters: ParameterMap,
    pub display_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/**
 * \brief 对外展示的用户设置。
 */
#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub user_id: String,
    pub providers: Vec<ProviderView>,
    pub auto_generate_on_save: bool,
    pub default_provider: Option<ProviderKind>,
    pub has_active_provider: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateDescriptionRequest {
    pub diagram_code: String,
    pub diagram_type: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub language: Language,
}

impl GenerateDescriptionRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.diagram_code.trim().is_empty() {
            return Err("diagram_code must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateDescriptionResponse {
    pub description: String,
    pub provider_used: ProviderKind,
    pub model_used: String,
    pub tokens_used: Option<u32>,
    pub generation_time: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateDiagramRequest {
    pub description: String,
    #[serde(default = "default_diagram_type")]
    pub diagram_type: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub language: Language,
}

impl GenerateDiagramRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().chars().count() < 10 {
            return Err("description must be at least 10 characters".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateDiagramResponse {
    pub diagram_code: String,
    pub provider_used: ProviderKind,
    pub model_used: String,
    pub generation_time: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImproveDiagramRequest {
    pub diagram_code: String,
    pub improvement_request: String,
    pub diagram_type: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub language: Language,
}

impl ImproveDiagramRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.diagram_code.trim().is_empty() {
            return Err("diagram_code must not be empty".to_string());
        }
        if self.improvement_request.trim().chars().count() < 5 {
            return Err("improvement_request must be at least 5 characters".to_string());
        }
        Ok(())
    }
}

/**
 * \brief 改进结果，同时回显原始代码与改进指令，便于调用方做差异展示。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ImproveDiagramResponse {
    pub diagram_code: String,
    pub original_code: String,
    pub improvement_applied: String,
    pub provider_used: ProviderKind,
    pub model_used: String,
    pub generation_time: Option<f64>,
}

#[derive(Clone, Deserialize)]
pub struct TestProviderRequest {
    pub provider: ProviderKind,
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl TestProviderRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_api_key_len(&self.api_key)?;
        if self.model.trim().is_empty() {
            return Err("model must not be empty".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for TestProviderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestProviderRequest")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestProviderResponse {
    pub valid: bool,
    pub message: String,
    pub provider_name: Option<String>,
}

fn validate_api_key_len(key: &str) -> Result<(), String> {
    if key.trim().chars().count() < MIN_API_KEY_LEN {
        return Err(format!(
            "api_key must be at least {} characters",
            MIN_API_KEY_LEN
        ));
    }
    Ok(())
}
