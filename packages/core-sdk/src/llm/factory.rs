use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::gemini::{GeminiClient, DEFAULT_GEMINI_BASE};
use super::openai::OpenAiClient;
use super::prompt::{PromptBuilder, StandardPrompts};
use super::{AiClient, ClientError};
use crate::models::{ParameterMap, ProviderKind};

const USER_AGENT: &str = concat!("diagramhub/", env!("CARGO_PKG_VERSION"));

/**
 * \brief 构造客户端所需的明文凭据与模型参数。
 */
#[derive(Clone)]
pub struct ClientSettings {
    pub api_key: String,
    pub model: String,
    pub parameters: ParameterMap,
}

impl ClientSettings {
    pub fn new(api_key: &str, model: &str, parameters: ParameterMap) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            parameters,
        }
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("parameters", &self.parameters)
            .finish()
    }
}

pub type ClientConstructor =
    Arc<dyn Fn(ClientSettings) -> Result<Box<dyn AiClient>, ClientError> + Send + Sync>;

/**
 * \brief 标准工厂的选项：HTTP 设置与所有客户端共享的提示词策略。
 */
#[derive(Clone)]
pub struct FactoryOptions {
    pub gemini_base_url: String,
    pub request_timeout: Duration,
    pub prompts: Arc<dyn PromptBuilder>,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            gemini_base_url: DEFAULT_GEMINI_BASE.to_string(),
            request_timeout: Duration::from_secs(60),
            prompts: Arc::new(StandardPrompts),
        }
    }
}

impl fmt::Debug for FactoryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryOptions")
            .field("gemini_base_url", &self.gemini_base_url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/**
 * \brief Provider 类型到客户端构造器的注册表。
 */
#[derive(Clone, Default)]
pub struct ClientFactory {
    constructors: HashMap<ProviderKind, ClientConstructor>,
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("supported", &self.supported_providers())
            .finish()
    }
}

pub struct ClientFactoryBuilder {
    constructors: HashMap<ProviderKind, ClientConstructor>,
}

impl ClientFactoryBuilder {
    pub fn register<F>(mut self, kind: ProviderKind, constructor: F) -> Self
    where
        F: Fn(ClientSettings) -> Result<Box<dyn AiClient>, ClientError> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(constructor));
        self
    }

    pub fn build(self) -> ClientFactory {
        ClientFactory {
            constructors: self.constructors,
        }
    }
}

impl ClientFactory {
    pub fn builder() -> ClientFactoryBuilder {
        ClientFactoryBuilder {
            constructors: HashMap::new(),
        }
    }

    /**
     * \brief 默认注册表：Gemini 与 OpenAI（后者为占位实现）。
     */
    pub fn standard(options: &FactoryOptions) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ClientError::InvalidConfiguration(format!("http client: {}", e)))?;
        let base_url = options.gemini_base_url.clone();
        let prompts = Arc::clone(&options.prompts);

        Ok(Self::builder()
            .register(ProviderKind::Gemini, move |settings| {
                let client =
                    GeminiClient::new(http.clone(), &base_url, settings, Arc::clone(&prompts))?;
                Ok(Box::new(client) as Box<dyn AiClient>)
            })
            .register(ProviderKind::OpenAi, |settings| {
                let client = OpenAiClient::new(settings)?;
                Ok(Box::new(client) as Box<dyn AiClient>)
            })
            .build())
    }

    /**
     * \brief 按 Provider 类型构造客户端。
     * \return 未注册的类型返回 UnsupportedProvider
     */
    pub fn create(
        &self,
        kind: ProviderKind,
        api_key: &str,
        model: &str,
        parameters: &ParameterMap,
    ) -> Result<Box<dyn AiClient>, ClientError> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or(ClientError::UnsupportedProvider(kind))?;
        constructor(ClientSettings::new(api_key, model, parameters.clone()))
    }

    pub fn supported_providers(&self) -> BTreeSet<ProviderKind> {
        self.constructors.keys().copied().collect()
    }
}
