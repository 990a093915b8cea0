use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::llm::factory::ClientFactory;
use crate::llm::{AiClient, ClientError};
use crate::models::{
    DecryptedProvider, GenerateDescriptionRequest, GenerateDescriptionResponse,
    GenerateDiagramRequest, GenerateDiagramResponse, ImproveDiagramRequest,
    ImproveDiagramResponse, NewProvider, ParameterMap, ProviderKind, ProviderRef,
    ProviderUpdate, ProviderView, SettingsView, TestProviderRequest, TestProviderResponse,
    UserAiSettings,
};
use crate::settings::{self, SettingsError, SettingsStore};
use crate::telemetry;
use crate::vault;

const NO_ACTIVE_PROVIDER: &str =
    "No active AI provider configured. Please add or re-enter an API key in settings.";

/**
 * \brief 面向调用方的错误类别，与传输层无关。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    BadRequest,
    NotImplemented,
    Internal,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::NotFound(_) => ErrorCategory::NotFound,
            ServiceError::BadRequest(_) => ErrorCategory::BadRequest,
            ServiceError::NotImplemented(_) => ErrorCategory::NotImplemented,
            ServiceError::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::NotFound(m)
            | ServiceError::BadRequest(m)
            | ServiceError::NotImplemented(m)
            | ServiceError::Internal(m) => m,
        }
    }
}

impl From<SettingsError> for ServiceError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::NotFound(_) | SettingsError::NotConfigured(_) => {
                ServiceError::NotFound(err.to_string())
            }
            SettingsError::Conflict => ServiceError::Internal(err.to_string()),
            SettingsError::Vault(e) => {
                error!(error = %e, "credential vault failure");
                telemetry::log_error("service.vault", &e.to_string());
                ServiceError::Internal("Failed to process the stored API key".to_string())
            }
            SettingsError::Storage(_) | SettingsError::Serialization(_) => {
                error!(error = %err, "settings storage failure");
                telemetry::log_error("service.settings", &err.to_string());
                ServiceError::Internal("Failed to access AI settings".to_string())
            }
        }
    }
}

fn not_supported(kind: ProviderKind) -> ServiceError {
    ServiceError::NotImplemented(format!("Provider {} is not yet supported", kind))
}

/** \brief 客户端构造失败到错误类别的映射。 */
fn construction_error(kind: ProviderKind, err: ClientError) -> ServiceError {
    match err {
        ClientError::NotSupported(_) => not_supported(kind),
        ClientError::UnsupportedProvider(_) | ClientError::InvalidConfiguration(_) => {
            ServiceError::BadRequest(err.to_string())
        }
        ClientError::GenerationFailed { .. } => ServiceError::Internal(err.to_string()),
    }
}

/**
 * \brief AI Provider 用例编排：唯一同时访问设置存储与客户端工厂的组件，也是错误类别的转换边界。
 */
pub struct AiProviderService {
    settings: Arc<SettingsStore>,
    factory: Arc<ClientFactory>,
    call_timeout: Duration,
}

impl std::fmt::Debug for AiProviderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiProviderService")
            .field("factory", &self.factory)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl AiProviderService {
    /**
     * \param call_timeout 每次外部 Provider 调用的上限
     */
    pub fn new(
        settings: Arc<SettingsStore>,
        factory: Arc<ClientFactory>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            settings,
            factory,
            call_timeout,
        }
    }

    pub fn supported_providers(&self) -> Vec<ProviderKind> {
        self.factory.supported_providers().into_iter().collect()
    }

    /**
     * \brief 读取（必要时创建）用户设置，所有 Key 脱敏后返回。
     */
    pub fn get_settings(&self, user_id: &str) -> Result<SettingsView, ServiceError> {
        let settings = self.settings.get_or_create(user_id)?;
        Ok(self.view(settings))
    }

    /**
     * \brief 先用明文 Key 构造临时客户端校验，通过后才持久化。
     */
    pub async fn add_provider(
        &self,
        user_id: &str,
        new: NewProvider,
    ) -> Result<SettingsView, ServiceError> {
        new.validate().map_err(ServiceError::BadRequest)?;
        let valid = self
            .validate_key(new.provider, new.api_key.trim(), &new.model, &new.parameters)
            .await?;
        if !valid {
            return Err(ServiceError::BadRequest(format!(
                "Invalid API key for {}",
                new.provider
            )));
        }
        self.settings.add_provider(user_id, &new)?;
        telemetry::log_event(
            "service.provider",
            &format!("add user={} provider={}", user_id, new.provider),
        );
        self.get_settings(user_id)
    }

    /**
     * \brief 部分更新；提供新 Key 时同样先校验。下标引用在同一次读取中解析为稳定 ID。
     */
    pub async fn update_provider(
        &self,
        user_id: &str,
        reference: ProviderRef,
        update: ProviderUpdate,
    ) -> Result<SettingsView, ServiceError> {
        update.validate().map_err(ServiceError::BadRequest)?;
        let current = self
            .settings
            .get(user_id)?
            .ok_or(SettingsError::NotFound(reference))?;
        let entry = &current.providers[settings::locate(&current, reference)?];

        if let Some(key) = update.new_api_key() {
            let model = update.model.as_deref().unwrap_or(&entry.model);
            let parameters = update.parameters.as_ref().unwrap_or(&entry.parameters);
            if !self
                .validate_key(entry.provider, key.trim(), model, parameters)
                .await?
            {
                return Err(ServiceError::BadRequest(format!(
                    "Invalid API key for {}",
                    entry.provider
                )));
            }
        }

        self.settings
            .update_provider_by_id(user_id, entry.id, &update)?;
        telemetry::log_event(
            "service.provider",
            &format!("update user={} id={}", user_id, entry.id),
        );
        self.get_settings(user_id)
    }

    pub fn remove_provider(
        &self,
        user_id: &str,
        reference: ProviderRef,
    ) -> Result<SettingsView, ServiceError> {
        match reference {
            ProviderRef::Index(index) => self.settings.remove_provider(user_id, index)?,
            ProviderRef::Id(id) => self.settings.remove_provider_by_id(user_id, id)?,
        };
        telemetry::log_event(
            "service.provider",
            &format!("remove user={} ref={}", user_id, reference),
        );
        self.get_settings(user_id)
    }

    pub fn set_default_provider(
        &self,
        user_id: &str,
        kind: ProviderKind,
    ) -> Result<SettingsView, ServiceError> {
        self.settings.set_default(user_id, kind)?;
        telemetry::log_event(
            "service.provider",
            &format!("set-default user={} provider={}", user_id, kind),
        );
        self.get_settings(user_id)
    }

    pub fn set_auto_generate(
        &self,
        user_id: &str,
        enabled: bool,
    ) -> Result<SettingsView, ServiceError> {
        self.settings.set_auto_generate(user_id, enabled)?;
        self.get_settings(user_id)
    }

    pub async fn generate_description(
        &self,
        user_id: &str,
        request: &GenerateDescriptionRequest,
    ) -> Result<GenerateDescriptionResponse, ServiceError> {
        request.validate().map_err(ServiceError::BadRequest)?;
        let (provider, client) = self.resolve_client(user_id, request.provider)?;
        let (out, elapsed) = self
            .timed(
                "generating description",
                client.generate_description(
                    &request.diagram_code,
                    &request.diagram_type,
                    request.language,
                ),
            )
            .await?;
        self.log_generation("description", user_id, &provider, elapsed);
        Ok(GenerateDescriptionResponse {
            description: out.text,
            provider_used: provider.provider,
            model_used: provider.model,
            tokens_used: out.tokens_used,
            generation_time: Some(elapsed),
        })
    }

    pub async fn generate_diagram(
        &self,
        user_id: &str,
        request: &GenerateDiagramRequest,
    ) -> Result<GenerateDiagramResponse, ServiceError> {
        request.validate().map_err(ServiceError::BadRequest)?;
        let (provider, client) = self.resolve_client(user_id, request.provider)?;
        let (out, elapsed) = self
            .timed(
                "generating diagram",
                client.generate_diagram(
                    &request.description,
                    &request.diagram_type,
                    request.language,
                ),
            )
            .await?;
        self.log_generation("diagram", user_id, &provider, elapsed);
        Ok(GenerateDiagramResponse {
            diagram_code: out.text,
            provider_used: provider.provider,
            model_used: provider.model,
            generation_time: Some(elapsed),
        })
    }

    /**
     * \brief 改进图表，同时回显原始代码与改进指令。
     */
    pub async fn improve_diagram(
        &self,
        user_id: &str,
        request: &ImproveDiagramRequest,
    ) -> Result<ImproveDiagramResponse, ServiceError> {
        request.validate().map_err(ServiceError::BadRequest)?;
        let (provider, client) = self.resolve_client(user_id, request.provider)?;
        let (out, elapsed) = self
            .timed(
                "improving diagram",
                client.improve_diagram(
                    &request.diagram_code,
                    &request.improvement_request,
                    &request.diagram_type,
                    request.language,
                ),
            )
            .await?;
        self.log_generation("improve", user_id, &provider, elapsed);
        Ok(ImproveDiagramResponse {
            diagram_code: out.text,
            original_code: request.diagram_code.clone(),
            improvement_applied: request.improvement_request.clone(),
            provider_used: provider.provider,
            model_used: provider.model,
            generation_time: Some(elapsed),
        })
    }

    /**
     * \brief 校验 Key 但不持久化；除“尚未实现”外的任何失败都返回 false。
     */
    pub async fn test_provider(
        &self,
        kind: ProviderKind,
        api_key: &str,
        model: &str,
    ) -> Result<bool, ServiceError> {
        match self
            .validate_key(kind, api_key.trim(), model, &ParameterMap::new())
            .await
        {
            Ok(valid) => Ok(valid),
            Err(e @ ServiceError::NotImplemented(_)) => Err(e),
            Err(e) => {
                debug!(provider = %kind, error = %e, "provider test failed");
                Ok(false)
            }
        }
    }

    /**
     * \brief test_provider 的报告形式；请求本身不合法时返回 BadRequest。
     */
    pub async fn test_provider_report(
        &self,
        request: &TestProviderRequest,
    ) -> Result<TestProviderResponse, ServiceError> {
        request.validate().map_err(ServiceError::BadRequest)?;
        let (valid, message) = match self
            .test_provider(request.provider, &request.api_key, &request.model)
            .await
        {
            Ok(true) => (true, "API key is valid".to_string()),
            Ok(false) => (false, "API key is invalid or has no permissions".to_string()),
            Err(e) => (false, format!("Error testing provider: {}", e)),
        };
        Ok(TestProviderResponse {
            valid,
            message,
            provider_name: Some(request.provider.to_string()),
        })
    }

    fn resolve_client(
        &self,
        user_id: &str,
        kind: Option<ProviderKind>,
    ) -> Result<(DecryptedProvider, Box<dyn AiClient>), ServiceError> {
        let provider = self
            .settings
            .get_active_provider(user_id, kind)?
            .ok_or_else(|| ServiceError::NotFound(NO_ACTIVE_PROVIDER.to_string()))?;
        let client = self
            .factory
            .create(
                provider.provider,
                &provider.api_key,
                &provider.model,
                &provider.parameters,
            )
            .map_err(|e| construction_error(provider.provider, e))?;
        Ok((provider, client))
    }

    async fn validate_key(
        &self,
        kind: ProviderKind,
        api_key: &str,
        model: &str,
        parameters: &ParameterMap,
    ) -> Result<bool, ServiceError> {
        let client = self
            .factory
            .create(kind, api_key, model, parameters)
            .map_err(|e| construction_error(kind, e))?;
        match tokio::time::timeout(self.call_timeout, client.validate_api_key()).await {
            Ok(Ok(valid)) => Ok(valid),
            Ok(Err(ClientError::NotSupported(_))) => Err(not_supported(kind)),
            Ok(Err(e)) => {
                warn!(provider = %kind, error = %e, "api key validation errored");
                Ok(false)
            }
            Err(_) => {
                warn!(provider = %kind, timeout = ?self.call_timeout, "api key validation timed out");
                Ok(false)
            }
        }
    }

    /** \brief 以超时包裹一次生成调用并计时（秒）。 */
    async fn timed<T, F>(&self, action: &str, call: F) -> Result<(T, f64), ServiceError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!(
                    "Error {}: provider did not respond within {}s",
                    action,
                    self.call_timeout.as_secs_f64()
                );
                error!("{}", message);
                telemetry::log_error("service.generate", &message);
                return Err(ServiceError::Internal(message));
            }
        };
        match result {
            Ok(value) => Ok((value, started.elapsed().as_secs_f64())),
            Err(ClientError::NotSupported(provider)) => Err(ServiceError::NotImplemented(
                format!("Provider {} is not yet supported", provider),
            )),
            Err(e) => {
                let message = format!("Error {}: {}", action, e);
                error!("{}", message);
                telemetry::log_error("service.generate", &message);
                Err(ServiceError::Internal(message))
            }
        }
    }

    fn log_generation(&self, what: &str, user_id: &str, provider: &DecryptedProvider, elapsed: f64) {
        telemetry::log_event(
            "service.generate",
            &format!(
                "{} user={} provider={} model={} elapsed={:.2}s",
                what, user_id, provider.provider, provider.model, elapsed
            ),
        );
    }

    /** \brief 只暴露脱敏 Key；无法解密的条目显示为 "***"。 */
    fn view(&self, settings: UserAiSettings) -> SettingsView {
        let cipher = self.settings.vault();
        let has_active_provider = settings.has_active_provider();
        let providers = settings
            .providers
            .into_iter()
            .map(|p| {
                let api_key = match cipher.decrypt(&p.encrypted_api_key) {
                    Ok(plain) => vault::mask(&plain),
                    Err(e) => {
                        warn!(provider_id = %p.id, error = %e, "masking undecryptable api key");
                        "***".to_string()
                    }
                };
                ProviderView {
                    id: p.id,
                    provider: p.provider,
                    api_key,
                    model: p.model,
                    is_active: p.is_active,
                    is_default: p.is_default,
                    parameters: p.parameters,
                    display_name: p.display_name,
                    created_at: p.created_at,
                    updated_at: p.updated_at,
                }
            })
            .collect();
        SettingsView {
            user_id: settings.user_id,
            providers,
            auto_generate_on_save: settings.auto_generate_on_save,
            default_provider: settings.default_provider,
            has_active_provider,
            created_at: settings.created_at,
            updated_at: settings.updated_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;
    use crate::llm::factory::{ClientSettings, FactoryOptions};
    use crate::llm::testing::spawn_gemini;
    use crate::llm::GeneratedText;
    use crate::models::{Language, DEFAULT_MODEL};
    use crate::vault::CredentialVault;
    use async_trait::async_trait;
    use rusqlite::Connection;

    /** \brief 可编排的假客户端：Key 以 "valid" 开头视为有效。 */
    pub(crate) struct ScriptedClient {
        api_key: String,
        reply: String,
        delay: Duration,
    }

    #[async_trait]
    impl AiClient for ScriptedClient {
        fn provider_name(&self) -> &str {
            "Scripted"
        }

        async fn generate_description(
            &self,
            diagram_code: &str,
            _diagram_type: &str,
            _language: Language,
        ) -> Result<GeneratedText, ClientError> {
            tokio::time::sleep(self.delay).await;
            Ok(GeneratedText {
                text: format!("{} :: {}", self.reply, diagram_code.len()),
                tokens_used: Some(7),
            })
        }

        async fn generate_diagram(
            &self,
            _description: &str,
            _diagram_type: &str,
            _language: Language,
        ) -> Result<GeneratedText, ClientError> {
            tokio::time::sleep(self.delay).await;
            if self.reply.is_empty() {
                return Err(ClientError::GenerationFailed {
                    provider: "Scripted".to_string(),
                    message: "empty response from model".to_string(),
                });
            }
            Ok(GeneratedText {
                text: self.reply.clone(),
                tokens_used: None,
            })
        }

        async fn improve_diagram(
            &self,
            _diagram_code: &str,
            _improvement_request: &str,
            _diagram_type: &str,
            _language: Language,
        ) -> Result<GeneratedText, ClientError> {
            Ok(GeneratedText {
                text: self.reply.clone(),
                tokens_used: None,
            })
        }

        async fn validate_api_key(&self) -> Result<bool, ClientError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.api_key.starts_with("valid"))
        }
    }

    pub(crate) fn scripted_factory(reply: &str, delay: Duration) -> ClientFactory {
        let reply = reply.to_string();
        ClientFactory::builder()
            .register(ProviderKind::Gemini, move |settings: ClientSettings| {
                Ok(Box::new(ScriptedClient {
                    api_key: settings.api_key,
                    reply: reply.clone(),
                    delay,
                }) as Box<dyn AiClient>)
            })
            .register(ProviderKind::OpenAi, |settings| {
                crate::llm::openai::OpenAiClient::new(settings)
                    .map(|c| Box::new(c) as Box<dyn AiClient>)
            })
            .build()
    }

    pub(crate) fn service_with(factory: ClientFactory, timeout: Duration) -> AiProviderService {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::migrate(&conn).expect("migrate");
        let vault = Arc::new(CredentialVault::from_key_material("service-test-key").expect("vault"));
        AiProviderService::new(
            Arc::new(SettingsStore::new(conn, vault)),
            Arc::new(factory),
            timeout,
        )
    }

    fn diagram_request(description: &str) -> GenerateDiagramRequest {
        GenerateDiagramRequest {
            description: description.to_string(),
            diagram_type: "mermaid".to_string(),
            provider: None,
            language: Language::En,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_against_gemini_mock() {
        let mock = spawn_gemini("```mermaid\nflowchart TD\n    A[Login] --> B[Dashboard]\n```").await;
        let factory = ClientFactory::standard(&FactoryOptions {
            gemini_base_url: mock.base_url.clone(),
            request_timeout: Duration::from_secs(5),
            ..FactoryOptions::default()
        })
        .expect("factory");
        let service = service_with(factory, Duration::from_secs(5));

        let view = service
            .add_provider(
                "u1",
                NewProvider::new(ProviderKind::Gemini, "validkey123456", DEFAULT_MODEL),
            )
            .await
            .expect("add provider");
        assert_eq!(view.providers.len(), 1);
        let entry = &view.providers[0];
        assert_eq!(entry.api_key, "vali...456");
        assert!(entry.is_active && entry.is_default);
        assert!(view.has_active_provider);

        let out = service
            .generate_diagram("u1", &diagram_request("a login flow"))
            .await
            .expect("generate diagram");
        assert_eq!(out.provider_used, ProviderKind::Gemini);
        assert_eq!(out.model_used, DEFAULT_MODEL);
        assert_eq!(out.diagram_code, "flowchart TD\n    A[Login] --> B[Dashboard]");
        assert!(out.generation_time.is_some());
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected_and_not_persisted() {
        let service = service_with(scripted_factory("x", Duration::ZERO), Duration::from_secs(5));
        let err = service
            .add_provider(
                "u1",
                NewProvider::new(ProviderKind::Gemini, "wrongkey123456", DEFAULT_MODEL),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BadRequest);
        assert_eq!(err.message(), "Invalid API key for gemini");
        assert!(service.get_settings("u1").expect("view").providers.is_empty());

        let err = service
            .add_provider("u1", NewProvider::new(ProviderKind::Gemini, "short", DEFAULT_MODEL))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BadRequest);
    }

    #[tokio::test]
    async fn test_unimplemented_and_unknown_providers() {
        let service = service_with(scripted_factory("x", Duration::ZERO), Duration::from_secs(5));
        let err = service
            .add_provider(
                "u1",
                NewProvider::new(ProviderKind::OpenAi, "sk-1234567890", "gpt-4o-mini"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotImplemented);

        let err = service
            .add_provider(
                "u1",
                NewProvider::new(ProviderKind::Claude, "sk-ant-1234567890", "claude-3"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BadRequest);
        assert!(err.message().contains("Unsupported provider"));

        assert!(matches!(
            service
                .test_provider(ProviderKind::OpenAi, "sk-1234567890", "gpt-4o-mini")
                .await,
            Err(ServiceError::NotImplemented(_))
        ));
        assert!(!service
            .test_provider(ProviderKind::DeepSeek, "ds-1234567890", "deepseek-chat")
            .await
            .expect("unknown provider is just invalid"));
    }

    #[tokio::test]
    async fn test_generation_without_settings_is_not_found() {
        let service = service_with(scripted_factory("x", Duration::ZERO), Duration::from_secs(5));
        let err = service
            .generate_diagram("u1", &diagram_request("a login flow"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert_eq!(err.message(), NO_ACTIVE_PROVIDER);

        let err = service
            .generate_diagram("u1", &diagram_request("short"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BadRequest);
    }

    #[tokio::test]
    async fn test_generation_failures_and_timeout() {
        let service = service_with(scripted_factory("", Duration::ZERO), Duration::from_secs(5));
        service
            .add_provider(
                "u1",
                NewProvider::new(ProviderKind::Gemini, "validkey123456", DEFAULT_MODEL),
            )
            .await
            .expect("add");
        let err = service
            .generate_diagram("u1", &diagram_request("a login flow"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(err.message().starts_with("Error generating diagram"));

        let slow = service_with(
            scripted_factory("flowchart TD", Duration::from_millis(200)),
            Duration::from_millis(500),
        );
        slow.add_provider(
            "u1",
            NewProvider::new(ProviderKind::Gemini, "validkey123456", DEFAULT_MODEL),
        )
        .await
        .expect("add");
        let slower = AiProviderService {
            call_timeout: Duration::from_millis(20),
            ..slow
        };
        let err = slower
            .generate_diagram("u1", &diagram_request("a login flow"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(err.message().contains("did not respond"));
    }

    #[tokio::test]
    async fn test_description_and_improve_responses() {
        let service = service_with(
            scripted_factory("flowchart TD\n    A --> B", Duration::ZERO),
            Duration::from_secs(5),
        );
        service
            .add_provider(
                "u1",
                NewProvider::new(ProviderKind::Gemini, "validkey123456", DEFAULT_MODEL),
            )
            .await
            .expect("add");

        let described = service
            .generate_description(
                "u1",
                &GenerateDescriptionRequest {
                    diagram_code: "flowchart TD\n A-->B".to_string(),
                    diagram_type: "flowchart".to_string(),
                    provider: Some(ProviderKind::Gemini),
                    language: Language::Es,
                },
            )
            .await
            .expect("describe");
        assert_eq!(described.tokens_used, Some(7));
        assert_eq!(described.provider_used, ProviderKind::Gemini);

        let request = ImproveDiagramRequest {
            diagram_code: "flowchart TD\n    A".to_string(),
            improvement_request: "connect A to B".to_string(),
            diagram_type: "mermaid".to_string(),
            provider: None,
            language: Language::En,
        };
        let improved = service.improve_diagram("u1", &request).await.expect("improve");
        assert_eq!(improved.diagram_code, "flowchart TD\n    A --> B");
        assert_eq!(improved.original_code, request.diagram_code);
        assert_eq!(improved.improvement_applied, request.improvement_request);

        let err = service
            .generate_description(
                "u1",
                &GenerateDescriptionRequest {
                    diagram_code: "flowchart TD".to_string(),
                    diagram_type: "mermaid".to_string(),
                    provider: Some(ProviderKind::OpenAi),
                    language: Language::En,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[tokio::test]
    async fn test_update_remove_and_views_never_leak_keys() {
        let service = service_with(scripted_factory("x", Duration::ZERO), Duration::from_secs(5));
        let view = service
            .add_provider(
                "u1",
                NewProvider::new(ProviderKind::Gemini, "validkey123456", DEFAULT_MODEL),
            )
            .await
            .expect("add");
        let id = view.providers[0].id;

        let bad = ProviderUpdate {
            api_key: Some("wrongkey654321".to_string()),
            ..Default::default()
        };
        let err = service
            .update_provider("u1", ProviderRef::Id(id), bad)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BadRequest);

        let good = ProviderUpdate {
            api_key: Some("validrotated999".to_string()),
            model: Some("gemini-1.5-pro".to_string()),
            ..Default::default()
        };
        let view = service
            .update_provider("u1", ProviderRef::Index(0), good)
            .await
            .expect("update");
        assert_eq!(view.providers[0].api_key, "vali...999");
        assert_eq!(view.providers[0].model, "gemini-1.5-pro");

        let rendered = serde_json::to_string(&view).expect("serialize view");
        assert!(!rendered.contains("validrotated999"));
        let stored = service.settings.get("u1").expect("get").expect("present");
        assert!(!rendered.contains(&stored.providers[0].encrypted_api_key));

        let err = service
            .update_provider("u1", ProviderRef::Index(4), ProviderUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);

        let view = service
            .remove_provider("u1", ProviderRef::Id(id))
            .expect("remove");
        assert!(view.providers.is_empty());
        assert!(!view.has_active_provider);
        assert_eq!(view.default_provider, None);
        assert_eq!(
            service
                .remove_provider("u1", ProviderRef::Index(0))
                .unwrap_err()
                .category(),
            ErrorCategory::NotFound
        );
    }

    #[tokio::test]
    async fn test_default_auto_generate_and_test_report() {
        let service = service_with(scripted_factory("x", Duration::ZERO), Duration::from_secs(5));
        assert_eq!(
            service
                .set_default_provider("u1", ProviderKind::Gemini)
                .unwrap_err()
                .category(),
            ErrorCategory::NotFound
        );
        let view = service.set_auto_generate("u1", true).expect("auto generate");
        assert!(view.auto_generate_on_save);

        let report = service
            .test_provider_report(&TestProviderRequest {
                provider: ProviderKind::Gemini,
                api_key: "validkey123456".to_string(),
                model: DEFAULT_MODEL.to_string(),
            })
            .await
            .expect("report");
        assert!(report.valid);
        assert_eq!(report.provider_name.as_deref(), Some("gemini"));

        let report = service
            .test_provider_report(&TestProviderRequest {
                provider: ProviderKind::OpenAi,
                api_key: "sk-1234567890".to_string(),
                model: "gpt-4o-mini".to_string(),
            })
            .await
            .expect("report");
        assert!(!report.valid);
        assert!(report.message.starts_with("Error testing provider"));
        assert!(service.get_settings("u1").expect("view").providers.is_empty());
    }
}
