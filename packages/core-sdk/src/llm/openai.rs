use async_trait::async_trait;

use super::factory::ClientSettings;
use super::{AiClient, ClientError, GeneratedText};
use crate::models::Language;

pub const PROVIDER_NAME: &str = "OpenAI GPT";

/**
 * \brief OpenAI 占位实现：已登记在工厂中，但构造时总是返回“尚未实现”。
 */
#[derive(Debug)]
pub struct OpenAiClient;

impl OpenAiClient {
    pub fn new(settings: ClientSettings) -> Result<Self, ClientError> {
        tracing::debug!(model = %settings.model, "openai client requested");
        Err(not_supported())
    }
}

fn not_supported() -> ClientError {
    ClientError::NotSupported(PROVIDER_NAME.to_string())
}

#[async_trait]
impl AiClient for OpenAiClient {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate_description(
        &self,
        _diagram_code: &str,
        _diagram_type: &str,
        _language: Language,
    ) -> Result<GeneratedText, ClientError> {
        Err(not_supported())
    }

    async fn generate_diagram(
        &self,
        _description: &str,
        _diagram_type: &str,
        _language: Language,
    ) -> Result<GeneratedText, ClientError> {
        Err(not_supported())
    }

    async fn improve_diagram(
        &self,
        _diagram_code: &str,
        _improvement_request: &str,
        _diagram_type: &str,
        _language: Language,
    ) -> Result<GeneratedText, ClientError> {
        Err(not_supported())
    }

    async fn validate_api_key(&self) -> Result<bool, ClientError> {
        Err(not_supported())
    }
}
