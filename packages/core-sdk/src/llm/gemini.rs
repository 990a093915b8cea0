use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::factory::ClientSettings;
use super::prompt::PromptBuilder;
use super::{
    strip_code_fence, strip_markdown_fence, strip_style_directives, AiClient, ClientError,
    GeneratedText, GenerationParameters,
};
use crate::models::Language;

pub const DEFAULT_GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const PROVIDER_NAME: &str = "Google Gemini";

/**
 * \brief Google Gemini REST 客户端（generateContent / models）。
 */
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    params: GenerationParameters,
    prompts: Arc<dyn PromptBuilder>,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    /**
     * \brief 构造客户端；空 Key 或空模型名视为配置错误。
     * \param http 共享的 reqwest 客户端（超时与 UA 已配置）
     * \param base_url API 基地址，缺少版本段时自动补 /v1beta
     * \param prompts 提示词构造策略，由工厂统一注入
     */
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        settings: ClientSettings,
        prompts: Arc<dyn PromptBuilder>,
    ) -> Result<Self, ClientError> {
        if settings.api_key.trim().is_empty() {
            return Err(ClientError::InvalidConfiguration(
                "Gemini API key must not be empty".to_string(),
            ));
        }
        if settings.model.trim().is_empty() {
            return Err(ClientError::InvalidConfiguration(
                "Gemini model must not be empty".to_string(),
            ));
        }
        Ok(Self {
            http,
            base_url: normalize_gemini_base(base_url),
            api_key: settings.api_key.trim().to_string(),
            model: settings.model.trim().to_string(),
            params: GenerationParameters::from_map(&settings.parameters),
            prompts,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn parameters(&self) -> GenerationParameters {
        self.params
    }

    /**
     * \brief 列出当前 Key 可见的模型。
     */
    pub async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .http
            .get(url)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| self.failed(e.without_url().to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(self.failed(format!(
                "list models failed: {} -> {}",
                status,
                gemini_error_message(&text)
            )));
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| self.failed(e.without_url().to_string()))?;
        parse_gemini_model_list(&v).ok_or_else(|| self.failed("unexpected models payload"))
    }

    async fn generate(&self, prompt: &str) -> Result<GeneratedText, ClientError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url,
            self.model.trim_start_matches("models/")
        );
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": self.params.temperature,
                "topP": self.params.top_p,
                "maxOutputTokens": self.params.max_output_tokens,
            }
        });

        let resp = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| self.failed(e.without_url().to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(self.failed(format!(
                "request failed: {} -> {}",
                status,
                gemini_error_message(&text)
            )));
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| self.failed(e.without_url().to_string()))?;
        let text = extract_gemini_content(&v);
        if text.trim().is_empty() {
            return Err(self.failed("empty response from model"));
        }
        let tokens_used = v
            .get("usageMetadata")
            .and_then(|u| u.get("totalTokenCount"))
            .and_then(|n| n.as_u64())
            .and_then(|n| u32::try_from(n).ok());
        debug!(model = %self.model, ?tokens_used, "gemini generation finished");
        Ok(GeneratedText { text, tokens_used })
    }

    /** \brief 后处理（去围栏、去样式）之后仍为空的回复同样视为失败。 */
    fn non_empty(&self, text: String) -> Result<String, ClientError> {
        if text.trim().is_empty() {
            return Err(self.failed("empty response from model"));
        }
        Ok(text)
    }

    fn failed(&self, message: impl Into<String>) -> ClientError {
        ClientError::GenerationFailed {
            provider: PROVIDER_NAME.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate_description(
        &self,
        diagram_code: &str,
        diagram_type: &str,
        language: Language,
    ) -> Result<GeneratedText, ClientError> {
        let prompt = self
            .prompts
            .description_prompt(diagram_code, diagram_type, language);
        let out = self.generate(&prompt).await?;
        Ok(GeneratedText {
            text: self.non_empty(strip_markdown_fence(&out.text))?,
            ..out
        })
    }

    async fn generate_diagram(
        &self,
        description: &str,
        diagram_type: &str,
        language: Language,
    ) -> Result<GeneratedText, ClientError> {
        let prompt = self
            .prompts
            .diagram_prompt(description, diagram_type, language);
        let out = self.generate(&prompt).await?;
        Ok(GeneratedText {
            text: self.non_empty(strip_code_fence(&out.text))?,
            ..out
        })
    }

    async fn improve_diagram(
        &self,
        diagram_code: &str,
        improvement_request: &str,
        diagram_type: &str,
        language: Language,
    ) -> Result<GeneratedText, ClientError> {
        let prompt =
            self.prompts
                .improvement_prompt(diagram_code, improvement_request, diagram_type, language);
        let out = self.generate(&prompt).await?;
        let code = strip_code_fence(&out.text);
        Ok(GeneratedText {
            text: self.non_empty(strip_style_directives(
                &code,
                diagram_type,
                improvement_request,
            ))?,
            ..out
        })
    }

    async fn validate_api_key(&self) -> Result<bool, ClientError> {
        match self.list_models().await {
            Ok(models) => Ok(!models.is_empty()),
            Err(e) => {
                warn!(error = %e, "gemini api key validation failed");
                Ok(false)
            }
        }
    }
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_GEMINI_BASE.to_string();
    }
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

fn extract_gemini_content(v: &Value) -> String {
    v.get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|first| first.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn parse_gemini_model_list(v: &Value) -> Option<Vec<String>> {
    let arr = v.get("models")?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|item| item.get("name").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect(),
    )
}

/** \brief 尽量取出 Google 错误体中的 error.message，取不到则返回原文。 */
fn gemini_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::prompt::StandardPrompts;
    use crate::llm::testing::spawn_gemini;
    use crate::models::ParameterMap;
    use serde_json::json;

    fn client(base: &str, key: &str) -> GeminiClient {
        GeminiClient::new(
            reqwest::Client::new(),
            base,
            ClientSettings::new(key, "gemini-2.0-flash-lite", ParameterMap::new()),
            Arc::new(StandardPrompts),
        )
        .expect("client")
    }

    #[test]
    fn test_normalize_gemini_base() {
        assert_eq!(normalize_gemini_base(""), DEFAULT_GEMINI_BASE);
        assert_eq!(
            normalize_gemini_base("http://localhost:9000/"),
            "http://localhost:9000/v1beta"
        );
        assert_eq!(normalize_gemini_base(DEFAULT_GEMINI_BASE), DEFAULT_GEMINI_BASE);
    }

    #[test]
    fn test_extract_content_and_errors() {
        let v = json!({"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(extract_gemini_content(&v), "ab");
        assert_eq!(extract_gemini_content(&json!({"candidates": []})), "");
        assert_eq!(
            gemini_error_message(r#"{"error":{"message":"quota exceeded"}}"#),
            "quota exceeded"
        );
        assert_eq!(gemini_error_message("bad gateway"), "bad gateway");
    }

    #[test]
    fn test_new_rejects_blank_settings() {
        let err = GeminiClient::new(
            reqwest::Client::new(),
            "",
            ClientSettings::new("  ", "gemini-2.0-flash-lite", ParameterMap::new()),
            Arc::new(StandardPrompts),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_parameters_are_applied() {
        let mut params = ParameterMap::new();
        params.insert("temperature".to_string(), json!(0.1));
        let c = GeminiClient::new(
            reqwest::Client::new(),
            "",
            ClientSettings::new("valid-key-123", "gemini-1.5-pro", params),
            Arc::new(StandardPrompts),
        )
        .expect("client");
        assert_eq!(c.parameters().temperature, 0.1);
        assert_eq!(c.parameters().max_output_tokens, 2048);
        assert_eq!(c.model(), "gemini-1.5-pro");
    }

    #[tokio::test]
    async fn test_validate_api_key_against_mock() {
        let mock = spawn_gemini("unused").await;
        assert!(client(&mock.base_url, "validkey123456")
            .validate_api_key()
            .await
            .expect("validate"));
        assert!(!client(&mock.base_url, "wrongkey123456")
            .validate_api_key()
            .await
            .expect("validate"));
    }

    #[tokio::test]
    async fn test_validate_api_key_unreachable_host_is_false() {
        let c = client("http://127.0.0.1:9", "validkey123456");
        assert!(!c.validate_api_key().await.expect("validate"));
    }

    #[tokio::test]
    async fn test_generate_diagram_request_shape_and_fence_stripping() {
        let mock = spawn_gemini("```mermaid\nflowchart TD\n    A[Login] --> B[Home]\n```").await;
        let out = client(&mock.base_url, "validkey123456")
            .generate_diagram("a login flow", "mermaid", Language::En)
            .await
            .expect("generate");
        assert_eq!(out.text, "flowchart TD\n    A[Login] --> B[Home]");
        assert_eq!(out.tokens_used, Some(42));

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].call, "gemini-2.0-flash-lite:generateContent");
        assert_eq!(requests[0].key, "validkey123456");
        let config = &requests[0].body["generationConfig"];
        assert_eq!(config["temperature"], json!(0.7));
        assert_eq!(config["topP"], json!(0.95));
        assert_eq!(config["maxOutputTokens"], json!(2048));
        let prompt = requests[0].body["contents"][0]["parts"][0]["text"]
            .as_str()
            .expect("prompt text");
        assert!(prompt.contains("a login flow"));
        assert!(prompt.contains("MERMAID CONTEXT"));
    }

    #[tokio::test]
    async fn test_generate_description_strips_markdown_fence() {
        let mock = spawn_gemini("```markdown\n**Propósito**: login\n```").await;
        let out = client(&mock.base_url, "validkey123456")
            .generate_description("flowchart TD\n A-->B", "mermaid", Language::Es)
            .await
            .expect("describe");
        assert_eq!(out.text, "**Propósito**: login");
    }

    #[tokio::test]
    async fn test_improve_strips_unrequested_styles() {
        let mock =
            spawn_gemini("flowchart TD\n    A --> B\n    A --> C[Error]\n    style C fill:#f00")
                .await;
        let out = client(&mock.base_url, "validkey123456")
            .improve_diagram(
                "flowchart TD\n    A --> B",
                "add an error branch",
                "mermaid",
                Language::En,
            )
            .await
            .expect("improve");
        assert_eq!(out.text, "flowchart TD\n    A --> B\n    A --> C[Error]");
    }

    #[tokio::test]
    async fn test_generation_errors() {
        let mock = spawn_gemini("").await;
        let err = client(&mock.base_url, "validkey123456")
            .generate_diagram("a login flow", "mermaid", Language::En)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::GenerationFailed { .. }));

        mock.set_reply("flowchart TD");
        let err = client(&mock.base_url, "wrongkey123456")
            .generate_diagram("a login flow", "mermaid", Language::En)
            .await
            .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("API key not valid"));
        assert!(!rendered.contains("wrongkey123456"));
    }

    #[tokio::test]
    async fn test_fence_only_replies_are_errors() {
        let mock = spawn_gemini("```mermaid\n```").await;
        let c = client(&mock.base_url, "validkey123456");
        let err = c
            .generate_diagram("a login flow", "mermaid", Language::En)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty response from model"));

        mock.set_reply("```markdown\n```");
        let err = c
            .generate_description("flowchart TD\n A-->B", "mermaid", Language::Es)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::GenerationFailed { .. }));

        mock.set_reply("```mermaid\nstyle A fill:#f00\n```");
        let err = c
            .improve_diagram("flowchart TD\n    A", "make it clearer", "mermaid", Language::En)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::GenerationFailed { .. }));
    }
}
