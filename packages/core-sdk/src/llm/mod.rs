use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Language, ParameterMap, ProviderKind};

pub mod factory;
pub mod gemini;
pub mod openai;
pub mod prompt;

#[cfg(test)]
pub(crate) mod testing;

use prompt::DiagramSyntax;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.95;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(ProviderKind),
    #[error("{0} provider is not yet implemented")]
    NotSupported(String),
    #[error("invalid client configuration: {0}")]
    InvalidConfiguration(String),
    #[error("{provider} generation failed: {message}")]
    GenerationFailed { provider: String, message: String },
}

/**
 * \brief 生成参数，未提供时回落到默认值。
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParameters {
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl GenerationParameters {
    pub fn from_map(parameters: &ParameterMap) -> Self {
        let defaults = Self::default();
        let max_output_tokens = parameters
            .get("max_output_tokens")
            .or_else(|| parameters.get("max_tokens"))
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.max_output_tokens);
        Self {
            temperature: parameters
                .get("temperature")
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.temperature),
            top_p: parameters
                .get("top_p")
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.top_p),
            max_output_tokens,
        }
    }
}

/**
 * \brief 一次生成的结果；部分 Provider 会回报 token 用量。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedText {
    pub text: String,
    pub tokens_used: Option<u32>,
}

/**
 * \brief 所有 AI Provider 的统一能力面。
 */
#[async_trait]
pub trait AiClient: Send + Sync {
    /** \brief 人类可读的 Provider 名称，如 "Google Gemini"。 */
    fn provider_name(&self) -> &str;

    async fn generate_description(
        &self,
        diagram_code: &str,
        diagram_type: &str,
        language: Language,
    ) -> Result<GeneratedText, ClientError>;

    async fn generate_diagram(
        &self,
        description: &str,
        diagram_type: &str,
        language: Language,
    ) -> Result<GeneratedText, ClientError>;

    async fn improve_diagram(
        &self,
        diagram_code: &str,
        improvement_request: &str,
        diagram_type: &str,
        language: Language,
    ) -> Result<GeneratedText, ClientError>;

    /**
     * \brief 校验凭据是否可用；网络或鉴权失败返回 Ok(false)。
     */
    async fn validate_api_key(&self) -> Result<bool, ClientError>;
}

/**
 * \brief 去掉描述外层的 ```markdown / ``` 围栏。
 */
pub fn strip_markdown_fence(text: &str) -> String {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```markdown") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim().to_string()
}

/**
 * \brief 去掉图表代码首尾的围栏行（```mermaid、```plantuml 等）。
 */
pub fn strip_code_fence(text: &str) -> String {
    let mut lines: Vec<&str> = text.trim().lines().collect();
    if lines
        .first()
        .is_some_and(|l| l.trim_start().starts_with("```"))
    {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

const STYLE_KEYWORDS: [&str; 6] = ["style", "color", "colour", "classdef", "estilo", "colores"];

/**
 * \brief 移除 Mermaid 中模型擅自加入的样式指令。
 * \details 用户的改进指令提到样式或颜色时保持原样；classDiagram 中的 `class` 声明属于语法本身，不会被移除。
 */
pub fn strip_style_directives(code: &str, diagram_type: &str, instruction: &str) -> String {
    if DiagramSyntax::from_tag(diagram_type) != DiagramSyntax::Mermaid {
        return code.to_string();
    }
    let lowered = instruction.to_lowercase();
    if STYLE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return code.to_string();
    }

    let class_diagram = code
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .is_some_and(|l| l.starts_with("classDiagram"));

    code.lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.starts_with("classDef ")
                || t.starts_with("style ")
                || t.starts_with("linkStyle ")
                || (!class_diagram && t.starts_with("class ")))
        })
        .map(strip_class_shorthand)
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_class_shorthand(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = rest.find(":::") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 3..];
        let end = tail
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(tail.len());
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}
