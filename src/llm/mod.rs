pub mod prompt;
pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// Prior attempt handed back to the generator when refining a failed query.
#[derive(Debug, Clone)]
pub struct RefinementContext {
    pub previous_sql: String,
    pub previous_error: Option<String>,
    pub user_note: Option<String>,
}

/// One generation request: the question, the rendered schema context and,
/// for refinements, the failed attempt being corrected.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub schema_context: String,
    pub previous_attempt: Option<RefinementContext>,
}

/// What a provider returns. Token counts are zero when the backend does
/// not report usage.
#[derive(Debug, Clone)]
pub struct Generated {
    pub sql: String,
    pub explanation: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generated, LlmError>;
}

pub struct LlmManager {
    generator: Box<dyn SqlGenerator + Send + Sync>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let generator: Box<dyn SqlGenerator + Send + Sync> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self { generator })
    }
}

#[async_trait]
impl SqlGenerator for LlmManager {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generated, LlmError> {
        self.generator.generate(request).await
    }
}
