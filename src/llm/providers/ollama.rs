use crate::config::LlmConfig;
use crate::llm::prompt::{build_prompt, parse_response};
use crate::llm::{Generated, GenerationRequest, LlmError, SqlGenerator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest {
    model: String,
    prompt: String,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
    /// Prompt tokens, when the server reports them.
    prompt_eval_count: Option<u64>,
    /// Completion tokens, when the server reports them.
    eval_count: Option<u64>,
    // Use serde to ignore unknown fields
    #[serde(flatten)]
    extra: std::collections::HashMap<String, serde_json::Value>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        let client = reqwest::Client::new();

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SqlGenerator for OllamaProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generated, LlmError> {
        let prompt = build_prompt(request);

        debug!("Sending request to Ollama with model: {}", self.model);

        let body = OllamaRequest {
            model: self.model.clone(),
            prompt,
            temperature: 0.0,
            stream: false, // Explicitly disable streaming
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            // Try to get the error message from the response body
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };

            error!("Ollama API responded with status code: {}{}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "Ollama API responded with status code: {}{}",
                status, error_body
            )));
        }

        // Get the raw text response first for diagnostics
        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::ResponseError(format!("Failed to read response body: {}", e)))?;

        debug!("Raw response from Ollama: {}", response_text);

        let ollama_response = match serde_json::from_str::<OllamaResponse>(&response_text) {
            Ok(resp) => resp,
            Err(e) => {
                error!(
                    "Failed to parse Ollama response: {} - Response was: {}",
                    e, response_text
                );
                return Err(LlmError::ResponseError(format!(
                    "Failed to parse Ollama response: {} - Response was: {}",
                    e, response_text
                )));
            }
        };

        let (sql, explanation) = parse_response(&ollama_response.response);

        // Ensure we don't return empty SQL
        if sql.trim().is_empty() {
            return Err(LlmError::ResponseError(
                "Failed to extract valid SQL from response".to_string(),
            ));
        }

        Ok(Generated {
            sql,
            explanation,
            input_tokens: ollama_response.prompt_eval_count.unwrap_or(0),
            output_tokens: ollama_response.eval_count.unwrap_or(0),
        })
    }
}
