use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;

    /// Like [`LlmClient::chat`] but asks the provider for JSON output where it
    /// supports that. Nothing is guaranteed; callers still normalize the text.
    async fn chat_json(&self, system: &str, user: &str) -> Result<String> {
        self.chat(system, user).await
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    1
}
fn default_retry_delay() -> u64 {
    5
}
fn default_timeout() -> u64 {
    120
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    let client: Box<dyn LlmClient> = match config.provider.as_str() {
        "gemini" => {
            let cfg = config.gemini.as_ref().context("Gemini config missing")?;
            Box::new(GeminiClient::new(&cfg.api_key, &cfg.model))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().context("Ollama config missing")?;
            Box::new(OllamaClient::new(&cfg.base_url, &cfg.model))
        }
        "openai" => {
            let cfg = config.openai.as_ref().context("OpenAI config missing")?;
            Box::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
            ))
        }
        _ => return Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    };

    Ok(Box::new(RetryingLlm::new(
        client,
        config.retry_count,
        Duration::from_secs(config.retry_delay_seconds),
        Duration::from_secs(config.timeout_seconds),
    )))
}

// --- Timeout & retry ---

#[derive(Debug, Clone, Copy)]
enum Mode {
    Free,
    Json,
}

/// Bounds every call with a timeout and retries failed calls.
#[derive(Debug)]
pub struct RetryingLlm {
    inner: Box<dyn LlmClient>,
    retry_count: usize,
    retry_delay: Duration,
    timeout: Duration,
}

impl RetryingLlm {
    pub fn new(
        inner: Box<dyn LlmClient>,
        retry_count: usize,
        retry_delay: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            retry_count,
            retry_delay,
            timeout,
        }
    }

    async fn attempt(&self, mode: Mode, system: &str, user: &str) -> Result<String> {
        let call = async {
            match mode {
                Mode::Free => self.inner.chat(system, user).await,
                Mode::Json => self.inner.chat_json(system, user).await,
            }
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "LLM call timed out after {:.1}s",
                self.timeout.as_secs_f64()
            )),
        }
    }

    async fn call(&self, mode: Mode, system: &str, user: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.attempt(mode, system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retry_count => {
                    attempt += 1;
                    warn!(
                        "LLM call failed: {}, retrying ({}/{})...",
                        e, attempt, self.retry_count
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlm {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.call(Mode::Free, system, user).await
    }

    async fn chat_json(&self, system: &str, user: &str) -> Result<String> {
        self.call(Mode::Json, system, user).await
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn generate(&self, system: &str, user: &str, json: bool) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: user.to_string(),
                }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: system.to_string(),
                }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                temperature: if json { 0.1 } else { 0.7 },
                response_mime_type: json.then(|| "application/json".to_string()),
            }),
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = match serde_json::from_str(&response_text) {
            Ok(r) => r,
            Err(e) => {
                return Err(anyhow!(
                    "Failed to parse Gemini response: {}. Body: {}",
                    e,
                    response_text
                ))
            }
        };

        if let Some(err) = result.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }

        if let Some(candidates) = result.candidates {
            if let Some(first) = candidates.first() {
                if let Some(content) = &first.content {
                    if let Some(part) = content.parts.first() {
                        return Ok(part.text.clone());
                    }
                }

                let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
                return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
            }
        }

        Err(anyhow!(
            "Gemini response format unexpected or empty. Body: {}",
            response_text
        ))
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.generate(system, user, false).await
    }

    async fn chat_json(&self, system: &str, user: &str) -> Result<String> {
        self.generate(system, user, true).await
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream: false,
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        if let Some(choice) = result.choices.first() {
            if let Some(content) = &choice.message.content {
                return Ok(content.clone());
            }
        }

        Err(anyhow!("OpenAI response empty or missing content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct FlakyLlm {
        failures_left: Arc<Mutex<usize>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            self.calls.lock().unwrap().push("chat");
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("transient"));
            }
            Ok("ok".to_string())
        }

        async fn chat_json(&self, _system: &str, _user: &str) -> Result<String> {
            self.calls.lock().unwrap().push("json");
            Ok("[]".to_string())
        }
    }

    #[derive(Debug)]
    struct SlowLlm;

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn flaky(failures: usize) -> (FlakyLlm, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            FlakyLlm {
                failures_left: Arc::new(Mutex::new(failures)),
                calls: calls.clone(),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn test_single_retry_recovers_transient_failure() {
        let (inner, calls) = flaky(1);
        let llm = RetryingLlm::new(
            Box::new(inner),
            1,
            Duration::from_millis(0),
            Duration::from_secs(5),
        );
        assert_eq!(llm.chat("s", "u").await.unwrap(), "ok");
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_is_respected() {
        let (inner, calls) = flaky(3);
        let llm = RetryingLlm::new(
            Box::new(inner),
            1,
            Duration::from_millis(0),
            Duration::from_secs(5),
        );
        assert!(llm.chat("s", "u").await.is_err());
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_json_mode_is_forwarded() {
        let (inner, calls) = flaky(0);
        let llm = RetryingLlm::new(
            Box::new(inner),
            0,
            Duration::from_millis(0),
            Duration::from_secs(5),
        );
        assert_eq!(llm.chat_json("s", "u").await.unwrap(), "[]");
        assert_eq!(*calls.lock().unwrap(), vec!["json"]);
    }

    #[tokio::test]
    async fn test_timeout_produces_error() {
        let llm = RetryingLlm::new(
            Box::new(SlowLlm),
            0,
            Duration::from_millis(0),
            Duration::from_millis(50),
        );
        let err = llm.chat("s", "u").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let config = LlmConfig {
            provider: "mystery".to_string(),
            retry_count: 1,
            retry_delay_seconds: 0,
            timeout_seconds: 1,
            gemini: None,
            ollama: None,
            openai: None,
        };
        assert!(create_llm(&config).is_err());
    }

    #[test]
    fn test_gemini_json_request_sets_mime_type() {
        let body = GeminiRequest {
            contents: vec![],
            system_instruction: None,
            generation_config: Some(GeminiGenerationConfig {
                temperature: 0.1,
                response_mime_type: Some("application/json".to_string()),
            }),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert!(value.get("system_instruction").is_none());
    }

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let candidate = &result.candidates.as_ref().unwrap()[0];

        assert!(candidate.content.is_none());
        assert_eq!(candidate.finish_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Once upon a time"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.choices[0].message.content.as_deref(),
            Some("Once upon a time")
        );
    }
}
