//! Model provider clients. The provider is chosen once, when the client is
//! built; callers only see [`ModelClient`].

pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::GuardError;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai";

/// Statement returned by the offline client.
pub const OFFLINE_SQL: &str = "SELECT * FROM olist_orders_dataset LIMIT 5";

/// Upstream error bodies are cut to this many characters.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Gemini,
    OpenRouter,
    Offline,
}

impl ModelProvider {
    /// Without an API key nothing can be called, so the offline client is
    /// used. Otherwise Gemini model names go to Gemini and everything else to
    /// OpenRouter.
    pub fn infer(model_name: &str, api_key: Option<&str>) -> Self {
        match api_key {
            None | Some("") => ModelProvider::Offline,
            Some(_) if model_name.to_ascii_lowercase().contains("gemini") => ModelProvider::Gemini,
            Some(_) => ModelProvider::OpenRouter,
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelProvider::Gemini => write!(f, "gemini"),
            ModelProvider::OpenRouter => write!(f, "openrouter"),
            ModelProvider::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for ModelProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ModelProvider::Gemini),
            "openrouter" => Ok(ModelProvider::OpenRouter),
            "offline" => Ok(ModelProvider::Offline),
            other => Err(format!(
                "unknown model provider '{}' (expected gemini, openrouter or offline)",
                other
            )),
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> ModelProvider;

    /// One completion. Failures are always `GuardError::UpstreamModel`.
    async fn complete(&self, system: &str, user: &str) -> Result<String, GuardError>;
}

/// Build the client for the configured (or inferred) provider.
pub fn build_client(config: &ModelConfig) -> anyhow::Result<Box<dyn ModelClient>> {
    let provider = config.resolved_provider();
    debug!(%provider, model = %config.name, "building model client");

    let client: Box<dyn ModelClient> = match provider {
        ModelProvider::Offline => Box::new(OfflineClient),
        ModelProvider::Gemini => Box::new(GeminiClient {
            http: http_client(config.timeout())?,
            base_url: GEMINI_BASE_URL.to_string(),
            model: config.name.clone(),
            api_key: required_key(config)?,
            temperature: config.temperature,
        }),
        ModelProvider::OpenRouter => Box::new(OpenRouterClient {
            http: http_client(config.timeout())?,
            base_url: OPENROUTER_BASE_URL.to_string(),
            model: config.name.clone(),
            api_key: required_key(config)?,
            temperature: config.temperature,
        }),
    };
    Ok(client)
}

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn required_key(config: &ModelConfig) -> anyhow::Result<String> {
    match config.api_key.as_deref() {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => anyhow::bail!("model provider requires an API key (GEMINI_API_KEY or OPENROUTER_API_KEY)"),
    }
}

pub struct OfflineClient;

#[async_trait]
impl ModelClient for OfflineClient {
    fn provider(&self) -> ModelProvider {
        ModelProvider::Offline
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String, GuardError> {
        Ok(OFFLINE_SQL.to_string())
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

#[async_trait]
impl ModelClient for GeminiClient {
    fn provider(&self) -> ModelProvider {
        ModelProvider::Gemini
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, GuardError> {
        let url = format!(
            "{}/v1/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": format!("{}\n\n{}", system, user) }] }],
            "generationConfig": { "temperature": self.temperature }
        });
        let request = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body);
        let reply = post_json(request).await?;
        parse_gemini(&reply)
    }
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    fn provider(&self) -> ModelProvider {
        ModelProvider::OpenRouter
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, GuardError> {
        let url = format!(
            "{}/api/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "temperature": self.temperature
        });
        let request = self.http.post(url).bearer_auth(&self.api_key).json(&body);
        let reply = post_json(request).await?;
        parse_openrouter(&reply)
    }
}

fn upstream(status: Option<u16>, message: impl Into<String>) -> GuardError {
    GuardError::UpstreamModel {
        status,
        message: message.into(),
    }
}

async fn post_json(request: reqwest::RequestBuilder) -> Result<Value, GuardError> {
    let response = request
        .send()
        .await
        .map_err(|e| upstream(None, format!("request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(MAX_ERROR_BODY).collect();
        return Err(upstream(Some(status.as_u16()), message));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| upstream(None, format!("invalid response body: {}", e)))
}

fn parse_gemini(reply: &Value) -> Result<String, GuardError> {
    reply["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| upstream(None, "no text in Gemini response"))
}

fn parse_openrouter(reply: &Value) -> Result<String, GuardError> {
    reply["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| upstream(None, "no content in OpenRouter response"))
}
