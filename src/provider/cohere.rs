use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::Settings;
use crate::error::{EmbeddingError, GenerationError, SetupError};
use crate::provider::{EmbeddingProvider, GenerationProvider, SamplingConfig, Truncate};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
// A full embed batch of 4096-dimensional vectors exceeds ureq's 10 MB default
const MAX_RESPONSE_BYTES: u64 = 128 * 1024 * 1024;

/// Blocking client for the Cohere embed and generate endpoints.
#[derive(Debug, Clone)]
pub struct CohereClient {
    base_url: Url,
    api_key: String,
    embed_model: String,
    generate_model: String,
    agent: ureq::Agent,
    retry_attempts: u32,
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [&'a str],
    model: &'a str,
    truncate: Truncate,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(flatten)]
    sampling: &'a SamplingConfig,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    generations: Vec<Generation>,
}

#[derive(Debug, Deserialize)]
struct Generation {
    text: String,
}

/// Why a request gave up.
#[derive(Debug)]
enum RequestFailure {
    Status(u16),
    Transport(String),
}

impl From<RequestFailure> for EmbeddingError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Status(status) => Self::Status { status },
            RequestFailure::Transport(message) => Self::Request(message),
        }
    }
}

impl From<RequestFailure> for GenerationError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Status(status) => Self::Status { status },
            RequestFailure::Transport(message) => Self::Request(message),
        }
    }
}

impl CohereClient {
    /// Creates a client with an explicit API key.
    pub fn new(api_key: impl Into<String>, settings: &Settings) -> Result<Self, SetupError> {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(settings.cohere.timeout_secs)))
            .build()
            .into();

        Ok(Self {
            base_url: parse_base_url(&settings.cohere.base_url)?,
            api_key: api_key.into(),
            embed_model: settings.embedding.model.clone(),
            generate_model: settings.generation.model.clone(),
            agent,
            retry_attempts: settings.cohere.max_retries + 1,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Creates a client reading the API key from the configured variable.
    pub fn from_env(settings: &Settings) -> Result<Self, SetupError> {
        let var = &settings.cohere.api_key_env;
        let api_key = std::env::var(var)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| SetupError::MissingApiKey { var: var.clone() })?;
        Self::new(api_key, settings)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, SetupError> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        self
    }

    /// Total attempts per request, including the first.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Delay before the first retry; doubles on each further retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn post_json(&self, endpoint: &str, body: &str) -> Result<String, RequestFailure> {
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|e| RequestFailure::Transport(format!("invalid endpoint URL: {e}")))?;
        let auth = format!("Bearer {}", self.api_key);

        self.make_request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Authorization", &auth)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .send(body)
                .and_then(|mut resp| {
                    resp.body_mut()
                        .with_config()
                        .limit(MAX_RESPONSE_BYTES)
                        .read_to_string()
                })
        })
    }

    /// Runs `request_fn`, retrying server errors, rate limits and transport
    /// failures with exponential backoff. Other client errors fail at once.
    fn make_request_with_retry<F>(&self, mut request_fn: F) -> Result<String, RequestFailure>
    where
        F: FnMut() -> Result<String, ureq::Error>,
    {
        let mut last_failure = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {attempt}/{}", self.retry_attempts);

            match request_fn() {
                Ok(response_text) => {
                    debug!("Request succeeded on attempt {attempt}");
                    return Ok(response_text);
                }
                Err(error) => {
                    let failure = match &error {
                        ureq::Error::StatusCode(status) if *status >= 500 || *status == 429 => {
                            warn!(
                                "Server error (status {status}), attempt {attempt}/{}",
                                self.retry_attempts
                            );
                            RequestFailure::Status(*status)
                        }
                        ureq::Error::StatusCode(status) => {
                            warn!("Client error (status {status}), not retrying");
                            return Err(RequestFailure::Status(*status));
                        }
                        ureq::Error::ConnectionFailed
                        | ureq::Error::HostNotFound
                        | ureq::Error::Timeout(_)
                        | ureq::Error::Io(_) => {
                            warn!(
                                "Transport error: {error}, attempt {attempt}/{}",
                                self.retry_attempts
                            );
                            RequestFailure::Transport(error.to_string())
                        }
                        _ => {
                            warn!("Non-retryable error: {error}");
                            return Err(RequestFailure::Transport(error.to_string()));
                        }
                    };

                    last_failure = Some(failure);

                    // Wait before retry (exponential backoff)
                    if attempt < self.retry_attempts {
                        let delay = self.retry_delay * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                        debug!("Waiting {delay:?} before retry");
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(last_failure
            .unwrap_or_else(|| RequestFailure::Transport("request failed after retries".into())))
    }
}

fn parse_base_url(raw: &str) -> Result<Url, SetupError> {
    let mut url = Url::parse(raw).map_err(|source| SetupError::InvalidBaseUrl {
        url: raw.to_string(),
        source,
    })?;
    // Endpoints are joined relative to the base path
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl EmbeddingProvider for CohereClient {
    fn embed(&self, texts: &[&str], truncate: Truncate) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding {} texts with model {}", texts.len(), self.embed_model);

        let request = EmbedRequest {
            texts,
            model: &self.embed_model,
            truncate,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| EmbeddingError::Request(format!("failed to encode request: {e}")))?;

        let response_text = self.post_json("v1/embed", &body)?;
        let response: EmbedResponse = serde_json::from_str(&response_text)
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if response.embeddings.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: response.embeddings.len(),
            });
        }
        Ok(response.embeddings)
    }

    fn model(&self) -> &str {
        &self.embed_model
    }
}

impl GenerationProvider for CohereClient {
    fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Vec<String>, GenerationError> {
        let request = GenerateRequest {
            model: &self.generate_model,
            prompt,
            sampling,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| GenerationError::Request(format!("failed to encode request: {e}")))?;

        let response_text = self.post_json("v1/generate", &body)?;
        let response: GenerateResponse = serde_json::from_str(&response_text)
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        Ok(response.generations.into_iter().map(|g| g.text).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_client_configuration() {
        let mut settings = Settings::default();
        settings.cohere.base_url = "http://localhost:9999/api".to_string();
        settings.cohere.max_retries = 2;

        let client = CohereClient::new("key", &settings).unwrap();
        assert_eq!(client.base_url.as_str(), "http://localhost:9999/api/");
        assert_eq!(
            client.base_url.join("v1/embed").unwrap().as_str(),
            "http://localhost:9999/api/v1/embed"
        );
        assert_eq!(client.retry_attempts, 3);
        assert_eq!(client.model(), "large");
    }

    #[test]
    fn test_builder_methods() {
        let client = CohereClient::new("key", &Settings::default())
            .unwrap()
            .with_api_key("other")
            .with_timeout(Duration::from_secs(5))
            .with_retry_attempts(0)
            .with_retry_delay(Duration::from_millis(5));

        assert_eq!(client.api_key, "other");
        assert_eq!(client.retry_attempts, 1);
        assert_eq!(client.retry_delay, Duration::from_millis(5));
    }

    #[test]
    fn test_invalid_base_url() {
        let result = CohereClient::new("key", &Settings::default())
            .unwrap()
            .with_base_url("not a url");
        assert!(matches!(result, Err(SetupError::InvalidBaseUrl { .. })));
    }

    #[test]
    #[serial]
    fn test_missing_api_key() {
        let mut settings = Settings::default();
        settings.cohere.api_key_env = "COHERE_TEST_MISSING_KEY".to_string();
        unsafe {
            std::env::remove_var("COHERE_TEST_MISSING_KEY");
        }

        let result = CohereClient::from_env(&settings);
        assert!(matches!(
            result,
            Err(SetupError::MissingApiKey { ref var }) if var == "COHERE_TEST_MISSING_KEY"
        ));
    }

    #[test]
    fn test_generate_request_shape() {
        let sampling = Settings::default().generation.sampling();
        let request = GenerateRequest {
            model: "command",
            prompt: "hello",
            sampling: &sampling,
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "command");
        assert_eq!(json["prompt"], "hello");
        assert_eq!(json["max_tokens"], 60);
        assert_eq!(json["stop_sequences"][0], "--");
        assert!(json.get("frequency_penalty").is_some());
        assert!(json.get("presence_penalty").is_some());
    }

    #[test]
    fn test_embed_request_shape() {
        let texts = ["a", "b"];
        let request = EmbedRequest {
            texts: &texts,
            model: "large",
            truncate: Truncate::Left,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["truncate"], "LEFT");
        assert_eq!(json["texts"][1], "b");
    }
}
