use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ModelSettings;
use crate::error::OracleError;
use crate::prompt;
use crate::retry::{RetryPolicy, RetryState};
use crate::shape::{OutputShape, parse_json_payload};

/// What an oracle call is for. Carried on every request for logging and so test
/// doubles can answer by task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleTask {
    CodeDiscovery,
    SpeakerDiscovery,
    EntityDiscovery,
    QuoteExtraction { document_id: String },
    ConnectionClassification {
        document_id: String,
        target_position: usize,
        candidate_position: usize,
    },
    /// Reformat a malformed answer to a previous task
    Repair(Box<OracleTask>),
}

impl OracleTask {
    pub fn document_id(&self) -> Option<&str> {
        match self {
            OracleTask::QuoteExtraction { document_id }
            | OracleTask::ConnectionClassification { document_id, .. } => Some(document_id),
            OracleTask::Repair(inner) => inner.document_id(),
            _ => None,
        }
    }
}

impl fmt::Display for OracleTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleTask::CodeDiscovery => write!(f, "code_discovery"),
            OracleTask::SpeakerDiscovery => write!(f, "speaker_discovery"),
            OracleTask::EntityDiscovery => write!(f, "entity_discovery"),
            OracleTask::QuoteExtraction { document_id } => {
                write!(f, "quote_extraction[{}]", document_id)
            }
            OracleTask::ConnectionClassification {
                document_id,
                target_position,
                candidate_position,
            } => write!(
                f,
                "connection[{}:{}->{}]",
                document_id, target_position, candidate_position
            ),
            OracleTask::Repair(inner) => write!(f, "repair({})", inner),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub task: OracleTask,
    pub prompt: String,
    pub shape: OutputShape,
    pub settings: ModelSettings,
}

/// Raw transport to a text-completion service. Implementations classify their own
/// failures as transient or permanent; the gateway owns retries and validation.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn send(&self, request: &CompletionRequest) -> Result<String, OracleError>;

    /// Called when the answer to `request` failed validation in the gateway.
    fn rejected(&self, _request: &CompletionRequest) {}
}

#[async_trait]
impl<T: CompletionBackend + ?Sized> CompletionBackend for Arc<T> {
    async fn send(&self, request: &CompletionRequest) -> Result<String, OracleError> {
        (**self).send(request).await
    }

    fn rejected(&self, request: &CompletionRequest) {
        (**self).rejected(request)
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: Value, // JSON schema for structured output
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { base_url, client }
    }

    fn classify_transport(error: reqwest::Error) -> OracleError {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            OracleError::Transient(format!("request to Ollama failed: {}", error))
        } else {
            OracleError::Permanent(format!("request to Ollama failed: {}", error))
        }
    }
}

#[async_trait]
impl CompletionBackend for OllamaClient {
    async fn send(&self, request: &CompletionRequest) -> Result<String, OracleError> {
        let url = format!("{}/api/generate", self.base_url);

        let body = OllamaRequest {
            model: &request.settings.model,
            prompt: &request.prompt,
            stream: false,
            format: request.shape.to_json_schema(),
            options: OllamaOptions {
                temperature: request.settings.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(OracleError::Transient(format!(
                "Ollama request failed: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(OracleError::Permanent(format!(
                "Ollama request failed: {}",
                status
            )));
        }

        let ollama_response: OllamaResponse = response.json().await.map_err(|e| {
            OracleError::Transient(format!("Failed to parse Ollama response: {}", e))
        })?;

        Ok(ollama_response.response)
    }
}

/// The single path every stage uses to reach the oracle.
///
/// Each call is retried through [`RetryPolicy`]'s state machine. Transport failures
/// the backend marks transient are retried as-is; malformed answers (unparseable,
/// wrong shape, not deserializable) are retried with a repair prompt. Exhaustion
/// surfaces as [`OracleError::Permanent`].
pub struct TextCompletionGateway {
    backend: Arc<dyn CompletionBackend>,
    policy: RetryPolicy,
    calls: AtomicUsize,
}

impl TextCompletionGateway {
    pub fn new(backend: Arc<dyn CompletionBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of backend calls issued so far, retries included
    pub fn calls_made(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<Value, OracleError> {
        self.complete_as::<Value>(request).await
    }

    /// Complete and deserialize into `T` once the answer matches `request.shape`.
    pub async fn complete_as<T: DeserializeOwned>(
        &self,
        request: &CompletionRequest,
    ) -> Result<T, OracleError> {
        let mut state = self.policy.start();
        let mut current = request.clone();

        loop {
            let RetryState::Attempting(attempt) = state else {
                unreachable!("gateway loop only runs attempts");
            };

            self.calls.fetch_add(1, Ordering::Relaxed);
            debug!(task = %current.task, attempt = attempt, "Oracle call");

            let failure = match self.backend.send(&current).await {
                Ok(raw) => match Self::interpret::<T>(&raw, &request.shape) {
                    Ok(value) => return Ok(value),
                    Err(reason) => {
                        self.backend.rejected(&current);
                        current = CompletionRequest {
                            task: OracleTask::Repair(Box::new(request.task.clone())),
                            prompt: prompt::build_repair_prompt(&raw, &reason, &request.shape),
                            shape: request.shape.clone(),
                            settings: request.settings.clone(),
                        };
                        OracleError::Transient(format!("malformed output: {}", reason))
                    }
                },
                Err(e) => e,
            };

            state = self.policy.on_failure(state, failure.is_transient());
            match state {
                RetryState::Backoff { delay, .. } => {
                    warn!(
                        task = %request.task,
                        attempt = attempt,
                        max_retries = self.policy.max_retries(),
                        backoff_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Oracle call failed, retrying"
                    );
                    sleep(delay).await;
                    state = self.policy.after_backoff(state);
                }
                _ => {
                    warn!(
                        task = %request.task,
                        attempts = attempt,
                        error = %failure,
                        "Oracle call failed permanently"
                    );
                    return Err(failure.into_permanent());
                }
            }
        }
    }

    fn interpret<T: DeserializeOwned>(raw: &str, shape: &OutputShape) -> Result<T, String> {
        let value = parse_json_payload(raw).ok_or_else(|| "response is not valid JSON".to_string())?;
        shape.validate(&value).map_err(|e| e.to_string())?;
        serde_json::from_value(value).map_err(|e| format!("unexpected field content: {}", e))
    }
}
