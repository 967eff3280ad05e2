//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::codebook::{
    Code, CodeTaxonomy, DiscoveredSchemas, EntityRelationshipSchema, EntityType,
    PropertyDefinition, PropertyType, RelationshipType, SpeakerPropertySchema,
};
use crate::error::OracleError;
use crate::llm::{CompletionBackend, CompletionRequest, OracleTask};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<String, OracleError> + Send + Sync>;

enum Script {
    Sequence(Mutex<VecDeque<Result<String, OracleError>>>),
    Responder(Responder),
}

/// Backend answering from a fixed sequence or a closure, recording every request.
pub struct ScriptedBackend {
    script: Script,
    delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn sequence(responses: Vec<Result<String, OracleError>>) -> Self {
        Self::build(Script::Sequence(Mutex::new(responses.into())))
    }

    pub fn responder<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, OracleError> + Send + Sync + 'static,
    {
        Self::build(Script::Responder(Box::new(f)))
    }

    fn build(script: Script) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn tasks(&self) -> Vec<OracleTask> {
        self.requests.lock().unwrap().iter().map(|r| r.task.clone()).collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.prompt.clone()).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn send(&self, request: &CompletionRequest) -> Result<String, OracleError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let response = match &self.script {
            Script::Sequence(queue) => queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(OracleError::Permanent("script exhausted".to_string()))),
            Script::Responder(f) => f(request),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

/// Two-level codebook (WORK > PAY, HEALTH), a nurse/doctor role and WORKS_FOR.
pub fn sample_schemas() -> DiscoveredSchemas {
    let mut warnings = Vec::new();
    let code = |id: &str, parent: Option<&str>| Code {
        id: id.to_string(),
        name: id.to_lowercase(),
        description: String::new(),
        level: 0,
        parent_id: parent.map(str::to_string),
    };
    DiscoveredSchemas {
        taxonomy: CodeTaxonomy::build(
            vec![code("WORK", None), code("PAY", Some("WORK")), code("HEALTH", None)],
            2,
            &mut warnings,
        ),
        speaker_schema: SpeakerPropertySchema::build(
            vec![
                PropertyDefinition {
                    name: "role".to_string(),
                    property_type: PropertyType::Categorical,
                    description: String::new(),
                    possible_values: Some(vec!["Nurse".to_string(), "Doctor".to_string()]),
                },
                PropertyDefinition {
                    name: "years".to_string(),
                    property_type: PropertyType::Numeric,
                    description: String::new(),
                    possible_values: None,
                },
            ],
            &mut warnings,
        ),
        entity_schema: EntityRelationshipSchema::build(
            vec![
                EntityType { name: "Person".to_string(), description: String::new() },
                EntityType { name: "Organization".to_string(), description: String::new() },
            ],
            vec![RelationshipType {
                name: "WORKS_FOR".to_string(),
                description: String::new(),
                source_types: vec!["Person".to_string()],
                target_types: vec!["Organization".to_string()],
            }],
            &mut warnings,
        ),
    }
}
