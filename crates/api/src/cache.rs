use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use extract::{CompletionBackend, CompletionRequest, OracleError, OracleTask};

/// Raw oracle responses keyed by a hash of model, temperature and prompt.
pub struct ResponseCache {
    responses: DashMap<String, String>,
    max_entries: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            responses: DashMap::new(),
            max_entries,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn key(request: &CompletionRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.settings.model.as_bytes());
        hasher.update(request.settings.temperature.to_le_bytes());
        hasher.update(request.prompt.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.responses.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, response: String) {
        if self.max_entries == 0 {
            return;
        }
        if self.responses.len() >= self.max_entries {
            // Simple eviction: clear 25% when full
            let to_remove: Vec<_> = self
                .responses
                .iter()
                .take((self.max_entries / 4).max(1))
                .map(|r| r.key().clone())
                .collect();
            for key in to_remove {
                self.responses.remove(&key);
            }
        }
        self.responses.insert(key, response);
    }

    pub fn remove(&self, key: &str) {
        self.responses.remove(key);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.responses.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Serves repeated prompts from the cache. Failed calls and repair prompts are never
/// stored, and an answer the gateway rejects is evicted.
pub struct CachingBackend {
    inner: Arc<dyn CompletionBackend>,
    cache: Arc<ResponseCache>,
}

impl CachingBackend {
    pub fn new(inner: Arc<dyn CompletionBackend>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl CompletionBackend for CachingBackend {
    async fn send(&self, request: &CompletionRequest) -> Result<String, OracleError> {
        let key = ResponseCache::key(request);
        if let Some(cached) = self.cache.get(&key) {
            debug!(task = %request.task, "Oracle response served from cache");
            return Ok(cached);
        }

        let response = self.inner.send(request).await?;
        if !matches!(request.task, OracleTask::Repair(_)) {
            self.cache.insert(key, response.clone());
        }
        Ok(response)
    }

    fn rejected(&self, request: &CompletionRequest) {
        self.cache.remove(&ResponseCache::key(request));
        self.inner.rejected(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::shape::OutputShape;
    use extract::{ModelSettings, RetryPolicy, TextCompletionGateway};
    use std::sync::Mutex;

    struct CountingBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CompletionBackend for CountingBackend {
        async fn send(&self, request: &CompletionRequest) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OracleError::Transient("503".to_string()));
            }
            Ok(format!("answer to {}", request.prompt))
        }
    }

    fn request(prompt: &str, temperature: f32) -> CompletionRequest {
        CompletionRequest {
            task: OracleTask::CodeDiscovery,
            prompt: prompt.to_string(),
            shape: OutputShape::Any,
            settings: ModelSettings::with_temperature(temperature),
        }
    }

    #[tokio::test]
    async fn test_repeated_prompt_is_cached() {
        let inner = Arc::new(CountingBackend { calls: AtomicUsize::new(0), fail: false });
        let cache = Arc::new(ResponseCache::new(100));
        let backend = CachingBackend::new(inner.clone(), cache.clone());

        assert_eq!(backend.send(&request("p", 0.1)).await.unwrap(), "answer to p");
        assert_eq!(backend.send(&request("p", 0.1)).await.unwrap(), "answer to p");
        // Different temperature is a different key
        backend.send(&request("p", 0.4)).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (2, 1, 2));
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let inner = Arc::new(CountingBackend { calls: AtomicUsize::new(0), fail: true });
        let cache = Arc::new(ResponseCache::new(100));
        let backend = CachingBackend::new(inner.clone(), cache.clone());

        assert!(backend.send(&request("p", 0.1)).await.is_err());
        assert!(backend.send(&request("p", 0.1)).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    /// Answers with malformed text a fixed number of times, then valid JSON.
    struct FlakyBackend {
        malformed: Mutex<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for FlakyBackend {
        async fn send(&self, _request: &CompletionRequest) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut remaining = self.malformed.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok("oops".to_string());
            }
            Ok(r#"{"codes": []}"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_rejected_answers_do_not_block_retries() {
        let inner = Arc::new(FlakyBackend { malformed: Mutex::new(2), calls: AtomicUsize::new(0) });
        let cache = Arc::new(ResponseCache::new(100));
        let backend = Arc::new(CachingBackend::new(inner.clone(), cache.clone()));
        let gateway = TextCompletionGateway::new(backend, RetryPolicy::new(3, 1, 2));

        let value = gateway.complete(&request("discover", 0.1)).await.unwrap();

        assert_eq!(value["codes"], serde_json::json!([]));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        // Only the original prompt is cached, never its malformed first answer
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.get(&ResponseCache::key(&request("discover", 0.1))).is_none());
    }

    #[test]
    fn test_eviction_keeps_cache_bounded() {
        let cache = ResponseCache::new(4);
        for i in 0..10 {
            cache.insert(format!("k{}", i), "v".to_string());
        }
        assert!(cache.stats().entries <= 4);
    }
}
