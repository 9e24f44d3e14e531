//! In-process wait-notify engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{NotifyCallback, WaitNotify};
use crate::error::{EngineError, EngineResult};
use crate::state::ResponseData;

struct WaitEntry {
    correlation_ids: Vec<String>,
    callback: Arc<dyn NotifyCallback>,
    responses: HashMap<String, ResponseData>,
}

impl WaitEntry {
    fn is_complete(&self) -> bool {
        self.correlation_ids
            .iter()
            .all(|id| self.responses.contains_key(id))
    }
}

/// How long consumed ids and unclaimed early responses are remembered.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct WaitState {
    waits: HashMap<String, WaitEntry>,
    by_correlation: HashMap<String, String>,
    /// Responses that arrived before anyone waited on them.
    early: HashMap<String, (ResponseData, Instant)>,
    consumed: HashMap<String, Instant>,
    last_pruned: Option<Instant>,
}

impl WaitState {
    fn consume(&mut self, correlation_id: &str) {
        self.consumed.insert(correlation_id.to_string(), Instant::now());
    }

    /// Forget consumed ids and early responses older than `retention`.
    fn prune(&mut self, retention: Duration) {
        let now = Instant::now();
        if self.last_pruned.is_some_and(|at| now.duration_since(at) < retention / 4) {
            return;
        }
        self.last_pruned = Some(now);
        let before = self.consumed.len() + self.early.len();
        self.consumed.retain(|_, at| now.duration_since(*at) < retention);
        self.early.retain(|_, (_, at)| now.duration_since(*at) < retention);
        let dropped = before - self.consumed.len() - self.early.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Pruned notifier bookkeeping");
        }
    }
}

/// Wait-notify engine held in memory.
///
/// Responses that arrive before the wait is registered are buffered. A
/// second response for a consumed id is ignored while the id is retained.
#[derive(Clone)]
pub struct WaitNotifyEngine {
    state: Arc<Mutex<WaitState>>,
    retention: Duration,
}

impl Default for WaitNotifyEngine {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl std::fmt::Debug for WaitNotifyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitNotifyEngine").finish_non_exhaustive()
    }
}

struct Completed {
    wait_id: String,
    callback: Arc<dyn NotifyCallback>,
    responses: HashMap<String, ResponseData>,
}

impl Completed {
    async fn fire(self) {
        let is_error = self.responses.values().any(ResponseData::is_error);
        tracing::debug!(wait_id = %self.wait_id, is_error, "Wait complete");
        if is_error {
            self.callback.notify_error(self.responses).await;
        } else {
            self.callback.notify(self.responses).await;
        }
    }
}

impl WaitNotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(WaitState::default())),
            retention,
        }
    }

    /// Correlation ids that have a waiter but no response yet.
    pub async fn pending(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .by_correlation
            .keys()
            .filter(|id| !state.consumed.contains_key(*id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn take_if_complete(state: &mut WaitState, wait_id: &str) -> Option<Completed> {
        if !state.waits.get(wait_id)?.is_complete() {
            return None;
        }
        let entry = state.waits.remove(wait_id)?;
        for id in &entry.correlation_ids {
            state.by_correlation.remove(id);
        }
        Some(Completed {
            wait_id: wait_id.to_string(),
            callback: entry.callback,
            responses: entry.responses,
        })
    }

    async fn expire(&self, wait_id: &str) {
        let completed = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.waits.get_mut(wait_id) else {
                return;
            };
            let open: Vec<String> = entry
                .correlation_ids
                .iter()
                .filter(|id| !entry.responses.contains_key(*id))
                .cloned()
                .collect();
            for id in &open {
                entry
                    .responses
                    .insert(id.clone(), ResponseData::expired(format!("No response for {} before deadline", id)));
            }
            tracing::warn!(wait_id = %wait_id, expired = ?open, "Wait timed out");
            for id in &open {
                state.consume(id);
            }
            Self::take_if_complete(&mut state, wait_id)
        };
        if let Some(completed) = completed {
            completed.fire().await;
        }
    }
}

#[async_trait]
impl WaitNotify for WaitNotifyEngine {
    async fn wait_for_all(
        &self,
        correlation_ids: Vec<String>,
        callback: Arc<dyn NotifyCallback>,
        timeout: Option<Duration>,
    ) -> EngineResult<String> {
        if correlation_ids.is_empty() {
            return Err(EngineError::Validation("wait needs at least one correlation id".to_string()));
        }
        let wait_id = Uuid::new_v4().to_string();

        let completed = {
            let mut state = self.state.lock().await;
            state.prune(self.retention);
            if let Some(id) = correlation_ids.iter().find(|id| state.by_correlation.contains_key(*id)) {
                return Err(EngineError::Conflict(format!("correlation id {} already has a waiter", id)));
            }
            let mut entry = WaitEntry {
                correlation_ids: correlation_ids.clone(),
                callback,
                responses: HashMap::new(),
            };
            for id in &correlation_ids {
                if let Some((response, _)) = state.early.remove(id) {
                    entry.responses.insert(id.clone(), response);
                    state.consume(id);
                }
                state.by_correlation.insert(id.clone(), wait_id.clone());
            }
            state.waits.insert(wait_id.clone(), entry);
            Self::take_if_complete(&mut state, &wait_id)
        };

        match completed {
            Some(completed) => completed.fire().await,
            None => {
                if let Some(timeout) = timeout {
                    let engine = self.clone();
                    let id = wait_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        engine.expire(&id).await;
                    });
                }
            }
        }
        tracing::debug!(wait_id = %wait_id, ids = ?correlation_ids, "Wait registered");
        Ok(wait_id)
    }

    async fn done_with(&self, correlation_id: &str, response: ResponseData) -> EngineResult<bool> {
        let completed = {
            let mut state = self.state.lock().await;
            state.prune(self.retention);
            if state.consumed.contains_key(correlation_id) || state.early.contains_key(correlation_id) {
                tracing::warn!(correlation_id = %correlation_id, "Duplicate response ignored");
                return Ok(false);
            }

            match state.by_correlation.get(correlation_id).cloned() {
                Some(wait_id) => {
                    state.consume(correlation_id);
                    if let Some(entry) = state.waits.get_mut(&wait_id) {
                        entry.responses.insert(correlation_id.to_string(), response);
                    }
                    Self::take_if_complete(&mut state, &wait_id)
                }
                None => {
                    state
                        .early
                        .insert(correlation_id.to_string(), (response, Instant::now()));
                    None
                }
            }
        };
        if let Some(completed) = completed {
            completed.fire().await;
        }
        Ok(true)
    }

    async fn cancel(&self, correlation_ids: &[String]) -> EngineResult<usize> {
        let mut state = self.state.lock().await;
        let mut cancelled = 0;
        for id in correlation_ids {
            if let Some(wait_id) = state.by_correlation.get(id).cloned() {
                if let Some(entry) = state.waits.remove(&wait_id) {
                    for other in &entry.correlation_ids {
                        state.by_correlation.remove(other);
                        state.consume(other);
                    }
                    cancelled += 1;
                }
            }
            state.early.remove(id);
            state.consume(id);
        }
        if cancelled > 0 {
            tracing::debug!(ids = ?correlation_ids, cancelled, "Waits cancelled");
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<(bool, HashMap<String, ResponseData>)>>,
    }

    #[async_trait]
    impl NotifyCallback for Recorder {
        async fn notify(&self, responses: HashMap<String, ResponseData>) {
            self.calls.lock().unwrap().push((false, responses));
        }

        async fn notify_error(&self, responses: HashMap<String, ResponseData>) {
            self.calls.lock().unwrap().push((true, responses));
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fires_once_all_done() {
        let engine = WaitNotifyEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine.wait_for_all(ids(&["a", "b"]), recorder.clone(), None).await.unwrap();

        assert!(engine.done_with("a", ResponseData::payload(serde_json::json!(1))).await.unwrap());
        assert!(recorder.calls.lock().unwrap().is_empty());

        engine.done_with("b", ResponseData::payload(serde_json::json!(2))).await.unwrap();
        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].0);
        assert_eq!(calls[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ignored() {
        let engine = WaitNotifyEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine.register("x", recorder.clone()).await.unwrap();

        assert!(engine.done_with("x", ResponseData::payload(serde_json::json!("ok"))).await.unwrap());
        assert!(!engine.done_with("x", ResponseData::payload(serde_json::json!("ok"))).await.unwrap());
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_early_response_buffered() {
        let engine = WaitNotifyEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine.done_with("x", ResponseData::error("boom")).await.unwrap();
        engine.register("x", recorder.clone()).await.unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires_open_ids() {
        let engine = WaitNotifyEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine
            .wait_for_all(ids(&["a", "b"]), recorder.clone(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        engine.done_with("a", ResponseData::payload(serde_json::json!(1))).await.unwrap();
        assert_eq!(engine.pending().await, vec!["b".to_string()]);

        tokio::time::sleep(Duration::from_secs(61)).await;

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0);
        assert!(calls[0].1["b"].is_error());
        assert!(!calls[0].1["a"].is_error());
        drop(calls);
        assert!(!engine.done_with("b", ResponseData::payload(serde_json::json!(2))).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_drops_wait_and_ignores_late_response() {
        let engine = WaitNotifyEngine::new();
        let recorder = Arc::new(Recorder::default());
        engine.wait_for_all(ids(&["a", "b"]), recorder.clone(), None).await.unwrap();

        assert_eq!(engine.cancel(&ids(&["a"])).await.unwrap(), 1);
        assert!(engine.pending().await.is_empty());
        assert!(engine.state.lock().await.waits.is_empty());

        assert!(!engine.done_with("b", ResponseData::payload(serde_json::json!(1))).await.unwrap());
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert_eq!(engine.cancel(&ids(&["a"])).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bookkeeping_pruned_after_retention() {
        let engine = WaitNotifyEngine::with_retention(Duration::from_secs(60));
        let recorder = Arc::new(Recorder::default());
        engine.register("x", recorder.clone()).await.unwrap();
        engine.done_with("x", ResponseData::payload(serde_json::json!(1))).await.unwrap();
        engine.done_with("orphan", ResponseData::payload(serde_json::json!(2))).await.unwrap();
        {
            let state = engine.state.lock().await;
            assert_eq!(state.consumed.len(), 1);
            assert_eq!(state.early.len(), 1);
        }

        // still remembered inside the window
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!engine.done_with("x", ResponseData::payload(serde_json::json!(1))).await.unwrap());

        tokio::time::sleep(Duration::from_secs(61)).await;
        engine.register("y", recorder.clone()).await.unwrap();
        let state = engine.state.lock().await;
        assert!(state.consumed.is_empty());
        assert!(state.early.is_empty());
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_waiter_rejected() {
        let engine = WaitNotifyEngine::new();
        engine.register("x", Arc::new(Recorder::default())).await.unwrap();
        let result = engine.register("x", Arc::new(Recorder::default())).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }
}
