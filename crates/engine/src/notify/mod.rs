//! Wait-notify contract between the engine and external work.
//!
//! A waiter registers a callback over a set of correlation ids. Whoever
//! finishes the external work calls `done_with(correlation_id, response)`.
//! Once every id of a wait has a response the callback fires exactly once:
//! `notify_error` when any response is an error, `notify` otherwise.

mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::state::ResponseData;

pub use memory::{WaitNotifyEngine, DEFAULT_RETENTION};

/// Receiver of a completed wait.
#[async_trait]
pub trait NotifyCallback: Send + Sync {
    async fn notify(&self, responses: HashMap<String, ResponseData>);

    async fn notify_error(&self, responses: HashMap<String, ResponseData>);
}

#[async_trait]
pub trait WaitNotify: Send + Sync {
    /// Wait for every id; returns the wait id.
    ///
    /// With a timeout, ids still open at the deadline receive an expired
    /// error response.
    async fn wait_for_all(
        &self,
        correlation_ids: Vec<String>,
        callback: Arc<dyn NotifyCallback>,
        timeout: Option<Duration>,
    ) -> EngineResult<String>;

    /// Deliver the response for one id. Returns false when the id was
    /// already consumed.
    async fn done_with(&self, correlation_id: &str, response: ResponseData) -> EngineResult<bool>;

    /// Drop the waits covering these ids without firing their callbacks.
    /// Later responses for the ids are ignored. Returns how many waits were
    /// dropped.
    async fn cancel(&self, correlation_ids: &[String]) -> EngineResult<usize>;

    /// Register a callback for a single id.
    async fn register(&self, correlation_id: &str, callback: Arc<dyn NotifyCallback>) -> EngineResult<String> {
        self.wait_for_all(vec![correlation_id.to_string()], callback, None).await
    }
}
