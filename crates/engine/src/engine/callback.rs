//! Notifier callback that resumes a waiting instance.

use std::collections::HashMap;
use std::sync::Weak;

use async_trait::async_trait;

use super::executor::ExecutorInner;
use crate::notify::NotifyCallback;
use crate::result_ext::OptionResultExt;
use crate::state::ResponseData;

/// Resume target registered with the notifier for one WAITING instance.
///
/// Holds only identifiers; the instance is reloaded on delivery. The
/// executor reference is weak so pending waits do not keep a dropped
/// executor alive.
pub struct ResumeCallback {
    executor: Weak<ExecutorInner>,
    pub app_id: String,
    pub execution_uuid: String,
    pub state_execution_instance_id: String,
}

impl ResumeCallback {
    pub(crate) fn new(executor: Weak<ExecutorInner>, app_id: &str, execution_uuid: &str, instance_id: &str) -> Self {
        Self {
            executor,
            app_id: app_id.to_string(),
            execution_uuid: execution_uuid.to_string(),
            state_execution_instance_id: instance_id.to_string(),
        }
    }

    fn deliver(&self, responses: HashMap<String, ResponseData>, is_error: bool) {
        let Some(executor) = self.executor.upgrade().log_none(format!(
            "executor gone, notification for {} dropped",
            self.state_execution_instance_id
        )) else {
            return;
        };
        tracing::debug!(
            execution_uuid = %self.execution_uuid,
            instance_id = %self.state_execution_instance_id,
            is_error,
            "Notification received"
        );
        executor.dispatch_resume(
            self.app_id.clone(),
            self.state_execution_instance_id.clone(),
            responses,
            is_error,
        );
    }
}

impl std::fmt::Debug for ResumeCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeCallback")
            .field("app_id", &self.app_id)
            .field("execution_uuid", &self.execution_uuid)
            .field("state_execution_instance_id", &self.state_execution_instance_id)
            .finish()
    }
}

#[async_trait]
impl NotifyCallback for ResumeCallback {
    async fn notify(&self, responses: HashMap<String, ResponseData>) {
        self.deliver(responses, false);
    }

    async fn notify_error(&self, responses: HashMap<String, ResponseData>) {
        self.deliver(responses, true);
    }
}
