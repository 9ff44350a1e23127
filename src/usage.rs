use serde::{Deserialize, Serialize};

use crate::ledger::Identity;
use crate::planner::{OperationKind, OperationPlan};
use crate::types::ProcessingMode;

/// One usage-log row, written after every finished remote call.
///
/// Field names match the operation log table the usage dashboards read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// `None` for anonymous sessions.
    pub user_id: Option<String>,
    /// First operation of the plan, used as the row's headline type.
    pub operation_type: OperationKind,
    pub operations: Vec<OperationKind>,
    pub operations_count: u32,
    pub success: bool,
    pub processing_time_ms: u64,
    pub file_size: u64,
    pub model: String,
    pub mode: Option<ProcessingMode>,
    pub tool: Option<String>,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

impl UsageEvent {
    pub fn new(identity: &Identity, plan: &OperationPlan, success: bool) -> Self {
        Self {
            user_id: identity.user_id().map(str::to_string),
            operation_type: plan
                .operations()
                .first()
                .copied()
                .unwrap_or(OperationKind::BgRemoval),
            operations: plan.operations().to_vec(),
            operations_count: plan.count(),
            success,
            processing_time_ms: 0,
            file_size: 0,
            model: String::new(),
            mode: None,
            tool: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.processing_time_ms = ms;
        self
    }

    pub fn with_file_size(mut self, bytes: u64) -> Self {
        self.file_size = bytes;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, mode: Option<ProcessingMode>) -> Self {
        self.model = model.into();
        self.mode = mode;
        self
    }

    pub fn with_tool(mut self, tool: Option<String>) -> Self {
        self.tool = tool;
        self
    }
}

/// Sink for usage events (a remote log table in production).
///
/// Failures are reported back to the orchestrator, which only logs them:
/// quota that was already committed is never reversed because of a logging error.
pub trait UsageRecorder: Send + Sync + 'static {
    fn record(
        &self,
        event: &UsageEvent,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Writes usage events to the `tracing` log and nowhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageRecorder;

impl UsageRecorder for TracingUsageRecorder {
    async fn record(&self, event: &UsageEvent) -> anyhow::Result<()> {
        tracing::info!(
            user = event.user_id.as_deref().unwrap_or("anonymous"),
            operation = %event.operation_type,
            count = event.operations_count,
            success = event.success,
            duration_ms = event.processing_time_ms,
            bytes = event.file_size,
            model = %event.model,
            "usage"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetSize;

    #[test]
    fn test_event_from_plan() {
        let plan = OperationPlan::for_mode(Some(ProcessingMode::All), Some(TargetSize::new(10, 10)));
        let event = UsageEvent::new(&Identity::Authenticated("u-1".into()), &plan, false)
            .with_duration(42)
            .with_file_size(1024)
            .with_model("bria", Some(ProcessingMode::All));

        assert_eq!(event.user_id.as_deref(), Some("u-1"));
        assert_eq!(event.operation_type, OperationKind::HeadCrop);
        assert_eq!(event.operations_count, 3);
        assert!(!event.success);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operation_type"], "head_crop");
        assert_eq!(json["operations_count"], 3);
        assert_eq!(json["processing_time_ms"], 42);
        assert_eq!(json["mode"], "all");
    }

    #[tokio::test]
    async fn test_tracing_recorder_never_fails() {
        let plan = OperationPlan::for_mode(None, None);
        let event = UsageEvent::new(&Identity::Anonymous, &plan, true);
        assert!(TracingUsageRecorder.record(&event).await.is_ok());
    }
}
