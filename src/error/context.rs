use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Context attached to failures logged by the engine, the scheduler and jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique correlation ID for following one failure through the logs
    pub correlation_id: Uuid,
    /// Component where the error occurred
    pub component: String,
    /// Operation that was being performed when the error occurred
    pub operation: String,
    /// Tenant the failing work belongs to
    pub tenant_id: Option<i64>,
    /// Process instance the failing work belongs to
    pub process_instance_id: Option<i64>,
    /// Timestamp when the error occurred
    pub timestamp: DateTime<Utc>,
    /// Additional context information as key-value pairs
    pub additional_context: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            component: component.into(),
            operation: operation.into(),
            tenant_id: None,
            process_instance_id: None,
            timestamp: Utc::now(),
            additional_context: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: i64) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_process_instance(mut self, process_instance_id: i64) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    /// Add additional context information
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.additional_context.insert(key.into(), value);
        self
    }

    /// Get a formatted string representation of the context
    pub fn format_context(&self) -> String {
        let mut extra: Vec<String> = self
            .additional_context
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        extra.sort();

        format!(
            "correlation_id={}, component={}, operation={}{}{}{}",
            self.correlation_id,
            self.component,
            self.operation,
            self.tenant_id.map(|id| format!(", tenant_id={}", id)).unwrap_or_default(),
            self.process_instance_id
                .map(|id| format!(", process_instance_id={}", id))
                .unwrap_or_default(),
            if extra.is_empty() { String::new() } else { format!(", {}", extra.join(", ")) }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_creation() {
        let context = ErrorContext::new("scheduler", "run_due_jobs");

        assert_eq!(context.component, "scheduler");
        assert_eq!(context.operation, "run_due_jobs");
        assert!(context.tenant_id.is_none());
        assert!(context.additional_context.is_empty());
    }

    #[test]
    fn test_format_context_lists_identifiers() {
        let context = ErrorContext::new("correlation", "correlate")
            .with_tenant(1)
            .with_process_instance(77)
            .with_context("message_name", serde_json::json!("order-paid"));

        let formatted = context.format_context();
        assert!(formatted.contains("component=correlation"));
        assert!(formatted.contains("tenant_id=1"));
        assert!(formatted.contains("process_instance_id=77"));
        assert!(formatted.contains("message_name=\"order-paid\""));
    }
}
