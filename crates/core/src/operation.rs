//! Operation record model - the persisted status of one async operation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{OperationId, TaskHandle};
use crate::Time;

/// Operation status.
///
/// `Running` is the only non-terminal value. A record leaves it at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// The execution context has been launched and has not reported yet
    Running,
    /// The runner could not get to the work (unknown function, unreachable payload)
    RunnerFailed,
    /// The work ran and failed, including rejection of its input
    TaskFailed,
    /// The work returned a result
    Succeeded,
}

impl OperationStatus {
    /// All status values, in lifecycle order.
    pub const ALL: [OperationStatus; 4] = [
        OperationStatus::Running,
        OperationStatus::RunnerFailed,
        OperationStatus::TaskFailed,
        OperationStatus::Succeeded,
    ];

    /// Whether no further mutation may follow.
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Running)
    }

    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Running => "RUNNING",
            OperationStatus::RunnerFailed => "RUNNER_FAILED",
            OperationStatus::TaskFailed => "TASK_FAILED",
            OperationStatus::Succeeded => "SUCCEEDED",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation status: {0}")]
pub struct ParseStatusError(pub String);

impl std::str::FromStr for OperationStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The record already holds a terminal status
    #[error("operation {id} already finished with status {status}")]
    AlreadyTerminal {
        /// Operation ID
        id: OperationId,
        /// Status currently stored
        status: OperationStatus,
    },

    /// The requested status is not terminal
    #[error("cannot transition operation {id} to non-terminal status {status}")]
    NotTerminal {
        /// Operation ID
        id: OperationId,
        /// Requested status
        status: OperationStatus,
    },
}

/// Persisted status/result entry for one async operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Unique operation ID
    pub id: OperationId,
    /// Current status
    pub status: OperationStatus,
    /// Result or error description, JSON-encoded on the wire
    #[serde(with = "json_string")]
    pub output: Option<serde_json::Value>,
    /// Execution context running this operation
    pub task_handle: TaskHandle,
    /// Free text
    pub description: String,
    /// Caller supplied category
    pub operation_type: String,
    /// Creation timestamp
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Time,
    /// Last write timestamp
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Time,
}

impl OperationRecord {
    /// Create a new record in the `Running` state.
    pub fn new(
        id: OperationId,
        task_handle: TaskHandle,
        description: impl Into<String>,
        operation_type: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            status: OperationStatus::Running,
            output: None,
            task_handle,
            description: description.into(),
            operation_type: operation_type.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record holds a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Error message of a failed operation.
    pub fn error_message(&self) -> Option<&str> {
        match self.status {
            OperationStatus::RunnerFailed | OperationStatus::TaskFailed => self
                .output
                .as_ref()
                .and_then(|output| output.get("message"))
                .and_then(|message| message.as_str()),
            _ => None,
        }
    }

    /// Apply the single terminal write.
    ///
    /// Status and output change together and `updated_at` moves strictly
    /// forward, even when the clock has not advanced a full millisecond.
    pub fn finish(
        &mut self,
        status: OperationStatus,
        output: serde_json::Value,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        if !status.is_terminal() {
            return Err(TransitionError::NotTerminal { id: self.id, status });
        }

        self.status = status;
        self.output = Some(output);
        self.updated_at = self.next_update_time();
        Ok(())
    }

    /// Timestamp for the next write.
    pub fn next_update_time(&self) -> Time {
        let floor = self.updated_at.max(self.created_at) + chrono::Duration::milliseconds(1);
        now_millis().max(floor)
    }
}

/// Build the output document for a failed operation.
pub fn failure_output(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "message": message.into() })
}

/// Current time truncated to millisecond precision.
pub fn now_millis() -> Time {
    let now = chrono::Utc::now();
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Filter for listing operations.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Filter by status
    pub status: Option<OperationStatus>,
    /// Filter by operation type
    pub operation_type: Option<String>,
    /// Maximum results to return
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Whether a record passes the status and type filters.
    pub fn matches(&self, record: &OperationRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(operation_type) = &self.operation_type {
            if &record.operation_type != operation_type {
                return false;
            }
        }
        true
    }

    /// Filter, sort newest first and truncate.
    pub fn apply(&self, records: impl IntoIterator<Item = OperationRecord>) -> Vec<OperationRecord> {
        let mut results: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

/// Serde adapter storing a JSON value as its encoded string.
mod json_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<serde_json::Value>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => {
                let encoded = serde_json::to_string(value).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<serde_json::Value>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| serde_json::from_str(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_record() -> OperationRecord {
        OperationRecord::new(OperationId::new(), TaskHandle::new(), "Some description", "ES Index")
    }

    #[test]
    fn test_new_record_is_running_without_output() {
        let record = running_record();
        assert_eq!(record.status, OperationStatus::Running);
        assert!(record.output.is_none());
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_finish_sets_status_and_output_together() {
        let mut record = running_record();
        record.finish(OperationStatus::Succeeded, json!([1, 2, 3])).unwrap();

        assert_eq!(record.status, OperationStatus::Succeeded);
        assert_eq!(record.output, Some(json!([1, 2, 3])));
        assert!(record.updated_at > record.created_at);
    }

    #[test]
    fn test_finish_only_once() {
        let mut record = running_record();
        record
            .finish(OperationStatus::TaskFailed, failure_output("triggered failure"))
            .unwrap();
        let snapshot = record.clone();

        let err = record
            .finish(OperationStatus::Succeeded, json!({}))
            .unwrap_err();
        assert!(matches!(err, TransitionError::AlreadyTerminal { status: OperationStatus::TaskFailed, .. }));
        assert_eq!(record, snapshot);
    }

    #[test]
    fn test_finish_rejects_running() {
        let mut record = running_record();
        let err = record.finish(OperationStatus::Running, json!(null)).unwrap_err();
        assert!(matches!(err, TransitionError::NotTerminal { .. }));
        assert_eq!(record.status, OperationStatus::Running);
    }

    #[test]
    fn test_update_time_moves_forward_when_clock_is_ahead_of_now() {
        let mut record = running_record();
        record.created_at = now_millis() + chrono::Duration::seconds(5);
        record.updated_at = record.created_at;

        record.finish(OperationStatus::Succeeded, json!(true)).unwrap();
        assert_eq!(
            record.updated_at,
            record.created_at + chrono::Duration::milliseconds(1)
        );
    }

    #[test]
    fn test_wire_format() {
        let mut record = running_record();
        let running = serde_json::to_value(&record).unwrap();
        assert_eq!(running["status"], "RUNNING");
        assert!(running["output"].is_null());
        assert!(running["createdAt"].is_i64());
        assert_eq!(running["operationType"], "ES Index");

        record
            .finish(OperationStatus::RunnerFailed, failure_output("Function not found: nope"))
            .unwrap();
        let finished = serde_json::to_value(&record).unwrap();
        assert_eq!(finished["status"], "RUNNER_FAILED");
        let output: serde_json::Value =
            serde_json::from_str(finished["output"].as_str().unwrap()).unwrap();
        assert_eq!(output["message"], "Function not found: nope");

        let decoded: OperationRecord = serde_json::from_value(finished).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.error_message(), Some("Function not found: nope"));
    }

    #[test]
    fn test_status_strings() {
        for status in OperationStatus::ALL {
            assert_eq!(status.to_string().parse::<OperationStatus>().unwrap(), status);
        }
        assert!("running".parse::<OperationStatus>().is_err());
        assert!("CANCELLED".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn test_filter_orders_newest_first() {
        let mut older = running_record();
        older.created_at = older.created_at - chrono::Duration::seconds(10);
        let mut failed = running_record();
        failed
            .finish(OperationStatus::TaskFailed, failure_output("boom"))
            .unwrap();
        let mut other_type = running_record();
        other_type.operation_type = "Bulk Delete".to_string();

        let all = vec![older.clone(), failed.clone(), other_type.clone()];

        let running = RecordFilter {
            status: Some(OperationStatus::Running),
            operation_type: Some("ES Index".to_string()),
            limit: None,
        }
        .apply(all.clone());
        assert_eq!(running, vec![older.clone()]);

        let limited = RecordFilter { limit: Some(2), ..Default::default() }.apply(all);
        assert_eq!(limited.len(), 2);
        assert!(limited.iter().all(|r| r.id != older.id));
    }
}
