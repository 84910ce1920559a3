//! Process instances and the append-only event log.
//!
//! The log is the truth: every instance mutation happens through
//! [`ProcessInstance::apply`], and [`rebuild_from_log`] folds the same
//! events back into the same state. The stored instance is a derived
//! materialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "COMPENSATING")]
    Compensating,
    #[serde(rename = "COMPENSATED")]
    Compensated,
    #[serde(rename = "PAUSED")]
    Paused,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::New => "NEW",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Succeeded => "SUCCEEDED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Compensating => "COMPENSATING",
            ProcessStatus::Compensated => "COMPENSATED",
            ProcessStatus::Paused => "PAUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(ProcessStatus::New),
            "RUNNING" => Some(ProcessStatus::Running),
            "SUCCEEDED" => Some(ProcessStatus::Succeeded),
            "FAILED" => Some(ProcessStatus::Failed),
            "COMPENSATING" => Some(ProcessStatus::Compensating),
            "COMPENSATED" => Some(ProcessStatus::Compensated),
            "PAUSED" => Some(ProcessStatus::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Succeeded | ProcessStatus::Failed | ProcessStatus::Compensated
        )
    }
}

/// Events recorded in `process_log`. `seq` ordering defines the truth of
/// what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ProcessEvent {
    ProcessStarted {
        process_type: String,
        business_key: String,
        initial_data: Value,
    },
    StepScheduled {
        step: String,
        command_id: Uuid,
        attempt: i32,
    },
    StepCompleted {
        step: String,
        data: Value,
    },
    StepFailed {
        step: String,
        error: String,
        retrying: bool,
    },
    CompensationScheduled {
        step: String,
        compensation: String,
        command_id: Uuid,
    },
    CompensationCompleted {
        step: String,
        compensation: String,
    },
    CompensationFailed {
        step: String,
        compensation: String,
        error: String,
    },
    ProcessPaused,
    ProcessResumed,
    ProcessEnded {
        status: ProcessStatus,
    },
}

/// One `process_log` row.
#[derive(Debug, Clone)]
pub struct ProcessLogEntry {
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub event: ProcessEvent,
}

/// A persisted process instance.
#[derive(Debug, Clone)]
pub struct ProcessInstance {
    pub process_id: Uuid,
    pub process_type: String,
    pub business_key: String,
    pub status: ProcessStatus,
    pub current_step: String,
    pub data: Value,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Equality over the semantic state; timestamps are bookkeeping and cannot
/// be rebuilt from the log.
impl PartialEq for ProcessInstance {
    fn eq(&self, other: &Self) -> bool {
        self.process_id == other.process_id
            && self.process_type == other.process_type
            && self.business_key == other.business_key
            && self.status == other.status
            && self.current_step == other.current_step
            && self.data == other.data
            && self.retries == other.retries
    }
}

impl ProcessInstance {
    pub fn new(
        process_id: Uuid,
        process_type: impl Into<String>,
        business_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_id,
            process_type: process_type.into(),
            business_key: business_key.into(),
            status: ProcessStatus::New,
            current_step: String::new(),
            data: Value::Null,
            retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold one event into the instance. The manager and
    /// [`rebuild_from_log`] share this, which is what makes replay yield
    /// the stored state.
    pub fn apply(&mut self, event: &ProcessEvent) {
        match event {
            ProcessEvent::ProcessStarted { initial_data, .. } => {
                self.status = ProcessStatus::Running;
                self.data = initial_data.clone();
                self.retries = 0;
            }
            ProcessEvent::StepScheduled { step, attempt, .. } => {
                self.current_step = step.clone();
                self.retries = *attempt;
            }
            ProcessEvent::StepCompleted { data, .. } => {
                merge_data(&mut self.data, data);
            }
            ProcessEvent::StepFailed { .. } => {
                // consequences are recorded by the events that follow
            }
            ProcessEvent::CompensationScheduled { compensation, .. } => {
                self.status = ProcessStatus::Compensating;
                self.current_step = compensation.clone();
            }
            ProcessEvent::CompensationCompleted { .. } => {}
            ProcessEvent::CompensationFailed { .. } => {}
            ProcessEvent::ProcessPaused => {
                self.status = ProcessStatus::Paused;
            }
            ProcessEvent::ProcessResumed => {
                self.status = ProcessStatus::Running;
            }
            ProcessEvent::ProcessEnded { status } => {
                self.status = *status;
            }
        }
    }
}

/// Merge a step result into the instance data, key by key.
pub fn merge_data(into: &mut Value, from: &Value) {
    match (into, from) {
        (into @ Value::Null, from) => *into = from.clone(),
        (Value::Object(into), Value::Object(from)) => {
            for (k, v) in from {
                into.insert(k.clone(), v.clone());
            }
        }
        _ => {}
    }
}

/// Replay a log into an instance. Returns `None` when the log does not
/// begin with `ProcessStarted`.
pub fn rebuild_from_log(process_id: Uuid, entries: &[ProcessLogEntry]) -> Option<ProcessInstance> {
    let first = entries.first()?;
    let ProcessEvent::ProcessStarted {
        process_type,
        business_key,
        ..
    } = &first.event
    else {
        return None;
    };

    let mut instance = ProcessInstance::new(process_id, process_type, business_key);
    for entry in entries {
        instance.apply(&entry.event);
    }
    Some(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(seq: i64, event: ProcessEvent) -> ProcessLogEntry {
        ProcessLogEntry {
            seq,
            at: Utc::now(),
            event,
        }
    }

    #[test]
    fn test_replay_reaches_succeeded() {
        let pid = Uuid::new_v4();
        let cmd = Uuid::new_v4();
        let log = vec![
            entry(
                1,
                ProcessEvent::ProcessStarted {
                    process_type: "SimplePayment".to_string(),
                    business_key: "pay-1".to_string(),
                    initial_data: json!({"amount": 100}),
                },
            ),
            entry(
                2,
                ProcessEvent::StepScheduled {
                    step: "BookLimits".to_string(),
                    command_id: cmd,
                    attempt: 0,
                },
            ),
            entry(
                3,
                ProcessEvent::StepCompleted {
                    step: "BookLimits".to_string(),
                    data: json!({"limitId": "L1"}),
                },
            ),
            entry(4, ProcessEvent::ProcessEnded { status: ProcessStatus::Succeeded }),
        ];

        let instance = rebuild_from_log(pid, &log).unwrap();
        assert_eq!(instance.status, ProcessStatus::Succeeded);
        assert_eq!(instance.current_step, "BookLimits");
        assert_eq!(instance.data, json!({"amount": 100, "limitId": "L1"}));
        assert_eq!(instance.retries, 0);
    }

    #[test]
    fn test_replay_tracks_retries_per_step() {
        let pid = Uuid::new_v4();
        let log = vec![
            entry(
                1,
                ProcessEvent::ProcessStarted {
                    process_type: "P".to_string(),
                    business_key: "k".to_string(),
                    initial_data: json!({}),
                },
            ),
            entry(
                2,
                ProcessEvent::StepScheduled {
                    step: "A".to_string(),
                    command_id: Uuid::new_v4(),
                    attempt: 0,
                },
            ),
            entry(
                3,
                ProcessEvent::StepFailed {
                    step: "A".to_string(),
                    error: "timeout".to_string(),
                    retrying: true,
                },
            ),
            entry(
                4,
                ProcessEvent::StepScheduled {
                    step: "A".to_string(),
                    command_id: Uuid::new_v4(),
                    attempt: 1,
                },
            ),
            entry(
                5,
                ProcessEvent::StepCompleted {
                    step: "A".to_string(),
                    data: json!({}),
                },
            ),
            entry(
                6,
                ProcessEvent::StepScheduled {
                    step: "B".to_string(),
                    command_id: Uuid::new_v4(),
                    attempt: 0,
                },
            ),
        ];

        let instance = rebuild_from_log(pid, &log).unwrap();
        assert_eq!(instance.current_step, "B");
        // the counter resets when the next step schedules
        assert_eq!(instance.retries, 0);
        assert_eq!(instance.status, ProcessStatus::Running);
    }

    #[test]
    fn test_replay_compensation_path() {
        let pid = Uuid::new_v4();
        let log = vec![
            entry(
                1,
                ProcessEvent::ProcessStarted {
                    process_type: "P".to_string(),
                    business_key: "k".to_string(),
                    initial_data: json!({}),
                },
            ),
            entry(
                2,
                ProcessEvent::StepScheduled {
                    step: "A".to_string(),
                    command_id: Uuid::new_v4(),
                    attempt: 0,
                },
            ),
            entry(
                3,
                ProcessEvent::StepFailed {
                    step: "A".to_string(),
                    error: "boom".to_string(),
                    retrying: false,
                },
            ),
            entry(
                4,
                ProcessEvent::CompensationScheduled {
                    step: "Prior".to_string(),
                    compensation: "UndoPrior".to_string(),
                    command_id: Uuid::new_v4(),
                },
            ),
            entry(
                5,
                ProcessEvent::CompensationCompleted {
                    step: "Prior".to_string(),
                    compensation: "UndoPrior".to_string(),
                },
            ),
            entry(6, ProcessEvent::ProcessEnded { status: ProcessStatus::Compensated }),
        ];

        let instance = rebuild_from_log(pid, &log).unwrap();
        assert_eq!(instance.status, ProcessStatus::Compensated);
        assert_eq!(instance.current_step, "UndoPrior");
    }

    #[test]
    fn test_rebuild_requires_process_started_first() {
        let pid = Uuid::new_v4();
        let log = vec![entry(
            1,
            ProcessEvent::StepCompleted {
                step: "A".to_string(),
                data: json!({}),
            },
        )];
        assert!(rebuild_from_log(pid, &log).is_none());
        assert!(rebuild_from_log(pid, &[]).is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let event = ProcessEvent::StepScheduled {
            step: "BookLimits".to_string(),
            command_id: Uuid::new_v4(),
            attempt: 0,
        };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"type\":\"StepScheduled\""));
        assert!(text.contains("\"commandId\""));

        let back: ProcessEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }
}
