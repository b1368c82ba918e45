use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Unchanged,
    Changed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
}

/// Ordered per-task outcome of one playbook run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayReport {
    pub tasks: Vec<TaskResult>,
}

impl PlayReport {
    pub fn succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.status != TaskStatus::Failed)
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.name.as_str())
            .collect()
    }

    /// A failed task aborts the enclosing operation; the playbooks are
    /// idempotent, so the caller may safely re-invoke after fixing the cause.
    pub fn ensure_ok(&self, playbook: &str) -> Result<(), VmError> {
        if self.succeeded() {
            return Ok(());
        }
        Err(VmError::Driver(format!(
            "playbook {playbook} failed at: {}",
            self.failed_tasks().join(", ")
        )))
    }

    /// Parse the output of ansible's JSON stdout callback for a single host.
    pub fn from_callback_json(raw: &str, host: &str) -> Result<PlayReport, VmError> {
        let callback: Callback = serde_json::from_str(raw)
            .map_err(|e| VmError::Driver(format!("unparseable ansible output: {e}")))?;
        let mut report = PlayReport::default();
        for play in callback.plays {
            for task in play.tasks {
                let Some(result) = task.hosts.get(host) else {
                    continue;
                };
                let status = if result.failed || result.unreachable {
                    TaskStatus::Failed
                } else if result.changed {
                    TaskStatus::Changed
                } else {
                    TaskStatus::Unchanged
                };
                report.tasks.push(TaskResult {
                    name: task.task.name,
                    status,
                });
            }
        }
        Ok(report)
    }

    /// First captured stdout for the host, for ad-hoc command runs.
    pub fn first_stdout(raw: &str, host: &str) -> Result<String, VmError> {
        let callback: Callback = serde_json::from_str(raw)
            .map_err(|e| VmError::Driver(format!("unparseable ansible output: {e}")))?;
        for play in callback.plays {
            for task in play.tasks {
                if let Some(result) = task.hosts.get(host) {
                    if let Some(stdout) = &result.stdout {
                        return Ok(stdout.clone());
                    }
                }
            }
        }
        Ok(String::new())
    }
}

#[derive(Deserialize)]
struct Callback {
    plays: Vec<Play>,
}

#[derive(Deserialize)]
struct Play {
    tasks: Vec<TaskEntry>,
}

#[derive(Deserialize)]
struct TaskEntry {
    task: TaskMeta,
    hosts: HashMap<String, HostResult>,
}

#[derive(Deserialize)]
struct TaskMeta {
    name: String,
}

#[derive(Deserialize)]
struct HostResult {
    #[serde(default)]
    changed: bool,
    #[serde(default)]
    failed: bool,
    #[serde(default)]
    unreachable: bool,
    #[serde(default)]
    stdout: Option<String>,
}
