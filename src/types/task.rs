//! The unit of queued, container-backed work.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_IMAGE, DEMO_RUNTIME_SECS};

/// One queued task: an externally assigned id plus the workload to run.
///
/// Tasks are immutable once created; all fields are read through accessors.
///
/// # Examples
///
/// ```
/// use cancelable_worker::Task;
///
/// let task = Task::new("17", "busybox", vec!["sleep".into(), "5".into()]);
/// assert_eq!(task.id(), "17");
/// assert_eq!(task.command(), ["sleep", "5"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    id: String,
    image: String,
    command: Vec<String>,
}

impl Task {
    /// Creates a task.
    pub fn new(id: impl Into<String>, image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            command,
        }
    }

    /// Creates the demo task: `alpine:3.14` printing a counter once per second
    /// for thirty seconds.
    ///
    /// ```
    /// use cancelable_worker::Task;
    ///
    /// let task = Task::demo("3");
    /// assert_eq!(task.image(), "alpine:3.14");
    /// assert!(task.command()[2].contains("[JobID=3]"));
    /// ```
    pub fn demo(id: impl Into<String>) -> Self {
        let id = id.into();
        let command = demo_command(&id);
        Self::new(id, DEFAULT_IMAGE, command)
    }

    /// The task identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The workload image reference.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// The workload command (argv).
    pub fn command(&self) -> &[String] {
        &self.command
    }
}

/// Shell loop used by [`Task::demo`].
pub fn demo_command(task_id: &str) -> Vec<String> {
    let script = format!(
        "start=$(date +%s); count=1; \
         while [ $(( $(date +%s) - start )) -lt {secs} ]; do \
         echo \"[JobID={task_id}] $count/{secs}\"; count=$((count + 1)); sleep 1; done",
        secs = DEMO_RUNTIME_SECS,
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}
