//! Data model shared across the scheduler and copy engine (spec §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Caller-supplied job description. Defensively cloned by the scheduler on
/// submit (spec §3 "Lifecycle") so later mutation by the caller never
/// affects an in-flight job.
///
/// `environment` is an ordered list, not a map: insertion order is
/// irrelevant to *validity* (spec §3) but the scripting codec exports
/// variables in that order (spec §4.4 scenario 6), so the order given by
/// the caller must survive the defensive copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: Vec<(String, String)>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default = "default_tasks")]
    pub tasks: u32,
    #[serde(default)]
    pub tasks_per_node: u32,
    #[serde(default = "default_cores_per_task")]
    pub cores_per_task: u32,
    /// MiB, 0 = unset.
    #[serde(default)]
    pub max_memory: u64,
    /// MiB, 0 = unset.
    #[serde(default)]
    pub temp_space: u64,
    /// Minutes; -1 = adaptor default; 0 = invalid for script back-ends.
    #[serde(default = "default_max_runtime")]
    pub max_runtime: i64,
    #[serde(default)]
    pub scheduler_arguments: Vec<String>,
    #[serde(default)]
    pub start_per_task: bool,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_tasks() -> u32 {
    1
}
fn default_cores_per_task() -> u32 {
    1
}
fn default_max_runtime() -> i64 {
    -1
}

impl Default for JobDescription {
    fn default() -> Self {
        JobDescription {
            executable: String::new(),
            arguments: Vec::new(),
            environment: Vec::new(),
            working_directory: None,
            queue_name: None,
            stdin: None,
            stdout: None,
            stderr: None,
            tasks: default_tasks(),
            tasks_per_node: 0,
            cores_per_task: default_cores_per_task(),
            max_memory: 0,
            temp_space: 0,
            max_runtime: default_max_runtime(),
            scheduler_arguments: Vec::new(),
            start_per_task: false,
            name: None,
        }
    }
}

/// Observed job state, exactly the five states of the driver loop (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Error,
    Killed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Killed)
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Error => "ERROR",
            JobState::Killed => "KILLED",
        }
    }
}

/// Snapshot returned to callers by `getJobStatus`/`waitUntilDone` etc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_identifier: String,
    pub name: Option<String>,
    pub state: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub running: bool,
    pub done: bool,
    #[serde(default)]
    pub scheduler_specific_information: HashMap<String, String>,
}

/// Snapshot of one named queue, returned by `getQueueStatus`/
/// `getQueueStatuses` (spec §6 External interfaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_name: String,
    pub adaptor_name: String,
    /// Jobs currently registered in this queue that have not yet been
    /// harvested by a terminal status read — the same count `getJobs`
    /// would return for this one queue.
    pub job_count: usize,
    #[serde(default)]
    pub scheduler_specific_information: HashMap<String, String>,
}

/// Copy-engine lifecycle state (spec §3 "CopyStatus").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyState {
    Pending,
    Running,
    Done,
    Failed,
}

impl CopyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CopyState::Done | CopyState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyStatus {
    pub copy_identifier: String,
    pub state: CopyState,
    pub bytes_to_copy: u64,
    pub bytes_copied: u64,
    pub exception: Option<String>,
}

impl CopyStatus {
    pub fn done(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Copy mode applied per-entry during a recursive copy (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyMode {
    /// Fail if the destination already exists.
    Create,
    /// Overwrite an existing file; merge into an existing directory.
    Replace,
    /// Skip the entry when the destination already exists.
    Ignore,
}

/// POSIX-flavoured attributes returned by `getAttributes`/`list` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathAttributes {
    pub path: String,
    pub is_directory: bool,
    pub is_regular_file: bool,
    pub is_symbolic_link: bool,
    pub is_other: bool,
    pub is_hidden: bool,
    /// Milliseconds since epoch; 0 when unknown.
    pub last_modified_millis: u64,
    pub creation_millis: u64,
    pub last_access_millis: u64,
    pub size: u64,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub executable: bool,
    pub readable: bool,
    pub writable: bool,
}
