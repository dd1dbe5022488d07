//! Local job-queue engine (spec §4.1 C6): three named queues — `single`
//! (one worker), `multi` (N workers), `unlimited` (unbounded) — multiplexing
//! submissions over bounded worker pools.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::job::{JobDescription, JobStatus, QueueStatus};
use crate::process::{ProcessFactory, Streams};

pub const QUEUE_SINGLE: &str = "single";
pub const QUEUE_MULTI: &str = "multi";
pub const QUEUE_UNLIMITED: &str = "unlimited";
pub const DEFAULT_QUEUE: &str = QUEUE_SINGLE;

fn known_queue(name: &str) -> bool {
    matches!(name, QUEUE_SINGLE | QUEUE_MULTI | QUEUE_UNLIMITED)
}

struct Queue {
    name: &'static str,
    semaphore: Option<Arc<Semaphore>>,
    /// Insertion-ordered; mutated only on the submission/cleanup path
    /// (spec §5 "shared-resource policy").
    executors: Mutex<Vec<(String, Executor)>>,
}

impl Queue {
    fn new(name: &'static str, semaphore: Option<Arc<Semaphore>>) -> Self {
        Queue {
            name,
            semaphore,
            executors: Mutex::new(Vec::new()),
        }
    }

    async fn push(&self, id: String, exec: Executor) {
        self.executors.lock().await.push((id, exec));
    }

    async fn remove(&self, id: &str) -> Option<Executor> {
        let mut list = self.executors.lock().await;
        if let Some(pos) = list.iter().position(|(jid, _)| jid == id) {
            Some(list.remove(pos).1)
        } else {
            None
        }
    }

    async fn find(&self, id: &str) -> Option<Executor> {
        self.executors
            .lock()
            .await
            .iter()
            .find(|(jid, _)| jid == id)
            .map(|(_, e)| e.clone())
    }

    async fn ids(&self) -> Vec<String> {
        self.executors.lock().await.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// A local job-queue scheduler, driving `tokio::process`-backed jobs
/// through `JobExecutor` state machines.
pub struct JobQueueScheduler {
    adaptor_name: String,
    fs_root: PathBuf,
    factory: Arc<dyn ProcessFactory>,
    polling_delay: Duration,
    counter: AtomicU64,
    queues: HashMap<&'static str, Queue>,
    open: AtomicBool,
}

impl JobQueueScheduler {
    /// `multi_workers` must be ≥ 1; `polling_delay` must lie in
    /// `[100, 60000]` ms (spec §4.1), checked via [`crate::config::XenonConfig::validate`]
    /// by the caller before construction.
    pub fn new(
        adaptor_name: impl Into<String>,
        fs_root: PathBuf,
        factory: Arc<dyn ProcessFactory>,
        multi_workers: usize,
        polling_delay: Duration,
    ) -> Result<Self> {
        let adaptor_name = adaptor_name.into();
        if !(crate::config::MIN_POLLING_DELAY_MS..=crate::config::MAX_POLLING_DELAY_MS)
            .contains(&(polling_delay.as_millis() as u64))
        {
            return Err(Error::bad_parameter(&adaptor_name, "polling delay out of bounds"));
        }
        if multi_workers < 1 {
            return Err(Error::bad_parameter(&adaptor_name, "multi queue needs at least one worker"));
        }

        let mut queues = HashMap::new();
        queues.insert(QUEUE_SINGLE, Queue::new(QUEUE_SINGLE, Some(Arc::new(Semaphore::new(1)))));
        queues.insert(QUEUE_MULTI, Queue::new(QUEUE_MULTI, Some(Arc::new(Semaphore::new(multi_workers)))));
        queues.insert(QUEUE_UNLIMITED, Queue::new(QUEUE_UNLIMITED, None));

        Ok(JobQueueScheduler {
            adaptor_name,
            fs_root,
            factory,
            polling_delay,
            counter: AtomicU64::new(0),
            queues,
            open: AtomicBool::new(true),
        })
    }

    pub fn adaptor_name(&self) -> &str {
        &self.adaptor_name
    }

    pub fn queue_names(&self) -> Vec<&'static str> {
        vec![QUEUE_SINGLE, QUEUE_MULTI, QUEUE_UNLIMITED]
    }

    pub fn default_queue_name(&self) -> &'static str {
        DEFAULT_QUEUE
    }

    pub fn default_runtime_minutes(&self) -> i64 {
        -1
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::bad_parameter(&self.adaptor_name, "scheduler is closed"));
        }
        Ok(())
    }

    fn resolve_queue_name(desc: &JobDescription) -> String {
        desc.queue_name.clone().unwrap_or_else(|| DEFAULT_QUEUE.to_string())
    }

    fn validate_common(&self, desc: &JobDescription) -> Result<()> {
        if desc.executable.is_empty() {
            return Err(Error::incomplete_job_description(&self.adaptor_name, "executable is required"));
        }
        if !known_queue(&Self::resolve_queue_name(desc)) {
            return Err(Error::no_such_queue(
                &self.adaptor_name,
                format!("unknown queue '{}'", Self::resolve_queue_name(desc)),
            ));
        }
        if desc.tasks != 1 {
            return Err(Error::invalid_job_description(&self.adaptor_name, "tasks must equal 1"));
        }
        if desc.tasks_per_node > 1 {
            return Err(Error::invalid_job_description(&self.adaptor_name, "tasksPerNode must be <= 1"));
        }
        if desc.max_runtime < -1 {
            return Err(Error::invalid_job_description(&self.adaptor_name, "maxRuntime must be >= -1"));
        }
        Ok(())
    }

    fn validate_interactive(&self, desc: &JobDescription) -> Result<()> {
        if desc.stdin.is_some() {
            return Err(Error::invalid_job_description(
                &self.adaptor_name,
                "interactive jobs cannot redirect stdin",
            ));
        }
        if let Some(out) = &desc.stdout {
            if out != "stdout.txt" {
                return Err(Error::invalid_job_description(
                    &self.adaptor_name,
                    "interactive stdout must be unset or 'stdout.txt'",
                ));
            }
        }
        if let Some(err) = &desc.stderr {
            if err != "stderr.txt" {
                return Err(Error::invalid_job_description(
                    &self.adaptor_name,
                    "interactive stderr must be unset or 'stderr.txt'",
                ));
            }
        }
        Ok(())
    }

    fn mint_job_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.adaptor_name, n)
    }

    fn queue(&self, name: &str) -> Result<&Queue> {
        self.queues
            .get(name)
            .ok_or_else(|| Error::no_such_queue(&self.adaptor_name, format!("unknown queue '{name}'")))
    }

    async fn submit(&self, mut desc: JobDescription, interactive: bool) -> Result<Executor> {
        self.ensure_open()?;
        self.validate_common(&desc)?;
        if interactive {
            self.validate_interactive(&desc)?;
        }
        if desc.queue_name.is_none() {
            desc.queue_name = Some(DEFAULT_QUEUE.to_string());
        }
        let queue_name = Self::resolve_queue_name(&desc);
        let queue = self.queue(&queue_name)?;

        let job_id = self.mint_job_id();
        info!(job_id = %job_id, queue = %queue_name, executable = %desc.executable, "submitting job");

        let exec = Executor::spawn(
            job_id.clone(),
            self.adaptor_name.clone(),
            desc,
            interactive,
            self.fs_root.clone(),
            self.factory.clone(),
            self.polling_delay,
            queue.semaphore.clone(),
        );
        queue.push(job_id, exec.clone()).await;
        Ok(exec)
    }

    pub async fn submit_batch_job(&self, desc: JobDescription) -> Result<String> {
        let exec = self.submit(desc, false).await?;
        Ok(exec.job_id().to_string())
    }

    /// Blocks until the executor reaches `Running` or becomes `done`; on
    /// the latter, cleans up and surfaces the error (spec §4.1 step 4).
    pub async fn submit_interactive_job(&self, desc: JobDescription) -> Result<Streams> {
        let exec = self.submit(desc, true).await?;
        exec.wait_until_running(0).await?;
        let status = exec.status().await;
        if status.done {
            self.cleanup(exec.job_id()).await;
            return Err(Error::invalid_job_description(
                &self.adaptor_name,
                status.error.unwrap_or_else(|| "job failed before starting".to_string()),
            ));
        }
        exec.take_streams().await.ok_or_else(|| {
            Error::invalid_job_description(&self.adaptor_name, "process did not expose interactive streams")
        })
    }

    async fn locate(&self, job_id: &str) -> Result<Executor> {
        for name in [QUEUE_SINGLE, QUEUE_MULTI, QUEUE_UNLIMITED] {
            if let Some(exec) = self.queue(name)?.find(job_id).await {
                return Ok(exec);
            }
        }
        Err(Error::no_such_job(&self.adaptor_name, job_id))
    }

    async fn cleanup(&self, job_id: &str) {
        for name in [QUEUE_SINGLE, QUEUE_MULTI, QUEUE_UNLIMITED] {
            if let Ok(queue) = self.queue(name) {
                if queue.remove(job_id).await.is_some() {
                    return;
                }
            }
        }
    }

    /// Any call returning a terminal status harvests (removes) the
    /// executor; a subsequent lookup of the same id raises `NoSuchJob`
    /// (spec §9 "single-harvest semantics").
    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        let exec = self.locate(job_id).await?;
        let status = exec.status().await;
        if status.done {
            self.cleanup(job_id).await;
        }
        Ok(status)
    }

    /// Bulk variant: embeds per-element errors instead of aborting
    /// (spec §7 propagation policy).
    pub async fn get_job_statuses(&self, job_ids: &[String]) -> Vec<Result<JobStatus>> {
        let mut out = Vec::with_capacity(job_ids.len());
        for id in job_ids {
            out.push(self.get_job_status(id).await);
        }
        out
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        let exec = self.locate(job_id).await?;
        exec.kill();
        exec.wait_until_done(0).await?;
        let status = exec.status().await;
        if status.done {
            self.cleanup(job_id).await;
        }
        Ok(status)
    }

    pub async fn wait_until_done(&self, job_id: &str, timeout_ms: u64) -> Result<JobStatus> {
        let exec = self.locate(job_id).await?;
        exec.wait_until_done(timeout_ms).await?;
        let status = exec.status().await;
        self.cleanup(job_id).await;
        Ok(status)
    }

    pub async fn wait_until_running(&self, job_id: &str, timeout_ms: u64) -> Result<JobStatus> {
        let exec = self.locate(job_id).await?;
        exec.wait_until_running(timeout_ms).await?;
        let status = exec.status().await;
        if status.done {
            self.cleanup(job_id).await;
        }
        Ok(status)
    }

    /// Ids of executors currently registered in `queue_names` that have not
    /// yet been harvested by a terminal status read (spec §8 invariant).
    pub async fn get_jobs(&self, queue_names: &[&str]) -> Result<Vec<String>> {
        let names: Vec<&str> = if queue_names.is_empty() {
            vec![QUEUE_SINGLE, QUEUE_MULTI, QUEUE_UNLIMITED]
        } else {
            queue_names.to_vec()
        };
        let mut out = Vec::new();
        for name in names {
            out.extend(self.queue(name)?.ids().await);
        }
        Ok(out)
    }

    pub async fn get_queue_status(&self, queue_name: &str) -> Result<QueueStatus> {
        let queue = self.queue(queue_name)?;
        Ok(QueueStatus {
            queue_name: queue_name.to_string(),
            adaptor_name: self.adaptor_name.clone(),
            job_count: queue.ids().await.len(),
            scheduler_specific_information: Default::default(),
        })
    }

    /// Bulk variant: embeds per-element errors instead of aborting
    /// (spec §7 propagation policy).
    pub async fn get_queue_statuses(&self, queue_names: &[&str]) -> Vec<Result<QueueStatus>> {
        let mut out = Vec::with_capacity(queue_names.len());
        for name in queue_names {
            out.push(self.get_queue_status(name).await);
        }
        out
    }

    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.factory.close();
        info!(adaptor = %self.adaptor_name, "scheduler closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::LocalProcessFactory;
    use std::time::Instant as StdInstant;

    fn scheduler(multi_workers: usize) -> JobQueueScheduler {
        JobQueueScheduler::new(
            "local",
            std::env::temp_dir(),
            Arc::new(LocalProcessFactory::new("local")),
            multi_workers,
            Duration::from_millis(100),
        )
        .unwrap()
    }

    fn sleep_job(secs: &str, queue: &str) -> JobDescription {
        JobDescription {
            executable: "/bin/sleep".to_string(),
            arguments: vec![secs.to_string()],
            queue_name: Some(queue.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_unknown_queue() {
        let sched = scheduler(1);
        let mut d = sleep_job("1", "single");
        d.queue_name = Some("bogus".to_string());
        let err = sched.submit_batch_job(d).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NoSuchQueue);
    }

    #[tokio::test]
    async fn queue_status_reports_unharvested_job_count() {
        let sched = scheduler(1);
        assert_eq!(sched.get_queue_status("single").await.unwrap().job_count, 0);
        let id = sched.submit_batch_job(sleep_job("1", "single")).await.unwrap();
        assert_eq!(sched.get_queue_status("single").await.unwrap().job_count, 1);
        sched.wait_until_done(&id, 0).await.unwrap();
        assert_eq!(sched.get_queue_status("single").await.unwrap().job_count, 0);

        let err = sched.get_queue_status("bogus").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NoSuchQueue);
    }

    #[tokio::test]
    async fn no_such_job_after_harvest() {
        let sched = scheduler(1);
        let id = sched.submit_batch_job(sleep_job("0", "single")).await.unwrap();
        sched.wait_until_done(&id, 0).await.unwrap();
        let err = sched.get_job_status(&id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NoSuchJob);
    }

    #[tokio::test]
    async fn single_queue_serializes_jobs() {
        let sched = scheduler(1);
        let start = StdInstant::now();
        let a = sched.submit_batch_job(sleep_job("1", "single")).await.unwrap();
        let b = sched.submit_batch_job(sleep_job("1", "single")).await.unwrap();
        sched.wait_until_done(&a, 0).await.unwrap();
        sched.wait_until_done(&b, 0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn multi_queue_runs_workers_concurrently() {
        // Scaled-down form of spec §8 scenario 3 (N=4, eight 1s jobs,
        // wall-clock in [2s, 3s)): two workers, four 1s jobs. Submission
        // itself is non-blocking (it only spawns the executor task and
        // returns), so issuing four submits in a row and then waiting on
        // all of them still exercises two workers running concurrently.
        let sched = scheduler(2);
        let start = StdInstant::now();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(sched.submit_batch_job(sleep_job("1", "multi")).await.unwrap());
        }
        for id in ids {
            sched.wait_until_done(&id, 0).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "not concurrent: {elapsed:?}");
    }

    #[tokio::test]
    async fn kill_before_start_behind_busy_single_queue() {
        let sched = scheduler(1);
        let first = sched.submit_batch_job(sleep_job("2", "single")).await.unwrap();
        let second = sched.submit_batch_job(sleep_job("2", "single")).await.unwrap();
        let status = sched.cancel_job(&second).await.unwrap();
        assert_eq!(status.state, "KILLED");
        sched.cancel_job(&first).await.ok();
    }
}
