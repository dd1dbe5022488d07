//! Capability-trait dispatch (spec §9 "pluggable back-ends"): a single
//! `Xenon` facade over a `Scheduler` and a `FileSystem`, chosen as a
//! capability-trait-object design over a closed tagged enum so an
//! out-of-tree crate can add an SSH/SFTP or FTP back-end by implementing
//! [`SchedulerBackend`]/`filesystem::FileSystemBackend` without forking this
//! one. This crate ships only the `local` back-end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::XenonConfig;
use crate::error::Result;
use crate::filesystem::local::LocalFileSystemBackend;
use crate::filesystem::FileSystem;
use crate::job::{JobDescription, JobStatus, QueueStatus};
use crate::path::Path;
use crate::process::{LocalProcessFactory, Streams};
use crate::scheduler::JobQueueScheduler;

/// Scheduler-side half of the capability-trait pair. [`JobQueueScheduler`]
/// implements it directly; an out-of-tree SLURM/PBS back-end would
/// implement it over the scripting codec (`crate::scripting`) plus its own
/// `ProcessFactory`-equivalent instead.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    /// Lets a caller holding `Arc<dyn SchedulerBackend>` recover the
    /// concrete back-end when it needs a capability the trait doesn't
    /// expose (e.g. `CommandRunner`, which is built directly over
    /// `JobQueueScheduler` rather than this trait).
    fn as_any(&self) -> &dyn std::any::Any;

    fn adaptor_name(&self) -> &str;
    fn queue_names(&self) -> Vec<&'static str>;
    fn default_queue_name(&self) -> &'static str;
    fn default_runtime_minutes(&self) -> i64;
    fn is_open(&self) -> bool;

    async fn submit_batch_job(&self, desc: JobDescription) -> Result<String>;
    async fn submit_interactive_job(&self, desc: JobDescription) -> Result<Streams>;
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus>;
    async fn get_job_statuses(&self, job_ids: &[String]) -> Vec<Result<JobStatus>>;
    async fn cancel_job(&self, job_id: &str) -> Result<JobStatus>;
    async fn wait_until_done(&self, job_id: &str, timeout_ms: u64) -> Result<JobStatus>;
    async fn wait_until_running(&self, job_id: &str, timeout_ms: u64) -> Result<JobStatus>;
    async fn get_jobs(&self, queue_names: &[&str]) -> Result<Vec<String>>;
    async fn get_queue_status(&self, queue_name: &str) -> Result<QueueStatus>;
    async fn get_queue_statuses(&self, queue_names: &[&str]) -> Vec<Result<QueueStatus>>;
    async fn close(&self);
}

#[async_trait]
impl SchedulerBackend for JobQueueScheduler {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn adaptor_name(&self) -> &str {
        JobQueueScheduler::adaptor_name(self)
    }

    fn queue_names(&self) -> Vec<&'static str> {
        JobQueueScheduler::queue_names(self)
    }

    fn default_queue_name(&self) -> &'static str {
        JobQueueScheduler::default_queue_name(self)
    }

    fn default_runtime_minutes(&self) -> i64 {
        JobQueueScheduler::default_runtime_minutes(self)
    }

    fn is_open(&self) -> bool {
        JobQueueScheduler::is_open(self)
    }

    async fn submit_batch_job(&self, desc: JobDescription) -> Result<String> {
        JobQueueScheduler::submit_batch_job(self, desc).await
    }

    async fn submit_interactive_job(&self, desc: JobDescription) -> Result<Streams> {
        JobQueueScheduler::submit_interactive_job(self, desc).await
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        JobQueueScheduler::get_job_status(self, job_id).await
    }

    async fn get_job_statuses(&self, job_ids: &[String]) -> Vec<Result<JobStatus>> {
        JobQueueScheduler::get_job_statuses(self, job_ids).await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        JobQueueScheduler::cancel_job(self, job_id).await
    }

    async fn wait_until_done(&self, job_id: &str, timeout_ms: u64) -> Result<JobStatus> {
        JobQueueScheduler::wait_until_done(self, job_id, timeout_ms).await
    }

    async fn wait_until_running(&self, job_id: &str, timeout_ms: u64) -> Result<JobStatus> {
        JobQueueScheduler::wait_until_running(self, job_id, timeout_ms).await
    }

    async fn get_jobs(&self, queue_names: &[&str]) -> Result<Vec<String>> {
        JobQueueScheduler::get_jobs(self, queue_names).await
    }

    async fn get_queue_status(&self, queue_name: &str) -> Result<QueueStatus> {
        JobQueueScheduler::get_queue_status(self, queue_name).await
    }

    async fn get_queue_statuses(&self, queue_names: &[&str]) -> Vec<Result<QueueStatus>> {
        JobQueueScheduler::get_queue_statuses(self, queue_names).await
    }

    async fn close(&self) {
        JobQueueScheduler::close(self).await
    }
}

/// Top-level handle bundling a scheduler and a filesystem for one adaptor
/// instance, the way a caller actually wants to use this crate (spec §6).
pub struct Xenon {
    adaptor_name: String,
    scheduler: Arc<dyn SchedulerBackend>,
    filesystem: Arc<FileSystem>,
}

impl Xenon {
    /// Build the `local` adaptor: jobs run as plain child processes under
    /// `fs_root`, and the filesystem surface is rooted at the same
    /// directory.
    pub fn local(config: XenonConfig, fs_root: PathBuf) -> Result<Xenon> {
        config.validate()?;
        info!(adaptor = %config.adaptor_name, root = %fs_root.display(), "opening local adaptor");

        let factory = Arc::new(LocalProcessFactory::new(config.adaptor_name.clone()));
        let scheduler = Arc::new(JobQueueScheduler::new(
            config.adaptor_name.clone(),
            fs_root.clone(),
            factory,
            config.multi_queue_workers,
            Duration::from_millis(config.polling_delay_ms),
        )?);

        let fs_backend = Arc::new(LocalFileSystemBackend::new(config.adaptor_name.clone(), fs_root));
        let filesystem = FileSystem::new(fs_backend, Path::new("/", '/'));

        Ok(Xenon {
            adaptor_name: config.adaptor_name,
            scheduler,
            filesystem,
        })
    }

    pub fn adaptor_name(&self) -> &str {
        &self.adaptor_name
    }

    pub fn scheduler(&self) -> &Arc<dyn SchedulerBackend> {
        &self.scheduler
    }

    pub fn filesystem(&self) -> &Arc<FileSystem> {
        &self.filesystem
    }

    pub async fn close(&self) -> Result<()> {
        self.scheduler.close().await;
        self.filesystem.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_adaptor_submits_and_reaps_a_job() {
        let tmp = tempfile::tempdir().unwrap();
        let xenon = Xenon::local(XenonConfig::default(), tmp.path().to_path_buf()).unwrap();

        let desc = JobDescription {
            executable: "/bin/echo".to_string(),
            arguments: vec!["hi".to_string()],
            ..Default::default()
        };
        let job_id = xenon.scheduler().submit_batch_job(desc).await.unwrap();
        let status = xenon.scheduler().wait_until_done(&job_id, 5000).await.unwrap();
        assert_eq!(status.state, "DONE");
        assert_eq!(status.exit_code, Some(0));
    }
}
