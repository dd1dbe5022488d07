//! Job executor state machine (spec §4.2 C5): a state machine around one
//! process, with cooperative polling, cancellation, deadline, and a
//! status-update signaling protocol observers can use to request an eager
//! re-poll.
//!
//! The teacher's `job_manager.rs` drives its own background thread with a
//! `loop { try_wait(); sleep(200ms); }` shape guarded by a
//! `std::sync::Mutex<HashMap<..>>` registry. We keep that shape — poll,
//! sleep, check a kill flag, check a deadline — but express it as a tokio
//! task over `Arc<Mutex<..>>` state plus a `tokio::sync::Notify` for the
//! wake-early / status-update protocol spec §4.2 describes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::job::{JobDescription, JobState, JobStatus};
use crate::process::{ManagedProcess, ProcessFactory, Streams};

struct ExecutorInner {
    state: JobState,
    exit_status: Option<i32>,
    has_run: bool,
    error: Option<Error>,
    streams: Option<Streams>,
}

/// One submitted job's lifecycle, from `Pending` through a terminal state.
/// Cheaply cloneable (all shared state lives behind `Arc`) so the scheduler
/// can hand out references while its queue lists hold the canonical copy.
#[derive(Clone)]
pub struct Executor {
    job_id: String,
    name: Option<String>,
    adaptor_name: String,
    desc: Arc<JobDescription>,
    inner: Arc<Mutex<ExecutorInner>>,
    notify: Arc<Notify>,
    killed: Arc<AtomicBool>,
    update_signal: Arc<AtomicBool>,
}

impl Executor {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Construct a `Pending` executor and start its driver loop on the
    /// current tokio runtime. `desc` is assumed already defensively copied
    /// by the scheduler (spec §3 "Lifecycle").
    pub fn spawn(
        job_id: String,
        adaptor_name: String,
        desc: JobDescription,
        interactive: bool,
        fs_root: PathBuf,
        factory: Arc<dyn ProcessFactory>,
        polling_delay: Duration,
        queue_slot: Option<Arc<Semaphore>>,
    ) -> Executor {
        let exec = Executor {
            job_id: job_id.clone(),
            name: desc.name.clone(),
            adaptor_name: adaptor_name.clone(),
            desc: Arc::new(desc),
            inner: Arc::new(Mutex::new(ExecutorInner {
                state: JobState::Pending,
                exit_status: None,
                has_run: false,
                error: None,
                streams: None,
            })),
            notify: Arc::new(Notify::new()),
            killed: Arc::new(AtomicBool::new(false)),
            update_signal: Arc::new(AtomicBool::new(false)),
        };

        let driver = exec.clone();
        tokio::spawn(async move {
            driver.drive(interactive, fs_root, factory, polling_delay, queue_slot).await;
        });

        exec
    }

    /// Mark this executor killed. If it has not yet started, the driver
    /// loop (which checks `killed` before doing anything else) emits
    /// `Killed` on its next poll tick; `trigger_status_update` wakes it
    /// immediately rather than waiting out the full polling delay.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.trigger_status_update();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Nudge the driver loop to re-poll immediately instead of waiting out
    /// its sleep interval (spec §4.2 "suspension/signal protocol").
    pub fn trigger_status_update(&self) {
        self.update_signal.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn take_streams(&self) -> Option<Streams> {
        self.inner.lock().await.streams.take()
    }

    pub async fn status(&self) -> JobStatus {
        let inner = self.inner.lock().await;
        JobStatus {
            job_identifier: self.job_id.clone(),
            name: self.name.clone(),
            state: inner.state.label().to_string(),
            exit_code: inner.exit_status,
            error: inner.error.as_ref().map(|e| e.message.clone()),
            running: inner.state == JobState::Running,
            done: inner.state.is_terminal(),
            scheduler_specific_information: Default::default(),
        }
    }

    pub async fn state(&self) -> JobState {
        self.inner.lock().await.state
    }

    /// Wait until the executor reaches `Running` or any terminal state.
    /// `timeout == 0` waits indefinitely. Spurious-wakeup-safe: re-checks
    /// the condition after every notification.
    pub async fn wait_until_running(&self, timeout_ms: u64) -> Result<()> {
        self.wait_for(timeout_ms, |s| s != JobState::Pending).await
    }

    /// Wait until the executor reaches a terminal state.
    pub async fn wait_until_done(&self, timeout_ms: u64) -> Result<()> {
        self.wait_for(timeout_ms, JobState::is_terminal).await
    }

    async fn wait_for(&self, timeout_ms: u64, predicate: impl Fn(JobState) -> bool) -> Result<()> {
        let deadline = if timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        };
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock().await;
                if predicate(inner.state) {
                    return Ok(());
                }
            }
            match deadline {
                None => notified.await,
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(Error::bad_parameter(
                            &self.adaptor_name,
                            format!("timed out waiting on job {}", self.job_id),
                        ));
                    }
                    let _ = tokio::time::timeout(dl - now, notified).await;
                }
            }
        }
    }

    async fn set_state(&self, state: JobState) {
        let mut inner = self.inner.lock().await;
        inner.state = state;
        drop(inner);
        self.notify.notify_waiters();
    }

    async fn fail(&self, err: Error) {
        let mut inner = self.inner.lock().await;
        inner.state = JobState::Error;
        inner.error = Some(err);
        drop(inner);
        self.notify.notify_waiters();
    }

    async fn drive(
        &self,
        interactive: bool,
        fs_root: PathBuf,
        factory: Arc<dyn ProcessFactory>,
        polling_delay: Duration,
        queue_slot: Option<Arc<Semaphore>>,
    ) {
        if self.is_killed() {
            info!(job_id = %self.job_id, "killed before start");
            self.set_state(JobState::Killed).await;
            return;
        }

        // Wait for a slot on this job's queue (single: 1, multi: N,
        // unlimited: no semaphore at all). A kill received while queued
        // must win over waiting forever for a slot that may never free up.
        let _permit = if let Some(sem) = queue_slot {
            let acquire = sem.acquire_owned();
            tokio::pin!(acquire);
            loop {
                tokio::select! {
                    res = &mut acquire => break Some(res.expect("queue semaphore closed")),
                    _ = self.notify.notified() => {
                        if self.is_killed() {
                            info!(job_id = %self.job_id, "killed while queued");
                            self.set_state(JobState::Killed).await;
                            return;
                        }
                    }
                }
            }
        } else {
            None
        };

        if self.is_killed() {
            info!(job_id = %self.job_id, "killed while queued");
            self.set_state(JobState::Killed).await;
            return;
        }

        let working_dir = match &self.desc.working_directory {
            Some(wd) => fs_root.join(wd.trim_start_matches('/')),
            None => fs_root.clone(),
        };
        if !working_dir.is_dir() {
            self.fail(Error::invalid_path(
                &self.adaptor_name,
                format!("working directory does not exist: {}", working_dir.display()),
            ))
            .await;
            return;
        }

        let spawn_result = if interactive {
            factory.spawn_interactive(&self.desc, &working_dir)
        } else {
            factory.spawn_batch(&self.desc, &working_dir)
        };

        let mut process: Box<dyn ManagedProcess> = match spawn_result {
            Ok(p) => p,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to create process");
                self.fail(e).await;
                return;
            }
        };

        if let Some(mut streams) = process.take_streams() {
            // The process factory doesn't know the scheduler-minted job id
            // at spawn time; stamp it here so callers that key off
            // `Streams::job_identifier` (e.g. the command runner) see the
            // same id the scheduler hands back from `submit`.
            streams.job_identifier = self.job_id.clone();
            let mut inner = self.inner.lock().await;
            inner.streams = Some(streams);
            inner.has_run = true;
        } else {
            self.inner.lock().await.has_run = true;
        }

        self.set_state(JobState::Running).await;
        debug!(job_id = %self.job_id, "running");

        let end_time = if self.desc.max_runtime > 0 {
            Some(Instant::now() + Duration::from_secs(self.desc.max_runtime as u64 * 60))
        } else {
            None
        };

        loop {
            match process.try_wait() {
                Ok(Some(code)) => {
                    info!(job_id = %self.job_id, exit_code = code, "done");
                    let mut inner = self.inner.lock().await;
                    inner.state = JobState::Done;
                    inner.exit_status = Some(code);
                    drop(inner);
                    self.notify.notify_waiters();
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "wait error");
                    self.fail(Error::not_connected(&self.adaptor_name, e.to_string())).await;
                    return;
                }
            }

            if self.is_killed() {
                process.destroy();
                info!(job_id = %self.job_id, "killed");
                self.set_state(JobState::Killed).await;
                return;
            }

            if let Some(end) = end_time {
                if Instant::now() >= end {
                    process.destroy();
                    warn!(job_id = %self.job_id, "timed out");
                    let mut inner = self.inner.lock().await;
                    inner.state = JobState::Killed;
                    inner.error = Some(Error::job_canceled(&self.adaptor_name, "timed out"));
                    drop(inner);
                    self.notify.notify_waiters();
                    return;
                }
            }

            self.update_signal.store(false, Ordering::SeqCst);
            let notified = self.notify.notified();
            tokio::select! {
                _ = tokio::time::sleep(polling_delay) => {}
                _ = notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::LocalProcessFactory;

    fn desc(executable: &str, args: &[&str]) -> JobDescription {
        JobDescription {
            executable: executable.to_string(),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn echo_job_runs_to_completion() {
        let factory = Arc::new(LocalProcessFactory::new("local"));
        let exec = Executor::spawn(
            "local-1".to_string(),
            "local".to_string(),
            desc("/bin/echo", &["hello"]),
            false,
            std::env::temp_dir(),
            factory,
            Duration::from_millis(100),
            None,
        );
        exec.wait_until_done(5000).await.unwrap();
        let status = exec.status().await;
        assert_eq!(status.state, "DONE");
        assert_eq!(status.exit_code, Some(0));
    }

    #[tokio::test]
    async fn kill_before_start_yields_killed_and_has_not_run() {
        let factory = Arc::new(LocalProcessFactory::new("local"));
        let exec = Executor::spawn(
            "local-2".to_string(),
            "local".to_string(),
            desc("/bin/sleep", &["60"]),
            false,
            std::env::temp_dir(),
            factory,
            Duration::from_millis(50),
            None,
        );
        exec.kill();
        exec.wait_until_done(5000).await.unwrap();
        assert_eq!(exec.status().await.state, "KILLED");
        assert!(!exec.inner.lock().await.has_run);
    }

    #[tokio::test]
    async fn running_job_can_be_killed() {
        // max_runtime is in minutes (spec §4.2), too coarse to exercise the
        // deadline path directly in a unit test; this exercises the other
        // "running -> killed" transition instead (kill() mid-flight).
        let factory = Arc::new(LocalProcessFactory::new("local"));
        let exec = Executor::spawn(
            "local-3".to_string(),
            "local".to_string(),
            desc("/bin/sleep", &["60"]),
            false,
            std::env::temp_dir(),
            factory,
            Duration::from_millis(50),
            None,
        );
        exec.wait_until_running(5000).await.unwrap();
        exec.kill();
        exec.wait_until_done(5000).await.unwrap();
        assert_eq!(exec.status().await.state, "KILLED");
    }
}
