//! Process primitives (spec §4.1 C2): `InteractiveProcess` (live
//! stdin/stdout/stderr) and `BatchProcess` (script-wrapped, file-redirected).
//!
//! Both are thin wrappers around `tokio::process::Child` — the teacher's
//! `job_manager.rs` wraps `std::process::Child` on a dedicated
//! `std::thread`; here the same "spawn, poll non-blockingly, drain streams
//! on separate tasks, kill on cancel/timeout" shape is expressed with
//! `tokio::process` so it composes with the rest of the async core.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, ChildStderr, Command};

use crate::error::{Error, Result};
use crate::job::JobDescription;

/// Live handles to a running interactive job, plus its opaque identifier.
/// Lifetime is tied to the owning executor (spec §3 "Streams").
pub struct Streams {
    pub job_identifier: String,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl Streams {
    pub fn stdin_writer(&mut self) -> Option<&mut (dyn AsyncWrite + Unpin + Send)> {
        self.stdin.as_mut().map(|s| s as &mut (dyn AsyncWrite + Unpin + Send))
    }

    pub fn stdout_reader(&mut self) -> Option<&mut (dyn AsyncRead + Unpin + Send)> {
        self.stdout.as_mut().map(|s| s as &mut (dyn AsyncRead + Unpin + Send))
    }

    pub fn stderr_reader(&mut self) -> Option<&mut (dyn AsyncRead + Unpin + Send)> {
        self.stderr.as_mut().map(|s| s as &mut (dyn AsyncRead + Unpin + Send))
    }
}

/// A process the executor drives to completion: create once, poll
/// `try_wait` repeatedly without blocking, `destroy` on cancel/timeout.
pub trait ManagedProcess: Send {
    /// Non-blocking poll. `Ok(Some(code))` once the process has exited.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Forcibly terminate the process (SIGKILL-equivalent).
    fn destroy(&mut self);

    /// Take the interactive streams, if this process exposes them. Returns
    /// `None` for a batch process (streams are redirected to files instead).
    fn take_streams(&mut self) -> Option<Streams>;
}

/// A process backed by a local `tokio::process::Child`.
pub struct LocalProcess {
    child: Child,
    streams: Option<Streams>,
}

impl ManagedProcess for LocalProcess {
    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(exit_code_with_signal(status))),
            None => Ok(None),
        }
    }

    fn destroy(&mut self) {
        // start_kill is synchronous/non-blocking; the executor does not
        // await process reaping here — the next try_wait() call reaps it.
        let _ = self.child.start_kill();
    }

    fn take_streams(&mut self) -> Option<Streams> {
        self.streams.take()
    }
}

/// Combine a raw exit code with a Unix signal suffix the way the scripting
/// codec's exit-code field does (`"N:S"`, spec §4.4), so a locally-run
/// process and a script back-end report deaths-by-signal the same way.
#[cfg(unix)]
fn exit_code_with_signal(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| -(status.signal().unwrap_or(0)))
}

#[cfg(not(unix))]
fn exit_code_with_signal(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Factory that turns a validated [`JobDescription`] plus a resolved
/// working directory into a running [`ManagedProcess`]. Kept as a trait so
/// the executor (C5) is back-end-agnostic: a SLURM-style back-end supplies
/// a factory that shells out to `sbatch`/`srun` instead.
pub trait ProcessFactory: Send + Sync {
    fn spawn_interactive(&self, desc: &JobDescription, working_dir: &std::path::Path) -> Result<Box<dyn ManagedProcess>>;
    fn spawn_batch(&self, desc: &JobDescription, working_dir: &std::path::Path) -> Result<Box<dyn ManagedProcess>>;

    /// Release any resources held by the factory itself (connection pools,
    /// sockets). Local factory has nothing to close.
    fn close(&self) {}
}

/// Spawns ordinary local OS processes via `tokio::process::Command`.
pub struct LocalProcessFactory {
    pub adaptor_name: String,
}

impl LocalProcessFactory {
    pub fn new(adaptor_name: impl Into<String>) -> Self {
        LocalProcessFactory {
            adaptor_name: adaptor_name.into(),
        }
    }

    fn build_command(&self, desc: &JobDescription) -> Command {
        let mut cmd = Command::new(&desc.executable);
        cmd.args(&desc.arguments);
        for (k, v) in &desc.environment {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

impl ProcessFactory for LocalProcessFactory {
    fn spawn_interactive(&self, desc: &JobDescription, working_dir: &std::path::Path) -> Result<Box<dyn ManagedProcess>> {
        let mut cmd = self.build_command(desc);
        cmd.current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::invalid_job_description(&self.adaptor_name, format!("failed to spawn {}: {e}", desc.executable))
        })?;

        let streams = Streams {
            job_identifier: desc.name.clone().unwrap_or_default(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        Ok(Box::new(LocalProcess {
            child,
            streams: Some(streams),
        }))
    }

    fn spawn_batch(&self, desc: &JobDescription, working_dir: &std::path::Path) -> Result<Box<dyn ManagedProcess>> {
        let mut cmd = self.build_command(desc);
        cmd.current_dir(working_dir);

        cmd.stdin(redirect_stdio(desc.stdin.as_deref(), working_dir, true)?);
        cmd.stdout(redirect_stdio(desc.stdout.as_deref(), working_dir, false)?);
        cmd.stderr(redirect_stdio(desc.stderr.as_deref(), working_dir, false)?);

        let child = cmd.spawn().map_err(|e| {
            Error::invalid_job_description(&self.adaptor_name, format!("failed to spawn {}: {e}", desc.executable))
        })?;

        Ok(Box::new(LocalProcess {
            child,
            streams: None,
        }))
    }

    fn close(&self) {}
}

/// Build a `Stdio` for a batch job's stdin/stdout/stderr hint. `None` maps
/// to `/dev/null`-equivalent (`Stdio::null()`); `Some(path)` opens the file
/// relative to `working_dir` (read for stdin, create/append for
/// stdout/stderr, matching the generated script's redirections, spec §4.4).
fn redirect_stdio(hint: Option<&str>, working_dir: &std::path::Path, is_input: bool) -> Result<Stdio> {
    let Some(hint) = hint else {
        return Ok(Stdio::null());
    };
    let path: PathBuf = working_dir.join(hint);
    if is_input {
        let file = std::fs::File::open(&path)
            .map_err(|e| crate::error::from_io_error("local", &path.display().to_string(), e))?;
        Ok(Stdio::from(file))
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| crate::error::from_io_error("local", &path.display().to_string(), e))?;
        Ok(Stdio::from(file))
    }
}
