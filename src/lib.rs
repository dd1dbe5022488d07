//! A uniform `Scheduler` + `FileSystem` middleware surface over local (and,
//! via the capability traits in [`adaptor`], out-of-tree SSH/SFTP/FTP/SLURM)
//! back-ends.
//!
//! The entry point most callers want is [`adaptor::Xenon`]; the individual
//! components (`path`, `process`, `command_runner`, `scripting`, `executor`,
//! `scheduler`, `copy`, `filesystem`) are exposed for back-end authors who
//! need to assemble their own adaptor.

pub mod adaptor;
pub mod command_runner;
pub mod config;
pub mod copy;
pub mod error;
pub mod executor;
pub mod filesystem;
pub mod job;
pub mod path;
pub mod process;
pub mod scheduler;
pub mod scripting;

pub use adaptor::Xenon;
pub use error::{Error, ErrorKind, Result};
