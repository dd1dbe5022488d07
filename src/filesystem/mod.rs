//! FileSystem facade (spec §4.6 C8): a common path/operation contract that
//! back-ends realize, plus the engine-provided generic operations layered
//! on top of the primitives.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::debug;

use crate::copy::CopyEngine;
use crate::error::{Error, Result};
use crate::job::{CopyMode, CopyStatus, PathAttributes};
use crate::path::Path;

/// Back-end-provided primitives (spec §4.6). Implemented once per
/// transport (local, SSH/SFTP, FTP, …); everything else in this module is
/// generic and back-end-agnostic.
#[async_trait]
pub trait FileSystemBackend: Send + Sync {
    fn adaptor_name(&self) -> &str;
    fn separator(&self) -> char {
        '/'
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    async fn create_directory(&self, path: &Path) -> Result<()>;
    async fn create_file(&self, path: &Path) -> Result<()>;
    async fn create_symbolic_link(&self, link: &Path, target: &Path) -> Result<()>;
    async fn delete_file(&self, path: &Path) -> Result<()>;
    async fn delete_directory(&self, path: &Path) -> Result<()>;
    async fn exists(&self, path: &Path) -> Result<bool>;
    /// Direct children only (no recursion — `.`/`..` never included).
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathAttributes>>;
    async fn read_from_file(&self, path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>>;
    async fn write_to_file(&self, path: &Path, size: Option<u64>) -> Result<Box<dyn AsyncWrite + Unpin + Send>>;
    async fn append_to_file(&self, path: &Path) -> Result<Box<dyn AsyncWrite + Unpin + Send>>;
    async fn get_attributes(&self, path: &Path) -> Result<PathAttributes>;
    async fn read_symbolic_link(&self, path: &Path) -> Result<Path>;
    async fn set_posix_file_permissions(&self, path: &Path, mode: u32) -> Result<()>;

    fn is_open(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

/// The full FileSystem surface (spec §6): primitives plus generic
/// operations plus the copy engine. Wraps a [`FileSystemBackend`] and adds
/// session state (working directory) the generic operations need.
pub struct FileSystem {
    backend: Arc<dyn FileSystemBackend>,
    working_directory: Mutex<Path>,
    copy_engine: CopyEngine,
}

impl FileSystem {
    pub fn new(backend: Arc<dyn FileSystemBackend>, initial_working_directory: Path) -> Arc<FileSystem> {
        Arc::new(FileSystem {
            copy_engine: CopyEngine::new(backend.adaptor_name().to_string(), crate::config::DEFAULT_COPY_BUFFER_BYTES),
            working_directory: Mutex::new(initial_working_directory),
            backend,
        })
    }

    pub fn backend(&self) -> &Arc<dyn FileSystemBackend> {
        &self.backend
    }

    pub fn adaptor_name(&self) -> &str {
        self.backend.adaptor_name()
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    // ── Primitives, delegated straight through ─────────────────────────

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.backend.rename(from, to).await
    }
    pub async fn create_file(&self, path: &Path) -> Result<()> {
        self.backend.create_file(path).await
    }
    pub async fn create_symbolic_link(&self, link: &Path, target: &Path) -> Result<()> {
        self.backend.create_symbolic_link(link, target).await
    }
    pub async fn delete_file(&self, path: &Path) -> Result<()> {
        self.backend.delete_file(path).await
    }
    pub async fn exists(&self, path: &Path) -> Result<bool> {
        self.backend.exists(path).await
    }
    pub async fn get_attributes(&self, path: &Path) -> Result<PathAttributes> {
        self.backend.get_attributes(path).await
    }
    pub async fn read_symbolic_link(&self, path: &Path) -> Result<Path> {
        self.backend.read_symbolic_link(path).await
    }
    pub async fn set_posix_file_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        self.backend.set_posix_file_permissions(path, mode).await
    }
    pub async fn read_from_file(&self, path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        self.backend.read_from_file(path).await
    }
    pub async fn write_to_file(&self, path: &Path, size: Option<u64>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
        self.backend.write_to_file(path, size).await
    }
    pub async fn append_to_file(&self, path: &Path) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
        self.backend.append_to_file(path).await
    }

    // ── Generic operations (spec §4.6) ─────────────────────────────────

    /// Recursive parent creation, idempotent: no-op on parents that already
    /// exist.
    pub async fn create_directories(&self, path: &Path) -> Result<()> {
        let mut to_create: Vec<Path> = Vec::new();
        let mut current = Some(path.clone());
        while let Some(p) = current {
            if p.components().is_empty() {
                break;
            }
            if self.backend.exists(&p).await? {
                break;
            }
            to_create.push(p.clone());
            current = p.parent();
        }
        for p in to_create.into_iter().rev() {
            match self.backend.create_directory(&p).await {
                Ok(()) => {}
                Err(e) if e.kind == crate::error::ErrorKind::PathAlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Depth-first traversal skipping `.`/`..` (never produced by
    /// `list_directory` anyway); returns a materialized ordered sequence.
    pub async fn list(&self, path: &Path, recursive: bool) -> Result<Vec<PathAttributes>> {
        let mut out = Vec::new();
        self.list_into(path, recursive, &mut out).await?;
        Ok(out)
    }

    async fn list_into(&self, path: &Path, recursive: bool, out: &mut Vec<PathAttributes>) -> Result<()> {
        let entries = self.backend.list_directory(path).await?;
        for entry in entries {
            let child_path = path.join(
                Path::new(&entry.path, self.backend.separator())
                    .get_file_name()
                    .unwrap_or(&entry.path),
            );
            // A symlink reports is_directory when its target is one (attributes
            // resolve through the link); recursing into it here would silently
            // flatten the target's contents into this listing.
            let descend = entry.is_directory && !entry.is_symbolic_link;
            out.push(entry);
            if recursive && descend {
                Box::pin(self.list_into(&child_path, recursive, out)).await?;
            }
        }
        Ok(())
    }

    /// Attribute-driven delete: file or symlink -> `deleteFile`; directory ->
    /// recurse if requested, else fail non-empty with `DirectoryNotEmpty`,
    /// then `deleteDirectory`. A symlink is removed as itself, never through
    /// its target, even when the target is a directory.
    pub async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        let attrs = self.backend.get_attributes(path).await?;
        if attrs.is_symbolic_link || !attrs.is_directory {
            return self.backend.delete_file(path).await;
        }
        let children = self.backend.list_directory(path).await?;
        if !children.is_empty() {
            if !recursive {
                return Err(Error::directory_not_empty(self.adaptor_name(), path.to_string()));
            }
            for child in children {
                let child_path = path.join(
                    Path::new(&child.path, self.backend.separator())
                        .get_file_name()
                        .unwrap_or(&child.path),
                );
                Box::pin(self.delete(&child_path, true)).await?;
            }
        }
        self.backend.delete_directory(path).await
    }

    pub async fn working_directory(&self) -> Path {
        self.working_directory.lock().await.clone()
    }

    /// Asserts existence and directory-ness, then updates the session's
    /// working directory.
    pub async fn set_working_directory(&self, path: Path) -> Result<()> {
        let attrs = self.backend.get_attributes(&path).await?;
        if !attrs.is_directory {
            return Err(Error::invalid_path(self.adaptor_name(), format!("{path} is not a directory")));
        }
        *self.working_directory.lock().await = path;
        Ok(())
    }

    /// If `path` is relative, resolve against the session working
    /// directory and normalize.
    pub async fn to_absolute_path(&self, path: &Path) -> Path {
        if path.is_absolute() {
            return path.normalize();
        }
        let cwd = self.working_directory().await;
        cwd.resolve(path)
    }

    // ── Copy (spec §4.5) ────────────────────────────────────────────────

    pub async fn copy(
        self: &Arc<Self>,
        source: Path,
        dest_fs: Arc<FileSystem>,
        dest: Path,
        mode: CopyMode,
        recursive: bool,
    ) -> Result<String> {
        debug!(source = %source, dest = %dest, ?mode, recursive, "starting copy");
        self.copy_engine.submit(self.clone(), source, dest_fs, dest, mode, recursive).await
    }

    pub async fn copy_status(&self, copy_id: &str) -> Result<CopyStatus> {
        self.copy_engine.status(copy_id).await
    }

    pub async fn copy_wait_until_done(&self, copy_id: &str, timeout_ms: u64) -> Result<CopyStatus> {
        self.copy_engine.wait_until_done(copy_id, timeout_ms).await
    }

    pub async fn copy_cancel(&self, copy_id: &str) -> Result<CopyStatus> {
        self.copy_engine.cancel(copy_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::local::LocalFileSystemBackend;

    async fn local_fs(root: &std::path::Path) -> Arc<FileSystem> {
        let backend = Arc::new(LocalFileSystemBackend::new("local", root.to_path_buf()));
        FileSystem::new(backend, Path::new("/", '/'))
    }

    #[tokio::test]
    async fn create_directories_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local_fs(tmp.path()).await;
        let p = Path::new("/a/b/c", '/');
        fs.create_directories(&p).await.unwrap();
        fs.create_directories(&p).await.unwrap();
        assert!(fs.exists(&p).await.unwrap());
    }

    #[tokio::test]
    async fn delete_non_recursive_on_populated_dir_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local_fs(tmp.path()).await;
        let dir = Path::new("/d", '/');
        fs.create_directories(&dir).await.unwrap();
        fs.create_file(&dir.join("f.txt")).await.unwrap();
        let err = fs.delete(&dir, false).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DirectoryNotEmpty);
        fs.delete(&dir, true).await.unwrap();
        assert!(!fs.exists(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn set_working_directory_rejects_non_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local_fs(tmp.path()).await;
        let file = Path::new("/f.txt", '/');
        fs.create_file(&file).await.unwrap();
        assert!(fs.set_working_directory(file).await.is_err());
    }

    #[tokio::test]
    async fn to_absolute_path_resolves_against_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local_fs(tmp.path()).await;
        let dir = Path::new("/a", '/');
        fs.create_directories(&dir).await.unwrap();
        fs.set_working_directory(dir).await.unwrap();
        let abs = fs.to_absolute_path(&Path::new("b.txt", '/')).await;
        assert_eq!(abs.to_string(), "/a/b.txt");
    }
}
