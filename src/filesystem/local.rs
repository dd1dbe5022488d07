//! Local filesystem back-end: `tokio::fs` realizes the primitives of
//! §4.6 directly (the "local" adaptor).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{from_io_error, Error, Result};
use crate::filesystem::FileSystemBackend;
use crate::job::PathAttributes;
use crate::path::Path;

pub struct LocalFileSystemBackend {
    adaptor_name: String,
    root: PathBuf,
    open: AtomicBool,
}

impl LocalFileSystemBackend {
    pub fn new(adaptor_name: impl Into<String>, root: PathBuf) -> Self {
        LocalFileSystemBackend {
            adaptor_name: adaptor_name.into(),
            root,
            open: AtomicBool::new(true),
        }
    }

    /// Maps an engine `Path` (always rooted at `/`) onto a real filesystem
    /// location under `root`, so tests can sandbox inside a `tempdir`
    /// without the engine's own path model knowing about it.
    fn native(&self, path: &Path) -> PathBuf {
        let mut out = self.root.clone();
        for c in path.components() {
            out.push(c);
        }
        out
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::not_connected(&self.adaptor_name, "filesystem is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystemBackend for LocalFileSystemBackend {
    fn adaptor_name(&self) -> &str {
        &self.adaptor_name
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::rename(self.native(from), self.native(to))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &from.to_string(), e))
    }

    async fn create_directory(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::create_dir(self.native(path))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))
    }

    async fn create_file(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.native(path))
            .await
            .map(|_| ())
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))
    }

    async fn create_symbolic_link(&self, link: &Path, target: &Path) -> Result<()> {
        self.ensure_open()?;
        #[cfg(unix)]
        {
            tokio::fs::symlink(self.native(target), self.native(link))
                .await
                .map_err(|e| from_io_error(&self.adaptor_name, &link.to_string(), e))
        }
        #[cfg(not(unix))]
        {
            Err(Error::unsupported_operation(
                &self.adaptor_name,
                "symbolic links are not supported on this platform",
            ))
        }
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::remove_file(self.native(path))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))
    }

    async fn delete_directory(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::remove_dir(self.native(path))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.ensure_open()?;
        Ok(tokio::fs::metadata(self.native(path)).await.is_ok())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathAttributes>> {
        self.ensure_open()?;
        let native = self.native(path);
        let mut entries = tokio::fs::read_dir(&native)
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))?
        {
            let child_path = path.join(&entry.file_name().to_string_lossy());
            out.push(attributes_for(&self.adaptor_name, &child_path, &entry.path()).await?);
        }
        Ok(out)
    }

    async fn read_from_file(&self, path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        self.ensure_open()?;
        let file = tokio::fs::File::open(self.native(path))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))?;
        Ok(Box::new(file))
    }

    async fn write_to_file(&self, path: &Path, _size: Option<u64>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
        self.ensure_open()?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.native(path))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))?;
        Ok(Box::new(file))
    }

    async fn append_to_file(&self, path: &Path) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
        self.ensure_open()?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(self.native(path))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))?;
        Ok(Box::new(file))
    }

    async fn get_attributes(&self, path: &Path) -> Result<PathAttributes> {
        self.ensure_open()?;
        attributes_for(&self.adaptor_name, path, &self.native(path)).await
    }

    async fn read_symbolic_link(&self, path: &Path) -> Result<Path> {
        self.ensure_open()?;
        let target = tokio::fs::read_link(self.native(path))
            .await
            .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))?;
        Ok(Path::new(&target.to_string_lossy(), path.separator()))
    }

    async fn set_posix_file_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        self.ensure_open()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            tokio::fs::set_permissions(self.native(path), perms)
                .await
                .map_err(|e| from_io_error(&self.adaptor_name, &path.to_string(), e))
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            Err(Error::unsupported_operation(
                &self.adaptor_name,
                "POSIX permissions are not supported on this platform",
            ))
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds a [`PathAttributes`] from `std::fs` metadata.
///
/// Preserves a quirk observed in the original scheduler-adaptor source this
/// engine is descended from: when the platform cannot report an access
/// time, `creationTime` is populated from the access-time branch rather
/// than from the true creation time. Left as-is rather than "corrected",
/// since downstream callers may already compensate for it.
async fn attributes_for(adaptor_name: &str, engine_path: &Path, native: &std::path::Path) -> Result<PathAttributes> {
    let meta = tokio::fs::symlink_metadata(native)
        .await
        .map_err(|e| from_io_error(adaptor_name, &engine_path.to_string(), e))?;

    let is_symlink = meta.file_type().is_symlink();
    let resolved = if is_symlink {
        tokio::fs::metadata(native).await.ok()
    } else {
        Some(meta.clone())
    };

    let last_modified = meta.modified().ok();
    let access_time = meta.accessed().ok();
    let creation_time = match meta.created().ok() {
        Some(t) => Some(t),
        // quirk: fall back to access time, not to last-modified, when the
        // platform has no creation time of its own.
        None => access_time,
    };

    let to_millis = |t: Option<std::time::SystemTime>| -> u64 {
        t.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    };

    let is_directory = resolved.as_ref().map(|m| m.is_dir()).unwrap_or(false);
    let is_regular_file = resolved.as_ref().map(|m| m.is_file()).unwrap_or(false);
    let size = resolved.as_ref().map(|m| m.len()).unwrap_or(0);

    let file_name = engine_path
        .get_file_name()
        .map(|n| n.starts_with('.'))
        .unwrap_or(false);

    #[cfg(unix)]
    let (permissions, owner, group, executable, readable, writable) = {
        use std::os::unix::fs::MetadataExt;
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        (
            Some(format!("{:o}", mode & 0o777)),
            Some(meta.uid().to_string()),
            Some(meta.gid().to_string()),
            mode & 0o111 != 0,
            mode & 0o444 != 0,
            mode & 0o222 != 0,
        )
    };
    #[cfg(not(unix))]
    let (permissions, owner, group, executable, readable, writable) = {
        (None, None, None, false, !meta.permissions().readonly(), !meta.permissions().readonly())
    };

    Ok(PathAttributes {
        path: engine_path.to_string(),
        is_directory,
        is_regular_file,
        is_symbolic_link: is_symlink,
        is_other: !is_directory && !is_regular_file && !is_symlink,
        is_hidden: file_name,
        last_modified_millis: to_millis(last_modified),
        creation_millis: to_millis(creation_time),
        last_access_millis: to_millis(access_time),
        size,
        permissions,
        owner,
        group,
        executable,
        readable,
        writable,
    })
}
