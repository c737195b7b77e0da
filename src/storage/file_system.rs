use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fastrace_macro::trace;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::storage::{cancellable, Result, Sink, Source, Storage, StorageError};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stores objects as files below a base directory.
#[derive(Debug)]
pub struct FileSystem {
    base_path: PathBuf,
}

/// Removes a partially written file unless it was renamed into place.
struct TempFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        log::warn!("unable to remove temporary file {:?}, {:?}", path, e);
                    }
                });
            }
            // dropped outside a runtime, e.g. during shutdown
            Err(_) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("unable to remove temporary file {:?}, {:?}", path, e);
                }
            }
        }
    }
}

impl FileSystem {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        FileSystem { base_path: base_path.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative.components().all(|component| matches!(component, Component::Normal(_)));

        if !valid {
            return Err(StorageError::transfer(
                "resolve the object path",
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid object key {:?}", key)),
            ));
        }

        Ok(self.base_path.join(relative))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let suffix = format!(
            ".{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let mut file_name = path.file_name().unwrap_or_default().to_os_string();
        file_name.push(suffix);
        path.with_file_name(file_name)
    }

    #[trace(name = "file_system::create_dir")]
    async fn create_dir(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };

        match tokio::fs::create_dir_all(parent).await {
            Ok(_) => Ok(()),
            Err(e) => match e.kind() {
                io::ErrorKind::AlreadyExists => Ok(()),
                _ => Err(StorageError::transfer("create the object directory", e)),
            },
        }
    }

    async fn create_file(path: &Path) -> io::Result<File> {
        OpenOptions::new().write(true).create_new(true).open(path).await
    }

    #[trace(name = "file_system::read_object")]
    async fn read_object(&self, key: &str, sink: &mut Sink<'_>) -> Result<()> {
        let path = self.object_path(key)?;

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => return Err(StorageError::NotFound(key.to_owned())),
                _ => return Err(StorageError::transfer("open the object", e)),
            },
        };

        tokio::io::copy(&mut file, sink)
            .await
            .map_err(|e| StorageError::transfer("copy the object", e))?;

        sink.flush()
            .await
            .map_err(|e| StorageError::transfer("copy the object", e))
    }

    #[trace(name = "file_system::write_object")]
    async fn write_object(&self, key: &str, source: &mut Source<'_>) -> Result<()> {
        let path = self.object_path(key)?;
        let temp_path = Self::temp_path(&path);

        let mut file = match Self::create_file(&temp_path).await {
            Ok(file) => file,
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => {
                    self.create_dir(&path).await?;
                    Self::create_file(&temp_path)
                        .await
                        .map_err(|e| StorageError::transfer("create the object", e))?
                }
                _ => return Err(StorageError::transfer("create the object", e)),
            },
        };
        let mut temp = TempFile { path: temp_path, committed: false };

        tokio::io::copy(source, &mut file)
            .await
            .map_err(|e| StorageError::transfer("write the object", e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::transfer("write the object", e))?;
        drop(file);

        tokio::fs::rename(&temp.path, &path)
            .await
            .map_err(|e| StorageError::transfer("write the object", e))?;
        temp.committed = true;

        Ok(())
    }

    #[trace(name = "file_system::stat_object")]
    async fn stat_object(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;

        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => Ok(false),
                _ => Err(StorageError::transfer("stat the object", e)),
            },
        }
    }
}

#[async_trait::async_trait]
impl Storage for FileSystem {
    async fn fetch(&self, cancel: &CancellationToken, key: &str, sink: &mut Sink<'_>) -> Result<()> {
        cancellable(cancel, "get the object", self.read_object(key, sink)).await
    }

    async fn store(&self, cancel: &CancellationToken, key: &str, source: &mut Source<'_>) -> Result<()> {
        cancellable(cancel, "put the object", self.write_object(key, source)).await
    }

    async fn exists(&self, cancel: &CancellationToken, key: &str) -> Result<bool> {
        cancellable(cancel, "head the object", self.stat_object(key)).await
    }
}
