//! Scratch files for downloaded media.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use crosspost_queue::ScratchStorage;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hands out unique file names under one directory and removes them on release.
pub struct TempFileManager {
    dir: PathBuf,
}

impl TempFileManager {
    /// Create the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ScratchStorage for TempFileManager {
    fn allocate(&self, extension: &str) -> PathBuf {
        let extension = extension.trim_start_matches('.');
        let name = if extension.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            format!("{}.{extension}", Uuid::new_v4())
        };
        self.dir.join(name)
    }

    async fn release(&self, paths: &[PathBuf]) {
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "scratch file removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch file"),
            }
        }
    }
}
