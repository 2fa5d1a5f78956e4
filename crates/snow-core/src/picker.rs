//! File dialogs
//!
//! The local backend asks the user for directories and files through
//! [`FilePicker`]. `None` means the user dismissed the dialog.

#[cfg(any(test, feature = "test-util"))]
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
#[cfg(any(test, feature = "test-util"))]
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::models::FileHandle;

#[async_trait]
pub trait FilePicker: Send + Sync {
    /// Choose a site directory to scan
    async fn select_directory(&self) -> BackendResult<Option<PathBuf>>;

    /// Choose an existing file to upload
    async fn open_file(&self) -> BackendResult<Option<FileHandle>>;

    /// Choose where to save a new file
    ///
    /// `suggested` is the proposed location; implementations may return it
    /// unchanged.
    async fn save_file(&self, suggested: &Path) -> BackendResult<Option<FileHandle>>;
}

/// A picker that never answers, for backends that do not use dialogs
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct NoPicker;

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl FilePicker for NoPicker {
    async fn select_directory(&self) -> BackendResult<Option<PathBuf>> {
        Ok(None)
    }

    async fn open_file(&self) -> BackendResult<Option<FileHandle>> {
        Ok(None)
    }

    async fn save_file(&self, _suggested: &Path) -> BackendResult<Option<FileHandle>> {
        Ok(None)
    }
}

/// A picker that replays queued answers
///
/// Save dialogs accept the suggested path unless an explicit answer is
/// queued.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct ScriptedPicker {
    directories: Mutex<VecDeque<Option<PathBuf>>>,
    opens: Mutex<VecDeque<Option<PathBuf>>>,
    saves: Mutex<VecDeque<Option<PathBuf>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedPicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directory(self, dir: impl Into<PathBuf>) -> Self {
        self.push(&self.directories, Some(dir.into()));
        self
    }

    pub fn push_open(&self, path: Option<PathBuf>) {
        self.push(&self.opens, path);
    }

    pub fn push_save(&self, path: Option<PathBuf>) {
        self.push(&self.saves, path);
    }

    pub fn push_directory(&self, path: Option<PathBuf>) {
        self.push(&self.directories, path);
    }

    fn push(&self, queue: &Mutex<VecDeque<Option<PathBuf>>>, value: Option<PathBuf>) {
        queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(value);
    }

    fn pop(queue: &Mutex<VecDeque<Option<PathBuf>>>) -> Option<Option<PathBuf>> {
        queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl FilePicker for ScriptedPicker {
    async fn select_directory(&self) -> BackendResult<Option<PathBuf>> {
        Ok(Self::pop(&self.directories).flatten())
    }

    async fn open_file(&self) -> BackendResult<Option<FileHandle>> {
        Ok(Self::pop(&self.opens).flatten().map(FileHandle::new))
    }

    async fn save_file(&self, suggested: &Path) -> BackendResult<Option<FileHandle>> {
        let answer = Self::pop(&self.saves).unwrap_or_else(|| Some(suggested.to_path_buf()));
        Ok(answer.map(FileHandle::new))
    }
}
