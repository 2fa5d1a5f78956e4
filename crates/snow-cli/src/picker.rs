//! File dialogs answered from command-line arguments

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use snow_core::error::BackendResult;
use snow_core::{FileHandle, FilePicker};

/// Answers each dialog with the path given on the command line
///
/// A save dialog without an explicit path accepts the suggested location.
#[derive(Debug, Clone, Default)]
pub struct PathPicker {
    pub directory: Option<PathBuf>,
    pub open: Option<PathBuf>,
    pub save: Option<PathBuf>,
}

#[async_trait]
impl FilePicker for PathPicker {
    async fn select_directory(&self) -> BackendResult<Option<PathBuf>> {
        Ok(self.directory.clone())
    }

    async fn open_file(&self) -> BackendResult<Option<FileHandle>> {
        Ok(self.open.clone().map(FileHandle::new))
    }

    async fn save_file(&self, suggested: &Path) -> BackendResult<Option<FileHandle>> {
        let path = self.save.clone().unwrap_or_else(|| suggested.to_path_buf());
        Ok(Some(FileHandle::new(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_defaults_to_suggestion() {
        let picker = PathPicker::default();
        let handle = picker
            .save_file(Path::new("/site/static/media/a.png"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.path(), Path::new("/site/static/media/a.png"));
        assert!(picker.open_file().await.unwrap().is_none());

        let picker = PathPicker {
            save: Some(PathBuf::from("/elsewhere/b.png")),
            ..PathPicker::default()
        };
        let handle = picker.save_file(Path::new("/ignored")).await.unwrap().unwrap();
        assert_eq!(handle.path(), Path::new("/elsewhere/b.png"));
    }
}
