use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;

use crate::Result;
use crate::StoreError;

/// Opens a file for appending, creating it and its parent directories
/// when missing
pub fn open_file_for_append(path: impl AsRef<Path>) -> Result<File> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent).map_err(StoreError::IoError)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())
        .map_err(|e| StoreError::IoError(e).into())
}
