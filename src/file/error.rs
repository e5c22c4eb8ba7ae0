use std::io;
use thiserror::Error;

use super::PageId;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("No directory entry for heap file: {0}")]
    FileEntryNotFound(String),

    #[error("Directory entry already exists: {0}")]
    FileEntryExists(String),

    #[error("Page not allocated: page_id={0}")]
    PageNotAllocated(PageId),

    #[error("Page not pinned: page_id={0}")]
    PageNotPinned(PageId),

    #[error("Page still pinned: page_id={0}, pin_count={1}")]
    PagePinned(PageId, u32),

    #[error("Buffer pool is full (all {0} frames pinned)")]
    BufferPoolFull(usize),

    #[error("Disk is full: limit of {0} pages reached")]
    DiskFull(u32),

    #[error("Invalid page count: {0}")]
    InvalidPageCount(usize),

    #[error("Invalid page size: expected {expected}, got {actual}")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Buffer pool lock poisoned")]
    PoolPoisoned,
}

pub type FileResult<T> = Result<T, FileError>;
