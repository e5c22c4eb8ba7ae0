use crate::file::{FileError, PageId};
use thiserror::Error;

use super::record::RecordId;

/// Broad category of a heap error, for callers that branch on the kind of
/// failure rather than the exact variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed something unusable: oversized record, foreign RID
    Argument,
    /// The RID names a slot that is out of range or deleted
    InvalidRecord,
    /// The record does not fit where it was supposed to go
    Capacity,
    /// The buffer pool or disk manager failed
    Storage,
}

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Record too large: {len} bytes (max {max})")]
    RecordTooLarge { len: usize, max: usize },

    #[error("Page {0} does not belong to this heap file")]
    PageNotInFile(PageId),

    #[error("Heap file has been deleted")]
    FileDeleted,

    #[error("Invalid record: {0}")]
    InvalidSlot(RecordId),

    #[error("Page full: page_id={page_id}, needed {needed} bytes, {available} available")]
    PageFull {
        page_id: PageId,
        needed: usize,
        available: usize,
    },

    #[error("Update of {rid} needs {needed} bytes but the slot holds {capacity}")]
    RecordTooLargeForSlot {
        rid: RecordId,
        needed: usize,
        capacity: usize,
    },

    #[error("Failed to free {} page(s): {}", .0.len(), format_failures(.0))]
    DeleteFailed(Vec<(PageId, FileError)>),

    #[error("Corrupted page {page_id}: {reason}")]
    Corrupted { page_id: PageId, reason: String },
}

impl HeapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeapError::RecordTooLarge { .. }
            | HeapError::PageNotInFile(_)
            | HeapError::FileDeleted => ErrorKind::Argument,
            HeapError::InvalidSlot(_) => ErrorKind::InvalidRecord,
            HeapError::PageFull { .. } | HeapError::RecordTooLargeForSlot { .. } => {
                ErrorKind::Capacity
            }
            HeapError::File(_) | HeapError::DeleteFailed(_) | HeapError::Corrupted { .. } => {
                ErrorKind::Storage
            }
        }
    }
}

fn format_failures(failures: &[(PageId, FileError)]) -> String {
    failures
        .iter()
        .map(|(page_id, err)| format!("page {page_id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type HeapResult<T> = Result<T, HeapError>;
