use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::error::{FileError, FileResult};
use super::{PAGE_SIZE, PageId};

/// Allocation state and file directory, persisted next to the database file
#[derive(Debug, Default, Serialize, Deserialize)]
struct DiskMetadata {
    /// High-water mark: every id below it has been handed out at least once
    num_pages: u32,
    /// Ids below the high-water mark that are currently free
    free_pages: BTreeSet<PageId>,
    /// Heap file name -> anchor page
    directory: BTreeMap<String, PageId>,
    #[serde(default)]
    max_pages: Option<u32>,
}

/// Manages the pages of a single database file: allocation, raw page I/O and
/// the directory mapping heap file names to their first page
pub struct DiskManager {
    file: File,
    meta_path: PathBuf,
    meta: DiskMetadata,
}

impl DiskManager {
    /// Create a new, empty database file
    pub fn create<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        Self::create_inner(path.as_ref(), None)
    }

    /// Create a new database file that never grows beyond `max_pages` pages
    pub fn create_with_limit<P: AsRef<Path>>(path: P, max_pages: u32) -> FileResult<Self> {
        Self::create_inner(path.as_ref(), Some(max_pages))
    }

    fn create_inner(path: &Path, max_pages: Option<u32>) -> FileResult<Self> {
        if path.exists() {
            return Err(FileError::FileAlreadyExists(path.display().to_string()));
        }

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let manager = Self {
            file,
            meta_path: meta_path_for(path),
            meta: DiskMetadata {
                max_pages,
                ..DiskMetadata::default()
            },
        };
        manager.save_metadata()?;
        Ok(manager)
    }

    /// Open an existing database file together with its metadata
    pub fn open<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FileError::FileNotFound(path.display().to_string()));
        }

        let meta_path = meta_path_for(path);
        if !meta_path.exists() {
            return Err(FileError::FileNotFound(meta_path.display().to_string()));
        }

        let content = fs::read_to_string(&meta_path)?;
        let meta: DiskMetadata = serde_json::from_str(&content)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file,
            meta_path,
            meta,
        })
    }

    /// Open the database file if it exists, create it otherwise
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Allocate `count` contiguous pages and return the first id.
    /// Freed ids are reused before the file is extended.
    pub fn allocate_pages(&mut self, count: usize) -> FileResult<PageId> {
        if count == 0 {
            return Err(FileError::InvalidPageCount(count));
        }

        if let Some(start) = self.find_free_run(count) {
            for id in start..start + count as u32 {
                self.meta.free_pages.remove(&PageId::new(id));
            }
            return Ok(PageId::new(start));
        }

        let start = self.meta.num_pages;
        let new_total = start as u64 + count as u64;
        let limit = self.meta.max_pages.unwrap_or(PageId::INVALID.as_u32());
        if new_total > limit as u64 {
            return Err(FileError::DiskFull(limit));
        }

        self.meta.num_pages = new_total as u32;
        self.file.set_len(new_total * PAGE_SIZE as u64)?;
        Ok(PageId::new(start))
    }

    /// Lowest run of `count` consecutive free ids, if any
    fn find_free_run(&self, count: usize) -> Option<u32> {
        let mut run_start = None;
        let mut run_len = 0usize;
        let mut prev: Option<u32> = None;

        for id in self.meta.free_pages.iter().map(PageId::as_u32) {
            if prev.is_some_and(|p| p + 1 == id) {
                run_len += 1;
            } else {
                run_start = Some(id);
                run_len = 1;
            }
            if run_len == count {
                return run_start;
            }
            prev = Some(id);
        }
        None
    }

    /// Return a page to the allocator
    pub fn deallocate_page(&mut self, page_id: PageId) -> FileResult<()> {
        if !self.is_allocated(page_id) {
            return Err(FileError::PageNotAllocated(page_id));
        }
        self.meta.free_pages.insert(page_id);
        Ok(())
    }

    /// Check if a page is currently allocated
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        page_id.as_u32() < self.meta.num_pages && !self.meta.free_pages.contains(&page_id)
    }

    /// Number of pages currently allocated
    pub fn allocated_page_count(&self) -> usize {
        self.meta.num_pages as usize - self.meta.free_pages.len()
    }

    /// Read an allocated page into `buffer`
    pub fn read_page(&mut self, page_id: PageId, buffer: &mut [u8]) -> FileResult<()> {
        check_buffer(buffer.len())?;
        if !self.is_allocated(page_id) {
            return Err(FileError::PageNotAllocated(page_id));
        }

        self.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        self.file.read_exact(buffer)?;
        Ok(())
    }

    /// Write `buffer` to an allocated page
    pub fn write_page(&mut self, page_id: PageId, buffer: &[u8]) -> FileResult<()> {
        check_buffer(buffer.len())?;
        if !self.is_allocated(page_id) {
            return Err(FileError::PageNotAllocated(page_id));
        }

        self.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        self.file.write_all(buffer)?;
        // Note: no sync per write, sync() is called by the buffer manager's flush_all()
        Ok(())
    }

    /// Look up the anchor page of a named heap file
    pub fn file_entry(&self, name: &str) -> Option<PageId> {
        self.meta.directory.get(name).copied()
    }

    /// Register a named heap file
    pub fn add_file_entry(&mut self, name: &str, page_id: PageId) -> FileResult<()> {
        if self.meta.directory.contains_key(name) {
            return Err(FileError::FileEntryExists(name.to_string()));
        }
        if !self.is_allocated(page_id) {
            return Err(FileError::PageNotAllocated(page_id));
        }
        self.meta.directory.insert(name.to_string(), page_id);
        Ok(())
    }

    /// Remove a named heap file from the directory
    pub fn delete_file_entry(&mut self, name: &str) -> FileResult<()> {
        self.meta
            .directory
            .remove(name)
            .ok_or_else(|| FileError::FileEntryNotFound(name.to_string()))?;
        Ok(())
    }

    /// All directory entries in name order
    pub fn file_entries(&self) -> impl Iterator<Item = (&str, PageId)> {
        self.meta
            .directory
            .iter()
            .map(|(name, page_id)| (name.as_str(), *page_id))
    }

    /// Persist the metadata and flush OS buffers of the data file
    pub fn sync(&mut self) -> FileResult<()> {
        self.save_metadata()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn save_metadata(&self) -> FileResult<()> {
        let content = serde_json::to_string_pretty(&self.meta)?;
        fs::write(&self.meta_path, content)?;
        Ok(())
    }
}

fn meta_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

fn check_buffer(len: usize) -> FileResult<()> {
    if len != PAGE_SIZE {
        return Err(FileError::InvalidPageSize {
            expected: PAGE_SIZE,
            actual: len,
        });
    }
    Ok(())
}
