// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Persistent medium abstraction
//!
//! The ledger only needs a byte-oriented file: check existence and length,
//! read it whole, append durably, cut it back, and replace it atomically.
//! Every call may block on the device. This module
//! provides the trait plus a filesystem implementation and an in-memory one
//! with fault injection for tests.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Trait for the storage backing a ledger
pub trait Medium: Send + 'static {
    /// Whether the store has been created
    fn exists(&self) -> io::Result<bool>;

    /// Current size in bytes
    fn len(&self) -> io::Result<u64>;

    /// Read the full contents
    fn read(&self) -> io::Result<Vec<u8>>;

    /// Append bytes; the data is durable when this returns `Ok`
    ///
    /// On `Err` any prefix of `bytes` may already be in the store.
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Cut the store back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Replace the contents; after a crash either the old or the new
    /// contents are present, never a mix
    fn replace(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Human readable location for diagnostics
    fn describe(&self) -> String;
}

/// Ledger stored in a regular file
#[derive(Debug, Clone)]
pub struct FileMedium {
    path: PathBuf,
}

impl FileMedium {
    /// Use the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }
}

impl Medium for FileMedium {
    fn exists(&self) -> io::Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn len(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn read(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        // No `create`: a vanished ledger must not be recreated headerless.
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(bytes)?;
        file.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()
    }

    fn replace(&mut self, bytes: &[u8]) -> io::Result<()> {
        let dir = self.parent_dir();
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        #[cfg(unix)]
        File::open(dir)?.sync_all()?;

        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Option<Vec<u8>>,
    unavailable: bool,
    tear_next_append: Option<usize>,
    fail_truncate: bool,
}

/// In-memory medium shared between clones
///
/// Clones see the same bytes, so a test can keep one handle to inspect or
/// corrupt the store while the pipeline owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryMedium {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryMedium {
    /// Create an empty, not yet initialized medium
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a medium that already holds `bytes`
    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        let medium = Self::new();
        medium.state().data = Some(bytes.into());
        medium
    }

    /// Simulate the medium going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    /// Make the next append store only the first `keep` bytes and fail
    pub fn tear_next_append(&self, keep: usize) {
        self.state().tear_next_append = Some(keep);
    }

    /// Make truncation fail (or work again)
    pub fn set_truncate_fails(&self, fails: bool) {
        self.state().fail_truncate = fails;
    }

    /// Current raw contents
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.state().data.clone()
    }

    /// Write raw bytes at the end, bypassing availability checks
    pub fn inject(&self, bytes: &[u8]) {
        self.state()
            .data
            .get_or_insert_with(Vec::new)
            .extend_from_slice(bytes);
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(state: &MemoryState) -> io::Result<()> {
        if state.unavailable {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "medium not mounted",
            ));
        }
        Ok(())
    }
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "ledger not created")
}

impl Medium for MemoryMedium {
    fn exists(&self) -> io::Result<bool> {
        let state = self.state();
        Self::check(&state)?;
        Ok(state.data.is_some())
    }

    fn len(&self) -> io::Result<u64> {
        let state = self.state();
        Self::check(&state)?;
        state
            .data
            .as_ref()
            .map(|d| d.len() as u64)
            .ok_or_else(not_found)
    }

    fn read(&self) -> io::Result<Vec<u8>> {
        let state = self.state();
        Self::check(&state)?;
        state.data.clone().ok_or_else(not_found)
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&state)?;
        let tear = state.tear_next_append.take();
        let data = state.data.as_mut().ok_or_else(not_found)?;
        match tear {
            Some(keep) => {
                data.extend_from_slice(&bytes[..keep.min(bytes.len())]);
                Err(io::Error::new(io::ErrorKind::Other, "write interrupted"))
            }
            None => {
                data.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&state)?;
        if state.fail_truncate {
            return Err(io::Error::new(io::ErrorKind::Other, "truncate refused"));
        }
        state.data.as_mut().ok_or_else(not_found)?.truncate(len as usize);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&state)?;
        state.data = Some(bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_medium_lifecycle() {
        let dir = tempdir().unwrap();
        let mut medium = FileMedium::new(dir.path().join("ledger.csv"));

        assert!(!medium.exists().unwrap());
        medium.replace(b"h\n").unwrap();
        assert!(medium.exists().unwrap());

        medium.append(b"a,1\n").unwrap();
        assert_eq!(medium.read().unwrap(), b"h\na,1\n");

        assert_eq!(medium.len().unwrap(), 6);

        medium.truncate(2).unwrap();
        assert_eq!(medium.read().unwrap(), b"h\n");
        assert_eq!(medium.len().unwrap(), 2);
    }

    #[test]
    fn test_file_medium_append_requires_existing_file() {
        let dir = tempdir().unwrap();
        let mut medium = FileMedium::new(dir.path().join("missing.csv"));
        let err = medium.append(b"a,1\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_file_medium_replace_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let mut medium = FileMedium::new(dir.path().join("ledger.csv"));
        medium.replace(b"one\n").unwrap();
        medium.replace(b"two\n").unwrap();

        assert_eq!(medium.read().unwrap(), b"two\n");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_memory_medium_shared_between_clones() {
        let store = MemoryMedium::new();
        let mut medium = store.clone();
        medium.replace(b"h\n").unwrap();
        medium.append(b"x,1\n").unwrap();
        assert_eq!(store.contents().unwrap(), b"h\nx,1\n");
    }

    #[test]
    fn test_memory_medium_torn_append() {
        let mut medium = MemoryMedium::with_contents(b"h\n".to_vec());
        medium.tear_next_append(2);
        assert!(medium.append(b"abc,1\n").is_err());
        assert_eq!(medium.contents().unwrap(), b"h\nab");

        medium.append(b"x\n").unwrap();
        assert_eq!(medium.contents().unwrap(), b"h\nabx\n");
    }

    #[test]
    fn test_memory_medium_unavailable() {
        let mut medium = MemoryMedium::with_contents(b"h\n".to_vec());
        medium.set_available(false);
        assert!(medium.append(b"x,1\n").is_err());
        assert!(medium.read().is_err());

        medium.set_available(true);
        medium.append(b"x,1\n").unwrap();
        assert_eq!(medium.read().unwrap(), b"h\nx,1\n");
    }
}
