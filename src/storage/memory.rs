//! In-memory storage implementation for testing and ephemeral indexes.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, RwiError};
use crate::storage::{Storage, StorageConfig, StorageInput, StorageOutput, StorageRw};

type FileMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// An in-memory storage implementation.
///
/// Useful for tests and for cells that never need to survive a restart.
#[derive(Debug)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: FileMap,
    /// Storage configuration.
    #[allow(dead_code)]
    config: StorageConfig,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| RwiError::storage(format!("File not found: {name}")))?;

        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(data.clone()),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            cursor: Cursor::new(Vec::new()),
            files: Arc::clone(&self.files),
        }))
    }

    fn open_rw(&self, name: &str) -> Result<Box<dyn StorageRw>> {
        let data = {
            let files = self.files.lock();
            files
                .get(name)
                .cloned()
                .ok_or_else(|| RwiError::storage(format!("File not found: {name}")))?
        };

        Ok(Box::new(MemoryRw {
            name: name.to_string(),
            cursor: Cursor::new(data),
            files: Arc::clone(&self.files),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut file_names: Vec<String> = self.files.lock().keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| RwiError::storage(format!("File not found: {name}")))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| RwiError::storage(format!("File not found: {old_name}")))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Input stream over a snapshot of one in-memory file.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Output stream buffering into memory; the file becomes visible in the
/// map on flush or close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    cursor: Cursor<Vec<u8>>,
    files: FileMap,
}

impl MemoryOutput {
    fn commit(&mut self) {
        self.files
            .lock()
            .insert(self.name.clone(), self.cursor.get_ref().clone());
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.cursor.position())
    }

    fn close(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.commit();
    }
}

/// Random-access rewrite handle over one in-memory file.
#[derive(Debug)]
pub struct MemoryRw {
    name: String,
    cursor: Cursor<Vec<u8>>,
    files: FileMap,
}

impl MemoryRw {
    fn commit(&mut self) {
        self.files
            .lock()
            .insert(self.name.clone(), self.cursor.get_ref().clone());
    }
}

impl Read for MemoryRw {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for MemoryRw {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Seek for MemoryRw {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageRw for MemoryRw {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemoryRw {
    fn drop(&mut self) {
        self.commit();
    }
}
