//! File-based datastore for persistent storage.
//!
//! The file is an append-only log of commit frames:
//!
//! ```text
//! | payload_len: u32 LE | crc32: u32 LE | payload |
//! payload = op*
//! op      = tag: u8 (1 = put, 2 = delete) | key_len: u32 LE | key | [val_len: u32 LE | val]
//! ```
//!
//! One frame is written per `put`, `delete` or `commit`, so a batch is
//! either entirely present or entirely absent after a crash. On open the log
//! is replayed into memory; a torn or corrupt trailing frame is dropped and
//! the file truncated back to the last good frame.

use crate::backend::{Batch, BatchOp, Datastore, Query, QueryIter};
use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use crate::memory::{apply, scan};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
const FRAME_HEADER: usize = 8;

/// A file-backed, crash-tolerant datastore.
///
/// Reads are served from an in-memory index rebuilt at open time; writes
/// append a frame to the log before updating the index.
///
/// # Durability
///
/// - Every write is flushed to the OS before returning
/// - With `sync_on_write` enabled, `File::sync_all()` is also called
///
/// # Example
///
/// ```no_run
/// use threaddb_storage::{Datastore, FileDatastore, Key};
/// use std::path::Path;
///
/// let store = FileDatastore::new(Path::new("data.log"));
/// store.open().unwrap();
/// store.put(&Key::new("/a"), b"persistent".to_vec()).unwrap();
/// store.close().unwrap();
/// ```
#[derive(Debug)]
pub struct FileDatastore {
    path: PathBuf,
    sync_on_write: bool,
    file: Mutex<Option<File>>,
    index: RwLock<BTreeMap<Key, Vec<u8>>>,
}

impl FileDatastore {
    /// Creates a closed datastore backed by the file at `path`.
    ///
    /// Nothing touches the file system until [`Datastore::open`].
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            sync_on_write: false,
            file: Mutex::new(None),
            index: RwLock::new(BTreeMap::new()),
        }
    }

    /// Sets whether every write is synced to disk.
    #[must_use]
    pub fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Returns the path to the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log so it only contains the live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the datastore is closed or the rewrite fails.
    pub fn compact(&self) -> StorageResult<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            return Err(StorageError::NotOpen);
        }

        let ops: Vec<BatchOp> = self
            .index
            .read()
            .iter()
            .map(|(key, value)| BatchOp::Put {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            if !ops.is_empty() {
                tmp.write_all(&encode_frame(&ops))?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        *guard = Some(open_log(&self.path)?);
        debug!(path = %self.path.display(), entries = ops.len(), "compacted datastore log");
        Ok(())
    }

    fn append(&self, ops: Vec<BatchOp>) -> StorageResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StorageError::NotOpen)?;

        let frame = encode_frame(&ops);
        file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        file.flush()?;
        if self.sync_on_write {
            file.sync_all()?;
        }

        apply(&mut self.index.write(), ops);
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.file.lock().is_some() {
            Ok(())
        } else {
            Err(StorageError::NotOpen)
        }
    }
}

fn open_log(path: &Path) -> StorageResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn encode_frame(ops: &[BatchOp]) -> Vec<u8> {
    let mut payload = Vec::new();
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                payload.push(TAG_PUT);
                write_chunk(&mut payload, key.as_str().as_bytes());
                write_chunk(&mut payload, value);
            }
            BatchOp::Delete { key } => {
                payload.push(TAG_DELETE);
                write_chunk(&mut payload, key.as_str().as_bytes());
            }
        }
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

fn write_chunk(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_chunk(data: &[u8], pos: &mut usize) -> StorageResult<Vec<u8>> {
    let len = read_u32(data, *pos)
        .ok_or_else(|| StorageError::Corrupted("truncated chunk length".into()))?
        as usize;
    *pos += 4;
    let chunk = data
        .get(*pos..*pos + len)
        .ok_or_else(|| StorageError::Corrupted("truncated chunk".into()))?;
    *pos += len;
    Ok(chunk.to_vec())
}

fn decode_payload(payload: &[u8]) -> StorageResult<Vec<BatchOp>> {
    let mut ops = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let tag = payload[pos];
        pos += 1;
        let key_bytes = read_chunk(payload, &mut pos)?;
        let key = String::from_utf8(key_bytes)
            .map(Key::new)
            .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        match tag {
            TAG_PUT => {
                let value = read_chunk(payload, &mut pos)?;
                ops.push(BatchOp::Put { key, value });
            }
            TAG_DELETE => ops.push(BatchOp::Delete { key }),
            other => {
                return Err(StorageError::Corrupted(format!("unknown op tag {other}")));
            }
        }
    }
    Ok(ops)
}

/// Replays the log, returning the live entries and the length of the valid prefix.
fn replay(data: &[u8]) -> (BTreeMap<Key, Vec<u8>>, usize) {
    let mut index = BTreeMap::new();
    let mut pos = 0;

    while pos < data.len() {
        let (Some(len), Some(crc)) = (read_u32(data, pos), read_u32(data, pos + 4)) else {
            break;
        };
        let start = pos + FRAME_HEADER;
        let Some(payload) = data.get(start..start + len as usize) else {
            break;
        };
        if compute_crc32(payload) != crc {
            break;
        }
        match decode_payload(payload) {
            Ok(ops) => apply(&mut index, ops),
            Err(_) => break,
        }
        pos = start + len as usize;
    }

    (index, pos)
}

/// Computes CRC32 checksum for data.
fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

impl Datastore for FileDatastore {
    fn open(&self) -> StorageResult<()> {
        let mut guard = self.file.lock();
        if guard.is_some() {
            return Ok(());
        }

        let mut file = open_log(&self.path)?;
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let (index, valid_len) = replay(&data);
        if valid_len < data.len() {
            warn!(
                path = %self.path.display(),
                dropped = data.len() - valid_len,
                "truncating torn tail of datastore log"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        *self.index.write() = index;
        *guard = Some(file);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.take() {
            file.sync_all()?;
        }
        self.index.write().clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    fn get(&self, key: &Key) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.index.read().get(key).cloned())
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> StorageResult<()> {
        self.append(vec![BatchOp::Put {
            key: key.clone(),
            value,
        }])
    }

    fn delete(&self, key: &Key) -> StorageResult<()> {
        self.append(vec![BatchOp::Delete { key: key.clone() }])
    }

    fn has(&self, key: &Key) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.index.read().contains_key(key))
    }

    fn query(&self, query: &Query) -> StorageResult<QueryIter> {
        self.ensure_open()?;
        let entries = scan(&self.index.read(), query);
        Ok(query.finish(entries))
    }

    fn commit(&self, batch: Batch) -> StorageResult<()> {
        if batch.is_empty() {
            return self.ensure_open();
        }
        self.append(batch.into_ops())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        let store = FileDatastore::new(&path);
        assert!(!store.is_open());
        store.open().unwrap();
        assert!(path.exists());
        assert_eq!(store.query(&Query::all()).unwrap().count(), 0);
    }

    #[test]
    fn file_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let store = FileDatastore::new(&path);
            store.open().unwrap();
            store.put(&Key::new("/a"), b"one".to_vec()).unwrap();
            store.put(&Key::new("/b"), b"two".to_vec()).unwrap();
            store.delete(&Key::new("/a")).unwrap();
            store.close().unwrap();
        }

        let store = FileDatastore::new(&path);
        store.open().unwrap();
        assert_eq!(store.get(&Key::new("/a")).unwrap(), None);
        assert_eq!(store.get(&Key::new("/b")).unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn file_batch_is_single_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        let store = FileDatastore::new(&path);
        store.open().unwrap();
        let mut batch = Batch::new();
        batch
            .put(Key::new("/x/1"), vec![1])
            .put(Key::new("/x/2"), vec![2]);
        store.commit(batch).unwrap();
        store.close().unwrap();

        let data = std::fs::read(&path).unwrap();
        let payload_len = read_u32(&data, 0).unwrap() as usize;
        assert_eq!(data.len(), FRAME_HEADER + payload_len);
    }

    #[test]
    fn file_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let store = FileDatastore::new(&path);
            store.open().unwrap();
            store.put(&Key::new("/good"), b"kept".to_vec()).unwrap();
            store.put(&Key::new("/torn"), b"lost".to_vec()).unwrap();
            store.close().unwrap();
        }

        // Simulate a crash in the middle of the second frame.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();

        let store = FileDatastore::new(&path);
        store.open().unwrap();
        assert_eq!(store.get(&Key::new("/good")).unwrap(), Some(b"kept".to_vec()));
        assert_eq!(store.get(&Key::new("/torn")).unwrap(), None);

        // The log was truncated and stays writable.
        store.put(&Key::new("/after"), vec![1]).unwrap();
        store.close().unwrap();
        store.open().unwrap();
        assert!(store.has(&Key::new("/after")).unwrap());
    }

    #[test]
    fn file_corrupt_frame_stops_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let store = FileDatastore::new(&path);
            store.open().unwrap();
            store.put(&Key::new("/a"), b"value".to_vec()).unwrap();
            store.close().unwrap();
        }

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let store = FileDatastore::new(&path);
        store.open().unwrap();
        assert_eq!(store.get(&Key::new("/a")).unwrap(), None);
    }

    #[test]
    fn file_compact_keeps_live_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        let store = FileDatastore::new(&path);
        store.open().unwrap();
        for i in 0..20u8 {
            store.put(&Key::new("/hot"), vec![i]).unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();
        store.compact().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);

        store.close().unwrap();
        store.open().unwrap();
        assert_eq!(store.get(&Key::new("/hot")).unwrap(), Some(vec![19]));
    }

    #[test]
    fn file_closed_operations_fail() {
        let dir = tempdir().unwrap();
        let store = FileDatastore::new(&dir.path().join("store.log"));
        assert!(matches!(
            store.put(&Key::new("/a"), vec![]),
            Err(StorageError::NotOpen)
        ));
        assert!(matches!(store.compact(), Err(StorageError::NotOpen)));
    }

    #[test]
    fn file_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("path").join("store.log");
        let store = FileDatastore::new(&path).sync_on_write(true);
        store.open().unwrap();
        store.put(&Key::new("/a"), vec![1]).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path);
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }
}
