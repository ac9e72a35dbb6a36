//! Keyed byte-blob persistence.
//!
//! The [`Store`] trait is the seam towards the record engine: ordered keys,
//! whole-value get/set/delete and cursor iteration, nothing else. Two
//! implementations ship with the crate:
//!
//! - [`MemStore`]: a `BTreeMap` behind a mutex, used by tests and as the
//!   spill target when no path is configured.
//! - [`FileStore`]: loads the whole record file on open, mutates in memory
//!   and rewrites the file on [`Store::flush`] (and on drop). The on-disk
//!   format is the same length-prefixed key/value framing the row records
//!   use.
//!
//! Every store may contain the reserved bookkeeping keys `generated` and
//! `setup`; cursor readers are expected to skip them via [`is_reserved`].

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Reserved bookkeeping keys cursor readers skip.
pub const RESERVED_KEYS: [&[u8]; 2] = [b"generated", b"setup"];

#[must_use]
pub fn is_reserved(key: &[u8]) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Open mode for [`FileStore::open`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail if the file does not exist; mutations are rejected.
    Read,
    /// Fail if the file does not exist; mutations allowed.
    Write,
    /// Create the file if missing; mutations allowed.
    Create,
}

/// Byte-blob record store with ordered cursor iteration.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], val: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Snapshot cursor over all records in key order.
    fn cursor(&self) -> Result<Cursor>;

    /// Persist outstanding mutations, where the backend has any.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Ordered snapshot over a store's records.
pub struct Cursor {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    at: usize,
}

impl Cursor {
    fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { entries, at: 0 }
    }

    pub fn reset(&mut self) {
        self.at = 0;
    }
}

impl Iterator for Cursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.at).cloned();
        self.at += 1;
        entry
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemStore {
    records: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.records.lock().expect("store lock").get(key).cloned())
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.records
            .lock()
            .expect("store lock")
            .insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.records.lock().expect("store lock").remove(key);
        Ok(())
    }

    fn cursor(&self) -> Result<Cursor> {
        let records = self.records.lock().expect("store lock");
        Ok(Cursor::new(
            records.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ))
    }
}

/// File-backed store: full load on open, full rewrite on flush.
pub struct FileStore {
    path: PathBuf,
    mode: StoreMode,
    inner: Mutex<FileStoreInner>,
}

struct FileStoreInner {
    records: BTreeMap<Vec<u8>, Vec<u8>>,
    dirty: bool,
}

impl FileStore {
    /// Open a record file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing in [`StoreMode::Read`] or
    /// [`StoreMode::Write`], or cannot be decoded.
    pub fn open(path: impl AsRef<Path>, mode: StoreMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let records = if path.exists() {
            let mut data = Vec::new();
            File::open(&path)
                .with_context(|| format!("failed to open store {}", path.display()))?
                .read_to_end(&mut data)
                .with_context(|| format!("failed to read store {}", path.display()))?;
            decode_records(&data)
                .with_context(|| format!("corrupt store {}", path.display()))?
        } else {
            if mode != StoreMode::Create {
                bail!("no such store: {}", path.display());
            }
            File::create(&path)
                .with_context(|| format!("failed to create store {}", path.display()))?;
            BTreeMap::new()
        };

        Ok(Self {
            path,
            mode,
            inner: Mutex::new(FileStoreInner {
                records,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_writable(&self) -> Result<()> {
        if self.mode == StoreMode::Read {
            bail!("store {} is read-only", self.path.display());
        }
        Ok(())
    }
}

impl Store for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().expect("store lock").records.get(key).cloned())
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().expect("store lock");
        inner.records.insert(key.to_vec(), val.to_vec());
        inner.dirty = true;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().expect("store lock");
        if inner.records.remove(key).is_some() {
            inner.dirty = true;
        }
        Ok(())
    }

    fn cursor(&self) -> Result<Cursor> {
        let inner = self.inner.lock().expect("store lock");
        Ok(Cursor::new(
            inner
                .records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ))
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        if !inner.dirty {
            return Ok(());
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&encode_records(&inner.records))
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        inner.dirty = false;
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!("store {} not flushed on drop: {err:#}", self.path.display());
        }
    }
}

fn encode_records(records: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, val) in records {
        for blob in [key, val] {
            out.extend_from_slice(
                &u32::try_from(blob.len()).expect("record length fits u32").to_le_bytes(),
            );
            out.extend_from_slice(blob);
        }
    }
    out
}

fn decode_records(data: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut records = BTreeMap::new();
    let mut at = 0usize;

    while at < data.len() {
        let key = read_blob(data, &mut at)?;
        let val = read_blob(data, &mut at)?;
        records.insert(key, val);
    }

    Ok(records)
}

fn read_blob(data: &[u8], at: &mut usize) -> Result<Vec<u8>> {
    if data.len() - *at < 4 {
        bail!("store file truncated in record header");
    }
    let len = u32::from_le_bytes(data[*at..*at + 4].try_into().expect("length width")) as usize;
    *at += 4;
    if data.len() - *at < len {
        bail!("store file truncated inside record");
    }
    let blob = data[*at..*at + len].to_vec();
    *at += len;
    Ok(blob)
}
