//! Metadata tables: the durable directory of checkpoint file pairs.
//!
//! A [`MetadataTable`] is an immutable generation: a checkpoint LSN plus the
//! files it references. The store holds up to three generations (current,
//! next, merge) behind atomically swapped handles; loaders borrow a
//! generation for the duration of a read instead of counting references by
//! hand.
//!
//! Files are shared between generations via `Arc<FileMetadata>`. A file marked
//! deletable is removed from disk when the last handle to it drops, so it
//! survives until no generation, loader, or copy stream can reach it.
//!
//! # On-disk format
//!
//! `current_metadata` is the bincode-encoded table followed by a blake3
//! digest. It is replaced through `temp_metadata` and `backup_metadata` so
//! that a crash at any point leaves one valid table behind.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mvstore_constants::storage::BACKUP_METADATA_FILE_NAME;
use mvstore_constants::storage::CHECKSUM_SIZE;
use mvstore_constants::storage::CURRENT_METADATA_FILE_NAME;
use mvstore_constants::storage::MAX_FILES_PER_TABLE;
use mvstore_constants::storage::METADATA_FILE_MAGIC;
use mvstore_constants::storage::METADATA_FILE_VERSION;
use mvstore_constants::storage::TEMP_METADATA_FILE_NAME;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;

use crate::checkpoint_file;
use crate::error::IoSnafu;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::ValueLocator;
use crate::key::decode;
use crate::key::encode;

// ============================================================================
// File metadata
// ============================================================================

/// One checkpoint file pair referenced by a metadata table.
#[derive(Debug)]
pub struct FileMetadata {
    file_id: u32,
    file_name: String,
    total_entries: u64,
    deleted_entries: u64,
    size_bytes: u64,
    dir: PathBuf,
    can_be_deleted: AtomicBool,
}

impl FileMetadata {
    pub fn new(dir: &Path, record: FileRecord) -> Self {
        Self {
            file_id: record.file_id,
            file_name: record.file_name,
            total_entries: record.total_entries,
            deleted_entries: record.deleted_entries,
            size_bytes: record.size_bytes,
            dir: dir.to_path_buf(),
            can_be_deleted: AtomicBool::new(false),
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    pub fn deleted_entries(&self) -> u64 {
        self.deleted_entries
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn key_path(&self) -> PathBuf {
        checkpoint_file::key_file_path(&self.dir, &self.file_name)
    }

    pub fn value_path(&self) -> PathBuf {
        checkpoint_file::value_file_path(&self.dir, &self.file_name)
    }

    /// Delete the files once the last handle drops.
    pub fn mark_deletable(&self) {
        self.can_be_deleted.store(true, Ordering::Release);
    }

    pub fn can_be_deleted(&self) -> bool {
        self.can_be_deleted.load(Ordering::Acquire)
    }

    /// True if both halves of the pair exist.
    pub async fn exists(&self) -> Result<bool> {
        for path in [self.key_path(), self.value_path()] {
            if !tokio::fs::try_exists(&path).await.context(IoSnafu { path: &path })? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn read_value(&self, locator: ValueLocator) -> Result<Vec<u8>> {
        debug_assert_eq!(locator.file_id, self.file_id, "FILE_METADATA: locator for another file");
        checkpoint_file::read_value(&self.value_path(), locator).await
    }

    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            file_id: self.file_id,
            file_name: self.file_name.clone(),
            total_entries: self.total_entries,
            deleted_entries: self.deleted_entries,
            size_bytes: self.size_bytes,
        }
    }
}

impl Drop for FileMetadata {
    fn drop(&mut self) {
        if !self.can_be_deleted() {
            return;
        }
        for path in [self.key_path(), self.value_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete checkpoint file"),
            }
        }
        tracing::debug!(file_id = self.file_id, file_name = %self.file_name, "deleted checkpoint files");
    }
}

/// Serialized form of [`FileMetadata`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: u32,
    pub file_name: String,
    pub total_entries: u64,
    pub deleted_entries: u64,
    pub size_bytes: u64,
}

#[derive(Serialize, Deserialize)]
struct MetadataFileBody {
    magic: [u8; 8],
    version: u32,
    checkpoint_lsn: i64,
    files: Vec<FileRecord>,
}

// ============================================================================
// Metadata table
// ============================================================================

/// One generation of the file directory.
#[derive(Debug, Clone)]
pub struct MetadataTable {
    checkpoint_lsn: i64,
    files: BTreeMap<u32, Arc<FileMetadata>>,
}

impl MetadataTable {
    pub fn new(checkpoint_lsn: i64) -> Self {
        Self {
            checkpoint_lsn,
            files: BTreeMap::new(),
        }
    }

    pub fn from_records(dir: &Path, checkpoint_lsn: i64, records: Vec<FileRecord>) -> Self {
        let files = records
            .into_iter()
            .map(|record| (record.file_id, Arc::new(FileMetadata::new(dir, record))))
            .collect();
        Self { checkpoint_lsn, files }
    }

    pub fn checkpoint_lsn(&self) -> i64 {
        self.checkpoint_lsn
    }

    pub fn files(&self) -> &BTreeMap<u32, Arc<FileMetadata>> {
        &self.files
    }

    pub fn get(&self, file_id: u32) -> Option<&Arc<FileMetadata>> {
        self.files.get(&file_id)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn max_file_id(&self) -> Option<u32> {
        self.files.keys().next_back().copied()
    }

    pub fn total_entries(&self) -> u64 {
        self.files.values().map(|file| file.total_entries()).sum()
    }

    pub fn disk_size(&self) -> u64 {
        self.files.values().map(|file| file.size_bytes()).sum()
    }

    /// Next generation: these files plus `file`, at `checkpoint_lsn`.
    pub fn with_file(&self, file: Option<Arc<FileMetadata>>, checkpoint_lsn: i64) -> Self {
        debug_assert!(
            checkpoint_lsn >= self.checkpoint_lsn,
            "METADATA: checkpoint lsn regressed from {} to {}",
            self.checkpoint_lsn,
            checkpoint_lsn
        );
        let mut files = self.files.clone();
        if let Some(file) = file {
            files.insert(file.file_id(), file);
        }
        Self { checkpoint_lsn, files }
    }

    /// Mark every referenced file for deletion on last drop.
    pub fn mark_all_deletable(&self) {
        for file in self.files.values() {
            file.mark_deletable();
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        debug_assert!(
            self.files.len() <= MAX_FILES_PER_TABLE as usize,
            "METADATA: {} files exceeds limit {}",
            self.files.len(),
            MAX_FILES_PER_TABLE
        );
        let mut bytes = encode(&MetadataFileBody {
            magic: METADATA_FILE_MAGIC,
            version: METADATA_FILE_VERSION,
            checkpoint_lsn: self.checkpoint_lsn,
            files: self.files.values().map(|file| file.to_record()).collect(),
        })?;
        let digest = blake3::hash(&bytes);
        bytes.extend_from_slice(digest.as_bytes());
        Ok(bytes)
    }

    /// Decode a table whose files live in `dir`.
    pub fn decode(bytes: &[u8], dir: &Path) -> Result<Self> {
        let (checkpoint_lsn, records) = decode_records(bytes)?;
        Ok(Self::from_records(dir, checkpoint_lsn, records))
    }
}

/// Verify and decode a metadata file into its checkpoint LSN and file records.
pub fn decode_records(bytes: &[u8]) -> Result<(i64, Vec<FileRecord>)> {
    if bytes.len() < CHECKSUM_SIZE {
        return Err(StoreError::Corruption {
            reason: "metadata table is truncated".to_string(),
        });
    }
    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
    if blake3::hash(body).as_bytes()[..] != checksum[..] {
        return Err(StoreError::Corruption {
            reason: "metadata table checksum mismatch".to_string(),
        });
    }
    let body: MetadataFileBody = decode(body)?;
    if body.magic != METADATA_FILE_MAGIC || body.version != METADATA_FILE_VERSION {
        return Err(StoreError::Corruption {
            reason: format!("metadata table has unknown format version {}", body.version),
        });
    }
    Ok((body.checkpoint_lsn, body.files))
}

// ============================================================================
// Metadata files
// ============================================================================

pub fn current_metadata_path(dir: &Path) -> PathBuf {
    dir.join(CURRENT_METADATA_FILE_NAME)
}

pub fn temp_metadata_path(dir: &Path) -> PathBuf {
    dir.join(TEMP_METADATA_FILE_NAME)
}

pub fn backup_metadata_path(dir: &Path) -> PathBuf {
    dir.join(BACKUP_METADATA_FILE_NAME)
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path).await.context(IoSnafu { path })
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn rename(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::rename(from, to).await.context(IoSnafu { path: from })
}

/// Write `table` to `path` and fsync it.
pub async fn write_table(path: &Path, table: &MetadataTable) -> Result<()> {
    let bytes = table.encode()?;
    let mut file = tokio::fs::File::create(path).await.context(IoSnafu { path })?;
    file.write_all(&bytes).await.context(IoSnafu { path })?;
    file.sync_all().await.context(IoSnafu { path })?;
    Ok(())
}

/// Read a table file; its checkpoint files are resolved relative to `dir`.
pub async fn read_table(path: &Path, dir: &Path) -> Result<MetadataTable> {
    let bytes = tokio::fs::read(path).await.context(IoSnafu { path })?;
    MetadataTable::decode(&bytes, dir)
}

/// Promote `temp_metadata` to `current_metadata`, keeping the old current as
/// `backup_metadata` until the promotion lands.
pub async fn safe_file_replace(dir: &Path) -> Result<()> {
    let current = current_metadata_path(dir);
    let temp = temp_metadata_path(dir);
    let backup = backup_metadata_path(dir);

    if !exists(&temp).await? {
        return Err(StoreError::InvalidState {
            reason: format!("{} does not exist", temp.display()),
        });
    }
    if exists(&current).await? {
        remove_if_exists(&backup).await?;
        rename(&current, &backup).await?;
    }
    rename(&temp, &current).await?;
    remove_if_exists(&backup).await?;
    Ok(())
}

/// Open the authoritative table in `dir`, repairing an interrupted replace.
///
/// Returns `None` when the directory holds no metadata at all.
pub async fn open_table(dir: &Path) -> Result<Option<MetadataTable>> {
    let current = current_metadata_path(dir);
    let temp = temp_metadata_path(dir);
    let backup = backup_metadata_path(dir);

    if exists(&current).await? {
        // Temp from a checkpoint that never completed; backup from a replace
        // that finished promoting.
        remove_if_exists(&temp).await?;
        remove_if_exists(&backup).await?;
        return read_table(&current, dir).await.map(Some);
    }

    if exists(&temp).await? {
        match read_table(&temp, dir).await {
            Ok(_) => {
                tracing::info!(dir = %dir.display(), "promoting temp metadata left by interrupted replace");
                rename(&temp, &current).await?;
                remove_if_exists(&backup).await?;
                return read_table(&current, dir).await.map(Some);
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "discarding invalid temp metadata");
                remove_if_exists(&temp).await?;
            }
        }
    }

    if exists(&backup).await? {
        tracing::info!(dir = %dir.display(), "restoring backup metadata");
        rename(&backup, &current).await?;
        return read_table(&current, dir).await.map(Some);
    }

    Ok(None)
}

/// Remove all three metadata files.
pub async fn remove_metadata_files(dir: &Path) -> Result<()> {
    remove_if_exists(&current_metadata_path(dir)).await?;
    remove_if_exists(&temp_metadata_path(dir)).await?;
    remove_if_exists(&backup_metadata_path(dir)).await
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn record(file_id: u32, name: &str) -> FileRecord {
        FileRecord {
            file_id,
            file_name: name.to_string(),
            total_entries: 10,
            deleted_entries: 2,
            size_bytes: 100,
        }
    }

    fn table(dir: &Path, lsn: i64, ids: &[u32]) -> MetadataTable {
        MetadataTable::from_records(dir, lsn, ids.iter().map(|id| record(*id, &format!("f{id}"))).collect())
    }

    #[test]
    fn test_encode_decode_preserves_table() {
        let dir = TempDir::new().unwrap();
        let original = table(dir.path(), 42, &[1, 3]);
        let decoded = MetadataTable::decode(&original.encode().unwrap(), dir.path()).unwrap();
        assert_eq!(decoded.checkpoint_lsn(), 42);
        assert_eq!(decoded.file_count(), 2);
        assert_eq!(decoded.get(3).unwrap().file_name(), "f3");
        assert_eq!(decoded.total_entries(), 20);
        assert_eq!(decoded.max_file_id(), Some(3));
    }

    #[test]
    fn test_decode_rejects_flipped_byte() {
        let dir = TempDir::new().unwrap();
        let mut bytes = table(dir.path(), 1, &[1]).encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        assert!(matches!(MetadataTable::decode(&bytes, dir.path()), Err(StoreError::Corruption { .. })));
    }

    #[test]
    fn test_deletable_file_removed_on_last_drop() {
        let dir = TempDir::new().unwrap();
        let file = Arc::new(FileMetadata::new(dir.path(), record(1, "gone")));
        std::fs::write(file.key_path(), b"k").unwrap();
        std::fs::write(file.value_path(), b"v").unwrap();

        let first = MetadataTable::new(1).with_file(Some(Arc::clone(&file)), 1);
        let second = first.with_file(None, 2);
        drop(file);
        first.mark_all_deletable();
        drop(first);
        assert!(dir.path().join("gone.sptr").exists());

        drop(second);
        assert!(!dir.path().join("gone.sptr").exists());
        assert!(!dir.path().join("gone.sptv").exists());
    }

    #[test]
    fn test_unmarked_file_survives_drop() {
        let dir = TempDir::new().unwrap();
        let file = FileMetadata::new(dir.path(), record(1, "kept"));
        std::fs::write(file.key_path(), b"k").unwrap();
        drop(file);
        assert!(dir.path().join("kept.sptr").exists());
    }

    #[tokio::test]
    async fn test_safe_file_replace_swaps_current() {
        let dir = TempDir::new().unwrap();
        write_table(&current_metadata_path(dir.path()), &table(dir.path(), 1, &[])).await.unwrap();
        write_table(&temp_metadata_path(dir.path()), &table(dir.path(), 2, &[])).await.unwrap();

        safe_file_replace(dir.path()).await.unwrap();

        let opened = open_table(dir.path()).await.unwrap().unwrap();
        assert_eq!(opened.checkpoint_lsn(), 2);
        assert!(!temp_metadata_path(dir.path()).exists());
        assert!(!backup_metadata_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_open_discards_stale_temp_when_current_exists() {
        let dir = TempDir::new().unwrap();
        write_table(&current_metadata_path(dir.path()), &table(dir.path(), 1, &[])).await.unwrap();
        write_table(&temp_metadata_path(dir.path()), &table(dir.path(), 5, &[])).await.unwrap();

        let opened = open_table(dir.path()).await.unwrap().unwrap();
        assert_eq!(opened.checkpoint_lsn(), 1);
        assert!(!temp_metadata_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_open_promotes_temp_after_crash_mid_replace() {
        let dir = TempDir::new().unwrap();
        // Crash after current -> backup, before temp -> current.
        write_table(&backup_metadata_path(dir.path()), &table(dir.path(), 1, &[])).await.unwrap();
        write_table(&temp_metadata_path(dir.path()), &table(dir.path(), 2, &[])).await.unwrap();

        let opened = open_table(dir.path()).await.unwrap().unwrap();
        assert_eq!(opened.checkpoint_lsn(), 2);
        assert!(!backup_metadata_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_open_restores_backup_when_temp_is_corrupt() {
        let dir = TempDir::new().unwrap();
        write_table(&backup_metadata_path(dir.path()), &table(dir.path(), 3, &[])).await.unwrap();
        std::fs::write(temp_metadata_path(dir.path()), b"garbage").unwrap();

        let opened = open_table(dir.path()).await.unwrap().unwrap();
        assert_eq!(opened.checkpoint_lsn(), 3);
        assert!(current_metadata_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_open_empty_directory_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(open_table(dir.path()).await.unwrap().is_none());
    }
}
