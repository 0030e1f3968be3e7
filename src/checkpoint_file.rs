//! Immutable checkpoint file pairs.
//!
//! A checkpoint writes one key file and one value file sharing a generated
//! name. The value file is the concatenation of encoded values; the key file
//! lists every entry (encoded key, sequence number, kind, value location)
//! followed by a blake3 digest of the listing.

use std::path::Path;
use std::path::PathBuf;

use mvstore_constants::storage::CHECKPOINT_FILE_VERSION;
use mvstore_constants::storage::CHECKSUM_SIZE;
use mvstore_constants::storage::KEY_CHECKPOINT_FILE_SUFFIX;
use mvstore_constants::storage::KEY_FILE_MAGIC;
use mvstore_constants::storage::MAX_VALUE_SIZE;
use mvstore_constants::storage::VALUE_CHECKPOINT_FILE_SUFFIX;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::error::IoSnafu;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::RecordKind;
use crate::item::ValueLocator;
use crate::key::decode;
use crate::key::encode;

/// One entry to be written to a checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub key: Vec<u8>,
    pub lsn: i64,
    pub kind: RecordKind,
    pub value: Option<Vec<u8>>,
}

/// One entry as listed in a key file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCheckpointEntry {
    pub key: Vec<u8>,
    pub lsn: i64,
    pub kind: RecordKind,
    pub value_offset: u64,
    pub value_len: u32,
}

#[derive(Serialize, Deserialize)]
struct KeyFileBody {
    magic: [u8; 8],
    version: u32,
    file_id: u32,
    entries: Vec<KeyCheckpointEntry>,
}

/// Parsed key file.
#[derive(Debug)]
pub struct KeyFile {
    pub file_id: u32,
    pub entries: Vec<KeyCheckpointEntry>,
}

/// Summary of a written checkpoint pair.
#[derive(Debug, Clone)]
pub struct WrittenCheckpoint {
    pub file_name: String,
    pub total_entries: u64,
    pub deleted_entries: u64,
    /// Locator of each input record, in input order.
    pub locators: Vec<ValueLocator>,
    pub size_bytes: u64,
}

/// Which half of a checkpoint pair a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointFileKind {
    Key,
    Value,
}

impl CheckpointFileKind {
    pub fn suffix(self) -> &'static str {
        match self {
            CheckpointFileKind::Key => KEY_CHECKPOINT_FILE_SUFFIX,
            CheckpointFileKind::Value => VALUE_CHECKPOINT_FILE_SUFFIX,
        }
    }
}

/// Fresh unique checkpoint file name (without suffix).
pub fn new_file_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn checkpoint_file_path(dir: &Path, file_name: &str, kind: CheckpointFileKind) -> PathBuf {
    dir.join(format!("{file_name}{}", kind.suffix()))
}

pub fn key_file_path(dir: &Path, file_name: &str) -> PathBuf {
    checkpoint_file_path(dir, file_name, CheckpointFileKind::Key)
}

pub fn value_file_path(dir: &Path, file_name: &str) -> PathBuf {
    checkpoint_file_path(dir, file_name, CheckpointFileKind::Value)
}

/// Split a directory entry name into checkpoint name and kind.
pub fn parse_checkpoint_file_name(entry: &str) -> Option<(&str, CheckpointFileKind)> {
    if let Some(stem) = entry.strip_suffix(KEY_CHECKPOINT_FILE_SUFFIX) {
        return Some((stem, CheckpointFileKind::Key));
    }
    entry.strip_suffix(VALUE_CHECKPOINT_FILE_SUFFIX).map(|stem| (stem, CheckpointFileKind::Value))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await.context(IoSnafu { path })?;
    file.write_all(bytes).await.context(IoSnafu { path })?;
    file.sync_all().await.context(IoSnafu { path })?;
    Ok(())
}

/// Write a checkpoint pair for `records` (which must be in key order).
pub async fn write_checkpoint_files(
    dir: &Path,
    file_id: u32,
    file_name: &str,
    records: &[CheckpointRecord],
) -> Result<WrittenCheckpoint> {
    let mut values = Vec::new();
    let mut entries = Vec::with_capacity(records.len());
    let mut locators = Vec::with_capacity(records.len());
    let mut deleted_entries = 0u64;

    for record in records {
        let value = match (&record.kind, &record.value) {
            (RecordKind::Deleted, _) => {
                deleted_entries += 1;
                &[][..]
            }
            (_, Some(value)) => value.as_slice(),
            (_, None) => {
                return Err(StoreError::InvalidState {
                    reason: format!("live entry at lsn {} has no value to checkpoint", record.lsn),
                });
            }
        };
        if value.len() as u64 > MAX_VALUE_SIZE {
            return Err(StoreError::InvalidArgument {
                reason: format!("value of {} bytes exceeds {MAX_VALUE_SIZE}", value.len()),
            });
        }
        let locator = ValueLocator {
            file_id,
            offset: values.len() as u64,
            len: value.len() as u32,
        };
        values.extend_from_slice(value);
        entries.push(KeyCheckpointEntry {
            key: record.key.clone(),
            lsn: record.lsn,
            kind: record.kind,
            value_offset: locator.offset,
            value_len: locator.len,
        });
        locators.push(locator);
    }

    let body = encode(&KeyFileBody {
        magic: KEY_FILE_MAGIC,
        version: CHECKPOINT_FILE_VERSION,
        file_id,
        entries,
    })?;
    let mut key_bytes = body;
    let digest = blake3::hash(&key_bytes);
    key_bytes.extend_from_slice(digest.as_bytes());

    write_synced(&value_file_path(dir, file_name), &values).await?;
    write_synced(&key_file_path(dir, file_name), &key_bytes).await?;

    tracing::debug!(
        file_id,
        file_name,
        entries = records.len(),
        deleted_entries,
        value_bytes = values.len(),
        "wrote checkpoint files"
    );

    Ok(WrittenCheckpoint {
        file_name: file_name.to_string(),
        total_entries: records.len() as u64,
        deleted_entries,
        locators,
        size_bytes: (values.len() + key_bytes.len()) as u64,
    })
}

/// Read and verify a key file.
pub async fn read_key_file(path: &Path) -> Result<KeyFile> {
    let bytes = tokio::fs::read(path).await.context(IoSnafu { path })?;
    if bytes.len() < CHECKSUM_SIZE {
        return Err(StoreError::Corruption {
            reason: format!("key file {} is truncated", path.display()),
        });
    }
    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
    if blake3::hash(body).as_bytes()[..] != checksum[..] {
        return Err(StoreError::Corruption {
            reason: format!("key file {} checksum mismatch", path.display()),
        });
    }
    let body: KeyFileBody = decode(body)?;
    if body.magic != KEY_FILE_MAGIC || body.version != CHECKPOINT_FILE_VERSION {
        return Err(StoreError::Corruption {
            reason: format!("key file {} has unknown format version {}", path.display(), body.version),
        });
    }
    Ok(KeyFile {
        file_id: body.file_id,
        entries: body.entries,
    })
}

/// Read one value from a value file.
pub async fn read_value(path: &Path, locator: ValueLocator) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await.context(IoSnafu { path })?;
    file.seek(std::io::SeekFrom::Start(locator.offset)).await.context(IoSnafu { path })?;
    let mut buf = vec![0u8; locator.len as usize];
    file.read_exact(&mut buf).await.context(IoSnafu { path })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn record(key: u8, lsn: i64, kind: RecordKind, value: Option<&[u8]>) -> CheckpointRecord {
        CheckpointRecord {
            key: vec![key],
            lsn,
            kind,
            value: value.map(|v| v.to_vec()),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_pair_reads_back_entries_and_values() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            record(1, 10, RecordKind::Inserted, Some(b"one")),
            record(2, 11, RecordKind::Deleted, None),
            record(3, 12, RecordKind::Updated, Some(b"three")),
        ];
        let written = write_checkpoint_files(dir.path(), 7, "pair", &records).await.unwrap();
        assert_eq!(written.total_entries, 3);
        assert_eq!(written.deleted_entries, 1);
        assert_eq!(written.locators[1].len, 0);

        let key_file = read_key_file(&key_file_path(dir.path(), "pair")).await.unwrap();
        assert_eq!(key_file.file_id, 7);
        assert_eq!(key_file.entries.len(), 3);
        assert_eq!(key_file.entries[2].lsn, 12);

        let value = read_value(&value_file_path(dir.path(), "pair"), written.locators[2]).await.unwrap();
        assert_eq!(value, b"three");
    }

    #[tokio::test]
    async fn test_corrupted_key_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let records = vec![record(1, 1, RecordKind::Inserted, Some(b"x"))];
        write_checkpoint_files(dir.path(), 1, "pair", &records).await.unwrap();

        let path = key_file_path(dir.path(), "pair");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(read_key_file(&path).await, Err(StoreError::Corruption { .. })));
    }

    #[tokio::test]
    async fn test_live_record_without_value_is_rejected() {
        let dir = TempDir::new().unwrap();
        let records = vec![record(1, 1, RecordKind::Inserted, None)];
        let err = write_checkpoint_files(dir.path(), 1, "pair", &records).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
    }

    #[test]
    fn test_parse_checkpoint_file_name() {
        let name = new_file_name();
        let key = format!("{name}{KEY_CHECKPOINT_FILE_SUFFIX}");
        assert_eq!(parse_checkpoint_file_name(&key), Some((name.as_str(), CheckpointFileKind::Key)));
        let value = format!("{name}{VALUE_CHECKPOINT_FILE_SUFFIX}");
        assert_eq!(parse_checkpoint_file_name(&value), Some((name.as_str(), CheckpointFileKind::Value)));
        assert_eq!(parse_checkpoint_file_name("current_metadata"), None);
    }
}
