//! Copy protocol: streaming a store's state to a replica being built.
//!
//! The producer ([`StoreCopyStream`]) is lazy, forward-only, and not
//! restartable. A durable store streams its current metadata table and the
//! file pairs it references. A volatile store streams a dump of its visible
//! items. The consumer ([`CopyManager`]) rebuilds files in the target
//! directory chunk by chunk; only a stream that reaches `Complete` can be
//! finished.
//!
//! Every chunk is one bincode-encoded [`CopyOperation`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;
use mvstore_constants::copy::COPY_PROTOCOL_VERSION;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::checkpoint_file::checkpoint_file_path;
use crate::checkpoint_file::new_file_name;
use crate::checkpoint_file::CheckpointFileKind;
use crate::error::IoSnafu;
use crate::error::Result;
use crate::error::StoreError;
use crate::item::RecordKind;
use crate::key::decode;
use crate::key::encode;
use crate::metadata;
use crate::metadata::FileRecord;
use crate::metadata::MetadataTable;

/// One chunk of the copy stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyOperation {
    Version {
        version: u32,
        durable: bool,
        checkpoint_lsn: i64,
    },
    MetadataTable {
        data: Vec<u8>,
    },
    StartFile {
        kind: CheckpointFileKind,
        file_name: String,
    },
    FileData {
        data: Vec<u8>,
    },
    EndFile,
    VolatileItems {
        items: Vec<CopyItem>,
    },
    Complete,
}

/// One item of a volatile dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyItem {
    pub key: Vec<u8>,
    pub lsn: i64,
    pub kind: RecordKind,
    pub value: Vec<u8>,
}

// ============================================================================
// Producer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Version,
    Table,
    Files,
    Volatile,
    Complete,
    Done,
}

/// Lazy producer of copy chunks.
pub struct StoreCopyStream {
    stage: Stage,
    durable: bool,
    checkpoint_lsn: i64,
    // Holds the referenced files alive until the stream is dropped.
    table: Option<Arc<MetadataTable>>,
    pending_files: VecDeque<(CheckpointFileKind, String, PathBuf)>,
    open_file: Option<(tokio::fs::File, PathBuf)>,
    volatile_items: std::vec::IntoIter<CopyItem>,
    chunk_size: usize,
    batch_items: usize,
}

impl StoreCopyStream {
    /// Stream the files of `table`.
    pub fn durable(table: Arc<MetadataTable>, chunk_size: usize) -> Self {
        let mut pending_files = VecDeque::new();
        for file in table.files().values() {
            pending_files.push_back((CheckpointFileKind::Key, file.file_name().to_string(), file.key_path()));
            pending_files.push_back((CheckpointFileKind::Value, file.file_name().to_string(), file.value_path()));
        }
        Self {
            stage: Stage::Version,
            durable: true,
            checkpoint_lsn: table.checkpoint_lsn(),
            table: Some(table),
            pending_files,
            open_file: None,
            volatile_items: Vec::new().into_iter(),
            chunk_size: chunk_size.max(1),
            batch_items: 1,
        }
    }

    /// Stream a dump of `items`.
    pub fn volatile(checkpoint_lsn: i64, items: Vec<CopyItem>, batch_items: usize) -> Self {
        Self {
            stage: Stage::Version,
            durable: false,
            checkpoint_lsn,
            table: None,
            pending_files: VecDeque::new(),
            open_file: None,
            volatile_items: items.into_iter(),
            chunk_size: 1,
            batch_items: batch_items.max(1),
        }
    }

    /// Next encoded chunk, or `None` after `Complete` has been produced.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(operation) = self.next_operation().await? else {
            return Ok(None);
        };
        encode(&operation).map(Some)
    }

    async fn next_operation(&mut self) -> Result<Option<CopyOperation>> {
        loop {
            match self.stage {
                Stage::Version => {
                    self.stage = if self.durable { Stage::Table } else { Stage::Volatile };
                    return Ok(Some(CopyOperation::Version {
                        version: COPY_PROTOCOL_VERSION,
                        durable: self.durable,
                        checkpoint_lsn: self.checkpoint_lsn,
                    }));
                }
                Stage::Table => {
                    self.stage = Stage::Files;
                    let data = match &self.table {
                        Some(table) => table.encode()?,
                        None => MetadataTable::new(self.checkpoint_lsn).encode()?,
                    };
                    return Ok(Some(CopyOperation::MetadataTable { data }));
                }
                Stage::Files => {
                    if let Some((file, path)) = self.open_file.as_mut() {
                        let mut data = vec![0u8; self.chunk_size];
                        let read = file.read(&mut data).await.context(IoSnafu { path: path.as_path() })?;
                        if read == 0 {
                            self.open_file = None;
                            return Ok(Some(CopyOperation::EndFile));
                        }
                        data.truncate(read);
                        return Ok(Some(CopyOperation::FileData { data }));
                    }
                    match self.pending_files.pop_front() {
                        Some((kind, file_name, path)) => {
                            let file = tokio::fs::File::open(&path).await.context(IoSnafu { path: &path })?;
                            self.open_file = Some((file, path));
                            return Ok(Some(CopyOperation::StartFile { kind, file_name }));
                        }
                        None => self.stage = Stage::Complete,
                    }
                }
                Stage::Volatile => {
                    let items: Vec<CopyItem> = self.volatile_items.by_ref().take(self.batch_items).collect();
                    if items.is_empty() {
                        self.stage = Stage::Complete;
                        continue;
                    }
                    return Ok(Some(CopyOperation::VolatileItems { items }));
                }
                Stage::Complete => {
                    self.stage = Stage::Done;
                    self.table = None;
                    return Ok(Some(CopyOperation::Complete));
                }
                Stage::Done => return Ok(None),
            }
        }
    }

    /// Adapt into a `Stream` of chunks. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        futures::stream::unfold(self, |mut producer| async move {
            match producer.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), producer)),
                Ok(None) => None,
                Err(e) => {
                    producer.stage = Stage::Done;
                    Some((Err(e), producer))
                }
            }
        })
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// State reconstructed by a finished copy.
#[derive(Debug)]
pub enum CopiedState {
    /// Files and `current_metadata` are in place in the target directory.
    Durable { checkpoint_lsn: i64 },
    Volatile { checkpoint_lsn: i64, items: Vec<CopyItem> },
}

/// Rebuilds state from copy chunks.
#[derive(Debug)]
pub struct CopyManager {
    dir: PathBuf,
    durable: Option<bool>,
    checkpoint_lsn: i64,
    table_records: Option<Vec<FileRecord>>,
    // Producer file name -> local file name.
    renamed: HashMap<String, String>,
    open_file: Option<(tokio::fs::File, PathBuf)>,
    volatile_items: Vec<CopyItem>,
    complete: bool,
    bytes_received: u64,
}

impl CopyManager {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            durable: None,
            checkpoint_lsn: mvstore_constants::INVALID_LSN,
            table_records: None,
            renamed: HashMap::new(),
            open_file: None,
            volatile_items: Vec::new(),
            complete: false,
            bytes_received: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn protocol_error(reason: impl Into<String>) -> StoreError {
        StoreError::Corruption {
            reason: format!("copy stream: {}", reason.into()),
        }
    }

    pub async fn add_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.bytes_received += chunk.len() as u64;
        let operation: CopyOperation = decode(chunk)?;
        if self.complete {
            return Err(Self::protocol_error("chunk after Complete"));
        }
        if self.durable.is_none() && !matches!(operation, CopyOperation::Version { .. }) {
            return Err(Self::protocol_error("first chunk must be Version"));
        }

        match operation {
            CopyOperation::Version {
                version,
                durable,
                checkpoint_lsn,
            } => {
                if version != COPY_PROTOCOL_VERSION {
                    return Err(Self::protocol_error(format!("unsupported version {version}")));
                }
                if self.durable.is_some() {
                    return Err(Self::protocol_error("duplicate Version"));
                }
                self.durable = Some(durable);
                self.checkpoint_lsn = checkpoint_lsn;
            }
            CopyOperation::MetadataTable { data } => {
                let (checkpoint_lsn, records) = metadata::decode_records(&data)?;
                self.checkpoint_lsn = checkpoint_lsn;
                self.table_records = Some(records);
            }
            CopyOperation::StartFile { kind, file_name } => {
                if self.open_file.is_some() {
                    return Err(Self::protocol_error("StartFile while a file is open"));
                }
                let local = self.renamed.entry(file_name).or_insert_with(new_file_name).clone();
                let path = checkpoint_file_path(&self.dir, &local, kind);
                let file = tokio::fs::File::create(&path).await.context(IoSnafu { path: &path })?;
                self.open_file = Some((file, path));
            }
            CopyOperation::FileData { data } => {
                let Some((file, path)) = self.open_file.as_mut() else {
                    return Err(Self::protocol_error("FileData without StartFile"));
                };
                file.write_all(&data).await.context(IoSnafu { path: path.as_path() })?;
            }
            CopyOperation::EndFile => {
                let Some((file, path)) = self.open_file.take() else {
                    return Err(Self::protocol_error("EndFile without StartFile"));
                };
                file.sync_all().await.context(IoSnafu { path })?;
            }
            CopyOperation::VolatileItems { items } => {
                self.volatile_items.extend(items);
            }
            CopyOperation::Complete => {
                if self.open_file.is_some() {
                    return Err(Self::protocol_error("Complete while a file is open"));
                }
                self.complete = true;
            }
        }
        Ok(())
    }

    /// Finalize the copy. Fails with `CopyAborted` if `Complete` never arrived.
    pub async fn finish(self) -> Result<CopiedState> {
        if !self.complete {
            return Err(StoreError::CopyAborted);
        }
        match self.durable {
            Some(true) => {
                let records = self.table_records.ok_or_else(|| Self::protocol_error("no MetadataTable chunk"))?;
                let mut local_records = Vec::with_capacity(records.len());
                for mut record in records {
                    let Some(local) = self.renamed.get(&record.file_name) else {
                        return Err(Self::protocol_error(format!("file {} was never sent", record.file_name)));
                    };
                    record.file_name = local.clone();
                    local_records.push(record);
                }
                let table = MetadataTable::from_records(&self.dir, self.checkpoint_lsn, local_records);
                metadata::write_table(&metadata::temp_metadata_path(&self.dir), &table).await?;
                metadata::safe_file_replace(&self.dir).await?;
                Ok(CopiedState::Durable {
                    checkpoint_lsn: self.checkpoint_lsn,
                })
            }
            Some(false) => Ok(CopiedState::Volatile {
                checkpoint_lsn: self.checkpoint_lsn,
                items: self.volatile_items,
            }),
            None => Err(Self::protocol_error("no Version chunk")),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tempfile::TempDir;

    use super::*;
    use crate::checkpoint_file::write_checkpoint_files;
    use crate::checkpoint_file::CheckpointRecord;
    use crate::metadata::FileMetadata;

    async fn producer_table(dir: &Path) -> Arc<MetadataTable> {
        let records = vec![
            CheckpointRecord {
                key: vec![1],
                lsn: 5,
                kind: RecordKind::Inserted,
                value: Some(vec![7; 40]),
            },
            CheckpointRecord {
                key: vec![2],
                lsn: 6,
                kind: RecordKind::Deleted,
                value: None,
            },
        ];
        let written = write_checkpoint_files(dir, 1, "source", &records).await.unwrap();
        let file = Arc::new(FileMetadata::new(dir, FileRecord {
            file_id: 1,
            file_name: written.file_name,
            total_entries: written.total_entries,
            deleted_entries: written.deleted_entries,
            size_bytes: written.size_bytes,
        }));
        Arc::new(MetadataTable::new(0).with_file(Some(file), 6))
    }

    #[tokio::test]
    async fn test_durable_copy_rebuilds_files_and_metadata() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let table = producer_table(source.path()).await;

        let mut producer = StoreCopyStream::durable(Arc::clone(&table), 16);
        let mut consumer = CopyManager::new(target.path());
        while let Some(chunk) = producer.next_chunk().await.unwrap() {
            consumer.add_chunk(&chunk).await.unwrap();
        }
        assert!(consumer.is_complete());
        let state = consumer.finish().await.unwrap();
        assert!(matches!(state, CopiedState::Durable { checkpoint_lsn: 6 }));

        let copied = metadata::open_table(target.path()).await.unwrap().unwrap();
        assert_eq!(copied.checkpoint_lsn(), 6);
        let file = copied.get(1).unwrap();
        assert_ne!(file.file_name(), "source");
        assert!(file.exists().await.unwrap());
        assert_eq!(
            std::fs::read(file.value_path()).unwrap(),
            std::fs::read(table.get(1).unwrap().value_path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_volatile_copy_batches_items() {
        let items: Vec<CopyItem> = (0..5u8)
            .map(|i| CopyItem {
                key: vec![i],
                lsn: i64::from(i),
                kind: RecordKind::Inserted,
                value: vec![i],
            })
            .collect();
        let chunks: Vec<Vec<u8>> = StoreCopyStream::volatile(9, items.clone(), 2)
            .into_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        // Version + 3 batches + Complete
        assert_eq!(chunks.len(), 5);

        let target = TempDir::new().unwrap();
        let mut consumer = CopyManager::new(target.path());
        for chunk in &chunks {
            consumer.add_chunk(chunk).await.unwrap();
        }
        match consumer.finish().await.unwrap() {
            CopiedState::Volatile {
                checkpoint_lsn,
                items: copied,
            } => {
                assert_eq!(checkpoint_lsn, 9);
                assert_eq!(copied, items);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_stream_is_aborted() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let table = producer_table(source.path()).await;

        let mut producer = StoreCopyStream::durable(table, 1024);
        let mut consumer = CopyManager::new(target.path());
        for _ in 0..3 {
            let chunk = producer.next_chunk().await.unwrap().unwrap();
            consumer.add_chunk(&chunk).await.unwrap();
        }
        assert!(matches!(consumer.finish().await, Err(StoreError::CopyAborted)));
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_is_rejected() {
        let target = TempDir::new().unwrap();
        let mut consumer = CopyManager::new(target.path());
        let chunk = encode(&CopyOperation::EndFile).unwrap();
        assert!(matches!(consumer.add_chunk(&chunk).await, Err(StoreError::Corruption { .. })));
    }
}
