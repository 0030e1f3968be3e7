//! Backup of the last completed checkpoint, and restore from one.
//!
//! A backup directory holds the current table's file pairs and a
//! `current_metadata` naming them; it can be restored into an empty working
//! directory.

use std::path::Path;

use snafu::ResultExt;
use tracing::info;
use tracing::instrument;

use super::Store;
use crate::checkpoint_file::checkpoint_file_path;
use crate::checkpoint_file::CheckpointFileKind;
use crate::error::IoSnafu;
use crate::error::Result;
use crate::error::StoreError;
use crate::key::StoreKey;
use crate::key::StoreValue;
use crate::metadata;
use crate::metadata::MetadataTable;

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Copy the last completed checkpoint into `target`, which must be empty
    /// or absent.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn backup_checkpoint(&self, target: &Path) -> Result<()> {
        self.check_open()?;
        self.require_durable("backup")?;
        tokio::fs::create_dir_all(target).await.context(IoSnafu { path: target })?;
        if !is_empty_dir(target).await? {
            return Err(StoreError::InvalidArgument {
                reason: format!("backup directory {} is not empty", target.display()),
            });
        }

        let table = {
            let _guard = self.metadata_table_lock.lock().await;
            self.current.load_full()
        }
        .ok_or_else(|| StoreError::InvalidState {
            reason: format!("store {} has no completed checkpoint", self.name),
        })?;

        copy_table_files(&table, target).await?;
        metadata::write_table(&metadata::current_metadata_path(target), &table).await?;
        info!(
            store = %self.name,
            target = %target.display(),
            checkpoint_lsn = table.checkpoint_lsn(),
            files = table.file_count(),
            bytes = table.disk_size(),
            "backed up checkpoint"
        );
        Ok(())
    }

    /// Install the checkpoint in `backup` as this store's state.
    ///
    /// The working directory must hold no metadata or checkpoint files.
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn restore_checkpoint(&self, backup: &Path) -> Result<()> {
        self.check_open()?;
        self.require_durable("restore")?;

        let source = metadata::read_table(&metadata::current_metadata_path(backup), backup).await?;
        for file in source.files().values() {
            if !file.exists().await? {
                return Err(StoreError::Corruption {
                    reason: format!("backup file {} ({}) is missing", file.file_id(), file.file_name()),
                });
            }
        }

        tokio::fs::create_dir_all(&self.dir).await.context(IoSnafu { path: &self.dir })?;
        if metadata::open_table(&self.dir).await?.is_some() || !super::checkpoint_files_in(&self.dir).await?.is_empty() {
            return Err(StoreError::InvalidState {
                reason: format!("store {} already has on-disk state", self.name),
            });
        }

        copy_table_files(&source, &self.dir).await?;
        let records = source.files().values().map(|file| file.to_record()).collect();
        let table = MetadataTable::from_records(&self.dir, source.checkpoint_lsn(), records);
        metadata::write_table(&metadata::temp_metadata_path(&self.dir), &table).await?;
        metadata::safe_file_replace(&self.dir).await?;
        info!(
            store = %self.name,
            backup = %backup.display(),
            checkpoint_lsn = table.checkpoint_lsn(),
            files = table.file_count(),
            "restored checkpoint files"
        );

        let table = metadata::open_table(&self.dir).await?.ok_or_else(|| StoreError::Corruption {
            reason: format!("restore into store {} left no metadata table", self.name),
        })?;
        self.install_table(table).await
    }

    fn require_durable(&self, operation: &str) -> Result<()> {
        if !self.config.durable {
            return Err(StoreError::InvalidState {
                reason: format!("{} requires a durable store, {} is volatile", operation, self.name),
            });
        }
        Ok(())
    }
}

async fn is_empty_dir(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await.context(IoSnafu { path: dir })?;
    Ok(entries.next_entry().await.context(IoSnafu { path: dir })?.is_none())
}

/// Copy both halves of every file pair in `table` into `target`.
async fn copy_table_files(table: &MetadataTable, target: &Path) -> Result<()> {
    for file in table.files().values() {
        for (source, kind) in [
            (file.key_path(), CheckpointFileKind::Key),
            (file.value_path(), CheckpointFileKind::Value),
        ] {
            let destination = checkpoint_file_path(target, file.file_name(), kind);
            tokio::fs::copy(&source, &destination).await.context(IoSnafu { path: &source })?;
        }
    }
    Ok(())
}
