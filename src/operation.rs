//! Payloads of replicated log records.
//!
//! Every write appends one record: a metadata part naming the modification
//! and the encoded key, a redo part carrying the new value, and an undo part
//! carrying the value the write replaced.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::key::decode;
use crate::key::encode;
use crate::replicator::ReplicatedOperation;

/// Version of the record payload format.
pub const OPERATION_FORMAT_VERSION: u32 = 1;

/// Mutation carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreModification {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOperationData {
    pub version: u32,
    pub modification: StoreModification,
    pub key: Vec<u8>,
}

/// Redo or undo half of a record: the encoded value, absent for a removal
/// redo or an add undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoUndoOperationData {
    pub value: Option<Vec<u8>>,
}

impl MetadataOperationData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl RedoUndoOperationData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Build the record for one write.
///
/// `value` is the new encoded value (none for Remove); `previous` the value
/// being replaced (none for Add).
pub fn build_operation(
    modification: StoreModification,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    previous: Option<Vec<u8>>,
) -> Result<ReplicatedOperation> {
    let metadata = MetadataOperationData {
        version: OPERATION_FORMAT_VERSION,
        modification,
        key,
    };
    let undo = match modification {
        StoreModification::Add => None,
        StoreModification::Update | StoreModification::Remove => {
            Some(RedoUndoOperationData { value: previous }.encode()?)
        }
    };
    Ok(ReplicatedOperation {
        metadata: metadata.encode()?,
        redo: RedoUndoOperationData { value }.encode()?,
        undo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_record_carries_previous_value_in_undo() {
        let op = build_operation(StoreModification::Update, vec![1], Some(vec![2]), Some(vec![3])).unwrap();
        let metadata = MetadataOperationData::decode(&op.metadata).unwrap();
        assert_eq!(metadata.modification, StoreModification::Update);
        assert_eq!(metadata.key, vec![1]);
        assert_eq!(RedoUndoOperationData::decode(&op.redo).unwrap().value, Some(vec![2]));
        assert_eq!(RedoUndoOperationData::decode(op.undo.as_deref().unwrap()).unwrap().value, Some(vec![3]));
    }

    #[test]
    fn test_add_record_has_no_undo_and_remove_no_redo_value() {
        let add = build_operation(StoreModification::Add, vec![1], Some(vec![2]), None).unwrap();
        assert!(add.undo.is_none());

        let remove = build_operation(StoreModification::Remove, vec![1], None, Some(vec![2])).unwrap();
        assert_eq!(RedoUndoOperationData::decode(&remove.redo).unwrap().value, None);
    }
}
