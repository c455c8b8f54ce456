//! Storage collaborator contract.
//!
//! The executor never touches document storage directly. It asks a
//! [`StorageEngine`] for cursors over collections and indexes and drives them
//! through the [`Cursor`] trait. On-disk layout, MVCC and index data
//! structures live behind that boundary; [`memory::MemoryStore`] is the
//! in-process reference implementation used by the CLI and the tests.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::value::Value;
use crate::types::DocKey;

/// In-memory collections, hash indexes and views.
pub mod memory;

pub use memory::{Dataset, MemoryStore};

/// Stored document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary key.
    pub key: DocKey,
    /// Document body.
    pub value: Value,
}

/// Index flavour. Only equality lookups are part of the cursor contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Hash index answering equality lookups.
    Hash,
    /// Primary index on `_key`.
    Primary,
}

/// Index metadata as reported by the storage collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique within its collection.
    pub name: String,
    /// Owning collection.
    pub collection: String,
    /// Indexed attributes, in index order.
    pub fields: Vec<String>,
    /// Index flavour.
    pub kind: IndexKind,
}

impl IndexDef {
    /// Whether the index serves equality lookups on exactly `field`.
    pub fn covers(&self, field: &str) -> bool {
        self.fields.len() == 1 && self.fields[0] == field
    }
}

/// Forward cursor over documents in primary key order.
///
/// Implementations release any underlying resources when dropped.
pub trait Cursor: Send {
    /// Returns the next document, or `None` once exhausted.
    fn next(&mut self) -> Result<Option<Document>>;

    /// Returns the key of the next entry without materializing its document.
    fn next_key(&mut self) -> Result<Option<DocKey>> {
        Ok(self.next()?.map(|doc| doc.key))
    }

    /// Advances past up to `n` entries, returning how many were skipped.
    ///
    /// A result smaller than `n` means the cursor is exhausted.
    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            if self.next_key()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Repositions the cursor at the first entry whose key is `>= key`.
    fn seek(&mut self, key: DocKey) -> Result<()>;
}

/// Source of cursors for collections, indexes and views.
pub trait StorageEngine: Send + Sync {
    /// Opens a full scan over `collection`.
    fn collection_cursor(&self, collection: &str) -> Result<Box<dyn Cursor>>;

    /// Opens an equality lookup `index == lookup` on `collection`.
    fn index_cursor(&self, collection: &str, index: &str, lookup: &Value)
        -> Result<Box<dyn Cursor>>;

    /// Fetches the document stored under `key`, if any.
    fn document(&self, collection: &str, key: DocKey) -> Result<Option<Document>> {
        let mut cursor = self.collection_cursor(collection)?;
        cursor.seek(key)?;
        Ok(cursor.next()?.filter(|doc| doc.key == key))
    }

    /// Lists the indexes of `collection`.
    fn indexes(&self, collection: &str) -> Result<Vec<IndexDef>>;

    /// Collections linked to `view`, in link order.
    fn view_collections(&self, view: &str) -> Result<Vec<String>>;
}
