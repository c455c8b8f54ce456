use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SpindleError};
use crate::query::value::Value;
use crate::storage::{Cursor, Document, IndexDef, IndexKind, StorageEngine};
use crate::types::DocKey;

/// JSON dataset accepted by [`MemoryStore::from_dataset`].
///
/// ```json
/// {
///   "collections": { "users": [{"a": 1}, {"a": 2}] },
///   "indexes": [{ "collection": "users", "name": "idx_a", "field": "a" }],
///   "views": { "search": ["users"] }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    /// Documents per collection, in insertion order.
    pub collections: BTreeMap<String, Vec<serde_json::Value>>,
    /// Single-field hash indexes to create.
    pub indexes: Vec<DatasetIndex>,
    /// View name to linked collections.
    pub views: BTreeMap<String, Vec<String>>,
}

/// Index entry of a [`Dataset`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetIndex {
    /// Collection the index belongs to.
    pub collection: String,
    /// Index name.
    pub name: String,
    /// Indexed attribute.
    pub field: String,
}

struct HashIndex {
    def: IndexDef,
    postings: BTreeMap<Value, Arc<Vec<usize>>>,
}

#[derive(Default)]
struct Collection {
    docs: Arc<Vec<Document>>,
    indexes: Vec<HashIndex>,
}

impl Collection {
    fn index(&self, name: &str) -> Option<&HashIndex> {
        self.indexes
            .iter()
            .find(|index| index.def.name == name)
    }
}

/// In-memory storage collaborator.
///
/// Documents receive ascending keys starting at 1 and a `_key` attribute
/// holding the same number as a string. Hash indexes map attribute values to
/// posting lists in key order.
#[derive(Default)]
pub struct MemoryStore {
    collections: BTreeMap<String, Collection>,
    views: BTreeMap<String, Vec<String>>,
    next_key: u64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a parsed dataset.
    pub fn from_dataset(dataset: Dataset) -> Result<Self> {
        let mut store = Self::new();
        for (name, docs) in dataset.collections {
            store.create_collection(&name)?;
            for doc in docs {
                store.insert(&name, Value::from_json(doc))?;
            }
        }
        for index in dataset.indexes {
            store.ensure_index(&index.collection, &index.name, &index.field)?;
        }
        for (view, collections) in dataset.views {
            store.create_view(&view, collections)?;
        }
        Ok(store)
    }

    /// Loads a JSON dataset file.
    pub fn load_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let dataset: Dataset = serde_json::from_str(&text)?;
        Self::from_dataset(dataset)
    }

    /// Creates an empty collection; existing collections are left untouched.
    pub fn create_collection(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.starts_with('@') {
            return Err(SpindleError::InvalidOwned(format!(
                "invalid collection name '{name}'"
            )));
        }
        self.collections.entry(name.to_owned()).or_default();
        Ok(())
    }

    /// Appends a document and returns its key.
    pub fn insert(&mut self, collection: &str, value: Value) -> Result<DocKey> {
        self.next_key += 1;
        let key = DocKey(self.next_key);
        let value = match value {
            Value::Object(mut map) => {
                map.insert("_key".to_owned(), Value::String(key.to_string()));
                Value::Object(map)
            }
            other => other,
        };
        let coll = self.collection_mut(collection)?;
        let position = coll.docs.len();
        for index in &mut coll.indexes {
            let indexed = value.attribute(&index.def.fields[0]);
            Arc::make_mut(index.postings.entry(indexed).or_default()).push(position);
        }
        Arc::make_mut(&mut coll.docs).push(Document { key, value });
        Ok(key)
    }

    /// Creates a single-field hash index unless one with the same name exists.
    pub fn ensure_index(&mut self, collection: &str, name: &str, field: &str) -> Result<()> {
        let coll = self.collection_mut(collection)?;
        if let Some(existing) = coll.index(name) {
            if existing.def.covers(field) {
                return Ok(());
            }
            return Err(SpindleError::InvalidOwned(format!(
                "index '{name}' already exists on a different field"
            )));
        }
        let mut postings: BTreeMap<Value, Arc<Vec<usize>>> = BTreeMap::new();
        for (position, doc) in coll.docs.iter().enumerate() {
            Arc::make_mut(postings.entry(doc.value.attribute(field)).or_default()).push(position);
        }
        debug!(
            collection,
            index = name,
            field,
            distinct_values = postings.len(),
            "storage.memory.index_built"
        );
        coll.indexes.push(HashIndex {
            def: IndexDef {
                name: name.to_owned(),
                collection: collection.to_owned(),
                fields: vec![field.to_owned()],
                kind: IndexKind::Hash,
            },
            postings,
        });
        Ok(())
    }

    /// Links a view to existing collections.
    pub fn create_view(&mut self, name: &str, collections: Vec<String>) -> Result<()> {
        for collection in &collections {
            if !self.collections.contains_key(collection) {
                return Err(SpindleError::NotFound(format!("collection '{collection}'")));
            }
        }
        self.views.insert(name.to_owned(), collections);
        Ok(())
    }

    /// Number of documents in `collection`.
    pub fn len(&self, collection: &str) -> Result<usize> {
        Ok(self.collection(collection)?.docs.len())
    }

    fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| SpindleError::NotFound(format!("collection '{name}'")))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| SpindleError::NotFound(format!("collection '{name}'")))
    }
}

impl StorageEngine for MemoryStore {
    fn collection_cursor(&self, collection: &str) -> Result<Box<dyn Cursor>> {
        let coll = self.collection(collection)?;
        Ok(Box::new(ScanCursor {
            docs: Arc::clone(&coll.docs),
            pos: 0,
        }))
    }

    fn index_cursor(
        &self,
        collection: &str,
        index: &str,
        lookup: &Value,
    ) -> Result<Box<dyn Cursor>> {
        let coll = self.collection(collection)?;
        let idx = coll
            .index(index)
            .ok_or_else(|| SpindleError::NotFound(format!("index '{index}' on '{collection}'")))?;
        let positions = idx.postings.get(lookup).cloned().unwrap_or_default();
        Ok(Box::new(PostingCursor {
            docs: Arc::clone(&coll.docs),
            positions,
            pos: 0,
        }))
    }

    fn document(&self, collection: &str, key: DocKey) -> Result<Option<Document>> {
        let docs = &self.collection(collection)?.docs;
        Ok(docs
            .binary_search_by_key(&key, |doc| doc.key)
            .ok()
            .and_then(|position| docs.get(position).cloned()))
    }

    fn indexes(&self, collection: &str) -> Result<Vec<IndexDef>> {
        let coll = self.collection(collection)?;
        let mut defs = vec![IndexDef {
            name: "primary".to_owned(),
            collection: collection.to_owned(),
            fields: vec!["_key".to_owned()],
            kind: IndexKind::Primary,
        }];
        defs.extend(coll.indexes.iter().map(|index| index.def.clone()));
        Ok(defs)
    }

    fn view_collections(&self, view: &str) -> Result<Vec<String>> {
        self.views
            .get(view)
            .cloned()
            .ok_or_else(|| SpindleError::NotFound(format!("view '{view}'")))
    }
}

struct ScanCursor {
    docs: Arc<Vec<Document>>,
    pos: usize,
}

impl Cursor for ScanCursor {
    fn next(&mut self) -> Result<Option<Document>> {
        let doc = self.docs.get(self.pos).cloned();
        if doc.is_some() {
            self.pos += 1;
        }
        Ok(doc)
    }

    fn next_key(&mut self) -> Result<Option<DocKey>> {
        let key = self.docs.get(self.pos).map(|doc| doc.key);
        if key.is_some() {
            self.pos += 1;
        }
        Ok(key)
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let remaining = (self.docs.len() - self.pos) as u64;
        let skipped = remaining.min(n);
        self.pos += skipped as usize;
        Ok(skipped)
    }

    fn seek(&mut self, key: DocKey) -> Result<()> {
        self.pos = self.docs.partition_point(|doc| doc.key < key);
        Ok(())
    }
}

struct PostingCursor {
    docs: Arc<Vec<Document>>,
    positions: Arc<Vec<usize>>,
    pos: usize,
}

impl Cursor for PostingCursor {
    fn next(&mut self) -> Result<Option<Document>> {
        let Some(position) = self.positions.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        self.docs
            .get(*position)
            .cloned()
            .map(Some)
            .ok_or_else(|| SpindleError::Storage(format!("dangling posting {position}")))
    }

    fn next_key(&mut self) -> Result<Option<DocKey>> {
        let Some(position) = self.positions.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        self.docs
            .get(*position)
            .map(|doc| Some(doc.key))
            .ok_or_else(|| SpindleError::Storage(format!("dangling posting {position}")))
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let remaining = (self.positions.len() - self.pos) as u64;
        let skipped = remaining.min(n);
        self.pos += skipped as usize;
        Ok(skipped)
    }

    fn seek(&mut self, key: DocKey) -> Result<()> {
        let docs = &self.docs;
        self.pos = self
            .positions
            .partition_point(|position| docs.get(*position).is_some_and(|doc| doc.key < key));
        Ok(())
    }
}
