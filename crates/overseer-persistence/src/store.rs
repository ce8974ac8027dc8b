use crate::{Query, Result, StoreError, Update};
use async_trait::async_trait;
use overseer_core::Row;
use serde_json::Value;

/// Largest number of operations one `transact_write` may carry.
pub const MAX_TRANSACTION_ITEMS: usize = 10;

/// A secondary index: rows are partitioned by `hash_key` and sorted by
/// `range_key`. Rows lacking either column are not indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub hash_key: String,
    pub range_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub hash_key: String,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(name: &str, hash_key: &str) -> Self {
        TableSchema {
            name: name.to_string(),
            hash_key: hash_key.to_string(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, name: &str, hash_key: &str, range_key: &str) -> Self {
        self.indexes.push(IndexSchema {
            name: name.to_string(),
            hash_key: hash_key.to_string(),
            range_key: range_key.to_string(),
        });
        self
    }

    pub fn index(&self, name: &str) -> Result<&IndexSchema> {
        self.indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| StoreError::UnknownIndex {
                table: self.name.clone(),
                index: name.to_string(),
            })
    }

    /// Primary key value of `row`.
    pub fn key_of<'a>(&self, row: &'a Row) -> Result<&'a Value> {
        row.get(&self.hash_key).ok_or_else(|| StoreError::MissingKey {
            table: self.name.clone(),
            column: self.hash_key.clone(),
        })
    }

    /// Partition and sort columns for a query, either the table's own key or
    /// one of its indexes.
    pub fn query_columns<'a>(&'a self, query: &Query) -> Result<(&'a str, Option<&'a str>)> {
        match &query.index {
            Some(name) => {
                let index = self.index(name)?;
                Ok((index.hash_key.as_str(), Some(index.range_key.as_str())))
            }
            None => Ok((self.hash_key.as_str(), None)),
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The update was written; carries the row as stored afterwards.
    Applied(Row),
    /// The guard condition did not hold and nothing was written.
    ConditionFailed,
}

/// One write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put { table: String, row: Row },
    Delete { table: String, key: Value },
}

impl WriteOp {
    pub fn put(table: &str, row: Row) -> Self {
        WriteOp::Put {
            table: table.to_string(),
            row,
        }
    }

    pub fn delete(table: &str, key: impl Into<Value>) -> Self {
        WriteOp::Delete {
            table: table.to_string(),
            key: key.into(),
        }
    }
}

/// Response of a batch get. Keys the store did not get to are returned in
/// `unprocessed` and may be requested again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGet {
    pub rows: Vec<Row>,
    pub unprocessed: Vec<Value>,
}

/// A schema-typed key-value store with secondary indexes and conditional
/// writes.
#[async_trait]
pub trait IndexedStore: Send + Sync {
    async fn get(&self, table: &str, key: &Value) -> Result<Option<Row>>;

    async fn batch_get(&self, table: &str, keys: &[Value]) -> Result<BatchGet>;

    /// Insert or replace a row.
    async fn put(&self, table: &str, row: Row) -> Result<()>;

    /// Rows of one partition in range-key order.
    async fn query(&self, query: &Query) -> Result<Vec<Row>>;

    /// Number of rows `query` would return, without materializing them.
    async fn count(&self, query: &Query) -> Result<usize>;

    /// Compare-and-swap update. When the row does not exist the condition is
    /// evaluated against an empty row; without a condition the row is created.
    async fn update(&self, update: &Update) -> Result<UpdateOutcome>;

    async fn delete(&self, table: &str, key: &Value) -> Result<()>;

    /// Apply all operations or none of them.
    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<()>;

    fn supports_transactions(&self) -> bool {
        true
    }

    fn max_transaction_items(&self) -> usize {
        MAX_TRANSACTION_ITEMS
    }
}
