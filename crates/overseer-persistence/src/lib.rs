mod memory;
mod query;
mod rocks;
mod store;

pub use memory::MemoryStore;
pub use query::{compare_values, CompareOp, Condition, Query, Update};
pub use rocks::{RocksStore, RocksStoreConfig};
pub use store::{
    BatchGet, IndexSchema, IndexedStore, TableSchema, UpdateOutcome, WriteOp,
    MAX_TRANSACTION_ITEMS,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown index {index} on table {table}")]
    UnknownIndex { table: String, index: String },

    #[error("Row for table {table} is missing key column {column}")]
    MissingKey { table: String, column: String },

    #[error("Transaction of {actual} operations exceeds the limit of {max}")]
    TransactionTooLarge { max: usize, actual: usize },

    #[error("Transactions are not supported by this store")]
    TransactionsUnsupported,

    #[error("Store temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::IoError(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
