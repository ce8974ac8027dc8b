use crate::memory::key_string;
use crate::{
    BatchGet, CompareOp, Condition, IndexedStore, Query, Result, StoreError, TableSchema, Update,
    UpdateOutcome, WriteOp,
};
use async_trait::async_trait;
use overseer_core::Row;
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Configuration for the RocksDB store
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    pub data_dir: PathBuf,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        RocksStoreConfig {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Persistent store on RocksDB.
///
/// Each table is a column family keyed by its primary key; each index is a
/// column family named `{table}.{index}` whose keys sort by
/// `partition \0 range(i64, big endian, sign flipped) primary_key`.
/// Index range keys must be integers. All writes are serialized through one
/// mutex and land as a single `WriteBatch`, which makes conditional updates a
/// compare-and-swap.
pub struct RocksStore {
    db: DB,
    schemas: HashMap<String, TableSchema>,
    write_lock: Mutex<()>,
}

fn index_cf_name(table: &str, index: &str) -> String {
    format!("{}.{}", table, index)
}

fn encode_range(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

fn partition_prefix(partition: &Value) -> Vec<u8> {
    let mut prefix = key_string(partition).into_bytes();
    prefix.push(0);
    prefix
}

/// The half-open span `[lower, upper)` of index keys a query can match.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyBounds {
    lower: Vec<u8>,
    upper: Vec<u8>,
    /// Every index key inside the bounds satisfies the range condition.
    exact: bool,
}

impl KeyBounds {
    fn new(partition: &Value, range_key: &str, range: Option<&Condition>) -> Self {
        let prefix = partition_prefix(partition);
        let mut end = prefix.clone();
        if let Some(last) = end.last_mut() {
            *last = 1;
        }

        let at = |value: i64| {
            let mut key = prefix.clone();
            key.extend_from_slice(&encode_range(value));
            key
        };
        let after = |value: i64| value.checked_add(1).map_or_else(|| end.clone(), at);

        let bounds = match range {
            Some(Condition::Compare { column, op, value }) if column == range_key => {
                value.as_i64().map(|value| match op {
                    CompareOp::Eq => (at(value), after(value)),
                    CompareOp::Lt => (prefix.clone(), at(value)),
                    CompareOp::Le => (prefix.clone(), after(value)),
                    CompareOp::Gt => (after(value), end.clone()),
                    CompareOp::Ge => (at(value), end.clone()),
                })
            }
            Some(Condition::Between { column, low, high }) if column == range_key => {
                match (low.as_i64(), high.as_i64()) {
                    (Some(low), Some(high)) => Some((at(low), after(high))),
                    _ => None,
                }
            }
            Some(_) => None,
            None => Some((prefix.clone(), end.clone())),
        };

        match bounds {
            Some((lower, upper)) => KeyBounds {
                lower,
                upper,
                exact: true,
            },
            // Not expressible on the encoded keys; rows are checked one by one.
            None => KeyBounds {
                lower: prefix,
                upper: end,
                exact: false,
            },
        }
    }

    fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    fn contains(&self, key: &[u8]) -> bool {
        key >= self.lower.as_slice() && key < self.upper.as_slice()
    }
}

impl RocksStore {
    /// Open or create the store
    pub fn open(config: RocksStoreConfig, schemas: Vec<TableSchema>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.data_dir.join("tables");

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut cf_descriptors = Vec::new();
        for schema in &schemas {
            cf_descriptors.push(ColumnFamilyDescriptor::new(&schema.name, Options::default()));
            for index in &schema.indexes {
                cf_descriptors.push(ColumnFamilyDescriptor::new(
                    index_cf_name(&schema.name, &index.name),
                    Options::default(),
                ));
            }
        }

        let db = DB::open_cf_descriptors(&db_opts, db_path, cf_descriptors)?;
        info!("Opened RocksDB store at {:?}", config.data_dir);

        Ok(RocksStore {
            db,
            schemas: schemas
                .into_iter()
                .map(|schema| (schema.name.clone(), schema))
                .collect(),
            write_lock: Mutex::new(()),
        })
    }

    fn schema(&self, table: &str) -> Result<&TableSchema> {
        self.schemas
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Other(format!("CF {} not found", name)))
    }

    fn read_row(&self, table: &str, key: &str) -> Result<Option<Row>> {
        let cf = self.cf(table)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn index_keys(&self, schema: &TableSchema, row: &Row) -> Result<Vec<(String, Vec<u8>)>> {
        let primary = key_string(schema.key_of(row)?);
        let mut keys = Vec::new();

        for index in &schema.indexes {
            let partition = row.get(&index.hash_key);
            let range = row.get(&index.range_key).and_then(Value::as_i64);
            if let (Some(partition), Some(range)) = (partition, range) {
                let mut key = partition_prefix(partition);
                key.extend_from_slice(&encode_range(range));
                key.extend_from_slice(primary.as_bytes());
                keys.push((index_cf_name(&schema.name, &index.name), key));
            }
        }

        Ok(keys)
    }

    /// Queue removal of `old` and insertion of `new` (either may be absent).
    fn stage(
        &self,
        batch: &mut WriteBatch,
        schema: &TableSchema,
        key: &str,
        old: Option<&Row>,
        new: Option<&Row>,
    ) -> Result<()> {
        if let Some(old) = old {
            for (cf_name, index_key) in self.index_keys(schema, old)? {
                batch.delete_cf(self.cf(&cf_name)?, index_key);
            }
        }

        let table_cf = self.cf(&schema.name)?;
        match new {
            Some(row) => {
                batch.put_cf(table_cf, key.as_bytes(), serde_json::to_vec(row)?);
                for (cf_name, index_key) in self.index_keys(schema, row)? {
                    batch.put_cf(self.cf(&cf_name)?, index_key, key.as_bytes());
                }
            }
            None => batch.delete_cf(table_cf, key.as_bytes()),
        }
        Ok(())
    }

    /// Number of index entries inside `bounds`. Only the index column
    /// family is read.
    fn count_in_bounds(&self, index_cf: &ColumnFamily, bounds: &KeyBounds) -> Result<usize> {
        if bounds.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        let mode = IteratorMode::From(&bounds.lower, Direction::Forward);
        for item in self.db.iterator_cf(index_cf, mode) {
            let (index_key, _) = item?;
            if !bounds.contains(&index_key) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn run_query(&self, query: &Query) -> Result<Vec<Row>> {
        let schema = self.schema(&query.table)?;
        let limit = query.limit.unwrap_or(usize::MAX);

        let Some(index_name) = &query.index else {
            // Primary key lookup: the partition value is the key itself.
            let row = self.read_row(&schema.name, &key_string(&query.partition))?;
            return Ok(row.into_iter().filter(|row| query.accepts(row)).take(limit).collect());
        };

        let index = schema.index(index_name)?;
        let index_cf = self.cf(&index_cf_name(&schema.name, index_name))?;
        let bounds = KeyBounds::new(&query.partition, &index.range_key, query.range.as_ref());

        let mut rows = Vec::new();
        if limit == 0 || bounds.is_empty() {
            return Ok(rows);
        }

        let mode = if query.descending {
            IteratorMode::From(&bounds.upper, Direction::Reverse)
        } else {
            IteratorMode::From(&bounds.lower, Direction::Forward)
        };

        for item in self.db.iterator_cf(index_cf, mode) {
            let (index_key, primary) = item?;
            if !bounds.contains(&index_key) {
                // A reverse seek may land on the upper bound itself.
                if query.descending && index_key.as_ref() >= bounds.upper.as_slice() {
                    continue;
                }
                break;
            }

            let primary = String::from_utf8_lossy(&primary).into_owned();
            let Some(row) = self.read_row(&schema.name, &primary)? else {
                debug!("Dangling index entry for {}/{}", schema.name, primary);
                continue;
            };

            if query.accepts(&row) {
                rows.push(row);
                if rows.len() >= limit {
                    break;
                }
            }
        }

        Ok(rows)
    }

    fn count_index_entries(&self, query: &Query) -> Result<Option<usize>> {
        let Some(index_name) = &query.index else {
            return Ok(None);
        };
        if !query.filters.is_empty() {
            return Ok(None);
        }

        let schema = self.schema(&query.table)?;
        let index = schema.index(index_name)?;
        let bounds = KeyBounds::new(&query.partition, &index.range_key, query.range.as_ref());
        if !bounds.exact {
            return Ok(None);
        }

        let index_cf = self.cf(&index_cf_name(&schema.name, index_name))?;
        let count = self.count_in_bounds(index_cf, &bounds)?;
        Ok(Some(count.min(query.limit.unwrap_or(usize::MAX))))
    }
}

#[async_trait]
impl IndexedStore for RocksStore {
    async fn get(&self, table: &str, key: &Value) -> Result<Option<Row>> {
        self.schema(table)?;
        self.read_row(table, &key_string(key))
    }

    async fn batch_get(&self, table: &str, keys: &[Value]) -> Result<BatchGet> {
        self.schema(table)?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.read_row(table, &key_string(key))? {
                rows.push(row);
            }
        }
        Ok(BatchGet {
            rows,
            unprocessed: Vec::new(),
        })
    }

    async fn put(&self, table: &str, row: Row) -> Result<()> {
        let schema = self.schema(table)?;
        let key = key_string(schema.key_of(&row)?);

        let _guard = self.write_lock.lock();
        let old = self.read_row(table, &key)?;
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, schema, &key, old.as_ref(), Some(&row))?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Row>> {
        self.run_query(query)
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        match self.count_index_entries(query)? {
            Some(count) => Ok(count),
            None => Ok(self.run_query(query)?.len()),
        }
    }

    async fn update(&self, update: &Update) -> Result<UpdateOutcome> {
        let schema = self.schema(&update.table)?;
        let key = key_string(&update.key);

        let _guard = self.write_lock.lock();
        let old = self.read_row(&update.table, &key)?;

        let mut row = old.clone().unwrap_or_default();
        if let Some(condition) = &update.condition {
            if !condition.evaluate(&row) {
                return Ok(UpdateOutcome::ConditionFailed);
            }
        }

        update.apply_to(&mut row);
        row.insert(schema.hash_key.clone(), update.key.clone());

        let mut batch = WriteBatch::default();
        self.stage(&mut batch, schema, &key, old.as_ref(), Some(&row))?;
        self.db.write(batch)?;
        Ok(UpdateOutcome::Applied(row))
    }

    async fn delete(&self, table: &str, key: &Value) -> Result<()> {
        let schema = self.schema(table)?;
        let key = key_string(key);

        let _guard = self.write_lock.lock();
        if let Some(old) = self.read_row(table, &key)? {
            let mut batch = WriteBatch::default();
            self.stage(&mut batch, schema, &key, Some(&old), None)?;
            self.db.write(batch)?;
        }
        Ok(())
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.len() > self.max_transaction_items() {
            return Err(StoreError::TransactionTooLarge {
                max: self.max_transaction_items(),
                actual: ops.len(),
            });
        }

        let _guard = self.write_lock.lock();

        // Rows as they will look once earlier operations of this batch apply.
        let mut staged: HashMap<(String, String), Option<Row>> = HashMap::new();
        let mut batch = WriteBatch::default();

        for op in ops {
            let (table, key, new) = match op {
                WriteOp::Put { table, row } => {
                    let key = key_string(self.schema(&table)?.key_of(&row)?);
                    (table, key, Some(row))
                }
                WriteOp::Delete { table, key } => {
                    self.schema(&table)?;
                    (table, key_string(&key), None)
                }
            };

            let slot = (table, key);
            let old = match staged.get(&slot) {
                Some(row) => row.clone(),
                None => self.read_row(&slot.0, &slot.1)?,
            };

            let schema = self.schema(&slot.0)?;
            self.stage(&mut batch, schema, &slot.1, old.as_ref(), new.as_ref())?;
            staged.insert(slot, new);
        }

        self.db.write(batch)?;
        Ok(())
    }
}
