use crate::{
    compare_values, BatchGet, IndexedStore, Query, Result, StoreError, TableSchema, Update,
    UpdateOutcome, WriteOp,
};
use async_trait::async_trait;
use overseer_core::Row;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type Table = BTreeMap<String, Row>;

/// In-process store. Every write takes the same lock, so conditional updates
/// and transactions are atomic with respect to each other.
pub struct MemoryStore {
    schemas: HashMap<String, TableSchema>,
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn new(schemas: Vec<TableSchema>) -> Self {
        let tables = schemas
            .iter()
            .map(|schema| (schema.name.clone(), Table::new()))
            .collect();
        let schemas = schemas
            .into_iter()
            .map(|schema| (schema.name.clone(), schema))
            .collect();

        MemoryStore {
            schemas,
            tables: RwLock::new(tables),
        }
    }

    fn schema(&self, table: &str) -> Result<&TableSchema> {
        self.schemas
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    /// Number of rows in a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |rows| rows.len())
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Rows of `table` matching `query`, in query order, before the limit.
    fn matching<'a>(&self, query: &Query, rows: &'a Table) -> Result<Vec<&'a Row>> {
        let schema = self.schema(&query.table)?;
        let (partition_column, range_column) = schema.query_columns(query)?;

        let mut matched: Vec<&Row> = rows
            .values()
            .filter(|row| {
                row.get(partition_column)
                    .and_then(|v| compare_values(v, &query.partition))
                    == Some(Ordering::Equal)
            })
            .filter(|row| range_column.map_or(true, |column| row.contains_key(column)))
            .filter(|row| query.accepts(row))
            .collect();

        if let Some(column) = range_column {
            matched.sort_by(|a, b| match (a.get(column), b.get(column)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            });
        }
        if query.descending {
            matched.reverse();
        }
        Ok(matched)
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&Table) -> Result<T>) -> Result<T> {
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        f(rows)
    }
}

pub(crate) fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl IndexedStore for MemoryStore {
    async fn get(&self, table: &str, key: &Value) -> Result<Option<Row>> {
        self.schema(table)?;
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .and_then(|rows| rows.get(&key_string(key)))
            .cloned())
    }

    async fn batch_get(&self, table: &str, keys: &[Value]) -> Result<BatchGet> {
        self.schema(table)?;
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .map(|rows| {
                keys.iter()
                    .filter_map(|key| rows.get(&key_string(key)).cloned())
                    .collect()
            })
            .unwrap_or_default();

        Ok(BatchGet {
            rows,
            unprocessed: Vec::new(),
        })
    }

    async fn put(&self, table: &str, row: Row) -> Result<()> {
        let key = key_string(self.schema(table)?.key_of(&row)?);
        let mut tables = self.tables.write();
        tables.entry(table.to_string()).or_default().insert(key, row);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Row>> {
        let limit = query.limit.unwrap_or(usize::MAX);
        self.with_table(&query.table, |rows| {
            Ok(self
                .matching(query, rows)?
                .into_iter()
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        let limit = query.limit.unwrap_or(usize::MAX);
        self.with_table(&query.table, |rows| {
            Ok(self.matching(query, rows)?.len().min(limit))
        })
    }

    async fn update(&self, update: &Update) -> Result<UpdateOutcome> {
        let schema = self.schema(&update.table)?;
        let key = key_string(&update.key);

        let mut tables = self.tables.write();
        let rows = tables.entry(update.table.clone()).or_default();

        let mut row = rows.get(&key).cloned().unwrap_or_default();
        if let Some(condition) = &update.condition {
            if !condition.evaluate(&row) {
                debug!("Condition failed for {}/{}", update.table, key);
                return Ok(UpdateOutcome::ConditionFailed);
            }
        }

        update.apply_to(&mut row);
        row.insert(schema.hash_key.clone(), update.key.clone());
        rows.insert(key, row.clone());
        Ok(UpdateOutcome::Applied(row))
    }

    async fn delete(&self, table: &str, key: &Value) -> Result<()> {
        self.schema(table)?;
        let mut tables = self.tables.write();
        if let Some(rows) = tables.get_mut(table) {
            rows.remove(&key_string(key));
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

        // Validate everything before touching any table.
        let mut resolved = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                WriteOp::Put { table, row } => {
                    let key = key_string(self.schema(&table)?.key_of(&row)?);
                    resolved.push((table, key, Some(row)));
                }
                WriteOp::Delete { table, key } => {
                    self.schema(&table)?;
                    resolved.push((table, key_string(&key), None));
                }
            }
        }

        let mut tables = self.tables.write();
        for (table, key, row) in resolved {
            let rows = tables.entry(table).or_default();
            match row {
                Some(row) => {
                    rows.insert(key, row);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}
