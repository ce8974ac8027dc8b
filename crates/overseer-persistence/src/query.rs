use overseer_core::Row;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A predicate over one row.
///
/// Used as key conditions on an index range key, as post-filters, and as
/// the guard of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    /// Inclusive on both ends.
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    Exists(String),
    NotExists(String),
}

impl Condition {
    pub fn compare(column: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn le(column: &str, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Le, value)
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn ge(column: &str, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ge, value)
    }

    pub fn between(column: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Condition::Between {
            column: column.to_string(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn exists(column: &str) -> Self {
        Condition::Exists(column.to_string())
    }

    pub fn not_exists(column: &str) -> Self {
        Condition::NotExists(column.to_string())
    }

    /// Evaluate against a row. Comparisons on a missing column or on values
    /// of different types are false.
    pub fn evaluate(&self, row: &Row) -> bool {
        match self {
            Condition::Compare { column, op, value } => {
                let Some(actual) = row.get(column) else {
                    return false;
                };
                match compare_values(actual, value) {
                    Some(ordering) => match op {
                        CompareOp::Eq => ordering == Ordering::Equal,
                        CompareOp::Lt => ordering == Ordering::Less,
                        CompareOp::Le => ordering != Ordering::Greater,
                        CompareOp::Gt => ordering == Ordering::Greater,
                        CompareOp::Ge => ordering != Ordering::Less,
                    },
                    None => false,
                }
            }
            Condition::Between { column, low, high } => {
                let Some(actual) = row.get(column) else {
                    return false;
                };
                matches!(
                    compare_values(actual, low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare_values(actual, high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            Condition::Exists(column) => row.get(column).is_some_and(|v| !v.is_null()),
            Condition::NotExists(column) => row.get(column).map_or(true, Value::is_null),
        }
    }
}

/// Order two scalar values of the same kind. Integers compare exactly,
/// mixed numbers as floats.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A query against one partition of a table or of one of its indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub index: Option<String>,
    /// Value of the partition (hash) key.
    pub partition: Value,
    /// Condition on the range key of the index.
    pub range: Option<Condition>,
    pub filters: Vec<Condition>,
    pub limit: Option<usize>,
    pub descending: bool,
}

impl Query {
    pub fn new(table: &str, partition: impl Into<Value>) -> Self {
        Query {
            table: table.to_string(),
            index: None,
            partition: partition.into(),
            range: None,
            filters: Vec::new(),
            limit: None,
            descending: false,
        }
    }

    pub fn index(mut self, index: &str) -> Self {
        self.index = Some(index.to_string());
        self
    }

    pub fn range(mut self, condition: Condition) -> Self {
        self.range = Some(condition);
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// True when a row that already belongs to the partition passes the
    /// range condition and every filter.
    pub fn accepts(&self, row: &Row) -> bool {
        self.range.as_ref().map_or(true, |c| c.evaluate(row))
            && self.filters.iter().all(|c| c.evaluate(row))
    }
}

/// Modify one row in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub key: Value,
    pub set: Row,
    pub increment: Vec<(String, i64)>,
    pub remove: Vec<String>,
    pub condition: Option<Condition>,
}

impl Update {
    pub fn new(table: &str, key: impl Into<Value>) -> Self {
        Update {
            table: table.to_string(),
            key: key.into(),
            set: Row::new(),
            increment: Vec::new(),
            remove: Vec::new(),
            condition: None,
        }
    }

    pub fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set.insert(column.to_string(), value.into());
        self
    }

    pub fn increment(mut self, column: &str, by: i64) -> Self {
        self.increment.push((column.to_string(), by));
        self
    }

    pub fn remove(mut self, column: &str) -> Self {
        self.remove.push(column.to_string());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Apply the modification to `row`.
    pub fn apply_to(&self, row: &mut Row) {
        for (column, value) in &self.set {
            row.insert(column.clone(), value.clone());
        }
        for (column, by) in &self.increment {
            let current = row.get(column).and_then(Value::as_i64).unwrap_or(0);
            row.insert(column.clone(), Value::from(current + by));
        }
        for column in &self.remove {
            row.remove(column);
        }
    }
}
