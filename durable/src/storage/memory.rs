use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use ahash::AHashMap;
use log::{Level, log_enabled, trace};
use parking_lot::Mutex;

use super::{Capabilities, Column, Datum, Expr, Outcome, Row, Statement, Storage};
use crate::StorageError;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<i64, Row>,
    last_id: i64,
}

/// Statement counters, handy for asserting how many round trips an
/// operation cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub statements: usize,
    pub reads: usize,
    pub writes: usize,
}

#[derive(Debug)]
struct MemoryStoreImpl {
    tables: AHashMap<String, Table>,
    capabilities: Capabilities,
    stats: StoreStats,
    injected: VecDeque<StorageError>,
}

/// In-process relational store. Every statement runs under one lock, which
/// gives the per-statement atomicity the substrate relies on.
///
/// Clones share the same tables, so a clone acts as a second writer.
#[derive(Debug, Clone)]
pub struct MemoryStore(Arc<Mutex<MemoryStoreImpl>>);

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::all())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self(Arc::new(Mutex::new(MemoryStoreImpl {
            tables: AHashMap::new(),
            capabilities,
            stats: StoreStats::default(),
            injected: VecDeque::new(),
        })))
    }

    pub fn stats(&self) -> StoreStats {
        self.0.lock().stats
    }

    /// Makes the next statement fail with `error` without touching any row.
    pub fn fail_next(&self, error: StorageError) {
        self.0.lock().injected.push_back(error);
    }

    /// Reads a row without counting it as a statement.
    pub fn peek(&self, table: &str, id: i64) -> Option<Row> {
        self.0.lock().tables.get(table)?.rows.get(&id).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.0.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }
}

impl Storage for MemoryStore {
    fn capabilities(&self) -> Capabilities {
        self.0.lock().capabilities
    }

    fn execute(&self, statement: &Statement) -> Result<Outcome, StorageError> {
        if log_enabled!(Level::Trace) {
            let (sql, params) = statement.to_sql();
            trace!("{sql} -- {params:?}");
        }
        let mut inner = self.0.lock();
        inner.stats.statements += 1;
        if let Some(error) = inner.injected.pop_front() {
            return Err(error);
        }
        inner.run(statement)
    }
}

impl MemoryStoreImpl {
    fn table(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_owned()).or_default()
    }

    fn run(&mut self, statement: &Statement) -> Result<Outcome, StorageError> {
        match statement {
            Statement::NextId { table } => {
                self.stats.writes += 1;
                let table = self.table(table);
                table.last_id += 1;
                Ok(Outcome::Id(table.last_id))
            }
            Statement::Insert { table, id, row } => {
                self.stats.writes += 1;
                let name = table;
                let table = self.table(name);
                if table.rows.contains_key(id) {
                    return Err(StorageError::Constraint(format!("duplicate key {name}#{id}")));
                }
                table.last_id = table.last_id.max(*id);
                table.rows.insert(*id, row.clone());
                Ok(Outcome::Affected(1))
            }
            Statement::Upsert { table, id, row } => {
                self.stats.writes += 1;
                let table = self.table(table);
                table.last_id = table.last_id.max(*id);
                let target = table.rows.entry(*id).or_default();
                for (column, value) in row {
                    target.insert(column.clone(), value.clone());
                }
                Ok(Outcome::Affected(1))
            }
            Statement::Select { table, id, columns } => {
                self.stats.reads += 1;
                if columns.len() > 1 && !self.capabilities.contains(Capabilities::MULTI_COLUMN_SELECT) {
                    return Err(StorageError::Statement("multi-column select is not supported".into()));
                }
                let row = self.tables.get(table).and_then(|t| t.rows.get(id));
                Ok(Outcome::Values(
                    row.map(|row| columns.iter().map(|c| read_column(row, c)).collect()),
                ))
            }
            Statement::SelectRow { table, id } => {
                self.stats.reads += 1;
                Ok(Outcome::Row(
                    self.tables.get(table).and_then(|t| t.rows.get(id)).cloned(),
                ))
            }
            Statement::SelectAll { table } => {
                self.stats.reads += 1;
                Ok(Outcome::Rows(self.tables.get(table).map_or_else(Vec::new, |t| {
                    t.rows.iter().map(|(id, row)| (*id, row.clone())).collect()
                })))
            }
            Statement::Update { table, id, assignments } => {
                self.stats.writes += 1;
                let combined = assignments.iter().any(|(_, e)| e.reads_columns());
                if combined && !self.capabilities.contains(Capabilities::COMBINED_UPDATE) {
                    return Err(StorageError::Statement("combined update is not supported".into()));
                }
                let Some(row) = self.tables.get_mut(table).and_then(|t| t.rows.get_mut(id)) else {
                    return Ok(Outcome::Affected(0));
                };
                // Evaluate everything against the old row before writing.
                let values = assignments
                    .iter()
                    .map(|(_, expr)| eval(row, expr))
                    .collect::<Result<Vec<_>, _>>()?;
                for ((column, _), value) in assignments.iter().zip(values) {
                    write_column(row, column, value);
                }
                Ok(Outcome::Affected(1))
            }
            Statement::Delete { table, id } => {
                self.stats.writes += 1;
                let removed = self.tables.get_mut(table).and_then(|t| t.rows.remove(id));
                Ok(Outcome::Affected(usize::from(removed.is_some())))
            }
        }
    }
}

fn read_column(row: &Row, column: &Column) -> Datum {
    match column {
        Column::Plain(name) => row.get(name).cloned().unwrap_or(Datum::Null),
        Column::Doc { column, key } => row
            .get(column)
            .and_then(|doc| doc.get(key))
            .cloned()
            .unwrap_or(Datum::Null),
    }
}

fn write_column(row: &mut Row, column: &Column, value: Datum) {
    match column {
        Column::Plain(name) => {
            row.insert(name.clone(), value);
        }
        Column::Doc { column, key } => {
            let doc = row
                .entry(column.clone())
                .or_insert_with(|| Datum::Object(serde_json::Map::new()));
            if !doc.is_object() {
                *doc = Datum::Object(serde_json::Map::new());
            }
            if let Datum::Object(map) = doc {
                map.insert(key.clone(), value);
            }
        }
    }
}

fn eval(row: &Row, expr: &Expr) -> Result<Datum, StorageError> {
    match expr {
        Expr::Column(column) => Ok(read_column(row, column)),
        Expr::Param(value) => Ok(value.clone()),
        Expr::Binary { op, lhs, rhs } => op.apply(&eval(row, lhs)?, &eval(row, rhs)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectRef, storage::{BinaryOp, StorageExt}};
    use serde_json::json;

    fn seeded() -> (MemoryStore, ObjectRef) {
        let store = MemoryStore::new();
        let id = store.next_id("Counter").expect("id");
        let mut row = Row::new();
        row.insert("slots".into(), json!({ "n_0": 1, "m_1": 10 }));
        store
            .write(Statement::Insert {
                table: "Counter".into(),
                id,
                row,
            })
            .expect("insert");
        (store, ObjectRef::new("Counter", id))
    }

    #[test]
    fn ids_are_never_reused() {
        let store = MemoryStore::new();
        let a = store.next_id("T").expect("a");
        store
            .write(Statement::Delete { table: "T".into(), id: a })
            .expect("delete");
        let b = store.next_id("T").expect("b");
        assert!(b > a);
    }

    #[test]
    fn combined_update_is_one_statement() {
        let (store, target) = seeded();
        let before = store.stats().statements;
        let n = Column::slot_key("n_0");
        let m = Column::slot_key("m_1");
        let affected = store
            .update(
                &target,
                vec![(n.clone(), Expr::binary(BinaryOp::Add, Expr::Column(m), Expr::Column(n.clone())))],
            )
            .expect("update");
        assert_eq!(affected, 1);
        assert_eq!(store.stats().statements, before + 1);
        assert_eq!(store.select(&target, vec![n]).expect("select"), Some(vec![json!(11)]));
    }

    #[test]
    fn assignments_see_the_old_row() {
        let (store, target) = seeded();
        let n = Column::slot_key("n_0");
        let m = Column::slot_key("m_1");
        store
            .update(
                &target,
                vec![(n.clone(), Expr::Column(m.clone())), (m.clone(), Expr::Column(n.clone()))],
            )
            .expect("swap");
        assert_eq!(store.select(&target, vec![n, m]).expect("select"), Some(vec![json!(10), json!(1)]));
    }

    #[test]
    fn capabilities_are_enforced() {
        let store = MemoryStore::with_capabilities(Capabilities::empty());
        let target = ObjectRef::new("T", 1);
        let err = store
            .update(&target, vec![(Column::plain("a"), Expr::Column(Column::plain("b")))])
            .unwrap_err();
        assert!(matches!(err, StorageError::Statement(_)));
        assert!(store.select(&target, vec![Column::plain("a"), Column::plain("b")]).is_err());
        assert_eq!(store.select(&target, vec![Column::plain("a")]), Ok(None));
    }

    #[test]
    fn injected_failures_leave_rows_untouched() {
        let (store, target) = seeded();
        store.fail_next(StorageError::Connection("reset".into()));
        let n = Column::slot_key("n_0");
        assert!(store.update(&target, vec![(n.clone(), Expr::Param(json!(99)))]).is_err());
        assert_eq!(store.select(&target, vec![n]).expect("select"), Some(vec![json!(1)]));
    }

    #[test]
    fn missing_rows_are_reported_not_created() {
        let store = MemoryStore::new();
        let target = ObjectRef::new("T", 5);
        assert_eq!(store.update(&target, vec![(Column::plain("a"), Expr::Param(json!(1)))]), Ok(0));
        assert_eq!(store.row_count("T"), 0);
    }
}
