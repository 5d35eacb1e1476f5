//! Relational storage seam.
//!
//! The substrate speaks to its store through a small statement language
//! ([`Statement`]) executed one statement at a time. Each statement is atomic
//! on its own; nothing spans two statements. Stores advertise optional
//! features through [`Capabilities`], which the reactive engine consults
//! before compiling compound instructions into a single statement.

mod memory;
mod sql;

use std::{collections::BTreeMap, fmt};

use bitflags::bitflags;

use crate::{ObjectRef, StorageError};

pub use memory::{MemoryStore, StoreStats};

/// A single column value. Documents, references and primitives all share
/// the structured document representation.
pub type Datum = serde_json::Value;

/// Column name to value.
pub type Row = BTreeMap<String, Datum>;

pub const ID_COLUMN: &str = "id";
pub const TYPE_COLUMN: &str = "__type";
pub const SLOTS_COLUMN: &str = "slots";
pub const PARENT_COLUMN: &str = "__parent";
pub const CREATOR_COLUMN: &str = "__creator";
pub const CALLER_COLUMN: &str = "__caller";
pub const STATUS_COLUMN: &str = "__status";
pub const PC_COLUMN: &str = "__pc";
pub const EXCEPTION_COLUMN: &str = "__exception";
pub const RESULT_COLUMN: &str = "__result";
pub const RUNSPACE_TABLE: &str = "runspace";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        /// `UPDATE .. SET a = b + ?` evaluated inside the store.
        const COMBINED_UPDATE = 1 << 0;
        /// Several columns of one row in one `SELECT`.
        const MULTI_COLUMN_SELECT = 1 << 1;
    }
}

/// Address of a value inside a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Column {
    /// A regular column.
    Plain(String),
    /// A key inside a document column.
    Doc { column: String, key: String },
}

impl Column {
    pub fn plain(name: impl Into<String>) -> Self {
        Column::Plain(name.into())
    }

    pub fn slot_key(key: impl Into<String>) -> Self {
        Column::Doc {
            column: SLOTS_COLUMN.to_owned(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(Column),
    Param(Datum),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// True when evaluating this needs the store to read its own columns.
    pub fn reads_columns(&self) -> bool {
        match self {
            Expr::Column(_) => true,
            Expr::Param(_) => false,
            Expr::Binary { lhs, rhs, .. } => lhs.reads_columns() || rhs.reads_columns(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Allocates the next id of a table's sequence.
    NextId { table: String },
    Insert { table: String, id: i64, row: Row },
    /// Writes the given columns, creating the row when missing.
    Upsert { table: String, id: i64, row: Row },
    /// Point read of some columns.
    Select { table: String, id: i64, columns: Vec<Column> },
    SelectRow { table: String, id: i64 },
    SelectAll { table: String },
    /// Point update; every expression is evaluated against the row as it
    /// was before the statement.
    Update {
        table: String,
        id: i64,
        assignments: Vec<(Column, Expr)>,
    },
    Delete { table: String, id: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Id(i64),
    /// Values in the requested column order, `None` when the row is missing.
    Values(Option<Vec<Datum>>),
    Row(Option<Row>),
    Rows(Vec<(i64, Row)>),
    Affected(usize),
}

/// A relational store. Implementations must make each statement atomic.
pub trait Storage: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn execute(&self, statement: &Statement) -> Result<Outcome, StorageError>;
}

impl fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

fn unexpected(statement: &Statement, outcome: &Outcome) -> StorageError {
    StorageError::Statement(format!("unexpected outcome {outcome:?} for {statement:?}"))
}

/// Typed helpers over [`Storage::execute`].
pub trait StorageExt: Storage {
    fn next_id(&self, table: &str) -> Result<i64, StorageError> {
        let statement = Statement::NextId { table: table.to_owned() };
        match self.execute(&statement)? {
            Outcome::Id(id) => Ok(id),
            other => Err(unexpected(&statement, &other)),
        }
    }

    fn select(&self, target: &ObjectRef, columns: Vec<Column>) -> Result<Option<Vec<Datum>>, StorageError> {
        let statement = Statement::Select {
            table: target.type_name.clone(),
            id: target.id,
            columns,
        };
        match self.execute(&statement)? {
            Outcome::Values(values) => Ok(values),
            other => Err(unexpected(&statement, &other)),
        }
    }

    fn select_row(&self, table: &str, id: i64) -> Result<Option<Row>, StorageError> {
        let statement = Statement::SelectRow {
            table: table.to_owned(),
            id,
        };
        match self.execute(&statement)? {
            Outcome::Row(row) => Ok(row),
            other => Err(unexpected(&statement, &other)),
        }
    }

    fn select_all(&self, table: &str) -> Result<Vec<(i64, Row)>, StorageError> {
        let statement = Statement::SelectAll { table: table.to_owned() };
        match self.execute(&statement)? {
            Outcome::Rows(rows) => Ok(rows),
            other => Err(unexpected(&statement, &other)),
        }
    }

    /// Returns the number of rows touched (0 or 1).
    fn update(&self, target: &ObjectRef, assignments: Vec<(Column, Expr)>) -> Result<usize, StorageError> {
        let statement = Statement::Update {
            table: target.type_name.clone(),
            id: target.id,
            assignments,
        };
        match self.execute(&statement)? {
            Outcome::Affected(n) => Ok(n),
            other => Err(unexpected(&statement, &other)),
        }
    }

    fn write(&self, statement: Statement) -> Result<usize, StorageError> {
        match self.execute(&statement)? {
            Outcome::Affected(n) => Ok(n),
            other => Err(unexpected(&statement, &other)),
        }
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

// ── Expression evaluation ───────────────────────────────────────────

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }

    /// Integer arithmetic when both sides are integers, float otherwise.
    /// `Add` also concatenates strings. Null operands propagate.
    pub fn apply(self, lhs: &Datum, rhs: &Datum) -> Result<Datum, StorageError> {
        if lhs.is_null() || rhs.is_null() {
            return Ok(Datum::Null);
        }
        if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
            let out = match self {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div if b == 0 => return Err(StorageError::Arithmetic("division by zero".into())),
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Rem if b == 0 => return Err(StorageError::Arithmetic("division by zero".into())),
                BinaryOp::Rem => a.checked_rem(b),
            };
            return out
                .map(Datum::from)
                .ok_or_else(|| StorageError::Arithmetic(format!("integer overflow in {a} {} {b}", self.symbol())));
        }
        if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
            let out = match self {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
            };
            return serde_json::Number::from_f64(out)
                .map(Datum::Number)
                .ok_or_else(|| StorageError::Arithmetic(format!("non-finite result of {a} {} {b}", self.symbol())));
        }
        match (self, lhs, rhs) {
            (BinaryOp::Add, Datum::String(a), Datum::String(b)) => Ok(Datum::String(format!("{a}{b}"))),
            _ => Err(StorageError::Statement(format!(
                "operator {} not defined for {lhs} and {rhs}",
                self.symbol()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_arithmetic_is_checked() {
        assert_eq!(BinaryOp::Add.apply(&json!(2), &json!(3)), Ok(json!(5)));
        assert_eq!(BinaryOp::Rem.apply(&json!(7), &json!(4)), Ok(json!(3)));
        assert!(matches!(
            BinaryOp::Div.apply(&json!(1), &json!(0)),
            Err(StorageError::Arithmetic(_))
        ));
        assert!(matches!(
            BinaryOp::Mul.apply(&json!(i64::MAX), &json!(2)),
            Err(StorageError::Arithmetic(_))
        ));
    }

    #[test]
    fn mixed_operands_promote_to_float() {
        assert_eq!(BinaryOp::Mul.apply(&json!(2), &json!(1.5)), Ok(json!(3.0)));
        assert_eq!(BinaryOp::Add.apply(&json!("a"), &json!("b")), Ok(json!("ab")));
        assert_eq!(BinaryOp::Sub.apply(&Datum::Null, &json!(1)), Ok(Datum::Null));
        assert!(BinaryOp::Sub.apply(&json!("a"), &json!(1)).is_err());
    }

    #[test]
    fn expressions_know_when_they_read_columns() {
        let e = Expr::binary(BinaryOp::Add, Expr::Column(Column::slot_key("n_0")), Expr::Param(json!(1)));
        assert!(e.reads_columns());
        assert!(!Expr::Param(json!(1)).reads_columns());
    }
}
