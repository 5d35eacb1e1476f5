//! Instruction execution against reactive rows.
//!
//! Nothing is cached: primitive reads and writes are point statements, and
//! compound instructions are compiled into a single `UPDATE` whenever every
//! column they read lives in the destination row. Operands from another row
//! cost one extra read, bound as a parameter. Those two statements are not
//! atomic as a whole.

use std::sync::Arc;

use log::{trace, warn};

use crate::{
    DerefEngine, DurableError, FrameId, Instance, ObjectHandle, ObjectRef, PrimitiveKind, Result,
    SlotDescriptor, Value,
    storage::{BinaryOp, Capabilities, Column, Datum, Expr, StorageExt},
    value::{decode, encode},
};

/// One side of a compound instruction.
#[derive(Debug, Clone)]
pub enum Operand {
    Slot(ObjectHandle, usize),
    Value(Value),
}

impl Operand {
    pub fn slot(handle: &ObjectHandle, index: usize) -> Self {
        Operand::Slot(handle.clone(), index)
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Value(value)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Value(Value::Int(value))
    }
}

fn reactive_row(handle: &ObjectHandle) -> Option<(&Arc<Instance>, &ObjectRef)> {
    match handle {
        ObjectHandle::Local(instance) if instance.is_reactive() => {
            instance.object_ref().map(|r| (instance, r))
        }
        _ => None,
    }
}

fn slot_of(handle: &ObjectHandle, index: usize) -> Result<SlotDescriptor> {
    let ty = match handle {
        ObjectHandle::Local(instance) => instance.type_descriptor(),
        ObjectHandle::Deferred(cell) => cell.type_descriptor(),
    };
    ty.slot_at(index).cloned()
}

fn accepts(dst: PrimitiveKind, src: PrimitiveKind) -> bool {
    dst == src || (dst == PrimitiveKind::Float && src == PrimitiveKind::Int)
}

fn value_kind(value: &Value) -> Option<PrimitiveKind> {
    Some(match value {
        Value::Null => return None,
        Value::Int(_) => PrimitiveKind::Int,
        Value::Float(_) => PrimitiveKind::Float,
        Value::Bool(_) => PrimitiveKind::Bool,
        Value::Str(_) => PrimitiveKind::Str,
        Value::Type(_) => PrimitiveKind::Type,
        Value::Object(_) => PrimitiveKind::Object,
    })
}

#[derive(Debug)]
pub struct ReactiveEngine {
    deref: Arc<DerefEngine>,
    combine_reads: bool,
}

impl ReactiveEngine {
    pub fn new(deref: Arc<DerefEngine>, combine_reads: bool) -> Self {
        Self { deref, combine_reads }
    }

    fn capabilities(&self) -> Capabilities {
        self.deref.storage().capabilities()
    }

    pub fn get(&self, handle: &ObjectHandle, index: usize, frame: Option<FrameId>) -> Result<Value> {
        match reactive_row(handle) {
            Some((instance, _)) => instance.get(index, &*self.deref),
            None => self.deref.get_slot(handle, index, frame),
        }
    }

    /// Writes one slot. Lazy targets are persisted first so the stored
    /// reference is resolvable by any reader.
    pub fn set(&self, handle: &ObjectHandle, index: usize, value: Value, frame: Option<FrameId>) -> Result<()> {
        self.deref.set_slot(handle, index, value, frame)
    }

    /// Reads several slots of one object, in one statement when the store
    /// can and combining is enabled.
    pub fn get_many(&self, handle: &ObjectHandle, indices: &[usize], frame: Option<FrameId>) -> Result<Vec<Value>> {
        let Some((instance, object_ref)) = reactive_row(handle) else {
            return indices
                .iter()
                .map(|&index| self.deref.get_slot(handle, index, frame))
                .collect();
        };
        let ty = instance.type_descriptor();
        let slots = indices
            .iter()
            .map(|&index| ty.slot_at(index))
            .collect::<Result<Vec<_>>>()?;
        let columns = slots.iter().map(|s| Column::slot_key(s.document_key())).collect();
        let data = self.read_columns(object_ref, columns)?;
        slots
            .iter()
            .zip(&data)
            .map(|(slot, datum)| decode(datum, slot, &*self.deref))
            .collect()
    }

    fn read_columns(&self, object_ref: &ObjectRef, columns: Vec<Column>) -> Result<Vec<Datum>> {
        let storage = self.deref.storage();
        let dangling = || DurableError::Dangling(object_ref.clone());
        if columns.len() <= 1
            || (self.combine_reads && self.capabilities().contains(Capabilities::MULTI_COLUMN_SELECT))
        {
            return storage.select(object_ref, columns)?.ok_or_else(dangling);
        }
        let mut out = Vec::with_capacity(columns.len());
        for column in columns {
            let mut values = storage.select(object_ref, vec![column])?.ok_or_else(dangling)?;
            out.push(values.pop().unwrap_or(Datum::Null));
        }
        Ok(out)
    }

    fn param(&self, value: &Value) -> Result<Expr> {
        if let Some(cell) = value.as_deferred() {
            self.deref.persist(&ObjectHandle::Deferred(Arc::clone(cell)))?;
        }
        Ok(Expr::Param(encode(value)?))
    }

    /// Compiles an operand for an update of `target`. Same-row columns stay
    /// columns; everything else is read now and bound as a parameter.
    /// Returns whether another row had to be read.
    fn operand_expr(&self, target: &ObjectRef, operand: &Operand, frame: Option<FrameId>) -> Result<(Expr, bool)> {
        match operand {
            Operand::Value(value) => Ok((self.param(value)?, false)),
            Operand::Slot(handle, index) => match reactive_row(handle) {
                Some((instance, row)) => {
                    let column = Column::slot_key(instance.type_descriptor().slot_at(*index)?.document_key());
                    if row == target {
                        return Ok((Expr::Column(column), false));
                    }
                    let mut values = self.read_columns(row, vec![column])?;
                    Ok((Expr::Param(values.pop().unwrap_or(Datum::Null)), true))
                }
                None => {
                    let value = self.deref.get_slot(handle, *index, frame)?;
                    Ok((self.param(&value)?, false))
                }
            },
        }
    }

    fn operand_datum(&self, operand: &Operand, frame: Option<FrameId>) -> Result<Datum> {
        match operand {
            Operand::Value(value) => encode(value),
            Operand::Slot(handle, index) => encode(&self.get(handle, *index, frame)?),
        }
    }

    fn operand_kind(&self, operand: &Operand) -> Result<Option<PrimitiveKind>> {
        match operand {
            Operand::Value(value) => Ok(value_kind(value)),
            Operand::Slot(handle, index) => Ok(Some(slot_of(handle, *index)?.kind)),
        }
    }

    fn check_binary(&self, dst: &SlotDescriptor, op: BinaryOp, operands: [&Operand; 2]) -> Result<()> {
        let mismatch = |found: &'static str| DurableError::TypeMismatch {
            slot: dst.name.clone(),
            expected: dst.kind.name(),
            found,
        };
        match dst.kind {
            PrimitiveKind::Int | PrimitiveKind::Float => {}
            PrimitiveKind::Str if op == BinaryOp::Add => {}
            other => return Err(mismatch(other.name())),
        }
        for operand in operands {
            if let Some(kind) = self.operand_kind(operand)?
                && !accepts(dst.kind, kind)
            {
                return Err(mismatch(kind.name()));
            }
        }
        Ok(())
    }

    /// Replaces same-row column reads by parameters read up front, for
    /// stores without combined updates.
    fn bind_columns(&self, target: &ObjectRef, exprs: &mut [&mut Expr]) -> Result<()> {
        let columns: Vec<Column> = exprs
            .iter()
            .filter_map(|expr| match &**expr {
                Expr::Column(column) => Some(column.clone()),
                _ => None,
            })
            .collect();
        if columns.is_empty() {
            return Ok(());
        }
        let mut values = self.read_columns(target, columns)?.into_iter();
        for expr in exprs.iter_mut() {
            if matches!(**expr, Expr::Column(_)) {
                **expr = Expr::Param(values.next().unwrap_or(Datum::Null));
            }
        }
        Ok(())
    }

    fn update_row(&self, target: &ObjectRef, column: Column, expr: Expr, remote: bool) -> Result<()> {
        trace!("reactive update {target} {column:?} = {expr:?}");
        let result = self
            .deref
            .storage()
            .update(target, vec![(column, expr)])
            .map_err(DurableError::from)
            .and_then(|affected| match affected {
                0 => Err(DurableError::Dangling(target.clone())),
                _ => Ok(()),
            });
        if let Err(err) = &result
            && remote
        {
            warn!("{target}: write after reading another row failed, the read is not undone: {err}");
        }
        result
    }

    /// `dst[index] = lhs <op> rhs`
    pub fn binary(
        &self,
        dst: &ObjectHandle,
        index: usize,
        lhs: Operand,
        op: BinaryOp,
        rhs: Operand,
        frame: Option<FrameId>,
    ) -> Result<()> {
        let slot = slot_of(dst, index)?;
        self.check_binary(&slot, op, [&lhs, &rhs])?;

        let Some((_, target)) = reactive_row(dst) else {
            let out = op.apply(&self.operand_datum(&lhs, frame)?, &self.operand_datum(&rhs, frame)?)?;
            let value = decode(&out, &slot, &*self.deref)?;
            return self.deref.set_slot(dst, index, value, frame);
        };

        let (mut lhs, lhs_remote) = self.operand_expr(target, &lhs, frame)?;
        let (mut rhs, rhs_remote) = self.operand_expr(target, &rhs, frame)?;
        if !self.capabilities().contains(Capabilities::COMBINED_UPDATE) {
            self.bind_columns(target, &mut [&mut lhs, &mut rhs])?;
        }
        let expr = match (lhs, rhs) {
            (Expr::Param(a), Expr::Param(b)) => Expr::Param(op.apply(&a, &b)?),
            (lhs, rhs) => Expr::binary(op, lhs, rhs),
        };
        self.update_row(
            target,
            Column::slot_key(slot.document_key()),
            expr,
            lhs_remote || rhs_remote,
        )
    }

    /// `dst[index] += by`
    pub fn increment(&self, dst: &ObjectHandle, index: usize, by: Value, frame: Option<FrameId>) -> Result<()> {
        self.binary(dst, index, Operand::slot(dst, index), BinaryOp::Add, Operand::Value(by), frame)
    }

    /// `dst[index] = src`, copying within the store when both are reactive.
    pub fn move_slot(&self, dst: &ObjectHandle, index: usize, src: Operand, frame: Option<FrameId>) -> Result<()> {
        let slot = slot_of(dst, index)?;
        if let Some(kind) = self.operand_kind(&src)?
            && !accepts(slot.kind, kind)
        {
            return Err(DurableError::TypeMismatch {
                slot: slot.name.clone(),
                expected: slot.kind.name(),
                found: kind.name(),
            });
        }
        let Some((_, target)) = reactive_row(dst) else {
            let value = match &src {
                Operand::Value(value) => value.clone(),
                Operand::Slot(handle, i) => self.get(handle, *i, frame)?,
            };
            return self.deref.set_slot(dst, index, value, frame);
        };
        let (mut expr, remote) = self.operand_expr(target, &src, frame)?;
        if !self.capabilities().contains(Capabilities::COMBINED_UPDATE) {
            self.bind_columns(target, &mut [&mut expr])?;
        }
        self.update_row(target, Column::slot_key(slot.document_key()), expr, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ExceptionKind, Persistence, TypeDescriptor, TypeRegistry,
        refcount::RefCounter,
        storage::{MemoryStore, Statement, Storage},
    };
    use serde_json::json;

    struct Fixture {
        engine: ReactiveEngine,
        store: MemoryStore,
        counter: Arc<TypeDescriptor>,
        cell: Arc<TypeDescriptor>,
    }

    fn mk_fixture(store: MemoryStore, combine_reads: bool) -> Fixture {
        let registry = TypeRegistry::new();
        let counter = registry.register(
            TypeDescriptor::new("Counter", Persistence::Reactive)
                .slot("n", PrimitiveKind::Int)
                .slot("label", PrimitiveKind::Str)
                .slot("ratio", PrimitiveKind::Float)
                .slot("link", PrimitiveKind::Object),
        );
        let cell = registry.register(TypeDescriptor::new("Cell", Persistence::Lazy).slot("v", PrimitiveKind::Int));
        let deref = DerefEngine::new(Arc::new(store.clone()), registry, Arc::new(RefCounter::new()));
        Fixture {
            engine: ReactiveEngine::new(Arc::new(deref), combine_reads),
            store,
            counter,
            cell,
        }
    }

    fn mk_counter(f: &Fixture, n: i64) -> ObjectHandle {
        let handle = f.engine.deref.create(&f.counter, None).expect("create");
        f.engine.set(&handle, 0, Value::Int(n), None).expect("seed");
        handle
    }

    fn statements<R>(f: &Fixture, op: impl FnOnce() -> R) -> (R, usize) {
        let before = f.store.stats().statements;
        let out = op();
        (out, f.store.stats().statements - before)
    }

    #[test]
    fn self_increment_is_a_single_statement() {
        let f = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&f, 5);
        let (res, n) = statements(&f, || f.engine.increment(&c, 0, Value::Int(2), None));
        res.expect("increment");
        assert_eq!(n, 1, "col = col + ? in one update");
        assert_eq!(f.engine.get(&c, 0, None).expect("read"), Value::Int(7));
    }

    #[test]
    fn operands_from_another_row_cost_one_read() {
        let f = mk_fixture(MemoryStore::new(), true);
        let a = mk_counter(&f, 1);
        let b = mk_counter(&f, 10);
        let (res, n) = statements(&f, || {
            f.engine
                .binary(&a, 0, Operand::slot(&a, 0), BinaryOp::Add, Operand::slot(&b, 0), None)
        });
        res.expect("binary");
        assert_eq!(n, 2);
        assert_eq!(f.engine.get(&a, 0, None).expect("read"), Value::Int(11));
    }

    #[test]
    fn without_combined_updates_it_reads_then_writes() {
        let f = mk_fixture(MemoryStore::with_capabilities(Capabilities::MULTI_COLUMN_SELECT), true);
        let c = mk_counter(&f, 5);
        let (res, n) = statements(&f, || f.engine.increment(&c, 0, Value::Int(2), None));
        res.expect("increment");
        assert_eq!(n, 2);
        assert_eq!(f.engine.get(&c, 0, None).expect("read"), Value::Int(7));
    }

    #[test]
    fn reads_are_never_cached() {
        let f = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&f, 5);
        assert_eq!(f.engine.get(&c, 0, None).expect("first read"), Value::Int(5));

        let other_writer = f.store.clone();
        let target = c.object_ref().expect("reactive ref").clone();
        other_writer
            .execute(&Statement::Update {
                table: target.type_name.clone(),
                id: target.id,
                assignments: vec![(Column::slot_key("n_0"), Expr::Param(json!(99)))],
            })
            .expect("external write");
        assert_eq!(f.engine.get(&c, 0, None).expect("second read"), Value::Int(99));
    }

    #[test]
    fn multi_slot_reads_combine_when_allowed() {
        let combined = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&combined, 3);
        combined.engine.set(&c, 1, Value::str("x"), None).expect("label");
        let (values, n) = statements(&combined, || combined.engine.get_many(&c, &[0, 1], None));
        assert_eq!(values.expect("read"), vec![Value::Int(3), Value::str("x")]);
        assert_eq!(n, 1);

        let split = mk_fixture(MemoryStore::new(), false);
        let c = mk_counter(&split, 3);
        let (values, n) = statements(&split, || split.engine.get_many(&c, &[0, 1], None));
        assert_eq!(values.expect("read"), vec![Value::Int(3), Value::Null]);
        assert_eq!(n, 2);
    }

    #[test]
    fn kinds_are_checked_before_any_statement() {
        let f = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&f, 1);
        f.engine.set(&c, 1, Value::str("ab"), None).expect("label");
        f.engine
            .binary(&c, 1, Operand::slot(&c, 1), BinaryOp::Add, Value::str("c").into(), None)
            .expect("concat");
        assert_eq!(f.engine.get(&c, 1, None).expect("read"), Value::str("abc"));

        let (res, n) = statements(&f, || {
            f.engine
                .binary(&c, 1, Operand::slot(&c, 1), BinaryOp::Sub, Value::str("c").into(), None)
        });
        assert!(matches!(res, Err(DurableError::TypeMismatch { .. })));
        assert_eq!(n, 0);
        assert!(matches!(
            f.engine.binary(&c, 0, Operand::slot(&c, 0), BinaryOp::Add, Value::Float(0.5).into(), None),
            Err(DurableError::TypeMismatch { .. })
        ));
        f.engine
            .binary(&c, 2, Operand::slot(&c, 0), BinaryOp::Mul, Value::Float(0.5).into(), None)
            .expect("float result");
        assert_eq!(f.engine.get(&c, 2, None).expect("read"), Value::Float(0.5));
    }

    #[test]
    fn lazy_destinations_are_computed_in_process() {
        let f = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&f, 21);
        let cell = f.engine.deref.create(&f.cell, None).expect("cell");
        f.engine
            .binary(&cell, 0, Operand::slot(&c, 0), BinaryOp::Mul, 2.into(), None)
            .expect("binary");
        assert_eq!(f.engine.get(&cell, 0, None).expect("read"), Value::Int(42));
        assert_eq!(f.store.row_count("Cell"), 0, "nothing flushed yet");
    }

    #[test]
    fn storing_a_lazy_object_persists_it() {
        let f = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&f, 0);
        let cell = f.engine.deref.create(&f.cell, None).expect("cell");
        f.engine
            .move_slot(&c, 3, Operand::Value(Value::Object(cell.clone())), None)
            .expect("move");
        assert_eq!(f.store.row_count("Cell"), 1);
        assert_eq!(f.engine.get(&c, 3, None).expect("read"), Value::Object(cell));
    }

    #[test]
    fn writes_to_a_missing_row_are_dangling() {
        let f = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&f, 0);
        let target = c.object_ref().expect("ref").clone();
        f.store
            .execute(&Statement::Delete {
                table: target.type_name.clone(),
                id: target.id,
            })
            .expect("delete");
        let err = f.engine.increment(&c, 0, Value::Int(1), None).unwrap_err();
        assert!(err.is_dangling(), "{err}");
    }

    #[test]
    fn pushed_down_division_by_zero_is_arithmetic() {
        let f = mk_fixture(MemoryStore::new(), true);
        let c = mk_counter(&f, 5);
        let err = f
            .engine
            .binary(&c, 0, Operand::slot(&c, 0), BinaryOp::Div, Operand::from(0_i64), None)
            .unwrap_err();
        assert_eq!(err.exception().kind, ExceptionKind::Arithmetic, "{err}");
        assert_eq!(f.engine.get(&c, 0, None).expect("read"), Value::Int(5));
    }
}
