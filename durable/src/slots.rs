//! Indexed, typed slot access.
//!
//! Three backings share [`SlotStore`]:
//!
//! - [`MemorySlots`]: plain vector, no I/O;
//! - [`LazySlots`]: in-memory cache of a stored row with dirty tracking,
//!   written back by the dereferencing engine;
//! - [`ReactiveSlots`]: no cache at all, each access is one statement.

use std::{collections::BTreeSet, sync::Arc};

use log::trace;
use parking_lot::{Mutex, RwLock};

use crate::{
    DurableError, HandleResolver, ObjectHandle, ObjectRef, ProtocolViolation, Result,
    SlotDescriptor, Value,
    storage::{Column, Expr, Storage, StorageExt},
    value::{decode, encode},
};

pub trait SlotStore: Send + Sync {
    fn get(&self, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Value>;

    /// Stores `value`. Returns the previous value when the backing keeps
    /// one in memory; reactive stores return `None`.
    fn set(&self, slot: &SlotDescriptor, value: Value) -> Result<Option<Value>>;

    fn save_required(&self) -> bool {
        false
    }

    fn get_int(&self, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Option<i64>> {
        typed(self.get(slot, resolver)?, slot, |v| v.as_int())
    }

    fn get_float(&self, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Option<f64>> {
        typed(self.get(slot, resolver)?, slot, |v| v.as_float())
    }

    fn get_bool(&self, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Option<bool>> {
        typed(self.get(slot, resolver)?, slot, |v| v.as_bool())
    }

    fn get_str(&self, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Option<Arc<str>>> {
        typed(self.get(slot, resolver)?, slot, |v| match v {
            Value::Str(s) => Some(Arc::clone(s)),
            _ => None,
        })
    }

    fn get_object(&self, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Option<ObjectHandle>> {
        typed(self.get(slot, resolver)?, slot, |v| v.as_object().cloned())
    }
}

fn typed<T>(value: Value, slot: &SlotDescriptor, pick: impl FnOnce(&Value) -> Option<T>) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    pick(&value).map(Some).ok_or_else(|| DurableError::TypeMismatch {
        slot: slot.name.clone(),
        expected: slot.kind.name(),
        found: value.kind_name(),
    })
}

fn out_of_range(type_name: &str, slot: &SlotDescriptor) -> DurableError {
    DurableError::NoSuchSlot {
        type_name: type_name.to_owned(),
        index: slot.index,
    }
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemorySlots {
    type_name: Arc<str>,
    values: RwLock<Vec<Value>>,
}

impl MemorySlots {
    pub fn new(type_name: Arc<str>, len: usize) -> Self {
        Self::from_values(type_name, vec![Value::Null; len])
    }

    pub fn from_values(type_name: Arc<str>, values: Vec<Value>) -> Self {
        Self {
            type_name,
            values: RwLock::new(values),
        }
    }

    pub fn values(&self) -> Vec<Value> {
        self.values.read().clone()
    }

    /// Empties every slot, returning what they held.
    pub fn take(&self) -> Vec<Value> {
        let mut values = self.values.write();
        let len = values.len();
        std::mem::replace(&mut *values, vec![Value::Null; len])
    }
}

impl SlotStore for MemorySlots {
    fn get(&self, slot: &SlotDescriptor, _resolver: &dyn HandleResolver) -> Result<Value> {
        self.values
            .read()
            .get(slot.index)
            .cloned()
            .ok_or_else(|| out_of_range(&self.type_name, slot))
    }

    fn set(&self, slot: &SlotDescriptor, value: Value) -> Result<Option<Value>> {
        value.check_slot(slot)?;
        let mut values = self.values.write();
        let cell = values
            .get_mut(slot.index)
            .ok_or_else(|| out_of_range(&self.type_name, slot))?;
        Ok(Some(std::mem::replace(cell, value)))
    }
}

// ── Lazy-cached ─────────────────────────────────────────────────────

#[derive(Debug)]
struct LazyState {
    values: Vec<Value>,
    dirty: BTreeSet<usize>,
    /// Links or frame state changed.
    meta_dirty: bool,
    /// A row exists in storage.
    stored: bool,
    /// Contracted: the cache was handed back and must not be used again.
    detached: bool,
}

impl LazyState {
    fn save_required(&self) -> bool {
        !self.dirty.is_empty() || self.meta_dirty || !self.stored
    }
}

/// Pending changes handed to a flush.
#[derive(Debug)]
pub struct DirtySlots<'a> {
    pub slots: Vec<(usize, &'a Value)>,
    pub meta: bool,
    pub stored: bool,
}

#[derive(Debug)]
pub struct LazySlots {
    object_ref: ObjectRef,
    type_name: Arc<str>,
    state: Mutex<LazyState>,
}

impl LazySlots {
    /// A new object with no row yet.
    pub fn fresh(object_ref: ObjectRef, type_name: Arc<str>, len: usize) -> Self {
        Self::build(object_ref, type_name, vec![Value::Null; len], false)
    }

    /// Cache populated from a stored row.
    pub fn restored(object_ref: ObjectRef, type_name: Arc<str>, values: Vec<Value>) -> Self {
        Self::build(object_ref, type_name, values, true)
    }

    fn build(object_ref: ObjectRef, type_name: Arc<str>, values: Vec<Value>, stored: bool) -> Self {
        Self {
            object_ref,
            type_name,
            state: Mutex::new(LazyState {
                values,
                dirty: BTreeSet::new(),
                meta_dirty: false,
                stored,
                detached: false,
            }),
        }
    }

    pub fn object_ref(&self) -> &ObjectRef {
        &self.object_ref
    }

    pub fn mark_meta_dirty(&self) {
        let mut state = self.state.lock();
        if !state.detached {
            state.meta_dirty = true;
        }
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub fn values(&self) -> Vec<Value> {
        self.state.lock().values.clone()
    }

    /// Runs `write` with the pending changes and marks them saved when it
    /// succeeds. Returns whether anything was written.
    pub fn flush_with<F>(&self, write: F) -> Result<bool>
    where
        F: FnOnce(DirtySlots<'_>) -> Result<()>,
    {
        let mut state = self.state.lock();
        if state.detached {
            return Err(ProtocolViolation::NotExpanded(self.object_ref.clone()).into());
        }
        if !state.save_required() {
            return Ok(false);
        }
        let pending = DirtySlots {
            slots: state.dirty.iter().map(|&i| (i, &state.values[i])).collect(),
            meta: state.meta_dirty,
            stored: state.stored,
        };
        write(pending)?;
        state.dirty.clear();
        state.meta_dirty = false;
        state.stored = true;
        Ok(true)
    }

    /// Hands the cached values back and poisons the cache.
    pub fn detach(&self) -> Vec<Value> {
        let mut state = self.state.lock();
        state.detached = true;
        state.dirty.clear();
        state.meta_dirty = false;
        std::mem::take(&mut state.values)
    }

    fn live(&self) -> Result<parking_lot::MutexGuard<'_, LazyState>> {
        let state = self.state.lock();
        if state.detached {
            return Err(ProtocolViolation::NotExpanded(self.object_ref.clone()).into());
        }
        Ok(state)
    }
}

impl SlotStore for LazySlots {
    fn get(&self, slot: &SlotDescriptor, _resolver: &dyn HandleResolver) -> Result<Value> {
        self.live()?
            .values
            .get(slot.index)
            .cloned()
            .ok_or_else(|| out_of_range(&self.type_name, slot))
    }

    fn set(&self, slot: &SlotDescriptor, value: Value) -> Result<Option<Value>> {
        value.check_slot(slot)?;
        let mut state = self.live()?;
        let cell = state
            .values
            .get_mut(slot.index)
            .ok_or_else(|| out_of_range(&self.type_name, slot))?;
        let old = std::mem::replace(cell, value);
        state.dirty.insert(slot.index);
        Ok(Some(old))
    }

    fn save_required(&self) -> bool {
        self.state.lock().save_required()
    }
}

// ── Reactive ────────────────────────────────────────────────────────

/// Slot access that always goes to the row; nothing is remembered between
/// two calls.
pub struct ReactiveSlots {
    object_ref: ObjectRef,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for ReactiveSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveSlots")
            .field("object_ref", &self.object_ref)
            .finish_non_exhaustive()
    }
}

impl ReactiveSlots {
    pub fn new(object_ref: ObjectRef, storage: Arc<dyn Storage>) -> Self {
        Self { object_ref, storage }
    }

    pub fn object_ref(&self) -> &ObjectRef {
        &self.object_ref
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}

impl SlotStore for ReactiveSlots {
    fn get(&self, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Value> {
        trace!("reactive read {}.{}", self.object_ref, slot.name);
        let values = self
            .storage
            .select(&self.object_ref, vec![Column::slot_key(slot.document_key())])?
            .ok_or_else(|| DurableError::Dangling(self.object_ref.clone()))?;
        match values.first() {
            Some(datum) => decode(datum, slot, resolver),
            None => Ok(Value::Null),
        }
    }

    fn set(&self, slot: &SlotDescriptor, value: Value) -> Result<Option<Value>> {
        value.check_slot(slot)?;
        trace!("reactive write {}.{}", self.object_ref, slot.name);
        let datum = encode(&value)?;
        let affected = self.storage.update(
            &self.object_ref,
            vec![(Column::slot_key(slot.document_key()), Expr::Param(datum))],
        )?;
        if affected == 0 {
            return Err(DurableError::Dangling(self.object_ref.clone()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PrimitiveKind, storage::{Datum, MemoryStore, Row, Statement}};
    use serde_json::json;

    struct NoObjects;

    impl HandleResolver for NoObjects {
        fn handle_for(&self, object_ref: &ObjectRef) -> Result<ObjectHandle> {
            Err(DurableError::Dangling(object_ref.clone()))
        }

        fn inline(&self, type_name: &str, _slots: &[Datum]) -> Result<ObjectHandle> {
            Err(DurableError::UnknownType(type_name.to_owned()))
        }
    }

    fn int_slot(index: usize, name: &str) -> SlotDescriptor {
        SlotDescriptor {
            index,
            name: name.into(),
            kind: PrimitiveKind::Int,
            declared_type: None,
        }
    }

    #[test]
    fn memory_slots_swap_and_type_check() {
        let slots = MemorySlots::new(Arc::from("T"), 1);
        let s = int_slot(0, "n");
        assert_eq!(slots.set(&s, Value::Int(3)).expect("set"), Some(Value::Null));
        assert_eq!(slots.get_int(&s, &NoObjects).expect("get"), Some(3));
        assert!(slots.set(&s, Value::Bool(true)).is_err());
        assert!(matches!(
            slots.get(&int_slot(4, "x"), &NoObjects),
            Err(DurableError::NoSuchSlot { index: 4, .. })
        ));
    }

    #[test]
    fn lazy_dirty_flag_tracks_mutations_since_flush() {
        let slots = LazySlots::restored(ObjectRef::new("T", 1), Arc::from("T"), vec![Value::Int(1)]);
        let s = int_slot(0, "n");
        assert!(!slots.save_required());
        slots.set(&s, Value::Int(2)).expect("set");
        assert!(slots.save_required());

        let mut written = Vec::new();
        let wrote = slots
            .flush_with(|pending| {
                written = pending.slots.iter().map(|(i, v)| (*i, (*v).clone())).collect();
                Ok(())
            })
            .expect("flush");
        assert!(wrote);
        assert_eq!(written, vec![(0, Value::Int(2))]);
        assert!(!slots.save_required());
        assert!(!slots.flush_with(|_| panic!("nothing to write")).expect("noop flush"));
    }

    #[test]
    fn failed_flush_keeps_the_dirty_flag() {
        let slots = LazySlots::fresh(ObjectRef::new("T", 1), Arc::from("T"), 1);
        assert!(slots.save_required(), "a fresh object has no row yet");
        let err = slots.flush_with(|_| Err(DurableError::Codec("boom".into())));
        assert!(err.is_err());
        assert!(slots.save_required());
    }

    #[test]
    fn detached_cache_refuses_access() {
        let slots = LazySlots::restored(ObjectRef::new("T", 1), Arc::from("T"), vec![Value::Int(1)]);
        assert_eq!(slots.detach(), vec![Value::Int(1)]);
        assert!(matches!(
            slots.get(&int_slot(0, "n"), &NoObjects),
            Err(DurableError::Protocol(ProtocolViolation::NotExpanded(_)))
        ));
    }

    #[test]
    fn reactive_reads_see_other_writers() {
        let store = MemoryStore::new();
        let mut row = Row::new();
        row.insert("slots".into(), json!({ "n_0": 1 }));
        store
            .write(Statement::Insert {
                table: "C".into(),
                id: 1,
                row,
            })
            .expect("insert");
        let slots = ReactiveSlots::new(ObjectRef::new("C", 1), Arc::new(store.clone()));
        let s = int_slot(0, "n");
        assert_eq!(slots.get_int(&s, &NoObjects).expect("first read"), Some(1));
        store
            .update(&ObjectRef::new("C", 1), vec![(Column::slot_key("n_0"), Expr::Param(json!(9)))])
            .expect("external write");
        assert_eq!(slots.get_int(&s, &NoObjects).expect("second read"), Some(9));
    }

    #[test]
    fn reactive_access_to_missing_row_is_dangling() {
        let slots = ReactiveSlots::new(ObjectRef::new("C", 3), Arc::new(MemoryStore::new()));
        let s = int_slot(0, "n");
        assert!(slots.get(&s, &NoObjects).unwrap_err().is_dangling());
        assert!(slots.set(&s, Value::Int(1)).unwrap_err().is_dangling());
    }
}
