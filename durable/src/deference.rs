//! Contraction and expansion of lazily persisted objects.
//!
//! Every lazily persisted object is reached through one shared
//! [`DeferenceObject`] per [`ObjectRef`]. The cell is either
//! [`Representation::Materialized`], holding a cached [`Instance`], or
//! [`Representation::ReferenceOnly`]. Access expands a reference-only cell
//! from its row; a save writes the dirty columns back and, when nothing
//! counts the object any more and no frame has it expanded, contracts the
//! cell again.
//!
//! Edges are counted only for holders that can outlive a single access:
//! lazily persisted instances and call frames. Reactive rows are never
//! counted, and neither are plain transient objects, whose referents simply
//! re-expand when touched after a contraction.

use std::{fmt, sync::Arc};

use ahash::{AHashMap, AHashSet};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    DurableError, FrameId, HandleResolver, Instance, InstanceId, ObjectHandle, ObjectRef, Persistence,
    ProtocolViolation, Result, TypeDescriptor, TypeRegistry, Value,
    instance::{Backing, FrameState, FrameStatus},
    refcount::{Delta, EdgeReason, Holder, ReferenceCounter},
    slots::LazySlots,
    storage::{
        CALLER_COLUMN, CREATOR_COLUMN, Column, Datum, EXCEPTION_COLUMN, PARENT_COLUMN, PC_COLUMN,
        RESULT_COLUMN, Row, SLOTS_COLUMN, STATUS_COLUMN, Statement, Storage, StorageExt, TYPE_COLUMN,
    },
    value::{decode, decode_any, decode_object, encode},
};

static NULL: Datum = Datum::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepresentationKind {
    Materialized,
    ReferenceOnly,
}

pub enum Representation {
    Materialized(Arc<Instance>),
    ReferenceOnly,
}

impl Representation {
    pub fn kind(&self) -> RepresentationKind {
        match self {
            Representation::Materialized(_) => RepresentationKind::Materialized,
            Representation::ReferenceOnly => RepresentationKind::ReferenceOnly,
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self, Representation::Materialized(_))
    }
}

struct CellState {
    repr: Representation,
    /// Frame that created or expanded the materialization. While set, the
    /// object is not contracted even with a zero count.
    expander: Option<FrameId>,
}

/// The shared reference counterpart of a lazily persisted object.
pub struct DeferenceObject {
    object_ref: ObjectRef,
    ty: Arc<TypeDescriptor>,
    state: Mutex<CellState>,
}

impl DeferenceObject {
    fn reference_only(object_ref: ObjectRef, ty: Arc<TypeDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            object_ref,
            ty,
            state: Mutex::new(CellState {
                repr: Representation::ReferenceOnly,
                expander: None,
            }),
        })
    }

    fn materialized(
        object_ref: ObjectRef,
        ty: Arc<TypeDescriptor>,
        instance: Arc<Instance>,
        expander: Option<FrameId>,
    ) -> Arc<Self> {
        let cell = Arc::new(Self {
            object_ref,
            ty,
            state: Mutex::new(CellState {
                repr: Representation::Materialized(Arc::clone(&instance)),
                expander,
            }),
        });
        instance.bind_deference(&cell);
        cell
    }

    pub fn object_ref(&self) -> &ObjectRef {
        &self.object_ref
    }

    pub fn type_name(&self) -> &str {
        &self.ty.name
    }

    pub fn type_descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.ty
    }

    pub fn representation(&self) -> RepresentationKind {
        self.state.lock().repr.kind()
    }

    pub fn is_materialized(&self) -> bool {
        self.state.lock().repr.is_materialized()
    }

    /// The cached instance, without expanding.
    pub fn instance(&self) -> Option<Arc<Instance>> {
        match &self.state.lock().repr {
            Representation::Materialized(instance) => Some(Arc::clone(instance)),
            Representation::ReferenceOnly => None,
        }
    }

    pub fn expander(&self) -> Option<FrameId> {
        self.state.lock().expander
    }
}

impl fmt::Debug for DeferenceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeferenceObject")
            .field("ref", &self.object_ref)
            .field("repr", &state.repr.kind())
            .field("expander", &state.expander)
            .finish()
    }
}

// ── Edge batches ────────────────────────────────────────────────────

/// Count changes that are undone together when a later step fails.
struct Adjustments<'a> {
    counter: &'a dyn ReferenceCounter,
    applied: Vec<(Arc<DeferenceObject>, EdgeReason, Holder, Delta, usize)>,
}

impl<'a> Adjustments<'a> {
    fn new(counter: &'a dyn ReferenceCounter) -> Self {
        Self {
            counter,
            applied: Vec::new(),
        }
    }

    fn apply(&mut self, target: &Arc<DeferenceObject>, reason: EdgeReason, holder: Holder, delta: Delta) -> Result<()> {
        match self.counter.adjust(target.object_ref(), reason, holder, delta) {
            Ok(count) => {
                self.applied.push((Arc::clone(target), reason, holder, delta, count));
                Ok(())
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn rollback(&mut self) {
        for (target, reason, holder, delta, _) in self.applied.drain(..).rev() {
            let _ = self
                .counter
                .adjust(target.object_ref(), reason.inverse(), holder, delta.inverse());
        }
    }

    /// Targets that were decremented to zero.
    fn zeroed(self) -> Vec<Arc<DeferenceObject>> {
        self.applied
            .into_iter()
            .filter(|(_, _, _, delta, count)| *delta == Delta::Dec && *count == 0)
            .map(|(target, ..)| target)
            .collect()
    }
}

fn counts_edges(holder: &Instance) -> bool {
    holder.lazy_slots().is_some() || holder.is_frame()
}

fn link_document(handle: Option<&ObjectHandle>) -> Datum {
    // Transient links have no durable identity and are not written.
    handle
        .and_then(ObjectHandle::object_ref)
        .map_or(Datum::Null, ObjectRef::to_document)
}

fn column<'r>(row: &'r Row, name: &str) -> &'r Datum {
    row.get(name).unwrap_or(&NULL)
}

// ── Engine ──────────────────────────────────────────────────────────

#[derive(Default)]
struct FrameBook {
    /// Objects this frame created or expanded.
    expanded: Vec<Arc<DeferenceObject>>,
    /// Ancestors counted by a scope load.
    scope: Option<Vec<Arc<DeferenceObject>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavePointReport {
    pub flushed: usize,
    pub contracted: usize,
    pub evicted: usize,
}

pub struct DerefEngine {
    storage: Arc<dyn Storage>,
    registry: TypeRegistry,
    counter: Arc<dyn ReferenceCounter>,
    /// Identity map: at most one cell per reference.
    cells: Mutex<AHashMap<ObjectRef, Arc<DeferenceObject>>>,
    frames: Mutex<AHashMap<FrameId, FrameBook>>,
}

impl fmt::Debug for DerefEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerefEngine")
            .field("registry", &self.registry)
            .field("cells", &self.cells.lock().len())
            .finish_non_exhaustive()
    }
}

impl DerefEngine {
    pub fn new(storage: Arc<dyn Storage>, registry: TypeRegistry, counter: Arc<dyn ReferenceCounter>) -> Self {
        Self {
            storage,
            registry,
            counter,
            cells: Mutex::new(AHashMap::new()),
            frames: Mutex::new(AHashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn counter(&self) -> &Arc<dyn ReferenceCounter> {
        &self.counter
    }

    /// The cached cell for `object_ref`, if any.
    pub fn cached(&self, object_ref: &ObjectRef) -> Option<Arc<DeferenceObject>> {
        self.cells.lock().get(object_ref).cloned()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.lock().len()
    }

    fn cell_for(&self, object_ref: &ObjectRef, ty: &Arc<TypeDescriptor>) -> Arc<DeferenceObject> {
        let mut cells = self.cells.lock();
        Arc::clone(
            cells
                .entry(object_ref.clone())
                .or_insert_with(|| DeferenceObject::reference_only(object_ref.clone(), Arc::clone(ty))),
        )
    }

    fn register_expansion(&self, frame: FrameId, cell: &Arc<DeferenceObject>) {
        self.frames
            .lock()
            .entry(frame)
            .or_default()
            .expanded
            .push(Arc::clone(cell));
    }

    // ── Creation and lookup ─────────────────────────────────────────

    /// Instantiates `ty`. Persisted types get their identity right away;
    /// lazy rows are written on the first save.
    pub fn create(&self, ty: &Arc<TypeDescriptor>, creator: Option<&Instance>) -> Result<ObjectHandle> {
        let creator_ref = creator.and_then(|c| c.object_ref().cloned());
        match ty.persistence {
            Persistence::Transient => Ok(ObjectHandle::Local(Instance::transient(Arc::clone(ty)))),
            Persistence::Lazy => {
                let object_ref = ObjectRef::new(&ty.name, self.storage.next_id(&ty.name)?);
                let slots = LazySlots::fresh(object_ref.clone(), Arc::from(ty.name.as_str()), ty.slots.len());
                let instance = Instance::lazy(Arc::clone(ty), slots, None);
                instance.restore_links(None, creator_ref);
                let expander = if ty.is_frame {
                    Some(instance.id())
                } else {
                    creator.map(Instance::id)
                };
                let cell = DeferenceObject::materialized(object_ref.clone(), Arc::clone(ty), instance, expander);
                self.cells.lock().insert(object_ref.clone(), Arc::clone(&cell));
                if let (Some(frame), false) = (expander, ty.is_frame) {
                    self.register_expansion(frame, &cell);
                }
                debug!("created {object_ref}");
                Ok(ObjectHandle::Deferred(cell))
            }
            Persistence::Reactive => {
                if ty.is_frame {
                    return Err(DurableError::NotPersistable(format!("{} (reactive frame)", ty.name)));
                }
                let object_ref = ObjectRef::new(&ty.name, self.storage.next_id(&ty.name)?);
                let mut row = Row::new();
                row.insert(TYPE_COLUMN.into(), Datum::String(ty.name.clone()));
                row.insert(SLOTS_COLUMN.into(), Datum::Object(serde_json::Map::new()));
                row.insert(
                    CREATOR_COLUMN.into(),
                    creator_ref.as_ref().map_or(Datum::Null, ObjectRef::to_document),
                );
                self.storage.write(Statement::Insert {
                    table: ty.name.clone(),
                    id: object_ref.id,
                    row,
                })?;
                debug!("created reactive {object_ref}");
                Ok(ObjectHandle::Local(Instance::reactive(
                    Arc::clone(ty),
                    object_ref,
                    Arc::clone(&self.storage),
                )))
            }
        }
    }

    /// Looks up `object_ref` and makes sure it exists, expanding lazy
    /// objects on behalf of `frame`.
    pub fn resolve(&self, object_ref: &ObjectRef, frame: Option<FrameId>) -> Result<ObjectHandle> {
        let handle = self.handle_for(object_ref)?;
        match &handle {
            ObjectHandle::Deferred(cell) => {
                self.access(cell, frame)?;
            }
            ObjectHandle::Local(_) => {
                self.storage
                    .select(object_ref, vec![Column::plain(TYPE_COLUMN)])?
                    .ok_or_else(|| DurableError::Dangling(object_ref.clone()))?;
            }
        }
        Ok(handle)
    }

    /// The instance behind a handle, expanding when needed.
    pub fn instance(&self, handle: &ObjectHandle, frame: Option<FrameId>) -> Result<Arc<Instance>> {
        match handle {
            ObjectHandle::Local(instance) => Ok(Arc::clone(instance)),
            ObjectHandle::Deferred(cell) => self.access(cell, frame),
        }
    }

    pub fn get_slot(&self, handle: &ObjectHandle, index: usize, frame: Option<FrameId>) -> Result<Value> {
        self.instance(handle, frame)?.get(index, self)
    }

    pub fn set_slot(&self, handle: &ObjectHandle, index: usize, value: Value, frame: Option<FrameId>) -> Result<()> {
        let instance = self.instance(handle, frame)?;
        self.install_slot(&instance, index, value)
    }

    // ── Expansion ───────────────────────────────────────────────────

    /// The materialized instance, expanding on first touch. Unlike
    /// [`expand`](Self::expand), touching an object another frame expanded
    /// is fine.
    pub fn access(&self, cell: &Arc<DeferenceObject>, frame: Option<FrameId>) -> Result<Arc<Instance>> {
        if let Some(instance) = cell.instance() {
            return Ok(instance);
        }
        self.expand(cell, frame)
    }

    /// Restores the object from its row and records `frame` as expander.
    pub fn expand(&self, cell: &Arc<DeferenceObject>, frame: Option<FrameId>) -> Result<Arc<Instance>> {
        let mut state = cell.state.lock();
        if let Representation::Materialized(instance) = &state.repr {
            return match (state.expander, frame) {
                (Some(expander), Some(requester)) if expander != requester => {
                    Err(ProtocolViolation::DoubleExpansion {
                        target: cell.object_ref.clone(),
                        expander,
                        requester,
                    }
                    .into())
                }
                _ => Ok(Arc::clone(instance)),
            };
        }
        let instance = self.load(cell)?;
        state.expander = if cell.ty.is_frame { Some(instance.id()) } else { frame };
        state.repr = Representation::Materialized(Arc::clone(&instance));
        instance.bind_deference(cell);
        drop(state);

        if let (Some(frame), false) = (frame, cell.ty.is_frame) {
            self.register_expansion(frame, cell);
        }
        debug!("expanded {} for {frame:?}", cell.object_ref);
        cell.ty.run_restore_hook(&instance)?;
        Ok(instance)
    }

    /// Builds an instance from the stored row and counts the edges it holds.
    fn load(&self, cell: &DeferenceObject) -> Result<Arc<Instance>> {
        let object_ref = &cell.object_ref;
        let ty = &cell.ty;
        let row = self
            .storage
            .select_row(&object_ref.type_name, object_ref.id)?
            .ok_or_else(|| DurableError::Dangling(object_ref.clone()))?;

        let values = ty
            .slots
            .iter()
            .map(|slot| decode(column(&row, slot.column()), slot, self))
            .collect::<Result<Vec<_>>>()?;
        let parent = self.optional_object(&row, PARENT_COLUMN)?;
        let creator = match column(&row, CREATOR_COLUMN) {
            Datum::Null => None,
            doc => Some(ObjectRef::from_document(doc)?),
        };
        let frame = match ty.is_frame {
            true => Some(self.restore_frame(&row)?),
            false => None,
        };
        let slots = LazySlots::restored(object_ref.clone(), Arc::from(ty.name.as_str()), values.clone());
        let instance = Instance::lazy(Arc::clone(ty), slots, frame);
        instance.restore_links(parent.clone(), creator);

        let mut edges = Adjustments::new(&*self.counter);
        for (index, value) in values.iter().enumerate() {
            if let Some(target) = value.as_deferred() {
                edges.apply(target, EdgeReason::SlotInstall, Holder::slot(instance.id(), index), Delta::Inc)?;
            }
        }
        if let Some(ObjectHandle::Deferred(target)) = &parent {
            edges.apply(target, EdgeReason::ParentInstall, Holder::of(instance.id()), Delta::Inc)?;
        }
        let caller = instance.frame().and_then(|f| f.caller.clone());
        if let Some(ObjectHandle::Deferred(target)) = &caller {
            edges.apply(target, EdgeReason::CallerInstall, Holder::of(instance.id()), Delta::Inc)?;
        }
        Ok(instance)
    }

    fn optional_object(&self, row: &Row, name: &str) -> Result<Option<ObjectHandle>> {
        match column(row, name) {
            Datum::Null => Ok(None),
            doc => decode_object(doc, self).map(Some),
        }
    }

    fn restore_frame(&self, row: &Row) -> Result<FrameState> {
        let pc = column(row, PC_COLUMN).as_u64().and_then(|pc| u32::try_from(pc).ok());
        let mut frame = FrameState::new(pc);
        let status = column(row, STATUS_COLUMN);
        if status.is_string() {
            frame.status = serde_json::from_value(status.clone())?;
        }
        frame.exception = serde_json::from_value(column(row, EXCEPTION_COLUMN).clone())?;
        frame.result = decode_any(column(row, RESULT_COLUMN), self)?;
        frame.caller = self.optional_object(row, CALLER_COLUMN)?;
        frame.released = frame.status == FrameStatus::Done;
        Ok(frame)
    }

    // ── Contraction ─────────────────────────────────────────────────

    /// Writes the pending changes of a lazily persisted instance as one
    /// upsert. Returns whether a statement was issued.
    pub fn flush_instance(&self, instance: &Instance) -> Result<bool> {
        let Some(slots) = instance.lazy_slots() else {
            return Ok(false);
        };
        let ty = instance.type_descriptor();
        let object_ref = slots.object_ref();
        let wrote = slots.flush_with(|pending| {
            let mut row = Row::new();
            for (index, value) in &pending.slots {
                row.insert(ty.slot_at(*index)?.column().to_owned(), encode(value)?);
            }
            if pending.meta || !pending.stored {
                self.meta_columns(instance, &mut row)?;
            }
            self.storage.write(Statement::Upsert {
                table: object_ref.type_name.clone(),
                id: object_ref.id,
                row,
            })?;
            Ok(())
        })?;
        if wrote {
            debug!("flushed {object_ref}");
        }
        Ok(wrote)
    }

    fn meta_columns(&self, instance: &Instance, row: &mut Row) -> Result<()> {
        row.insert(TYPE_COLUMN.into(), Datum::String(instance.type_name().to_owned()));
        row.insert(PARENT_COLUMN.into(), link_document(instance.parent_scope().as_ref()));
        row.insert(
            CREATOR_COLUMN.into(),
            instance.creator().as_ref().map_or(Datum::Null, ObjectRef::to_document),
        );
        if let Some(frame) = instance.frame() {
            row.insert(CALLER_COLUMN.into(), link_document(frame.caller.as_ref()));
            row.insert(STATUS_COLUMN.into(), serde_json::to_value(frame.status)?);
            row.insert(PC_COLUMN.into(), frame.pc.map_or(Datum::Null, Datum::from));
            row.insert(EXCEPTION_COLUMN.into(), serde_json::to_value(&frame.exception)?);
            row.insert(RESULT_COLUMN.into(), encode(&frame.result)?);
        }
        Ok(())
    }

    /// Flushes the object and contracts it when nothing holds it.
    pub fn save(&self, cell: &Arc<DeferenceObject>) -> Result<bool> {
        let Some(instance) = cell.instance() else {
            return Ok(false);
        };
        let wrote = self.flush_instance(&instance)?;
        self.fix_cache(cell)?;
        Ok(wrote)
    }

    /// Runs after a count reaches zero. Contracts the cell unless a frame
    /// still has it expanded or it has unsaved changes; both cases are
    /// picked up later by frame completion or a save point.
    pub fn fix_cache(&self, cell: &Arc<DeferenceObject>) -> Result<bool> {
        if self.counter.count(&cell.object_ref) > 0 {
            return Ok(false);
        }
        let instance = {
            let mut state = cell.state.lock();
            let degradable = match &state.repr {
                Representation::Materialized(instance) => {
                    if state.expander.is_some() {
                        trace!("{} unreferenced while expanded by {:?}", cell.object_ref, state.expander);
                        false
                    } else if instance.save_required() {
                        trace!("{} unreferenced but dirty, waiting for a save", cell.object_ref);
                        false
                    } else {
                        true
                    }
                }
                Representation::ReferenceOnly => false,
            };
            if !degradable {
                return Ok(false);
            }
            match std::mem::replace(&mut state.repr, Representation::ReferenceOnly) {
                Representation::Materialized(instance) => instance,
                Representation::ReferenceOnly => return Ok(false),
            }
        };
        let zeroed = match self.release_held(&instance) {
            Ok(zeroed) => zeroed,
            Err(err) => {
                let mut state = cell.state.lock();
                if !state.repr.is_materialized() {
                    state.repr = Representation::Materialized(instance);
                }
                return Err(err);
            }
        };
        debug!("contracted {}", cell.object_ref);
        for cell in zeroed {
            self.fix_cache(&cell)?;
        }
        Ok(true)
    }

    /// Drops every edge a torn-down instance held and returns the targets
    /// that reached zero. When one decrement fails the others are undone and
    /// the instance keeps its values and links.
    fn release_held(&self, instance: &Instance) -> Result<Vec<Arc<DeferenceObject>>> {
        let id = instance.id();
        let values = match instance.backing() {
            Backing::Lazy(slots) => slots.values(),
            Backing::Memory(slots) => slots.values(),
            Backing::Reactive(_) => Vec::new(),
        };
        let parent = instance.parent_scope();
        let caller = instance.frame().and_then(|f| f.caller.clone());

        let mut edges = Adjustments::new(&*self.counter);
        for (index, value) in values.iter().enumerate() {
            if let Some(target) = value.as_deferred() {
                edges.apply(target, EdgeReason::SlotDrop, Holder::slot(id, index), Delta::Dec)?;
            }
        }
        if let Some(ObjectHandle::Deferred(target)) = &parent {
            edges.apply(target, EdgeReason::ParentInstall, Holder::of(id), Delta::Dec)?;
        }
        if let Some(ObjectHandle::Deferred(target)) = &caller {
            edges.apply(target, EdgeReason::CallerDrop, Holder::of(id), Delta::Dec)?;
        }

        match instance.backing() {
            Backing::Lazy(slots) => drop(slots.detach()),
            Backing::Memory(slots) => drop(slots.take()),
            Backing::Reactive(_) => {}
        }
        instance.take_parent();
        if let Some(mut frame) = instance.frame() {
            frame.caller = None;
        }
        Ok(edges.zeroed())
    }

    fn contract_if_unreferenced(&self, cell: &Arc<DeferenceObject>) -> Result<bool> {
        if self.counter.count(&cell.object_ref) > 0 || cell.expander().is_some() {
            return Ok(false);
        }
        let Some(instance) = cell.instance() else {
            return Ok(false);
        };
        self.flush_instance(&instance)?;
        self.fix_cache(cell)
    }

    /// Saves the object and reports the representation it ended up in.
    pub fn contract(&self, cell: &Arc<DeferenceObject>) -> Result<RepresentationKind> {
        self.save(cell)?;
        Ok(cell.representation())
    }

    /// Gives the object a durable identity, writing pending changes.
    pub fn persist(&self, handle: &ObjectHandle) -> Result<ObjectRef> {
        match handle {
            ObjectHandle::Deferred(cell) => {
                if let Some(instance) = cell.instance() {
                    self.flush_instance(&instance)?;
                }
                Ok(cell.object_ref.clone())
            }
            ObjectHandle::Local(instance) => instance
                .object_ref()
                .cloned()
                .ok_or_else(|| DurableError::NotPersistable(instance.type_name().to_owned())),
        }
    }

    /// Flushes every dirty materialized object without contracting any.
    pub fn flush_all(&self) -> Result<usize> {
        let cells: Vec<_> = self.cells.lock().values().cloned().collect();
        let mut flushed = 0;
        for cell in cells {
            if let Some(instance) = cell.instance()
                && self.flush_instance(&instance)?
            {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Flushes everything dirty, contracts what became unreferenced and
    /// forgets reference-only cells nobody holds.
    pub fn save_point(&self) -> Result<SavePointReport> {
        let mut report = SavePointReport::default();
        let cells: Vec<_> = self.cells.lock().values().cloned().collect();
        for cell in &cells {
            let Some(instance) = cell.instance() else {
                continue;
            };
            if self.flush_instance(&instance)? {
                report.flushed += 1;
            }
            drop(instance);
            if self.fix_cache(cell)? {
                report.contracted += 1;
            }
        }
        drop(cells);
        report.evicted = self.evict();
        debug!("save point: {report:?}");
        Ok(report)
    }

    fn evict(&self) -> usize {
        let mut cells = self.cells.lock();
        let before = cells.len();
        // A cell only the map holds cannot be locked by anyone else.
        cells.retain(|_, cell| {
            Arc::strong_count(cell) > 1 || cell.state.try_lock().is_none_or(|s| s.repr.is_materialized())
        });
        before - cells.len()
    }

    // ── Edges ───────────────────────────────────────────────────────

    /// Stores `value` into a slot, keeping the counts of the old and the
    /// new target in step. Nothing changes when the store rejects the value.
    pub fn install_slot(&self, holder: &Instance, index: usize, value: Value) -> Result<()> {
        let slot = holder.type_descriptor().slot_at(index)?;
        if holder.is_reactive() {
            if let Some(target) = value.as_deferred() {
                // The row must exist before a reactive reader resolves it.
                self.persist(&ObjectHandle::Deferred(Arc::clone(target)))?;
            }
            holder.store().set(slot, value)?;
            return Ok(());
        }
        if !counts_edges(holder) {
            holder.store().set(slot, value)?;
            return Ok(());
        }
        value.check_slot(slot)?;
        let old = holder.store().get(slot, self)?;
        let new_target = value.as_deferred().cloned();
        let old_target = old.as_deferred().cloned();
        if let (Some(new), Some(old)) = (&new_target, &old_target)
            && Arc::ptr_eq(new, old)
        {
            holder.store().set(slot, value)?;
            return Ok(());
        }

        let edge = Holder::slot(holder.id(), index);
        let mut edges = Adjustments::new(&*self.counter);
        if let Some(target) = &new_target {
            edges.apply(target, EdgeReason::SlotInstall, edge, Delta::Inc)?;
        }
        if let Some(target) = &old_target {
            edges.apply(target, EdgeReason::SlotDrop, edge, Delta::Dec)?;
        }
        if let Err(err) = holder.store().set(slot, value) {
            edges.rollback();
            return Err(err);
        }
        for cell in edges.zeroed() {
            self.fix_cache(&cell)?;
        }
        Ok(())
    }

    pub fn install_parent(&self, child: &Instance, parent: Option<ObjectHandle>) -> Result<()> {
        if !counts_edges(child) {
            child.replace_parent(parent);
            return Ok(());
        }
        let old = child.parent_scope();
        if let (Some(old), Some(new)) = (&old, &parent)
            && old.same(new)
        {
            return Ok(());
        }
        let edge = Holder::of(child.id());
        let mut edges = Adjustments::new(&*self.counter);
        if let Some(ObjectHandle::Deferred(target)) = &parent {
            edges.apply(target, EdgeReason::ParentInstall, edge, Delta::Inc)?;
        }
        if let Some(ObjectHandle::Deferred(target)) = &old {
            edges.apply(target, EdgeReason::ParentInstall, edge, Delta::Dec)?;
        }
        child.replace_parent(parent);
        for cell in edges.zeroed() {
            self.fix_cache(&cell)?;
        }
        Ok(())
    }

    pub fn install_caller(&self, frame: &Instance, caller: Option<ObjectHandle>) -> Result<()> {
        let old = frame
            .frame()
            .map(|f| f.caller.clone())
            .ok_or_else(|| DurableError::TypeMismatch {
                slot: "caller".into(),
                expected: "frame",
                found: "object",
            })?;
        if let (Some(old), Some(new)) = (&old, &caller)
            && old.same(new)
        {
            return Ok(());
        }
        let edge = Holder::of(frame.id());
        let mut edges = Adjustments::new(&*self.counter);
        if let Some(ObjectHandle::Deferred(target)) = &caller {
            edges.apply(target, EdgeReason::CallerInstall, edge, Delta::Inc)?;
        }
        if let Some(ObjectHandle::Deferred(target)) = &old {
            edges.apply(target, EdgeReason::CallerDrop, edge, Delta::Dec)?;
        }
        frame.update_frame(|f| f.caller = caller);
        for cell in edges.zeroed() {
            self.fix_cache(&cell)?;
        }
        Ok(())
    }

    pub fn drop_caller(&self, frame: &Instance) -> Result<()> {
        self.install_caller(frame, None)
    }

    /// Counts every ancestor on the frame's parent-scope chain, expanding
    /// them on the way. Loading twice is a no-op.
    pub fn load_scope(&self, frame: &Instance) -> Result<usize> {
        if self
            .frames
            .lock()
            .get(&frame.id())
            .is_some_and(|book| book.scope.is_some())
        {
            return Ok(0);
        }
        let edge = Holder::of(frame.id());
        let mut edges = Adjustments::new(&*self.counter);
        let mut held = Vec::new();
        let mut seen_refs = AHashSet::new();
        let mut seen_locals: AHashSet<InstanceId> = AHashSet::new();
        let mut next = frame.parent_scope();
        while let Some(handle) = next {
            next = match &handle {
                ObjectHandle::Deferred(cell) => {
                    if !seen_refs.insert(cell.object_ref.clone()) {
                        break;
                    }
                    edges.apply(cell, EdgeReason::ScopeLoad, edge, Delta::Inc)?;
                    held.push(Arc::clone(cell));
                    match self.access(cell, Some(frame.id())) {
                        Ok(ancestor) => ancestor.parent_scope(),
                        Err(err) => {
                            edges.rollback();
                            return Err(err);
                        }
                    }
                }
                ObjectHandle::Local(instance) => {
                    if !seen_locals.insert(instance.id()) {
                        break;
                    }
                    instance.parent_scope()
                }
            };
        }
        let loaded = held.len();
        self.frames.lock().entry(frame.id()).or_default().scope = Some(held);
        trace!("frame {:?} loaded {loaded} scope ancestors", frame.id());
        Ok(loaded)
    }

    pub fn unload_scope(&self, frame: &Instance) -> Result<()> {
        let held = self
            .frames
            .lock()
            .get_mut(&frame.id())
            .and_then(|book| book.scope.take())
            .unwrap_or_default();
        let edge = Holder::of(frame.id());
        let mut edges = Adjustments::new(&*self.counter);
        for cell in &held {
            if let Err(err) = edges.apply(cell, EdgeReason::ScopeUnload, edge, Delta::Dec) {
                self.frames.lock().entry(frame.id()).or_default().scope = Some(held);
                return Err(err);
            }
        }
        for cell in edges.zeroed() {
            self.fix_cache(&cell)?;
        }
        Ok(())
    }

    /// Releases everything a finished frame holds: its scope loads, its
    /// caller edge and the expander marks it left on objects. Objects that
    /// end up unreferenced are saved and contracted, the frame included.
    ///
    /// Every step runs even when an earlier one fails; the first failure is
    /// returned. Objects whose save failed stay materialized without an
    /// expander, so the next save point picks them up.
    pub fn complete_frame(&self, frame: &Instance) -> Result<()> {
        match frame.update_frame(|f| std::mem::replace(&mut f.released, true)) {
            None => return Ok(()),
            Some(true) => return Err(ProtocolViolation::FrameReleased(frame.id()).into()),
            Some(false) => {}
        }
        let mut failure = None;
        keep_first(&mut failure, self.unload_scope(frame));
        keep_first(&mut failure, self.drop_caller(frame));
        if frame.is_transient() {
            match self.release_held(frame) {
                Ok(zeroed) => {
                    for cell in zeroed {
                        keep_first(&mut failure, self.fix_cache(&cell));
                    }
                }
                Err(err) => keep_first::<()>(&mut failure, Err(err)),
            }
        }
        let book = self.frames.lock().remove(&frame.id()).unwrap_or_default();
        let cells: Vec<_> = book.expanded.into_iter().chain(frame.deference()).collect();
        for cell in &cells {
            let mut state = cell.state.lock();
            if state.expander == Some(frame.id()) {
                state.expander = None;
            }
        }
        for cell in &cells {
            keep_first(&mut failure, self.contract_if_unreferenced(cell));
        }
        match failure {
            Some(err) => {
                debug!("completed frame {:?} with {err}", frame.id());
                Err(err)
            }
            None => {
                debug!("completed frame {:?}", frame.id());
                Ok(())
            }
        }
    }
}

fn keep_first<T>(failure: &mut Option<DurableError>, result: Result<T>) {
    if let Err(err) = result {
        failure.get_or_insert(err);
    }
}

impl HandleResolver for DerefEngine {
    fn handle_for(&self, object_ref: &ObjectRef) -> Result<ObjectHandle> {
        let ty = self.registry.get(&object_ref.type_name)?;
        match ty.persistence {
            Persistence::Lazy => Ok(ObjectHandle::Deferred(self.cell_for(object_ref, &ty))),
            Persistence::Reactive => Ok(ObjectHandle::Local(Instance::reactive(
                ty,
                object_ref.clone(),
                Arc::clone(&self.storage),
            ))),
            Persistence::Transient => Err(DurableError::NotPersistable(object_ref.type_name.clone())),
        }
    }

    fn inline(&self, type_name: &str, slots: &[Datum]) -> Result<ObjectHandle> {
        let ty = self.registry.get(type_name)?;
        let values = ty
            .slots
            .iter()
            .map(|slot| decode(slots.get(slot.index).unwrap_or(&NULL), slot, self))
            .collect::<Result<Vec<_>>>()?;
        Ok(ObjectHandle::Local(Instance::transient_with(ty, values)))
    }
}
