use std::{
    fmt,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{
    DeferenceObject, HandleResolver, ObjectHandle, ObjectRef, Result, TypeDescriptor, Value,
    VmException,
    slots::{LazySlots, MemorySlots, ReactiveSlots, SlotStore},
    storage::Storage,
};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local identity of a materialized instance. Not durable: a
/// re-expanded object gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

pub type FrameId = InstanceId;

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub enum Backing {
    Memory(MemorySlots),
    Lazy(LazySlots),
    Reactive(ReactiveSlots),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Running,
    Paused,
    Done,
}

/// Execution state of one function activation.
pub struct FrameState {
    /// `None` for native frames.
    pub pc: Option<u32>,
    pub status: FrameStatus,
    pub exception: Option<VmException>,
    /// Result/receiver slot.
    pub result: Value,
    pub(crate) caller: Option<ObjectHandle>,
    pub(crate) released: bool,
}

impl FrameState {
    pub fn new(pc: Option<u32>) -> Self {
        Self {
            pc,
            status: FrameStatus::Running,
            exception: None,
            result: Value::Null,
            caller: None,
            released: false,
        }
    }

    pub fn caller(&self) -> Option<&ObjectHandle> {
        self.caller.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl fmt::Debug for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameState")
            .field("pc", &self.pc)
            .field("status", &self.status)
            .field("exception", &self.exception)
            .field("result", &self.result)
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

enum ScopeLink {
    Strong(ObjectHandle),
    /// Transient parents are not kept alive by their children.
    Weak(Weak<Instance>),
}

#[derive(Default)]
struct Links {
    parent: Option<ScopeLink>,
    creator: Option<ObjectRef>,
}

/// A materialized object.
pub struct Instance {
    id: InstanceId,
    ty: Arc<TypeDescriptor>,
    backing: Backing,
    links: Mutex<Links>,
    frame: Option<Mutex<FrameState>>,
    deference: OnceLock<Weak<DeferenceObject>>,
}

impl Instance {
    fn build(ty: Arc<TypeDescriptor>, backing: Backing, frame: Option<FrameState>) -> Arc<Self> {
        let frame = frame.or_else(|| ty.is_frame.then(|| FrameState::new(Some(0))));
        Arc::new(Self {
            id: InstanceId::next(),
            ty,
            backing,
            links: Mutex::new(Links::default()),
            frame: frame.map(Mutex::new),
            deference: OnceLock::new(),
        })
    }

    /// A pure in-memory instance.
    pub fn transient(ty: Arc<TypeDescriptor>) -> Arc<Self> {
        let slots = MemorySlots::new(Arc::from(ty.name.as_str()), ty.slots.len());
        Self::build(ty, Backing::Memory(slots), None)
    }

    pub(crate) fn transient_with(ty: Arc<TypeDescriptor>, values: Vec<Value>) -> Arc<Self> {
        let slots = MemorySlots::from_values(Arc::from(ty.name.as_str()), values);
        Self::build(ty, Backing::Memory(slots), None)
    }

    pub(crate) fn lazy(ty: Arc<TypeDescriptor>, slots: LazySlots, frame: Option<FrameState>) -> Arc<Self> {
        Self::build(ty, Backing::Lazy(slots), frame)
    }

    pub(crate) fn reactive(ty: Arc<TypeDescriptor>, object_ref: ObjectRef, storage: Arc<dyn Storage>) -> Arc<Self> {
        Self::build(ty, Backing::Reactive(ReactiveSlots::new(object_ref, storage)), None)
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn type_descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.ty
    }

    pub fn type_name(&self) -> &str {
        &self.ty.name
    }

    pub fn object_ref(&self) -> Option<&ObjectRef> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::Lazy(slots) => Some(slots.object_ref()),
            Backing::Reactive(slots) => Some(slots.object_ref()),
        }
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn store(&self) -> &dyn SlotStore {
        match &self.backing {
            Backing::Memory(slots) => slots,
            Backing::Lazy(slots) => slots,
            Backing::Reactive(slots) => slots,
        }
    }

    pub fn lazy_slots(&self) -> Option<&LazySlots> {
        match &self.backing {
            Backing::Lazy(slots) => Some(slots),
            _ => None,
        }
    }

    pub fn is_reactive(&self) -> bool {
        matches!(self.backing, Backing::Reactive(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.backing, Backing::Memory(_))
    }

    /// Slot values of an in-memory instance.
    pub fn transient_values(&self) -> Option<Vec<Value>> {
        match &self.backing {
            Backing::Memory(slots) => Some(slots.values()),
            _ => None,
        }
    }

    /// Reads a slot without any side effects.
    pub fn get(&self, index: usize, resolver: &dyn HandleResolver) -> Result<Value> {
        let slot = self.ty.slot_at(index)?;
        self.store().get(slot, resolver)
    }

    /// True while the lazy cache has changes not yet written.
    pub fn save_required(&self) -> bool {
        self.store().save_required()
    }

    /// A contracted instance whose cache was handed back.
    pub fn is_detached(&self) -> bool {
        self.lazy_slots().is_some_and(LazySlots::is_detached)
    }

    pub(crate) fn mark_meta_dirty(&self) {
        if let Some(slots) = self.lazy_slots() {
            slots.mark_meta_dirty();
        }
    }

    // ── Links ───────────────────────────────────────────────────────

    pub fn parent_scope(&self) -> Option<ObjectHandle> {
        match self.links.lock().parent.as_ref()? {
            ScopeLink::Strong(handle) => Some(handle.clone()),
            ScopeLink::Weak(weak) => weak.upgrade().map(ObjectHandle::Local),
        }
    }

    /// Replaces the parent-scope link, returning the previous one.
    pub(crate) fn replace_parent(&self, parent: Option<ObjectHandle>) -> Option<ObjectHandle> {
        let link = parent.map(|handle| match handle {
            ObjectHandle::Local(instance) if instance.is_transient() => {
                ScopeLink::Weak(Arc::downgrade(&instance))
            }
            other => ScopeLink::Strong(other),
        });
        let old = std::mem::replace(&mut self.links.lock().parent, link);
        self.mark_meta_dirty();
        old.and_then(|link| match link {
            ScopeLink::Strong(handle) => Some(handle),
            ScopeLink::Weak(weak) => weak.upgrade().map(ObjectHandle::Local),
        })
    }

    /// Installs links read back from storage without marking them dirty.
    pub(crate) fn restore_links(&self, parent: Option<ObjectHandle>, creator: Option<ObjectRef>) {
        let mut links = self.links.lock();
        links.parent = parent.map(ScopeLink::Strong);
        links.creator = creator;
    }

    pub(crate) fn take_parent(&self) -> Option<ObjectHandle> {
        match self.links.lock().parent.take()? {
            ScopeLink::Strong(handle) => Some(handle),
            ScopeLink::Weak(_) => None,
        }
    }

    pub fn creator(&self) -> Option<ObjectRef> {
        self.links.lock().creator.clone()
    }

    #[cfg(test)]
    pub(crate) fn set_creator(&self, creator: Option<ObjectRef>) {
        self.links.lock().creator = creator;
        self.mark_meta_dirty();
    }

    // ── Frame state ─────────────────────────────────────────────────

    pub fn is_frame(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame(&self) -> Option<MutexGuard<'_, FrameState>> {
        self.frame.as_ref().map(|f| f.lock())
    }

    /// Mutates the frame state and marks it for the next save.
    pub fn update_frame<R>(&self, f: impl FnOnce(&mut FrameState) -> R) -> Option<R> {
        let out = f(&mut *self.frame.as_ref()?.lock());
        self.mark_meta_dirty();
        Some(out)
    }

    pub fn pending_exception(&self) -> Option<VmException> {
        self.frame().and_then(|f| f.exception.clone())
    }

    // ── Deference ───────────────────────────────────────────────────

    /// The reference counterpart, when this instance belongs to one.
    pub fn deference(&self) -> Option<Arc<DeferenceObject>> {
        self.deference.get().and_then(Weak::upgrade)
    }

    /// Binds the counterpart. Only the first binding sticks.
    pub(crate) fn bind_deference(&self, cell: &Arc<DeferenceObject>) {
        let _ = self.deference.set(Arc::downgrade(cell));
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Instance");
        s.field("id", &self.id).field("type", &self.ty.name);
        if let Some(r) = self.object_ref() {
            s.field("ref", r);
        }
        if let Some(frame) = &self.frame {
            s.field("frame", &*frame.lock());
        }
        s.finish_non_exhaustive()
    }
}
