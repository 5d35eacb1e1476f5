use std::sync::{Arc, Weak};

use ahash::{AHashMap, AHashSet};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    DerefEngine, DurableError, ExceptionKind, FrameId, Instance, ObjectHandle, ObjectRef, ReactiveEngine,
    Result, TypeRegistry, Value, VmException,
    deference::{RepresentationKind, SavePointReport},
    reactive::Operand,
    refcount::{RefCounter, ReferenceCounter},
    runspace::{
        ExecutionHost, FrameRunner, ManualHost, ResumeReport, RunSpace, RunSpaceDescriptor, RunSpaceId, RunState,
        Step, StepContext, delete_descriptor, load_descriptors, store_descriptor,
    },
    scheduler::{ScaleConfig, Scheduler},
    storage::{BinaryOp, RUNSPACE_TABLE, Storage, StorageExt},
    value::{decode_any, encode},
};

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RuntimeCreateInfo {
    /// Recorded in run space descriptors.
    pub node: String,
    pub scale: ScaleConfig,
    /// Read several reactive slots with one statement when the store allows.
    pub combine_reads: bool,
    /// Steps one slice may take before going back to the host.
    pub step_budget: usize,
}

impl Default for RuntimeCreateInfo {
    fn default() -> Self {
        Self {
            node: "local".into(),
            scale: ScaleConfig::default(),
            combine_reads: true,
            step_budget: 1024,
        }
    }
}

struct NoRunner;

impl FrameRunner for NoRunner {
    fn step(&self, _ctx: &StepContext<'_>, _frame: &Arc<Instance>) -> Result<Step> {
        Ok(Step::Raise(VmException::new(ExceptionKind::Type, "no frame runner installed")))
    }
}

pub struct RuntimeBuilder {
    storage: Arc<dyn Storage>,
    registry: TypeRegistry,
    info: RuntimeCreateInfo,
    counter: Option<Arc<dyn ReferenceCounter>>,
    runner: Option<Arc<dyn FrameRunner>>,
    host: Option<Arc<dyn ExecutionHost>>,
}

impl RuntimeBuilder {
    pub fn info(mut self, info: RuntimeCreateInfo) -> Self {
        self.info = info;
        self
    }

    pub fn counter(mut self, counter: Arc<dyn ReferenceCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn FrameRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn host(mut self, host: Arc<dyn ExecutionHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> Arc<Runtime> {
        let counter = self.counter.unwrap_or_else(|| Arc::new(RefCounter::new()));
        let deref = Arc::new(DerefEngine::new(self.storage, self.registry, counter));
        let reactive = ReactiveEngine::new(Arc::clone(&deref), self.info.combine_reads);
        Arc::new(Runtime {
            info: self.info,
            deref,
            reactive,
            runner: self.runner.unwrap_or_else(|| Arc::new(NoRunner)),
            host: self.host.unwrap_or_else(|| Arc::new(ManualHost::new())),
            spaces: Mutex::new(AHashMap::new()),
        })
    }

    /// Builds a runtime hosted on a fresh [`Scheduler`].
    pub fn build_with_scheduler(mut self) -> (Arc<Runtime>, Arc<Scheduler>) {
        let scheduler = Scheduler::new(self.info.scale);
        self.host = Some(scheduler.clone());
        let runtime = self.build();
        let weak: Weak<Runtime> = Arc::downgrade(&runtime);
        scheduler.set_handler(move |space| {
            if let Some(runtime) = weak.upgrade() {
                runtime.drive(space);
            }
        });
        (runtime, scheduler)
    }
}

/// Object access and run space lifecycle on top of one store.
pub struct Runtime {
    pub(crate) info: RuntimeCreateInfo,
    pub(crate) deref: Arc<DerefEngine>,
    pub(crate) reactive: ReactiveEngine,
    pub(crate) runner: Arc<dyn FrameRunner>,
    pub(crate) host: Arc<dyn ExecutionHost>,
    spaces: Mutex<AHashMap<RunSpaceId, Arc<RunSpace>>>,
}

impl Runtime {
    pub fn builder(storage: Arc<dyn Storage>, registry: TypeRegistry) -> RuntimeBuilder {
        RuntimeBuilder {
            storage,
            registry,
            info: RuntimeCreateInfo::default(),
            counter: None,
            runner: None,
            host: None,
        }
    }

    pub fn info(&self) -> &RuntimeCreateInfo {
        &self.info
    }

    pub fn deref(&self) -> &Arc<DerefEngine> {
        &self.deref
    }

    pub fn reactive(&self) -> &ReactiveEngine {
        &self.reactive
    }

    pub fn registry(&self) -> &TypeRegistry {
        self.deref.registry()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        self.deref.storage()
    }

    // ── Objects ─────────────────────────────────────────────────────

    pub fn create(&self, type_name: &str, creator: Option<&ObjectHandle>) -> Result<ObjectHandle> {
        let ty = self.registry().get(type_name)?;
        let creator = creator.map(|h| self.deref.instance(h, None)).transpose()?;
        self.deref.create(&ty, creator.as_deref())
    }

    pub fn resolve(&self, object_ref: &ObjectRef) -> Result<ObjectHandle> {
        self.deref.resolve(object_ref, None)
    }

    pub fn persist(&self, handle: &ObjectHandle) -> Result<ObjectRef> {
        self.deref.persist(handle)
    }

    pub fn get_slot(&self, handle: &ObjectHandle, index: usize, frame: Option<FrameId>) -> Result<Value> {
        self.reactive.get(handle, index, frame)
    }

    pub fn set_slot(&self, handle: &ObjectHandle, index: usize, value: Value, frame: Option<FrameId>) -> Result<()> {
        self.reactive.set(handle, index, value, frame)
    }

    pub fn binary(
        &self,
        dst: &ObjectHandle,
        index: usize,
        lhs: Operand,
        op: BinaryOp,
        rhs: Operand,
        frame: Option<FrameId>,
    ) -> Result<()> {
        self.reactive.binary(dst, index, lhs, op, rhs, frame)
    }

    pub fn increment(&self, dst: &ObjectHandle, index: usize, by: Value, frame: Option<FrameId>) -> Result<()> {
        self.reactive.increment(dst, index, by, frame)
    }

    pub fn move_slot(&self, dst: &ObjectHandle, index: usize, src: Operand, frame: Option<FrameId>) -> Result<()> {
        self.reactive.move_slot(dst, index, src, frame)
    }

    /// Saves a lazy object and contracts it when nothing holds it.
    /// Reactive objects are always reference-only.
    pub fn contract(&self, handle: &ObjectHandle) -> Result<RepresentationKind> {
        match handle {
            ObjectHandle::Deferred(cell) => self.deref.contract(cell),
            ObjectHandle::Local(instance) if instance.is_reactive() => Ok(RepresentationKind::ReferenceOnly),
            ObjectHandle::Local(instance) => Err(DurableError::NotPersistable(instance.type_name().to_owned())),
        }
    }

    pub fn save_point(&self) -> Result<SavePointReport> {
        self.deref.save_point()
    }

    // ── Run spaces ──────────────────────────────────────────────────

    pub fn space(&self, id: RunSpaceId) -> Result<Arc<RunSpace>> {
        self.spaces
            .lock()
            .get(&id)
            .cloned()
            .ok_or(DurableError::UnknownRunSpace(id))
    }

    pub fn spaces(&self) -> Vec<Arc<RunSpace>> {
        let mut spaces: Vec<_> = self.spaces.lock().values().cloned().collect();
        spaces.sort_by_key(|s| s.id());
        spaces
    }

    /// Starts a top-level run space at `entry`.
    pub fn spawn(&self, name: &str, entry: ObjectHandle) -> Result<Arc<RunSpace>> {
        self.spawn_child(name, entry, None)
    }

    pub(crate) fn spawn_child(
        &self,
        name: &str,
        entry: ObjectHandle,
        parent: Option<&Arc<RunSpace>>,
    ) -> Result<Arc<RunSpace>> {
        let space = self.create_space(name, entry, parent)?;
        self.start(&space);
        Ok(space)
    }

    /// Registers a pending run space without scheduling it.
    pub fn create_space(
        &self,
        name: &str,
        entry: ObjectHandle,
        parent: Option<&Arc<RunSpace>>,
    ) -> Result<Arc<RunSpace>> {
        let frame = self.deref.instance(&entry, None)?;
        if !frame.is_frame() {
            return Err(DurableError::TypeMismatch {
                slot: "entry".into(),
                expected: "frame",
                found: "object",
            });
        }
        let id = RunSpaceId(self.storage().next_id(RUNSPACE_TABLE)?);
        self.deref.load_scope(&frame)?;
        let space = RunSpace::new(id, name);
        space.set_current(Some(entry));
        if let Some(parent) = parent {
            parent.link_child(&space);
        }
        self.spaces.lock().insert(id, Arc::clone(&space));
        debug!("created {id} ({name})");
        Ok(space)
    }

    /// Moves a pending run space to running and schedules it.
    pub fn start(&self, space: &Arc<RunSpace>) {
        {
            let mut inner = space.lock();
            if inner.state != RunState::Pending {
                return;
            }
            inner.state = RunState::Running;
        }
        self.host.submit(Arc::clone(space));
    }

    /// Forgets a run space and deletes its stored descriptor, cancelling it
    /// first when it has not finished.
    pub fn destroy(&self, id: RunSpaceId) -> Result<bool> {
        if let Ok(space) = self.space(id)
            && !space.is_done()
        {
            self.cancel(&space)?;
        }
        self.spaces.lock().remove(&id);
        delete_descriptor(&**self.storage(), id)
    }

    // ── Suspend ─────────────────────────────────────────────────────

    fn describe(&self, space: &Arc<RunSpace>) -> Result<RunSpaceDescriptor> {
        let (state, current, parent, forked, pausing, awaiting, result, exception) = {
            let inner = space.lock();
            (
                inner.state,
                inner.current.clone(),
                inner.parent.as_ref().and_then(Weak::upgrade).map(|p| p.id()),
                inner.forked.iter().map(|c| c.id()).collect(),
                inner.pausing.iter().filter_map(Weak::upgrade).map(|p| p.id()).collect(),
                inner.awaiting,
                inner.result.clone(),
                inner.exception.clone(),
            )
        };
        Ok(RunSpaceDescriptor {
            id: space.id(),
            name: space.name().to_owned(),
            node: self.info.node.clone(),
            state,
            current: current.as_ref().map(|h| self.deref.persist(h)).transpose()?,
            parent,
            forked,
            pausing,
            awaiting,
            result: encode(&result)?,
            exception,
        })
    }

    pub(crate) fn store_space(&self, space: &Arc<RunSpace>) -> Result<RunSpaceDescriptor> {
        let descriptor = self.describe(space)?;
        store_descriptor(&**self.storage(), &descriptor)?;
        space.mark_stored();
        Ok(descriptor)
    }

    /// Writes the run space's descriptor after flushing every dirty object.
    pub fn suspend(&self, space: &Arc<RunSpace>) -> Result<RunSpaceDescriptor> {
        self.deref.flush_all()?;
        self.store_space(space)
    }

    /// Stops every run space at its next step boundary and stores the
    /// descriptors of the unfinished ones. Finished spaces that were stored
    /// before are rewritten as done.
    pub fn suspend_all(&self) -> Result<Vec<RunSpaceDescriptor>> {
        let spaces = self.spaces();
        for space in &spaces {
            space.request_suspend();
        }
        self.host.quiesce();
        let flushed = self.deref.flush_all()?;
        let mut descriptors = Vec::new();
        for space in spaces.iter().filter(|s| !s.is_done() || s.is_stored()) {
            // Taking the slice lock waits for a slice still in flight.
            let _slice = space.slice.lock();
            descriptors.push(self.store_space(space)?);
        }
        info!(
            "suspended {} run spaces on {} ({flushed} objects flushed)",
            descriptors.len(),
            self.info.node
        );
        Ok(descriptors)
    }

    // ── Resume ──────────────────────────────────────────────────────

    pub fn load_descriptors(&self) -> Result<(Vec<RunSpaceDescriptor>, Vec<(RunSpaceId, DurableError)>)> {
        load_descriptors(&**self.storage())
    }

    /// Loads and resumes every stored run space.
    pub fn resume_stored(&self) -> Result<ResumeReport> {
        let (descriptors, failures) = self.load_descriptors()?;
        for (id, err) in &failures {
            warn!("descriptor of {id} is unreadable: {err}");
        }
        let mut report = self.resume(descriptors);
        report.failures.extend(failures);
        Ok(report)
    }

    fn restore(&self, descriptor: &RunSpaceDescriptor) -> Result<Arc<RunSpace>> {
        let current = descriptor
            .current
            .as_ref()
            .map(|r| self.deref.resolve(r, None))
            .transpose()?;
        if let Some(handle) = &current {
            let frame = self.deref.instance(handle, None)?;
            self.deref.load_scope(&frame)?;
        }
        let result = decode_any(&descriptor.result, &*self.deref)?;
        if descriptor.node != self.info.node {
            debug!("{} moves from {} to {}", descriptor.id, descriptor.node, self.info.node);
        }
        let space = RunSpace::with_state(
            descriptor.id,
            descriptor.name.clone(),
            descriptor.state,
            current,
            result,
            descriptor.exception.clone(),
        );
        space.mark_stored();
        Ok(space)
    }

    fn relink(&self, space: &Arc<RunSpace>, descriptor: &RunSpaceDescriptor) {
        let spaces = self.spaces.lock();
        if let Some(parent) = descriptor.parent.and_then(|id| spaces.get(&id)) {
            parent.link_child(space);
        }
        for child in descriptor.forked.iter().filter_map(|id| spaces.get(id)) {
            space.link_child(child);
        }
        for waiting in descriptor.pausing.iter().filter_map(|id| spaces.get(id)) {
            add_pausing(space, waiting);
        }
        if let Some(awaited) = descriptor.awaiting.and_then(|id| spaces.get(&id)) {
            add_pausing(awaited, space);
        }
        space.lock().awaiting = descriptor.awaiting;
    }

    /// Rebuilds run spaces from descriptors. Only the current frame of each
    /// is expanded; relations are relinked by id and running spaces are
    /// scheduled. A descriptor that fails does not stop the others.
    pub fn resume(&self, descriptors: Vec<RunSpaceDescriptor>) -> ResumeReport {
        let mut report = ResumeReport::default();
        let mut finished: AHashMap<RunSpaceId, RunSpaceDescriptor> = AHashMap::new();
        let mut restored = Vec::new();
        for descriptor in descriptors {
            if descriptor.state == RunState::Done {
                finished.insert(descriptor.id, descriptor);
                continue;
            }
            match self.restore(&descriptor) {
                Ok(space) => restored.push((space, descriptor)),
                Err(err) => report.failures.push((descriptor.id, err)),
            }
        }
        {
            let mut spaces = self.spaces.lock();
            for (space, _) in &restored {
                spaces.insert(space.id(), Arc::clone(space));
            }
        }
        for (space, descriptor) in &restored {
            self.relink(space, descriptor);
        }

        let known: AHashSet<RunSpaceId> = self.spaces.lock().keys().copied().collect();
        for (space, descriptor) in &restored {
            let Some(awaited) = descriptor.awaiting else {
                continue;
            };
            if space.state() != RunState::Paused {
                continue;
            }
            if let Some(done) = finished.get(&awaited) {
                let delivered = decode_any(&done.result, &*self.deref)
                    .and_then(|result| self.deliver(space, result, done.exception.clone()));
                if let Err(err) = delivered {
                    report.failures.push((space.id(), err));
                }
            } else if !known.contains(&awaited) {
                report.failures.push((space.id(), DurableError::UnknownRunSpace(awaited)));
            }
        }

        for (space, _) in &restored {
            if space.state() == RunState::Running {
                self.host.submit(Arc::clone(space));
            }
        }
        for (id, err) in &report.failures {
            warn!("resume of {id} failed: {err}");
        }
        report.spaces = restored.into_iter().map(|(space, _)| space).collect();
        info!(
            "resumed {} run spaces, {} scheduled, {} failed",
            report.spaces.len(),
            report.scheduled(),
            report.failures.len()
        );
        report
    }
}

fn add_pausing(awaited: &Arc<RunSpace>, waiting: &Arc<RunSpace>) {
    let mut inner = awaited.lock();
    if !inner.pausing.iter().any(|w| w.as_ptr() == Arc::as_ptr(waiting)) {
        inner.pausing.push(Arc::downgrade(waiting));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Persistence, PrimitiveKind, TypeDescriptor,
        refcount::VerifyingCounter,
        storage::{MemoryStore, Row, Statement},
    };
    use serde_json::json;

    /// `Add2` yields once, then adds 2 to its target. `Parent` forks a
    /// `Child` and awaits it; the child returns 42. `Outer` calls an `Inner`
    /// frame that yields once and then returns 41, or raises when its `fail`
    /// slot is set; `Outer` returns the result plus one.
    struct TestRunner;

    impl FrameRunner for TestRunner {
        fn step(&self, ctx: &StepContext<'_>, frame: &Arc<Instance>) -> Result<Step> {
            let pc = frame.frame().and_then(|f| f.pc).unwrap_or(0);
            frame.update_frame(|f| f.pc = Some(pc + 1));
            match (frame.type_name(), pc) {
                ("Add2", 0) => Ok(Step::Yield),
                ("Add2", _) => {
                    let target = ctx.get(ctx.frame(), 0)?;
                    let target = target.as_object().cloned().ok_or_else(|| DurableError::TypeMismatch {
                        slot: "target".into(),
                        expected: "object",
                        found: "null",
                    })?;
                    ctx.runtime().increment(&target, 0, Value::Int(2), Some(ctx.frame_id()))?;
                    Ok(Step::Return(Value::Null))
                }
                ("Parent", 0) => {
                    let entry = ctx.create("Child")?;
                    let child = ctx.spawn("child", entry)?;
                    ctx.set(ctx.frame(), 0, Value::Int(child.id().0))?;
                    Ok(Step::Continue)
                }
                ("Parent", 1) => {
                    let child = ctx.get(ctx.frame(), 0)?.as_int().unwrap_or(0);
                    Ok(Step::Await(RunSpaceId(child)))
                }
                ("Parent", _) => {
                    let result = frame.frame().map(|f| f.result.clone()).unwrap_or(Value::Null);
                    Ok(Step::Return(result))
                }
                ("Child", _) => Ok(Step::Return(Value::Int(42))),
                ("Outer", 0) => {
                    let inner = ctx.create("Inner")?;
                    ctx.set(&inner, 0, ctx.get(ctx.frame(), 0)?)?;
                    Ok(Step::Call(inner))
                }
                ("Outer", _) => {
                    let result = frame.frame().map(|f| f.result.clone()).unwrap_or(Value::Null);
                    Ok(Step::Return(Value::Int(result.as_int().unwrap_or(0) + 1)))
                }
                ("Inner", 0) => Ok(Step::Yield),
                ("Inner", _) if ctx.get(ctx.frame(), 0)?.as_bool() == Some(true) => {
                    Ok(Step::Raise(VmException::user("inner failed")))
                }
                ("Inner", _) => Ok(Step::Return(Value::Int(41))),
                _ => Ok(Step::Yield),
            }
        }
    }

    fn mk_registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry.register(TypeDescriptor::new("Counter", Persistence::Lazy).slot("value", PrimitiveKind::Int));
        registry.register(
            TypeDescriptor::new("Add2", Persistence::Lazy)
                .typed_slot("target", PrimitiveKind::Object, "Counter")
                .frame(),
        );
        registry.register(
            TypeDescriptor::new("Parent", Persistence::Lazy)
                .slot("child", PrimitiveKind::Int)
                .frame(),
        );
        registry.register(TypeDescriptor::new("Child", Persistence::Lazy).frame());
        for name in ["Outer", "Inner"] {
            registry.register(
                TypeDescriptor::new(name, Persistence::Lazy)
                    .slot("fail", PrimitiveKind::Bool)
                    .frame(),
            );
        }
        registry
    }

    struct Node {
        runtime: Arc<Runtime>,
        host: Arc<ManualHost>,
        counter: Arc<VerifyingCounter>,
    }

    fn mk_node(store: &MemoryStore, node: &str) -> Node {
        let host = Arc::new(ManualHost::new());
        let counter = Arc::new(VerifyingCounter::new());
        let runtime = Runtime::builder(Arc::new(store.clone()), mk_registry())
            .info(RuntimeCreateInfo {
                node: node.into(),
                ..RuntimeCreateInfo::default()
            })
            .counter(counter.clone())
            .runner(Arc::new(TestRunner))
            .host(host.clone())
            .build();
        Node { runtime, host, counter }
    }

    fn mk_add2(runtime: &Runtime, start: i64) -> (ObjectHandle, ObjectHandle) {
        let counter = runtime.create("Counter", None).expect("counter");
        runtime.set_slot(&counter, 0, Value::Int(start), None).expect("value");
        let frame = runtime.create("Add2", None).expect("frame");
        runtime
            .set_slot(&frame, 0, Value::Object(counter.clone()), None)
            .expect("target");
        (counter, frame)
    }

    #[test]
    fn mutations_after_a_resume_reach_the_store() {
        let store = MemoryStore::new();
        let first = mk_node(&store, "node-a");
        let (counter, frame) = mk_add2(&first.runtime, 5);
        let counter_ref = first.runtime.persist(&counter).expect("persist");
        first.runtime.spawn("add", frame).expect("spawn");

        assert!(first.runtime.run_next(&first.host), "first slice yields");
        let descriptors = first.runtime.suspend_all().expect("suspend");
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].state, RunState::Running);
        drop(first);

        let second = mk_node(&store, "node-b");
        let report = second.runtime.resume_stored().expect("resume");
        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.scheduled(), 1);
        second.runtime.run_pending(&second.host);

        let space = &report.spaces[0];
        assert!(space.is_done());
        assert_eq!(space.exception(), None);
        let counter = second.runtime.resolve(&counter_ref).expect("resolve");
        assert_eq!(second.runtime.get_slot(&counter, 0, None).expect("read"), Value::Int(7));

        second.runtime.save_point().expect("save point");
        let row = store.peek("Counter", counter_ref.id).expect("row");
        assert_eq!(row["value"], json!(7));
        assert!(second.counter.violations().is_empty(), "{:?}", second.counter.violations());
    }

    #[test]
    fn awaiting_relations_survive_a_resume() {
        let store = MemoryStore::new();
        let first = mk_node(&store, "node-a");
        let entry = first.runtime.create("Parent", None).expect("entry");
        let root = first.runtime.spawn("root", entry).expect("spawn");

        first.runtime.run_next(&first.host);
        assert_eq!(root.state(), RunState::Paused);
        let child_id = root.awaiting().expect("awaiting");
        first.runtime.suspend_all().expect("suspend");
        drop(first);

        let second = mk_node(&store, "node-b");
        let report = second.runtime.resume_stored().expect("resume");
        assert!(report.is_clean(), "{:?}", report.failures);
        let root = second.runtime.space(root.id()).expect("root");
        let child = second.runtime.space(child_id).expect("child");

        assert_eq!(root.state(), RunState::Paused);
        assert_eq!(child.state(), RunState::Running);
        assert!(root.pausing().is_empty());
        assert_eq!(child.parent().map(|p| p.id()), Some(root.id()));
        assert_eq!(child.pausing().iter().map(|s| s.id()).collect::<Vec<_>>(), vec![root.id()]);
        assert_eq!(report.scheduled(), 1, "only the child is runnable");

        second.runtime.run_pending(&second.host);
        assert!(child.is_done());
        assert!(root.is_done());
        assert_eq!(root.result(), Value::Int(42));
    }

    #[test]
    fn finished_children_wake_their_parent_on_resume() {
        let store = MemoryStore::new();
        let first = mk_node(&store, "node-a");
        let entry = first.runtime.create("Parent", None).expect("entry");
        let root = first.runtime.spawn("root", entry).expect("spawn");
        first.runtime.run_next(&first.host);
        assert_eq!(root.state(), RunState::Paused);
        let child = first.runtime.space(root.awaiting().expect("awaiting")).expect("child");

        // Both are checkpointed, then only the child runs before the node goes away.
        first.runtime.suspend(&root).expect("checkpoint root");
        first.runtime.suspend(&child).expect("checkpoint child");
        assert!(first.runtime.run_next(&first.host), "the child's slice");
        assert!(child.is_done());
        drop(first);

        let second = mk_node(&store, "node-b");
        let report = second.runtime.resume_stored().expect("resume");
        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.spaces.len(), 1, "the finished child is not restored");
        let root = second.runtime.space(root.id()).expect("root");
        assert_eq!(root.state(), RunState::Running);
        second.runtime.run_pending(&second.host);
        assert_eq!(root.result(), Value::Int(42));
    }

    #[test]
    fn finished_spaces_are_not_run_again_after_a_resume() {
        let store = MemoryStore::new();
        let first = mk_node(&store, "node-a");
        let (counter, frame) = mk_add2(&first.runtime, 5);
        let counter_ref = first.runtime.persist(&counter).expect("persist");
        let space = first.runtime.spawn("add", frame).expect("spawn");
        assert!(first.runtime.run_next(&first.host));
        first.runtime.suspend(&space).expect("checkpoint");

        first.runtime.run_pending(&first.host);
        assert!(space.is_done());
        let row = store.peek(RUNSPACE_TABLE, space.id().0).expect("descriptor row");
        assert_eq!(row["state"], json!("done"), "completion is recorded right away");

        let descriptors = first.runtime.suspend_all().expect("suspend");
        assert_eq!(descriptors.iter().map(|d| d.state).collect::<Vec<_>>(), vec![RunState::Done]);
        drop(first);

        let second = mk_node(&store, "node-b");
        let report = second.runtime.resume_stored().expect("resume");
        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(report.spaces.is_empty());
        assert_eq!(second.runtime.run_pending(&second.host), 0);
        let counter = second.runtime.resolve(&counter_ref).expect("resolve");
        assert_eq!(second.runtime.get_slot(&counter, 0, None).expect("read"), Value::Int(7));
    }

    /// Runs `Outer` until `Inner` yields, then suspends with `Inner` current
    /// and `Outer` as its caller.
    fn suspend_inside_a_call(store: &MemoryStore, fail: bool) -> RunSpaceId {
        let first = mk_node(store, "node-a");
        let outer = first.runtime.create("Outer", None).expect("outer");
        first.runtime.set_slot(&outer, 0, Value::Bool(fail), None).expect("fail");
        let space = first.runtime.spawn("call", outer).expect("spawn");
        assert!(first.runtime.run_next(&first.host));
        let current = space.current().expect("current frame");
        let current = first.runtime.deref().instance(&current, None).expect("frame");
        assert_eq!(current.type_name(), "Inner");
        first.runtime.suspend_all().expect("suspend");
        space.id()
    }

    #[test]
    fn calls_in_flight_return_into_the_restored_caller() {
        let store = MemoryStore::new();
        let id = suspend_inside_a_call(&store, false);

        let second = mk_node(&store, "node-b");
        let report = second.runtime.resume_stored().expect("resume");
        assert!(report.is_clean(), "{:?}", report.failures);
        second.runtime.run_pending(&second.host);

        let space = second.runtime.space(id).expect("space");
        assert!(space.is_done());
        assert_eq!(space.exception(), None);
        assert_eq!(space.result(), Value::Int(42));
        assert!(second.counter.violations().is_empty(), "{:?}", second.counter.violations());
    }

    #[test]
    fn exceptions_in_flight_reach_the_restored_caller() {
        let store = MemoryStore::new();
        let id = suspend_inside_a_call(&store, true);

        let second = mk_node(&store, "node-b");
        second.runtime.resume_stored().expect("resume");
        second.runtime.run_pending(&second.host);

        let space = second.runtime.space(id).expect("space");
        assert!(space.is_done());
        assert_eq!(space.exception().map(|e| e.message), Some("inner failed".to_owned()));
        assert_eq!(space.result(), Value::Null);
    }

    #[test]
    fn updates_through_a_resolved_object_survive_contraction() {
        let store = MemoryStore::new();
        let node = mk_node(&store, "node-a");
        let a = node.runtime.create("Counter", None).expect("a");
        node.runtime.set_slot(&a, 0, Value::Int(5), None).expect("a = 5");
        let a_ref = node.runtime.persist(&a).expect("persist");
        assert_eq!(node.runtime.contract(&a).expect("contract"), RepresentationKind::ReferenceOnly);
        drop(a);
        node.runtime.save_point().expect("save point");
        assert!(node.runtime.deref().cached(&a_ref).is_none());

        let resolved = node.runtime.resolve(&a_ref).expect("resolve");
        assert_eq!(node.runtime.get_slot(&resolved, 0, None).expect("read"), Value::Int(5));
        node.runtime.set_slot(&resolved, 0, Value::Int(7), None).expect("a = 7");
        assert_eq!(
            node.runtime.contract(&resolved).expect("contract"),
            RepresentationKind::ReferenceOnly
        );
        drop(resolved);
        node.runtime.save_point().expect("save point");

        let again = node.runtime.resolve(&a_ref).expect("resolve again");
        assert_eq!(node.runtime.get_slot(&again, 0, None).expect("read"), Value::Int(7));
        let other = mk_node(&store, "node-b");
        let fresh = other.runtime.resolve(&a_ref).expect("resolve elsewhere");
        assert_eq!(other.runtime.get_slot(&fresh, 0, None).expect("read"), Value::Int(7));
        assert!(node.counter.violations().is_empty(), "{:?}", node.counter.violations());
    }

    #[test]
    fn broken_descriptors_do_not_block_the_rest() {
        let store = MemoryStore::new();
        let first = mk_node(&store, "node-a");
        let (_, frame) = mk_add2(&first.runtime, 1);
        let space = first.runtime.spawn("good", frame).expect("spawn");
        first.runtime.suspend_all().expect("suspend");

        let mut descriptor = first.runtime.suspend(&space).expect("describe");
        descriptor.id = RunSpaceId(99);
        descriptor.current = Some(ObjectRef::new("Add2", 4242));
        store_descriptor(&store, &descriptor).expect("store");
        drop(first);

        let second = mk_node(&store, "node-b");
        let report = second.runtime.resume_stored().expect("resume");
        assert_eq!(report.spaces.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, RunSpaceId(99));
        assert!(report.failures[0].1.is_dangling());
    }

    #[test]
    fn unreadable_rows_are_reported() {
        let store = MemoryStore::new();
        let mut row = Row::new();
        row.insert("name".into(), json!("garbled"));
        store
            .write(Statement::Upsert {
                table: RUNSPACE_TABLE.into(),
                id: 5,
                row,
            })
            .expect("write");
        let node = mk_node(&store, "node-a");
        let report = node.runtime.resume_stored().expect("resume");
        assert!(report.spaces.is_empty());
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn cancelling_a_paused_space() {
        let store = MemoryStore::new();
        let node = mk_node(&store, "node-a");
        let entry = node.runtime.create("Parent", None).expect("entry");
        let root = node.runtime.spawn("root", entry).expect("spawn");
        node.runtime.run_next(&node.host);
        assert_eq!(root.state(), RunState::Paused);

        node.runtime.cancel(&root).expect("cancel");
        assert!(root.is_done());
        assert_eq!(root.exception().map(|e| e.kind), Some(ExceptionKind::Cancelled));

        // The child still runs to completion and finds nobody to wake.
        node.runtime.run_pending(&node.host);
        let child = node.runtime.spaces().into_iter().find(|s| s.id() != root.id()).expect("child");
        assert_eq!(child.result(), Value::Int(42));
        assert_eq!(root.result(), Value::Null);
    }

    #[test]
    fn destroying_a_space_deletes_its_descriptor() {
        let store = MemoryStore::new();
        let node = mk_node(&store, "node-a");
        let (_, frame) = mk_add2(&node.runtime, 0);
        let space = node.runtime.spawn("add", frame).expect("spawn");
        node.runtime.suspend(&space).expect("suspend");
        assert_eq!(store.row_count(RUNSPACE_TABLE), 1);

        assert!(node.runtime.destroy(space.id()).expect("destroy"));
        assert!(space.is_done(), "unfinished spaces are cancelled first");
        assert_eq!(store.row_count(RUNSPACE_TABLE), 0);
        assert!(matches!(
            node.runtime.space(space.id()),
            Err(DurableError::UnknownRunSpace(_))
        ));
    }

    #[test]
    fn entries_must_be_frames() {
        let node = mk_node(&MemoryStore::new(), "node-a");
        let counter = node.runtime.create("Counter", None).expect("counter");
        assert!(matches!(
            node.runtime.spawn("bad", counter),
            Err(DurableError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn scheduler_hosted_runtimes_drive_spaces_to_completion() {
        let store = MemoryStore::new();
        let (runtime, scheduler) = Runtime::builder(Arc::new(store.clone()), mk_registry())
            .runner(Arc::new(TestRunner))
            .build_with_scheduler();
        let entry = runtime.create("Parent", None).expect("entry");
        let root = runtime.spawn("root", entry).expect("spawn");

        for _ in 0..200 {
            if root.is_done() {
                break;
            }
            scheduler.run_main_once();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(root.result(), Value::Int(42));
        scheduler.shutdown();
    }
}
