//! Execution contexts that survive the process.
//!
//! A [`RunSpace`] is one logical thread of control: a current call frame
//! plus its relations to other run spaces (the parent that forked it, the
//! children it forked, the spaces paused until it finishes). Run spaces are
//! captured as [`RunSpaceDescriptor`]s and rebuilt on resume.

mod driver;
mod persist;

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{ObjectHandle, Value, VmException};

pub use driver::{ExecutionHost, FrameRunner, ManualHost, Step, StepContext};
pub use persist::{ResumeReport, RunSpaceDescriptor};
pub(crate) use persist::{delete_descriptor, load_descriptors, store_descriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunSpaceId(pub i64);

impl fmt::Display for RunSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rs{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Created, never started.
    Pending,
    Running,
    /// Waiting for another run space to finish.
    Paused,
    Done,
}

pub(crate) struct RunSpaceInner {
    pub(crate) state: RunState,
    pub(crate) current: Option<ObjectHandle>,
    pub(crate) parent: Option<Weak<RunSpace>>,
    pub(crate) forked: Vec<Arc<RunSpace>>,
    pub(crate) pausing: Vec<Weak<RunSpace>>,
    pub(crate) awaiting: Option<RunSpaceId>,
    pub(crate) result: Value,
    pub(crate) exception: Option<VmException>,
}

pub struct RunSpace {
    id: RunSpaceId,
    name: String,
    inner: Mutex<RunSpaceInner>,
    /// Held while a slice runs; serializes the driver with cancellation.
    pub(crate) slice: Mutex<()>,
    cancel: AtomicBool,
    suspend: AtomicBool,
    /// Set once a descriptor of this space is in the store.
    stored: AtomicBool,
}

impl RunSpace {
    pub(crate) fn new(id: RunSpaceId, name: impl Into<String>) -> Arc<Self> {
        Self::with_state(id, name.into(), RunState::Pending, None, Value::Null, None)
    }

    pub(crate) fn with_state(
        id: RunSpaceId,
        name: String,
        state: RunState,
        current: Option<ObjectHandle>,
        result: Value,
        exception: Option<VmException>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            inner: Mutex::new(RunSpaceInner {
                state,
                current,
                parent: None,
                forked: Vec::new(),
                pausing: Vec::new(),
                awaiting: None,
                result,
                exception,
            }),
            slice: Mutex::new(()),
            cancel: AtomicBool::new(false),
            suspend: AtomicBool::new(false),
            stored: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> RunSpaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RunSpaceInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state() == RunState::Done
    }

    pub fn current(&self) -> Option<ObjectHandle> {
        self.inner.lock().current.clone()
    }

    pub fn parent(&self) -> Option<Arc<RunSpace>> {
        self.inner.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn forked(&self) -> Vec<Arc<RunSpace>> {
        self.inner.lock().forked.clone()
    }

    /// Run spaces paused until this one finishes.
    pub fn pausing(&self) -> Vec<Arc<RunSpace>> {
        self.inner.lock().pausing.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn awaiting(&self) -> Option<RunSpaceId> {
        self.inner.lock().awaiting
    }

    pub fn result(&self) -> Value {
        self.inner.lock().result.clone()
    }

    pub fn exception(&self) -> Option<VmException> {
        self.inner.lock().exception.clone()
    }

    #[cfg(test)]
    pub(crate) fn set_state(&self, state: RunState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn set_current(&self, frame: Option<ObjectHandle>) {
        self.inner.lock().current = frame;
    }

    pub(crate) fn link_child(self: &Arc<Self>, child: &Arc<RunSpace>) {
        child.inner.lock().parent = Some(Arc::downgrade(self));
        let mut inner = self.inner.lock();
        if !inner.forked.iter().any(|c| c.id == child.id) {
            inner.forked.push(Arc::clone(child));
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Asks the driver to stop at the next step boundary without
    /// rescheduling.
    pub fn request_suspend(&self) {
        self.suspend.store(true, Ordering::Release);
    }

    pub fn suspend_requested(&self) -> bool {
        self.suspend.load(Ordering::Acquire)
    }

    pub fn is_stored(&self) -> bool {
        self.stored.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stored(&self) {
        self.stored.store(true, Ordering::Release);
    }
}

impl fmt::Debug for RunSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RunSpace")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("current", &inner.current)
            .field("awaiting", &inner.awaiting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_are_linked_once() {
        let parent = RunSpace::new(RunSpaceId(1), "parent");
        let child = RunSpace::new(RunSpaceId(2), "child");
        parent.link_child(&child);
        parent.link_child(&child);
        assert_eq!(parent.forked().len(), 1);
        assert_eq!(child.parent().map(|p| p.id()), Some(RunSpaceId(1)));
    }

    #[test]
    fn states_serialize_as_lowercase_codes() {
        assert_eq!(serde_json::to_value(RunState::Paused).expect("serialize"), "paused");
        assert_eq!(
            serde_json::from_value::<RunState>(serde_json::json!("running")).expect("deserialize"),
            RunState::Running
        );
        assert_eq!(serde_json::to_value(RunSpaceId(4)).expect("serialize"), 4);
    }

    #[test]
    fn new_spaces_are_pending() {
        let space = RunSpace::new(RunSpaceId(3), "idle");
        assert_eq!(space.state(), RunState::Pending);
        assert!(!space.cancel_requested());
        space.request_cancel();
        assert!(space.cancel_requested());
    }
}
