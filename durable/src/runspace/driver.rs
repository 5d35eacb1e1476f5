//! Steps run spaces frame by frame.
//!
//! The bytecode interpreter plugs in as a [`FrameRunner`]; the driver owns
//! everything around a step: pushing and popping frames with their caller
//! edges and scope loads, unwinding pending exceptions, awaiting other run
//! spaces and honoring cancellation and suspension at step boundaries.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{RunSpace, RunSpaceId, RunState};
use crate::{
    DurableError, FrameId, FrameStatus, Instance, ObjectHandle, Result, Runtime, Value, VmException,
};

/// Where runnable spaces go. Each submission asks for one slice.
pub trait ExecutionHost: Send + Sync {
    fn submit(&self, space: Arc<RunSpace>);

    /// Returns once no slice is executing. Queued submissions may stay
    /// queued.
    fn quiesce(&self) {}
}

/// A queue drained by the caller, for tests and single-threaded embedders.
#[derive(Debug, Default)]
pub struct ManualHost {
    queue: Mutex<VecDeque<Arc<RunSpace>>>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<Arc<RunSpace>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl ExecutionHost for ManualHost {
    fn submit(&self, space: Arc<RunSpace>) {
        self.queue.lock().push_back(space);
    }
}

/// What a frame asks the driver to do after one step.
#[derive(Debug)]
pub enum Step {
    Continue,
    /// Push a new frame on top of the current one.
    Call(ObjectHandle),
    Return(Value),
    Raise(VmException),
    /// Pause until the given run space is done. Its result lands in the
    /// frame's result slot, its exception becomes the frame's pending one.
    Await(RunSpaceId),
    /// End the slice and go back to the host.
    Yield,
}

pub struct StepContext<'a> {
    runtime: &'a Runtime,
    space: &'a Arc<RunSpace>,
    frame: &'a ObjectHandle,
    frame_id: FrameId,
}

impl<'a> StepContext<'a> {
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    pub fn space(&self) -> &'a Arc<RunSpace> {
        self.space
    }

    pub fn frame(&self) -> &'a ObjectHandle {
        self.frame
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn get(&self, handle: &ObjectHandle, index: usize) -> Result<Value> {
        self.runtime.get_slot(handle, index, Some(self.frame_id))
    }

    pub fn set(&self, handle: &ObjectHandle, index: usize, value: Value) -> Result<()> {
        self.runtime.set_slot(handle, index, value, Some(self.frame_id))
    }

    /// Instantiates `type_name` with the current frame as creator.
    pub fn create(&self, type_name: &str) -> Result<ObjectHandle> {
        self.runtime.create(type_name, Some(self.frame))
    }

    /// Forks a child run space starting at `entry`.
    pub fn spawn(&self, name: &str, entry: ObjectHandle) -> Result<Arc<RunSpace>> {
        self.runtime.spawn_child(name, entry, Some(self.space))
    }
}

/// The interpreter seam.
pub trait FrameRunner: Send + Sync {
    fn step(&self, ctx: &StepContext<'_>, frame: &Arc<Instance>) -> Result<Step>;

    /// Offers a pending exception to its frame. Returning true means it was
    /// handled and the frame goes on.
    fn catch(&self, _ctx: &StepContext<'_>, _frame: &Arc<Instance>, _exception: &VmException) -> bool {
        false
    }
}

enum Flow {
    Next,
    EndSlice,
}

impl Runtime {
    /// Runs one slice and hands the space back to the host when it is
    /// still runnable.
    pub fn drive(&self, space: &Arc<RunSpace>) {
        match self.run_slice(space) {
            Ok(RunState::Running) if !space.suspend_requested() => self.host.submit(Arc::clone(space)),
            Ok(state) => trace!("{} parked as {state:?}", space.id()),
            Err(err) => warn!("{}: slice failed: {err}", space.id()),
        }
    }

    /// Runs up to the step budget. Returns the state the space ends in.
    pub fn run_slice(&self, space: &Arc<RunSpace>) -> Result<RunState> {
        let _slice = space.slice.lock();
        for _ in 0..self.info.step_budget.max(1) {
            if space.state() != RunState::Running {
                break;
            }
            if space.cancel_requested() {
                self.cancel_locked(space)?;
                break;
            }
            if space.suspend_requested() {
                break;
            }
            let Some(handle) = space.current() else {
                self.finish(space, Value::Null, None);
                break;
            };
            let frame = match self.deref.instance(&handle, None) {
                Ok(frame) if frame.is_frame() => frame,
                Ok(other) => {
                    let err = DurableError::TypeMismatch {
                        slot: "current".into(),
                        expected: "frame",
                        found: "object",
                    };
                    debug!("{}: {} is not a frame", space.id(), other.type_name());
                    self.finish(space, Value::Null, Some(err.exception()));
                    break;
                }
                Err(err) => {
                    self.finish(space, Value::Null, Some(err.exception()));
                    break;
                }
            };
            let ctx = StepContext {
                runtime: self,
                space,
                frame: &handle,
                frame_id: frame.id(),
            };
            match self.step(&ctx, &frame) {
                Ok(Flow::Next) => {}
                Ok(Flow::EndSlice) => break,
                Err(err) => {
                    debug!("{}: step failed: {err}", space.id());
                    frame.update_frame(|f| f.exception = Some(err.exception()));
                }
            }
        }
        Ok(space.state())
    }

    fn step(&self, ctx: &StepContext<'_>, frame: &Arc<Instance>) -> Result<Flow> {
        if let Some(exception) = frame.pending_exception() {
            return self.unwind(ctx, frame, exception);
        }
        match self.runner.step(ctx, frame)? {
            Step::Continue => Ok(Flow::Next),
            Step::Call(callee) => {
                let callee_frame = self.deref.instance(&callee, Some(ctx.frame_id))?;
                self.deref.install_caller(&callee_frame, Some(ctx.frame.clone()))?;
                self.deref.load_scope(&callee_frame)?;
                ctx.space.set_current(Some(callee));
                Ok(Flow::Next)
            }
            Step::Return(value) => self.return_from(ctx.space, frame, value, None),
            Step::Raise(exception) => {
                frame.update_frame(|f| f.exception = Some(exception));
                Ok(Flow::Next)
            }
            Step::Await(child) => self.await_space(ctx.space, child),
            Step::Yield => Ok(Flow::EndSlice),
        }
    }

    fn unwind(&self, ctx: &StepContext<'_>, frame: &Arc<Instance>, exception: VmException) -> Result<Flow> {
        if self.runner.catch(ctx, frame, &exception) {
            frame.update_frame(|f| f.exception = None);
            return Ok(Flow::Next);
        }
        trace!("{}: unwinding {exception}", ctx.space.id());
        self.return_from(ctx.space, frame, Value::Null, Some(exception))
    }

    /// Pops `frame`, handing its result (or exception) to the caller.
    fn return_from(
        &self,
        space: &Arc<RunSpace>,
        frame: &Arc<Instance>,
        value: Value,
        exception: Option<VmException>,
    ) -> Result<Flow> {
        let caller = frame.frame().and_then(|f| f.caller.clone());
        frame.update_frame(|f| {
            f.status = FrameStatus::Done;
            f.result = value.clone();
            f.exception = None;
        });
        // A frame that could not be saved still returns; its failure travels
        // on as the caller's pending exception unless one is already on its way.
        let exception = match self.deref.complete_frame(frame) {
            Ok(()) => exception,
            Err(err) => {
                debug!("{}: completing frame {:?}: {err}", space.id(), frame.id());
                exception.or_else(|| Some(err.exception()))
            }
        };
        let Some(caller) = caller else {
            self.finish(space, value, exception);
            return Ok(Flow::EndSlice);
        };
        let caller_frame = self.deref.instance(&caller, None)?;
        self.deref.load_scope(&caller_frame)?;
        caller_frame.update_frame(|f| match exception {
            Some(exception) => f.exception = Some(exception),
            None => f.result = value,
        });
        space.set_current(Some(caller));
        Ok(Flow::Next)
    }

    fn await_space(&self, space: &Arc<RunSpace>, child_id: RunSpaceId) -> Result<Flow> {
        let child = self.space(child_id)?;
        {
            let mut inner = space.lock();
            inner.state = RunState::Paused;
            inner.awaiting = Some(child_id);
        }
        let mut child_inner = child.lock();
        if child_inner.state == RunState::Done {
            let (result, exception) = (child_inner.result.clone(), child_inner.exception.clone());
            drop(child_inner);
            self.deliver(space, result, exception)?;
            return Ok(Flow::Next);
        }
        if !child_inner.pausing.iter().any(|w| w.as_ptr() == Arc::as_ptr(space)) {
            child_inner.pausing.push(Arc::downgrade(space));
        }
        debug!("{} paused on {child_id}", space.id());
        Ok(Flow::EndSlice)
    }

    /// Hands an awaited outcome to the current frame and makes the space
    /// runnable again. Does not schedule it.
    pub(crate) fn deliver(&self, space: &Arc<RunSpace>, result: Value, exception: Option<VmException>) -> Result<()> {
        if let Some(current) = space.current() {
            let frame = self.deref.instance(&current, None)?;
            frame.update_frame(|f| match exception {
                Some(exception) => f.exception = Some(exception),
                None => f.result = result,
            });
        }
        let mut inner = space.lock();
        inner.awaiting = None;
        if inner.state == RunState::Paused {
            inner.state = RunState::Running;
        }
        Ok(())
    }

    /// Marks the space done and wakes the spaces paused on it. A space that
    /// has a stored descriptor gets it rewritten as done, so a later resume
    /// does not run it again.
    pub(crate) fn finish(&self, space: &Arc<RunSpace>, result: Value, exception: Option<VmException>) {
        let pausing = {
            let mut inner = space.lock();
            inner.state = RunState::Done;
            inner.current = None;
            inner.awaiting = None;
            inner.result = result.clone();
            inner.exception = exception.clone();
            std::mem::take(&mut inner.pausing)
        };
        debug!("{} done", space.id());
        if space.is_stored() {
            let stored = self.deref.flush_all().and_then(|_| self.store_space(space));
            if let Err(err) = stored {
                warn!("{}: could not record completion: {err}", space.id());
            }
        }
        for waiting in pausing.iter().filter_map(Weak::upgrade) {
            if waiting.state() != RunState::Paused || waiting.awaiting() != Some(space.id()) {
                continue;
            }
            match self.deliver(&waiting, result.clone(), exception.clone()) {
                Ok(()) => self.host.submit(waiting),
                Err(err) => warn!("{}: could not wake {}: {err}", space.id(), waiting.id()),
            }
        }
    }

    /// Cancels a run space. A space inside a slice stops at its next step
    /// boundary, any other right away. Flushed mutations stay.
    pub fn cancel(&self, space: &Arc<RunSpace>) -> Result<()> {
        space.request_cancel();
        match space.state() {
            RunState::Done => Ok(()),
            RunState::Running => match space.slice.try_lock() {
                Some(_slice) => self.cancel_locked(space),
                None => Ok(()),
            },
            RunState::Paused | RunState::Pending => {
                let _slice = space.slice.lock();
                self.cancel_locked(space)
            }
        }
    }

    fn cancel_locked(&self, space: &Arc<RunSpace>) -> Result<()> {
        if space.is_done() {
            return Ok(());
        }
        let mut next = space.current();
        while let Some(handle) = next {
            let frame = self.deref.instance(&handle, None)?;
            next = frame.frame().and_then(|f| f.caller.clone());
            frame.update_frame(|f| f.status = FrameStatus::Done);
            self.deref.complete_frame(&frame)?;
        }
        debug!("{} cancelled", space.id());
        self.finish(space, Value::Null, Some(DurableError::Cancelled(space.id()).exception()));
        Ok(())
    }

    /// Drives the next queued space. Returns false when the queue is empty.
    pub fn run_next(&self, host: &ManualHost) -> bool {
        match host.pop() {
            Some(space) => {
                self.drive(&space);
                true
            }
            None => false,
        }
    }

    /// Drives queued spaces until none is left. Returns the slices run.
    pub fn run_pending(&self, host: &ManualHost) -> usize {
        let mut slices = 0;
        while self.run_next(host) {
            slices += 1;
        }
        slices
    }
}
