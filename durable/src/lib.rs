//! Durable execution substrate: objects and call frames that live in a
//! store, are cached in memory while referenced and let run spaces stop in
//! one process and continue in another.

mod deference;
mod error;
mod instance;
mod object_ref;
mod reactive;
pub mod refcount;
mod runspace;
mod runtime;
mod scheduler;
pub mod slots;
pub mod storage;
mod types;
mod value;

pub use deference::{DeferenceObject, DerefEngine, Representation, RepresentationKind, SavePointReport};
pub use error::{DurableError, ExceptionKind, ProtocolViolation, Result, StorageError, VmException};
pub use instance::{Backing, FrameId, FrameState, FrameStatus, Instance, InstanceId};
pub use object_ref::ObjectRef;
pub use reactive::{Operand, ReactiveEngine};
pub use runspace::{
    ExecutionHost, FrameRunner, ManualHost, ResumeReport, RunSpace, RunSpaceDescriptor, RunSpaceId, RunState,
    Step, StepContext,
};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeCreateInfo};
pub use scheduler::{ScaleConfig, Scheduler, SliceHandler, WorkerId};
pub use types::{Persistence, PrimitiveKind, RestoreHook, SlotDescriptor, TypeDescriptor, TypeRegistry};
pub use value::{HandleResolver, ObjectHandle, Value, decode_any, encode};
