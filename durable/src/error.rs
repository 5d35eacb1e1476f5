//! Error taxonomy for the durable substrate.
//!
//! Three families matter to callers:
//!
//! - storage failures ([`DurableError::Storage`]) abort the issuing
//!   instruction and become a VM exception in the owning call frame;
//! - identity failures ([`DurableError::Dangling`]) mean the referenced row
//!   does not exist, which is distinct from a transient storage failure;
//! - protocol violations ([`DurableError::Protocol`]) are broken internal
//!   invariants and are raised immediately, never clamped.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FrameId, ObjectRef, RunSpaceId};

pub type Result<T> = std::result::Result<T, DurableError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("storage connection failed: {0}")]
    Connection(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("arithmetic failed: {0}")]
    Arithmetic(String),
    #[error("statement rejected: {0}")]
    Statement(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolViolation {
    #[error("{target} is already expanded by frame {expander:?}, frame {requester:?} tried to expand it again")]
    DoubleExpansion {
        target: ObjectRef,
        expander: FrameId,
        requester: FrameId,
    },
    #[error("reference count of {target} would drop below zero")]
    RefCountUnderflow { target: ObjectRef },
    #[error("{0} is not expanded")]
    NotExpanded(ObjectRef),
    #[error("frame {0:?} was already released")]
    FrameReleased(FrameId),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DurableError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("dangling reference: {0} does not exist")]
    Dangling(ObjectRef),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("type `{type_name}` has no slot {index}")]
    NoSuchSlot { type_name: String, index: usize },
    #[error("slot `{slot}` expects {expected}, got {found}")]
    TypeMismatch {
        slot: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("instance of `{0}` is not persistable")]
    NotPersistable(String),
    #[error("document codec: {0}")]
    Codec(String),
    #[error("unknown run space {0:?}")]
    UnknownRunSpace(RunSpaceId),
    #[error("run space {0:?} was cancelled")]
    Cancelled(RunSpaceId),
}

/// Classification visible to language-level exception handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionKind {
    Storage,
    /// Division by zero or overflow, including inside pushed-down updates.
    Arithmetic,
    DanglingReference,
    ProtocolViolation,
    Type,
    Cancelled,
    /// Raised by the program itself.
    User,
}

/// Pending exception carried by a call frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmException {
    pub kind: ExceptionKind,
    pub message: String,
}

impl VmException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::User, message)
    }
}

impl ExceptionKind {
    pub fn code(self) -> &'static str {
        match self {
            ExceptionKind::Storage => "storage",
            ExceptionKind::Arithmetic => "arithmetic",
            ExceptionKind::DanglingReference => "dangling-reference",
            ExceptionKind::ProtocolViolation => "protocol-violation",
            ExceptionKind::Type => "type",
            ExceptionKind::Cancelled => "cancelled",
            ExceptionKind::User => "user",
        }
    }
}

impl fmt::Display for VmException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl From<serde_json::Error> for DurableError {
    fn from(err: serde_json::Error) -> Self {
        DurableError::Codec(err.to_string())
    }
}

impl DurableError {
    /// The VM-level exception this failure surfaces as.
    pub fn exception(&self) -> VmException {
        let kind = match self {
            DurableError::Storage(StorageError::Arithmetic(_)) => ExceptionKind::Arithmetic,
            DurableError::Storage(_) => ExceptionKind::Storage,
            DurableError::Dangling(_) => ExceptionKind::DanglingReference,
            DurableError::Protocol(_) => ExceptionKind::ProtocolViolation,
            DurableError::Cancelled(_) => ExceptionKind::Cancelled,
            DurableError::UnknownType(_)
            | DurableError::NoSuchSlot { .. }
            | DurableError::TypeMismatch { .. }
            | DurableError::NotPersistable(_)
            | DurableError::Codec(_)
            | DurableError::UnknownRunSpace(_) => ExceptionKind::Type,
        };
        VmException::new(kind, self.to_string())
    }

    pub fn is_dangling(&self) -> bool {
        matches!(self, DurableError::Dangling(_))
    }
}
