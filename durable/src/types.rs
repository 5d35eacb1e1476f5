use std::{fmt, sync::Arc};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{DurableError, Instance, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Int,
    Float,
    Str,
    Bool,
    Object,
    /// A reference to a type (class) rather than an instance.
    Type,
}

impl PrimitiveKind {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Int => "int",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Str => "string",
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Object => "object",
            PrimitiveKind::Type => "type",
        }
    }
}

/// How instances of a type are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Persistence {
    /// Plain in-memory slots, never written anywhere.
    Transient,
    /// Cached in memory, flushed explicitly, contracted to a reference when
    /// unreachable.
    Lazy,
    /// Every access is a live storage operation.
    Reactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub index: usize,
    pub name: String,
    pub kind: PrimitiveKind,
    pub declared_type: Option<String>,
}

impl SlotDescriptor {
    /// Column in the one-column-per-slot table layout.
    pub fn column(&self) -> &str {
        &self.name
    }

    /// Key inside the slot document of the schema-on-write layout.
    pub fn document_key(&self) -> String {
        format!("{}_{}", self.name, self.index)
    }
}

/// Called after an instance has been rebuilt from storage.
pub type RestoreHook = Arc<dyn Fn(&Instance) -> Result<()> + Send + Sync>;

/// Slot layout and persistence opt-in of one type, as handed over by the
/// class loader.
pub struct TypeDescriptor {
    pub name: String,
    pub slots: Vec<SlotDescriptor>,
    pub persistence: Persistence,
    pub is_frame: bool,
    restore_hook: Option<RestoreHook>,
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("slots", &self.slots)
            .field("persistence", &self.persistence)
            .field("is_frame", &self.is_frame)
            .field("restore_hook", &self.restore_hook.is_some())
            .finish()
    }
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, persistence: Persistence) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            persistence,
            is_frame: false,
            restore_hook: None,
        }
    }

    pub fn slot(self, name: impl Into<String>, kind: PrimitiveKind) -> Self {
        self.push_slot(name.into(), kind, None)
    }

    pub fn typed_slot(
        self,
        name: impl Into<String>,
        kind: PrimitiveKind,
        declared_type: impl Into<String>,
    ) -> Self {
        self.push_slot(name.into(), kind, Some(declared_type.into()))
    }

    fn push_slot(mut self, name: String, kind: PrimitiveKind, declared_type: Option<String>) -> Self {
        let index = self.slots.len();
        self.slots.push(SlotDescriptor {
            index,
            name,
            kind,
            declared_type,
        });
        self
    }

    /// Instances of this type carry call frame state.
    pub fn frame(mut self) -> Self {
        self.is_frame = true;
        self
    }

    pub fn on_restore(mut self, hook: RestoreHook) -> Self {
        self.restore_hook = Some(hook);
        self
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self.persistence, Persistence::Transient)
    }

    pub fn slot_at(&self, index: usize) -> Result<&SlotDescriptor> {
        self.slots.get(index).ok_or_else(|| DurableError::NoSuchSlot {
            type_name: self.name.clone(),
            index,
        })
    }

    #[cfg(test)]
    pub fn slot_named(&self, name: &str) -> Option<&SlotDescriptor> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub(crate) fn run_restore_hook(&self, instance: &Instance) -> Result<()> {
        match &self.restore_hook {
            Some(hook) => hook(instance),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct TypeRegistryImpl {
    types: AHashMap<String, Arc<TypeDescriptor>>,
}

/// Types known to the running process, keyed by name.
#[derive(Clone, Default)]
pub struct TypeRegistry(Arc<RwLock<TypeRegistryImpl>>);

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a type and returns the shared descriptor.
    pub fn register(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.0
            .write()
            .types
            .insert(descriptor.name.clone(), Arc::clone(&descriptor));
        descriptor
    }

    pub fn get(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        self.0
            .read()
            .types
            .get(name)
            .cloned()
            .ok_or_else(|| DurableError::UnknownType(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.read().types.contains_key(name)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.read();
        let mut names: Vec<_> = inner.types.keys().collect();
        names.sort();
        f.debug_tuple("TypeRegistry").field(&names).finish()
    }
}
