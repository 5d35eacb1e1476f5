use std::{fmt, sync::Arc};

use ahash::AHashSet;
use serde_json::{Map, Number};

use crate::{
    DeferenceObject, DurableError, Instance, InstanceId, ObjectRef, PrimitiveKind, Result,
    SlotDescriptor, object_ref::TYPE_KEY, storage::Datum,
};

pub const INLINE_KEY: &str = "@inline";
pub const CLASS_KEY: &str = "@class";

/// A handle to an object as seen from a slot or a register.
///
/// `Local` instances live in this process only (transient) or are reactive
/// rows that never materialize. `Deferred` handles point at the shared
/// materialized-or-reference cell of a lazily persisted object.
#[derive(Clone)]
pub enum ObjectHandle {
    Local(Arc<Instance>),
    Deferred(Arc<DeferenceObject>),
}

#[derive(Clone)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    /// Reference to a type, by name.
    Type(Arc<str>),
    Object(ObjectHandle),
}

/// Turns stored identities back into handles.
pub trait HandleResolver {
    fn handle_for(&self, object_ref: &ObjectRef) -> Result<ObjectHandle>;

    /// Rebuilds a transient instance that was stored inline.
    fn inline(&self, type_name: &str, slots: &[Datum]) -> Result<ObjectHandle>;
}

impl ObjectHandle {
    pub fn object_ref(&self) -> Option<&ObjectRef> {
        match self {
            ObjectHandle::Local(instance) => instance.object_ref(),
            ObjectHandle::Deferred(cell) => Some(cell.object_ref()),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            ObjectHandle::Local(instance) => instance.type_name(),
            ObjectHandle::Deferred(cell) => cell.type_name(),
        }
    }

    pub fn as_deferred(&self) -> Option<&Arc<DeferenceObject>> {
        match self {
            ObjectHandle::Deferred(cell) => Some(cell),
            ObjectHandle::Local(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&Arc<Instance>> {
        match self {
            ObjectHandle::Local(instance) => Some(instance),
            ObjectHandle::Deferred(_) => None,
        }
    }

    /// Reference equality. Reactive rows are the same object when their
    /// references match, even through different local instances.
    pub fn same(&self, other: &ObjectHandle) -> bool {
        match (self, other) {
            (ObjectHandle::Deferred(a), ObjectHandle::Deferred(b)) => Arc::ptr_eq(a, b),
            (ObjectHandle::Local(a), ObjectHandle::Local(b)) => {
                Arc::ptr_eq(a, b)
                    || matches!((a.object_ref(), b.object_ref()), (Some(x), Some(y)) if x == y)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectHandle::Local(instance) => match instance.object_ref() {
                Some(r) => write!(f, "Local({r})"),
                None => write!(f, "Local({}@{:?})", instance.type_name(), instance.id()),
            },
            ObjectHandle::Deferred(cell) => write!(f, "Deferred({})", cell.object_ref()),
        }
    }
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => PrimitiveKind::Int.name(),
            Value::Float(_) => PrimitiveKind::Float.name(),
            Value::Bool(_) => PrimitiveKind::Bool.name(),
            Value::Str(_) => PrimitiveKind::Str.name(),
            Value::Type(_) => PrimitiveKind::Type.name(),
            Value::Object(_) => PrimitiveKind::Object.name(),
        }
    }

    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Value::Object(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_deferred(&self) -> Option<&Arc<DeferenceObject>> {
        self.as_object().and_then(ObjectHandle::as_deferred)
    }

    /// Whether `self` fits a slot of `kind`. Null fits every slot.
    pub fn fits(&self, kind: PrimitiveKind) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Int(_), PrimitiveKind::Int)
                | (Value::Int(_) | Value::Float(_), PrimitiveKind::Float)
                | (Value::Bool(_), PrimitiveKind::Bool)
                | (Value::Str(_), PrimitiveKind::Str)
                | (Value::Type(_), PrimitiveKind::Type)
                | (Value::Object(_), PrimitiveKind::Object)
        )
    }

    pub(crate) fn check_slot(&self, slot: &SlotDescriptor) -> Result<()> {
        if self.fits(slot.kind) {
            Ok(())
        } else {
            Err(DurableError::TypeMismatch {
                slot: slot.name.clone(),
                expected: slot.kind.name(),
                found: self.kind_name(),
            })
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) | (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.same(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Type(t) => write!(f, "<type {t}>"),
            Value::Object(handle) => handle.fmt(f),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl From<ObjectHandle> for Value {
    fn from(value: ObjectHandle) -> Self {
        Value::Object(value)
    }
}

// ── Document codec ──────────────────────────────────────────────────

/// Encodes a value for a storage column.
///
/// Persisted objects become reference documents. Transient objects are
/// inlined, since the holder decides nothing about the target's persistence.
pub fn encode(value: &Value) -> Result<Datum> {
    let mut visiting = AHashSet::new();
    encode_inner(value, &mut visiting)
}

fn encode_inner(value: &Value, visiting: &mut AHashSet<InstanceId>) -> Result<Datum> {
    Ok(match value {
        Value::Null => Datum::Null,
        Value::Int(i) => Datum::from(*i),
        Value::Float(x) => Number::from_f64(*x)
            .map(Datum::Number)
            .ok_or_else(|| DurableError::Codec(format!("{x} has no document representation")))?,
        Value::Bool(b) => Datum::Bool(*b),
        Value::Str(s) => Datum::String(s.to_string()),
        Value::Type(t) => {
            let mut map = Map::with_capacity(1);
            map.insert(CLASS_KEY.into(), Datum::String(t.to_string()));
            Datum::Object(map)
        }
        Value::Object(ObjectHandle::Deferred(cell)) => cell.object_ref().to_document(),
        Value::Object(ObjectHandle::Local(instance)) => match instance.object_ref() {
            Some(r) => r.to_document(),
            None => {
                if !visiting.insert(instance.id()) {
                    return Err(DurableError::Codec(format!(
                        "cycle through transient `{}` cannot be inlined",
                        instance.type_name()
                    )));
                }
                let values = instance.transient_values().unwrap_or_default();
                let slots = values
                    .iter()
                    .map(|v| encode_inner(v, visiting))
                    .collect::<Result<Vec<_>>>()?;
                visiting.remove(&instance.id());
                let mut map = Map::with_capacity(2);
                map.insert(TYPE_KEY.into(), Datum::String(instance.type_name().to_owned()));
                map.insert(INLINE_KEY.into(), Datum::Array(slots));
                Datum::Object(map)
            }
        },
    })
}

/// Decodes a stored column for a slot of the given kind.
pub fn decode(datum: &Datum, slot: &SlotDescriptor, resolver: &dyn HandleResolver) -> Result<Value> {
    let mismatch = |found: &'static str| DurableError::TypeMismatch {
        slot: slot.name.clone(),
        expected: slot.kind.name(),
        found,
    };
    if datum.is_null() {
        return Ok(Value::Null);
    }
    Ok(match slot.kind {
        PrimitiveKind::Int => Value::Int(datum.as_i64().ok_or_else(|| mismatch(datum_kind(datum)))?),
        PrimitiveKind::Float => Value::Float(datum.as_f64().ok_or_else(|| mismatch(datum_kind(datum)))?),
        PrimitiveKind::Bool => Value::Bool(datum.as_bool().ok_or_else(|| mismatch(datum_kind(datum)))?),
        PrimitiveKind::Str => Value::str(datum.as_str().ok_or_else(|| mismatch(datum_kind(datum)))?),
        PrimitiveKind::Type => {
            let name = datum
                .get(CLASS_KEY)
                .and_then(Datum::as_str)
                .ok_or_else(|| mismatch(datum_kind(datum)))?;
            Value::Type(Arc::from(name))
        }
        PrimitiveKind::Object => Value::Object(decode_object(datum, resolver)?),
    })
}

pub fn decode_object(datum: &Datum, resolver: &dyn HandleResolver) -> Result<ObjectHandle> {
    if ObjectRef::is_reference_document(datum) {
        return resolver.handle_for(&ObjectRef::from_document(datum)?);
    }
    let type_name = datum.get(TYPE_KEY).and_then(Datum::as_str);
    let slots = datum.get(INLINE_KEY).and_then(Datum::as_array);
    match (type_name, slots) {
        (Some(type_name), Some(slots)) => resolver.inline(type_name, slots),
        _ => Err(DurableError::Codec(format!("not an object document: {datum}"))),
    }
}

/// Decodes a column that is not typed by a slot, such as a frame result.
pub fn decode_any(datum: &Datum, resolver: &dyn HandleResolver) -> Result<Value> {
    Ok(match datum {
        Datum::Null => Value::Null,
        Datum::Bool(b) => Value::Bool(*b),
        Datum::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Value::Int(i),
            (None, Some(x)) => Value::Float(x),
            (None, None) => return Err(DurableError::Codec(format!("unrepresentable number {n}"))),
        },
        Datum::String(s) => Value::str(s),
        Datum::Object(map) => match map.get(CLASS_KEY).and_then(Datum::as_str) {
            Some(name) => Value::Type(Arc::from(name)),
            None => Value::Object(decode_object(datum, resolver)?),
        },
        Datum::Array(_) => return Err(DurableError::Codec(format!("arrays are not values: {datum}"))),
    })
}

fn datum_kind(datum: &Datum) -> &'static str {
    match datum {
        Datum::Null => "null",
        Datum::Bool(_) => "bool",
        Datum::Number(n) if n.is_f64() => "float",
        Datum::Number(_) => "int",
        Datum::String(_) => "string",
        Datum::Array(_) => "array",
        Datum::Object(_) => "document",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Persistence, TypeDescriptor};

    struct NoObjects;

    impl HandleResolver for NoObjects {
        fn handle_for(&self, object_ref: &ObjectRef) -> Result<ObjectHandle> {
            Err(DurableError::Dangling(object_ref.clone()))
        }

        fn inline(&self, type_name: &str, _slots: &[Datum]) -> Result<ObjectHandle> {
            Err(DurableError::UnknownType(type_name.to_owned()))
        }
    }

    fn slot(kind: PrimitiveKind) -> SlotDescriptor {
        SlotDescriptor {
            index: 0,
            name: "s".into(),
            kind,
            declared_type: None,
        }
    }

    #[test]
    fn primitives_survive_the_codec() {
        let cases = [
            (Value::Int(-3), PrimitiveKind::Int),
            (Value::Float(2.5), PrimitiveKind::Float),
            (Value::Bool(true), PrimitiveKind::Bool),
            (Value::str("hi"), PrimitiveKind::Str),
            (Value::Type(Arc::from("Point")), PrimitiveKind::Type),
            (Value::Null, PrimitiveKind::Object),
        ];
        for (value, kind) in cases {
            let datum = encode(&value).expect("encode");
            let back = decode(&datum, &slot(kind), &NoObjects).expect("decode");
            assert_eq!(back, value, "{kind:?}");
        }
    }

    #[test]
    fn float_slot_accepts_stored_integers() {
        let value = decode(&Datum::from(4), &slot(PrimitiveKind::Float), &NoObjects).expect("decode");
        assert_eq!(value, Value::Float(4.0));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let err = decode(&Datum::from("x"), &slot(PrimitiveKind::Int), &NoObjects).unwrap_err();
        assert!(matches!(
            err,
            DurableError::TypeMismatch { expected: "int", found: "string", .. }
        ));
        assert!(!Value::str("x").fits(PrimitiveKind::Int));
        assert!(Value::Int(1).fits(PrimitiveKind::Float));
        assert!(Value::Null.fits(PrimitiveKind::Bool));
    }

    #[test]
    fn non_finite_floats_cannot_be_stored() {
        assert!(matches!(encode(&Value::Float(f64::NAN)), Err(DurableError::Codec(_))));
    }

    #[test]
    fn transient_objects_are_inlined() {
        let ty = Arc::new(
            TypeDescriptor::new("Pair", Persistence::Transient)
                .slot("a", PrimitiveKind::Int)
                .slot("b", PrimitiveKind::Str),
        );
        let pair = Instance::transient(ty);
        pair.store().set(&pair.type_descriptor().slots[0], Value::Int(1)).expect("set a");
        let datum = encode(&Value::Object(ObjectHandle::Local(pair))).expect("encode");
        assert_eq!(
            datum,
            serde_json::json!({ "@type": "Pair", "@inline": [1, null] })
        );
    }

    #[test]
    fn untyped_columns_decode_by_shape() {
        assert_eq!(decode_any(&serde_json::json!(3), &NoObjects).expect("int"), Value::Int(3));
        assert_eq!(decode_any(&serde_json::json!(0.5), &NoObjects).expect("float"), Value::Float(0.5));
        assert_eq!(
            decode_any(&serde_json::json!({ "@class": "Point" }), &NoObjects).expect("type"),
            Value::Type(Arc::from("Point"))
        );
        assert!(decode_any(&serde_json::json!([1]), &NoObjects).is_err());
    }

    #[test]
    fn dangling_references_surface_from_the_resolver() {
        let doc = ObjectRef::new("Gone", 1).to_document();
        let err = decode(&doc, &slot(PrimitiveKind::Object), &NoObjects).unwrap_err();
        assert!(err.is_dangling());
    }
}
