use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Document};

use crate::{DurableError, Result};

pub const TYPE_KEY: &str = "@type";
pub const ID_KEY: &str = "@id";

/// Durable identity of a persisted object.
///
/// Valid across process restarts; ids are handed out by the store and never
/// reused. Two references are the same object iff they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "@type")]
    pub type_name: String,
    #[serde(rename = "@id")]
    pub id: i64,
}

impl ObjectRef {
    pub fn new(type_name: impl Into<String>, id: i64) -> Self {
        Self {
            type_name: type_name.into(),
            id,
        }
    }

    /// `{ "@type": <name>, "@id": <id> }`
    pub fn to_document(&self) -> Document {
        let mut map = Map::with_capacity(2);
        map.insert(TYPE_KEY.into(), Document::String(self.type_name.clone()));
        map.insert(ID_KEY.into(), Document::from(self.id));
        Document::Object(map)
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let map = doc
            .as_object()
            .ok_or_else(|| DurableError::Codec(format!("expected reference document, got {doc}")))?;
        let type_name = map
            .get(TYPE_KEY)
            .and_then(Document::as_str)
            .ok_or_else(|| DurableError::Codec(format!("reference document without {TYPE_KEY}: {doc}")))?;
        let id = map
            .get(ID_KEY)
            .and_then(Document::as_i64)
            .ok_or_else(|| DurableError::Codec(format!("reference document without {ID_KEY}: {doc}")))?;
        Ok(Self::new(type_name, id))
    }

    /// True for documents shaped like a reference (an `@id` next to `@type`).
    pub fn is_reference_document(doc: &Document) -> bool {
        doc.as_object()
            .is_some_and(|map| map.contains_key(TYPE_KEY) && map.contains_key(ID_KEY))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_shape_matches_wire_format() {
        let r = ObjectRef::new("Account", 42);
        let doc = r.to_document();
        assert_eq!(doc, serde_json::json!({ "@type": "Account", "@id": 42 }));
        assert_eq!(serde_json::to_value(&r).expect("serialize"), doc);
        assert_eq!(ObjectRef::from_document(&doc).expect("decode"), r);
    }

    #[test]
    fn malformed_documents_are_codec_errors() {
        let missing_id = serde_json::json!({ "@type": "Account" });
        assert!(!ObjectRef::is_reference_document(&missing_id));
        assert!(matches!(
            ObjectRef::from_document(&missing_id),
            Err(DurableError::Codec(_))
        ));
        assert!(ObjectRef::from_document(&serde_json::json!(7)).is_err());
    }

    #[test]
    fn references_compare_by_value() {
        assert_eq!(ObjectRef::new("A", 1), ObjectRef::new("A", 1));
        assert_ne!(ObjectRef::new("A", 1), ObjectRef::new("B", 1));
        assert_eq!(ObjectRef::new("A", 9).to_string(), "A#9");
    }
}
