use serde_json::{Map, Value};
use uuid::Uuid;

/// Structured wire form of a stored record.
pub type Document = Map<String, Value>;

/// Store-level identity field, distinct from any application id field.
pub const ID_FIELD: &str = "_id";

/// Canonical string form of a record id inside the identity field.
pub fn id_string(id: Uuid) -> String {
    id.hyphenated().to_string()
}

/// Returns the identity field of a document, if present and a string.
pub fn document_id(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}

/// Parses the identity field.
///
/// Any textual UUID form is accepted, so ids written in upper case by other
/// clients resolve to the same record.
pub fn document_uuid(document: &Document) -> Option<Uuid> {
    document_id(document).and_then(|id| Uuid::parse_str(id).ok())
}

/// Identity-match selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector {
    id: Uuid,
}

impl Selector {
    pub fn by_id(id: Uuid) -> Self {
        Self { id }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn matches(&self, document: &Document) -> bool {
        document_uuid(document) == Some(self.id)
    }
}
