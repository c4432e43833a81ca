pub mod document;
pub mod error;

pub use document::{Document, ID_FIELD, Selector, document_id, document_uuid, id_string};
pub use error::{AccessorError, Result, Severity};
