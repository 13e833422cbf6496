//! Format codecs.
//!
//! Both formats parse into and render from a [`Document`]. The codec is
//! stateless; which format a record uses travels with the event.

use cairn_core::{is_empty_document, DecodeError, Document, Format, Identifier};

/// YAML spellings of `null`.
const YAML_NULLS: &[&str] = &["null", "Null", "NULL", "~"];

/// Parse a payload into a document.
///
/// A blank payload parses to an empty object.
pub fn parse(format: Format, identifier: &Identifier, bytes: &[u8]) -> Result<Document, DecodeError> {
    if is_blank(bytes) {
        return Ok(Document::Object(Default::default()));
    }
    let parsed = match format {
        Format::Json => serde_json::from_slice::<Document>(bytes).map_err(|e| e.to_string()),
        Format::Yaml => serde_yaml::from_slice::<Document>(bytes).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| DecodeError::Malformed {
        identifier: identifier.clone(),
        format: format.extension().to_string(),
        reason,
    })
}

/// Render a document in the given format.
///
/// JSON renders compact; YAML renders block style.
pub fn render(format: Format, doc: &Document) -> Result<Vec<u8>, DecodeError> {
    match format {
        Format::Json => serde_json::to_vec(doc).map_err(|e| DecodeError::Serialization {
            reason: e.to_string(),
        }),
        Format::Yaml => serde_yaml::to_string(doc)
            .map(String::into_bytes)
            .map_err(|e| DecodeError::Serialization {
                reason: e.to_string(),
            }),
    }
}

/// Whether the payload is the explicit delete marker of its format.
pub fn is_null(format: Format, bytes: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return false;
    };
    match format {
        Format::Json => text.trim() == "null",
        Format::Yaml => YAML_NULLS.contains(&strip_document_marker(text)),
    }
}

/// Whether the payload carries no information (blank or an empty object).
///
/// `null` is not empty: it is a delete.
pub fn is_empty(format: Format, bytes: &[u8]) -> bool {
    if is_blank(bytes) {
        return true;
    }
    if is_null(format, bytes) {
        return false;
    }
    let anonymous = Identifier::new(Vec::<String>::new(), "");
    parse(format, &anonymous, bytes)
        .map(|doc| doc.is_object() && is_empty_document(&doc))
        .unwrap_or(false)
}

fn is_blank(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => strip_document_marker(text).is_empty(),
        Err(_) => false,
    }
}

fn strip_document_marker(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed.strip_prefix("---").map(str::trim).unwrap_or(trimmed)
}
