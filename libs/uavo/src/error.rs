use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::types::ObjectId;

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("xml parse error: {0}")]
    #[diagnostic(code(uavo::xml))]
    Xml(#[from] roxmltree::Error),

    #[error("xml write error: {0}")]
    #[diagnostic(code(uavo::xml_write))]
    XmlWrite(String),

    #[error("io {0}")]
    #[diagnostic(code(uavo::io))]
    Io(#[from] io::Error),

    #[error("missing element <{0}>")]
    #[diagnostic(code(uavo::missing_element))]
    MissingElement(&'static str),

    #[error("missing attribute '{attribute}' on {node}")]
    #[diagnostic(code(uavo::missing_attribute))]
    MissingAttribute {
        attribute: &'static str,
        node: String,
    },

    #[error("invalid value '{value}' for {context}")]
    #[diagnostic(code(uavo::invalid_value))]
    InvalidValue { value: String, context: String },

    #[error("unknown field type '{0}'")]
    #[diagnostic(
        code(uavo::unknown_type),
        help("valid types are int8, int16, int32, uint8, uint16, uint32, float and enum")
    )]
    UnknownType(String),

    #[error("{object}.{field} has no element count")]
    #[diagnostic(
        code(uavo::missing_elements),
        help("declare `elements`, `elementnames` or an <elementnames> list")
    )]
    MissingElementCount { object: String, field: String },

    #[error("{object}.{field} refers to unresolved {reference}")]
    #[diagnostic(
        code(uavo::unresolved_reference),
        help("the referenced definition or field must be registered first")
    )]
    UnresolvedReference {
        object: String,
        field: String,
        reference: String,
    },

    #[error("enum option '{option}' not found in {context}")]
    #[diagnostic(code(uavo::unknown_option))]
    UnknownOption { option: String, context: String },

    #[error("unable to resolve object definitions: {}", .0.join(", "))]
    #[diagnostic(
        code(uavo::unresolved),
        help("check for `parent`/`cloneof` cycles or references to missing definitions")
    )]
    Unresolved(Vec<String>),

    #[error("object not found {0}")]
    #[diagnostic(code(uavo::object_not_found))]
    ObjectNotFound(String),

    #[error("object id mismatch for {name}: document has {declared}, registry has {registered}")]
    #[diagnostic(code(uavo::id_mismatch))]
    IdMismatch {
        name: String,
        declared: ObjectId,
        registered: ObjectId,
    },

    #[error("field {object}.{field} not found")]
    #[diagnostic(code(uavo::field_not_found))]
    FieldNotFound { object: String, field: String },

    #[error("field {object}.{field} expects {expected} values, got {actual}")]
    #[diagnostic(code(uavo::element_count))]
    ElementCount {
        object: String,
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("value type does not match {object}.{field}")]
    #[diagnostic(code(uavo::type_mismatch))]
    TypeMismatch { object: String, field: String },

    #[error("buffer underflow")]
    #[diagnostic(
        code(uavo::buf_underflow),
        help("ran out of room when reading from buffer")
    )]
    BufferUnderflow,

    #[error("settings document contains no objects")]
    #[diagnostic(code(uavo::empty_settings))]
    EmptySettings,

    #[error("no object definitions found for revisions {0:?}")]
    #[diagnostic(
        code(uavo::revision_not_found),
        help("neither `git archive` nor the remote archive service returned definitions")
    )]
    RevisionNotFound(Vec<String>),
}

impl Error {
    pub(crate) fn xml_write(err: impl std::fmt::Display) -> Self {
        Error::XmlWrite(err.to_string())
    }
}
