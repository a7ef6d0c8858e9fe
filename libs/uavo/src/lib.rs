//! UAV object definitions and everything that is derived from them.
//!
//! A [`SchemaRegistry`] compiles XML object definitions into
//! [`ObjectDefinition`]s: a stable [`ObjectId`], a fixed little-endian binary
//! layout and a canonical description. [`ObjectInstance`] is the one value
//! type for every object, interpreted through its definition.

pub mod definition;
pub mod error;
pub mod hash;
pub mod instance;
pub mod logfs;
pub mod registry;
pub mod settings;
pub mod types;
mod xml;

pub use definition::{EnumOptions, Field, Layout, ObjectDefinition};
pub use error::Error;
pub use instance::ObjectInstance;
pub use registry::{RevisionSource, SchemaRegistry};
pub use types::{FieldType, FieldValue, ObjectId, Value};
