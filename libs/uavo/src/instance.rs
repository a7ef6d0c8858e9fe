use core::fmt::{self, Display};
use std::sync::Arc;

use crate::definition::{Field, ObjectDefinition};
use crate::error::Error;
use crate::types::{FieldValue, ObjectId, Value};

/// One decoded (or locally built) object.
///
/// Values are stored in the definition's layout order and are validated on
/// every write, so an instance always encodes.
#[derive(Clone, Debug)]
pub struct ObjectInstance {
    def: Arc<ObjectDefinition>,
    timestamp: u64,
    instance_id: Option<u16>,
    values: Vec<FieldValue>,
}

impl ObjectInstance {
    /// Instance populated with the schema defaults.
    pub fn new(def: &Arc<ObjectDefinition>) -> Self {
        let values = def.fields().iter().map(|f| f.default.clone()).collect();
        ObjectInstance {
            def: def.clone(),
            timestamp: 0,
            instance_id: (!def.is_single_instance()).then_some(0),
            values,
        }
    }

    pub(crate) fn from_parts(
        def: Arc<ObjectDefinition>,
        timestamp: u64,
        instance_id: Option<u16>,
        values: Vec<FieldValue>,
    ) -> Self {
        ObjectInstance {
            def,
            timestamp,
            instance_id,
            values,
        }
    }

    /// Sets the instance id. Ignored for single-instance objects.
    pub fn with_instance_id(mut self, instance_id: u16) -> Self {
        if !self.def.is_single_instance() {
            self.instance_id = Some(instance_id);
        }
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn definition(&self) -> &Arc<ObjectDefinition> {
        &self.def
    }

    pub fn id(&self) -> ObjectId {
        self.def.id()
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    /// Milliseconds, either from the link or from the local clock.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Instance id, `0` for single-instance objects.
    pub fn instance_id(&self) -> u16 {
        self.instance_id.unwrap_or(0)
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.def.field_index(field).map(|i| &self.values[i])
    }

    /// Option name of a scalar enum field.
    pub fn get_enum(&self, field: &str) -> Option<&str> {
        let i = self.def.field_index(field)?;
        let code = self.values[i].scalar()?.as_enum()?;
        self.def.fields()[i].options.as_ref()?.name(code)
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<(), Error> {
        let (i, f) = self.field(field)?;
        let value = value.into();
        if value.len() != f.elements {
            return Err(Error::ElementCount {
                object: self.def.name().to_string(),
                field: field.to_string(),
                expected: f.elements,
                actual: value.len(),
            });
        }
        if value.elements().iter().any(|v| v.field_type() != f.ty) {
            return Err(self.type_mismatch(field));
        }
        self.values[i] = value;
        Ok(())
    }

    pub fn set_element(&mut self, field: &str, index: usize, value: Value) -> Result<(), Error> {
        let (i, f) = self.field(field)?;
        if value.field_type() != f.ty {
            return Err(self.type_mismatch(field));
        }
        if index >= f.elements {
            return Err(Error::ElementCount {
                object: self.def.name().to_string(),
                field: field.to_string(),
                expected: f.elements,
                actual: index + 1,
            });
        }
        match &mut self.values[i] {
            FieldValue::Scalar(v) => *v = value,
            FieldValue::Array(values) => values[index] = value,
        }
        Ok(())
    }

    /// Sets every element of an enum field to the named option.
    pub fn set_enum(&mut self, field: &str, option: &str) -> Result<(), Error> {
        let (_, f) = self.field(field)?;
        let code = f
            .options
            .as_ref()
            .ok_or_else(|| self.type_mismatch(field))?
            .code(option)
            .ok_or_else(|| Error::UnknownOption {
                option: option.to_string(),
                context: format!("{}.{}", self.def.name(), field),
            })?;
        let elements = f.elements;
        self.set(field, FieldValue::from_elements(vec![Value::Enum(code); elements]))
    }

    /// Text of one element; enum codes render as option names.
    pub fn elem_to_string(&self, field: &str, index: usize) -> Option<String> {
        let i = self.def.field_index(field)?;
        let value = self.values[i].elements().get(index)?;
        Some(self.def.fields()[i].element_to_string(value))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.def.encode(self)
    }

    fn field(&self, name: &str) -> Result<(usize, &Field), Error> {
        self.def
            .field_index(name)
            .map(|i| (i, &self.def.fields()[i]))
            .ok_or_else(|| Error::FieldNotFound {
                object: self.def.name().to_string(),
                field: name.to_string(),
            })
    }

    fn type_mismatch(&self, field: &str) -> Error {
        Error::TypeMismatch {
            object: self.def.name().to_string(),
            field: field.to_string(),
        }
    }
}

impl PartialEq for ObjectInstance {
    fn eq(&self, other: &Self) -> bool {
        self.def.id() == other.def.id()
            && self.instance_id == other.instance_id
            && self.timestamp == other.timestamp
            && self.values == other.values
    }
}

impl Display for ObjectInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.def.name())?;
        if let Some(inst) = self.instance_id {
            write!(f, "[{inst}]")?;
        }
        write!(f, " @{}ms", self.timestamp)?;
        for (field, value) in self.def.fields().iter().zip(&self.values) {
            write!(f, " {}=", field.name)?;
            match value {
                FieldValue::Scalar(v) => f.write_str(&field.element_to_string(v))?,
                FieldValue::Array(values) => {
                    f.write_str("[")?;
                    for (i, v) in values.iter().enumerate() {
                        if i > 0 {
                            f.write_str(",")?;
                        }
                        f.write_str(&field.element_to_string(v))?;
                    }
                    f.write_str("]")?;
                }
            }
        }
        Ok(())
    }
}
