use core::fmt::{self, Display};
use core::slice;
use std::str::FromStr;

use crate::error::Error;

/// Identifier of an object definition, derived from its metadata hash.
///
/// The low bit is always clear.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Lowercase 8 hex digit key used by the registry.
    pub fn key(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    /// Accepts `0x` prefixed hex or plain decimal, like the settings documents do.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        parsed.map(ObjectId).map_err(|_| Error::InvalidValue {
            value: s.to_string(),
            context: "object id".to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Int8 = 0,
    Int16 = 1,
    Int32 = 2,
    UInt8 = 3,
    UInt16 = 4,
    UInt32 = 5,
    Float = 6,
    Enum = 7,
}

impl FieldType {
    pub const fn size(&self) -> usize {
        match self {
            FieldType::Int8 | FieldType::UInt8 | FieldType::Enum => 1,
            FieldType::Int16 | FieldType::UInt16 => 2,
            FieldType::Int32 | FieldType::UInt32 | FieldType::Float => 4,
        }
    }

    /// Type code fed into the object id hash.
    pub const fn code(&self) -> u8 {
        *self as u8
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::UInt8 => "uint8",
            FieldType::UInt16 => "uint16",
            FieldType::UInt32 => "uint32",
            FieldType::Float => "float",
            FieldType::Enum => "enum",
        }
    }

    pub const fn is_integer(&self) -> bool {
        !matches!(self, FieldType::Float | FieldType::Enum)
    }

    pub const fn zero(&self) -> Value {
        match self {
            FieldType::Int8 => Value::I8(0),
            FieldType::Int16 => Value::I16(0),
            FieldType::Int32 => Value::I32(0),
            FieldType::UInt8 => Value::U8(0),
            FieldType::UInt16 => Value::U16(0),
            FieldType::UInt32 => Value::U32(0),
            FieldType::Float => Value::F32(0.0),
            FieldType::Enum => Value::Enum(0),
        }
    }

    /// Reads one little-endian element. `buf` must hold at least `self.size()` bytes.
    pub fn read(&self, buf: &[u8]) -> Result<Value, Error> {
        let bytes = buf.get(..self.size()).ok_or(Error::BufferUnderflow)?;
        let value = match self {
            FieldType::Int8 => Value::I8(bytes[0] as i8),
            FieldType::UInt8 => Value::U8(bytes[0]),
            FieldType::Enum => Value::Enum(bytes[0]),
            FieldType::Int16 => Value::I16(i16::from_le_bytes([bytes[0], bytes[1]])),
            FieldType::UInt16 => Value::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
            FieldType::Int32 => Value::I32(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            FieldType::UInt32 => Value::U32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            FieldType::Float => Value::F32(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };
        Ok(value)
    }

    /// Converts a number parsed from a definition or settings document,
    /// truncating toward zero for integer types.
    pub fn from_f64(&self, v: f64) -> Value {
        match self {
            FieldType::Int8 => Value::I8(v as i8),
            FieldType::Int16 => Value::I16(v as i16),
            FieldType::Int32 => Value::I32(v as i32),
            FieldType::UInt8 => Value::U8(v as u8),
            FieldType::UInt16 => Value::U16(v as u16),
            FieldType::UInt32 => Value::U32(v as u32),
            FieldType::Float => Value::F32(v as f32),
            FieldType::Enum => Value::Enum(v as u8),
        }
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "int8" => FieldType::Int8,
            "int16" => FieldType::Int16,
            "int32" => FieldType::Int32,
            "uint8" => FieldType::UInt8,
            "uint16" => FieldType::UInt16,
            "uint32" => FieldType::UInt32,
            "float" => FieldType::Float,
            "enum" => FieldType::Enum,
            other => return Err(Error::UnknownType(other.to_string())),
        })
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single element of a field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    U8(u8),
    U16(u16),
    U32(u32),
    F32(f32),
    Enum(u8),
}

impl Value {
    pub const fn field_type(&self) -> FieldType {
        match self {
            Value::I8(_) => FieldType::Int8,
            Value::I16(_) => FieldType::Int16,
            Value::I32(_) => FieldType::Int32,
            Value::U8(_) => FieldType::UInt8,
            Value::U16(_) => FieldType::UInt16,
            Value::U32(_) => FieldType::UInt32,
            Value::F32(_) => FieldType::Float,
            Value::Enum(_) => FieldType::Enum,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        match *self {
            Value::I8(v) => out.push(v as u8),
            Value::U8(v) | Value::Enum(v) => out.push(v),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::I8(v) => v as f64,
            Value::I16(v) => v as f64,
            Value::I32(v) => v as f64,
            Value::U8(v) | Value::Enum(v) => v as f64,
            Value::U16(v) => v as f64,
            Value::U32(v) => v as f64,
            Value::F32(v) => v as f64,
        }
    }

    pub fn as_enum(&self) -> Option<u8> {
        match *self {
            Value::Enum(v) => Some(v),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I8(v) => Display::fmt(v, f),
            Value::I16(v) => Display::fmt(v, f),
            Value::I32(v) => Display::fmt(v, f),
            Value::U8(v) | Value::Enum(v) => Display::fmt(v, f),
            Value::U16(v) => Display::fmt(v, f),
            Value::U32(v) => Display::fmt(v, f),
            // keeps the trailing ".0" so floats stay recognisable in documents
            Value::F32(v) => fmt::Debug::fmt(v, f),
        }
    }
}

/// The value of one field: a scalar for single-element fields, otherwise a
/// fixed-size sequence matching the element count.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    Array(Vec<Value>),
}

impl FieldValue {
    pub fn from_elements(mut elements: Vec<Value>) -> Self {
        if elements.len() == 1 {
            FieldValue::Scalar(elements.remove(0))
        } else {
            FieldValue::Array(elements)
        }
    }

    pub fn elements(&self) -> &[Value] {
        match self {
            FieldValue::Scalar(v) => slice::from_ref(v),
            FieldValue::Array(v) => v,
        }
    }

    pub fn scalar(&self) -> Option<Value> {
        match self {
            FieldValue::Scalar(v) => Some(*v),
            FieldValue::Array(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.elements().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements().is_empty()
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<Vec<Value>> for FieldValue {
    fn from(values: Vec<Value>) -> Self {
        FieldValue::from_elements(values)
    }
}
