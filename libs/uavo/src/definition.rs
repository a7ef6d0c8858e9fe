//! Object definitions and the codec compiled from them.
//!
//! A definition is parsed from its XML description, has its `parent` and
//! `cloneof` references resolved against the registry, and is then frozen:
//! fields are sorted by descending element size (the on-wire order), the
//! object id is hashed from that order and the binary layout is derived from
//! it.

use std::sync::Arc;

use quick_xml::events::BytesStart;
use roxmltree::{Document, Node};
use tracing::warn;

use crate::error::Error;
use crate::hash::UavoHash;
use crate::instance::ObjectInstance;
use crate::registry::SchemaRegistry;
use crate::types::{FieldType, FieldValue, ObjectId, Value};
use crate::xml;

const INSTANCE_ID_SIZE: usize = 2;

/// Children of `<object>` carried verbatim into the canonical description.
const CANONICAL_CHILDREN: [&str; 5] = [
    "description",
    "access",
    "logging",
    "telemetrygcs",
    "telemetryflight",
];

/// Ordered option table of an enum field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnumOptions {
    options: Vec<(String, u8)>,
}

impl EnumOptions {
    pub fn sequential<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        let options = names
            .into_iter()
            .enumerate()
            .map(|(i, n)| (n.into(), i as u8))
            .collect();
        EnumOptions { options }
    }

    pub fn code(&self, name: &str) -> Option<u8> {
        self.options.iter().find(|(n, _)| n == name).map(|(_, c)| *c)
    }

    pub fn name(&self, code: u8) -> Option<&str> {
        self.options
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.options.iter().map(|(n, c)| (n.as_str(), *c))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    fn sorted_by_code(&self) -> Self {
        let mut options = self.options.clone();
        options.sort_by_key(|(_, c)| *c);
        EnumOptions { options }
    }
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    pub elements: usize,
    pub element_names: Vec<String>,
    pub units: Option<String>,
    /// Present for enum fields only.
    pub options: Option<EnumOptions>,
    /// `Object.Field` whose option codes this field inherits.
    pub parent: Option<String>,
    /// Earlier field of the same definition this one was cloned from.
    pub clone_of: Option<String>,
    /// The inherited option set was taken over unchanged.
    pub options_match: bool,
    pub default: FieldValue,
    pub description: Option<String>,
    pub limits: Option<String>,
    pub display: Option<String>,
}

impl Field {
    /// Element rendered the way documents spell it: option names for enums.
    pub fn element_to_string(&self, value: &Value) -> String {
        match (value, &self.options) {
            (Value::Enum(code), Some(options)) => options.name(*code).unwrap_or("Unknown").to_string(),
            (Value::Enum(_), None) => "Unknown".to_string(),
            (value, _) => value.to_string(),
        }
    }

    /// Parses one textual element according to the field type.
    pub fn parse_element(&self, text: &str) -> Result<Value, Error> {
        let text = text.trim();
        let invalid = || Error::InvalidValue {
            value: text.to_string(),
            context: format!("field {} ({})", self.name, self.ty),
        };
        match self.ty {
            FieldType::Enum => self
                .options
                .as_ref()
                .and_then(|o| o.code(text))
                .map(Value::Enum)
                .ok_or_else(|| Error::UnknownOption {
                    option: text.to_string(),
                    context: format!("field {}", self.name),
                }),
            FieldType::Float => text.parse::<f32>().map(Value::F32).map_err(|_| invalid()),
            ty => {
                let v = text
                    .parse::<i64>()
                    .or_else(|_| text.parse::<f64>().map(|f| f.trunc() as i64))
                    .map_err(|_| invalid())?;
                let value = match ty {
                    FieldType::Int8 => i8::try_from(v).map(Value::I8).ok(),
                    FieldType::Int16 => i16::try_from(v).map(Value::I16).ok(),
                    FieldType::Int32 => i32::try_from(v).map(Value::I32).ok(),
                    FieldType::UInt8 => u8::try_from(v).map(Value::U8).ok(),
                    FieldType::UInt16 => u16::try_from(v).map(Value::U16).ok(),
                    FieldType::UInt32 => u32::try_from(v).map(Value::U32).ok(),
                    FieldType::Float | FieldType::Enum => None,
                };
                value.ok_or_else(invalid)
            }
        }
    }

    pub fn size(&self) -> usize {
        self.ty.size() * self.elements
    }
}

/// Byte offsets of every field in an encoded object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub instance_id: bool,
    pub offsets: Vec<usize>,
    pub size: usize,
}

impl Layout {
    fn new(fields: &[Field], single_instance: bool) -> Self {
        let mut offset = if single_instance { 0 } else { INSTANCE_ID_SIZE };
        let mut offsets = Vec::with_capacity(fields.len());
        for field in fields {
            offsets.push(offset);
            offset += field.size();
        }
        Layout {
            instance_id: !single_instance,
            offsets,
            size: offset,
        }
    }

    /// Size of the field data without the instance id slot.
    pub fn data_size(&self) -> usize {
        if self.instance_id {
            self.size - INSTANCE_ID_SIZE
        } else {
            self.size
        }
    }
}

#[derive(Debug)]
pub struct ObjectDefinition {
    name: String,
    id: ObjectId,
    single_instance: bool,
    is_settings: bool,
    description: Option<String>,
    fields: Vec<Field>,
    layout: Layout,
    canonical_xml: String,
}

impl ObjectDefinition {
    /// Compiles one definition. References to other definitions are looked up
    /// in `registry`; a missing one fails with [`Error::UnresolvedReference`].
    pub fn from_xml(src: &str, registry: &SchemaRegistry) -> Result<Self, Error> {
        let doc = Document::parse(src)?;
        let object = doc
            .descendants()
            .find(|n| n.has_tag_name("object"))
            .ok_or(Error::MissingElement("object"))?;

        let name = xml::required_attr(object, "name")?.to_string();
        let single_instance = xml::flag(object, "singleinstance")?;
        let is_settings = xml::flag(object, "settings")?;
        let description = xml::child(object, "description")
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string());

        let mut fields: Vec<Field> = Vec::new();
        for node in object.children().filter(|n| n.has_tag_name("field")) {
            let field = parse_field(&name, node, &fields, registry)?;
            fields.push(field);
        }

        let canonical_xml = canonicalize(object, &fields)?;

        fields.sort_by(|a, b| b.ty.size().cmp(&a.ty.size()));
        let id = hash_definition(&name, is_settings, single_instance, &fields);
        let layout = Layout::new(&fields, single_instance);

        Ok(ObjectDefinition {
            name,
            id,
            single_instance,
            is_settings,
            description,
            fields,
            layout,
            canonical_xml,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn is_single_instance(&self) -> bool {
        self.single_instance
    }

    pub fn is_settings(&self) -> bool {
        self.is_settings
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Fields in layout order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Canonical `<object>` element.
    pub fn canonical_xml(&self) -> &str {
        &self.canonical_xml
    }

    /// Canonical description as a standalone document.
    pub fn to_xml_description(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<xml>\n");
        for line in self.canonical_xml.lines() {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("</xml>\n");
        out
    }

    /// Encodes an instance, including the instance id slot for
    /// multi-instance objects.
    pub fn encode(&self, instance: &ObjectInstance) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout.size);
        if self.layout.instance_id {
            out.extend_from_slice(&instance.instance_id().to_le_bytes());
        }
        self.encode_fields_into(instance, &mut out);
        out
    }

    /// Encodes only the field data, leaving the instance id out.
    pub fn encode_fields(&self, instance: &ObjectInstance) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout.data_size());
        self.encode_fields_into(instance, &mut out);
        out
    }

    fn encode_fields_into(&self, instance: &ObjectInstance, out: &mut Vec<u8>) {
        for value in instance.values() {
            for element in value.elements() {
                element.write(out);
            }
        }
    }

    /// Decodes an instance laid out by [`ObjectDefinition::encode`] starting
    /// at `offset`. Out-of-range numeric values decode as-is.
    pub fn decode(
        self: &Arc<Self>,
        data: &[u8],
        offset: usize,
        timestamp: u64,
    ) -> Result<ObjectInstance, Error> {
        let data = data.get(offset..).ok_or(Error::BufferUnderflow)?;
        if data.len() < self.layout.size {
            return Err(Error::BufferUnderflow);
        }
        if self.layout.instance_id {
            let instance_id = u16::from_le_bytes([data[0], data[1]]);
            self.decode_fields(&data[INSTANCE_ID_SIZE..], Some(instance_id), timestamp)
        } else {
            self.decode_fields(data, None, timestamp)
        }
    }

    /// Decodes field data whose instance id travels out of band (frame
    /// headers, flash slot headers). `instance_id` is ignored for
    /// single-instance objects.
    pub fn decode_fields(
        self: &Arc<Self>,
        data: &[u8],
        instance_id: Option<u16>,
        timestamp: u64,
    ) -> Result<ObjectInstance, Error> {
        if data.len() < self.layout.data_size() {
            return Err(Error::BufferUnderflow);
        }
        let mut pos = 0;
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let mut elements = Vec::with_capacity(field.elements);
            for _ in 0..field.elements {
                elements.push(field.ty.read(&data[pos..])?);
                pos += field.ty.size();
            }
            values.push(FieldValue::from_elements(elements));
        }
        let instance_id = if self.single_instance {
            None
        } else {
            Some(instance_id.unwrap_or(0))
        };
        Ok(ObjectInstance::from_parts(
            self.clone(),
            timestamp,
            instance_id,
            values,
        ))
    }
}

fn parse_field(
    object: &str,
    node: Node<'_, '_>,
    earlier: &[Field],
    registry: &SchemaRegistry,
) -> Result<Field, Error> {
    let name = xml::required_attr(node, "name")?.to_string();

    if let Some(clone_of) = node.attribute("cloneof") {
        let source = earlier
            .iter()
            .find(|f| f.name == clone_of)
            .ok_or_else(|| Error::UnresolvedReference {
                object: object.to_string(),
                field: name.clone(),
                reference: clone_of.to_string(),
            })?;
        let mut field = source.clone();
        field.name = name;
        field.clone_of = Some(clone_of.to_string());
        return Ok(field);
    }

    let ty: FieldType = xml::required_attr(node, "type")?.parse()?;

    let (elements, element_names) = if let Some(list) = xml::child(node, "elementnames") {
        let names: Vec<String> = list
            .children()
            .filter(|n| n.has_tag_name("elementname"))
            .map(|n| n.text().unwrap_or_default().trim().to_string())
            .collect();
        (names.len(), names)
    } else if let Some(inline) = node.attribute("elementnames") {
        let names: Vec<String> = inline.split(',').map(strip_special_chars).collect();
        (names.len(), names)
    } else if let Some(count) = node.attribute("elements") {
        let count = count.trim().parse::<usize>().map_err(|_| Error::InvalidValue {
            value: count.to_string(),
            context: format!("{object}.{name} elements"),
        })?;
        (count, vec![])
    } else {
        return Err(Error::MissingElementCount {
            object: object.to_string(),
            field: name,
        });
    };
    if elements == 0 {
        return Err(Error::InvalidValue {
            value: "0".to_string(),
            context: format!("{object}.{name} elements"),
        });
    }

    let parent = node.attribute("parent").map(str::to_string);
    let mut options_match = false;
    let options = if ty == FieldType::Enum {
        let mut options = match node.attribute("options") {
            Some(inline) => EnumOptions::sequential(inline.split(',').map(str::trim)),
            None => EnumOptions::sequential(
                node.descendants()
                    .filter(|n| n.has_tag_name("option"))
                    .map(|n| n.text().unwrap_or_default().trim()),
            ),
        };
        if let Some(parent) = &parent {
            let inherited = resolve_parent(object, &name, parent, earlier, registry)?;
            if options.is_empty() {
                options_match = true;
                options = inherited.sorted_by_code();
            } else {
                options_match = options.len() == inherited.len();
                let mut remapped = Vec::with_capacity(options.len());
                for (option, _) in options.iter() {
                    let code = inherited.code(option).ok_or_else(|| Error::UnknownOption {
                        option: option.to_string(),
                        context: parent.clone(),
                    })?;
                    remapped.push((option.to_string(), code));
                }
                options = EnumOptions { options: remapped };
            }
        }
        Some(options)
    } else {
        None
    };

    let default = parse_default(
        object,
        &name,
        ty,
        elements,
        options.as_ref(),
        node.attribute("defaultvalue"),
    )?;

    Ok(Field {
        name,
        ty,
        elements,
        element_names,
        units: node.attribute("units").map(str::to_string),
        options,
        parent,
        clone_of: None,
        options_match,
        default,
        description: xml::child(node, "description")
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string()),
        limits: node.attribute("limits").map(str::to_string),
        display: node.attribute("display").map(str::to_string),
    })
}

fn resolve_parent(
    object: &str,
    field: &str,
    parent: &str,
    earlier: &[Field],
    registry: &SchemaRegistry,
) -> Result<EnumOptions, Error> {
    let unresolved = || Error::UnresolvedReference {
        object: object.to_string(),
        field: field.to_string(),
        reference: parent.to_string(),
    };
    let (parent_object, parent_field) = parent.split_once('.').ok_or_else(unresolved)?;
    let options = if parent_object == object {
        earlier
            .iter()
            .find(|f| f.name == parent_field)
            .and_then(|f| f.options.clone())
    } else {
        registry
            .find_by_name(parent_object)
            .and_then(|def| def.field(parent_field).and_then(|f| f.options.clone()))
    };
    options.ok_or_else(unresolved)
}

fn parse_default(
    object: &str,
    field: &str,
    ty: FieldType,
    elements: usize,
    options: Option<&EnumOptions>,
    raw: Option<&str>,
) -> Result<FieldValue, Error> {
    let values: Vec<Value> = match raw {
        None => vec![ty.zero()],
        Some(raw) if ty == FieldType::Enum => {
            let codes: Option<Vec<Value>> = raw
                .split(',')
                .map(|v| options.and_then(|o| o.code(v.trim())).map(Value::Enum))
                .collect();
            codes.unwrap_or_else(|| {
                warn!(object, field, default = raw, "invalid enum default, using first code");
                vec![Value::Enum(0)]
            })
        }
        Some(raw) => raw
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map(|v| ty.from_f64(v))
                    .map_err(|_| Error::InvalidValue {
                        value: v.to_string(),
                        context: format!("{object}.{field} default"),
                    })
            })
            .collect::<Result<_, _>>()?,
    };

    match values.len() {
        1 if elements > 1 => Ok(FieldValue::Array(vec![values[0]; elements])),
        n if n == elements => Ok(FieldValue::from_elements(values)),
        n => Err(Error::ElementCount {
            object: object.to_string(),
            field: field.to_string(),
            expected: elements,
            actual: n,
        }),
    }
}

fn strip_special_chars(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '.' | '-' | '+' | '/' | '(' | ')') && !c.is_whitespace())
        .collect()
}

fn hash_definition(name: &str, is_settings: bool, single_instance: bool, fields: &[Field]) -> ObjectId {
    let mut hash = UavoHash::new();
    hash.update_str(name);
    hash.update(is_settings as u32);
    hash.update(single_instance as u32);
    for field in fields {
        hash.update_str(&field.name);
        hash.update(field.elements as u32);
        hash.update(field.ty.code() as u32);
        if let Some(options) = &field.options {
            let mut next = 0u32;
            for (option, code) in options.iter() {
                if code as u32 != next {
                    hash.update(code as u32);
                }
                hash.update_str(option);
                next = code as u32 + 1;
            }
        }
    }
    ObjectId(hash.finish())
}

fn default_to_text(object: &str, field: &Field) -> Result<String, Error> {
    let elements = field.default.elements();
    let distinct = elements.windows(2).any(|w| w[0] != w[1]);
    let shown = if distinct { elements } else { &elements[..1] };
    let mut parts = Vec::with_capacity(shown.len());
    for value in shown {
        let text = match (value, &field.options) {
            (Value::Enum(code), options) => options
                .as_ref()
                .and_then(|o| o.name(*code))
                .ok_or_else(|| Error::UnknownOption {
                    option: code.to_string(),
                    context: format!("{object}.{} default", field.name),
                })?
                .to_string(),
            (value, _) => value.to_string(),
        };
        parts.push(text);
    }
    Ok(parts.join(","))
}

/// Canonical `<object>` element, fields in declaration order.
fn canonicalize(object: Node<'_, '_>, fields: &[Field]) -> Result<String, Error> {
    let name = xml::required_attr(object, "name")?;
    let mut w = xml::writer();
    let mut elem = BytesStart::new("object");
    elem.push_attribute(("name", name));
    for attr in ["singleinstance", "settings"] {
        if let Some(v) = object.attribute(attr) {
            elem.push_attribute((attr, v));
        }
    }
    xml::start(&mut w, elem)?;

    for child in CANONICAL_CHILDREN {
        if let Some(node) = xml::child(object, child) {
            xml::copy_node(&mut w, node)?;
        }
    }

    for field in fields {
        let mut elem = BytesStart::new("field");
        elem.push_attribute(("name", field.name.as_str()));
        if let Some(clone_of) = &field.clone_of {
            elem.push_attribute(("cloneof", clone_of.as_str()));
            xml::empty(&mut w, elem)?;
            continue;
        }
        elem.push_attribute(("type", field.ty.as_str()));
        for (attr, value) in [
            ("units", &field.units),
            ("parent", &field.parent),
            ("limits", &field.limits),
            ("display", &field.display),
        ] {
            if let Some(value) = value {
                elem.push_attribute((attr, value.as_str()));
            }
        }
        let elements = field.elements.to_string();
        if field.element_names.is_empty() {
            elem.push_attribute(("elements", elements.as_str()));
        }
        let default = default_to_text(name, field)?;
        elem.push_attribute(("defaultvalue", default.as_str()));
        xml::start(&mut w, elem)?;

        xml::text_elem(&mut w, "description", field.description.as_deref())?;
        if !field.element_names.is_empty() {
            xml::start(&mut w, BytesStart::new("elementnames"))?;
            for n in &field.element_names {
                xml::text_elem(&mut w, "elementname", Some(n))?;
            }
            xml::end(&mut w, "elementnames")?;
        }
        if let Some(options) = &field.options {
            if field.parent.is_none() || !field.options_match {
                xml::start(&mut w, BytesStart::new("options"))?;
                for (option, _) in options.iter() {
                    xml::text_elem(&mut w, "option", Some(option))?;
                }
                xml::end(&mut w, "options")?;
            }
        }
        xml::end(&mut w, "field")?;
    }

    xml::end(&mut w, "object")?;
    xml::into_string(w)
}
