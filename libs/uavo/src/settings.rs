//! Human-editable settings documents.
//!
//! ```xml
//! <uavobjects>
//!   <settings>
//!     <object name="AttitudeSettings" id="0x1A2B3C4E">
//!       <field name="BoardRotation" values="0,0,90"/>
//!     </object>
//!   </settings>
//! </uavobjects>
//! ```

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, BytesText, Event};
use roxmltree::{Document, Node};
use tracing::warn;

use crate::definition::Field;
use crate::error::Error;
use crate::instance::ObjectInstance;
use crate::registry::SchemaRegistry;
use crate::types::{FieldValue, ObjectId, Value};
use crate::xml;

#[derive(Clone, Copy, Debug, Default)]
pub struct ImportOptions {
    /// Unknown objects, id mismatches, missing fields and unparseable values
    /// are errors instead of warnings.
    pub strict: bool,
}

impl ImportOptions {
    pub fn strict() -> Self {
        ImportOptions { strict: true }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExportOptions {
    /// Leave out fields that still hold the schema default.
    pub only_nondefault: bool,
    /// Revision the instances were interpreted with, noted in the output.
    pub githash: Option<String>,
}

impl ExportOptions {
    pub fn with_only_nondefault(mut self, only_nondefault: bool) -> Self {
        self.only_nondefault = only_nondefault;
        self
    }

    pub fn with_githash(mut self, githash: impl Into<String>) -> Self {
        self.githash = Some(githash.into());
        self
    }
}

/// Builds instances from a settings document, keyed by object name in
/// document order.
///
/// Fields are taken from the schema, not the document: fields the document
/// lacks keep their defaults and fields the schema lacks are ignored. When
/// the document id disagrees with the registry the document was written for
/// another revision, so values that no longer convert fall back to defaults.
pub fn import_settings(
    src: &str,
    registry: &SchemaRegistry,
    opts: &ImportOptions,
) -> Result<IndexMap<String, ObjectInstance>, Error> {
    let doc = Document::parse(src)?;
    let objects: Vec<Node<'_, '_>> = doc
        .descendants()
        .filter(|n| n.has_tag_name("settings"))
        .flat_map(|s| s.children().filter(|n| n.has_tag_name("object")))
        .collect();
    if objects.is_empty() {
        return Err(Error::EmptySettings);
    }

    let mut out = IndexMap::new();
    for node in objects {
        let name = xml::required_attr(node, "name")?;
        let Some(def) = registry.find_by_name(name) else {
            if opts.strict {
                return Err(Error::ObjectNotFound(name.to_string()));
            }
            warn!(object = name, "settings object missing from registry, skipping");
            continue;
        };

        let declared: ObjectId = xml::required_attr(node, "id")?.parse()?;
        let best_effort = declared != def.id();
        if best_effort {
            if opts.strict {
                return Err(Error::IdMismatch {
                    name: name.to_string(),
                    declared,
                    registered: def.id(),
                });
            }
            warn!(object = name, %declared, registered = %def.id(), "object id mismatch");
        }

        let mut instance = ObjectInstance::new(def);
        for field in def.fields() {
            let found = node
                .children()
                .find(|n| n.has_tag_name("field") && n.attribute("name") == Some(field.name.as_str()));
            let Some(found) = found else {
                if opts.strict {
                    return Err(Error::FieldNotFound {
                        object: name.to_string(),
                        field: field.name.clone(),
                    });
                }
                warn!(object = name, field = %field.name, "field missing, keeping default");
                continue;
            };

            let parsed = xml::required_attr(found, "values").and_then(|raw| parse_values(name, field, raw));
            match parsed {
                Ok(value) => instance.set(&field.name, value)?,
                Err(err) if best_effort && !opts.strict => {
                    warn!(object = name, field = %field.name, %err, "unable to convert field, keeping default");
                }
                Err(err) => return Err(err),
            }
        }
        out.insert(name.to_string(), instance);
    }
    Ok(out)
}

fn parse_values(object: &str, field: &Field, raw: &str) -> Result<FieldValue, Error> {
    let values = raw
        .split(',')
        .map(|v| field.parse_element(v))
        .collect::<Result<Vec<Value>, _>>()?;
    if values.len() != field.elements {
        return Err(Error::ElementCount {
            object: object.to_string(),
            field: field.name.clone(),
            expected: field.elements,
            actual: values.len(),
        });
    }
    Ok(FieldValue::from_elements(values))
}

/// Serializes instances into a settings document, objects and fields sorted
/// by name.
pub fn export_settings<'a>(
    instances: impl IntoIterator<Item = &'a ObjectInstance>,
    opts: &ExportOptions,
) -> Result<String, Error> {
    let mut instances: Vec<&ObjectInstance> = instances.into_iter().collect();
    instances.sort_by(|a, b| {
        a.name()
            .cmp(b.name())
            .then(a.instance_id().cmp(&b.instance_id()))
    });

    let mut w = xml::writer();
    xml::declaration(&mut w)?;
    xml::start(&mut w, BytesStart::new("uavobjects"))?;
    xml::write(
        &mut w,
        Event::Comment(BytesText::new(" Automatically generated settings export ")),
    )?;
    if let Some(githash) = &opts.githash {
        let note = format!(" Interpreted using githash {githash} ");
        xml::write(&mut w, Event::Comment(BytesText::new(&note)))?;
    }
    xml::start(&mut w, BytesStart::new("settings"))?;

    for instance in instances {
        let def = instance.definition();
        let mut fields: Vec<(&Field, &FieldValue)> = def.fields().iter().zip(instance.values()).collect();
        if opts.only_nondefault {
            fields.retain(|(f, v)| f.default != **v);
            if fields.is_empty() {
                continue;
            }
        }
        fields.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));

        let mut elem = BytesStart::new("object");
        elem.push_attribute(("name", def.name()));
        elem.push_attribute(("id", def.id().to_string().as_str()));
        xml::start(&mut w, elem)?;
        for (field, value) in fields {
            let text = value
                .elements()
                .iter()
                .map(|v| field.element_to_string(v))
                .collect::<Vec<_>>()
                .join(",");
            let mut elem = BytesStart::new("field");
            elem.push_attribute(("name", field.name.as_str()));
            elem.push_attribute(("values", text.as_str()));
            xml::empty(&mut w, elem)?;
        }
        xml::end(&mut w, "object")?;
    }

    xml::end(&mut w, "settings")?;
    xml::end(&mut w, "uavobjects")?;
    let mut out = xml::into_string(w)?;
    out.push('\n');
    Ok(out)
}
