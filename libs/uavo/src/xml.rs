use std::io::Cursor;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use roxmltree::Node;

use crate::error::Error;

pub(crate) type XmlWriter = Writer<Cursor<Vec<u8>>>;

pub(crate) fn writer() -> XmlWriter {
    Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2)
}

pub(crate) fn into_string(writer: XmlWriter) -> Result<String, Error> {
    String::from_utf8(writer.into_inner().into_inner()).map_err(Error::xml_write)
}

pub(crate) fn declaration(writer: &mut XmlWriter) -> Result<(), Error> {
    write(writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
}

pub(crate) fn write(writer: &mut XmlWriter, event: Event<'_>) -> Result<(), Error> {
    writer.write_event(event).map_err(Error::xml_write)
}

pub(crate) fn start(writer: &mut XmlWriter, elem: BytesStart<'_>) -> Result<(), Error> {
    write(writer, Event::Start(elem))
}

pub(crate) fn end(writer: &mut XmlWriter, name: &str) -> Result<(), Error> {
    write(writer, Event::End(BytesEnd::new(name)))
}

pub(crate) fn empty(writer: &mut XmlWriter, elem: BytesStart<'_>) -> Result<(), Error> {
    write(writer, Event::Empty(elem))
}

/// Writes `<name>text</name>`, or `<name/>` when there is no text.
pub(crate) fn text_elem(writer: &mut XmlWriter, name: &str, text: Option<&str>) -> Result<(), Error> {
    match text {
        Some(text) => {
            start(writer, BytesStart::new(name))?;
            write(writer, Event::Text(BytesText::new(text)))?;
            end(writer, name)
        }
        None => empty(writer, BytesStart::new(name)),
    }
}

/// Re-emits a parsed element and its element/text children.
pub(crate) fn copy_node(writer: &mut XmlWriter, node: Node<'_, '_>) -> Result<(), Error> {
    let name = node.tag_name().name();
    let mut elem = BytesStart::new(name);
    for attr in node.attributes() {
        elem.push_attribute((attr.name(), attr.value()));
    }
    let has_content = node
        .children()
        .any(|c| c.is_element() || c.text().is_some_and(|t| !t.trim().is_empty()));
    if !has_content {
        return empty(writer, elem);
    }
    start(writer, elem)?;
    for child in node.children() {
        if child.is_element() {
            copy_node(writer, child)?;
        } else if let Some(text) = child.text() {
            let text = text.trim();
            if !text.is_empty() {
                write(writer, Event::Text(BytesText::new(text)))?;
            }
        }
    }
    end(writer, name)
}

pub(crate) fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| c.has_tag_name(name))
}

pub(crate) fn required_attr<'a>(node: Node<'a, '_>, attribute: &'static str) -> Result<&'a str, Error> {
    node.attribute(attribute).ok_or_else(|| Error::MissingAttribute {
        attribute,
        node: node_label(node),
    })
}

/// `true`/`false` attribute, case-insensitive. Anything but `true` is false.
pub(crate) fn flag(node: Node<'_, '_>, attribute: &'static str) -> Result<bool, Error> {
    Ok(required_attr(node, attribute)?.eq_ignore_ascii_case("true"))
}

fn node_label(node: Node<'_, '_>) -> String {
    match node.attribute("name") {
        Some(name) => format!("<{} name=\"{}\">", node.tag_name().name(), name),
        None => format!("<{}>", node.tag_name().name()),
    }
}
