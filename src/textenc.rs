//! Textual (XML) alternate encoding of the message field model
//!
//! Secondary, diagnostics-oriented representation: numbers as decimal text,
//! strings escaped, binary as base64. Round-trips the same field set as the
//! binary codec. The parser accepts the fixed document shape the emitter
//! produces; it is not a general XML implementation.

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::message::{FieldValue, Message};
use crate::protocol::VERSION;

const TYPE_NAMES: [&str; 6] = ["int32", "string", "int64", "int16", "binary", "float"];

fn type_name(v: &FieldValue) -> &'static str {
    match v {
        FieldValue::Int32(_) => "int32",
        FieldValue::Str(_) => "string",
        FieldValue::Int64(_) => "int64",
        FieldValue::Int16(_) => "int16",
        FieldValue::Binary(_) => "binary",
        FieldValue::Float(_) => "float",
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Render a message as an XML document
pub fn to_xml(msg: &Message) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!("<gridmon version=\"{}\">\n", VERSION));
    xml.push_str(&format!(
        "  <message code=\"{}\" id=\"{}\">\n",
        msg.code, msg.id
    ));
    for f in msg.fields() {
        xml.push_str(&format!(
            "    <field id=\"{}\" type=\"{}\"><value>",
            f.id,
            type_name(&f.value)
        ));
        match &f.value {
            FieldValue::Int16(v) => xml.push_str(&v.to_string()),
            FieldValue::Int32(v) => xml.push_str(&v.to_string()),
            FieldValue::Int64(v) => xml.push_str(&v.to_string()),
            FieldValue::Float(v) => xml.push_str(&v.to_string()),
            FieldValue::Str(s) => xml.push_str(&escape(s)),
            FieldValue::Binary(b) => xml.push_str(&BASE64.encode(b)),
        }
        xml.push_str("</value></field>\n");
    }
    xml.push_str("  </message>\n</gridmon>\n");
    xml
}

// Parser states; the document grammar is a fixed nesting of
// gridmon > message > field > value
#[derive(Clone, Copy, PartialEq)]
enum State {
    Init,
    Doc,
    Message,
    Field,
    Value,
    End,
}

fn attr(attrs: &str, name: &str) -> Option<String> {
    // name="value" pairs, attribute values never contain a raw quote
    let mut rest = attrs;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        let Some(q1) = after.find('"') else { return None };
        let Some(q2) = after[q1 + 1..].find('"') else {
            return None;
        };
        let value = &after[q1 + 1..q1 + 1 + q2];
        if key == name {
            return Some(unescape(value));
        }
        rest = &after[q1 + 2 + q2..];
    }
    None
}

/// Parse a message from the XML document form
pub fn from_xml(xml: &str) -> Result<Message> {
    let mut msg = Message::new(0, 0);
    let mut state = State::Init;
    let mut field_id: u32 = 0;
    let mut field_type: usize = 0;
    let mut pos = 0usize;

    while let Some(open) = xml[pos..].find('<') {
        let tag_start = pos + open;
        let text = &xml[pos..tag_start];
        if state == State::Value && !text.is_empty() {
            set_field(&mut msg, field_id, field_type, &unescape(text))?;
            state = State::Field;
        }
        let Some(close) = xml[tag_start..].find('>') else {
            bail!("unterminated tag at offset {}", tag_start);
        };
        let tag = &xml[tag_start + 1..tag_start + close];
        pos = tag_start + close + 1;

        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        if let Some(name_attrs) = tag.strip_prefix('/') {
            let name = name_attrs.trim();
            state = match (state, name) {
                (State::Value, "value") => {
                    // empty <value></value>: store the field's zero value
                    set_field(&mut msg, field_id, field_type, "")?;
                    State::Field
                }
                (State::Field, "value") => State::Field,
                (State::Field, "field") => State::Message,
                (State::Message, "message") => State::Doc,
                (State::Doc, "gridmon") => State::End,
                _ => bail!("unexpected closing tag </{}>", name),
            };
            continue;
        }

        let (name, attrs) = match tag.find(char::is_whitespace) {
            Some(i) => (&tag[..i], &tag[i..]),
            None => (tag, ""),
        };
        state = match (state, name) {
            (State::Init, "gridmon") => State::Doc,
            (State::Doc, "message") => {
                if let Some(v) = attr(attrs, "code") {
                    msg.code = v.parse().unwrap_or(0);
                }
                if let Some(v) = attr(attrs, "id") {
                    msg.id = v.parse().unwrap_or(0);
                }
                State::Message
            }
            (State::Message, "field") => {
                field_id = attr(attrs, "id").and_then(|v| v.parse().ok()).unwrap_or(0);
                let ty = attr(attrs, "type").unwrap_or_default();
                field_type = match TYPE_NAMES.iter().position(|t| *t == ty) {
                    Some(i) => i,
                    None => bail!("unknown field type {:?}", ty),
                };
                State::Field
            }
            (State::Field, "value") => State::Value,
            _ => bail!("unexpected tag <{}>", name),
        };
    }
    if state != State::End {
        bail!("truncated document");
    }
    Ok(msg)
}

fn set_field(msg: &mut Message, id: u32, type_index: usize, text: &str) -> Result<()> {
    match type_index {
        0 => msg.set_u32(id, text.parse().unwrap_or(0)),
        1 => msg.set_str(id, text),
        2 => msg.set_u64(id, text.parse().unwrap_or(0)),
        3 => msg.set_u16(id, text.parse().unwrap_or(0)),
        4 => {
            let data = BASE64.decode(text.trim())?;
            msg.set_binary(id, &data);
        }
        5 => msg.set_f64(id, text.parse().unwrap_or(0.0)),
        _ => bail!("field type index {} out of range", type_index),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command;

    #[test]
    fn test_xml_round_trip_all_types() {
        let mut msg = Message::new(command::OBJECT_UPDATE, 17);
        msg.set_u16(1, 42);
        msg.set_u32(2, 4_000_000_000);
        msg.set_u64(3, u64::MAX);
        msg.set_f64(4, 3.5);
        msg.set_str(5, "node <primary> & \"backup\"");
        msg.set_binary(6, &[0, 1, 2, 255, 254]);

        let xml = to_xml(&msg);
        let parsed = from_xml(&xml).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_xml_empty_string_field() {
        let mut msg = Message::new(1, 1);
        msg.set_str(9, "");
        let parsed = from_xml(&to_xml(&msg)).unwrap();
        assert_eq!(parsed.get_str(9), Some(""));
    }

    #[test]
    fn test_xml_float_precision() {
        let mut msg = Message::new(1, 1);
        msg.set_f64(1, -0.000123456789);
        let parsed = from_xml(&to_xml(&msg)).unwrap();
        assert_eq!(parsed.get_f64(1), Some(-0.000123456789));
    }

    #[test]
    fn test_xml_rejects_garbage() {
        assert!(from_xml("not xml at all").is_err());
        assert!(from_xml("<gridmon version=\"2\"><message code=\"1\" id=\"1\">").is_err());
    }

    #[test]
    fn test_xml_matches_binary_codec_fields() {
        let mut msg = Message::new(command::ALARM_UPDATE, 3);
        msg.set_u32(1, 12);
        msg.set_str(2, "threshold exceeded");
        let via_xml = from_xml(&to_xml(&msg)).unwrap();
        let via_wire = Message::decode(&msg.encode(), crate::protocol::VERSION).unwrap();
        assert_eq!(via_xml, via_wire);
    }
}
