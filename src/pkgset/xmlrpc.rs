// src/pkgset/xmlrpc.rs

//! Minimal XML-RPC codec for the Koji hub
//!
//! Requests are rendered as `<methodCall>` documents; responses are parsed
//! with quick-xml into `serde_json::Value` so callers can deserialize hub
//! replies straight into typed structs.

use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Map, Number, Value};

/// Escape text for use inside an XML element
fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render one value as an XML-RPC `<value>`
pub fn encode_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Null => out.push_str("<nil/>"),
        Value::Bool(b) => {
            out.push_str(&format!("<boolean>{}</boolean>", if *b { 1 } else { 0 }));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&format!("<int>{}</int>", i));
            } else {
                out.push_str(&format!("<double>{}</double>", n));
            }
        }
        Value::String(s) => out.push_str(&format!("<string>{}</string>", escape(s))),
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Object(map) => {
            out.push_str("<struct>");
            for (key, item) in map {
                out.push_str(&format!("<member><name>{}</name>", escape(key)));
                encode_value(item, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// Render a `<methodCall>`; keyword arguments use Koji's `__starstar` struct
pub fn encode_call(method: &str, params: &[Value], kwargs: Option<&Map<String, Value>>) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodCall>");
    out.push_str(&format!("<methodName>{}</methodName><params>", escape(method)));
    for param in params {
        out.push_str("<param>");
        encode_value(param, &mut out);
        out.push_str("</param>");
    }
    if let Some(kwargs) = kwargs {
        let mut map = kwargs.clone();
        map.insert("__starstar".to_string(), Value::Bool(true));
        out.push_str("<param>");
        encode_value(&Value::Object(map), &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Containers being assembled while walking the response
enum Frame {
    Array(Vec<Value>),
    Struct(Map<String, Value>, Option<String>),
}

/// Parse a `<methodResponse>`; a `<fault>` becomes `Error::ExternalTool`
pub fn decode_response(xml: &str) -> Result<Value> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut scalar_tag: Option<String> = None;
    let mut text = String::new();
    let mut in_name = false;
    let mut in_fault = false;
    let mut result: Option<Value> = None;

    // Attach a finished value to the enclosing container, or make it the result
    fn attach(stack: &mut [Frame], result: &mut Option<Value>, value: Value) {
        match stack.last_mut() {
            Some(Frame::Array(items)) => items.push(value),
            Some(Frame::Struct(map, name)) => {
                if let Some(key) = name.take() {
                    map.insert(key, value);
                }
            }
            None => *result = Some(value),
        }
    }

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "fault" => in_fault = true,
                    "array" => stack.push(Frame::Array(Vec::new())),
                    "struct" => stack.push(Frame::Struct(Map::new(), None)),
                    "name" => {
                        in_name = true;
                        text.clear();
                    }
                    "value" => {
                        scalar_tag = None;
                        text.clear();
                    }
                    "int" | "i4" | "i8" | "boolean" | "string" | "double" | "dateTime.iso8601"
                    | "base64" => {
                        scalar_tag = Some(tag);
                        text.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"nil" => attach(&mut stack, &mut result, Value::Null),
                b"string" => attach(&mut stack, &mut result, Value::String(String::new())),
                b"value" => attach(&mut stack, &mut result, Value::String(String::new())),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let t = e
                    .unescape()
                    .map_err(|err| Error::ParseError(format!("Bad XML-RPC text: {}", err)))?;
                text.push_str(&t);
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "name" => {
                        in_name = false;
                        if let Some(Frame::Struct(_, name)) = stack.last_mut() {
                            *name = Some(std::mem::take(&mut text));
                        }
                    }
                    "int" | "i4" | "i8" => {
                        let n: i64 = text.trim().parse().map_err(|err| {
                            Error::ParseError(format!("Bad XML-RPC integer '{}': {}", text, err))
                        })?;
                        attach(&mut stack, &mut result, Value::Number(n.into()));
                        scalar_tag = None;
                        text.clear();
                    }
                    "boolean" => {
                        attach(&mut stack, &mut result, Value::Bool(text.trim() == "1"));
                        scalar_tag = None;
                        text.clear();
                    }
                    "double" => {
                        let n = text
                            .trim()
                            .parse::<f64>()
                            .ok()
                            .and_then(Number::from_f64)
                            .map(Value::Number)
                            .unwrap_or(Value::Null);
                        attach(&mut stack, &mut result, n);
                        scalar_tag = None;
                        text.clear();
                    }
                    "string" | "dateTime.iso8601" | "base64" => {
                        attach(&mut stack, &mut result, Value::String(std::mem::take(&mut text)));
                        scalar_tag = None;
                    }
                    "value" => {
                        // Untyped values are strings
                        if scalar_tag.is_none() && !text.is_empty() && !in_name {
                            attach(&mut stack, &mut result, Value::String(std::mem::take(&mut text)));
                        }
                    }
                    "array" => {
                        if let Some(Frame::Array(items)) = stack.pop() {
                            attach(&mut stack, &mut result, Value::Array(items));
                        }
                    }
                    "struct" => {
                        if let Some(Frame::Struct(map, _)) = stack.pop() {
                            attach(&mut stack, &mut result, Value::Object(map));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::ParseError(format!(
                    "Failed to parse XML-RPC response: {}",
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    let value = result.unwrap_or(Value::Null);
    if in_fault {
        let message = value
            .get("faultString")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown fault")
            .to_string();
        let code = value.get("faultCode").and_then(|v| v.as_i64()).unwrap_or(0);
        return Err(Error::ExternalTool(format!(
            "Koji fault {}: {}",
            code, message
        )));
    }
    Ok(value)
}
