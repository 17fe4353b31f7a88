//! JSON input bridge: drives the encoder from parsed JSON.
//!
//! Strings prefixed with `b64:` whose remainder decodes as standard base64
//! become binary values; everything else maps directly.
//!
//! # Example
//!
//! ```
//! use fleece::json::encode_json;
//!
//! let doc = encode_json(r#"{"name": "alice", "age": 30}"#).unwrap();
//! assert!(doc.len() >= 2);
//! ```

use base64::Engine;
use serde_json::Value as JsonValue;

use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::writer::Writer;

/// Parse a JSON string and encode it as a finished document.
///
/// # Errors
///
/// Returns `Error::JsonParse` if the JSON is invalid, or any encoder error.
pub fn encode_json(json: &str) -> Result<Vec<u8>> {
    let parsed: JsonValue =
        serde_json::from_str(json).map_err(|e| Error::JsonParse(e.to_string()))?;
    let mut out = Writer::new();
    let mut enc = Encoder::new(&mut out);
    write_json(&mut enc, &parsed)?;
    enc.end()?;
    drop(enc);
    Ok(out.into_inner())
}

/// Feed one parsed JSON value (and its children) to an encoder.
///
/// # Errors
///
/// Propagates encoder errors, e.g. when called where a dictionary key is
/// due.
pub fn write_json(enc: &mut Encoder<'_>, value: &JsonValue) -> Result<()> {
    match value {
        JsonValue::Null => enc.write_null(),
        JsonValue::Bool(b) => enc.write_bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                enc.write_int(i)
            } else if let Some(u) = n.as_u64() {
                enc.write_uint(u)
            } else {
                enc.write_double(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => {
            if let Some(payload) = s.strip_prefix("b64:")
                && let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(payload)
            {
                return enc.write_data(&bytes);
            }
            enc.write_string(s)
        }
        JsonValue::Array(items) => {
            enc.begin_array(items.len())?;
            for item in items {
                write_json(enc, item)?;
            }
            enc.end_array()
        }
        JsonValue::Object(fields) => {
            enc.begin_dict(fields.len())?;
            for (key, field) in fields {
                enc.write_key(key)?;
                write_json(enc, field)?;
            }
            enc.end_dict()
        }
    }
}
