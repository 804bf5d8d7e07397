//! Canonical JSON encoding.
//!
//! Sender and receiver must hash the same bytes for the same logical
//! payload. The canonical form is compact JSON with object keys sorted
//! recursively. Strings are written as serde_json writes them: `/` and
//! non-ASCII characters are emitted literally, never escaped.

use serde_json::Value;

/// Encodes `value` in canonical form.
///
/// # Errors
///
/// Returns an error only if serde_json fails to write a scalar, which does
/// not happen for values built by serde_json itself.
pub fn to_vec(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(128);
    write_value(&mut buf, value)?;
    Ok(buf)
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            buf.push(b'{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                serde_json::to_writer(&mut *buf, key)?;
                buf.push(b':');
                write_value(buf, value)?;
            }
            buf.push(b'}');
        },
        Value::Array(items) => {
            buf.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_value(buf, item)?;
            }
            buf.push(b']');
        },
        scalar => serde_json::to_writer(&mut *buf, scalar)?,
    }

    Ok(())
}
