//! The portable wire format for `SessionData` (spec.md §4.1).
//!
//! Layout: `id`, `contextPath`, `vhost`, `accessed`, `lastAccessed`,
//! `created`, `cookieSet`, `lastNode`, `expiry`, `maxInactiveMs`, then the
//! attribute map as a 4-byte entry count followed by, per entry: a
//! length-prefixed name, one classpath-scope boolean byte, and a
//! length-prefixed `serde_json`-encoded value.
//!
//! No pack example implements this exact byte layout (it's particular to
//! this spec's Jetty-lineage format), so the framing is hand-rolled; the
//! attribute *value* bytes are `serde_json`, matching how every store in
//! the pack encodes attribute payloads.

use std::io::{self, Read, Write};

use crate::data::{AttributeEntry, Attributes, SessionData};
use crate::error::{Error, Result};

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(cursor: &mut &[u8]) -> Result<String> {
    let len = read_u32(cursor)? as usize;
    if cursor.len() < len {
        return Err(Error::Unreadable("truncated string field".into()));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    String::from_utf8(head.to_vec()).map_err(|e| Error::Unreadable(e.to_string()))
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Error::Unreadable("truncated length prefix".into()));
    }
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

fn read_i64(cursor: &mut &[u8]) -> Result<i64> {
    if cursor.len() < 8 {
        return Err(Error::Unreadable("truncated integer field".into()));
    }
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    Ok(i64::from_be_bytes(head.try_into().unwrap()))
}

fn read_bytes<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if cursor.len() < len {
        return Err(Error::Unreadable("truncated byte field".into()));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

/// Serialize a `SessionData` to the wire format described above.
pub fn serialize_session_data(data: &SessionData) -> Vec<u8> {
    let mut buf = Vec::new();
    write_string(&mut buf, &data.id);
    write_string(&mut buf, &data.context_path);
    write_string(&mut buf, &data.vhost);
    buf.extend_from_slice(&data.accessed.to_be_bytes());
    buf.extend_from_slice(&data.last_accessed.to_be_bytes());
    buf.extend_from_slice(&data.created.to_be_bytes());
    buf.extend_from_slice(&data.cookie_set.to_be_bytes());
    write_string(&mut buf, &data.last_node);
    buf.extend_from_slice(&data.expiry.to_be_bytes());
    buf.extend_from_slice(&data.max_inactive_ms.to_be_bytes());

    write_attributes(&mut buf, &data.attributes);
    buf
}

/// Serialize just the attribute map, for stores that keep scalar fields in
/// dedicated columns and attributes in a single blob (spec.md §6's
/// relational schema).
pub fn serialize_attributes(attributes: &Attributes) -> Vec<u8> {
    let mut buf = Vec::new();
    write_attributes(&mut buf, attributes);
    buf
}

fn write_attributes(buf: &mut Vec<u8>, attributes: &Attributes) {
    buf.extend_from_slice(&(attributes.len() as u32).to_be_bytes());
    for (name, entry) in attributes {
        write_string(buf, name);
        buf.push(u8::from(entry.server_scope));
        let encoded = serde_json::to_vec(&entry.value).expect("Value serialization is infallible");
        buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        buf.extend_from_slice(&encoded);
    }
}

/// Deserialize a full `SessionData` record. `last_saved` is not part of the
/// wire format (it is a local bookkeeping field re-stamped by the store on
/// load, not transmitted), so the caller must set it afterwards if needed.
pub fn deserialize_session_data(bytes: &[u8]) -> Result<SessionData> {
    let mut cursor = bytes;

    let id = read_string(&mut cursor)?;
    let context_path = read_string(&mut cursor)?;
    let vhost = read_string(&mut cursor)?;
    let accessed = read_i64(&mut cursor)?;
    let last_accessed = read_i64(&mut cursor)?;
    let created = read_i64(&mut cursor)?;
    let cookie_set = read_i64(&mut cursor)?;
    let last_node = read_string(&mut cursor)?;
    let expiry = read_i64(&mut cursor)?;
    let max_inactive_ms = read_i64(&mut cursor)?;

    let attributes = deserialize_attributes(cursor)?;

    Ok(SessionData {
        id,
        context_path,
        vhost,
        last_node,
        created,
        accessed,
        last_accessed,
        cookie_set,
        last_saved: 0,
        expiry,
        max_inactive_ms,
        attributes,
        dirty: false,
        meta_data_dirty: false,
    })
}

/// Decode just the attribute section, accepting the legacy single-blob
/// format: if the strict count-prefixed layout fails to parse (the count
/// implies more entries than remaining bytes could hold, or bytes are left
/// over once all entries are consumed), the whole buffer is re-parsed as a
/// raw `serde_json` object mapping attribute name to value, with
/// `server_scope` defaulted to `false` for every key.
pub fn deserialize_attributes(bytes: &[u8]) -> Result<Attributes> {
    match try_strict_attributes(bytes) {
        Ok(attrs) => Ok(attrs),
        Err(_) => legacy_attributes(bytes),
    }
}

fn try_strict_attributes(bytes: &[u8]) -> Result<Attributes> {
    let mut cursor = bytes;
    let count = read_u32(&mut cursor)?;

    // Each entry needs at least 4 (name len) + 1 (scope byte) + 4 (value
    // len) = 9 bytes; reject counts that could not possibly fit in what's
    // left, rather than looping and hitting a confusing mid-parse error.
    if (count as u64) * 9 > cursor.len() as u64 {
        return Err(Error::Unreadable("attribute count exceeds remaining bytes".into()));
    }

    let mut attrs = Attributes::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_string(&mut cursor)?;
        let scope_byte = read_bytes(&mut cursor, 1)?[0];
        let server_scope = match scope_byte {
            0 => false,
            1 => true,
            other => return Err(Error::Unreadable(format!("invalid scope byte {other}"))),
        };
        let value_len = read_u32(&mut cursor)? as usize;
        let value_bytes = read_bytes(&mut cursor, value_len)?;
        let value: serde_json::Value =
            serde_json::from_slice(value_bytes).map_err(|e| Error::Unreadable(e.to_string()))?;
        attrs.insert(name, AttributeEntry { server_scope, value });
    }

    if !cursor.is_empty() {
        return Err(Error::Unreadable("trailing bytes after attribute section".into()));
    }

    Ok(attrs)
}

fn legacy_attributes(bytes: &[u8]) -> Result<Attributes> {
    let raw: std::collections::HashMap<String, serde_json::Value> =
        serde_json::from_slice(bytes).map_err(|e| Error::Unreadable(e.to_string()))?;

    Ok(raw
        .into_iter()
        .map(|(k, v)| (k, AttributeEntry::application(v)))
        .collect())
}

/// Streaming convenience wrapper used by stores that hold a `Read`/`Write`
/// handle (e.g. the file store) rather than an in-memory buffer.
pub fn write_session_data(mut writer: impl Write, data: &SessionData) -> io::Result<()> {
    writer.write_all(&serialize_session_data(data))
}

pub fn read_session_data(mut reader: impl Read) -> Result<SessionData> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| Error::Unreadable(e.to_string()))?;
    deserialize_session_data(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> SessionData {
        let mut data = SessionData::new("sess-1", "_app", "host-a", 1_000, 60_000);
        data.set_attribute("k", json!("v"));
        data.set_attribute("n", json!(42));
        data.last_node = "node-a".into();
        data.cookie_set = 1_000;
        data
    }

    #[test]
    fn round_trips_scalars_and_attributes() {
        let original = sample();
        let bytes = serialize_session_data(&original);
        let mut decoded = deserialize_session_data(&bytes).unwrap();
        decoded.last_saved = original.last_saved;
        decoded.dirty = original.dirty;
        decoded.meta_data_dirty = original.meta_data_dirty;

        assert_eq!(decoded, original);
    }

    #[test]
    fn accepts_legacy_raw_map_attribute_format() {
        let legacy = serde_json::to_vec(&serde_json::json!({"k": "v", "n": 42})).unwrap();
        let attrs = deserialize_attributes(&legacy).unwrap();

        assert_eq!(attrs.get("k").unwrap().value, json!("v"));
        assert_eq!(attrs.get("n").unwrap().value, json!(42));
        assert!(!attrs.get("k").unwrap().server_scope);
    }

    #[test]
    fn rejects_truncated_strict_format_by_falling_back() {
        // A count prefix claiming more entries than could possibly fit is
        // *not* valid JSON either, so this should surface as Unreadable,
        // not silently succeed.
        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"short");
        assert!(deserialize_attributes(&bytes).is_err());
    }

    #[test]
    fn empty_attributes_round_trip() {
        let data = SessionData::new("id", "", "", 0, 0);
        let bytes = serialize_session_data(&data);
        let decoded = deserialize_session_data(&bytes).unwrap();
        assert!(decoded.attributes.is_empty());
    }

    #[cfg(feature = "fuzz-tests")]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = serde_json::Value> {
            prop_oneof![
                Just(serde_json::Value::Null),
                any::<bool>().prop_map(serde_json::Value::from),
                any::<i64>().prop_map(serde_json::Value::from),
                "[ -~]{0,32}".prop_map(serde_json::Value::from),
            ]
        }

        proptest! {
            // spec.md §8: "Serialize -> deserialize yields a SessionData
            // equal on every scalar field; attribute map preserves key set
            // and per-key value-equality."
            #[test]
            fn session_data_round_trips_for_arbitrary_attributes(
                id in "[a-zA-Z0-9]{1,16}",
                ctx in "[a-zA-Z0-9_]{0,16}",
                vhost in "[a-zA-Z0-9_.-]{0,16}",
                created in 0i64..1_000_000_000_000,
                max_inactive_ms in -1i64..3_600_000,
                names in proptest::collection::vec("[a-zA-Z0-9_]{1,12}", 0..8),
                values in proptest::collection::vec(arb_value(), 0..8),
            ) {
                let mut original = SessionData::new(&id, &ctx, &vhost, created, max_inactive_ms);
                for (name, value) in names.iter().zip(values.iter()) {
                    original.set_attribute(name.clone(), value.clone());
                }

                let bytes = serialize_session_data(&original);
                let mut decoded = deserialize_session_data(&bytes).unwrap();
                decoded.last_saved = original.last_saved;
                decoded.dirty = original.dirty;
                decoded.meta_data_dirty = original.meta_data_dirty;

                prop_assert_eq!(decoded, original);
            }
        }
    }
}
