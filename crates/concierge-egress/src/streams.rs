//! Raw Redis reply parsing for stream commands.
//!
//! Stream commands are issued via `redis::cmd` and parsed from
//! [`redis::Value`] by hand: the reply shapes differ between RESP2 (nested
//! arrays) and RESP3 (maps), and XAUTOCLAIM grew a third element in Redis
//! 7.x. These helpers normalize all of that.

use std::collections::HashMap;

use redis::Value;

use crate::error::{EgressError, Result};

/// One delivered stream entry: (entry id, field map).
pub type StreamEntry = (String, HashMap<String, String>);

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Double(d) => Some(d.to_string()),
        _ => None,
    }
}

pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        Value::Double(d) => Some(*d as i64),
        _ => None,
    }
}

fn parse_field_map(value: &Value) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    match value {
        Value::Array(items) => {
            for pair in items.chunks(2) {
                if let [k, v] = pair {
                    if let (Some(k), Some(v)) = (value_to_string(k), value_to_string(v)) {
                        fields.insert(k, v);
                    }
                }
            }
        }
        Value::Map(pairs) => {
            for (k, v) in pairs {
                if let (Some(k), Some(v)) = (value_to_string(k), value_to_string(v)) {
                    fields.insert(k, v);
                }
            }
        }
        _ => {}
    }
    fields
}

fn parse_entry(value: &Value) -> Option<StreamEntry> {
    let Value::Array(parts) = value else {
        return None;
    };
    let id = value_to_string(parts.first()?)?;
    let fields = parts.get(1).map(parse_field_map).unwrap_or_default();
    Some((id, fields))
}

fn parse_entry_list(value: &Value) -> Vec<StreamEntry> {
    match value {
        Value::Array(items) => items.iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// Parse an XREADGROUP reply into the entries of the (single) stream read.
/// Nil (BLOCK timeout with no data) parses to an empty list.
pub fn parse_read_reply(value: &Value) -> Vec<StreamEntry> {
    match value {
        Value::Nil => Vec::new(),
        // RESP2: [[stream_key, [entries…]]]
        Value::Array(streams) => streams
            .iter()
            .flat_map(|stream| match stream {
                Value::Array(parts) if parts.len() >= 2 => parse_entry_list(&parts[1]),
                _ => Vec::new(),
            })
            .collect(),
        // RESP3: {stream_key => [entries…]}
        Value::Map(pairs) => pairs
            .iter()
            .flat_map(|(_, entries)| parse_entry_list(entries))
            .collect(),
        _ => Vec::new(),
    }
}

/// Parse an XAUTOCLAIM reply: (next cursor, claimed entries).
///
/// Redis 6.2 replies `[next_id, entries]`; 7.x appends a deleted-ids list,
/// which is ignored here.
pub fn parse_autoclaim_reply(value: &Value) -> Result<(String, Vec<StreamEntry>)> {
    let Value::Array(parts) = value else {
        return Err(EgressError::ReplyShape(format!(
            "XAUTOCLAIM reply was not an array: {value:?}"
        )));
    };
    if parts.len() < 2 {
        return Err(EgressError::ReplyShape(
            "XAUTOCLAIM reply shorter than 2 elements".to_string(),
        ));
    }
    let cursor = value_to_string(&parts[0])
        .ok_or_else(|| EgressError::ReplyShape("XAUTOCLAIM cursor not a string".to_string()))?;
    Ok((cursor, parse_entry_list(&parts[1])))
}

/// Parse an XINFO GROUPS / XINFO CONSUMERS reply into key→value maps.
pub fn parse_info_reply(value: &Value) -> Vec<HashMap<String, Value>> {
    let Value::Array(rows) = value else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match row {
            Value::Array(items) => {
                let mut map = HashMap::new();
                for pair in items.chunks(2) {
                    if let [k, v] = pair {
                        if let Some(k) = value_to_string(k) {
                            map.insert(k, v.clone());
                        }
                    }
                }
                Some(map)
            }
            Value::Map(pairs) => {
                let mut map = HashMap::new();
                for (k, v) in pairs {
                    if let Some(k) = value_to_string(k) {
                        map.insert(k, v.clone());
                    }
                }
                Some(map)
            }
            _ => None,
        })
        .collect()
}
