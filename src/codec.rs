//! Canonical document serialization for hashing and failure logs.
//!
//! The canonical form is stable across runs: keys sorted lexicographically at
//! every nesting level, opaque ids as their hexadecimal string, timestamps as
//! RFC 3339 with an explicit UTC offset, decimals as their decimal string,
//! and binary as lowercase hex. Two documents are considered equivalent when
//! their canonical bytes hash equal; the hash is never used for security.

use std::cmp::Ordering;
use std::fmt::Write as _;

use bson::{Bson, Document};
use chrono::SecondsFormat;
use md5::{Digest, Md5};

/// Render `doc` into its canonical byte form.
pub fn canonical_bytes(doc: &Document) -> Vec<u8> {
    let mut out = String::new();
    write_document(&mut out, doc);
    out.into_bytes()
}

/// 128-bit MD5 of the canonical bytes, rendered as lowercase hex.
pub fn document_hash(doc: &Document) -> String {
    let mut hasher = Md5::new();
    hasher.update(canonical_bytes(doc));
    hex::encode(hasher.finalize())
}

/// The primary id (`_id`) of a document, if present.
pub fn document_id(doc: &Document) -> Option<&Bson> {
    doc.get("_id")
}

/// Render an id for log lines and failure records.
pub fn display_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Total order over scalar ids.
///
/// Values group into type brackets (null < numbers < strings < documents <
/// arrays < binary < object ids < booleans < dates < timestamps) and compare
/// within a bracket, matching the store's sort semantics.
pub fn compare_ids(a: &Bson, b: &Bson) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        _ if rank_a == NUMBER_RANK => {
            let (x, y) = (numeric_value(a), numeric_value(b));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        _ => Ordering::Equal,
    }
}

const NUMBER_RANK: u8 = 1;

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey | Bson::Null | Bson::Undefined => 0,
        Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => NUMBER_RANK,
        Bson::String(_) | Bson::Symbol(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::ObjectId(_) => 6,
        Bson::Boolean(_) => 7,
        Bson::DateTime(_) => 8,
        Bson::Timestamp(_) => 9,
        _ => 10,
    }
}

fn numeric_value(value: &Bson) -> f64 {
    match value {
        Bson::Double(d) => *d,
        Bson::Int32(i) => f64::from(*i),
        Bson::Int64(i) => *i as f64,
        Bson::Decimal128(d) => d.to_string().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

fn write_document(out: &mut String, doc: &Document) {
    let mut entries: Vec<(&String, &Bson)> = doc.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_value(out: &mut String, value: &Bson) {
    match value {
        Bson::Null | Bson::Undefined => out.push_str("null"),
        Bson::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Bson::Int32(i) => {
            let _ = write!(out, "{}", i);
        }
        Bson::Int64(i) => {
            let _ = write!(out, "{}", i);
        }
        Bson::Double(d) => {
            let _ = write!(out, "{}", d);
        }
        Bson::String(s) | Bson::Symbol(s) => write_string(out, s),
        Bson::ObjectId(oid) => write_string(out, &oid.to_hex()),
        Bson::DateTime(dt) => {
            let stamp = dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, false);
            write_string(out, &stamp);
        }
        Bson::Decimal128(d) => write_string(out, &d.to_string()),
        Bson::Binary(bin) => write_string(out, &hex::encode(&bin.bytes)),
        Bson::Timestamp(ts) => {
            let _ = write!(out, "{{\"i\":{},\"t\":{}}}", ts.increment, ts.time);
        }
        Bson::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Bson::Document(doc) => write_document(out, doc),
        other => {
            // Exotic kinds canonicalize through their extended-JSON form.
            let extjson = other.clone().into_relaxed_extjson();
            write_string(out, &extjson.to_string());
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
