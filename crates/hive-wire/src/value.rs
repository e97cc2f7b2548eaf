//! Self-describing head values and the encoded map format.
//!
//! A map is `u16 count` followed by `count` entries of
//! `u16 key_len | key | u8 tag | value`. Values nest recursively through
//! [`Value::Vec`] and [`Value::Map`]; decoding stops at [`MAX_DEPTH`].

use bytes::{Buf, BufMut, BytesMut};
use hive_types::{HiveError, HiveResult, NodeId, Tid};
use std::collections::BTreeMap;

/// Deepest nesting accepted when decoding.
pub const MAX_DEPTH: usize = 32;

/// A tagged metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Vec(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Wire tag of this variant.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Nil => 0,
            Self::Bool(_) => 1,
            Self::I8(_) => 2,
            Self::I16(_) => 3,
            Self::I32(_) => 4,
            Self::I64(_) => 5,
            Self::U8(_) => 6,
            Self::U16(_) => 7,
            Self::U32(_) => 8,
            Self::U64(_) => 9,
            Self::F32(_) => 10,
            Self::F64(_) => 11,
            Self::Str(_) => 12,
            Self::Bytes(_) => 13,
            Self::Vec(_) => 14,
            Self::Map(_) => 15,
        }
    }

    /// Any integer variant widened to `i64`, if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(v.into()),
            Self::I16(v) => Some(v.into()),
            Self::I32(v) => Some(v.into()),
            Self::I64(v) => Some(v),
            Self::U8(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Render scalars as text (used for dispatch keys and filters).
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::F32(f) => Some(f.to_string()),
            Self::F64(f) => Some(f.to_string()),
            other => other.as_i64().map(|v| v.to_string()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => Str,
    Vec<u8> => Bytes,
    Vec<Value> => Vec,
    BTreeMap<String, Value> => Map,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

pub(crate) fn need(buf: &[u8], n: usize, field: &'static str) -> HiveResult<()> {
    if buf.len() < n {
        return Err(HiveError::unmarshal(
            field,
            format!("need {n} bytes, have {}", buf.len()),
        ));
    }
    Ok(())
}

fn put_count(buf: &mut BytesMut, n: usize, field: &str) -> HiveResult<()> {
    let n = u16::try_from(n)
        .map_err(|_| HiveError::Marshal(format!("{field} has {n} entries (max {})", u16::MAX)))?;
    buf.put_u16(n);
    Ok(())
}

fn put_key(buf: &mut BytesMut, key: &str) -> HiveResult<()> {
    let len = u16::try_from(key.len())
        .map_err(|_| HiveError::Marshal(format!("map key of {} bytes", key.len())))?;
    buf.put_u16(len);
    buf.put_slice(key.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, bytes: &[u8]) -> HiveResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| HiveError::Marshal(format!("value of {} bytes", bytes.len())))?;
    buf.put_u32(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Append `tag | value`.
pub fn encode_value(value: &Value, buf: &mut BytesMut) -> HiveResult<()> {
    buf.put_u8(value.tag());
    match value {
        Value::Nil => {}
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::I8(v) => buf.put_i8(*v),
        Value::I16(v) => buf.put_i16(*v),
        Value::I32(v) => buf.put_i32(*v),
        Value::I64(v) => buf.put_i64(*v),
        Value::U8(v) => buf.put_u8(*v),
        Value::U16(v) => buf.put_u16(*v),
        Value::U32(v) => buf.put_u32(*v),
        Value::U64(v) => buf.put_u64(*v),
        Value::F32(v) => buf.put_f32(*v),
        Value::F64(v) => buf.put_f64(*v),
        Value::Str(s) => put_blob(buf, s.as_bytes())?,
        Value::Bytes(b) => put_blob(buf, b)?,
        Value::Vec(items) => {
            put_count(buf, items.len(), "vec")?;
            for item in items {
                encode_value(item, buf)?;
            }
        }
        Value::Map(map) => encode_map(map, buf)?,
    }
    Ok(())
}

/// Append `u16 count` and the entries of `map`.
pub fn encode_map(map: &BTreeMap<String, Value>, buf: &mut BytesMut) -> HiveResult<()> {
    put_count(buf, map.len(), "map")?;
    for (key, value) in map {
        put_key(buf, key)?;
        encode_value(value, buf)?;
    }
    Ok(())
}

fn get_blob(buf: &mut &[u8], field: &'static str) -> HiveResult<Vec<u8>> {
    need(buf, 4, field)?;
    let len = buf.get_u32() as usize;
    need(buf, len, field)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_string(buf: &mut &[u8], len: usize, field: &'static str) -> HiveResult<String> {
    need(buf, len, field)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| HiveError::unmarshal(field, e.to_string()))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

/// Read one `tag | value`, advancing `buf`.
pub fn decode_value(buf: &mut &[u8], depth: usize) -> HiveResult<Value> {
    if depth > MAX_DEPTH {
        return Err(HiveError::unmarshal("head", format!("nesting deeper than {MAX_DEPTH}")));
    }
    need(buf, 1, "head.tag")?;
    let tag = buf.get_u8();
    let value = match tag {
        0 => Value::Nil,
        1 => {
            need(buf, 1, "head.bool")?;
            Value::Bool(buf.get_u8() != 0)
        }
        2 => {
            need(buf, 1, "head.i8")?;
            Value::I8(buf.get_i8())
        }
        3 => {
            need(buf, 2, "head.i16")?;
            Value::I16(buf.get_i16())
        }
        4 => {
            need(buf, 4, "head.i32")?;
            Value::I32(buf.get_i32())
        }
        5 => {
            need(buf, 8, "head.i64")?;
            Value::I64(buf.get_i64())
        }
        6 => {
            need(buf, 1, "head.u8")?;
            Value::U8(buf.get_u8())
        }
        7 => {
            need(buf, 2, "head.u16")?;
            Value::U16(buf.get_u16())
        }
        8 => {
            need(buf, 4, "head.u32")?;
            Value::U32(buf.get_u32())
        }
        9 => {
            need(buf, 8, "head.u64")?;
            Value::U64(buf.get_u64())
        }
        10 => {
            need(buf, 4, "head.f32")?;
            Value::F32(buf.get_f32())
        }
        11 => {
            need(buf, 8, "head.f64")?;
            Value::F64(buf.get_f64())
        }
        12 => {
            need(buf, 4, "head.str")?;
            let len = buf.get_u32() as usize;
            Value::Str(get_string(buf, len, "head.str")?)
        }
        13 => Value::Bytes(get_blob(buf, "head.bytes")?),
        14 => {
            need(buf, 2, "head.vec")?;
            let count = buf.get_u16() as usize;
            // Every element carries at least its tag byte.
            need(buf, count, "head.vec")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(buf, depth + 1)?);
            }
            Value::Vec(items)
        }
        15 => Value::Map(decode_map_at(buf, depth + 1)?),
        other => {
            return Err(HiveError::unmarshal(
                "head.tag",
                format!("unknown value tag {other}"),
            ))
        }
    };
    Ok(value)
}

/// Read a map written by [`encode_map`], advancing `buf`.
pub fn decode_map(buf: &mut &[u8]) -> HiveResult<BTreeMap<String, Value>> {
    decode_map_at(buf, 0)
}

fn decode_map_at(buf: &mut &[u8], depth: usize) -> HiveResult<BTreeMap<String, Value>> {
    if depth > MAX_DEPTH {
        return Err(HiveError::unmarshal("head", format!("nesting deeper than {MAX_DEPTH}")));
    }
    need(buf, 2, "head.count")?;
    let count = buf.get_u16() as usize;
    // key length (2) + tag (1) per entry at minimum
    need(buf, count * 3, "head.count")?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        need(buf, 2, "head.key")?;
        let len = buf.get_u16() as usize;
        let key = get_string(buf, len, "head.key")?;
        let value = decode_value(buf, depth)?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Well-known head keys.
pub mod keys {
    /// Target service id.
    pub const SVC: &str = "svc";
    /// Target method code.
    pub const CODE: &str = "code";
    /// Sender node id.
    pub const SRC: &str = "src";
    /// Send timestamp, unix milliseconds.
    pub const TS: &str = "ts";
    /// Resolved response method code.
    pub const RES: &str = "res";
    /// Parent transaction id of the call chain.
    pub const PTID: &str = "ptid";
    /// Dispatch key for keyed policies.
    pub const KEY: &str = "key";
}

/// Ordered metadata attached to every frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Head {
    entries: BTreeMap<String, Value>,
}

impl Head {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Merge `other` into `self`; entries already present are kept.
    pub fn merge_missing(&mut self, other: &Head) {
        for (k, v) in &other.entries {
            self.entries.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn svc(&self) -> Option<u16> {
        self.get_i64(keys::SVC).and_then(|v| u16::try_from(v).ok())
    }

    pub fn code(&self) -> Option<u8> {
        self.get_i64(keys::CODE).and_then(|v| u8::try_from(v).ok())
    }

    pub fn src(&self) -> Option<NodeId> {
        self.get_i64(keys::SRC)
    }

    pub fn ts(&self) -> Option<i64> {
        self.get_i64(keys::TS)
    }

    pub fn res(&self) -> Option<u8> {
        self.get_i64(keys::RES).and_then(|v| u8::try_from(v).ok())
    }

    pub fn ptid(&self) -> Option<Tid> {
        self.get_i64(keys::PTID)
    }

    /// The dispatch key as text, if one was set.
    pub fn key(&self) -> Option<String> {
        self.get(keys::KEY).and_then(Value::to_text)
    }

    pub fn set_svc(&mut self, svc: u16) {
        self.insert(keys::SVC, svc);
    }

    pub fn set_code(&mut self, code: u8) {
        self.insert(keys::CODE, code);
    }

    pub fn set_src(&mut self, node: NodeId) {
        self.insert(keys::SRC, node);
    }

    pub fn set_ts(&mut self, ts: i64) {
        self.insert(keys::TS, ts);
    }

    pub fn set_res(&mut self, code: u8) {
        self.insert(keys::RES, code);
    }

    pub fn set_ptid(&mut self, tid: Tid) {
        self.insert(keys::PTID, tid);
    }

    pub fn set_key(&mut self, key: impl Into<Value>) {
        self.insert(keys::KEY, key);
    }

    /// Append the encoded map.
    pub fn encode(&self, buf: &mut BytesMut) -> HiveResult<()> {
        encode_map(&self.entries, buf)
    }

    /// Read an encoded map, advancing `buf`.
    pub fn decode(buf: &mut &[u8]) -> HiveResult<Self> {
        decode_map(buf).map(Self::from)
    }
}

impl From<BTreeMap<String, Value>> for Head {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Head {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(head: &Head) -> Head {
        let mut buf = BytesMut::new();
        head.encode(&mut buf).unwrap();
        let mut slice = &buf[..];
        let out = Head::decode(&mut slice).unwrap();
        assert!(slice.is_empty(), "decoder must consume the whole map");
        out
    }

    #[test]
    fn test_every_variant_survives() {
        let mut nested = BTreeMap::new();
        nested.insert("inner".to_string(), Value::from(vec![Value::U8(1), Value::Nil]));
        let head = Head::new()
            .with("nil", Value::Nil)
            .with("b", true)
            .with("i8", -3i8)
            .with("i16", -300i16)
            .with("i32", -70_000i32)
            .with("i64", i64::MIN)
            .with("u8", 200u8)
            .with("u16", 60_000u16)
            .with("u32", 4_000_000_000u32)
            .with("u64", u64::MAX)
            .with("f32", 1.5f32)
            .with("f64", -2.25f64)
            .with("s", "héllo")
            .with("raw", vec![0u8, 255])
            .with("map", nested);
        assert_eq!(roundtrip(&head), head);
    }

    #[test]
    fn test_well_known_accessors() {
        let mut head = Head::new();
        head.set_svc(12);
        head.set_code(7);
        head.set_src(42);
        head.set_res(8);
        head.set_ptid(99);
        head.set_key(1001i64);
        let head = roundtrip(&head);
        assert_eq!(head.svc(), Some(12));
        assert_eq!(head.code(), Some(7));
        assert_eq!(head.src(), Some(42));
        assert_eq!(head.res(), Some(8));
        assert_eq!(head.ptid(), Some(99));
        assert_eq!(head.key().as_deref(), Some("1001"));
        assert_eq!(head.ts(), None);
    }

    #[test]
    fn test_truncated_input_names_field() {
        let head = Head::new().with("name", "player");
        let mut buf = BytesMut::new();
        head.encode(&mut buf).unwrap();
        for cut in 0..buf.len() {
            let mut slice = &buf[..cut];
            let err = Head::decode(&mut slice).unwrap_err();
            assert!(matches!(err, HiveError::Unmarshal { .. }), "cut {cut}: {err}");
        }
    }

    #[test]
    fn test_hostile_count_is_rejected_without_allocating() {
        // count = 65535 with no entries behind it
        let mut slice: &[u8] = &[0xff, 0xff];
        let err = Head::decode(&mut slice).unwrap_err();
        assert!(matches!(err, HiveError::Unmarshal { field: "head.count", .. }));
    }

    #[test]
    fn test_depth_limit() {
        let mut value = Value::Nil;
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::Vec(vec![value]);
        }
        let mut buf = BytesMut::new();
        encode_value(&value, &mut buf).unwrap();
        let mut slice = &buf[..];
        assert!(decode_value(&mut slice, 0).is_err());
    }

    #[test]
    fn test_merge_missing_keeps_existing() {
        let mut head = Head::new().with("a", 1i32);
        head.merge_missing(&Head::new().with("a", 2i32).with("b", 3i32));
        assert_eq!(head.get_i64("a"), Some(1));
        assert_eq!(head.get_i64("b"), Some(3));
    }
}
