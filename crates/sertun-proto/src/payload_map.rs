//! The typed payload map: a self-describing binary key/value container used
//! as the payload of control-channel frames.
//!
//! # Wire grammar
//!
//! ```text
//! Map      := Magic Version Flags Entry* Footer
//! Magic    := 0xFE 0xEF
//! Version  := 0x01
//! Flags    := u8                  ; bit0 CaseInsensitive, bit1 ReadOnly, bit2 Concurrent
//! Entry    := KeyLen Key Tag Value
//! KeyLen   := u16 (LE)
//! Key      := KeyLen bytes, UTF-8
//! Tag      := u8                  ; see ValueTag
//! Footer   := 0xEF 0xFE
//! ```
//!
//! There is no entry count: a parser reads entries until the next two bytes
//! are exactly the footer. No valid `KeyLen` can be confused with the
//! footer, since `0xFEEF` as a little-endian length vastly exceeds
//! [`crate::value::MAX_KEY_BYTES`].
//!
//! A nested `Value::Map` is itself a complete `Map` production, recursively.
//!
//! # Identity and sharing
//!
//! A [`PayloadMap`] is a cheap handle (`Arc<RwLock<Inner>>`). Two handles
//! obtained from [`PayloadMap::share`] refer to the same underlying map, so
//! mutating one is visible through the other — this is what lets callers
//! build a graph of maps (as opposed to a tree) and is exactly the shape the
//! cycle check below guards against. [`Clone`] instead performs a full deep
//! copy with a fresh identity, matching the "clone breaks sharing" rule
//! callers expect from a value-like API.

use std::sync::{Arc, RwLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    value::{Value, ValueTag, MAX_KEY_BYTES, MAX_VALUE_BYTES},
};

const MAGIC: [u8; 2] = [0xFE, 0xEF];
const VERSION: u8 = 0x01;
const FOOTER: [u8; 2] = [0xEF, 0xFE];

const FLAG_CASE_INSENSITIVE: u8 = 1 << 0;
const FLAG_READ_ONLY: u8 = 1 << 1;
const FLAG_CONCURRENT: u8 = 1 << 2;

/// Construction-time behavior flags for a [`PayloadMap`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapFlags {
    /// Keys are compared case-insensitively (ASCII fold).
    pub case_insensitive: bool,
    /// Map is constructed already locked against mutation.
    pub read_only: bool,
    /// Hint that this map is shared across tasks. This implementation's
    /// handle is always internally synchronized, so the flag only affects
    /// the wire byte and is otherwise informational.
    pub concurrent: bool,
}

impl MapFlags {
    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.case_insensitive {
            b |= FLAG_CASE_INSENSITIVE;
        }
        if self.read_only {
            b |= FLAG_READ_ONLY;
        }
        if self.concurrent {
            b |= FLAG_CONCURRENT;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            case_insensitive: b & FLAG_CASE_INSENSITIVE != 0,
            read_only: b & FLAG_READ_ONLY != 0,
            concurrent: b & FLAG_CONCURRENT != 0,
        }
    }
}

struct Entry {
    original_key: String,
    canonical_key: String,
    value: Value,
}

/// Entries are kept in a `Vec` rather than a `HashMap`: control-channel maps
/// are small (a handful of reserved keys plus command data), and a `Vec`
/// gives a deterministic, insertion-order wire encoding, which a hashed map
/// would not.
struct Inner {
    entries: Vec<Entry>,
    flags: MapFlags,
}

impl Inner {
    fn canonical(&self, key: &str) -> String {
        if self.flags.case_insensitive {
            key.to_ascii_lowercase()
        } else {
            key.to_owned()
        }
    }

    fn position(&self, canonical: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.canonical_key == canonical)
    }
}

/// A typed key/value map, addressable by string key, that can nest other
/// maps as values.
#[derive(Debug)]
pub struct PayloadMap {
    inner: Arc<RwLock<Inner>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("keys", &self.entries.iter().map(|e| &e.original_key).collect::<Vec<_>>())
            .field("flags", &self.flags)
            .finish()
    }
}

impl Default for PayloadMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadMap {
    /// Creates an empty map with no flags set.
    #[must_use]
    pub fn new() -> Self {
        Self::with_flags(MapFlags::default())
    }

    /// Creates an empty map with the given construction flags.
    #[must_use]
    pub fn with_flags(flags: MapFlags) -> Self {
        Self { inner: Arc::new(RwLock::new(Inner { entries: Vec::new(), flags })) }
    }

    /// Returns another handle to the same underlying map. Mutations through
    /// either handle are visible through both.
    #[must_use]
    pub fn share(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner).cast::<()>() as usize
    }

    /// Locks the map against further mutation. Idempotent.
    pub fn lock(&self) {
        self.write_lock().flags.read_only = true;
    }

    /// True if the map has been [`PayloadMap::lock`]ed.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.read_lock().flags.read_only
    }

    #[allow(clippy::unwrap_used)]
    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        // Poisoning would mean a previous writer panicked mid-mutation; this
        // type's invariants don't tolerate continuing past that, but nothing
        // in this module panics while holding the lock.
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[allow(clippy::unwrap_used)]
    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Inserts or replaces the value at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnlyViolation`] if the map is locked,
    /// [`ProtocolError::BoundsExceeded`] if `key` exceeds
    /// [`MAX_KEY_BYTES`] or a string/byte-array value exceeds
    /// [`MAX_VALUE_BYTES`], or [`ProtocolError::CycleDetected`] if `value` is
    /// a map that directly or transitively contains `self`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();

        if key.len() > MAX_KEY_BYTES {
            return Err(ProtocolError::BoundsExceeded {
                field: "key",
                actual: key.len(),
                limit: MAX_KEY_BYTES,
            });
        }
        check_value_bounds(&value)?;

        if let Value::Map(candidate) = &value {
            if candidate.identity() == self.identity() || candidate.reaches(self.identity()) {
                return Err(ProtocolError::CycleDetected);
            }
        }

        let mut inner = self.write_lock();
        if inner.flags.read_only {
            return Err(ProtocolError::ReadOnlyViolation);
        }
        let canonical = inner.canonical(&key);
        match inner.position(&canonical) {
            Some(pos) => {
                let entry = &mut inner.entries[pos];
                entry.original_key = key;
                entry.value = value;
            },
            None => inner.entries.push(Entry { original_key: key, canonical_key: canonical, value }),
        }
        Ok(())
    }

    /// Sets a value at a dotted `path` (e.g. `"a.b.c"`), creating intermediate
    /// maps as needed.
    ///
    /// # Errors
    ///
    /// As [`PayloadMap::set`], plus [`ProtocolError::TypeMismatch`] if an
    /// intermediate path segment already holds a non-map value.
    pub fn set_path(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let mut segments = path.split('.');
        let last = segments.next_back().ok_or_else(|| ProtocolError::MalformedPayload(
            "empty path".to_owned(),
        ))?;

        let mut cursor = self.share();
        for segment in segments {
            cursor = match cursor.get(segment) {
                Some(Value::Map(child)) => child,
                Some(_) => {
                    return Err(ProtocolError::TypeMismatch { key: segment.to_owned() });
                },
                None => {
                    let child = PayloadMap::new();
                    cursor.set(segment, child.share())?;
                    child
                },
            };
        }
        cursor.set(last, value)
    }

    /// Returns a clone of the value at `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.read_lock();
        let canonical = inner.canonical(key);
        inner.position(&canonical).map(|pos| inner.entries[pos].value.clone())
    }

    /// Resolves a dotted `path` to a value, if every segment exists and every
    /// intermediate segment is a map.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.').peekable();
        let mut current = self.share();
        while let Some(segment) = segments.next() {
            let value = current.get(segment)?;
            if segments.peek().is_none() {
                return Some(value);
            }
            match value {
                Value::Map(child) => current = child,
                _ => return None,
            }
        }
        None
    }

    /// Reads the value at `key` coerced to `T`, applying the same lexical
    /// coercions a peer's untyped reader would need (numeric widening,
    /// string-to-number parsing, and back).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] if the key is absent or the
    /// stored value cannot be coerced.
    pub fn get_as<T: FromValue>(&self, key: &str) -> Result<T> {
        let value = self.get(key).ok_or_else(|| ProtocolError::TypeMismatch { key: key.to_owned() })?;
        T::from_value(&value).ok_or_else(|| ProtocolError::TypeMismatch { key: key.to_owned() })
    }

    /// Removes and returns the value at `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnlyViolation`] if the map is locked.
    pub fn delete(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.write_lock();
        if inner.flags.read_only {
            return Err(ProtocolError::ReadOnlyViolation);
        }
        let canonical = inner.canonical(key);
        Ok(inner.position(&canonical).map(|pos| inner.entries.remove(pos).value))
    }

    /// True if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.read_lock();
        let canonical = inner.canonical(key);
        inner.position(&canonical).is_some()
    }

    /// Number of entries at this level (not counting nested map contents).
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_lock().entries.len()
    }

    /// True if this level has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys present at this level, in the original (not canonicalized) form
    /// they were inserted with.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.read_lock().entries.iter().map(|e| e.original_key.clone()).collect()
    }

    /// True if `self`, or any map nested (directly or transitively) under
    /// `self`, has the given identity.
    fn reaches(&self, target: usize) -> bool {
        let mut visited = Vec::new();
        self.reaches_inner(target, &mut visited)
    }

    fn reaches_inner(&self, target: usize, visited: &mut Vec<usize>) -> bool {
        let id = self.identity();
        if id == target {
            return true;
        }
        if visited.contains(&id) {
            return false;
        }
        visited.push(id);

        let inner = self.read_lock();
        inner.entries.iter().any(|e| match &e.value {
            Value::Map(child) => child.reaches_inner(target, visited),
            _ => false,
        })
    }

    /// Performs a full deep copy: every nested map is recursively copied,
    /// each with a fresh independent identity.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let inner = self.read_lock();
        let cloned = Self::with_flags(inner.flags);
        let mut out = cloned.write_lock();
        for entry in &inner.entries {
            let value = match &entry.value {
                Value::Map(child) => Value::Map(child.deep_clone()),
                other => other.clone(),
            };
            out.entries.push(Entry {
                original_key: entry.original_key.clone(),
                canonical_key: entry.canonical_key.clone(),
                value,
            });
        }
        drop(out);
        cloned
    }

    /// Serializes this map (and its nested maps, recursively) to its binary
    /// wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CycleDetected`] if the map graph contains a
    /// cycle (possible if a cycle was introduced via [`PayloadMap::set_path`]
    /// after an initial acyclic construction, since path traversal does not
    /// re-run the full-graph check `set` does).
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        let mut stack = Vec::new();
        self.encode_into(&mut buf, &mut stack)?;
        Ok(buf)
    }

    fn encode_into(&self, buf: &mut BytesMut, stack: &mut Vec<usize>) -> Result<()> {
        let id = self.identity();
        if stack.contains(&id) {
            return Err(ProtocolError::CycleDetected);
        }
        stack.push(id);

        let inner = self.read_lock();
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(inner.flags.to_byte());

        for entry in &inner.entries {
            let key_bytes = entry.original_key.as_bytes();
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u16_le(key_bytes.len() as u16);
            buf.put_slice(key_bytes);
            buf.put_u8(entry.value.tag() as u8);
            encode_value(&entry.value, buf, stack)?;
        }

        buf.put_slice(&FOOTER);
        stack.pop();
        Ok(())
    }

    /// Parses a map from its binary wire form, as produced by
    /// [`PayloadMap::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] or
    /// [`ProtocolError::MalformedPayload`] on any structural violation of the
    /// wire grammar.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let map = decode_one(&mut cursor)?;
        Ok(map)
    }
}

impl Clone for PayloadMap {
    fn clone(&self) -> Self {
        self.deep_clone()
    }
}

impl PartialEq for PayloadMap {
    /// Two handles are equal iff they refer to the same underlying map.
    /// This is identity, not structural, equality: two maps built with the
    /// same contents but never [`PayloadMap::share`]d from one another are
    /// *not* equal.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn check_value_bounds(value: &Value) -> Result<()> {
    match value {
        Value::String(s) if s.len() > MAX_VALUE_BYTES => Err(ProtocolError::BoundsExceeded {
            field: "string value",
            actual: s.len(),
            limit: MAX_VALUE_BYTES,
        }),
        Value::ByteArray(b) if b.len() > MAX_VALUE_BYTES => Err(ProtocolError::BoundsExceeded {
            field: "byte array value",
            actual: b.len(),
            limit: MAX_VALUE_BYTES,
        }),
        _ => Ok(()),
    }
}

fn encode_value(value: &Value, buf: &mut BytesMut, stack: &mut Vec<usize>) -> Result<()> {
    match value {
        Value::String(s) => {
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u16_le(s.len() as u16);
            buf.put_slice(s.as_bytes());
        },
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::ByteArray(b) => {
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u16_le(b.len() as u16);
            buf.put_slice(b);
        },
        Value::U8(v) => buf.put_u8(*v),
        Value::I16(v) => buf.put_i16_le(*v),
        Value::U16(v) => buf.put_u16_le(*v),
        Value::I32(v) => buf.put_i32_le(*v),
        Value::U32(v) => buf.put_u32_le(*v),
        Value::I64(v) => buf.put_i64_le(*v),
        Value::U64(v) => buf.put_u64_le(*v),
        Value::F32(v) => buf.put_f32_le(*v),
        Value::F64(v) => buf.put_f64_le(*v),
        Value::Decimal(bytes) => buf.put_slice(bytes),
        Value::Guid(uuid) => buf.put_slice(uuid.as_bytes()),
        Value::Map(child) => child.encode_into(buf, stack)?,
    }
    Ok(())
}

fn need(cursor: &[u8], n: usize) -> Result<()> {
    if cursor.len() < n {
        return Err(ProtocolError::Truncated { expected: n - cursor.len(), actual: cursor.len() });
    }
    Ok(())
}

fn take(cursor: &mut &[u8], n: usize) -> Result<Bytes> {
    need(cursor, n)?;
    let out = Bytes::copy_from_slice(&cursor[..n]);
    cursor.advance(n);
    Ok(out)
}

fn decode_one(cursor: &mut &[u8]) -> Result<PayloadMap> {
    let magic = take(cursor, 2)?;
    if magic[..] != MAGIC[..] {
        return Err(ProtocolError::MalformedPayload("bad map magic".to_owned()));
    }
    let version = take(cursor, 1)?[0];
    if version != VERSION {
        return Err(ProtocolError::MalformedPayload(format!("unsupported map version {version}")));
    }
    let flags = MapFlags::from_byte(take(cursor, 1)?[0]);

    let map = PayloadMap::with_flags(MapFlags::default());
    while cursor.len() < 2 || cursor[..2] != FOOTER[..] {
        need(cursor, 2)?;
        let key_len = cursor.get_u16_le() as usize;
        let key = String::from_utf8(take(cursor, key_len)?.to_vec())
            .map_err(|e| ProtocolError::MalformedPayload(format!("non-UTF-8 key: {e}")))?;

        let tag_byte = take(cursor, 1)?[0];
        let tag = ValueTag::from_u8(tag_byte)
            .ok_or_else(|| ProtocolError::MalformedPayload(format!("unknown value tag {tag_byte}")))?;
        let value = decode_value(tag, cursor)?;

        let mut inner = map.write_lock();
        let canonical = inner.canonical(&key);
        inner.entries.push(Entry { original_key: key, canonical_key: canonical, value });
    }

    let footer = take(cursor, 2)?;
    if footer[..] != FOOTER[..] {
        return Err(ProtocolError::MalformedPayload("bad map footer".to_owned()));
    }

    map.write_lock().flags = flags;
    Ok(map)
}

fn decode_value(tag: ValueTag, cursor: &mut &[u8]) -> Result<Value> {
    Ok(match tag {
        ValueTag::Unspecified => {
            return Err(ProtocolError::MalformedPayload("unspecified value tag".to_owned()));
        },
        ValueTag::String => {
            need(cursor, 2)?;
            let len = cursor.get_u16_le() as usize;
            let bytes = take(cursor, len)?;
            Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| ProtocolError::MalformedPayload(format!("non-UTF-8 string: {e}")))?,
            )
        },
        ValueTag::Bool => Value::Bool(take(cursor, 1)?[0] != 0),
        ValueTag::ByteArray => {
            need(cursor, 2)?;
            let len = cursor.get_u16_le() as usize;
            Value::ByteArray(take(cursor, len)?)
        },
        ValueTag::U8 => Value::U8(take(cursor, 1)?[0]),
        ValueTag::I16 => {
            need(cursor, 2)?;
            Value::I16(cursor.get_i16_le())
        },
        ValueTag::U16 => {
            need(cursor, 2)?;
            Value::U16(cursor.get_u16_le())
        },
        ValueTag::I32 => {
            need(cursor, 4)?;
            Value::I32(cursor.get_i32_le())
        },
        ValueTag::U32 => {
            need(cursor, 4)?;
            Value::U32(cursor.get_u32_le())
        },
        ValueTag::I64 => {
            need(cursor, 8)?;
            Value::I64(cursor.get_i64_le())
        },
        ValueTag::U64 => {
            need(cursor, 8)?;
            Value::U64(cursor.get_u64_le())
        },
        ValueTag::F32 => {
            need(cursor, 4)?;
            Value::F32(cursor.get_f32_le())
        },
        ValueTag::F64 => {
            need(cursor, 8)?;
            Value::F64(cursor.get_f64_le())
        },
        ValueTag::Decimal => {
            let bytes = take(cursor, 16)?;
            let mut arr = [0u8; 16];
            arr.copy_from_slice(&bytes);
            Value::Decimal(arr)
        },
        ValueTag::Guid => {
            let bytes = take(cursor, 16)?;
            let mut arr = [0u8; 16];
            arr.copy_from_slice(&bytes);
            Value::Guid(uuid::Uuid::from_bytes(arr))
        },
        ValueTag::Map => Value::Map(decode_one(cursor)?),
    })
}

/// Lexical coercion from a stored [`Value`] to a requested Rust type, the way
/// [`PayloadMap::get_as`] reads values without the caller knowing the exact
/// tag a peer used.
pub trait FromValue: Sized {
    /// Attempts to coerce `value` into `Self`.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value_numeric {
    ($t:ty) => {
        impl FromValue for $t {
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::U8(v) => <$t>::try_from(*v).ok(),
                    Value::I16(v) => <$t>::try_from(*v).ok(),
                    Value::U16(v) => <$t>::try_from(*v).ok(),
                    Value::I32(v) => <$t>::try_from(*v).ok(),
                    Value::U32(v) => <$t>::try_from(*v).ok(),
                    Value::I64(v) => <$t>::try_from(*v).ok(),
                    Value::U64(v) => <$t>::try_from(*v).ok(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                }
            }
        }
    };
}

impl_from_value_numeric!(u8);
impl_from_value_numeric!(i16);
impl_from_value_numeric!(u16);
impl_from_value_numeric!(i32);
impl_from_value_numeric!(u32);
impl_from_value_numeric!(i64);
impl_from_value_numeric!(u64);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::F32(v) => Some(*v),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::U8(v) => Some(v.to_string()),
            Value::I16(v) => Some(v.to_string()),
            Value::U16(v) => Some(v.to_string()),
            Value::I32(v) => Some(v.to_string()),
            Value::U32(v) => Some(v.to_string()),
            Value::I64(v) => Some(v.to_string()),
            Value::U64(v) => Some(v.to_string()),
            Value::Guid(g) => Some(g.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arbitrary_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            ".{0,32}".prop_map(Value::String),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::I64),
            any::<u64>().prop_map(Value::U64),
            any::<i32>().prop_map(Value::I32),
        ]
    }

    proptest! {
        #[test]
        fn scalar_map_round_trips(
            entries in prop::collection::vec(("[a-z][a-z0-9]{0,15}", arbitrary_scalar()), 0..8)
        ) {
            let map = PayloadMap::new();
            let mut last_by_key = std::collections::HashMap::new();
            for (key, value) in &entries {
                map.set(key.clone(), value.clone()).expect("set");
                last_by_key.insert(key.clone(), value.clone());
            }

            let encoded = map.encode().expect("encode");
            let decoded = PayloadMap::decode(&encoded).expect("decode");

            for (key, expected) in &last_by_key {
                prop_assert_eq!(decoded.get(key).as_ref(), Some(expected));
            }
        }
    }

    #[test]
    fn set_and_get_round_trip() {
        let map = PayloadMap::new();
        map.set("name", "sertun").expect("set");
        map.set("count", 3i64).expect("set");
        assert_eq!(map.get("name"), Some(Value::String("sertun".to_owned())));
        assert_eq!(map.get("count"), Some(Value::I64(3)));
    }

    #[test]
    fn case_insensitive_lookup() {
        let map = PayloadMap::with_flags(MapFlags { case_insensitive: true, ..Default::default() });
        map.set("Host", "example.com").expect("set");
        assert_eq!(map.get("host"), Some(Value::String("example.com".to_owned())));
        assert_eq!(map.keys(), vec!["Host".to_owned()]);
    }

    #[test]
    fn locked_map_rejects_mutation() {
        let map = PayloadMap::new();
        map.set("a", 1i64).expect("set");
        map.lock();
        assert_eq!(map.set("b", 2i64), Err(ProtocolError::ReadOnlyViolation));
        assert_eq!(map.delete("a"), Err(ProtocolError::ReadOnlyViolation));
    }

    #[test]
    fn set_path_creates_intermediate_maps() {
        let map = PayloadMap::new();
        map.set_path("a.b.c", "leaf").expect("set_path");
        assert_eq!(map.get_path("a.b.c"), Some(Value::String("leaf".to_owned())));
    }

    #[test]
    fn direct_self_nest_is_rejected() {
        let map = PayloadMap::new();
        assert_eq!(map.set("self", map.share()), Err(ProtocolError::CycleDetected));
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let a = PayloadMap::new();
        let b = PayloadMap::new();
        let c = PayloadMap::new();

        a.set("b", b.share()).expect("a->b");
        b.set("c", c.share()).expect("b->c");

        assert_eq!(c.set("a", a.share()), Err(ProtocolError::CycleDetected));
    }

    #[test]
    fn deep_clone_breaks_sharing() {
        let original = PayloadMap::new();
        original.set("x", 1i64).expect("set");
        let cloned = original.clone();
        cloned.set("x", 2i64).expect("set");

        assert_eq!(original.get("x"), Some(Value::I64(1)));
        assert_eq!(cloned.get("x"), Some(Value::I64(2)));
    }

    #[test]
    fn encode_decode_round_trip_with_nesting() {
        let map = PayloadMap::new();
        map.set("name", "sertun").expect("set");
        map.set("count", 42i64).expect("set");
        map.set("enabled", true).expect("set");

        let child = PayloadMap::new();
        child.set("nested", "yes").expect("set");
        map.set("child", child).expect("set");

        let encoded = map.encode().expect("encode");
        let decoded = PayloadMap::decode(&encoded).expect("decode");

        assert_eq!(decoded.get("name"), Some(Value::String("sertun".to_owned())));
        assert_eq!(decoded.get("count"), Some(Value::I64(42)));
        assert_eq!(decoded.get("enabled"), Some(Value::Bool(true)));
        assert_eq!(decoded.get_path("child.nested"), Some(Value::String("yes".to_owned())));
    }

    #[test]
    fn get_as_coerces_string_to_number() {
        let map = PayloadMap::new();
        map.set("port", "8080").expect("set");
        let port: u16 = map.get_as("port").expect("coerce");
        assert_eq!(port, 8080);
    }

    #[test]
    fn scenario_s2_literal_map_encoding() {
        let map = PayloadMap::new();
        map.set("n", -456_789_i32).expect("set");
        map.set("s", "hello").expect("set");

        let encoded = map.encode().expect("encode");

        #[rustfmt::skip]
        let expected: &[u8] = &[
            0xFE, 0xEF, 0x01, 0x00,
            0x01, 0x00, b'n', 0x07, 0xEB, 0x02, 0xF9, 0xFF,
            0x01, 0x00, b's', 0x01, 0x05, 0x00, b'h', b'e', b'l', b'l', b'o',
            0xEF, 0xFE,
        ];
        assert_eq!(&encoded[..], expected);
    }

    #[test]
    fn oversized_key_is_rejected() {
        let map = PayloadMap::new();
        let key = "k".repeat(MAX_KEY_BYTES + 1);
        assert!(matches!(map.set(key, 1i64), Err(ProtocolError::BoundsExceeded { .. })));
    }
}
