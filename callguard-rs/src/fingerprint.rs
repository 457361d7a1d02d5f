//! Computes stable, order independent fingerprints for a set of named values.
//!
//! A fingerprint is the first 128 bits of a SHA-256 digest over a canonical JSON rendering of
//! the named values. The rendering sorts all object keys (recursively) and uses no whitespace, so
//! two mappings with equal content always produce the same fingerprint, no matter in which order
//! their entries were inserted.
//!
//! Fingerprints are the only artifact shared between the [cache](crate::cache) and the
//! [limiter](crate::limiter): the former builds one per key segment, the latter one per call
//! shape.
//!
//! # Examples
//!
//! ```
//! # use callguard::fingerprint::Fields;
//! let a = Fields::new().with("url", "https://example.com").with("method", "GET");
//! let b = Fields::new().with("method", "GET").with("url", "https://example.com");
//!
//! assert_eq!(a.fingerprint(), b.fingerprint());
//! assert_eq!(a.fingerprint().as_str().len(), 32);
//! ```
use std::fmt;

use serde::ser::{
    self, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
    SerializeTupleStruct, SerializeTupleVariant,
};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Number of digest bytes kept for a fingerprint.
pub const FINGERPRINT_BYTES: usize = 16;

/// Represents the hex encoded digest of a set of named values.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Returns the hex representation (32 lower case characters).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collects named values to be fingerprinted.
///
/// Values are converted into JSON as soon as they are added (see [to_value]), so adding a value
/// never fails.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fields {
    values: Map<String, Value>,
}

impl Fields {
    /// Creates an empty set of fields.
    pub fn new() -> Self {
        Fields::default()
    }

    /// Adds the given value and returns the updated fields.
    pub fn with<T>(mut self, name: impl Into<String>, value: &T) -> Self
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        self.insert(name, value);
        self
    }

    /// Adds or replaces the given value.
    pub fn insert<T>(&mut self, name: impl Into<String>, value: &T)
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        self.insert_value(name, to_value(value));
    }

    /// Adds or replaces an already converted value.
    pub fn insert_value(&mut self, name: impl Into<String>, value: Value) {
        let _ = self.values.insert(name.into(), value);
    }

    /// Returns the value stored for the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Determines if any value has been added.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the fields as JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Computes the fingerprint of all values.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&Value::Object(self.values.clone()))
    }
}

/// Converts the given value into JSON.
///
/// Unlike **serde_json::to_value** this accepts maps with keys which aren't strings: such a key
/// is replaced by its canonical JSON rendering. Only if the value itself fails to serialize, its
/// **Debug** representation is used.
///
/// # Examples
///
/// ```
/// # use std::collections::HashMap;
/// # use serde_json::json;
/// assert_eq!(callguard::fingerprint::to_value(&vec![1, 2]), json!([1, 2]));
///
/// let mut points = HashMap::new();
/// points.insert((1, 2), "a");
/// assert_eq!(callguard::fingerprint::to_value(&points), json!({"[1,2]": "a"}));
/// ```
pub fn to_value<T>(value: &T) -> Value
where
    T: Serialize + fmt::Debug + ?Sized,
{
    value
        .serialize(ValueSerializer)
        .unwrap_or_else(|_| Value::String(format!("{:?}", value)))
}

/// Computes the fingerprint of an arbitrary JSON value.
///
/// Objects are rendered with sorted keys on every nesting level before hashing.
pub fn fingerprint(value: &Value) -> Fingerprint {
    let canonical = canonicalize(value);
    let rendered = serde_json::to_vec(&canonical)
        .unwrap_or_else(|_| format!("{:?}", canonical).into_bytes());

    let digest = Sha256::digest(&rendered);
    Fingerprint(hex::encode(&digest[..FINGERPRINT_BYTES]))
}

/// Rebuilds all objects so that their keys are inserted in sorted order.
///
/// serde_json keeps its maps sorted unless the "preserve_order" feature is enabled somewhere in
/// the dependency graph. Sorting explicitly keeps fingerprints stable in both cases.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));

            let mut sorted = Map::new();
            for (key, value) in entries {
                let _ = sorted.insert(key.clone(), canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Builds a JSON value like **serde_json::value::Serializer** but accepts any map key.
struct ValueSerializer;

type Error = serde_json::Error;

/// Renders a map key as string. Keys which aren't strings use their canonical JSON rendering, so
/// equal keys always end up as the same string.
fn map_key<T: Serialize + ?Sized>(key: &T) -> Result<String, Error> {
    match key.serialize(ValueSerializer)? {
        Value::String(text) => Ok(text),
        other => serde_json::to_string(&canonicalize(&other)),
    }
}

fn tagged(variant: &'static str, value: Value) -> Value {
    let mut map = Map::new();
    let _ = map.insert(variant.to_owned(), value);
    Value::Object(map)
}

impl ser::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = Error;

    type SerializeSeq = ArrayBuilder;
    type SerializeTuple = ArrayBuilder;
    type SerializeTupleStruct = ArrayBuilder;
    type SerializeTupleVariant = ArrayBuilder;
    type SerializeMap = ObjectBuilder;
    type SerializeStruct = ObjectBuilder;
    type SerializeStructVariant = ObjectBuilder;

    fn serialize_bool(self, v: bool) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_bool(v)
    }

    fn serialize_i8(self, v: i8) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_i8(v)
    }

    fn serialize_i16(self, v: i16) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_i16(v)
    }

    fn serialize_i32(self, v: i32) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_i32(v)
    }

    fn serialize_i64(self, v: i64) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_i64(v)
    }

    fn serialize_i128(self, v: i128) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_i128(v)
    }

    fn serialize_u8(self, v: u8) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_u8(v)
    }

    fn serialize_u16(self, v: u16) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_u16(v)
    }

    fn serialize_u32(self, v: u32) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_u32(v)
    }

    fn serialize_u64(self, v: u64) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_u64(v)
    }

    fn serialize_u128(self, v: u128) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_u128(v)
    }

    fn serialize_f32(self, v: f32) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_f32(v)
    }

    fn serialize_f64(self, v: f64) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_f64(v)
    }

    fn serialize_char(self, v: char) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_char(v)
    }

    fn serialize_str(self, v: &str) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_str(v)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, Error> {
        serde_json::value::Serializer.serialize_bytes(v)
    }

    fn serialize_none(self) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Value, Error> {
        Ok(Value::String(variant.to_owned()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, Error> {
        Ok(tagged(variant, value.serialize(self)?))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<ArrayBuilder, Error> {
        Ok(ArrayBuilder::new(None, len.unwrap_or(0)))
    }

    fn serialize_tuple(self, len: usize) -> Result<ArrayBuilder, Error> {
        Ok(ArrayBuilder::new(None, len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<ArrayBuilder, Error> {
        Ok(ArrayBuilder::new(None, len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<ArrayBuilder, Error> {
        Ok(ArrayBuilder::new(Some(variant), len))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<ObjectBuilder, Error> {
        Ok(ObjectBuilder::new(None))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<ObjectBuilder, Error> {
        Ok(ObjectBuilder::new(None))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<ObjectBuilder, Error> {
        Ok(ObjectBuilder::new(Some(variant)))
    }
}

/// Collects the elements of sequences and tuples (optionally tagged with an enum variant).
struct ArrayBuilder {
    variant: Option<&'static str>,
    items: Vec<Value>,
}

impl ArrayBuilder {
    fn new(variant: Option<&'static str>, len: usize) -> Self {
        ArrayBuilder {
            variant,
            items: Vec::with_capacity(len),
        }
    }

    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn finish(self) -> Result<Value, Error> {
        let array = Value::Array(self.items);
        Ok(match self.variant {
            Some(variant) => tagged(variant, array),
            None => array,
        })
    }
}

impl SerializeSeq for ArrayBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.push(value)
    }

    fn end(self) -> Result<Value, Error> {
        self.finish()
    }
}

impl SerializeTuple for ArrayBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.push(value)
    }

    fn end(self) -> Result<Value, Error> {
        self.finish()
    }
}

impl SerializeTupleStruct for ArrayBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.push(value)
    }

    fn end(self) -> Result<Value, Error> {
        self.finish()
    }
}

impl SerializeTupleVariant for ArrayBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        self.push(value)
    }

    fn end(self) -> Result<Value, Error> {
        self.finish()
    }
}

/// Collects the entries of maps and structs (optionally tagged with an enum variant).
struct ObjectBuilder {
    variant: Option<&'static str>,
    entries: Map<String, Value>,
    pending_key: Option<String>,
}

impl ObjectBuilder {
    fn new(variant: Option<&'static str>) -> Self {
        ObjectBuilder {
            variant,
            entries: Map::new(),
            pending_key: None,
        }
    }

    fn put<T: Serialize + ?Sized>(&mut self, key: String, value: &T) -> Result<(), Error> {
        let _ = self.entries.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn finish(self) -> Result<Value, Error> {
        let object = Value::Object(self.entries);
        Ok(match self.variant {
            Some(variant) => tagged(variant, object),
            None => object,
        })
    }
}

impl SerializeMap for ObjectBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Error> {
        self.pending_key = Some(map_key(key)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| <Error as ser::Error>::custom("a map value was given without a key"))?;
        self.put(key, value)
    }

    fn end(self) -> Result<Value, Error> {
        self.finish()
    }
}

impl SerializeStruct for ObjectBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        self.put(key.to_owned(), value)
    }

    fn end(self) -> Result<Value, Error> {
        self.finish()
    }
}

impl SerializeStructVariant for ObjectBuilder {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        self.put(key.to_owned(), value)
    }

    fn end(self) -> Result<Value, Error> {
        self.finish()
    }
}
