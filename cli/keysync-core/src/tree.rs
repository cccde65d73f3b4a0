use std::fmt::{self, Formatter};

use indexmap::IndexMap;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;

/// The payload of a single secret.
///
/// A tree is either a scalar, an ordered sequence, a set (a sequence
/// carrying uniqueness semantics), or a mapping. Mapping key order is
/// preserved as read but is irrelevant for equality; sequence element
/// order is significant.
///
/// Sets cannot be expressed in plain JSON input and are only produced
/// programmatically via [`SecretTree::set`]; they deserialize from and
/// serialize to plain arrays.
#[derive(Debug, Clone)]
pub enum SecretTree {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Sequence(Vec<SecretTree>),
    Set(Vec<SecretTree>),
    Mapping(IndexMap<String, SecretTree>),
}

impl SecretTree {
    /// An empty mapping, the left identity of the merge operation.
    pub fn empty() -> Self {
        Self::Mapping(IndexMap::new())
    }

    /// Build a set, deduplicating while preserving first-occurrence order.
    pub fn set(values: impl IntoIterator<Item = SecretTree>) -> Self {
        let mut unique: Vec<SecretTree> = Vec::new();
        for value in values {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        Self::Set(unique)
    }

    pub fn is_empty_mapping(&self) -> bool {
        matches!(self, Self::Mapping(entries) if entries.is_empty())
    }

    /// Total number of nodes in the tree, counting this one.
    pub fn node_count(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => 1,
            Self::Sequence(items) | Self::Set(items) => {
                1 + items.iter().map(SecretTree::node_count).sum::<usize>()
            },
            Self::Mapping(entries) => {
                1 + entries.values().map(SecretTree::node_count).sum::<usize>()
            },
        }
    }

    /// Human-readable name of the node kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Set(_) => "set",
            Self::Mapping(_) => "mapping",
        }
    }

    /// Encode as canonical JSON: mapping keys sorted, UTF-8, no trailing
    /// newline. Two deep-equal trees encode to identical bytes, which makes
    /// blob store contents comparable by hash.
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        self.write_canonical(&mut out)?;
        Ok(out)
    }

    fn write_canonical(&self, out: &mut String) -> serde_json::Result<()> {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(value) => out.push_str(if *value { "true" } else { "false" }),
            Self::Number(value) => out.push_str(&value.to_string()),
            Self::String(value) => out.push_str(&serde_json::to_string(value)?),
            Self::Sequence(items) | Self::Set(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out)?;
                }
                out.push(']');
            },
            Self::Mapping(entries) => {
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key)?);
                    out.push(':');
                    entries[key].write_canonical(out)?;
                }
                out.push('}');
            },
        }
        Ok(())
    }
}

/// Deep equality: mappings compare key-order-insensitively, sequences
/// elementwise in order, sets as unordered collections, scalars by value
/// and type.
impl PartialEq for SecretTree {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Sequence(a), Self::Sequence(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => {
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            },
            (Self::Mapping(a), Self::Mapping(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| b.get(key) == Some(value))
            },
            _ => false,
        }
    }
}

impl Eq for SecretTree {}

impl Serialize for SecretTree {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Number(value) => value.serialize(serializer),
            Self::String(value) => serializer.serialize_str(value),
            Self::Sequence(items) | Self::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            },
            Self::Mapping(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            },
        }
    }
}

struct TreeVisitor;

impl<'de> Visitor<'de> for TreeVisitor {
    type Value = SecretTree;

    fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("a JSON-shaped secret value")
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(SecretTree::Null)
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(SecretTree::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TreeVisitor)
    }

    fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
        Ok(SecretTree::Bool(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
        Ok(SecretTree::Number(value.into()))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
        Ok(SecretTree::Number(value.into()))
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Number::from_f64(value)
            .map(SecretTree::Number)
            .ok_or_else(|| E::custom("non-finite numbers are not representable"))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
        Ok(SecretTree::String(value.to_string()))
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
        Ok(SecretTree::String(value))
    }

    fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some(item) = access.next_element()? {
            items.push(item);
        }
        Ok(SecretTree::Sequence(items))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, SecretTree>()? {
            entries.insert(key, value);
        }
        Ok(SecretTree::Mapping(entries))
    }
}

impl<'de> Deserialize<'de> for SecretTree {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TreeVisitor)
    }
}

impl From<&str> for SecretTree {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for SecretTree {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for SecretTree {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SecretTree {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl<const N: usize> From<[(&str, SecretTree); N]> for SecretTree {
    fn from(entries: [(&str, SecretTree); N]) -> Self {
        Self::Mapping(
            entries
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }
}
