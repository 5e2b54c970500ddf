//! String-keyed property map carrying module configuration and commands.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Int32(i32),
    Float32(f32),
    String(String),
}

impl PropertyValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Int32(_) => "int32",
            Self::Float32(_) => "float32",
            Self::String(_) => "string",
        }
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<f32> for PropertyValue {
    fn from(value: f32) -> Self {
        Self::Float32(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
        }
    }
}

/// Types that can be read out of a [`PropertyValue`]
pub trait FromProperty: Sized {
    /// Name used in type-mismatch errors
    const TYPE_NAME: &'static str;

    fn from_property(value: &PropertyValue) -> Option<Self>;
}

impl FromProperty for i32 {
    const TYPE_NAME: &'static str = "int32";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Int32(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromProperty for f32 {
    const TYPE_NAME: &'static str = "float32";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Float32(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromProperty for String {
    const TYPE_NAME: &'static str = "string";

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Property lookup errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    #[error("property '{0}' not found")]
    NotFound(String),

    #[error("property '{key}' has type {actual}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl From<PropertyError> for xbar_core::Error {
    fn from(err: PropertyError) -> Self {
        Self::InvalidParam(err.to_string())
    }
}

/// Ordered string-keyed map with typed access
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style [`set`](Self::set)
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Typed lookup with an explicit not-found result
    pub fn get<T: FromProperty>(&self, key: &str) -> Result<T, PropertyError> {
        let value = self
            .entries
            .get(key)
            .ok_or_else(|| PropertyError::NotFound(key.to_string()))?;
        T::from_property(value).ok_or_else(|| PropertyError::TypeMismatch {
            key: key.to_string(),
            expected: T::TYPE_NAME,
            actual: value.type_name(),
        })
    }

    /// Typed lookup that falls back to `default` only when the key is absent
    pub fn get_or<T: FromProperty>(&self, key: &str, default: T) -> Result<T, PropertyError> {
        match self.get(key) {
            Err(PropertyError::NotFound(_)) => Ok(default),
            other => other,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
