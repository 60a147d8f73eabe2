//! Query keys.
//!
//! A [`QueryKey`] is an ordered path of primitive parts such as
//! `["clubs", "detail", 42]`. Keys are compared through their canonical JSON
//! form, which is also what the cache uses as its map key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Null,
    Bool(bool),
    /// Integer or finite float. `1` and `1.0` are different parts.
    Number(Number),
    Str(String),
    Seq(Vec<KeyPart>),
}

impl From<&KeyPart> for Value {
    fn from(part: &KeyPart) -> Self {
        match part {
            KeyPart::Null => Self::Null,
            KeyPart::Bool(b) => Self::Bool(*b),
            KeyPart::Number(n) => Self::Number(n.clone()),
            KeyPart::Str(s) => Self::String(s.clone()),
            KeyPart::Seq(parts) => Self::Array(parts.iter().map(Self::from).collect()),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

macro_rules! int_key_part {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeyPart {
                fn from(value: $ty) -> Self {
                    Self::Number(Number::from(value))
                }
            }
        )*
    };
}

int_key_part!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

// Non-finite floats have no JSON form and become null. Negative zero is
// folded into zero so that equal parts always print the same.
impl From<f64> for KeyPart {
    fn from(value: f64) -> Self {
        let value = if value == 0.0 { 0.0 } else { value };
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<f32> for KeyPart {
    fn from(value: f32) -> Self {
        Self::from(f64::from(value))
    }
}

impl<P: Into<KeyPart>> From<Option<P>> for KeyPart {
    fn from(value: Option<P>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<P: Into<KeyPart>> From<Vec<P>> for KeyPart {
    fn from(value: Vec<P>) -> Self {
        Self::Seq(value.into_iter().map(Into::into).collect())
    }
}

/// An ordered key identifying a cached resource.
///
/// # Example
///
/// ```
/// use humidor::{QueryKey, query_key};
///
/// let key = query_key!["clubs", "detail", 42];
/// assert_eq!(key.to_string(), r#"["clubs","detail",42]"#);
/// assert!(key.starts_with(&query_key!["clubs", "detail"]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self(parts.into_iter().collect())
    }

    /// Returns the parts of this key.
    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new key with `part` appended.
    #[must_use]
    pub fn join(&self, part: impl Into<KeyPart>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }

    /// Returns a new key with every part of `parts` appended.
    #[must_use]
    pub fn extend<P: Into<KeyPart>>(&self, parts: impl IntoIterator<Item = P>) -> Self {
        let mut joined = self.0.clone();
        joined.extend(parts.into_iter().map(Into::into));
        Self(joined)
    }

    /// Returns `true` if `prefix` is an initial sub-sequence of this key.
    ///
    /// An empty prefix matches every key, and a key always matches itself.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The canonical string form used as the cache map key.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = Value::Array(self.0.iter().map(Value::from).collect());
        write!(f, "{value}")
    }
}

impl<P: Into<KeyPart>, const N: usize> From<[P; N]> for QueryKey {
    fn from(parts: [P; N]) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl<P: Into<KeyPart>> From<Vec<P>> for QueryKey {
    fn from(parts: Vec<P>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

/// Builds a [`QueryKey`] from a list of mixed-type parts.
///
/// ```
/// use humidor::query_key;
///
/// let key = query_key!["user", 42, true];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::QueryKey::new(::std::vec![$($crate::KeyPart::from($part)),*])
    };
}
