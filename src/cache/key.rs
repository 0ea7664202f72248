//! Structural cache keys.

use sha2::{Digest, Sha256};
use std::fmt;

/// One scalar component of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
  Str(String),
  Int(i64),
  Bool(bool),
  Null,
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<&String> for KeyPart {
  fn from(s: &String) -> Self {
    KeyPart::Str(s.clone())
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<u32> for KeyPart {
  fn from(n: u32) -> Self {
    KeyPart::Int(i64::from(n))
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(KeyPart::Null)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Str(s) => write!(f, "{:?}", s),
      KeyPart::Int(n) => write!(f, "{}", n),
      KeyPart::Bool(b) => write!(f, "{}", b),
      KeyPart::Null => write!(f, "null"),
    }
  }
}

/// Ordered scalar sequence identifying one logical query.
///
/// Keys compare structurally. Trailing `Null` parts are dropped on
/// construction, so `["posts", null]` and `["posts"]` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<KeyPart>);

impl CacheKey {
  pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
    let mut parts: Vec<KeyPart> = parts.into_iter().collect();
    while parts.last() == Some(&KeyPart::Null) {
      parts.pop();
    }
    Self(parts)
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// Stable SHA-256 digest of the key, used to tag log lines.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ",")?;
      }
      write!(f, "{}", part)?;
    }
    write!(f, "]")
  }
}

/// Build a [`CacheKey`] from anything convertible into [`KeyPart`].
///
/// ```ignore
/// let key = cache_key!["profile-day", username, day];
/// ```
#[macro_export]
macro_rules! cache_key {
  ($($part:expr),* $(,)?) => {
    $crate::cache::CacheKey::new(vec![$($crate::cache::KeyPart::from($part)),*])
  };
}
