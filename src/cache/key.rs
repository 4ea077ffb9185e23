//! Structured cache keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A single primitive segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
}

impl fmt::Display for KeySegment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => f.write_str("null"),
      Self::Bool(b) => write!(f, "{}", b),
      Self::Int(i) => write!(f, "{}", i),
      Self::Str(s) => f.write_str(s),
    }
  }
}

impl From<&str> for KeySegment {
  fn from(s: &str) -> Self {
    Self::Str(s.to_string())
  }
}

impl From<String> for KeySegment {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

impl From<&String> for KeySegment {
  fn from(s: &String) -> Self {
    Self::Str(s.clone())
  }
}

impl From<i64> for KeySegment {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<bool> for KeySegment {
  fn from(b: bool) -> Self {
    Self::Bool(b)
  }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(Self::Null)
  }
}

/// Identity of a cached query result, e.g. `["bookings", "list", "p1"]`.
///
/// Keys compare segment by segment, so `["booking"]` is a prefix of
/// `["booking", "b1"]` while `["book"]` is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
  pub fn new(segments: Vec<KeySegment>) -> Self {
    Self(segments)
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Append a segment, returning the extended key.
  pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
    self.0.push(segment.into());
    self
  }

  /// Segment-wise prefix test. The empty key is a prefix of every key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Stable fixed-length digest used as the durable-store primary key.
  pub fn storage_hash(&self) -> String {
    // Canonical JSON form: untagged segments keep "1" and 1 distinct.
    let canonical = serde_json::to_string(&self.0).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(":")?;
      }
      write!(f, "{}", segment)?;
    }
    Ok(())
  }
}

impl<S: Into<KeySegment>> FromIterator<S> for QueryKey {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self(iter.into_iter().map(Into::into).collect())
  }
}

/// Build a [`QueryKey`] from a list of segment-convertible values.
///
/// ```ignore
/// let key = query_key!["booking", booking_id];
/// ```
#[macro_export]
macro_rules! query_key {
  ($($segment:expr),* $(,)?) => {
    $crate::cache::QueryKey::new(vec![$($crate::cache::KeySegment::from($segment)),*])
  };
}
