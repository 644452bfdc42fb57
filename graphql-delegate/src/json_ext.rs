//! Performance oriented JSON manipulation.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;

use crate::error::FetchError;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// Extension trait for [`serde_json_bytes::Value`].
pub trait ValueExt {
    /// Deep merges objects field by field. Arrays and scalars in `other` replace the value in
    /// `&mut self`.
    fn deep_merge(&mut self, other: Self);

    /// Returns the value found at `path`, if every segment of it exists.
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value>;

    /// Returns a mutable reference to the value at `path`, creating missing or null object members
    /// along the way.
    ///
    /// The whole walk is validated before anything is inserted, so on error `self` is untouched.
    fn entry_at_path<'a>(&'a mut self, path: &Path) -> Result<&'a mut Value, FetchError>;
}

impl ValueExt for Value {
    fn deep_merge(&mut self, other: Self) {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => {
                for (key, value) in b.into_iter() {
                    match a.get_mut(&key) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            a.insert(key, value);
                        }
                    }
                }
            }
            (a, b) => {
                *a = b;
            }
        }
    }

    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value> {
        let mut current = self;
        for element in path.iter() {
            current = match (element, current) {
                (PathElement::Key(key), Value::Object(object)) => object.get(key.as_str())?,
                (PathElement::Index(index), Value::Array(array)) => array.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn entry_at_path<'a>(&'a mut self, path: &Path) -> Result<&'a mut Value, FetchError> {
        validate_walk(self, path)?;

        let mut current = self;
        for element in path.iter() {
            current = match element {
                PathElement::Key(key) => {
                    if current.is_null() {
                        *current = Value::Object(Object::new());
                    }
                    match current {
                        Value::Object(object) => object
                            .entry(key.as_str())
                            .or_insert(Value::Null),
                        _ => return Err(conflict(path, "expected an object")),
                    }
                }
                PathElement::Index(index) => match current {
                    Value::Array(array) => array
                        .get_mut(*index)
                        .ok_or_else(|| conflict(path, "list index out of bounds"))?,
                    _ => return Err(conflict(path, "expected a list")),
                },
            };
        }
        Ok(current)
    }
}

/// Checks that `path` can be walked (and created where needed) without overwriting anything.
fn validate_walk(root: &Value, path: &Path) -> Result<(), FetchError> {
    let mut current = Some(root);
    for (depth, element) in path.iter().enumerate() {
        current = match (element, current) {
            // everything below a created member is created too
            (PathElement::Key(_), None | Some(Value::Null)) => None,
            (PathElement::Key(key), Some(Value::Object(object))) => object.get(key.as_str()),
            (PathElement::Index(index), Some(Value::Array(array))) => match array.get(*index) {
                Some(value) => Some(value),
                None => {
                    return Err(conflict(
                        &path.prefix(depth + 1),
                        "list index out of bounds",
                    ));
                }
            },
            (PathElement::Index(_), _) => {
                return Err(conflict(&path.prefix(depth + 1), "expected a list"));
            }
            (PathElement::Key(_), Some(_)) => {
                return Err(conflict(&path.prefix(depth + 1), "expected an object"));
            }
        };
    }
    Ok(())
}

fn conflict(path: &Path, reason: &str) -> FetchError {
    FetchError::MergeConflict {
        path: path.clone(),
        reason: reason.to_string(),
    }
}

/// A GraphQL path element that is composes of strings or numbers.
/// e.g `/book/3/name`
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index path element.
    Index(usize),

    /// A key path element.
    Key(String),
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Index(index) => write!(f, "{index}"),
            PathElement::Key(key) => write!(f, "{key}"),
        }
    }
}

impl From<usize> for PathElement {
    fn from(index: usize) -> Self {
        PathElement::Index(index)
    }
}

impl From<&str> for PathElement {
    fn from(key: &str) -> Self {
        PathElement::Key(key.to_string())
    }
}

impl From<String> for PathElement {
    fn from(key: String) -> Self {
        PathElement::Key(key)
    }
}

/// A path into the result document.
///
/// This can be composed of strings and numbers
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Default::default())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&PathElement> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    pub fn push(&mut self, element: PathElement) {
        self.0.push(element)
    }

    /// The path without its last element; the root is its own parent.
    pub fn parent(&self) -> Path {
        self.prefix(self.len().saturating_sub(1))
    }

    /// The first `len` elements.
    pub fn prefix(&self, len: usize) -> Path {
        Path(self.0[..len.min(self.len())].to_vec())
    }

    /// Everything after the first `len` elements.
    pub fn suffix(&self, len: usize) -> Path {
        Path(self.0[len.min(self.len())..].to_vec())
    }

    /// Every prefix of this path, from the root to the path itself.
    pub fn prefixes(&self) -> impl Iterator<Item = Path> + '_ {
        (0..=self.len()).map(|len| self.prefix(len))
    }

    /// The topic name under which values at this path are published.
    ///
    /// Elements are joined with `.`, the root is the empty string.
    pub fn topic(&self) -> String {
        self.to_string()
    }
}

impl<T> From<T> for Path
where
    T: AsRef<str>,
{
    fn from(s: T) -> Self {
        Self(
            s.as_ref()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(s.to_string()),
                })
                .collect(),
        )
    }
}

impl FromIterator<PathElement> for Path {
    fn from_iter<I: IntoIterator<Item = PathElement>>(iter: I) -> Self {
        Path(iter.into_iter().collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}
