//! Ordered header and trailer collections.

use std::{collections::HashMap, slice};

/// An ordered multi-map from header name to one or more values.
///
/// Names keep the order in which they were first seen, and values keep insertion order within
/// a name. Names are compared byte for byte; whatever case and merge policy the host applied
/// before handing the collection over is preserved as-is.
#[derive(Clone, Debug, Default)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
    index: HashMap<String, usize>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map with room for `names` distinct names.
    pub fn with_capacity(names: usize) -> Self {
        Self {
            entries: Vec::with_capacity(names),
            index: HashMap::with_capacity(names),
        }
    }

    /// Append a value under `name`, after any values already present.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.index.get(&name) {
            Some(&i) => self.entries[i].1.push(value),
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, vec![value]));
            }
        }
    }

    /// Replace every value under `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.index.get(&name) {
            Some(&i) => self.entries[i].1 = vec![value.into()],
            None => self.append(name, value),
        }
    }

    /// Remove `name` and all of its values, returning the values if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let i = self.index.remove(name)?;
        let (_, values) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(values)
    }

    /// The first value under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Every value under `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.index
            .get(name)
            .map(|&i| self.entries[i].1.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of name/value pairs, counting repeated names once per value.
    pub fn pair_count(&self) -> usize {
        self.entries.iter().map(|(_, values)| values.len()).sum()
    }

    /// Total byte size of every name and value, counting a name once per value.
    ///
    /// This is the size the host reports when handing the collection over.
    pub fn byte_size(&self) -> usize {
        self.pairs().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Iterate over names with their grouped values.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.entries.iter(),
        }
    }

    /// Iterate over flattened `(name, value)` pairs, grouped by name in first-seen order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }
}

impl PartialEq for HeaderMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for HeaderMap {}

impl<K, V> FromIterator<(K, V)> for HeaderMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.append(name, value);
        }
        map
    }
}

pub struct Iter<'a> {
    inner: slice::Iter<'a, (String, Vec<String>)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a [String]);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = (&'a str, &'a [String]);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
