use std::collections::HashMap;

use crate::error::CoreError;
use crate::{Result, ZeroCopyTensor};

/// Named tensors passed to or returned from a model.
///
/// Holds handles, not data: inserting a buffer from the store and reading it
/// back yields the same backing.
#[derive(Debug, Clone, Default)]
pub struct FeatureMap {
    features: HashMap<String, ZeroCopyTensor>,
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ZeroCopyTensor) -> Option<ZeroCopyTensor> {
        self.features.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&ZeroCopyTensor> {
        self.features.get(name)
    }

    /// Like [`get`](Self::get) but a missing name is an error.
    pub fn require(&self, name: &str) -> Result<&ZeroCopyTensor> {
        self.features
            .get(name)
            .ok_or_else(|| CoreError::MissingFeature(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ZeroCopyTensor> {
        self.features.remove(name)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ZeroCopyTensor)> {
        self.features.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, ZeroCopyTensor)> for FeatureMap {
    fn from_iter<I: IntoIterator<Item = (String, ZeroCopyTensor)>>(iter: I) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FeatureMap {
    type Item = (String, ZeroCopyTensor);
    type IntoIter = std::collections::hash_map::IntoIter<String, ZeroCopyTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.features.into_iter()
    }
}
