use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a stream. Streams are totally ordered sequences of
/// [`Transaction`](crate::Transaction)s, one per logical entity.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        StreamId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        StreamId(id)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        StreamId(id.to_owned())
    }
}

impl Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A coarse subscription-level classifier. Many streams share a category;
/// unlike [`StreamId`] it carries no ordering guarantee on its own.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Category(String);

impl Category {
    pub fn new(category: impl Into<String>) -> Self {
        Category(category.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this category passes the given filter set. An empty filter
    /// set means "all categories".
    pub fn matches(&self, filter: &std::collections::HashSet<Category>) -> bool {
        filter.is_empty() || filter.contains(self)
    }
}

impl From<String> for Category {
    fn from(category: String) -> Self {
        Category(category)
    }
}

impl From<&str> for Category {
    fn from(category: &str) -> Self {
        Category(category.to_owned())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
