//! Table selection for traversal.
//!
//! Only one selection is active at a time: installing a new predicate replaces
//! the previous one, whether it came from name lists or a predicate builder.

use crate::error::ConfigError;

pub type PagePredicate<'a> = Box<dyn Fn(&str) -> bool + 'a>;

pub enum PageSelection<'a> {
    All,
    Only(PagePredicate<'a>),
}

impl<'a> PageSelection<'a> {
    /// Selection from constructor name lists; both lists set is an error.
    pub fn from_lists(only: Vec<String>, skip: Vec<String>) -> Result<Self, ConfigError> {
        match (only.is_empty(), skip.is_empty()) {
            (false, false) => Err(ConfigError::ConflictingPageFilters),
            (false, true) => Ok(Self::only_if(move |name| only.iter().any(|p| p == name))),
            (true, false) => Ok(Self::skip_if(move |name| skip.iter().any(|p| p == name))),
            (true, true) => Ok(Self::All),
        }
    }

    pub fn only_if(predicate: impl Fn(&str) -> bool + 'a) -> Self {
        Self::Only(Box::new(predicate))
    }

    /// Stored as the complement so it lands in the same "only" slot.
    pub fn skip_if(predicate: impl Fn(&str) -> bool + 'a) -> Self {
        Self::Only(Box::new(move |name: &str| !predicate(name)))
    }

    pub fn select(&self, names: &[String]) -> Vec<String> {
        match self {
            Self::All => names.to_vec(),
            Self::Only(predicate) => names
                .iter()
                .filter(|name| predicate(name.as_str()))
                .cloned()
                .collect(),
        }
    }
}

impl std::fmt::Debug for PageSelection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Only(_) => f.write_str("Only(..)"),
        }
    }
}
