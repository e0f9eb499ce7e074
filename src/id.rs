//! Hierarchical container identifiers.
//!
//! A container id optionally carries its parent's id; the transitive
//! closure of parent links forms a tree rooted at a top-level container.
//! The dotted rendering (`parent.child`) is what shows up in logs.

use serde::{Deserialize, Serialize};

/// Identifier for a container, optionally nested under a parent.
///
/// Ids are caller-assigned. The value itself must be usable as a path
/// component of the runtime and sandbox directory trees, so separators and
/// relative-path components are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    value: String,
    parent: Option<Box<ContainerId>>,
}

impl ContainerId {
    /// Creates a top-level container id.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid path component; use
    /// [`ContainerId::parse`] for fallible construction.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self::try_new(value).expect("invalid container id")
    }

    /// Fallible variant of [`ContainerId::new`].
    #[must_use]
    pub fn try_new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        is_valid_component(&value).then_some(Self {
            value,
            parent: None,
        })
    }

    /// Creates an id nested under `self`.
    #[must_use]
    pub fn child(&self, value: impl Into<String>) -> Self {
        self.try_child(value).expect("invalid container id")
    }

    /// Fallible variant of [`ContainerId::child`].
    #[must_use]
    pub fn try_child(&self, value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        is_valid_component(&value).then_some(Self {
            value,
            parent: Some(Box::new(self.clone())),
        })
    }

    /// Parses a dotted path (`a.b.c`) into a nested id.
    ///
    /// Returns `None` when any component is empty or not path-safe.
    #[must_use]
    pub fn parse(path: &str) -> Option<Self> {
        let mut id: Option<Self> = None;
        for component in path.split('.') {
            if !is_valid_component(component) {
                return None;
            }
            id = Some(match id {
                None => Self::new(component),
                Some(parent) => parent.child(component),
            });
        }
        id
    }

    /// The id's own component, without ancestry.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The direct parent, if this id is nested.
    #[must_use]
    pub fn parent(&self) -> Option<&ContainerId> {
        self.parent.as_deref()
    }

    /// Whether this id has a parent.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// The top-level ancestor (self for a top-level id).
    #[must_use]
    pub fn root(&self) -> &ContainerId {
        let mut id = self;
        while let Some(parent) = id.parent() {
            id = parent;
        }
        id
    }

    /// Components from the root down to this id.
    #[must_use]
    pub fn components(&self) -> Vec<&str> {
        let mut components = match self.parent() {
            Some(parent) => parent.components(),
            None => Vec::new(),
        };
        components.push(self.value.as_str());
        components
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{parent}.")?;
        }
        write!(f, "{}", self.value)
    }
}

fn is_valid_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '.', '\0'])
}
