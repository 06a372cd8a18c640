// src/path.rs - Hierarchical dotted names of system entities
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = '.';

/// Hierarchical, dotted name of a system entity, e.g. `SC.AOCS.GYRO1.TEMP`.
///
/// The first segment is the root container of the monitored system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityPath(String);

impl EntityPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Last segment of the path, used as the entity name
    pub fn last_element(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or(&self.0)
    }

    /// Path of the containing entity, `None` for the root
    pub fn parent(&self) -> Option<EntityPath> {
        self.0
            .rfind(SEPARATOR)
            .map(|idx| EntityPath(self.0[..idx].to_string()))
    }

    pub fn child(&self, name: &str) -> EntityPath {
        EntityPath(format!("{}{}{}", self.0, SEPARATOR, name))
    }

    /// True if `self` lies strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &EntityPath) -> bool {
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0[ancestor.0.len()..].starts_with(SEPARATOR)
    }

    /// Every ancestor path, root first
    pub fn ancestors(&self) -> Vec<EntityPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            out.push(p);
        }
        out.reverse();
        out
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.segments().all(|s| !s.is_empty())
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EntityPath::new(s))
    }
}

impl From<&str> for EntityPath {
    fn from(s: &str) -> Self {
        EntityPath::new(s)
    }
}

impl From<String> for EntityPath {
    fn from(s: String) -> Self {
        EntityPath(s)
    }
}
