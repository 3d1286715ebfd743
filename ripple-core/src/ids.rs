//! Entity Identifiers
//!
//! Every addressable world object is named by a tagged identifier of the
//! form `TAG#key`, e.g. `VARIABLE#power` or `ROOM#lobby`. The tag decides
//! how the cascade scheduler treats the entity; the key is opaque.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The kind of entity an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityTag {
    Asset,
    Variable,
    Computed,
    Room,
    Feature,
    Bookmark,
    Map,
    Character,
    Message,
    Knowledge,
}

impl EntityTag {
    pub const ALL: [EntityTag; 10] = [
        EntityTag::Asset,
        EntityTag::Variable,
        EntityTag::Computed,
        EntityTag::Room,
        EntityTag::Feature,
        EntityTag::Bookmark,
        EntityTag::Map,
        EntityTag::Character,
        EntityTag::Message,
        EntityTag::Knowledge,
    ];

    /// The upper-case prefix used in identifiers.
    pub fn prefix(self) -> &'static str {
        match self {
            EntityTag::Asset => "ASSET",
            EntityTag::Variable => "VARIABLE",
            EntityTag::Computed => "COMPUTED",
            EntityTag::Room => "ROOM",
            EntityTag::Feature => "FEATURE",
            EntityTag::Bookmark => "BOOKMARK",
            EntityTag::Map => "MAP",
            EntityTag::Character => "CHARACTER",
            EntityTag::Message => "MESSAGE",
            EntityTag::Knowledge => "KNOWLEDGE",
        }
    }

    /// The capitalized name used in meta range keys (`Meta::Computed`).
    pub fn name(self) -> &'static str {
        match self {
            EntityTag::Asset => "Asset",
            EntityTag::Variable => "Variable",
            EntityTag::Computed => "Computed",
            EntityTag::Room => "Room",
            EntityTag::Feature => "Feature",
            EntityTag::Bookmark => "Bookmark",
            EntityTag::Map => "Map",
            EntityTag::Character => "Character",
            EntityTag::Message => "Message",
            EntityTag::Knowledge => "Knowledge",
        }
    }
}

impl FromStr for EntityTag {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityTag::ALL
            .into_iter()
            .find(|tag| tag.prefix().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownTag(s.to_string()))
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Tagged identifier of a world entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    tag: EntityTag,
    key: String,
}

impl EntityId {
    pub fn new(tag: EntityTag, key: impl Into<String>) -> Self {
        Self {
            tag,
            key: key.into(),
        }
    }

    pub fn variable(key: impl Into<String>) -> Self {
        Self::new(EntityTag::Variable, key)
    }

    pub fn computed(key: impl Into<String>) -> Self {
        Self::new(EntityTag::Computed, key)
    }

    pub fn room(key: impl Into<String>) -> Self {
        Self::new(EntityTag::Room, key)
    }

    pub fn map(key: impl Into<String>) -> Self {
        Self::new(EntityTag::Map, key)
    }

    pub fn tag(&self) -> EntityTag {
        self.tag
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl FromStr for EntityId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, key) = s
            .split_once('#')
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        if key.is_empty() {
            return Err(CoreError::MalformedId(s.to_string()));
        }
        Ok(Self::new(tag.parse()?, key))
    }
}

impl TryFrom<String> for EntityId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tag.prefix(), self.key)
    }
}

/// Key of the asset contributing an edge.
///
/// Assets are the unit of edge multiplicity: an edge lives as long as at
/// least one asset still contributes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AssetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
