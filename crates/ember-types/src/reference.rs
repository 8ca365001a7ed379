use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::id::EntityId;

/// Separator between backend identity and cache name.
///
/// Cache names are not allowed to contain it, so the last occurrence in a
/// qualified name always marks the boundary.
pub const QUALIFIER_SEPARATOR: char = '.';

/// Backend identity + cache name.
///
/// Qualified names are process-wide unique: two live caches with the same
/// qualified name would break the one-instance-per-object guarantee.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedCacheName {
    backend_identity: String,
    cache_name: String,
}

impl QualifiedCacheName {
    pub fn new(backend_identity: impl Into<String>, cache_name: impl Into<String>) -> Self {
        Self {
            backend_identity: backend_identity.into(),
            cache_name: cache_name.into(),
        }
    }

    pub fn backend_identity(&self) -> &str {
        &self.backend_identity
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }
}

impl FromStr for QualifiedCacheName {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(QUALIFIER_SEPARATOR) {
            Some((backend, cache)) if !backend.is_empty() && !cache.is_empty() => {
                Ok(Self::new(backend, cache))
            }
            _ => Err(TypeError::InvalidQualifiedName(s.to_string())),
        }
    }
}

impl fmt::Display for QualifiedCacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.backend_identity, QUALIFIER_SEPARATOR, self.cache_name
        )
    }
}

impl fmt::Debug for QualifiedCacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QualifiedCacheName({self})")
    }
}

/// Names a target entity without requiring it to be loaded.
///
/// Produced by an entity, consumed by a reference to resolve the target
/// later through the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReferenceData {
    pub backend_identity: String,
    pub cache_name: String,
    pub id: EntityId,
    /// Version of the target when the descriptor was taken.
    pub version: u64,
}

impl ReferenceData {
    pub fn qualified_cache_name(&self) -> QualifiedCacheName {
        QualifiedCacheName::new(self.backend_identity.clone(), self.cache_name.clone())
    }
}

/// Wire format of an object reference.
///
/// ```json
/// {"isNil": true}
/// {"isEager": false, "qualifiedCacheName": "memory:1.people", "id": "…", "version": 3}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedReference {
    Nil {
        #[serde(rename = "isNil")]
        is_nil: bool,
    },
    Target {
        #[serde(rename = "isEager")]
        is_eager: bool,
        #[serde(rename = "qualifiedCacheName")]
        qualified_cache_name: String,
        id: EntityId,
        version: u64,
    },
}

impl SerializedReference {
    pub fn nil() -> Self {
        Self::Nil { is_nil: true }
    }

    pub fn from_data(data: Option<&ReferenceData>, is_eager: bool) -> Self {
        match data {
            None => Self::nil(),
            Some(data) => Self::Target {
                is_eager,
                qualified_cache_name: data.qualified_cache_name().to_string(),
                id: data.id,
                version: data.version,
            },
        }
    }

    /// Decode into a descriptor and the eager flag. `None` for nil.
    pub fn into_parts(self) -> Result<(Option<ReferenceData>, bool), TypeError> {
        match self {
            Self::Nil { is_nil: true } => Ok((None, false)),
            Self::Nil { is_nil: false } => Err(TypeError::Serialization(
                "reference without a target must carry isNil: true".into(),
            )),
            Self::Target {
                is_eager,
                qualified_cache_name,
                id,
                version,
            } => {
                let qualified: QualifiedCacheName = qualified_cache_name.parse()?;
                let data = ReferenceData {
                    backend_identity: qualified.backend_identity,
                    cache_name: qualified.cache_name,
                    id,
                    version,
                };
                Ok((Some(data), is_eager))
            }
        }
    }
}
