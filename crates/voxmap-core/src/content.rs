//! Content (node type) definitions.
//!
//! The registry maps [`ContentId`]s to their [`ContentFeatures`]. The three
//! reserved ids (unknown, air, ignore) are always present.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ContentId;

/// How a node is drawn; generation code uses it to tell air and liquids apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrawType {
    #[default]
    Normal,
    AirLike,
    Liquid,
    FlowingLiquid,
}

/// Liquid behaviour of a content type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiquidType {
    #[default]
    None,
    Source,
    Flowing,
}

/// Static properties of one content type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentFeatures {
    /// Unique name, e.g. `"default:stone"`
    pub name: String,
    pub drawtype: DrawType,
    /// Whether entities collide with it
    pub walkable: bool,
    /// Whether caves and dungeons may carve through it
    pub is_ground_content: bool,
    /// Whether liquids may flow into (and replace) it
    pub floodable: bool,
    pub liquid_type: LiquidType,
    /// Name of the flowing variant of this liquid
    pub liquid_alternative_flowing: Option<String>,
    /// Name of the source variant of this liquid
    pub liquid_alternative_source: Option<String>,
    /// How many nodes a liquid flows away from its source (1-8)
    pub liquid_range: u8,
    /// Whether two sources next to each other create a new source
    pub liquid_renewable: bool,
}

impl ContentFeatures {
    /// Solid, walkable ground content with the given name
    pub fn solid(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            drawtype: DrawType::Normal,
            walkable: true,
            is_ground_content: true,
            floodable: false,
            liquid_type: LiquidType::None,
            liquid_alternative_flowing: None,
            liquid_alternative_source: None,
            liquid_range: 0,
            liquid_renewable: false,
        }
    }

    /// Non-walkable, floodable content drawn as nothing
    pub fn airlike(name: impl Into<String>) -> Self {
        Self {
            drawtype: DrawType::AirLike,
            walkable: false,
            is_ground_content: false,
            floodable: true,
            ..Self::solid(name)
        }
    }

    /// Liquid source/flowing pair sharing the given names
    pub fn liquid_pair(source: &str, flowing: &str, range: u8, renewable: bool) -> [Self; 2] {
        let base = Self {
            walkable: false,
            is_ground_content: false,
            liquid_alternative_flowing: Some(flowing.to_owned()),
            liquid_alternative_source: Some(source.to_owned()),
            liquid_range: range,
            liquid_renewable: renewable,
            ..Self::solid(source)
        };
        [
            Self {
                drawtype: DrawType::Liquid,
                liquid_type: LiquidType::Source,
                ..base.clone()
            },
            Self {
                name: flowing.to_owned(),
                drawtype: DrawType::FlowingLiquid,
                liquid_type: LiquidType::Flowing,
                ..base
            },
        ]
    }

    /// Returns true for liquid sources and flowing liquids
    #[inline]
    pub fn is_liquid(&self) -> bool {
        self.liquid_type != LiquidType::None
    }
}

/// Registry of all known content types.
#[derive(Clone, Debug)]
pub struct NodeRegistry {
    features: Vec<Option<ContentFeatures>>,
    by_name: HashMap<String, ContentId>,
    next_free: u16,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create a registry holding only the builtin contents.
    pub fn new() -> Self {
        let mut registry = Self {
            features: Vec::new(),
            by_name: HashMap::new(),
            next_free: 0,
        };
        registry.insert(ContentId::UNKNOWN, ContentFeatures::solid("unknown"));
        registry.insert(ContentId::AIR, ContentFeatures::airlike("air"));
        registry.insert(
            ContentId::IGNORE,
            ContentFeatures {
                drawtype: DrawType::AirLike,
                walkable: false,
                is_ground_content: false,
                ..ContentFeatures::solid("ignore")
            },
        );
        registry
    }

    /// Registry with the builtin contents plus the default game set:
    /// stone, dirt, grass, cobble, mossy cobble, cobble stairs and water.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let mut defaults = vec![
            ContentFeatures::solid("default:stone"),
            ContentFeatures::solid("default:dirt"),
            ContentFeatures::solid("default:dirt_with_grass"),
            ContentFeatures {
                is_ground_content: false,
                ..ContentFeatures::solid("default:cobble")
            },
            ContentFeatures {
                is_ground_content: false,
                ..ContentFeatures::solid("default:mossycobble")
            },
            ContentFeatures {
                is_ground_content: false,
                ..ContentFeatures::solid("stairs:stair_cobble")
            },
        ];
        defaults.extend(ContentFeatures::liquid_pair(
            "default:water_source",
            "default:water_flowing",
            8,
            true,
        ));
        for features in defaults {
            // Names are unique and ids are plentiful, so registration cannot fail here.
            let _ = registry.register(features);
        }
        registry
    }

    /// Register a new content type and return its id.
    pub fn register(&mut self, features: ContentFeatures) -> Result<ContentId> {
        if self.by_name.contains_key(&features.name) {
            return Err(Error::InvalidData(format!(
                "content {} is already registered",
                features.name
            )));
        }
        while ContentId(self.next_free).is_reserved() {
            self.next_free += 1;
        }
        if self.next_free == u16::MAX {
            return Err(Error::InvalidData("content id space exhausted".into()));
        }
        let id = ContentId(self.next_free);
        self.next_free += 1;
        self.insert(id, features);
        Ok(id)
    }

    fn insert(&mut self, id: ContentId, features: ContentFeatures) {
        let index = id.0 as usize;
        if self.features.len() <= index {
            self.features.resize(index + 1, None);
        }
        self.by_name.insert(features.name.clone(), id);
        self.features[index] = Some(features);
    }

    /// Features of a content id; unregistered ids resolve to `unknown`.
    pub fn get(&self, id: ContentId) -> &ContentFeatures {
        self.features
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .or_else(|| self.features[ContentId::UNKNOWN.0 as usize].as_ref())
            .unwrap_or_else(|| unreachable!("builtin contents are always registered"))
    }

    /// Look up a content id by name
    pub fn id(&self, name: &str) -> Option<ContentId> {
        self.by_name.get(name).copied()
    }

    /// Look up a content id by name, failing with `NotFound`
    pub fn require(&self, name: &str) -> Result<ContentId> {
        self.id(name)
            .ok_or_else(|| Error::NotFound(format!("content {name}")))
    }

    /// Flowing variant of a liquid, if it has one
    pub fn flowing_of(&self, id: ContentId) -> Option<ContentId> {
        self.get(id)
            .liquid_alternative_flowing
            .as_deref()
            .and_then(|name| self.id(name))
    }

    /// Source variant of a liquid, if it has one
    pub fn source_of(&self, id: ContentId) -> Option<ContentId> {
        self.get(id)
            .liquid_alternative_source
            .as_deref()
            .and_then(|name| self.id(name))
    }

    /// Number of registered contents, builtins included
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Always false: builtins are registered on construction
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
