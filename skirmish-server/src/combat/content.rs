//! Item and ability content lookup.
//!
//! Definitions are authored elsewhere. The engine only needs to resolve a
//! reference to its effects, and it needs the answer immediately: lookups are
//! synchronous and fail fast so one missing definition cannot stall a
//! session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("unknown item: {0}")]
    UnknownItem(String),

    #[error("unknown ability: {0}")]
    UnknownAbility(String),

    #[error("malformed content table: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Who an effect may be aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectTarget {
    /// Always the user.
    SelfOnly,
    /// The user or an active combatant on the user's side.
    Ally,
    /// An active hostile combatant.
    Enemy,
}

/// A single declared effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    Heal { amount: i32 },
    Damage { amount: i32 },
    Condition { tag: String, rounds: Option<u32> },
    RestoreMovement { amount: u32 },
}

/// Resolved definition of an item or ability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectDefinition {
    pub name: String,
    pub target: EffectTarget,
    /// Reach in cells; ignored for `self_only`.
    #[serde(default)]
    pub range: u32,
    pub effects: Vec<Effect>,
}

/// Source of item and ability definitions.
pub trait ContentCatalog: Send + Sync {
    fn item(&self, item_ref: &str) -> Result<EffectDefinition, ContentError>;

    fn ability(&self, ability_ref: &str) -> Result<EffectDefinition, ContentError>;
}

/// In-memory catalog, loadable from JSON.
///
/// ```json
/// {"items": {"potion": {"name": "Potion", "target": "self_only",
///   "effects": [{"kind": "heal", "amount": 8}]}}, "abilities": {}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTable {
    #[serde(default)]
    pub items: BTreeMap<String, EffectDefinition>,
    #[serde(default)]
    pub abilities: BTreeMap<String, EffectDefinition>,
}

impl ContentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ContentError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_item(mut self, item_ref: impl Into<String>, definition: EffectDefinition) -> Self {
        self.items.insert(item_ref.into(), definition);
        self
    }

    pub fn with_ability(
        mut self,
        ability_ref: impl Into<String>,
        definition: EffectDefinition,
    ) -> Self {
        self.abilities.insert(ability_ref.into(), definition);
        self
    }

    /// A small table with the stock consumables.
    pub fn starter() -> Self {
        Self::new()
            .with_item(
                "potion",
                EffectDefinition {
                    name: "Healing Potion".into(),
                    target: EffectTarget::SelfOnly,
                    range: 0,
                    effects: vec![Effect::Heal { amount: 8 }],
                },
            )
            .with_item(
                "firebomb",
                EffectDefinition {
                    name: "Firebomb".into(),
                    target: EffectTarget::Enemy,
                    range: 4,
                    effects: vec![Effect::Damage { amount: 6 }],
                },
            )
            .with_ability(
                "rally",
                EffectDefinition {
                    name: "Rally".into(),
                    target: EffectTarget::Ally,
                    range: 3,
                    effects: vec![
                        Effect::Heal { amount: 4 },
                        Effect::RestoreMovement { amount: 2 },
                    ],
                },
            )
            .with_ability(
                "stun",
                EffectDefinition {
                    name: "Stunning Blow".into(),
                    target: EffectTarget::Enemy,
                    range: 1,
                    effects: vec![Effect::Condition {
                        tag: "stunned".into(),
                        rounds: Some(1),
                    }],
                },
            )
    }
}

impl ContentCatalog for ContentTable {
    fn item(&self, item_ref: &str) -> Result<EffectDefinition, ContentError> {
        self.items
            .get(item_ref)
            .cloned()
            .ok_or_else(|| ContentError::UnknownItem(item_ref.to_string()))
    }

    fn ability(&self, ability_ref: &str) -> Result<EffectDefinition, ContentError> {
        self.abilities
            .get(ability_ref)
            .cloned()
            .ok_or_else(|| ContentError::UnknownAbility(ability_ref.to_string()))
    }
}
