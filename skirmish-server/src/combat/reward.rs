//! Reward payload reported at combat end.
//!
//! The engine only computes and reports rewards. Applying them to characters
//! and inventories belongs to whoever consumes the session archive.

use serde::{Deserialize, Serialize};

use super::phase::EndReason;
use super::state::{CombatSession, CombatantStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    #[serde(default)]
    pub experience: u64,
    #[serde(default)]
    pub currency: u64,
    #[serde(default)]
    pub items: Vec<String>,
}

impl Reward {
    pub fn new(experience: u64, currency: u64) -> Self {
        Self {
            experience,
            currency,
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.items.push(item.into());
        self
    }

    pub fn merge(&mut self, other: &Reward) {
        self.experience = self.experience.saturating_add(other.experience);
        self.currency = self.currency.saturating_add(other.currency);
        self.items.extend(other.items.iter().cloned());
    }
}

/// Rewards for a concluded session.
///
/// Only a victory pays out: the bounties of every defeated hostile, in
/// combatant id order.
pub fn settle(session: &CombatSession, reason: EndReason) -> Option<Reward> {
    if reason != EndReason::Victory {
        return None;
    }

    let mut total = Reward::default();
    for combatant in session.combatants.values() {
        if !combatant.is_player_aligned() && combatant.status == CombatantStatus::Defeated {
            total.merge(&combatant.bounty);
        }
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_saturates() {
        let mut a = Reward::new(u64::MAX - 1, 5).with_item("potion");
        a.merge(&Reward::new(10, 5).with_item("sword"));

        assert_eq!(a.experience, u64::MAX);
        assert_eq!(a.currency, 10);
        assert_eq!(a.items, vec!["potion".to_string(), "sword".to_string()]);
    }

    #[test]
    fn test_missing_fields_default() {
        let reward: Reward = serde_json::from_str(r#"{"experience": 40}"#).unwrap();
        assert_eq!(reward, Reward::new(40, 0));
    }
}
