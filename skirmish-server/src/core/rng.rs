//! Deterministic dice.
//!
//! Every roll a session makes (initiative, hit checks, damage variance) comes
//! from one [`DeterministicRng`], so a session replays identically from the
//! same seed and command stream. The engine clones the generator into each
//! command transaction and keeps the clone only when the command commits, so
//! a rejected command never consumes rolls.
//!
//! The generator is Xorshift128+ with SplitMix64 seeding. It is not
//! cryptographic; it only has to be fast, portable and reproducible.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Seeded PRNG owned by one session.
///
/// ```
/// use skirmish::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = a.clone();
/// assert_eq!(a.roll_die(20), b.roll_die(20));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
    /// Draws taken so far, for diagnostics.
    draws: u64,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        let mut mix = seed;
        let mut state = [splitmix64(&mut mix), splitmix64(&mut mix)];
        if state == [0, 0] {
            state = [1, 1];
        }
        Self { state, draws: 0 }
    }

    /// Generator for a session without an explicit seed.
    pub fn for_session(session_id: &str, combatant_ids: &[&str]) -> Self {
        Self::new(derive_session_seed(session_id, combatant_ids))
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn next_u64(&mut self) -> u64 {
        let [s0, mut s1] = self.state;
        let out = s0.wrapping_add(s1);
        s1 ^= s0;
        self.state = [s0.rotate_left(24) ^ s1 ^ (s1 << 16), s1.rotate_left(37)];
        self.draws += 1;
        out
    }

    /// Uniform value in `0..bound`; 0 when `bound` is 0.
    pub fn below(&mut self, bound: u32) -> u32 {
        match bound {
            0 => 0,
            _ => (self.next_u64() % u64::from(bound)) as u32,
        }
    }

    /// Uniform value in `low..=high`. A reversed range yields `low`.
    pub fn between(&mut self, low: i32, high: i32) -> i32 {
        if high <= low {
            return low;
        }
        let span = (i64::from(high) - i64::from(low) + 1) as u64;
        (i64::from(low) + (self.next_u64() % span) as i64) as i32
    }

    /// One die with `sides` faces: `1..=sides`, or 0 for a zero-sided die.
    pub fn roll_die(&mut self, sides: u32) -> i32 {
        match sides {
            0 => 0,
            _ => self.below(sides.min(i32::MAX as u32)) as i32 + 1,
        }
    }

    /// True with probability `percent`/100. Values above 100 always pass.
    pub fn chance(&mut self, percent: u32) -> bool {
        self.below(100) < percent
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for a session from its id and roster.
///
/// Roster order does not matter; the ids are sorted before hashing.
pub fn derive_session_seed(session_id: &str, combatant_ids: &[&str]) -> u64 {
    let mut roster = combatant_ids.to_vec();
    roster.sort_unstable();

    let mut sha = Sha256::new();
    sha.update(b"SKIRMISH_SEED_V1");
    for part in std::iter::once(session_id).chain(roster) {
        sha.update((part.len() as u32).to_le_bytes());
        sha.update(part.as_bytes());
    }
    let digest = sha.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_rolls() {
        let mut a = DeterministicRng::new(12345);
        let mut b = DeterministicRng::new(12345);
        let rolls_a: Vec<i32> = (0..500).map(|_| a.roll_die(20)).collect();
        let rolls_b: Vec<i32> = (0..500).map(|_| b.roll_die(20)).collect();
        assert_eq!(rolls_a, rolls_b);
        assert_eq!(a.draws(), 500);

        let mut c = DeterministicRng::new(54321);
        let rolls_c: Vec<i32> = (0..500).map(|_| c.roll_die(20)).collect();
        assert_ne!(rolls_a, rolls_c);
    }

    #[test]
    fn test_zero_seed_is_usable() {
        let mut rng = DeterministicRng::new(0);
        let first = rng.next_u64();
        assert_ne!(first, rng.next_u64());
    }

    #[test]
    fn test_die_covers_every_face() {
        let mut rng = DeterministicRng::new(20);
        let mut seen = [false; 20];
        for _ in 0..2000 {
            let roll = rng.roll_die(20);
            assert!((1..=20).contains(&roll));
            seen[(roll - 1) as usize] = true;
        }
        assert!(seen.iter().all(|&face| face));
        assert_eq!(rng.roll_die(0), 0);
    }

    #[test]
    fn test_between_bounds() {
        let mut rng = DeterministicRng::new(5678);
        for _ in 0..1000 {
            assert!((-3..=3).contains(&rng.between(-3, 3)));
        }
        assert_eq!(rng.between(5, 5), 5);
        assert_eq!(rng.between(9, 2), 9);
        assert!(rng.between(i32::MIN, i32::MAX) >= i32::MIN);
    }

    #[test]
    fn test_chance_extremes() {
        let mut rng = DeterministicRng::new(77);
        for _ in 0..100 {
            assert!(rng.chance(100));
            assert!(rng.chance(150));
            assert!(!rng.chance(0));
        }
    }

    #[test]
    fn test_discarded_clone_leaves_original_untouched() {
        let mut committed = DeterministicRng::new(31);
        let mut attempt = committed.clone();
        attempt.roll_die(6);
        attempt.roll_die(6);

        let mut replay = DeterministicRng::new(31);
        assert_eq!(committed.roll_die(6), replay.roll_die(6));
    }

    #[test]
    fn test_session_seed_ignores_roster_order() {
        let seed = derive_session_seed("s-1", &["hero", "goblin", "wolf"]);
        assert_eq!(seed, derive_session_seed("s-1", &["wolf", "hero", "goblin"]));
        assert_ne!(seed, derive_session_seed("s-2", &["hero", "goblin", "wolf"]));
        assert_ne!(
            derive_session_seed("ab", &["c"]),
            derive_session_seed("a", &["bc"])
        );
    }
}
