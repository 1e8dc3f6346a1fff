//! Property test for `BlockKey::mix` (design §8.1): distinct keys should
//! very rarely collide, checked over a sample large enough that a broken
//! mix (e.g. one that ignores `flags`) would show up as exact equality.

mod common;

use dbt_core::block::ContextFlags;
use dbt_core::cache::BlockKey;
use dbt_core::common::GuestAddr;
use proptest::prelude::*;

proptest! {
    /// Two keys that differ only in their flags word must mix to different
    /// values — otherwise a context-flag-specialized block and its sibling
    /// would alias in the cache.
    #[test]
    fn mix_distinguishes_flags_at_a_fixed_pc(pc: u32, flags_a: u8, flags_b: u8) {
        prop_assume!(flags_a != flags_b);
        let ka = BlockKey::new(GuestAddr::new(pc), ContextFlags(flags_a));
        let kb = BlockKey::new(GuestAddr::new(pc), ContextFlags(flags_b));
        prop_assert_ne!(ka.mix(), kb.mix());
    }

    /// Two keys that differ only in `pc` must mix to different values.
    #[test]
    fn mix_distinguishes_pc_at_fixed_flags(pc_a: u32, pc_b: u32, flags: u8) {
        prop_assume!(pc_a != pc_b);
        let ka = BlockKey::new(GuestAddr::new(pc_a), ContextFlags(flags));
        let kb = BlockKey::new(GuestAddr::new(pc_b), ContextFlags(flags));
        prop_assert_ne!(ka.mix(), kb.mix());
    }

    /// `mix` is a pure function of its key: calling it twice on an
    /// identical key must agree.
    #[test]
    fn mix_is_deterministic(pc: u32, flags: u8) {
        let key = BlockKey::new(GuestAddr::new(pc), ContextFlags(flags));
        prop_assert_eq!(key.mix(), key.mix());
    }
}
