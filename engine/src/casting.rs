//! Yarrow-stalk casting for callers that do not bring their own throws.
//!
//! Each line takes three divisions of the stalk bundle. A division splits
//! the bundle in two, sets one stalk aside from the right pile, and counts
//! both piles off by fours; the remainders (1..=4 each) plus the set-aside
//! stalk are removed. After three divisions 24, 28, 32 or 36 stalks remain,
//! and a quarter of that is the line value.

use yijing_types::{LINE_COUNT, Throw};

/// Stalks in play (fifty, one set aside before casting starts).
pub const YARROW_STALKS: u32 = 49;
const DIVISIONS_PER_LINE: usize = 3;

/// Cast six lines with the process RNG.
#[must_use]
pub fn cast_throws() -> [Throw; LINE_COUNT] {
    cast_throws_with(|total| 1 + rand::random::<u32>() % (total - 2))
}

/// Cast six lines, asking `split(total)` for the size of the left pile.
///
/// Out-of-range answers are clamped to `1..=total - 2` so the right pile
/// always keeps a stalk after one is set aside.
pub fn cast_throws_with(mut split: impl FnMut(u32) -> u32) -> [Throw; LINE_COUNT] {
    let mut throws = [Throw::YoungYin; LINE_COUNT];
    for throw in &mut throws {
        *throw = cast_line(&mut split);
    }
    throws
}

fn cast_line(split: &mut impl FnMut(u32) -> u32) -> Throw {
    let mut stalks = YARROW_STALKS;
    for _ in 0..DIVISIONS_PER_LINE {
        let left = split(stalks).clamp(1, stalks - 2);
        let right = stalks - left - 1;
        stalks -= 1 + count_off(left) + count_off(right);
    }
    match stalks / 4 {
        6 => Throw::OldYin,
        7 => Throw::YoungYang,
        8 => Throw::YoungYin,
        _ => Throw::OldYang,
    }
}

/// Remainder after counting off by fours; a full last group counts as four.
fn count_off(pile: u32) -> u32 {
    match pile % 4 {
        0 => 4,
        rem => rem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_left_pile_always_gives_old_yang() {
        let throws = cast_throws_with(|_| 1);
        assert_eq!(throws, [Throw::OldYang; LINE_COUNT]);
    }

    #[test]
    fn every_line_lands_on_a_valid_value() {
        for _ in 0..200 {
            for throw in cast_throws() {
                assert!((6..=9).contains(&throw.value()));
            }
        }
    }

    #[test]
    fn every_split_leaves_a_multiple_of_four() {
        // Exhaust the first-division splits with fixed later splits.
        for first in 1..=YARROW_STALKS - 2 {
            let mut calls = 0;
            let line = cast_line(&mut |total| {
                calls += 1;
                if calls == 1 { first } else { total / 2 }
            });
            assert!((6..=9).contains(&line.value()), "split {first} gave {line}");
        }
    }

    #[test]
    fn out_of_range_splits_are_clamped() {
        let throws = cast_throws_with(|total| total + 10);
        assert!(throws.iter().all(|t| (6..=9).contains(&t.value())));
        let throws = cast_throws_with(|_| 0);
        assert_eq!(throws, [Throw::OldYang; LINE_COUNT]);
    }
}
