//! The 256-bit presence bitmap and its run primitives.
//!
//! A cluster's worth of shard slots is tracked by one [`Bitmap256`]: bit `i`
//! set means slot `i` is free. Runs of consecutive free slots are found by
//! condensing the bitmap with shift-and-AND, claimed by clearing an expanded
//! run mask, and released by ORing the mask back in.

use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Number of slots governed by one bitmap.
pub const BITMAP_BITS: usize = 256;

const LIMB_BITS: usize = u64::BITS as usize;
const LIMBS: usize = BITMAP_BITS / LIMB_BITS;

/// A 256-bit bit vector over four `u64` limbs.
///
/// Limb 0 holds the lowest positions; within a limb, lower positions are less
/// significant. Run searches scan from position 0 upward, so ties resolve to
/// the lowest position. Shifts discard bits at the vector's edges and fill
/// with zeroes; a run can therefore never appear to wrap around.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Bitmap256([u64; LIMBS]);

impl core::fmt::Debug for Bitmap256 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // highest limb first, so the vector reads as one 256-bit number
        write!(
            f,
            "Bitmap256({:016x}_{:016x}_{:016x}_{:016x})",
            self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl Bitmap256 {
    pub const EMPTY: Self = Self([0; LIMBS]);
    pub const FULL: Self = Self([u64::MAX; LIMBS]);

    pub fn is_zero(self) -> bool {
        self.0 == [0; LIMBS]
    }

    pub fn count_ones(self) -> usize {
        self.0.iter().map(|limb| limb.count_ones() as usize).sum()
    }

    /// Shift every bit one position up, carrying across limb boundaries.
    /// The bit at position 255 is discarded; position 0 becomes zero.
    pub fn shl1(self) -> Self {
        let mut limbs = [0; LIMBS];
        let mut carry = 0;
        for i in 0..LIMBS {
            limbs[i] = self.0[i] << 1 | carry;
            carry = self.0[i] >> (LIMB_BITS - 1);
        }
        Self(limbs)
    }

    /// Shift every bit one position down, carrying across limb boundaries.
    /// The bit at position 0 is discarded; position 255 becomes zero.
    pub fn shr1(self) -> Self {
        let mut limbs = [0; LIMBS];
        let mut carry = 0;
        for i in (0..LIMBS).rev() {
            limbs[i] = self.0[i] >> 1 | carry;
            carry = self.0[i] << (LIMB_BITS - 1);
        }
        Self(limbs)
    }

    /// Whether the bit at `pos` is set.
    pub fn get(self, pos: usize) -> bool {
        debug_assert!(pos < BITMAP_BITS);

        self.0[pos / LIMB_BITS] >> (pos % LIMB_BITS) & 1 != 0
    }

    /// Position of the lowest set bit, or `None` if the vector is all zero.
    pub fn lowest_set(self) -> Option<usize> {
        for (i, &limb) in self.0.iter().enumerate() {
            if limb != 0 {
                return Some(i * LIMB_BITS + limb.trailing_zeros() as usize);
            }
        }

        None
    }

    /// Condense the bitmap such that bit `i` remains set iff bits
    /// `i..i + len` of the input are all set.
    ///
    /// Each iteration ANDs the map with itself shifted down by one; after `k`
    /// iterations a surviving bit at `i` certifies `k + 1` consecutive set
    /// bits starting at `i`. The zero-fill at position 255 clears any
    /// candidate whose run would extend past the end of the vector.
    pub fn condense(self, len: usize) -> Self {
        debug_assert!(1 <= len && len <= BITMAP_BITS);

        let mut map = self;
        for _ in 1..len {
            map &= map.shr1();
        }
        map
    }

    /// Build a bitmap with exactly `len` consecutive bits set starting at
    /// `pos`, by widening a single anchor bit and relocating it upward.
    pub fn expand(pos: usize, len: usize) -> Self {
        debug_assert!(1 <= len && pos + len <= BITMAP_BITS);

        let mut map = Self::EMPTY;
        map.0[0] = 1;

        for _ in 1..len {
            map |= map.shl1();
        }
        for _ in 0..pos {
            map = map.shl1();
        }
        map
    }

    /// Position of the first run of `len` consecutive set bits,
    /// scanning deterministically from position 0 upward.
    pub fn find_first_run(self, len: usize) -> Option<usize> {
        self.condense(len).lowest_set()
    }

    /// Find the first run of `len` set bits and clear it.
    ///
    /// On failure the bitmap is left untouched.
    pub fn claim_run(&mut self, len: usize) -> Option<usize> {
        let pos = self.find_first_run(len)?;
        *self &= !Self::expand(pos, len);
        Some(pos)
    }

    /// Set the `len` bits starting at `pos`.
    ///
    /// The bits must currently be clear; setting an already-set bit is a
    /// double release and indicates corrupted bookkeeping.
    pub fn release_run(&mut self, pos: usize, len: usize) {
        let run = Self::expand(pos, len);

        debug_assert!((*self & run).is_zero(), "releasing bits that are already free");

        *self |= run;
    }

    /// Whether every bit of the run at `pos` is currently clear (claimed).
    pub fn is_run_claimed(self, pos: usize, len: usize) -> bool {
        (self & Self::expand(pos, len)).is_zero()
    }
}

impl BitAnd for Bitmap256 {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        let mut limbs = [0; LIMBS];
        for i in 0..LIMBS {
            limbs[i] = self.0[i] & rhs.0[i];
        }
        Self(limbs)
    }
}

impl BitAndAssign for Bitmap256 {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = *self & rhs;
    }
}

impl BitOr for Bitmap256 {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        let mut limbs = [0; LIMBS];
        for i in 0..LIMBS {
            limbs[i] = self.0[i] | rhs.0[i];
        }
        Self(limbs)
    }
}

impl BitOrAssign for Bitmap256 {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl Not for Bitmap256 {
    type Output = Self;

    fn not(self) -> Self {
        let mut limbs = [0; LIMBS];
        for i in 0..LIMBS {
            limbs[i] = !self.0[i];
        }
        Self(limbs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts_carry_across_limb_boundaries() {
        for boundary in [63, 127, 191] {
            let below = Bitmap256::expand(boundary, 1);
            let above = Bitmap256::expand(boundary + 1, 1);

            assert_eq!(below.shl1(), above);
            assert_eq!(above.shr1(), below);
        }
    }

    #[test]
    fn shifts_discard_edge_bits() {
        assert!(Bitmap256::expand(255, 1).shl1().is_zero());
        assert!(Bitmap256::expand(0, 1).shr1().is_zero());

        // no bit is duplicated or lost anywhere else
        assert_eq!(Bitmap256::FULL.shl1().count_ones(), 255);
        assert_eq!(Bitmap256::FULL.shr1().count_ones(), 255);
    }

    #[test]
    fn condense_of_full_map() {
        for len in [1, 2, 3, 48, 64, 65, 128, 255, 256] {
            let condensed = Bitmap256::FULL.condense(len);

            // exactly the 256 - len + 1 viable start positions survive
            assert_eq!(condensed.count_ones(), BITMAP_BITS - len + 1);
            assert_eq!(condensed, Bitmap256::expand(0, BITMAP_BITS - len + 1));
        }
    }

    #[test]
    fn find_first_run_inverts_expand() {
        for len in 1..=BITMAP_BITS {
            for pos in 0..=BITMAP_BITS - len {
                let map = Bitmap256::expand(pos, len);
                assert_eq!(map.count_ones(), len);
                assert_eq!(map.find_first_run(len), Some(pos));
            }
        }
    }

    #[test]
    fn find_first_run_prefers_lowest_position() {
        let map = Bitmap256::expand(200, 10) | Bitmap256::expand(20, 10);

        assert_eq!(map.find_first_run(10), Some(20));
        assert_eq!(map.find_first_run(4), Some(20));
    }

    #[test]
    fn runs_do_not_wrap_around() {
        // 6 free slots at each end of the vector: a wrapping search would
        // see 12 consecutive bits, a correct one must not
        let map = Bitmap256::expand(250, 6) | Bitmap256::expand(0, 6);

        assert_eq!(map.find_first_run(6), Some(0));
        assert_eq!(map.find_first_run(7), None);
        assert_eq!(map.find_first_run(12), None);
    }

    #[test]
    fn claim_clears_exactly_the_run() {
        let mut map = Bitmap256::FULL;

        assert_eq!(map.claim_run(16), Some(0));
        assert_eq!(map, !Bitmap256::expand(0, 16));
        assert!(map.is_run_claimed(0, 16));

        assert_eq!(map.claim_run(16), Some(16));
        assert_eq!(map.count_ones(), BITMAP_BITS - 32);
    }

    #[test]
    fn failed_claim_leaves_map_untouched() {
        let mut map = Bitmap256::expand(40, 8);
        let before = map;

        assert_eq!(map.claim_run(9), None);
        assert_eq!(map, before);
    }

    #[test]
    fn release_restores_claimed_run() {
        let mut map = Bitmap256::FULL;

        let pos = map.claim_run(48).unwrap();
        map.release_run(pos, 48);

        assert_eq!(map, Bitmap256::FULL);
    }

    #[test]
    fn claim_skips_insufficient_gaps() {
        // gaps of 3 and 5, then a long tail
        let map = Bitmap256::expand(10, 3) | Bitmap256::expand(30, 5) | Bitmap256::expand(100, 156);

        assert_eq!(map.find_first_run(4), Some(30));
        assert_eq!(map.find_first_run(6), Some(100));
        assert_eq!(map.find_first_run(157), None);
    }
}
