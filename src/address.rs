//! The address/block-number arithmetic that hides a reserved window in the internal flash
//! address map. These are free functions, not methods, because the transform is pure: given
//! a block number or byte address it always produces the same adjusted value, independent of
//! session state.

/// Internal flash's reserved window, expressed in blocks. A caller-visible block number `n`
/// in `[256, 2048 - BLOCK_GAP)` lands `BLOCK_GAP` blocks further out in the device's real
/// block space than a naive `n + 2` would suggest.
const BLOCK_GAP: u32 = 832;

/// The byte-address equivalent of [`BLOCK_GAP`].
const ADDR_GAP: u32 = 0xd_0000;

const LOW_WINDOW_BLOCKS: u32 = 256;
pub(crate) const TOTAL_BLOCKS: u32 = 2048;

const LOW_WINDOW_ADDR: u32 = 0x4_0000;
const TOTAL_ADDR_SPACE: u32 = 0x20_0000;

/// Upper bound (exclusive) of the block domain over which [`internal_flash_block`] is
/// actually monotonic and injective. Past this point the transform's tail segment (plain
/// `n + 2`, `n ∈ [MAX_SAFE_BLOCK, TOTAL_BLOCKS)`) produces DFU block numbers that fall back
/// inside the range the bumped middle segment already occupies — e.g. block 1216 and block
/// 384 both map to DFU block 1218 — so a request spanning into `[MAX_SAFE_BLOCK,
/// TOTAL_BLOCKS)` would silently address the wrong physical block. [`internal_flash_block`]
/// still computes a value for those inputs (the formula is a device-firmware contract and is
/// preserved verbatim), but callers must not issue a block-range transfer that enters this
/// window; see [`internal_flash_range_is_collision_free`] and DESIGN.md.
pub(crate) const MAX_SAFE_BLOCK: u32 = TOTAL_BLOCKS - BLOCK_GAP;

/// Translate a logical, 0-indexed internal-flash block number into the DFU block number the
/// device actually expects on the control pipe. Block `0` is reserved for vendor commands, so
/// every logical block is offset by 2; blocks in the reserved window are additionally pushed
/// past a hardware gap.
///
/// Monotonically increasing and injective only over `[0, MAX_SAFE_BLOCK)`; see
/// [`MAX_SAFE_BLOCK`] for why the full `[0, TOTAL_BLOCKS)` domain does not hold that property.
pub fn internal_flash_block(n: u32) -> u16 {
    let mut adjusted = n + 2;
    if n >= LOW_WINDOW_BLOCKS && n < TOTAL_BLOCKS - BLOCK_GAP {
        adjusted += BLOCK_GAP;
    }
    adjusted as u16
}

/// Whether a block-range transfer `[start_block, start_block + block_count)` avoids the
/// collision window described at [`MAX_SAFE_BLOCK`]: either the whole range sits below it, or
/// the whole range sits at or past `TOTAL_BLOCKS`, where the tail segment's output has moved
/// past anything the bumped middle segment could have produced and is safe again.
pub(crate) fn internal_flash_range_is_collision_free(start_block: u32, block_count: u32) -> bool {
    let end_block = start_block + block_count;
    end_block <= MAX_SAFE_BLOCK || start_block >= TOTAL_BLOCKS
}

/// The byte-address form of [`internal_flash_block`], used when issuing `erase_block` against
/// a linear address rather than a block-indexed transfer.
pub fn internal_flash_erase_address(addr: u32) -> u32 {
    let mut adjusted = addr;
    if addr >= LOW_WINDOW_ADDR && addr < TOTAL_ADDR_SPACE - ADDR_GAP {
        adjusted += ADDR_GAP;
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_window_maps_to_low_blocks() {
        assert_eq!(internal_flash_block(0), 2);
        assert_eq!(internal_flash_block(255), 257);
    }

    #[test]
    fn discontinuity_at_256() {
        assert_eq!(internal_flash_block(256), 256 + 2 + 832);
        assert_eq!(internal_flash_block(1215), 1215 + 2 + 832);
    }

    #[test]
    fn tail_is_plain_offset() {
        assert_eq!(internal_flash_block(1216), 1216 + 2);
        assert_eq!(internal_flash_block(2047), 2047 + 2);
    }

    #[test]
    fn monotonically_increasing_and_injective_below_max_safe_block() {
        let mut prev = None;
        let mut seen = std::collections::HashSet::new();
        for n in 0..MAX_SAFE_BLOCK {
            let b = internal_flash_block(n);
            if let Some(p) = prev {
                assert!(b as u32 > p, "block {n} did not increase monotonically");
            }
            assert!(seen.insert(b), "block {n} collided with an earlier block number");
            prev = Some(b as u32);
        }
    }

    /// Past `MAX_SAFE_BLOCK` the tail segment's plain `n + 2` re-enters the range the bumped
    /// middle segment already produced. This is the formula's known, firmware-verbatim
    /// behavior (see `MAX_SAFE_BLOCK`'s doc comment) and is pinned here so a future change to
    /// the transform doesn't silently "fix" a collision that callers are expected to avoid by
    /// range-checking instead.
    #[test]
    fn tail_segment_collides_with_middle_segment_past_max_safe_block() {
        assert_eq!(MAX_SAFE_BLOCK, 1216);
        assert_eq!(internal_flash_block(1216), internal_flash_block(384));
        assert!(internal_flash_block(1216) < internal_flash_block(1215));
    }

    #[test]
    fn range_collision_check() {
        assert!(internal_flash_range_is_collision_free(0, MAX_SAFE_BLOCK));
        assert!(!internal_flash_range_is_collision_free(0, MAX_SAFE_BLOCK + 1));
        assert!(!internal_flash_range_is_collision_free(
            MAX_SAFE_BLOCK - 1,
            2
        ));
        assert!(internal_flash_range_is_collision_free(TOTAL_BLOCKS, 100));
        assert!(!internal_flash_range_is_collision_free(
            TOTAL_BLOCKS - 1,
            2
        ));
    }

    #[test]
    fn erase_address_discontinuity_matches_block_discontinuity() {
        assert_eq!(internal_flash_erase_address(0x3_ffff), 0x3_ffff);
        assert_eq!(internal_flash_erase_address(0x4_0000), 0x4_0000 + ADDR_GAP);
        assert_eq!(
            internal_flash_erase_address(TOTAL_ADDR_SPACE - ADDR_GAP - 1),
            TOTAL_ADDR_SPACE - ADDR_GAP - 1 + ADDR_GAP
        );
        assert_eq!(
            internal_flash_erase_address(TOTAL_ADDR_SPACE - ADDR_GAP),
            TOTAL_ADDR_SPACE - ADDR_GAP
        );
    }
}
