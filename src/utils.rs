//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two. Returns `None` on overflow.
pub fn align_up(addr: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Aligns an address down to a multiple of `align`.
pub fn align_down(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}
