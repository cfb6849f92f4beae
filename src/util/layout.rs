//! Layout utilities.

/// Align a size up to the given alignment.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Checked variant of [`align_up`].
#[inline]
pub const fn checked_align_up(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Check whether an address is a multiple of `align`.
#[inline]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

/// Sum a list of sizes, failing on overflow.
#[inline]
pub fn checked_total(parts: &[usize]) -> Option<usize> {
    parts.iter().try_fold(0usize, |acc, part| acc.checked_add(*part))
}
