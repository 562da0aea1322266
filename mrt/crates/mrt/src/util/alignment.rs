//! Alignment Utilities
//!
//! Helper functions for memory alignment.

/// Alignment - utility for alignment operations
pub struct Alignment;

impl Alignment {
    /// Align value up to boundary
    ///
    /// # Examples
    /// ```
    /// use mrt::util::Alignment;
    ///
    /// assert_eq!(Alignment::align_up(100, 8), 104);
    /// assert_eq!(Alignment::align_up(64, 8), 64);
    /// ```
    pub fn align_up(value: usize, alignment: usize) -> usize {
        (value + alignment - 1) & !(alignment - 1)
    }

    /// Align value up, returning None on overflow
    pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
        value
            .checked_add(alignment - 1)
            .map(|v| v & !(alignment - 1))
    }

    /// Check if value is aligned
    pub fn is_aligned(value: usize, alignment: usize) -> bool {
        value & (alignment - 1) == 0
    }

    /// Default object alignment (8 bytes)
    pub const DEFAULT: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(Alignment::align_up(1, 8), 8);
        assert_eq!(Alignment::align_up(17, 16), 32);
        assert!(Alignment::is_aligned(64, 8));
        assert!(!Alignment::is_aligned(65, 8));
    }

    #[test]
    fn test_checked_align_up_overflow() {
        assert_eq!(Alignment::checked_align_up(usize::MAX, 8), None);
        assert_eq!(Alignment::checked_align_up(9, 8), Some(16));
    }
}
