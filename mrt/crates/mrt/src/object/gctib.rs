//! GC Type Info - Where reference words live inside an object
//!
//! Each bit in a bitmap word represents one 8-byte word of the object,
//! counted from the object start (header included).
//! - Strong bit = 1: word holds a counted reference
//! - Weak bit = 1: word holds a weak or referent reference
//! - Both 0: primitive data, padding or header
//!
//! # Layout
//!
//! ```text
//! Object Layout:
//! ┌────────────┬─────────┬─────────┬─────────┐
//! │ 0-31       │ 32-39   │ 40-47   │ 48-55   │
//! │ (bits 0-3) │ (bit 4) │ (bit 5) │ (bit 6) │
//! ├────────────┼─────────┼─────────┼─────────┤
//! │ header     │ ref     │ i64     │ weak    │
//! │ 0          │ strong  │ 0       │ weak    │
//! └────────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! Arrays do not use bitmaps: every element of an object array is a strong
//! reference and primitive arrays have none. The three canonical
//! descriptors are process-wide constants shared by every class that needs
//! them.

use crate::object::header::{array_length, ARRAY_DATA_OFFSET, HEADER_SIZE};
use std::sync::Arc;

/// Size of each word tracked by a bitmap bit (in bytes)
pub const SLOT_SIZE: usize = 8;

/// Reference layout of a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcTibLayout {
    /// Fixed-size object described by bitmaps
    Fields { strong: Box<[u64]>, weak: Box<[u64]> },
    /// Every element is a strong reference
    ObjectArray,
    /// No element is a reference
    PrimitiveArray,
}

/// GC type information block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcTib {
    /// State bits copied into the header of every new instance
    pub header_proto: u32,
    pub layout: GcTibLayout,
}

lazy_static::lazy_static! {
    /// Object without reference fields
    pub static ref EMPTY_OBJECT: Arc<GcTib> = Arc::new(GcTib {
        header_proto: 0,
        layout: GcTibLayout::Fields { strong: Box::new([]), weak: Box::new([]) },
    });

    /// Array whose elements are all references
    pub static ref ARRAY_OF_OBJECT: Arc<GcTib> = Arc::new(GcTib {
        header_proto: 0,
        layout: GcTibLayout::ObjectArray,
    });

    /// Array of primitive elements
    pub static ref ARRAY_OF_PRIMITIVE: Arc<GcTib> = Arc::new(GcTib {
        header_proto: 0,
        layout: GcTibLayout::PrimitiveArray,
    });
}

impl GcTib {
    /// Build a descriptor from strong and weak field offsets
    ///
    /// # Arguments
    ///
    /// * `strong` - Byte offsets of counted reference fields
    /// * `weak` - Byte offsets of weak or referent fields
    ///
    /// Offsets must be 8-byte aligned and past the header.
    pub fn from_offsets(strong: &[usize], weak: &[usize], header_proto: u32) -> Self {
        Self {
            header_proto,
            layout: GcTibLayout::Fields {
                strong: Self::bitmap(strong),
                weak: Self::bitmap(weak),
            },
        }
    }

    fn bitmap(offsets: &[usize]) -> Box<[u64]> {
        let words = offsets
            .iter()
            .map(|off| off / SLOT_SIZE / 64 + 1)
            .max()
            .unwrap_or(0);
        let mut bits = vec![0u64; words];
        for &offset in offsets {
            debug_assert!(
                offset % SLOT_SIZE == 0,
                "Offset {} must be aligned to {} bytes",
                offset,
                SLOT_SIZE
            );
            debug_assert!(offset >= HEADER_SIZE, "Offset {} overlaps the header", offset);
            let slot = offset / SLOT_SIZE;
            bits[slot / 64] |= 1 << (slot % 64);
        }
        bits.into_boxed_slice()
    }

    fn offsets_of(bits: &[u64]) -> impl Iterator<Item = usize> + '_ {
        bits.iter().enumerate().flat_map(|(word_idx, &word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| (word_idx * 64 + bit) * SLOT_SIZE)
        })
    }

    /// Strong and weak field offsets of a fixed layout
    pub fn offsets(&self) -> (Vec<usize>, Vec<usize>) {
        match &self.layout {
            GcTibLayout::Fields { strong, weak } => (
                Self::offsets_of(strong).collect(),
                Self::offsets_of(weak).collect(),
            ),
            _ => (Vec::new(), Vec::new()),
        }
    }

    /// Check whether instances can hold strong references
    pub fn has_refs(&self) -> bool {
        match &self.layout {
            GcTibLayout::Fields { strong, .. } => strong.iter().any(|w| *w != 0),
            GcTibLayout::ObjectArray => true,
            GcTibLayout::PrimitiveArray => false,
        }
    }

    /// Check whether instances hold weak references
    pub fn has_weak_refs(&self) -> bool {
        matches!(&self.layout, GcTibLayout::Fields { weak, .. } if weak.iter().any(|w| *w != 0))
    }

    /// Check whether a byte offset is a strong reference field
    pub fn is_reference(&self, offset: usize) -> bool {
        match &self.layout {
            GcTibLayout::Fields { strong, .. } => {
                let slot = offset / SLOT_SIZE;
                strong
                    .get(slot / 64)
                    .is_some_and(|w| w & (1 << (slot % 64)) != 0)
            },
            GcTibLayout::ObjectArray => offset >= ARRAY_DATA_OFFSET,
            GcTibLayout::PrimitiveArray => false,
        }
    }

    /// Visit the byte offset of every strong reference word of `obj`
    ///
    /// # Safety
    /// `obj` must be a live instance described by this descriptor.
    pub unsafe fn visit_refs(&self, obj: usize, mut f: impl FnMut(usize)) {
        match &self.layout {
            GcTibLayout::Fields { strong, .. } => Self::offsets_of(strong).for_each(f),
            GcTibLayout::ObjectArray => {
                for i in 0..array_length(obj) {
                    f(ARRAY_DATA_OFFSET + i * SLOT_SIZE);
                }
            },
            GcTibLayout::PrimitiveArray => {},
        }
    }

    /// Visit the byte offset of every weak reference word
    pub fn visit_weak_refs(&self, f: impl FnMut(usize)) {
        if let GcTibLayout::Fields { weak, .. } = &self.layout {
            Self::offsets_of(weak).for_each(f);
        }
    }
}
