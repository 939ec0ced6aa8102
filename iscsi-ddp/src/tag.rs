//! Placement tag codec.
//!
//! A placement tag is the 32-bit value carried in the iSCSI ITT/TTT. The low
//! `rsvd_bits + rsvd_shift` bits are reserved for the adapter:
//!
//! ```text
//!  31                 width  width-1           rsvd_shift        0
//! +---------------------+------+--------------------+-------------+
//! |   software tag      |  0   |   pagepod index    |    color    |
//! +---------------------+------+--------------------+-------------+
//! ```
//!
//! The most significant reserved bit doubles as the "not placed" marker. Index
//! values never reach it because the manager caps the index space at
//! `2^(idx_bits - 1) - 1`, so every composed tag reads as a placement tag and
//! every [`mark_as_non_ddp`] tag does not.

use crate::error::Error;

/// Width of the reuse color in bits.
pub const COLOR_BITS: u8 = 6;
/// Mask selecting the color from a tag.
pub const COLOR_MASK: u32 = (1 << COLOR_BITS) - 1;
/// Hardware limit on the pagepod index width.
pub const MAX_INDEX_BITS: u8 = 24;

/// Bit layout of placement tags for one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagFormat {
    /// Bits left for the software tag above the reserved field.
    pub sw_bits: u8,
    /// Width of the pagepod index.
    pub rsvd_bits: u8,
    /// Position of the index (the color sits below it).
    pub rsvd_shift: u8,
    /// Mask of `rsvd_bits` ones.
    pub rsvd_mask: u32,
}

impl TagFormat {
    /// Derive the format for an index field `idx_bits` wide.
    pub fn new(idx_bits: u8) -> Result<Self, Error> {
        if !(2..=MAX_INDEX_BITS).contains(&idx_bits) {
            return Err(Error::Config(format!(
                "pagepod index width {idx_bits} outside 2..={MAX_INDEX_BITS}"
            )));
        }
        Ok(TagFormat {
            sw_bits: 32 - idx_bits - COLOR_BITS,
            rsvd_bits: idx_bits,
            rsvd_shift: COLOR_BITS,
            rsvd_mask: (1u32 << idx_bits) - 1,
        })
    }

    /// Total width of the reserved field (index + color).
    pub const fn reserved_width(&self) -> u32 {
        self.rsvd_bits as u32 + self.rsvd_shift as u32
    }

    #[inline]
    const fn marker_shift(&self) -> u32 {
        self.reserved_width() - 1
    }
}

/// Whether `tag` refers to a pagepod registration.
#[inline]
pub fn is_ddp_tag(format: &TagFormat, tag: u32) -> bool {
    tag & (1 << format.marker_shift()) == 0
}

/// Whether `sw_tag` fits above the reserved field without losing bits.
#[inline]
pub fn sw_tag_usable(format: &TagFormat, sw_tag: u32) -> bool {
    sw_tag >> format.sw_bits == 0
}

/// Turn a software tag into one the adapter will never place.
///
/// The low `width - 1` bits stay where they are, the marker bit is set, and
/// everything above moves up one bit to make room for it.
pub fn mark_as_non_ddp(format: &TagFormat, sw_tag: u32) -> u32 {
    let shift = format.marker_shift();
    let low = sw_tag & ((1 << shift) - 1);
    let high = (sw_tag >> shift) << (shift + 1);
    high | low | (1 << shift)
}

/// Build the tag for a registration at `slot_index` with the given color.
#[inline]
pub fn compose_tag(slot_index: u32, color: u8, format: &TagFormat, sw_tag: u32) -> u32 {
    (sw_tag << format.reserved_width())
        | ((slot_index & format.rsvd_mask) << format.rsvd_shift)
        | (color as u32 & COLOR_MASK)
}

/// Pagepod index carried by a placement tag.
#[inline]
pub fn slot_index(format: &TagFormat, tag: u32) -> u32 {
    (tag >> format.rsvd_shift) & format.rsvd_mask
}

/// Reuse color carried by a placement tag.
#[inline]
pub fn color_of(tag: u32) -> u8 {
    (tag & COLOR_MASK) as u8
}

/// Recover the software tag from either kind of tag.
pub fn sw_tag_of(format: &TagFormat, tag: u32) -> u32 {
    if is_ddp_tag(format, tag) {
        return tag >> format.reserved_width();
    }
    let shift = format.marker_shift();
    let low = tag & ((1 << shift) - 1);
    let high = tag >> (shift + 1);
    (high << shift) | low
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(bits: u8) -> TagFormat {
        TagFormat::new(bits).unwrap()
    }

    #[test]
    fn format_derivation() {
        let f = format(13);
        assert_eq!(f.rsvd_bits, 13);
        assert_eq!(f.rsvd_shift, COLOR_BITS);
        assert_eq!(f.rsvd_mask, 0x1fff);
        assert_eq!(f.sw_bits, 13);
        assert_eq!(f.reserved_width(), 19);
    }

    #[test]
    fn format_rejects_bad_width() {
        assert!(TagFormat::new(1).is_err());
        assert!(TagFormat::new(25).is_err());
        assert!(TagFormat::new(24).is_ok());
    }

    #[test]
    fn compose_and_decode() {
        let f = format(8);
        let tag = compose_tag(5, 3, &f, 0x12);
        assert_eq!(tag, 0x48143);
        assert!(is_ddp_tag(&f, tag));
        assert_eq!(slot_index(&f, tag), 5);
        assert_eq!(color_of(tag), 3);
        assert_eq!(sw_tag_of(&f, tag), 0x12);
    }

    #[test]
    fn non_ddp_small_tag_only_sets_marker() {
        let f = format(8);
        let tag = mark_as_non_ddp(&f, 0x7f);
        assert_eq!(tag, 0x7f | (1 << 13));
        assert!(!is_ddp_tag(&f, tag));
        assert_eq!(sw_tag_of(&f, tag), 0x7f);
    }

    #[test]
    fn non_ddp_shifts_high_bits() {
        let f = format(8);
        let tag = mark_as_non_ddp(&f, 0x12345);
        assert_eq!(tag, 0x26345);
        assert!(!is_ddp_tag(&f, tag));
        assert_eq!(sw_tag_of(&f, tag), 0x12345);
    }

    #[test]
    fn usable_sw_tags() {
        let f = format(13);
        assert!(sw_tag_usable(&f, 0));
        assert!(sw_tag_usable(&f, (1 << 13) - 1));
        assert!(!sw_tag_usable(&f, 1 << 13));
    }

    #[test]
    fn color_is_truncated() {
        let f = format(4);
        let tag = compose_tag(1, 0xff, &f, 0);
        assert_eq!(color_of(tag), 0x3f);
        assert_eq!(slot_index(&f, tag), 1);
    }
}
