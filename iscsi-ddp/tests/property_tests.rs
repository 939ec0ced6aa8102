//! Property-based tests for the tag codec and the pagepod allocator.

mod common;

use common::{CONN, PAGE, buffer, rig};
use iscsi_ddp::tag::{
    COLOR_MASK, TagFormat, color_of, compose_tag, is_ddp_tag, mark_as_non_ddp, slot_index,
    sw_tag_of, sw_tag_usable,
};
use iscsi_ddp::{Error, Exhausted, GatherList, Segment};
use proptest::prelude::*;

/// Strategy for index widths the hardware can be configured with.
fn idx_bits() -> impl Strategy<Value = u8> {
    2u8..=24
}

/// A tag format with a software tag that fits it.
fn format_and_sw_tag() -> impl Strategy<Value = (TagFormat, u32)> {
    idx_bits().prop_flat_map(|bits| {
        let format = TagFormat::new(bits).unwrap();
        let max = if format.sw_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << format.sw_bits) - 1
        };
        (Just(format), 0..=max)
    })
}

proptest! {
    /// Marked tags never read as placement tags and keep their software bits.
    #[test]
    fn marked_tags_are_never_ddp(bits in idx_bits(), sw_tag in 0u32..(1 << 20)) {
        let format = TagFormat::new(bits).unwrap();
        let tag = mark_as_non_ddp(&format, sw_tag);
        prop_assert!(!is_ddp_tag(&format, tag));
        let keep = (1u32 << (format.reserved_width() - 1)) - 1;
        prop_assert_eq!(tag & keep, sw_tag & keep);
        prop_assert_eq!(sw_tag_of(&format, tag), sw_tag);
    }

    /// Composed tags always read as placement tags and decode back.
    #[test]
    fn composed_tags_are_ddp((format, sw_tag) in format_and_sw_tag(), color in any::<u8>(), raw_idx in any::<u32>()) {
        // Indices below the marker value are the only ones the manager hands out.
        let idx = raw_idx % ((1u32 << (format.rsvd_bits - 1)) - 1).max(1);
        prop_assert!(sw_tag_usable(&format, sw_tag));
        let tag = compose_tag(idx, color, &format, sw_tag);
        prop_assert!(is_ddp_tag(&format, tag));
        prop_assert_eq!(slot_index(&format, tag), idx);
        prop_assert_eq!(color_of(tag) as u32, color as u32 & COLOR_MASK);
        prop_assert_eq!(sw_tag_of(&format, tag), sw_tag);
    }

    /// Builder output always satisfies the page layout contract.
    #[test]
    fn gather_lists_cover_the_transfer(
        offset in 0usize..PAGE,
        pages in 1usize..32,
        split in 1usize..4096,
    ) {
        let length = pages * PAGE - offset;
        prop_assume!(length > 2048);
        let base = 0x5000_0000u64;
        let cut = split.min(length - 1);
        let segs = [
            Segment::new(base + offset as u64, cut),
            Segment::new(base + (offset + cut) as u64, length - cut),
        ];
        let gl = GatherList::build(length, &segs, PAGE, 2048).unwrap();
        prop_assert_eq!(gl.offset(), offset);
        prop_assert_eq!(gl.pages().len(), pages);
        prop_assert!(gl.length() <= gl.pages().len() * PAGE - gl.offset());
        for (i, page) in gl.pages().iter().enumerate() {
            prop_assert_eq!(*page, base + (i * PAGE) as u64);
        }
    }

    /// Random reserve/release traffic: pods in use always match the live
    /// registrations, exhaustion only happens when the table cannot fit the
    /// request, and every released mapping is gone.
    #[test]
    fn allocator_tracks_live_registrations(
        ops in proptest::collection::vec((1usize..=12, any::<bool>()), 1..80)
    ) {
        let r = rig(32);
        let nppods = r.manager.nppods();
        let mut live: Vec<(u32, usize, usize)> = Vec::new();

        for (n, (pages, release)) in ops.into_iter().enumerate() {
            if release && !live.is_empty() {
                let (tag, _, _) = live.remove(n % live.len());
                r.manager.release(tag);
            } else {
                let pods = pages.div_ceil(4);
                match r.manager.reserve_tag(&CONN, 1, pages * PAGE, &buffer(n as u64, pages)) {
                    Ok(tag) => live.push((tag, pods, pages)),
                    Err(Error::ResourceExhausted(Exhausted::Slots)) => {
                        let used: usize = live.iter().map(|(_, p, _)| p).sum();
                        prop_assert!(used + pods > 0);
                        prop_assert!(used > 0 || pods > nppods);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
            }

            let stats = r.manager.stats();
            let used: usize = live.iter().map(|(_, p, _)| p).sum();
            prop_assert_eq!(stats.in_use, used);
            let mapped: usize = live.iter().map(|(_, _, pg)| pg).sum();
            prop_assert_eq!(r.mapper.live(), mapped);
        }

        for (tag, _, _) in live {
            r.manager.release(tag);
        }
        prop_assert_eq!(r.manager.stats().in_use, 0);
        prop_assert_eq!(r.mapper.live(), 0);
    }
}
