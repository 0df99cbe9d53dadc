//! Behavioural properties checked over representative inputs in both layouts.

mod common;

use common::{LAYOUTS, engine, engine_with};
use umbra_shadow::{ShadowEngine, ShadowValue, UNIT_SIZE};

/// Deterministic value sequence for pattern fills.
fn value_at(i: u32) -> ShadowValue {
    ShadowValue::ALL[((i * 7 + i / 5) % 4) as usize]
}

fn snapshot(e: &ShadowEngine, start: u32, len: u32) -> Vec<ShadowValue> {
    (start..start + len).map(|a| e.get_byte(a)).collect()
}

#[test]
fn test_byte_round_trip() {
    for layout in LAYOUTS {
        let e = engine_with(layout);
        // bitmap tracks every byte; bytemap tracks whole groups
        let step = if layout == umbra_shadow::BlockLayout::Bitmap2 { 1 } else { 4 };
        for a in (0x7000..0x7100).step_by(step) {
            let value = value_at(a);
            for b in a..a + u32::try_from(step).expect("small step") {
                e.set_byte(b, value).expect("set should succeed");
            }
            assert_eq!(e.get_byte(a), value, "{} at {a:#x}", layout.name());
        }
        for a in [0, 0xffff, 0x1_0000, u32::MAX] {
            for value in ShadowValue::ALL {
                e.set_byte(a, value).expect("set should succeed");
                assert_eq!(e.get_byte(a), value);
            }
        }
    }
}

#[test]
fn test_range_consistency() {
    let ranges: [(u32, u64); 7] = [
        (0x100, 0x101),
        (0x103, 0x10f),
        (0x1000, 0x1010),
        (0xfffd, 0x1_0003),
        (0x2_0000, 0x3_0000),
        (0x2_fff1, 0x5_0007),
        (0xffff_fff0, 0x1_0000_0000),
    ];
    for layout in LAYOUTS {
        let e = engine_with(layout);
        for value in ShadowValue::ALL {
            for (start, end) in ranges {
                e.set_range(start, end, value).expect("set_range should succeed");
                let check = e
                    .check_range(start, end - u64::from(start), value)
                    .expect("check should succeed");
                assert!(check.is_match(), "{start:#x}..{end:#x} {value}: {check:?}");
            }
        }
    }
}

#[test]
fn test_set_range_leaves_neighbours() {
    let e = engine();
    e.set_range(0x8002, 0x8013, ShadowValue::Defined).expect("set_range should succeed");
    assert_eq!(e.get_byte(0x8001), ShadowValue::Unaddressable);
    assert_eq!(e.get_byte(0x8013), ShadowValue::Unaddressable);
    assert_eq!(e.check_range(0x8002, 0x11, ShadowValue::Defined).expect("check").bad_run(), None);
}

#[test]
fn test_uniform_region_no_alloc() {
    let e = engine();
    for (i, value) in ShadowValue::ALL.iter().enumerate() {
        let start = 0x10_0000 + u32::try_from(i).expect("small index") * 0x1_0000;
        e.set_range(start, u64::from(start) + UNIT_SIZE, *value)
            .expect("set_range should succeed");
        assert_eq!(e.special_value(start), Some(*value));
    }
    // re-setting special units to other uniform values also stays special
    e.set_range(0x10_0000, 0x14_0000, ShadowValue::Undefined)
        .expect("set_range should succeed");
    assert_eq!(e.special_value(0x13_ffff), Some(ShadowValue::Undefined));
    assert_eq!(e.stats().blocks_allocated, 0);
    assert_eq!(e.private_blocks(), 0);
}

#[test]
fn test_promotion_exactness() {
    for prior in ShadowValue::ALL {
        let e = engine();
        e.set_range(0x6_0000, 0x7_0000, prior).expect("set_range should succeed");
        let other = ShadowValue::ALL[(prior.code() as usize + 1) % 4];
        e.set_byte(0x6_1234, other).expect("set should succeed");

        assert_eq!(e.stats().blocks_allocated, 1);
        assert_eq!(e.private_blocks(), 1);
        assert_eq!(e.get_byte(0x6_1234), other);
        let before = e.check_range(0x6_0000, 0x1234, prior).expect("check should succeed");
        let after = e.check_range(0x6_1235, 0xedcb, prior).expect("check should succeed");
        assert!(before.is_match() && after.is_match());

        // restoring the prior value does not revert the unit
        e.set_byte(0x6_1234, prior).expect("set should succeed");
        assert!(!e.is_special(0x6_0000));
        assert_eq!(e.stats().blocks_allocated, 1);
    }
}

fn assert_memmove(src: u32, dst: u32, size: u32) {
    let e = engine();
    let lo = src.min(dst);
    let hi = src.max(dst) + size;
    for a in lo..hi {
        e.set_byte(a, value_at(a)).expect("set should succeed");
    }
    let expected = snapshot(&e, src, size);
    e.copy_range(src, dst, u64::from(size)).expect("copy should succeed");
    assert_eq!(snapshot(&e, dst, size), expected, "copy {src:#x} -> {dst:#x} ({size:#x})");
}

#[test]
fn test_copy_overlap_both_directions() {
    assert_memmove(0x9000, 0x9003, 0x40);
    assert_memmove(0x9003, 0x9000, 0x40);
    assert_memmove(0x9000, 0x9040, 0x40);
    assert_memmove(0x9000, 0x9001, 1);
    // overlap spanning a unit boundary
    assert_memmove(0xfff0, 0x1_0008, 0x20);
    assert_memmove(0x1_0008, 0xfff0, 0x20);
}

#[test]
fn test_copy_overlap_of_special_units() {
    let e = engine();
    e.set_range(0x10_0000, 0x11_0000, ShadowValue::Defined).expect("set_range should succeed");
    e.set_range(0x11_0000, 0x12_0000, ShadowValue::Undefined).expect("set_range should succeed");
    // shift two units up by one unit: the upper unit must be written first
    e.copy_range(0x10_0000, 0x11_0000, 0x2_0000).expect("copy should succeed");
    assert_eq!(e.special_value(0x11_0000), Some(ShadowValue::Defined));
    assert_eq!(e.special_value(0x12_0000), Some(ShadowValue::Undefined));
    assert_eq!(e.stats().blocks_allocated, 0);
}

#[test]
fn test_directed_search() {
    for layout in LAYOUTS {
        let e = engine_with(layout);
        e.set_range(0x2_0000, 0x4_0000, ShadowValue::Undefined).expect("set_range should succeed");
        let hits = [0x2_0040u32, 0x2_8000, 0x3_fffc];
        for hit in hits {
            e.set_dword(hit, layout.uniform_byte(ShadowValue::Defined))
                .expect("set should succeed");
        }

        let mut found = Vec::new();
        let mut pos = 0x2_0000u32;
        while let Some(hit) = e
            .find_next_matching_dword(pos, 0x4_0000, ShadowValue::Defined)
            .expect("search should succeed")
        {
            found.push(hit);
            pos = hit + 4;
        }
        assert_eq!(found, hits, "{}", layout.name());

        let mut found = Vec::new();
        let mut pos = 0x3_fffc_u32;
        while let Some(hit) = e
            .find_prev_matching_dword(pos, 0x1_ffff, ShadowValue::Defined)
            .expect("search should succeed")
        {
            found.push(hit);
            if hit < 0x2_0004 {
                break;
            }
            pos = hit - 4;
        }
        found.reverse();
        assert_eq!(found, hits, "{}", layout.name());
    }
}

#[test]
fn test_search_finds_special_unit_start() {
    let e = engine();
    e.set_range(0x7_0000, 0x8_0000, ShadowValue::BitLevel).expect("set_range should succeed");
    assert_eq!(
        e.find_next_matching_dword(0x1000, 0x10_0000, ShadowValue::BitLevel)
            .expect("search should succeed"),
        Some(0x7_0000)
    );
    // a special unit matches at the highest searched group inside it
    assert_eq!(
        e.find_prev_matching_dword(0xf_fffc, 0x1000, ShadowValue::BitLevel)
            .expect("search should succeed"),
        Some(0x7_fffc)
    );
    assert_eq!(
        e.find_prev_matching_dword(0x6_fffc, 0x1000, ShadowValue::BitLevel)
            .expect("search should succeed"),
        None
    );
}
