//! The item engine: PT/PMT/RT data and the drop algorithms.

pub mod drops;
pub mod pmt;
pub mod pt;
pub mod rt;

/// A synthetic but structurally valid v2 `ItemPMT` image shared by the
/// pmt and drop-engine tests: one weapon class with one weapon (index
/// 100), an armor and a shield (110/111), and two units (120/121).
#[cfg(test)]
pub(crate) fn pmt_test_image() -> Vec<u8> {
    let mut pmt = vec![0u8; 0x400];

    // Weapon entry at 0x20, index 100.
    pmt[0x20..0x24].copy_from_slice(&100u32.to_le_bytes());
    pmt[0x20 + 16] = 5; // max_grind

    // Guard entries at 0x40 (armor, index 110) and 0x58 (shield, 111).
    pmt[0x40..0x44].copy_from_slice(&110u32.to_le_bytes());
    pmt[0x40 + 18] = 3; // dfp_range
    pmt[0x40 + 19] = 2; // evp_range
    pmt[0x58..0x5C].copy_from_slice(&111u32.to_le_bytes());

    // Units at 0x70: index 120 and 121, pm_range 1 on the first.
    pmt[0x70..0x74].copy_from_slice(&120u32.to_le_bytes());
    pmt[0x74..0x76].copy_from_slice(&1u16.to_le_bytes()); // stat
    pmt[0x76..0x78].copy_from_slice(&5u16.to_le_bytes()); // amount
    pmt[0x78] = 1; // pm_range
    pmt[0x7C..0x80].copy_from_slice(&121u32.to_le_bytes());
    pmt[0x80..0x82].copy_from_slice(&2u16.to_le_bytes());

    // Weapon class table at 0x100: {count=1, offset=0x20}.
    pmt[0x100..0x104].copy_from_slice(&1u32.to_le_bytes());
    pmt[0x104..0x108].copy_from_slice(&0x20u32.to_le_bytes());

    // Guard tables at 0x110: two {count, offset} pairs.
    pmt[0x110..0x114].copy_from_slice(&1u32.to_le_bytes());
    pmt[0x114..0x118].copy_from_slice(&0x40u32.to_le_bytes());
    pmt[0x118..0x11C].copy_from_slice(&1u32.to_le_bytes());
    pmt[0x11C..0x120].copy_from_slice(&0x58u32.to_le_bytes());

    // Unit pointer at 0x120, which also bounds the guard tables:
    // {count=2, offset=0x70}.
    pmt[0x120..0x124].copy_from_slice(&2u32.to_le_bytes());
    pmt[0x124..0x128].copy_from_slice(&0x70u32.to_le_bytes());

    // Star table at 0x200: weapon_lowest == 100, so units sit at +20/+21.
    // Stars: weapon 100 -> 4; armor 110 -> 1; shield 111 -> 1;
    // unit 120 -> 2; unit 121 -> 9.
    pmt[0x200] = 4;
    pmt[0x200 + 10] = 1;
    pmt[0x200 + 11] = 1;
    pmt[0x200 + 20] = 2;
    pmt[0x200 + 21] = 9;
    let star_end = 0x200 + 22;

    // Pointer table at 0x300.
    let mut ptrs = [0u32; 21];
    ptrs[1] = 0x100; // weapons
    ptrs[11] = 0x108; // weapons bound (1 class)
    ptrs[2] = 0x110; // guards
    ptrs[3] = 0x120; // guards bound == units ptr
    ptrs[12] = 0x200; // stars
    ptrs[13] = star_end as u32;

    for (i, p) in ptrs.iter().enumerate() {
        pmt[0x300 + i * 4..0x304 + i * 4].copy_from_slice(&p.to_le_bytes());
    }

    let len = pmt.len();
    pmt[len - 16..len - 12].copy_from_slice(&0x300u32.to_le_bytes());
    pmt
}
