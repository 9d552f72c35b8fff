//! ItemPMT loader: item metadata (weapons, guards, units) plus the star
//! table, from the PRS-compressed `ItemPMT.prs` of each version family.
//!
//! The three file layouts differ only in field offsets and endianness, so
//! one set of runtime structs serves all of them. The unit tables are
//! pre-expanded by star count so random unit generation is a single draw.

use std::fs;
use std::path::Path;

use thiserror::Error;

use ragol_common::item::ITEM_KNIGHT_POWER;
use ragol_common::prs;
use ragol_common::rng::Mt19937;

#[derive(Debug, Error)]
pub enum PmtError {
    #[error("cannot read {0}: {1}")]
    Io(String, std::io::Error),
    #[error(transparent)]
    Prs(#[from] prs::PrsError),
    #[error("PMT pointer table is invalid")]
    BadPointers,
    #[error("PMT {0} table is out of file bounds")]
    BadTable(&'static str),
    #[error("PMT star table is too small")]
    BadStarTable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PmtVersion {
    V2,
    Gc,
    Bb,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct PmtWeapon {
    pub index: u32,
    pub classes: u8,
    pub atp_min: u16,
    pub atp_max: u16,
    pub max_grind: u8,
    pub special: u8,
    pub ata: u8,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct PmtGuard {
    pub index: u32,
    pub base_dfp: u16,
    pub base_evp: u16,
    pub level_req: u8,
    pub dfp_range: u8,
    pub evp_range: u8,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct PmtUnit {
    pub index: u32,
    pub stat: u16,
    pub amount: u16,
    pub pm_range: u8,
}

pub struct PmtData {
    version: PmtVersion,
    weapons: Vec<Vec<PmtWeapon>>,
    weapon_lowest: u32,
    guards: Vec<Vec<PmtGuard>>,
    guard_lowest: u32,
    units: Vec<PmtUnit>,
    unit_lowest: u32,
    star_table: Vec<u8>,
    units_by_stars: Vec<u64>,
    units_with_stars: Vec<u32>,
    unit_max_stars: u8,
}

struct Layout {
    big_endian: bool,
    ptr_count: usize,
    weapons_ptr: usize,
    weapons_bound: usize,
    guards_ptr: usize,
    guards_bound: usize,
    units_ptr: usize,
    stars_lo: usize,
    stars_hi: usize,
    weapon_size: usize,
    guard_size: usize,
    unit_size: usize,
}

impl PmtVersion {
    fn layout(self) -> Layout {
        match self {
            PmtVersion::V2 => Layout {
                big_endian: false,
                ptr_count: 21,
                weapons_ptr: 1,
                weapons_bound: 11,
                guards_ptr: 2,
                guards_bound: 3,
                units_ptr: 3,
                stars_lo: 12,
                stars_hi: 13,
                weapon_size: 24,
                guard_size: 24,
                unit_size: 12,
            },
            PmtVersion::Gc => Layout {
                big_endian: true,
                ptr_count: 23,
                weapons_ptr: 0,
                weapons_bound: 17,
                guards_ptr: 1,
                guards_bound: 2,
                units_ptr: 2,
                stars_lo: 11,
                stars_hi: 12,
                weapon_size: 40,
                guard_size: 28,
                unit_size: 16,
            },
            PmtVersion::Bb => Layout {
                big_endian: false,
                ptr_count: 23,
                weapons_ptr: 0,
                weapons_bound: 17,
                guards_ptr: 1,
                guards_bound: 2,
                units_ptr: 2,
                stars_lo: 11,
                stars_hi: 12,
                weapon_size: 44,
                guard_size: 32,
                unit_size: 20,
            },
        }
    }
}

fn rd16(data: &[u8], off: usize, be: bool) -> u16 {
    let b = [data[off], data[off + 1]];
    if be {
        u16::from_be_bytes(b)
    } else {
        u16::from_le_bytes(b)
    }
}

fn rd32(data: &[u8], off: usize, be: bool) -> u32 {
    let b = [data[off], data[off + 1], data[off + 2], data[off + 3]];
    if be {
        u32::from_be_bytes(b)
    } else {
        u32::from_le_bytes(b)
    }
}

fn parse_weapon(version: PmtVersion, c: &[u8], be: bool) -> PmtWeapon {
    match version {
        PmtVersion::V2 => PmtWeapon {
            index: rd32(c, 0, be),
            classes: c[4],
            atp_min: rd16(c, 6, be),
            atp_max: rd16(c, 8, be),
            max_grind: c[16],
            special: c[18],
            ata: c[19],
        },
        PmtVersion::Gc => PmtWeapon {
            index: rd32(c, 0, be),
            classes: c[9],
            atp_min: rd16(c, 10, be),
            atp_max: rd16(c, 12, be),
            max_grind: c[22],
            special: c[24],
            ata: c[25],
        },
        PmtVersion::Bb => PmtWeapon {
            index: rd32(c, 0, be),
            classes: c[12],
            atp_min: rd16(c, 14, be),
            atp_max: rd16(c, 16, be),
            max_grind: c[26],
            special: c[28],
            ata: c[29],
        },
    }
}

fn parse_guard(version: PmtVersion, c: &[u8], be: bool) -> PmtGuard {
    match version {
        PmtVersion::V2 => PmtGuard {
            index: rd32(c, 0, be),
            base_dfp: rd16(c, 4, be),
            base_evp: rd16(c, 6, be),
            level_req: c[12],
            dfp_range: c[18],
            evp_range: c[19],
        },
        PmtVersion::Gc => PmtGuard {
            index: rd32(c, 0, be),
            base_dfp: rd16(c, 8, be),
            base_evp: rd16(c, 10, be),
            level_req: c[16],
            dfp_range: c[22],
            evp_range: c[23],
        },
        PmtVersion::Bb => PmtGuard {
            index: rd32(c, 0, be),
            base_dfp: rd16(c, 12, be),
            base_evp: rd16(c, 14, be),
            level_req: c[20],
            dfp_range: c[26],
            evp_range: c[27],
        },
    }
}

fn parse_unit(version: PmtVersion, c: &[u8], be: bool) -> PmtUnit {
    match version {
        PmtVersion::V2 => PmtUnit {
            index: rd32(c, 0, be),
            stat: rd16(c, 4, be),
            amount: rd16(c, 6, be),
            pm_range: c[8],
        },
        PmtVersion::Gc => PmtUnit {
            index: rd32(c, 0, be),
            stat: rd16(c, 8, be),
            amount: rd16(c, 10, be),
            pm_range: c[12],
        },
        PmtVersion::Bb => PmtUnit {
            index: rd32(c, 0, be),
            stat: rd16(c, 12, be),
            amount: rd16(c, 14, be),
            pm_range: c[16],
        },
    }
}

impl PmtData {
    /// Read and parse an `ItemPMT.prs`. `norestrict` keeps +/- unit
    /// variants whose stat the game would normally exclude.
    pub fn read(path: &Path, version: PmtVersion, norestrict: bool) -> Result<PmtData, PmtError> {
        let fname = path.display().to_string();
        let compressed = fs::read(path).map_err(|e| PmtError::Io(fname, e))?;
        let pmt = prs::decompress(&compressed)?;

        Self::parse(&pmt, version, norestrict)
    }

    pub fn parse(pmt: &[u8], version: PmtVersion, norestrict: bool) -> Result<PmtData, PmtError> {
        let lay = version.layout();
        let sz = pmt.len();

        if sz < 16 {
            return Err(PmtError::BadPointers);
        }

        // The pointer table's location sits 16 bytes from the end.
        let tbl = rd32(pmt, sz - 16, lay.big_endian) as usize;

        if tbl + 4 * lay.ptr_count > sz - 16 {
            return Err(PmtError::BadPointers);
        }

        let ptrs: Vec<usize> = (0..lay.ptr_count)
            .map(|i| rd32(pmt, tbl + i * 4, lay.big_endian) as usize)
            .collect();

        // Weapons: a table of {count, offset} pairs, one per weapon class.
        let wbase = ptrs[lay.weapons_ptr];
        let wbound = ptrs[lay.weapons_bound];

        if wbase > sz || wbase > wbound {
            return Err(PmtError::BadTable("weapon"));
        }

        let wtypes = (wbound - wbase) / 8;
        let mut weapons = Vec::with_capacity(wtypes);
        let mut weapon_lowest = u32::MAX;

        for i in 0..wtypes {
            let count = rd32(pmt, wbase + i * 8, lay.big_endian) as usize;
            let off = rd32(pmt, wbase + i * 8 + 4, lay.big_endian) as usize;

            if off + lay.weapon_size * count > sz {
                return Err(PmtError::BadTable("weapon"));
            }

            let mut tbl = Vec::with_capacity(count);
            for j in 0..count {
                let w = parse_weapon(
                    version,
                    &pmt[off + j * lay.weapon_size..off + (j + 1) * lay.weapon_size],
                    lay.big_endian,
                );

                if w.index < weapon_lowest {
                    weapon_lowest = w.index;
                }

                tbl.push(w);
            }

            weapons.push(tbl);
        }

        // Guards: always exactly two tables (armors, then shields).
        let gbase = ptrs[lay.guards_ptr];
        let gbound = ptrs[lay.guards_bound];

        if gbound > sz || gbase > gbound || (gbound - gbase) / 8 != 2 {
            return Err(PmtError::BadTable("guard"));
        }

        let mut guards = Vec::with_capacity(2);
        let mut guard_lowest = u32::MAX;

        for i in 0..2 {
            let count = rd32(pmt, gbase + i * 8, lay.big_endian) as usize;
            let off = rd32(pmt, gbase + i * 8 + 4, lay.big_endian) as usize;

            if off + lay.guard_size * count > sz {
                return Err(PmtError::BadTable("guard"));
            }

            let mut tbl = Vec::with_capacity(count);
            for j in 0..count {
                let g = parse_guard(
                    version,
                    &pmt[off + j * lay.guard_size..off + (j + 1) * lay.guard_size],
                    lay.big_endian,
                );

                if g.index < guard_lowest {
                    guard_lowest = g.index;
                }

                tbl.push(g);
            }

            guards.push(tbl);
        }

        // Units: one {count, offset} pair.
        let ubase = ptrs[lay.units_ptr];

        if ubase + 8 > sz {
            return Err(PmtError::BadTable("unit"));
        }

        let ucount = rd32(pmt, ubase, lay.big_endian) as usize;
        let uoff = rd32(pmt, ubase + 4, lay.big_endian) as usize;

        if uoff + lay.unit_size * ucount > sz {
            return Err(PmtError::BadTable("unit"));
        }

        let mut units = Vec::with_capacity(ucount);
        let mut unit_lowest = u32::MAX;

        for j in 0..ucount {
            let u = parse_unit(
                version,
                &pmt[uoff + j * lay.unit_size..uoff + (j + 1) * lay.unit_size],
                lay.big_endian,
            );

            if u.index < unit_lowest {
                unit_lowest = u.index;
            }

            units.push(u);
        }

        // Star table: a flat byte run between two pointers, indexed by
        // (item index - lowest weapon index).
        let slo = ptrs[lay.stars_lo];
        let shi = ptrs[lay.stars_hi];

        if slo > sz || shi > sz || shi < slo {
            return Err(PmtError::BadPointers);
        }

        let star_table = pmt[slo..shi].to_vec();

        if (star_table.len() as u32) < unit_lowest.wrapping_add(ucount as u32).wrapping_sub(weapon_lowest) {
            return Err(PmtError::BadStarTable);
        }

        let mut data = PmtData {
            version,
            weapons,
            weapon_lowest,
            guards,
            guard_lowest,
            units,
            unit_lowest,
            star_table,
            units_by_stars: Vec::new(),
            units_with_stars: Vec::new(),
            unit_max_stars: 0,
        };

        data.build_units(norestrict);

        log::debug!(
            "PMT parsed: {} weapon classes, lowest indices {}/{}/{}, {} units",
            data.weapons.len(),
            data.weapon_lowest,
            data.guard_lowest,
            data.unit_lowest,
            data.units.len()
        );

        Ok(data)
    }

    pub fn version(&self) -> PmtVersion {
        self.version
    }

    /// Pre-sort units by star value, with the +/- variants adjacent to
    /// their base star count, so a random draw below a cap is O(1). Index
    /// zero keeps the game's failsafe of a plain Knight/Power.
    fn build_units(&mut self, norestrict: bool) {
        let mut max = 0u8;

        for (i, _) in self.units.iter().enumerate() {
            let star = self.star_index(self.unit_lowest + i as u32).unwrap_or(0);
            if star > max {
                max = star;
            }
        }

        // One beyond, to cover + and ++ variants of the last unit.
        self.unit_max_stars = max + 1;

        self.units_by_stars.push(ITEM_KNIGHT_POWER as u64);
        self.units_with_stars = Vec::with_capacity(self.unit_max_stars as usize + 1);
        let mut k = 1u32;

        for i in 0..=self.unit_max_stars as i32 {
            for (j, unit) in self.units.iter().enumerate() {
                let star = self.star_index(self.unit_lowest + j as u32).unwrap_or(0) as i32;
                let ok_stat = unit.stat <= 3 || norestrict;

                if star - 1 == i && unit.pm_range != 0 && ok_stat {
                    let pm = -2i16 * unit.pm_range as i16;
                    self.units_by_stars
                        .push(0x0000_0301 | ((j as u64) << 16) | ((pm as u16 as u64) << 48));
                    let pm = -(unit.pm_range as i16);
                    self.units_by_stars
                        .push(0x0000_0301 | ((j as u64) << 16) | ((pm as u16 as u64) << 48));
                    k += 2;
                } else if star == i {
                    self.units_by_stars.push(0x0000_0301 | ((j as u64) << 16));
                    k += 1;
                } else if star + 1 == i && unit.pm_range != 0 && ok_stat {
                    let pm = 2i16 * unit.pm_range as i16;
                    self.units_by_stars
                        .push(0x0000_0301 | ((j as u64) << 16) | ((pm as u16 as u64) << 48));
                    let pm = unit.pm_range as i16;
                    self.units_by_stars
                        .push(0x0000_0301 | ((j as u64) << 16) | ((pm as u16 as u64) << 48));
                    k += 2;
                }
            }

            self.units_with_stars.push(k);
        }
    }

    fn star_index(&self, item_index: u32) -> Option<u8> {
        let idx = item_index.wrapping_sub(self.weapon_lowest) as usize;
        self.star_table.get(idx).copied()
    }

    pub fn lookup_weapon(&self, code: u32) -> Option<PmtWeapon> {
        if code & 0xFF != 0x00 {
            return None;
        }

        let class = ((code >> 8) & 0xFF) as usize;
        let num = ((code >> 16) & 0xFF) as usize;

        self.weapons.get(class)?.get(num).copied()
    }

    pub fn lookup_guard(&self, code: u32) -> Option<PmtGuard> {
        if code & 0xFF != 0x01 {
            return None;
        }

        let kind = ((code >> 8) & 0xFF) as usize;
        if kind == 0x03 || kind == 0 {
            return None;
        }

        let num = ((code >> 16) & 0xFF) as usize;
        self.guards.get(kind - 1)?.get(num).copied()
    }

    pub fn lookup_unit(&self, code: u32) -> Option<PmtUnit> {
        if code & 0xFF != 0x01 || (code >> 8) & 0xFF != 0x03 {
            return None;
        }

        let num = ((code >> 16) & 0xFF) as usize;
        self.units.get(num).copied()
    }

    /// Star (rarity) rating for an item code, or `None` when unknown.
    pub fn lookup_stars(&self, code: u32) -> Option<u8> {
        match code & 0xFF {
            0x00 => {
                let w = self.lookup_weapon(code)?;
                self.star_index(w.index)
            }
            0x01 => match (code >> 8) & 0xFF {
                0x01 | 0x02 => {
                    let g = self.lookup_guard(code)?;
                    self.star_index(g.index)
                }
                0x03 => {
                    let u = self.lookup_unit(code)?;
                    self.star_index(u.index)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Draw a random unit at or below `max` stars.
    pub fn random_unit(&self, max: u8, rng: &mut Mt19937) -> [u32; 4] {
        let max = max.min(self.unit_max_stars) as usize;
        let bound = self.units_with_stars[max];
        let unit = self.units_by_stars[(rng.genrand_int32() % bound) as usize];

        [unit as u32, (unit >> 32) as u32, 0, 0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_looks_up_the_tables() {
        let pmt = PmtData::parse(&crate::items::pmt_test_image(), PmtVersion::V2, true).unwrap();

        let w = pmt.lookup_weapon(0x0000_0000).unwrap();
        assert_eq!(w.index, 100);
        assert_eq!(w.max_grind, 5);

        let g = pmt.lookup_guard(0x0000_0101).unwrap();
        assert_eq!(g.index, 110);
        assert_eq!(g.dfp_range, 3);

        let u = pmt.lookup_unit(0x0000_0301).unwrap();
        assert_eq!(u.index, 120);

        assert_eq!(pmt.lookup_stars(0x0000_0000), Some(4));
        assert_eq!(pmt.lookup_stars(0x0000_0301), Some(2));
        assert_eq!(pmt.lookup_stars(0x0001_0301), Some(9));
        assert!(pmt.lookup_guard(0x0000_0301).is_none());
    }

    #[test]
    fn random_units_respect_the_star_cap() {
        let pmt = PmtData::parse(&crate::items::pmt_test_image(), PmtVersion::V2, true).unwrap();
        let mut rng = Mt19937::new(42);

        // With a cap of 0 stars only the failsafe Knight/Power exists.
        for _ in 0..32 {
            let item = pmt.random_unit(0, &mut rng);
            assert_eq!(item[0], ITEM_KNIGHT_POWER);
        }

        // With a high cap, unit index 1 (9 stars > cap 5) stays excluded
        // but unit 0 and its +/- variants appear.
        let mut seen_base = false;
        for _ in 0..256 {
            let item = pmt.random_unit(5, &mut rng);
            let unit_num = (item[0] >> 16) & 0xFF;
            assert_ne!(unit_num, 1);
            if item[0] == 0x0000_0301 {
                seen_base = true;
            }
        }
        assert!(seen_base);
    }

    #[test]
    fn truncated_pointer_table_is_rejected() {
        let pmt = vec![0u8; 32];
        assert!(PmtData::parse(&pmt, PmtVersion::V2, false).is_err());
    }

    /// The GC/BB pointer tables differ from v2: weapons live at ptrs[0]
    /// bounded by ptrs[17], guards at ptrs[1], units at ptrs[2], stars at
    /// ptrs[11]/ptrs[12]. Build a minimal BB image to pin those indices.
    #[test]
    fn bb_layout_reads_the_v3_pointer_indices() {
        let mut pmt = vec![0u8; 0x400];

        // One weapon (44-byte entries), index 100, max_grind at +26.
        pmt[0x20..0x24].copy_from_slice(&100u32.to_le_bytes());
        pmt[0x20 + 26] = 7;

        // Armor (index 110) and shield (111), 32-byte entries, with the
        // dfp/evp ranges at +26/+27.
        pmt[0x60..0x64].copy_from_slice(&110u32.to_le_bytes());
        pmt[0x60 + 26] = 3;
        pmt[0x60 + 27] = 2;
        pmt[0x80..0x84].copy_from_slice(&111u32.to_le_bytes());

        // Two units (20-byte entries), indices 120/121, stat at +12.
        pmt[0xA0..0xA4].copy_from_slice(&120u32.to_le_bytes());
        pmt[0xA0 + 12..0xA0 + 14].copy_from_slice(&1u16.to_le_bytes());
        pmt[0xA0 + 16] = 1; // pm_range
        pmt[0xB4..0xB8].copy_from_slice(&121u32.to_le_bytes());
        pmt[0xB4 + 12..0xB4 + 14].copy_from_slice(&2u16.to_le_bytes());

        // Weapon class table at 0x100: {count=1, offset=0x20}.
        pmt[0x100..0x104].copy_from_slice(&1u32.to_le_bytes());
        pmt[0x104..0x108].copy_from_slice(&0x20u32.to_le_bytes());

        // Guard tables at 0x110, bounded by the unit pointer at 0x120.
        pmt[0x110..0x114].copy_from_slice(&1u32.to_le_bytes());
        pmt[0x114..0x118].copy_from_slice(&0x60u32.to_le_bytes());
        pmt[0x118..0x11C].copy_from_slice(&1u32.to_le_bytes());
        pmt[0x11C..0x120].copy_from_slice(&0x80u32.to_le_bytes());
        pmt[0x120..0x124].copy_from_slice(&2u32.to_le_bytes());
        pmt[0x124..0x128].copy_from_slice(&0xA0u32.to_le_bytes());

        // Star table: weapon 100 -> 4 stars; guards 1/1; units 2 and 9.
        pmt[0x200] = 4;
        pmt[0x200 + 10] = 1;
        pmt[0x200 + 11] = 1;
        pmt[0x200 + 20] = 2;
        pmt[0x200 + 21] = 9;
        let star_end = 0x200u32 + 22;

        let mut ptrs = [0u32; 23];
        ptrs[0] = 0x100; // weapons
        ptrs[17] = 0x108; // weapons bound (one class)
        ptrs[1] = 0x110; // guards
        ptrs[2] = 0x120; // guards bound == units ptr
        ptrs[11] = 0x200; // stars
        ptrs[12] = star_end;

        for (i, p) in ptrs.iter().enumerate() {
            pmt[0x300 + i * 4..0x304 + i * 4].copy_from_slice(&p.to_le_bytes());
        }

        let len = pmt.len();
        pmt[len - 16..len - 12].copy_from_slice(&0x300u32.to_le_bytes());

        let data = PmtData::parse(&pmt, PmtVersion::Bb, true).unwrap();

        let w = data.lookup_weapon(0x0000_0000).unwrap();
        assert_eq!(w.index, 100);
        assert_eq!(w.max_grind, 7);

        let g = data.lookup_guard(0x0000_0101).unwrap();
        assert_eq!(g.index, 110);
        assert_eq!(g.dfp_range, 3);
        assert_eq!(g.evp_range, 2);

        assert_eq!(data.lookup_unit(0x0000_0301).unwrap().index, 120);
        assert_eq!(data.lookup_stars(0x0000_0000), Some(4));
        assert_eq!(data.lookup_stars(0x0001_0301), Some(9));
    }
}
