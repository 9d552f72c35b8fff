//! ItemPT loaders: the per-(episode, difficulty, section) drop parameter
//! tables. The v2 set ships as an AFS archive of little-endian entries, the
//! v3 set (GC and Blue Burst) as a GSL archive of big-endian `.rel` files.

use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtError {
    #[error("cannot read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("{0} is not an AFS archive")]
    BadAfs(String),
    #[error("{0} is not a GSL archive")]
    BadGsl(String),
    #[error("{0} appears to be incomplete")]
    Incomplete(String),
    #[error("{0} has an invalid sized entry")]
    BadEntrySize(String),
}

pub const PT_V2_ENTRY_SIZE: usize = 0x940;
pub const PT_V3_ENTRY_SIZE: usize = 0x9E0;

/// One (difficulty, section) entry of the v2 tables.
#[derive(Debug, Clone)]
pub struct PtV2Entry {
    pub weapon_ratio: [u8; 12],
    pub weapon_minrank: [i8; 12],
    pub weapon_upgfloor: [u8; 12],
    pub power_pattern: [[u8; 4]; 9],
    pub percent_pattern: [[u8; 5]; 23],
    pub area_pattern: [[u8; 10]; 3],
    pub percent_attachment: [[u8; 10]; 6],
    pub element_ranking: [u8; 10],
    pub element_probability: [u8; 10],
    pub armor_ranking: [u8; 5],
    pub slot_ranking: [u8; 5],
    pub unit_level: [u8; 10],
    pub tool_frequency: [[u16; 10]; 28],
    pub tech_frequency: [[u8; 10]; 19],
    pub tech_levels: [[i8; 20]; 19],
    pub enemy_dar: [u8; 100],
    pub enemy_meseta: [(u16, u16); 100],
    pub enemy_drop: [i8; 100],
    pub box_meseta: [(u16, u16); 10],
    pub box_drop: [[u8; 10]; 7],
    pub armor_level: u32,
}

/// One (episode, difficulty, section) entry of the v3 tables. Same shape
/// as v2 except the percent patterns are 16-bit, out of 10000.
#[derive(Debug, Clone)]
pub struct PtV3Entry {
    pub weapon_ratio: [u8; 12],
    pub weapon_minrank: [i8; 12],
    pub weapon_upgfloor: [u8; 12],
    pub power_pattern: [[u8; 4]; 9],
    pub percent_pattern: [[u16; 6]; 23],
    pub area_pattern: [[u8; 10]; 3],
    pub percent_attachment: [[u8; 10]; 6],
    pub element_ranking: [u8; 10],
    pub element_probability: [u8; 10],
    pub armor_ranking: [u8; 5],
    pub slot_ranking: [u8; 5],
    pub unit_level: [u8; 10],
    pub tool_frequency: [[u16; 10]; 28],
    pub tech_frequency: [[u8; 10]; 19],
    pub tech_levels: [[i8; 20]; 19],
    pub enemy_dar: [u8; 100],
    pub enemy_meseta: [(u16, u16); 100],
    pub enemy_drop: [i8; 100],
    pub box_meseta: [(u16, u16); 10],
    pub box_drop: [[u8; 10]; 7],
    pub armor_level: u32,
}

/// All 40 v2 entries: `[difficulty][section]`.
pub struct PtV2Data {
    pub entries: Vec<PtV2Entry>,
}

impl PtV2Data {
    pub fn entry(&self, difficulty: u8, section: u8) -> &PtV2Entry {
        &self.entries[(difficulty as usize & 3) * 10 + (section as usize % 10)]
    }
}

/// All 160 v3 entries: `[episode][difficulty][section]` with two episodes.
pub struct PtV3Data {
    pub entries: Vec<PtV3Entry>,
}

impl PtV3Data {
    pub fn entry(&self, episode: u8, difficulty: u8, section: u8) -> &PtV3Entry {
        let ep = match episode {
            2 => 1,
            _ => 0,
        };
        &self.entries[ep * 40 + (difficulty as usize & 3) * 10 + (section as usize % 10)]
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> u8 {
        let v = self.data[self.pos];
        self.pos += 1;
        v
    }

    fn i8(&mut self) -> i8 {
        self.u8() as i8
    }

    fn u16(&mut self) -> u16 {
        let b = [self.data[self.pos], self.data[self.pos + 1]];
        self.pos += 2;
        if self.big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        }
    }

    fn u32(&mut self) -> u32 {
        let b = [
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ];
        self.pos += 4;
        if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

macro_rules! fill {
    ($cur:expr, u8; $n:expr) => {{
        let mut out = [0u8; $n];
        for v in out.iter_mut() {
            *v = $cur.u8();
        }
        out
    }};
    ($cur:expr, i8; $n:expr) => {{
        let mut out = [0i8; $n];
        for v in out.iter_mut() {
            *v = $cur.i8();
        }
        out
    }};
}

pub fn parse_v2_entry(data: &[u8]) -> PtV2Entry {
    let mut c = Cursor {
        data,
        pos: 0,
        big_endian: false,
    };

    let weapon_ratio = fill!(c, u8; 12);
    let weapon_minrank = fill!(c, i8; 12);
    let weapon_upgfloor = fill!(c, u8; 12);

    let mut power_pattern = [[0u8; 4]; 9];
    for row in power_pattern.iter_mut() {
        *row = fill!(c, u8; 4);
    }

    let mut percent_pattern = [[0u8; 5]; 23];
    for row in percent_pattern.iter_mut() {
        *row = fill!(c, u8; 5);
    }

    let mut area_pattern = [[0u8; 10]; 3];
    for row in area_pattern.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    let mut percent_attachment = [[0u8; 10]; 6];
    for row in percent_attachment.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    let element_ranking = fill!(c, u8; 10);
    let element_probability = fill!(c, u8; 10);
    let armor_ranking = fill!(c, u8; 5);
    let slot_ranking = fill!(c, u8; 5);
    let unit_level = fill!(c, u8; 10);
    c.skip(1); // padding

    let mut tool_frequency = [[0u16; 10]; 28];
    for row in tool_frequency.iter_mut() {
        for v in row.iter_mut() {
            *v = c.u16();
        }
    }

    let mut tech_frequency = [[0u8; 10]; 19];
    for row in tech_frequency.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    let mut tech_levels = [[0i8; 20]; 19];
    for row in tech_levels.iter_mut() {
        *row = fill!(c, i8; 20);
    }

    let enemy_dar = fill!(c, u8; 100);

    let mut enemy_meseta = [(0u16, 0u16); 100];
    for v in enemy_meseta.iter_mut() {
        *v = (c.u16(), c.u16());
    }

    let enemy_drop = fill!(c, i8; 100);

    let mut box_meseta = [(0u16, 0u16); 10];
    for v in box_meseta.iter_mut() {
        *v = (c.u16(), c.u16());
    }

    let mut box_drop = [[0u8; 10]; 7];
    for row in box_drop.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    c.skip(2); // padding
    c.skip(18 * 4); // pointers, not needed in memory
    let armor_level = c.u32();

    PtV2Entry {
        weapon_ratio,
        weapon_minrank,
        weapon_upgfloor,
        power_pattern,
        percent_pattern,
        area_pattern,
        percent_attachment,
        element_ranking,
        element_probability,
        armor_ranking,
        slot_ranking,
        unit_level,
        tool_frequency,
        tech_frequency,
        tech_levels,
        enemy_dar,
        enemy_meseta,
        enemy_drop,
        box_meseta,
        box_drop,
        armor_level,
    }
}

pub fn parse_v3_entry(data: &[u8]) -> PtV3Entry {
    let mut c = Cursor {
        data,
        pos: 0,
        big_endian: true,
    };

    let weapon_ratio = fill!(c, u8; 12);
    let weapon_minrank = fill!(c, i8; 12);
    let weapon_upgfloor = fill!(c, u8; 12);

    let mut power_pattern = [[0u8; 4]; 9];
    for row in power_pattern.iter_mut() {
        *row = fill!(c, u8; 4);
    }

    let mut percent_pattern = [[0u16; 6]; 23];
    for row in percent_pattern.iter_mut() {
        for v in row.iter_mut() {
            *v = c.u16();
        }
    }

    let mut area_pattern = [[0u8; 10]; 3];
    for row in area_pattern.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    let mut percent_attachment = [[0u8; 10]; 6];
    for row in percent_attachment.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    let element_ranking = fill!(c, u8; 10);
    let element_probability = fill!(c, u8; 10);
    let armor_ranking = fill!(c, u8; 5);
    let slot_ranking = fill!(c, u8; 5);
    let unit_level = fill!(c, u8; 10);

    let mut tool_frequency = [[0u16; 10]; 28];
    for row in tool_frequency.iter_mut() {
        for v in row.iter_mut() {
            *v = c.u16();
        }
    }

    let mut tech_frequency = [[0u8; 10]; 19];
    for row in tech_frequency.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    let mut tech_levels = [[0i8; 20]; 19];
    for row in tech_levels.iter_mut() {
        *row = fill!(c, i8; 20);
    }

    let enemy_dar = fill!(c, u8; 100);

    let mut enemy_meseta = [(0u16, 0u16); 100];
    for v in enemy_meseta.iter_mut() {
        *v = (c.u16(), c.u16());
    }

    let enemy_drop = fill!(c, i8; 100);

    let mut box_meseta = [(0u16, 0u16); 10];
    for v in box_meseta.iter_mut() {
        *v = (c.u16(), c.u16());
    }

    let mut box_drop = [[0u8; 10]; 7];
    for row in box_drop.iter_mut() {
        *row = fill!(c, u8; 10);
    }

    c.skip(2);
    c.skip(18 * 4);
    let armor_level = c.u32();

    PtV3Entry {
        weapon_ratio,
        weapon_minrank,
        weapon_upgfloor,
        power_pattern,
        percent_pattern,
        area_pattern,
        percent_attachment,
        element_ranking,
        element_probability,
        armor_ranking,
        slot_ranking,
        unit_level,
        tool_frequency,
        tech_frequency,
        tech_levels,
        enemy_dar,
        enemy_meseta,
        enemy_drop,
        box_meseta,
        box_drop,
        armor_level,
    }
}

/// AFS archives: "AFS\0", file count, then (offset, size) pairs.
pub fn afs_entries(data: &[u8], fname: &str) -> Result<Vec<(usize, usize)>, PtError> {
    if data.len() < 8 || &data[0..4] != b"AFS\0" {
        return Err(PtError::BadAfs(fname.into()));
    }

    let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let mut out = Vec::with_capacity(count);

    for i in 0..count {
        let off = 8 + i * 8;
        if off + 8 > data.len() {
            return Err(PtError::Incomplete(fname.into()));
        }

        let fo = u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
            as usize;
        let fs = u32::from_le_bytes([data[off + 4], data[off + 5], data[off + 6], data[off + 7]])
            as usize;

        if fo + fs > data.len() {
            return Err(PtError::Incomplete(fname.into()));
        }

        out.push((fo, fs));
    }

    Ok(out)
}

/// GSL archives: 48-byte entries of `{name[32], offset, size}` until a
/// blank name. Offsets count 2048-byte sectors, big-endian on GC and
/// little-endian on Blue Burst; detect by sanity-checking the first entry.
pub fn gsl_entries(data: &[u8], fname: &str) -> Result<Vec<(String, usize, usize)>, PtError> {
    let mut out = Vec::new();

    let read32 = |b: &[u8], be: bool| -> usize {
        let arr = [b[0], b[1], b[2], b[3]];
        (if be {
            u32::from_be_bytes(arr)
        } else {
            u32::from_le_bytes(arr)
        }) as usize
    };

    if data.len() < 48 {
        return Err(PtError::BadGsl(fname.into()));
    }

    let be_off = read32(&data[32..36], true) * 2048;
    let big_endian = be_off < data.len();

    let mut pos = 0usize;
    while pos + 48 <= data.len() {
        let name_raw = &data[pos..pos + 32];
        if name_raw[0] == 0 {
            break;
        }

        let name_len = name_raw.iter().position(|&b| b == 0).unwrap_or(32);
        let name = String::from_utf8_lossy(&name_raw[..name_len]).into_owned();

        let offset = read32(&data[pos + 32..pos + 36], big_endian) * 2048;
        let size = read32(&data[pos + 36..pos + 40], big_endian);

        if offset + size > data.len() {
            return Err(PtError::Incomplete(fname.into()));
        }

        out.push((name, offset, size));
        pos += 48;
    }

    Ok(out)
}

/// Read the v2 ItemPT.afs: 40 entries, `[difficulty][section]` in order.
pub fn read_v2(path: &Path) -> Result<PtV2Data, PtError> {
    let fname = path.display().to_string();
    let data = fs::read(path).map_err(|e| PtError::Io(fname.clone(), e))?;

    let files = afs_entries(&data, &fname)?;
    if files.len() != 40 {
        return Err(PtError::Incomplete(fname));
    }

    let mut entries = Vec::with_capacity(40);
    for (off, sz) in files {
        if sz != PT_V2_ENTRY_SIZE {
            return Err(PtError::BadEntrySize(fname));
        }

        entries.push(parse_v2_entry(&data[off..off + sz]));
    }

    Ok(PtV2Data { entries })
}

/// Read a v3 ItemPT.gsl: 160 files named `ItemPT[l]{n,h,v,u}{section}.rel`.
pub fn read_v3(path: &Path) -> Result<PtV3Data, PtError> {
    const DIFFICULTIES: [char; 4] = ['n', 'h', 'v', 'u'];
    const EPISODES: [&str; 2] = ["", "l"];

    let fname = path.display().to_string();
    let data = fs::read(path).map_err(|e| PtError::Io(fname.clone(), e))?;

    let files = gsl_entries(&data, &fname)?;
    if files.len() != 160 {
        return Err(PtError::Incomplete(fname));
    }

    let mut entries = Vec::with_capacity(160);

    for ep in EPISODES {
        for diff in DIFFICULTIES {
            for section in 0..10 {
                let wanted = format!("ItemPT{}{}{}.rel", ep, diff, section);

                let (_, off, sz) = files
                    .iter()
                    .find(|(n, _, _)| *n == wanted)
                    .ok_or_else(|| PtError::Incomplete(fname.clone()))?;

                if *sz != PT_V3_ENTRY_SIZE {
                    return Err(PtError::BadEntrySize(fname));
                }

                entries.push(parse_v3_entry(&data[*off..*off + *sz]));
            }
        }
    }

    Ok(PtV3Data { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_entry_parses_at_the_documented_offsets() {
        let mut raw = vec![0u8; PT_V2_ENTRY_SIZE];
        raw[0] = 7; // weapon_ratio[0]
        raw[0x0C] = 0xFE; // weapon_minrank[0] == -2
        raw[0x18] = 3; // weapon_upgfloor[0]
        raw[0x24] = 55; // power_pattern[0][0]
        raw[0x48] = 10; // percent_pattern[0][0]
        raw[0x13E] = 0x34; // tool_frequency[0][0] lo
        raw[0x13F] = 0x12; // tool_frequency[0][0] hi
        raw[0x5A8] = 40; // enemy_dar[0]
        raw[0x60C] = 0x0A; // enemy_meseta[0].0
        raw[0x79C] = 1; // enemy_drop[0]
        raw[0x828] = 30; // box_drop[0][0]
        raw[0x8B8] = 2; // armor_level

        let ent = parse_v2_entry(&raw);
        assert_eq!(ent.weapon_ratio[0], 7);
        assert_eq!(ent.weapon_minrank[0], -2);
        assert_eq!(ent.weapon_upgfloor[0], 3);
        assert_eq!(ent.power_pattern[0][0], 55);
        assert_eq!(ent.percent_pattern[0][0], 10);
        assert_eq!(ent.tool_frequency[0][0], 0x1234);
        assert_eq!(ent.enemy_dar[0], 40);
        assert_eq!(ent.enemy_meseta[0].0, 0x0A);
        assert_eq!(ent.enemy_drop[0], 1);
        assert_eq!(ent.box_drop[0][0], 30);
        assert_eq!(ent.armor_level, 2);
    }

    #[test]
    fn v3_entry_is_big_endian() {
        let mut raw = vec![0u8; PT_V3_ENTRY_SIZE];
        raw[0x48] = 0x12; // percent_pattern[0][0] hi
        raw[0x49] = 0x34; // lo
        raw[0x1DE] = 0x01; // tool_frequency[0][0] hi
        raw[0x1DF] = 0x02;
        raw[0x958 + 3] = 5; // armor_level (BE)

        let ent = parse_v3_entry(&raw);
        assert_eq!(ent.percent_pattern[0][0], 0x1234);
        assert_eq!(ent.tool_frequency[0][0], 0x0102);
        assert_eq!(ent.armor_level, 5);
    }

    #[test]
    fn afs_parsing_validates_the_header() {
        assert!(afs_entries(b"NOPE", "x").is_err());

        let mut data = Vec::new();
        data.extend_from_slice(b"AFS\0");
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&16u32.to_le_bytes()); // offset
        data.extend_from_slice(&4u32.to_le_bytes()); // size
        data.extend_from_slice(&[0xAA; 4]);

        let files = afs_entries(&data, "x").unwrap();
        assert_eq!(files, vec![(16, 4)]);
    }
}
