//! Map data: variation tables, the binary map files, enemy expansion and
//! quest overrides.
//!
//! The expansion from raw map entries to the per-enemy list the drop engine
//! indexes is the most delicate table in the server. Clients compute the
//! same list independently, so every quirk here (clone counts, retinues,
//! rare-skin bits, episode-dependent aliases) must match the game exactly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use ragol_common::rng::Mt19937;
use ragol_common::{prs, Version};

pub const RAW_ENEMY_SIZE: usize = 0x48;
pub const RAW_OBJECT_SIZE: usize = 0x44;

/// Ceiling on expanded enemies per map (the Dark Falz map alone expands to
/// over five hundred entries).
const MAX_ENEMIES_PER_MAP: usize = 0xB50;

/// The per-episode (map count, variation count) pairs, 16 areas each,
/// stored flat as pairs. Taken verbatim from the game's own tables; the
/// single-player set differs from multi-player in a handful of entries.
pub const MAPS: [[u32; 0x20]; 3] = [
    [1, 1, 1, 5, 1, 5, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
    [1, 1, 2, 1, 2, 1, 2, 1, 2, 1, 1, 3, 1, 3, 1, 3, 2, 2, 1, 3, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1, 1, 1],
    [1, 1, 1, 3, 1, 3, 1, 3, 1, 3, 1, 3, 3, 1, 1, 3, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
];

pub const SP_MAPS: [[u32; 0x20]; 3] = [
    [1, 1, 1, 3, 1, 3, 3, 1, 3, 1, 3, 1, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
    [1, 1, 2, 1, 2, 1, 2, 1, 2, 1, 1, 3, 1, 3, 1, 3, 2, 2, 1, 3, 2, 1, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1],
    [1, 1, 1, 3, 1, 3, 1, 3, 1, 3, 1, 3, 3, 1, 1, 3, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
];

pub const DCNTE_MAPS: [u32; 0x20] =
    [1, 1, 1, 2, 1, 2, 2, 2, 2, 2, 2, 2, 1, 2, 1, 2, 2, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1];

/// Highest area index per episode that actually has map files.
pub const MAX_AREA: [usize; 3] = [0x0E, 0x0F, 0x09];

#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot read map file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("map file {0} has an invalid size")]
    BadSize(PathBuf),
    #[error("map expands past the per-map enemy ceiling")]
    TooManyEnemies,
    #[error("invalid map set ({0}, {1}) selected for area {2}")]
    BadVariation(u32, u32, usize),
    #[error("quest map cache is corrupt")]
    BadCache,
    #[error(transparent)]
    Prs(#[from] prs::PrsError),
}

/// Pick the 16 (map, variation) pairs for a new team.
///
/// Entries whose table value is 1 draw nothing from the RNG; when the
/// creator requested specific maps the RNG is consumed for every entry the
/// request can't satisfy, matching the original's draw order exactly.
pub fn pick_variations(
    rng: &mut Mt19937,
    episode: u8,
    single_player: bool,
    dc_nte: bool,
    requested: Option<&[u32; 0x20]>,
) -> [u32; 0x20] {
    let table: &[u32; 0x20] = if dc_nte {
        &DCNTE_MAPS
    } else if single_player {
        &SP_MAPS[(episode as usize - 1).min(2)]
    } else {
        &MAPS[(episode as usize - 1).min(2)]
    };

    let mut out = [0u32; 0x20];

    match requested {
        None => {
            for i in 0..0x20 {
                if table[i] != 1 {
                    out[i] = rng.genrand_int32() % table[i];
                }
            }
        }
        Some(req) => {
            for i in 0..0x20 {
                if req[i] < table[i] {
                    out[i] = req[i];
                } else {
                    out[i] = rng.genrand_int32() % table[i];
                }
            }
        }
    }

    out
}

/// A raw enemy record from a map (or quest) file.
#[derive(Debug, Copy, Clone, Default)]
pub struct RawMapEnemy {
    pub base: u32,
    pub num_clones: u16,
    /// The eleventh reserved dword carries the rare-skin bit (0x800000)
    /// for several enemy families.
    pub reserved10: u32,
    pub skin: u32,
}

impl RawMapEnemy {
    pub fn parse(chunk: &[u8]) -> RawMapEnemy {
        RawMapEnemy {
            base: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            num_clones: u16::from_le_bytes([chunk[6], chunk[7]]),
            reserved10: u32::from_le_bytes([chunk[48], chunk[49], chunk[50], chunk[51]]),
            skin: u32::from_le_bytes([chunk[64], chunk[65], chunk[66], chunk[67]]),
        }
    }

    fn rare_bit(&self) -> bool {
        self.reserved10 & 0x0080_0000 != 0
    }
}

/// A raw object record from a map (or quest) file. Only the fields the
/// drop engine consumes are pulled out; `dwords` aliases the type-specific
/// tail (floats for some skins, item codes for fixed boxes).
#[derive(Debug, Copy, Clone, Default)]
pub struct MapObject {
    pub skin: u32,
    pub obj_id: u32,
    pub dwords: [u32; 6],
}

impl MapObject {
    pub fn parse(chunk: &[u8]) -> MapObject {
        let mut dwords = [0u32; 6];
        for (i, d) in dwords.iter_mut().enumerate() {
            let off = 0x2C + i * 4;
            *d = u32::from_le_bytes([chunk[off], chunk[off + 1], chunk[off + 2], chunk[off + 3]]);
        }

        MapObject {
            skin: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            obj_id: u32::from_le_bytes([chunk[12], chunk[13], chunk[14], chunk[15]]),
            dwords,
        }
    }

    pub fn float(&self, idx: usize) -> f32 {
        f32::from_bits(self.dwords[idx])
    }
}

/// One expanded enemy as the drop engine sees it.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GameEnemy {
    pub bp_entry: u32,
    pub rt_index: u8,
    pub clients_hit: u8,
    pub last_client: u8,
    pub drop_done: bool,
}

/// Sentinel rt_index for event-dependent Rappy skins; resolved when the
/// enemies are attached to a lobby.
pub const RT_INDEX_EVENT: u8 = 0xFF;

#[derive(Debug, Clone, Default)]
pub struct GameEnemies {
    pub enemies: Vec<GameEnemy>,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct GameObject {
    pub data: MapObject,
    pub opened: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GameObjects {
    pub objs: Vec<GameObject>,
}

/// Expand raw map enemies into the indexed per-enemy list.
///
/// `ep` is 1, 2 or 3 (3 = Episode 4 data); `alt` marks the alternate area
/// sets (Ep2 towers / Ep4 crater interior) that swap a few skins.
pub fn parse_map(entries: &[RawMapEnemy], ep: u32, alt: bool) -> Result<GameEnemies, MapError> {
    let mut gen = vec![GameEnemy::default(); MAX_ENEMIES_PER_MAP];
    let mut count: usize = 0;

    for en in entries {
        let mut n_clones = en.num_clones;

        if count + 520 + n_clones as usize >= MAX_ENEMIES_PER_MAP {
            return Err(MapError::TooManyEnemies);
        }

        match en.base {
            0x0040 => {
                // Hildebear & Hildetorr
                let acc = (en.skin & 0x01) as u32;
                gen[count].bp_entry = 0x49 + acc;
                gen[count].rt_index = (0x01 + acc) as u8;
            }

            0x0041 => {
                // Rappies
                let acc = (en.skin & 0x01) as u32;
                if ep == 3 {
                    // Del Rappy & Sand Rappy
                    if alt {
                        gen[count].bp_entry = 0x17 + acc;
                    } else {
                        gen[count].bp_entry = 0x05 + acc;
                    }
                    gen[count].rt_index = (0x11 + acc) as u8;
                } else if acc != 0 {
                    gen[count].bp_entry = 0x19;

                    if ep == 1 {
                        gen[count].rt_index = 0x06;
                    } else {
                        // Event dependent; resolved at lobby attach.
                        gen[count].rt_index = RT_INDEX_EVENT;
                    }
                } else {
                    gen[count].bp_entry = 0x18;
                    gen[count].rt_index = 0x05;
                }
            }

            0x0042 => {
                // Monest + 30 Mothmants
                gen[count].bp_entry = 0x01;
                gen[count].rt_index = 0x04;

                for _ in 0..30 {
                    count += 1;
                    gen[count].bp_entry = 0x00;
                    gen[count].rt_index = 0x03;
                }
            }

            0x0043 => {
                // Savage Wolf & Barbarous Wolf
                let acc = en.rare_bit() as u32;
                gen[count].bp_entry = 0x02 + acc;
                gen[count].rt_index = (0x07 + acc) as u8;
            }

            0x0044 => {
                // Booma family
                let acc = en.skin % 3;
                gen[count].bp_entry = 0x4B + acc;
                gen[count].rt_index = (0x09 + acc) as u8;
            }

            0x0060 => {
                // Grass Assassin
                gen[count].bp_entry = 0x4E;
                gen[count].rt_index = 0x0C;
            }

            0x0061 => {
                // Del Lily, Poison Lily, Nar Lily
                if ep == 2 && alt {
                    gen[count].bp_entry = 0x25;
                    gen[count].rt_index = 0x53;
                } else {
                    let acc = en.rare_bit() as u32;
                    gen[count].bp_entry = 0x04 + acc;
                    gen[count].rt_index = (0x0D + acc) as u8;
                }
            }

            0x0062 => {
                // Nano Dragon
                gen[count].bp_entry = 0x1A;
                gen[count].rt_index = 0x0E;
            }

            0x0063 => {
                // Shark family
                let acc = en.skin % 3;
                gen[count].bp_entry = 0x4F + acc;
                gen[count].rt_index = (0x10 + acc) as u8;
            }

            0x0064 => {
                // Slime + 4 clones
                let acc = en.rare_bit() as u32;
                gen[count].bp_entry = 0x30 - acc;
                gen[count].rt_index = (0x13 + acc) as u8;

                for _ in 0..4 {
                    count += 1;
                    gen[count].bp_entry = 0x30;
                    gen[count].rt_index = 0x13;
                }
            }

            0x0065 => {
                // Pan Arms, Migium, Hidoom
                for j in 0..3 {
                    gen[count + j].bp_entry = 0x31 + j as u32;
                    gen[count + j].rt_index = 0x15 + j as u8;
                }

                count += 2;
            }

            0x0080 => {
                // Dubchic & Gilchic
                let acc = en.skin & 0x01;
                gen[count].bp_entry = 0x1B + acc;
                gen[count].rt_index = ((0x18 + acc) << acc) as u8;
            }

            0x0081 => {
                // Garanz
                gen[count].bp_entry = 0x1D;
                gen[count].rt_index = 0x19;
            }

            0x0082 => {
                // Sinow Beat & Sinow Gold
                if en.rare_bit() {
                    gen[count].bp_entry = 0x13;
                    gen[count].rt_index = 0x1B;
                } else {
                    gen[count].bp_entry = 0x06;
                    gen[count].rt_index = 0x1A;
                }

                if n_clones == 0 {
                    n_clones = 4;
                }
            }

            0x0083 => {
                // Canadine
                gen[count].bp_entry = 0x07;
                gen[count].rt_index = 0x1C;
            }

            0x0084 => {
                // Canadine group
                gen[count].bp_entry = 0x09;
                gen[count].rt_index = 0x1D;

                for _ in 0..8 {
                    count += 1;
                    gen[count].bp_entry = 0x08;
                    gen[count].rt_index = 0x1C;
                }
            }

            0x0085 => {
                // Dubwitch: no entry of its own.
            }

            0x00A0 => {
                // Delsaber
                gen[count].bp_entry = 0x52;
                gen[count].rt_index = 0x1E;
            }

            0x00A1 => {
                // Chaos Sorcerer + its two bees
                gen[count].bp_entry = 0x0A;
                gen[count].rt_index = 0x1F;

                gen[count + 1].bp_entry = 0x0B;
                gen[count + 1].rt_index = 0x00;

                gen[count + 2].bp_entry = 0x0C;
                gen[count + 2].rt_index = 0x00;
                count += 2;
            }

            0x00A2 => {
                // Dark Gunner
                gen[count].bp_entry = 0x1E;
                gen[count].rt_index = 0x22;
            }

            0x00A3 => {
                // Death Gunner: no entry.
            }

            0x00A4 => {
                // Chaos Bringer
                gen[count].bp_entry = 0x0D;
                gen[count].rt_index = 0x24;
            }

            0x00A5 => {
                // Dark Belra
                gen[count].bp_entry = 0x0E;
                gen[count].rt_index = 0x25;
            }

            0x00A6 => {
                // Dimenian family
                let acc = en.skin % 3;
                gen[count].bp_entry = 0x53 + acc;
                gen[count].rt_index = (0x29 + acc) as u8;
            }

            0x00A7 => {
                // Bulclaw + 4 claws
                gen[count].bp_entry = 0x1F;
                gen[count].rt_index = 0x28;

                for _ in 0..4 {
                    count += 1;
                    gen[count].bp_entry = 0x20;
                    gen[count].rt_index = 0x26;
                }
            }

            0x00A8 => {
                // Claw
                gen[count].bp_entry = 0x20;
                gen[count].rt_index = 0x26;
            }

            0x00C0 => {
                // Dragon or Gal Gryphon
                if ep == 1 {
                    gen[count].bp_entry = 0x12;
                    gen[count].rt_index = 0x2C;
                } else {
                    gen[count].bp_entry = 0x1E;
                    gen[count].rt_index = 0x4D;
                }
            }

            0x00C1 => {
                // De Rol Le
                gen[count].bp_entry = 0x0F;
                gen[count].rt_index = 0x2D;
            }

            0x00C2 => {
                // Vol Opt (form 1): no entry.
            }

            0x00C5 => {
                // Vol Opt (form 2)
                gen[count].bp_entry = 0x25;
                gen[count].rt_index = 0x2E;
            }

            0x00C8 => {
                // Dark Falz (3 forms) + 510 Darvants. The forms come in
                // reverse order after the retinue.
                for _ in 0..510 {
                    gen[count].bp_entry = 0x35;
                    gen[count].rt_index = 0;
                    count += 1;
                }

                gen[count].bp_entry = 0x38;
                gen[count].rt_index = 0x2F;
                count += 1;

                gen[count].bp_entry = 0x37;
                gen[count].rt_index = 0x2F;
                count += 1;

                gen[count].bp_entry = 0x36;
                gen[count].rt_index = 0x2F;
            }

            0x00CA => {
                // Olga Flow
                gen[count].bp_entry = 0x2C;
                gen[count].rt_index = 0x4E;
                count += 512;
            }

            0x00CB => {
                // Barba Ray
                gen[count].bp_entry = 0x0F;
                gen[count].rt_index = 0x49;
                count += 47;
            }

            0x00CC => {
                // Gol Dragon
                gen[count].bp_entry = 0x12;
                gen[count].rt_index = 0x4C;
                count += 5;
            }

            0x00D4 => {
                // Sinow Berill & Spigell. The rare check here differs
                // between servers; this follows the skin byte.
                let acc = (en.skin >= 0x01) as u32;
                if acc != 0 {
                    gen[count].bp_entry = 0x13;
                    gen[count].rt_index = 0x3F;
                } else {
                    gen[count].bp_entry = 0x06;
                    gen[count].rt_index = 0x3E;
                }

                count += 4; // Four clones which are never used.
            }

            0x00D5 => {
                // Merillia & Meriltas
                let acc = en.skin & 0x01;
                gen[count].bp_entry = 0x4B + acc;
                gen[count].rt_index = (0x34 + acc) as u8;
            }

            0x00D6 => {
                // Mericus, Merikle, or Mericarol
                let acc = en.skin % 3;
                if acc != 0 {
                    gen[count].bp_entry = 0x44 + acc;
                } else {
                    gen[count].bp_entry = 0x3A;
                }

                gen[count].rt_index = (0x38 + acc) as u8;
            }

            0x00D7 => {
                // Ul Gibbon & Zol Gibbon
                let acc = en.skin & 0x01;
                gen[count].bp_entry = 0x3B + acc;
                gen[count].rt_index = (0x3B + acc) as u8;
            }

            0x00D8 => {
                // Gibbles
                gen[count].bp_entry = 0x3D;
                gen[count].rt_index = 0x3D;
            }

            0x00D9 => {
                // Gee
                gen[count].bp_entry = 0x07;
                gen[count].rt_index = 0x36;
            }

            0x00DA => {
                // Gi Gue
                gen[count].bp_entry = 0x1A;
                gen[count].rt_index = 0x37;
            }

            0x00DB => {
                // Deldepth
                gen[count].bp_entry = 0x30;
                gen[count].rt_index = 0x47;
            }

            0x00DC => {
                // Delbiter
                gen[count].bp_entry = 0x0D;
                gen[count].rt_index = 0x48;
            }

            0x00DD => {
                // Dolmolm & Dolmdarl
                let acc = en.skin & 0x01;
                gen[count].bp_entry = 0x4F + acc;
                gen[count].rt_index = (0x40 + acc) as u8;
            }

            0x00DE => {
                // Morfos
                gen[count].bp_entry = 0x41;
                gen[count].rt_index = 0x42;
            }

            0x00DF => {
                // Recobox & Recons
                gen[count].bp_entry = 0x41;
                gen[count].rt_index = 0x43;

                for _ in 1..=n_clones {
                    count += 1;
                    gen[count].bp_entry = 0x42;
                    gen[count].rt_index = 0x44;
                }

                // Don't double count them.
                n_clones = 0;
            }

            0x00E0 => {
                // Epsilon on the alt maps, Sinow Zoa & Zele otherwise.
                if ep == 2 && alt {
                    gen[count].bp_entry = 0x23;
                    gen[count].rt_index = 0x54;
                    count += 4;
                } else {
                    let acc = en.skin & 0x01;
                    gen[count].bp_entry = 0x43 + acc;
                    gen[count].rt_index = (0x45 + acc) as u8;
                }
            }

            0x00E1 => {
                // Ill Gill
                gen[count].bp_entry = 0x26;
                gen[count].rt_index = 0x52;
            }

            0x0110 => {
                // Astark
                gen[count].bp_entry = 0x09;
                gen[count].rt_index = 0x01;
            }

            0x0111 => {
                // Satellite Lizard & Yowie
                let acc = en.rare_bit() as u32;
                if alt {
                    gen[count].bp_entry = 0x0D + acc + 0x10;
                } else {
                    gen[count].bp_entry = 0x0D + acc;
                }

                gen[count].rt_index = (0x02 + acc) as u8;
            }

            0x0112 => {
                // Merissa A/AA
                let acc = en.skin & 0x01;
                gen[count].bp_entry = 0x19 + acc;
                gen[count].rt_index = (0x04 + acc) as u8;
            }

            0x0113 => {
                // Girtablulu
                gen[count].bp_entry = 0x1F;
                gen[count].rt_index = 0x06;
            }

            0x0114 => {
                // Zu & Pazuzu
                let acc = en.skin & 0x01;
                if alt {
                    gen[count].bp_entry = 0x07 + acc + 0x14;
                } else {
                    gen[count].bp_entry = 0x07 + acc;
                }

                gen[count].rt_index = (7 + acc) as u8;
            }

            0x0115 => {
                // Boota family
                let acc = en.skin % 3;
                gen[count].rt_index = (0x09 + acc) as u8;
                if en.skin & 0x02 != 0 {
                    gen[count].bp_entry = 0x03;
                } else {
                    gen[count].bp_entry = acc;
                }
            }

            0x0116 => {
                // Dorphon & Eclair
                let acc = en.skin & 0x01;
                gen[count].bp_entry = 0x0F + acc;
                gen[count].rt_index = (0x0C + acc) as u8;
            }

            0x0117 => {
                // Goran family
                let acc = en.skin % 3;
                gen[count].bp_entry = 0x11 + acc;
                gen[count].rt_index = if en.skin & 0x02 != 0 {
                    0x0F
                } else if en.skin & 0x01 != 0 {
                    0x10
                } else {
                    0x0E
                };
            }

            0x0119 => {
                // Saint Million, Shambertin & Kondrieu
                let acc = en.skin & 0x01;
                gen[count].bp_entry = 0x22;
                gen[count].rt_index = if en.rare_bit() {
                    0x15
                } else {
                    (0x13 + acc) as u8
                };
            }

            other => {
                debug!("unknown enemy id: {:04X}", other);
            }
        }

        // Clone expansion: copy the last written entry forward.
        if n_clones > 0 {
            for _ in 0..n_clones {
                gen[count + 1].rt_index = gen[count].rt_index;
                gen[count + 1].bp_entry = gen[count].bp_entry;
                count += 1;
            }
        }

        count += 1;
    }

    gen.truncate(count);
    Ok(GameEnemies { enemies: gen })
}

/// One area's parsed maps: `maps[map * variation_count + variation]`.
#[derive(Debug, Clone, Default)]
pub struct ParsedMapSet {
    pub map_count: u32,
    pub variation_count: u32,
    pub maps: Vec<GameEnemies>,
    pub objs: Vec<GameObjects>,
}

impl ParsedMapSet {
    pub fn index_of(&self, map: u32, variation: u32) -> Option<usize> {
        if self.map_count == 0 && self.variation_count == 0 {
            return None;
        }

        Some((map * self.variation_count + variation) as usize)
    }
}

/// All v2 map data (one episode, no single-player mode).
#[derive(Debug, Default)]
pub struct V2MapData {
    pub areas: Vec<ParsedMapSet>,
}

/// GC map data: two episodes.
#[derive(Debug, Default)]
pub struct GcMapData {
    pub areas: [Vec<ParsedMapSet>; 2],
}

/// BB map data: [solo][episode] with three episodes.
#[derive(Debug, Default)]
pub struct BbMapData {
    pub areas: [[Vec<ParsedMapSet>; 3]; 2],
}

fn read_enemy_file(path: &Path) -> Result<Vec<RawMapEnemy>, MapError> {
    let data = fs::read(path).map_err(|e| MapError::Io(path.to_path_buf(), e))?;

    if data.len() % RAW_ENEMY_SIZE != 0 {
        return Err(MapError::BadSize(path.to_path_buf()));
    }

    Ok(data.chunks_exact(RAW_ENEMY_SIZE).map(RawMapEnemy::parse).collect())
}

fn read_object_file(path: &Path) -> Result<GameObjects, MapError> {
    let data = fs::read(path).map_err(|e| MapError::Io(path.to_path_buf(), e))?;

    if data.len() % RAW_OBJECT_SIZE != 0 {
        return Err(MapError::BadSize(path.to_path_buf()));
    }

    Ok(GameObjects {
        objs: data
            .chunks_exact(RAW_OBJECT_SIZE)
            .map(|c| GameObject {
                data: MapObject::parse(c),
                opened: false,
            })
            .collect(),
    })
}

/// Read one area's map set from `dir`. File names follow the original
/// layout: `m{area:X}{map}{variation}.dat` for v2, with a leading episode
/// digit for GC/BB and an `s` prefix for BB solo maps (falling back to the
/// shared multi-player file).
fn read_map_set(
    dir: &Path,
    area: usize,
    table: &[u32; 0x20],
    ep_prefix: Option<u32>,
    solo: bool,
    parse_ep: u32,
) -> Result<ParsedMapSet, MapError> {
    let nmaps = table[area << 1];
    let nvars = table[(area << 1) + 1];

    let mut set = ParsedMapSet {
        map_count: nmaps,
        variation_count: nvars,
        maps: Vec::with_capacity((nmaps * nvars) as usize),
        objs: Vec::with_capacity((nmaps * nvars) as usize),
    };

    for map in 0..nmaps {
        for var in 0..nvars {
            let base = match ep_prefix {
                Some(ep) => format!("{}{:X}{}{}", ep, area, map, var),
                None => format!("{:X}{}{}", area, map, var),
            };

            let mut enemy_path = dir.join(format!("m{}.dat", base));

            if solo {
                let solo_path = dir.join(format!("s{}.dat", base));
                if solo_path.exists() {
                    enemy_path = solo_path;
                }
            }

            let entries = read_enemy_file(&enemy_path)?;
            set.maps.push(parse_map(&entries, parse_ep, false)?);

            let obj_path = dir.join(format!(
                "m{}_o.dat",
                base
            ));
            set.objs.push(read_object_file(&obj_path)?);
        }
    }

    Ok(set)
}

pub fn read_v2_map_files(dir: &Path) -> Result<V2MapData, MapError> {
    let mut data = V2MapData::default();

    for area in 0..16usize.min(MAX_AREA[0] + 1) {
        data.areas.push(read_map_set(dir, area, &MAPS[0], None, false, 1)?);
    }

    Ok(data)
}

pub fn read_gc_map_files(dir: &Path) -> Result<GcMapData, MapError> {
    let mut data = GcMapData::default();

    for ep in 0..2usize {
        for area in 0..16usize.min(MAX_AREA[ep] + 1) {
            data.areas[ep].push(read_map_set(
                dir,
                area,
                &MAPS[ep],
                Some(ep as u32 + 1),
                false,
                ep as u32 + 1,
            )?);
        }
    }

    Ok(data)
}

pub fn read_bb_map_files(dir: &Path) -> Result<BbMapData, MapError> {
    let mut data = BbMapData::default();

    for solo in 0..2usize {
        for ep in 0..3usize {
            let table = if solo == 1 { &SP_MAPS[ep] } else { &MAPS[ep] };

            for area in 0..16usize.min(MAX_AREA[ep] + 1) {
                data.areas[solo][ep].push(read_map_set(
                    dir,
                    area,
                    table,
                    Some(ep as u32 + 1),
                    solo == 1,
                    ep as u32 + 1,
                )?);
            }
        }
    }

    Ok(data)
}

/// Combine the selected (map, variation) pairs of every area into the flat
/// per-team arrays, applying the load-time fixups.
pub fn load_game_enemies(
    areas: &[ParsedMapSet],
    selections: &[u32; 0x20],
    difficulty: u8,
    event: u8,
) -> Result<(GameEnemies, GameObjects), MapError> {
    let mut enemies = GameEnemies::default();
    let mut objects = GameObjects::default();

    for (area, set) in areas.iter().enumerate() {
        if set.map_count == 0 && set.variation_count == 0 {
            break;
        }

        let map = selections[area << 1];
        let var = selections[(area << 1) + 1];

        if map > set.map_count || var > set.variation_count {
            return Err(MapError::BadVariation(map, var, area));
        }

        let index = (map * set.variation_count + var) as usize;
        enemies.enemies.extend_from_slice(&set.maps[index].enemies);
        objects.objs.extend_from_slice(&set.objs[index].objs);
    }

    apply_load_fixups(&mut enemies, difficulty, event);
    Ok((enemies, objects))
}

/// Dark Falz gets battle parameter 0x38 above normal difficulty, and the
/// Rappy event sentinel resolves against the lobby's event.
pub fn apply_load_fixups(enemies: &mut GameEnemies, difficulty: u8, event: u8) {
    use crate::lobby::{LOBBY_EVENT_CHRISTMAS, LOBBY_EVENT_EASTER, LOBBY_EVENT_HALLOWEEN};

    for en in enemies.enemies.iter_mut() {
        if en.bp_entry == 0x37 && difficulty != 0 {
            en.bp_entry = 0x38;
        } else if en.rt_index == RT_INDEX_EVENT {
            en.rt_index = match event {
                LOBBY_EVENT_CHRISTMAS => 79,
                LOBBY_EVENT_EASTER => 81,
                LOBBY_EVENT_HALLOWEEN => 80,
                _ => 51,
            };
        }
    }
}

/// Blue Burst battle parameters: [solo][file][difficulty][entry].
#[derive(Debug, Clone, Copy, Default)]
pub struct BbBattleParam {
    pub atp: u16,
    pub psv: u16,
    pub evp: u16,
    pub hp: u16,
    pub dfp: u16,
    pub ata: u16,
    pub lck: u16,
    pub esp: u16,
    pub exp: u32,
}

const BATTLE_PARAM_SIZE: usize = 0x24;

pub type BattleParamSet = [[BbBattleParam; 0x60]; 4];

pub fn read_battle_param_file(path: &Path) -> Result<Box<BattleParamSet>, MapError> {
    let data = fs::read(path).map_err(|e| MapError::Io(path.to_path_buf(), e))?;

    if data.len() < BATTLE_PARAM_SIZE * 0x60 * 4 {
        return Err(MapError::BadSize(path.to_path_buf()));
    }

    let mut out: Box<BattleParamSet> = Box::new([[BbBattleParam::default(); 0x60]; 4]);

    for (d, diff) in out.iter_mut().enumerate() {
        for (i, ent) in diff.iter_mut().enumerate() {
            let off = (d * 0x60 + i) * BATTLE_PARAM_SIZE;
            let c = &data[off..off + BATTLE_PARAM_SIZE];

            *ent = BbBattleParam {
                atp: u16::from_le_bytes([c[0], c[1]]),
                psv: u16::from_le_bytes([c[2], c[3]]),
                evp: u16::from_le_bytes([c[4], c[5]]),
                hp: u16::from_le_bytes([c[6], c[7]]),
                dfp: u16::from_le_bytes([c[8], c[9]]),
                ata: u16::from_le_bytes([c[10], c[11]]),
                lck: u16::from_le_bytes([c[12], c[13]]),
                esp: u16::from_le_bytes([c[14], c[15]]),
                exp: u32::from_le_bytes([c[28], c[29], c[30], c[31]]),
            };
        }
    }

    Ok(out)
}

/// The Blue Burst level-up table from `PlyLevelTbl.prs`.
#[derive(Debug, Clone)]
pub struct BbLevelTable {
    /// Per class: 200 levels of accumulated exp requirements.
    pub exp: [[u32; 200]; 12],
}

pub fn read_level_table(path: &Path) -> Result<Box<BbLevelTable>, MapError> {
    let data = fs::read(path).map_err(|e| MapError::Io(path.to_path_buf(), e))?;
    let raw = prs::decompress(&data)?;

    // Layout per the game: 12 * 14 bytes of start stats, 12 u32s of
    // padding, then 12 * 200 level entries of 12 bytes with exp at +8.
    let base = 12 * 14 + 12 * 4;
    let entry = 12usize;

    if raw.len() < base + 12 * 200 * entry {
        return Err(MapError::BadSize(path.to_path_buf()));
    }

    let mut table = Box::new(BbLevelTable { exp: [[0; 200]; 12] });

    for cls in 0..12 {
        for lvl in 0..200 {
            let off = base + (cls * 200 + lvl) * entry + 8;
            table.exp[cls][lvl] =
                u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        }
    }

    Ok(table)
}

/// Quest `.dat` blobs: a chain of `{obj_type, next_hdr, area, size}` headers.
/// Types 1 and 2 are objects and enemies respectively.
struct QuestDatSection<'a> {
    obj_type: u32,
    area: u32,
    data: &'a [u8],
}

fn parse_quest_dat(data: &[u8]) -> Vec<QuestDatSection<'_>> {
    let mut out = Vec::new();
    let mut ptr = 0usize;

    while ptr + 16 <= data.len() {
        let hdr = &data[ptr..];
        let obj_type = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let next_hdr = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]) as usize;
        let area = u32::from_le_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]);
        let size = u32::from_le_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]) as usize;

        match obj_type {
            1 | 2 => {
                if ptr + 16 + size > data.len() || next_hdr == 0 {
                    break;
                }

                out.push(QuestDatSection {
                    obj_type,
                    area,
                    data: &data[ptr + 16..ptr + 16 + size],
                });
                ptr += next_hdr;
            }
            3 => {
                if next_hdr == 0 {
                    break;
                }
                ptr += next_hdr;
            }
            _ => break, // Padding at the end of the file.
        }
    }

    out
}

/// Parse a quest's `.dat` blob and write the cache file: object count +
/// raw objects, then enemy count + expanded enemies (pre-fixup).
pub fn cache_quest_enemies(
    cache_path: &Path,
    dat: &[u8],
    episode: u32,
) -> Result<(), MapError> {
    let sections = parse_quest_dat(dat);
    let mut objs: Vec<u8> = Vec::new();
    let mut obj_count = 0u32;
    let mut enemies: Vec<GameEnemy> = Vec::new();

    for sec in sections.iter().filter(|s| s.obj_type == 1) {
        obj_count += (sec.data.len() / RAW_OBJECT_SIZE) as u32;
        objs.extend_from_slice(&sec.data[..(sec.data.len() / RAW_OBJECT_SIZE) * RAW_OBJECT_SIZE]);
    }

    for sec in sections.iter().filter(|s| s.obj_type == 2) {
        let alt = (episode == 3 && sec.area > 5) || (episode == 2 && sec.area > 15);

        let raw: Vec<RawMapEnemy> = sec
            .data
            .chunks_exact(RAW_ENEMY_SIZE)
            .map(RawMapEnemy::parse)
            .collect();

        enemies.extend(parse_map(&raw, episode, alt)?.enemies);
    }

    if let Some(parent) = cache_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let mut out = Vec::with_capacity(8 + objs.len() + enemies.len() * 8);
    out.extend_from_slice(&obj_count.to_le_bytes());
    out.extend_from_slice(&objs);
    out.extend_from_slice(&(enemies.len() as u32).to_le_bytes());

    for en in &enemies {
        out.extend_from_slice(&en.bp_entry.to_le_bytes());
        out.push(en.rt_index);
        out.push(en.clients_hit);
        out.push(en.last_client);
        out.push(en.drop_done as u8);
    }

    let mut f = fs::File::create(cache_path)
        .map_err(|e| MapError::Io(cache_path.to_path_buf(), e))?;
    f.write_all(&out)
        .map_err(|e| MapError::Io(cache_path.to_path_buf(), e))?;

    Ok(())
}

/// Load a quest's cached enemy/object arrays, applying the load-time
/// fixups for the lobby's difficulty and event.
pub fn load_quest_enemies(
    cache_path: &Path,
    difficulty: u8,
    event: u8,
) -> Result<(GameEnemies, GameObjects), MapError> {
    let data = fs::read(cache_path).map_err(|e| MapError::Io(cache_path.to_path_buf(), e))?;

    if data.len() < 4 {
        return Err(MapError::BadCache);
    }

    let obj_count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let obj_end = 4 + obj_count * RAW_OBJECT_SIZE;

    if data.len() < obj_end + 4 {
        return Err(MapError::BadCache);
    }

    let objects = GameObjects {
        objs: data[4..obj_end]
            .chunks_exact(RAW_OBJECT_SIZE)
            .map(|c| GameObject {
                data: MapObject::parse(c),
                opened: false,
            })
            .collect(),
    };

    let en_count =
        u32::from_le_bytes([data[obj_end], data[obj_end + 1], data[obj_end + 2], data[obj_end + 3]])
            as usize;
    let en_start = obj_end + 4;

    if data.len() < en_start + en_count * 8 {
        return Err(MapError::BadCache);
    }

    let mut enemies = GameEnemies {
        enemies: data[en_start..en_start + en_count * 8]
            .chunks_exact(8)
            .map(|c| GameEnemy {
                bp_entry: u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                rt_index: c[4],
                clients_hit: c[5],
                last_client: c[6],
                drop_done: c[7] != 0,
            })
            .collect(),
    };

    apply_load_fixups(&mut enemies, difficulty, event);
    Ok((enemies, objects))
}

/// Quest caches live under `.mapcache/<version code>/<qid:08x>`.
pub fn quest_cache_path(quests_dir: &Path, version: Version, qid: u32) -> PathBuf {
    // PC quests share the DCv2 cache.
    let v = if version == Version::Pcv2 { Version::Dcv2 } else { version };

    let code = match v {
        Version::DcNte | Version::Dcv1 => "v1",
        Version::Dcv2 => "v2",
        Version::PcNte | Version::Pcv2 => "v2",
        Version::Gc => "gc",
        Version::Ep3 => "ep3",
        Version::Xbox => "xb",
        Version::BlueBurst => "bb",
    };

    quests_dir.join(".mapcache").join(code).join(format!("{:08x}", qid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(base: u32, skin: u32, clones: u16, rare: bool) -> RawMapEnemy {
        RawMapEnemy {
            base,
            num_clones: clones,
            reserved10: if rare { 0x0080_0000 } else { 0 },
            skin,
        }
    }

    #[test]
    fn monest_spawns_thirty_mothmants() {
        let parsed = parse_map(&[raw(0x0042, 0, 0, false)], 1, false).unwrap();
        assert_eq!(parsed.enemies.len(), 31);
        assert_eq!(parsed.enemies[0].rt_index, 0x04);
        assert!(parsed.enemies[1..].iter().all(|e| e.rt_index == 0x03));
    }

    #[test]
    fn dark_falz_brings_five_hundred_ten_darvants() {
        let parsed = parse_map(&[raw(0x00C8, 0, 0, false)], 1, false).unwrap();
        assert_eq!(parsed.enemies.len(), 513);
        assert!(parsed.enemies[..510].iter().all(|e| e.bp_entry == 0x35));
        // Forms come in reverse order.
        assert_eq!(parsed.enemies[510].bp_entry, 0x38);
        assert_eq!(parsed.enemies[511].bp_entry, 0x37);
        assert_eq!(parsed.enemies[512].bp_entry, 0x36);
        assert!(parsed.enemies[510..].iter().all(|e| e.rt_index == 0x2F));
    }

    #[test]
    fn clones_copy_the_base_entry() {
        let parsed = parse_map(&[raw(0x0044, 1, 3, false)], 1, false).unwrap();
        assert_eq!(parsed.enemies.len(), 4);
        assert!(parsed.enemies.iter().all(|e| e.rt_index == 0x0A));
        assert!(parsed.enemies.iter().all(|e| e.bp_entry == 0x4C));
    }

    #[test]
    fn hildetorr_comes_from_the_skin_bit() {
        let blue = parse_map(&[raw(0x0040, 1, 0, false)], 1, false).unwrap();
        assert_eq!(blue.enemies[0].rt_index, 0x02);
        assert_eq!(blue.enemies[0].bp_entry, 0x4A);

        let normal = parse_map(&[raw(0x0040, 0, 0, false)], 1, false).unwrap();
        assert_eq!(normal.enemies[0].rt_index, 0x01);
    }

    #[test]
    fn ep2_rare_rappy_defers_to_the_event() {
        let parsed = parse_map(&[raw(0x0041, 1, 0, false)], 2, false).unwrap();
        assert_eq!(parsed.enemies[0].rt_index, RT_INDEX_EVENT);

        let mut en = parsed.clone();
        apply_load_fixups(&mut en, 0, crate::lobby::LOBBY_EVENT_CHRISTMAS);
        assert_eq!(en.enemies[0].rt_index, 79);

        let mut en = parsed.clone();
        apply_load_fixups(&mut en, 0, crate::lobby::LOBBY_EVENT_HALLOWEEN);
        assert_eq!(en.enemies[0].rt_index, 80);

        let mut en = parsed.clone();
        apply_load_fixups(&mut en, 0, crate::lobby::LOBBY_EVENT_EASTER);
        assert_eq!(en.enemies[0].rt_index, 81);

        let mut en = parsed;
        apply_load_fixups(&mut en, 0, 0);
        assert_eq!(en.enemies[0].rt_index, 51);
    }

    #[test]
    fn falz_bp_entry_swaps_off_normal() {
        let mut parsed = parse_map(&[raw(0x00C8, 0, 0, false)], 1, false).unwrap();
        apply_load_fixups(&mut parsed, 1, 0);
        assert!(parsed.enemies.iter().all(|e| e.bp_entry != 0x37));

        let mut parsed = parse_map(&[raw(0x00C8, 0, 0, false)], 1, false).unwrap();
        apply_load_fixups(&mut parsed, 0, 0);
        assert!(parsed.enemies.iter().any(|e| e.bp_entry == 0x37));
    }

    #[test]
    fn sinow_beat_defaults_to_four_clones() {
        let parsed = parse_map(&[raw(0x0082, 0, 0, false)], 1, false).unwrap();
        assert_eq!(parsed.enemies.len(), 5);

        let parsed = parse_map(&[raw(0x0082, 0, 2, false)], 1, false).unwrap();
        assert_eq!(parsed.enemies.len(), 3);
    }

    #[test]
    fn recobox_expands_by_its_real_clone_count() {
        let parsed = parse_map(&[raw(0x00DF, 0, 3, false)], 2, false).unwrap();
        assert_eq!(parsed.enemies.len(), 4);
        assert_eq!(parsed.enemies[0].rt_index, 0x43);
        assert!(parsed.enemies[1..].iter().all(|e| e.rt_index == 0x44));
    }

    #[test]
    fn kondrieu_uses_the_rare_bit() {
        let parsed = parse_map(&[raw(0x0119, 0, 0, true)], 3, false).unwrap();
        assert_eq!(parsed.enemies[0].rt_index, 0x15);

        let parsed = parse_map(&[raw(0x0119, 1, 0, false)], 3, false).unwrap();
        assert_eq!(parsed.enemies[0].rt_index, 0x14);
    }

    #[test]
    fn variation_draws_respect_the_tables() {
        let mut a = Mt19937::new(0xDEAD_BEEF);
        let mut b = Mt19937::new(0xDEAD_BEEF);

        let va = pick_variations(&mut a, 1, false, false, None);
        let vb = pick_variations(&mut b, 1, false, false, None);
        assert_eq!(va, vb);

        for (i, v) in va.iter().enumerate() {
            assert!(*v < MAPS[0][i].max(1));
        }

        // Entries with only one choice never consume the RNG: the next
        // draw after both runs must agree.
        assert_eq!(a.genrand_int32(), b.genrand_int32());
    }

    #[test]
    fn requested_maps_are_honored_when_legal() {
        let mut rng = Mt19937::new(5);
        let mut req = [0u32; 0x20];
        req[3] = 4; // area 1 map count is 5 in ep1
        req[5] = 9; // out of range, must be re-rolled

        let v = pick_variations(&mut rng, 1, false, false, Some(&req));
        assert_eq!(v[3], 4);
        assert!(v[5] < 5);
    }

    #[test]
    fn quest_dat_cache_round_trips() {
        // One enemy section (a lone Hildebear) and one object section.
        let mut dat = Vec::new();

        let obj = [0u8; RAW_OBJECT_SIZE];
        dat.extend_from_slice(&1u32.to_le_bytes());
        dat.extend_from_slice(&((16 + RAW_OBJECT_SIZE) as u32).to_le_bytes());
        dat.extend_from_slice(&0u32.to_le_bytes());
        dat.extend_from_slice(&(RAW_OBJECT_SIZE as u32).to_le_bytes());
        dat.extend_from_slice(&obj);

        let mut en = [0u8; RAW_ENEMY_SIZE];
        en[0] = 0x40; // Hildebear
        dat.extend_from_slice(&2u32.to_le_bytes());
        dat.extend_from_slice(&((16 + RAW_ENEMY_SIZE) as u32).to_le_bytes());
        dat.extend_from_slice(&0u32.to_le_bytes());
        dat.extend_from_slice(&(RAW_ENEMY_SIZE as u32).to_le_bytes());
        dat.extend_from_slice(&en);

        let dir = std::env::temp_dir().join("ragol_map_cache_test");
        let path = dir.join("00000001");
        cache_quest_enemies(&path, &dat, 1).unwrap();

        let (enemies, objects) = load_quest_enemies(&path, 0, 0).unwrap();
        assert_eq!(objects.objs.len(), 1);
        assert_eq!(enemies.enemies.len(), 1);
        assert_eq!(enemies.enemies[0].rt_index, 0x01);

        let _ = fs::remove_dir_all(&dir);
    }
}
