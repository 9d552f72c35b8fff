//! ItemRT loaders and the rare-drop roll.
//!
//! Each (difficulty, section) set has 0x65 enemy entries (indexed by
//! rt_index) and 30 box entries tagged with an area. Probabilities are
//! packed into one byte and expanded to a real chance out of 2^32.

use std::fs;
use std::path::Path;

use thiserror::Error;

use ragol_common::rng::Mt19937;

use super::pt::{afs_entries, gsl_entries, PtError};

#[derive(Debug, Error)]
pub enum RtError {
    #[error("cannot read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("{0} does not appear to be an ItemRT file")]
    BadFormat(String),
    #[error(transparent)]
    Archive(#[from] PtError),
}

#[derive(Debug, Copy, Clone, Default)]
pub struct RtData {
    pub prob: f64,
    pub item_data: u32,
    /// Only meaningful for box entries.
    pub area: u8,
}

#[derive(Debug, Clone)]
pub struct RtSet {
    pub enemy_rares: [RtData; 101],
    pub box_rares: [RtData; 30],
}

impl Default for RtSet {
    fn default() -> RtSet {
        RtSet {
            enemy_rares: [RtData::default(); 101],
            box_rares: [RtData::default(); 30],
        }
    }
}

/// v2 rare sets: `[difficulty][section]`.
pub struct RtV2Data {
    pub sets: Vec<RtSet>,
}

impl RtV2Data {
    pub fn set(&self, difficulty: u8, section: u8) -> &RtSet {
        &self.sets[(difficulty as usize & 3) * 10 + (section as usize % 10)]
    }
}

/// GC/BB rare sets: `[episode][difficulty][section]`.
pub struct RtGcData {
    pub sets: Vec<RtSet>,
}

impl RtGcData {
    pub fn set(&self, episode: u8, difficulty: u8, section: u8) -> &RtSet {
        let ep = match episode {
            2 => 1,
            _ => 0,
        };
        &self.sets[ep * 40 + (difficulty as usize & 3) * 10 + (section as usize % 10)]
    }
}

/// Expand the packed rate byte: a 3-bit mantissa and 5-bit exponent form,
/// over 2^32.
pub fn expand_rate(rate: u8) -> f64 {
    let mut tmp = (rate >> 3) as i32 - 4;

    if tmp < 0 {
        tmp = 0;
    }

    let expd = (2u64 << tmp) * ((rate & 7) as u64 + 7);
    expd as f64 / 4_294_967_296.0
}

fn parse_rt_set(data: &[u8]) -> Option<RtSet> {
    // 0x65 enemy entries, 30 area bytes, then 30 box entries.
    const NEED: usize = 0x65 * 4 + 30 + 30 * 4;

    if data.len() < NEED {
        return None;
    }

    let mut set = RtSet::default();
    let mut pos = 0usize;

    for k in 0..0x65 {
        let prob = data[pos];
        let item = data[pos + 1] as u32 | (data[pos + 2] as u32) << 8 | (data[pos + 3] as u32) << 16;

        set.enemy_rares[k] = RtData {
            prob: expand_rate(prob),
            item_data: item,
            area: 0,
        };
        pos += 4;
    }

    let areas = &data[pos..pos + 30];
    pos += 30;

    for k in 0..30 {
        let prob = data[pos];
        let item = data[pos + 1] as u32 | (data[pos + 2] as u32) << 8 | (data[pos + 3] as u32) << 16;

        set.box_rares[k] = RtData {
            prob: expand_rate(prob),
            item_data: item,
            area: areas[k],
        };
        pos += 4;
    }

    Some(set)
}

/// Read a v2-style ItemRT.afs: exactly 40 entries of 0x280 bytes.
pub fn read_v2(path: &Path) -> Result<RtV2Data, RtError> {
    let fname = path.display().to_string();
    let data = fs::read(path).map_err(|e| RtError::Io(fname.clone(), e))?;

    let files = afs_entries(&data, &fname)?;
    if files.len() != 40 {
        return Err(RtError::BadFormat(fname));
    }

    let mut sets = Vec::with_capacity(40);
    for (off, sz) in files {
        if sz != 0x280 {
            return Err(RtError::BadFormat(fname));
        }

        match parse_rt_set(&data[off..off + sz]) {
            Some(s) => sets.push(s),
            None => return Err(RtError::BadFormat(fname)),
        }
    }

    Ok(RtV2Data { sets })
}

/// Read a GC/BB ItemRT.gsl: 160 files `ItemRT[l]{n,h,v,u}{section}.rel`.
pub fn read_gc(path: &Path) -> Result<RtGcData, RtError> {
    const DIFFICULTIES: [char; 4] = ['n', 'h', 'v', 'u'];
    const EPISODES: [&str; 2] = ["", "l"];

    let fname = path.display().to_string();
    let data = fs::read(path).map_err(|e| RtError::Io(fname.clone(), e))?;

    let files = gsl_entries(&data, &fname)?;
    let mut sets = Vec::with_capacity(80);

    for ep in EPISODES {
        for diff in DIFFICULTIES {
            for section in 0..10 {
                let wanted = format!("ItemRT{}{}{}.rel", ep, diff, section);

                let (_, off, sz) = files
                    .iter()
                    .find(|(n, _, _)| *n == wanted)
                    .ok_or_else(|| RtError::BadFormat(fname.clone()))?;

                match parse_rt_set(&data[*off..*off + *sz]) {
                    Some(s) => sets.push(s),
                    None => return Err(RtError::BadFormat(fname)),
                }
            }
        }
    }

    Ok(RtGcData { sets })
}

/// Roll for a rare. `rt_index >= 0` rolls one enemy entry; `rt_index < 0`
/// walks the box entries for the given area. Returns the 3-byte item code
/// or zero.
pub fn generate_rare(set: &RtSet, rng: &mut Mt19937, rt_index: i32, area: u8) -> u32 {
    if rt_index >= 0 {
        if rt_index > 100 {
            return 0;
        }

        let ent = &set.enemy_rares[rt_index as usize];
        let rnd = rng.genrand_real1();

        if rnd < ent.prob {
            return ent.item_data;
        }
    } else {
        for ent in set.box_rares.iter() {
            if ent.area == area {
                let rnd = rng.genrand_real1();

                if rnd < ent.prob {
                    return ent.item_data;
                }
            }
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_rate_spans_the_packed_range() {
        // Low exponents collapse to the minimum scale.
        assert!(expand_rate(0) > 0.0);
        assert!(expand_rate(0) < 1e-8);

        // The maximum packed value approaches certainty.
        assert!(expand_rate(0xFF) > 0.4);

        // Monotone in the exponent bits.
        assert!(expand_rate(0x40) > expand_rate(0x20));
    }

    #[test]
    fn sure_rare_always_hits() {
        let mut set = RtSet::default();
        set.enemy_rares[5] = RtData {
            prob: 1.1, // past the top of genrand_real1's range
            item_data: 0x00_3302,
            area: 0,
        };

        let mut rng = Mt19937::new(1);
        assert_eq!(generate_rare(&set, &mut rng, 5, 0), 0x00_3302);
        // Other indexes still miss.
        assert_eq!(generate_rare(&set, &mut rng, 4, 0), 0);
    }

    #[test]
    fn box_rares_match_on_area() {
        let mut set = RtSet::default();
        set.box_rares[0] = RtData {
            prob: 1.1,
            item_data: 0x0101,
            area: 3,
        };

        let mut rng = Mt19937::new(2);
        assert_eq!(generate_rare(&set, &mut rng, -1, 3), 0x0101);
        assert_eq!(generate_rare(&set, &mut rng, -1, 4), 0);
    }

    #[test]
    fn out_of_range_index_is_no_drop() {
        let set = RtSet::default();
        let mut rng = Mt19937::new(3);
        assert_eq!(generate_rare(&set, &mut rng, 101, 0), 0);
    }
}
