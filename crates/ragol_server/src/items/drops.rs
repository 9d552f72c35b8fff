//! The random drop engine: enemy and box drops for v2, GC and Blue Burst.
//!
//! The RNG draw order in here is load-bearing. Drops must be reproducible
//! for a fixed block seed, and the sequence of draws is observable across a
//! whole session, so every roll happens exactly where the game's own logic
//! would make it.

use log::warn;

use ragol_common::item::{self, ITEM_DISK_LV01, ITEM_NO_SUCH_ITEM, ITEM_PHOTON_DROP};
use ragol_common::rng::Mt19937;
use ragol_common::Version;

use crate::lobby::LobbyState;
use crate::quests::DropPolicy;

use super::pmt::PmtData;
use super::pt::{PtV2Entry, PtV3Entry, PtV2Data, PtV3Data};
use super::rt::{self, RtGcData, RtV2Data};

/// Box/enemy drop kinds, as indexed in the PT `box_drop` table.
pub const BOX_TYPE_WEAPON: i8 = 0;
pub const BOX_TYPE_ARMOR: i8 = 1;
pub const BOX_TYPE_SHIELD: i8 = 2;
pub const BOX_TYPE_UNIT: i8 = 3;
pub const BOX_TYPE_TOOL: i8 = 4;
pub const BOX_TYPE_MESETA: i8 = 5;

/// Tool item codes in PT frequency-table order.
const TOOL_BASE: [u32; 28] = [
    0x0000_0003, 0x0001_0003, 0x0002_0003, // mono/di/trimate
    0x0000_0103, 0x0001_0103, 0x0002_0103, // mono/di/trifluid
    0x0000_0603, 0x0001_0603, 0x0000_0303, // antidote, antiparalysis, sol
    0x0000_0403, 0x0000_0503, 0x0000_0703, // moon, star, telepipe
    0x0000_0803, 0x0000_0A03, 0x0001_0A03, // trap vision, mono/digrinder
    0x0002_0A03, 0x0000_0B03, 0x0001_0B03, // trigrinder, power/mind mat
    0x0002_0B03, 0x0003_0B03, 0x0004_0B03, // evade, hp, tp materials
    0x0005_0B03, 0x0006_0B03, 0x0007_0B03, // def, hit, luck materials
    0x0000_0903, ITEM_DISK_LV01, ITEM_PHOTON_DROP, // scape doll, disk, pd
    ITEM_NO_SUCH_ITEM,
];

/// Weapon elemental attributes by ranking level, as the game tiers them.
const ATTR_LIST: [[u8; 12]; 4] = [
    [0x01, 0x05, 0x0F, 0x13, 0x17, 0x1B, 0x1F, 0x23, 0, 0, 0, 0],
    [0x02, 0x06, 0x10, 0x14, 0x18, 0x1C, 0x20, 0x24, 0x09, 0x0C, 0, 0],
    [0x03, 0x07, 0x11, 0x15, 0x19, 0x1D, 0x21, 0x25, 0x0A, 0x0C, 0x0D, 0x27],
    [0x04, 0x08, 0x12, 0x16, 0x1A, 0x1E, 0x22, 0x26, 0x0B, 0x0C, 0x0E, 0x28],
];

const ATTR_COUNT: [u32; 4] = [8, 10, 12, 12];

/// Everything the engine needs besides the lobby itself. Borrowed from the
/// ship so the engine stays independent of it (and testable).
pub struct DropEnv<'a> {
    pub pt_v2: Option<&'a PtV2Data>,
    pub pt_gc: Option<&'a PtV3Data>,
    pub pt_bb: Option<&'a PtV3Data>,
    pub pmt_v2: Option<&'a PmtData>,
    pub pmt_gc: Option<&'a PmtData>,
    pub pmt_bb: Option<&'a PmtData>,
    pub rt_v2: Option<&'a RtV2Data>,
    pub rt_gc: Option<&'a RtGcData>,
    pub quest_rares: bool,
    pub quest_semirares: bool,
}

/// A decoded item-request sub-command, plus the requester context the
/// algorithms consult.
#[derive(Debug, Copy, Clone)]
pub struct DropRequest {
    pub pt_index: u8,
    pub entity_id: u16,
    pub requester_area: u32,
    pub requester_version: Version,
    /// The team leader's section id, read at request time.
    pub section: u8,
}

fn set_item_byte(item: &mut [u32; 4], idx: usize, val: u8) {
    let dword = idx / 4;
    let shift = (idx % 4) * 8;
    item[dword] = (item[dword] & !(0xFFu32 << shift)) | ((val as u32) << shift);
}

fn set_item_word(item: &mut [u32; 4], idx: usize, val: u16) {
    let dword = idx / 2;
    let shift = (idx % 2) * 16;
    item[dword] = (item[dword] & !(0xFFFFu32 << shift)) | ((val as u32) << shift);
}

/// The weighted-pick idiom the game uses everywhere: subtract weights from
/// a bounded roll until it wraps below zero.
fn hits(rnd: &mut u32, weight: u32, bound: u32) -> bool {
    *rnd = rnd.wrapping_sub(weight);
    *rnd > bound
}

/// Fold a boss/off-map area back onto the area whose tables apply, per
/// episode. Returns the zero-based index into the per-area PT columns, or
/// `None` for requests from Pioneer 2.
pub fn fold_area(episode: u8, area: u32) -> Option<usize> {
    let folded = match episode {
        2 => match area {
            0 => return None,
            14 => 3,  // Barba Ray -> VR Space Ship Alpha
            15 => 6,  // Gol Dragon -> Jungle North
            12 => 9,  // Gal Gryphon -> SeaSide Daytime
            13 => 10, // Olga Flow -> SeaBed Upper Levels
            a if a > 10 => 10,
            a => a,
        },
        _ => match area {
            0 => return None,
            11 => 3,  // Dragon -> Cave 1
            12 => 6,  // De Rol Le -> Mine 1
            13 => 8,  // Vol Opt -> Ruins 1
            a if a >= 14 => 10, // Dark Falz and beyond -> Ruins 3
            a => a,
        },
    };

    Some(folded as usize - 1)
}

/// Quest drop policy resolution for this request.
struct QuestGate {
    do_rare: bool,
    check_semirare: bool,
    drop_nothing: bool,
}

fn quest_gate_v2(env: &DropEnv, st: &LobbyState, mid: Option<u16>, pt_index: u8) -> QuestGate {
    let mut gate = QuestGate {
        do_rare: true,
        check_semirare: false,
        drop_nothing: false,
    };

    if st.qid == 0 {
        return gate;
    }

    // Enemy requests match the per-id list first; box requests (no id)
    // only consult the per-type list.
    let policy = mid
        .and_then(|m| crate::quests::search_enemy_list(&st.mids, m as u32))
        .or_else(|| crate::quests::search_enemy_list(&st.mtypes, pt_index as u32));

    match policy {
        Some(DropPolicy::Nothing) => gate.drop_nothing = true,
        Some(DropPolicy::NoRare) => {
            gate.do_rare = false;
            gate.check_semirare = true;
        }
        Some(DropPolicy::Partial) => {
            gate.do_rare = false;
        }
        Some(DropPolicy::Free) => {}
        None => {
            if !env.quest_rares {
                gate.do_rare = false;
            }
            if !env.quest_semirares {
                gate.check_semirare = true;
            }
        }
    }

    gate
}

/// GC and BB don't carry quest monster lists; only the ship-wide policy
/// applies.
fn quest_gate_v3(env: &DropEnv, st: &LobbyState) -> QuestGate {
    let mut gate = QuestGate {
        do_rare: true,
        check_semirare: false,
        drop_nothing: false,
    };

    if st.qid != 0 {
        if !env.quest_rares {
            gate.do_rare = false;
        }
        if !env.quest_semirares {
            gate.check_semirare = true;
        }
    }

    gate
}

/// The post-generation filter: the lobby's limits list, then the semi-rare
/// star gate. `None` means the item is suppressed.
fn filter_item(
    env: &DropEnv,
    st: &LobbyState,
    item: [u32; 4],
    requester_version: Version,
    check_semirare: bool,
) -> Option<[u32; 4]> {
    if let Some(limits) = &st.limits {
        let it = ragol_common::ItemData::from_dwords(item);

        if !limits.check_item(&it, requester_version) {
            warn!(
                "potentially non-legit dropped by server: {:08x} {:08x} {:08x} {:08x} (difficulty {}, flags {:08x})",
                item[0], item[1], item[2], item[3], st.difficulty, st.flags
            );
            return None;
        }
    }

    if check_semirare {
        let stars = match st.version {
            Version::Gc => env.pmt_gc.and_then(|p| p.lookup_stars(item[0])),
            Version::BlueBurst => env.pmt_bb.and_then(|p| p.lookup_stars(item[0])),
            _ => env.pmt_v2.and_then(|p| p.lookup_stars(item[0])),
        };

        if let Some(stars) = stars {
            if stars >= 9 {
                return None;
            }
        }
    }

    Some(item)
}

// --- Weapon generation ---------------------------------------------------

struct WeaponPick {
    code: u32,
    grind_pattern: usize,
}

/// Enumerate the weapon classes legal on this floor and pick one, weighted
/// by the PT ratios. Shared by the v2 and v3 entry shapes.
fn pick_weapon(
    ratio: &[u8; 12],
    minrank: &[i8; 12],
    upgfloor: &[u8; 12],
    area: usize,
    rng: &mut Mt19937,
) -> Option<WeaponPick> {
    let mut wtypes = [0usize; 12];
    let mut wranks = [0i32; 12];
    let mut gptrn = [0usize; 12];
    let mut wchance = 0u32;
    let mut j = 0usize;

    for i in 0..12 {
        if minrank[i] as i32 + area as i32 >= 0 && ratio[i] > 0 {
            wtypes[j] = i;
            wchance += ratio[i] as u32;

            let mut warea;
            if minrank[i] >= 0 {
                warea = area as i32;
                wranks[j] = minrank[i] as i32;
            } else {
                warea = minrank[i] as i32 + area as i32;
                wranks[j] = 0;
            }

            // A zero upgrade-floor would never terminate below.
            if upgfloor[i] == 0 {
                warn!("invalid weapon upgrade floor for area {}, type {}", area, i);
                return None;
            }

            while warea - upgfloor[i] as i32 >= 0 {
                wranks[j] += 1;
                warea -= upgfloor[i] as i32;
            }

            gptrn[j] = (warea as usize).min(3);
            j += 1;
        }
    }

    if j == 0 {
        warn!("no weapon to generate on floor {}", area);
        return None;
    }

    let mut rnd = rng.genrand_int32() % wchance;
    for i in 0..j {
        if hits(&mut rnd, ratio[wtypes[i]] as u32, wchance) {
            return Some(WeaponPick {
                code: (((wtypes[i] + 1) as u32) << 8) | ((wranks[i] as u32) << 16),
                grind_pattern: gptrn[i],
            });
        }
    }

    None
}

fn weapon_is_semirare(code: u32) -> bool {
    let b1 = (code >> 8) & 0xFF;
    let b2 = (code >> 16) & 0xFF;
    (b1 >= 10 && b2 > 3) || b2 > 4
}

fn weapon_is_rare(code: u32) -> bool {
    (code >> 8) & 0xFF > 12
}

/// Grind, percentages and element for a v2 weapon. `picked` marks a rare
/// from the RT table, which keeps its code but re-rolls everything else.
fn generate_weapon_v2(
    ent: &PtV2Entry,
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
    picked: bool,
    v1: bool,
) -> Result<(), ()> {
    let mut rare = false;
    let mut semirare = false;
    let grind_pattern;

    if picked {
        if weapon_is_rare(item[0]) {
            rare = true;
            semirare = true;
        } else if weapon_is_semirare(item[0]) {
            semirare = true;
        }

        // RT-generated weapons use the last grind pattern.
        grind_pattern = 3;
        item[1] = 0;
        item[2] = 0;
        item[3] = 0;
    } else {
        item.fill(0);

        let pick = pick_weapon(
            &ent.weapon_ratio,
            &ent.weapon_minrank,
            &ent.weapon_upgfloor,
            area,
            rng,
        )
        .ok_or(())?;

        item[0] = pick.code;
        grind_pattern = pick.grind_pattern;

        if item[0] == 0 {
            warn!("generated invalid v2 weapon");
            return Err(());
        }

        if weapon_is_semirare(item[0]) {
            semirare = true;
        }
    }

    // Grind.
    let mut rnd = rng.genrand_int32() % 100;
    let mut got_grind = false;
    for i in 0..9 {
        if hits(&mut rnd, ent.power_pattern[i][grind_pattern] as u32, 100) {
            item[0] |= (i as u32) << 24;
            got_grind = true;
            break;
        }
    }

    if !got_grind {
        warn!("invalid power pattern for area {}, pattern {}", area, grind_pattern);
        return Err(());
    }

    // Up to three percentage slots.
    let mut upcts = 0u32;
    let mut npcts = 0usize;

    for slot in 0..3 {
        let col = ent.area_pattern[slot][area] as usize;
        if col >= 5 {
            continue;
        }

        let mut rnd = rng.genrand_int32() % 100;

        for row in 0..23 {
            if hits(&mut rnd, ent.percent_pattern[row][col] as u32, 100) {
                // Row 2 is the 0% row; nothing to attach.
                if row == 2 {
                    break;
                }

                let mut rnd2 = rng.genrand_int32() % 100;
                for k in 0..6 {
                    if hits(&mut rnd2, ent.percent_attachment[k][area] as u32, 100) {
                        if k == 0 || upcts & (1 << k) != 0 {
                            break;
                        }

                        let pct = ((row as i32 - 2) * 5) as i8;
                        set_item_byte(item, npcts * 2 + 6, k as u8);
                        set_item_byte(item, npcts * 2 + 7, pct as u8);
                        npcts += 1;
                        upcts |= 1 << k;
                        break;
                    }
                }

                break;
            }
        }
    }

    // Element, or the untekked flag for rares (and semi-rares on v1).
    if !semirare && ent.element_ranking[area] != 0 {
        let rnd = rng.genrand_int32() % 100;
        if rnd < ent.element_probability[area] as u32 {
            let rank = ent.element_ranking[area] as usize - 1;
            let rnd = rng.genrand_int32() % ATTR_COUNT[rank];
            item[1] = 0x80 | ATTR_LIST[rank][rnd as usize] as u32;
        }
    } else if rare || (v1 && semirare) {
        item[1] = 0x80;
    }

    Ok(())
}

/// The v3 weapon generator: 16-bit percent patterns out of 10000, and no
/// v1 semi-rare flagging.
fn generate_weapon_v3(
    ent: &PtV3Entry,
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
    picked: bool,
) -> Result<(), ()> {
    let mut rare = false;
    let mut semirare = false;
    let grind_pattern;

    if picked {
        if weapon_is_rare(item[0]) {
            rare = true;
            semirare = true;
        } else if weapon_is_semirare(item[0]) {
            semirare = true;
        }

        grind_pattern = 3;
        item[1] = 0;
        item[2] = 0;
        item[3] = 0;
    } else {
        item.fill(0);

        let pick = pick_weapon(
            &ent.weapon_ratio,
            &ent.weapon_minrank,
            &ent.weapon_upgfloor,
            area,
            rng,
        )
        .ok_or(())?;

        item[0] = pick.code;
        grind_pattern = pick.grind_pattern;

        if item[0] == 0 {
            warn!("generated invalid v3 weapon");
            return Err(());
        }

        if weapon_is_semirare(item[0]) {
            semirare = true;
        }
    }

    let mut rnd = rng.genrand_int32() % 100;
    let mut got_grind = false;
    for i in 0..9 {
        if hits(&mut rnd, ent.power_pattern[i][grind_pattern] as u32, 100) {
            item[0] |= (i as u32) << 24;
            got_grind = true;
            break;
        }
    }

    if !got_grind {
        warn!("invalid power pattern for area {}, pattern {}", area, grind_pattern);
        return Err(());
    }

    let mut upcts = 0u32;
    let mut npcts = 0usize;

    for slot in 0..3 {
        let col = ent.area_pattern[slot][area] as usize;
        if col >= 6 {
            continue;
        }

        let mut rnd = rng.genrand_int32() % 10000;

        for row in 0..23 {
            if hits(&mut rnd, ent.percent_pattern[row][col] as u32, 10000) {
                if row == 2 {
                    break;
                }

                let mut rnd2 = rng.genrand_int32() % 100;
                for k in 0..6 {
                    if hits(&mut rnd2, ent.percent_attachment[k][area] as u32, 100) {
                        if k == 0 || upcts & (1 << k) != 0 {
                            break;
                        }

                        let pct = ((row as i32 - 2) * 5) as i8;
                        set_item_byte(item, npcts * 2 + 6, k as u8);
                        set_item_byte(item, npcts * 2 + 7, pct as u8);
                        npcts += 1;
                        upcts |= 1 << k;
                        break;
                    }
                }

                break;
            }
        }
    }

    if !semirare && ent.element_ranking[area] != 0 {
        let rnd = rng.genrand_int32() % 100;
        if rnd < ent.element_probability[area] as u32 {
            let rank = ent.element_ranking[area] as usize - 1;
            let rnd = rng.genrand_int32() % ATTR_COUNT[rank];
            item[1] = 0x80 | ATTR_LIST[rank][rnd as usize] as u32;
        }
    } else if rare {
        item[1] = 0x80;
    }

    Ok(())
}

// --- Armor / shield / unit / tool / meseta -------------------------------

/// Shared armor/shield body: pick the ranking slot, derive the class byte
/// from `armor_level - 3 + area + slot`, clipped at zero.
fn pick_armor_class(
    armor_ranking: &[u8; 5],
    armor_level: u32,
    area: usize,
    rng: &mut Mt19937,
) -> Option<i32> {
    let mut rnd = rng.genrand_int32() % 100;

    for i in 0..5 {
        if hits(&mut rnd, armor_ranking[i] as u32, 100) {
            let level = armor_level as i32 - 3 + area as i32 + i as i32;
            return Some(level.max(0));
        }
    }

    None
}

fn roll_guard_boosts(
    dfp_range: u8,
    evp_range: u8,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
) {
    if dfp_range != 0 {
        let rnd = rng.genrand_int32() % (dfp_range as u32 + 1);
        set_item_word(item, 3, rnd as u16);
    }

    if evp_range != 0 {
        let rnd = rng.genrand_int32() % (evp_range as u32 + 1);
        set_item_word(item, 4, rnd as u16);
    }
}

fn generate_armor(
    armor_ranking: &[u8; 5],
    slot_ranking: &[u8; 5],
    armor_level: u32,
    pmt: &PmtData,
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
    picked: bool,
) -> Result<(), ()> {
    if !picked {
        let class = pick_armor_class(armor_ranking, armor_level, area, rng).ok_or_else(|| {
            warn!("couldn't find an armor to generate");
        })?;

        item[0] = 0x0000_0101 | ((class as u32) << 16);
    }

    item[1] = 0;
    item[2] = 0;
    item[3] = 0;

    // Unit slot count.
    let mut rnd = rng.genrand_int32() % 100;
    for i in 0..5 {
        if hits(&mut rnd, slot_ranking[i] as u32, 100) {
            set_item_byte(item, 5, i as u8);
            break;
        }
    }

    let guard = pmt.lookup_guard(item[0] & 0x00FF_FFFF).ok_or_else(|| {
        warn!("ItemPMT seems to be missing an armor type item (code {:08x})", item[0]);
    })?;

    roll_guard_boosts(guard.dfp_range, guard.evp_range, item, rng);
    Ok(())
}

fn generate_shield(
    armor_ranking: &[u8; 5],
    armor_level: u32,
    pmt: &PmtData,
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
    picked: bool,
) -> Result<(), ()> {
    if !picked {
        let class = pick_armor_class(armor_ranking, armor_level, area, rng).ok_or_else(|| {
            warn!("couldn't find a shield to generate");
        })?;

        item[0] = 0x0000_0201 | ((class as u32) << 16);
    }

    item[1] = 0;
    item[2] = 0;
    item[3] = 0;

    let guard = pmt.lookup_guard(item[0] & 0x00FF_FFFF).ok_or_else(|| {
        warn!("ItemPMT seems to be missing a shield type item (code {:08x})", item[0]);
    })?;

    roll_guard_boosts(guard.dfp_range, guard.evp_range, item, rng);
    Ok(())
}

fn generate_tool_base(freqs: &[[u16; 10]; 28], area: usize, rng: &mut Mt19937) -> u32 {
    let mut rnd = rng.genrand_int32() % 10000;

    for i in 0..28 {
        if hits(&mut rnd, freqs[i][area] as u32, 10000) {
            return TOOL_BASE[i];
        }
    }

    ITEM_NO_SUCH_ITEM
}

fn generate_tech(
    freqs: &[[u8; 10]; 19],
    levels: &[[i8; 20]; 19],
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
) -> Result<(), ()> {
    let rnd = rng.genrand_int32();
    let mut tech = rnd % 1000;
    let rnd = rnd / 1000;

    for i in 0..19 {
        if hits(&mut tech, freqs[i][area] as u32, 1000) {
            let mut t1 = levels[i][area << 1];
            let mut t2 = levels[i][(area << 1) + 1];

            if t1 == -1 || t1 > t2 {
                warn!("invalid tech level set for area {}, tech {}", area, i);
                return Err(());
            }

            // Sega's own files sometimes carry silly level caps.
            if t1 >= 30 {
                t1 = 29;
            }

            if t2 >= 30 {
                t2 = 29;
            }

            let level = if t1 < t2 {
                (rnd % ((t2 as u32 + 1) - t1 as u32)) + t1 as u32
            } else {
                t1 as u32
            };

            item[1] = i as u32;
            item[0] |= level << 16;
            return Ok(());
        }
    }

    warn!("couldn't find technique to drop for area {}", area);
    Err(())
}

fn generate_tool(
    freqs: &[[u16; 10]; 28],
    tech_freqs: &[[u8; 10]; 19],
    tech_levels: &[[i8; 20]; 19],
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
    allow_photon_drop: bool,
) -> Result<(), ()> {
    item[0] = generate_tool_base(freqs, area, rng);

    if item[0] == ITEM_NO_SUCH_ITEM || (!allow_photon_drop && item[0] == ITEM_PHOTON_DROP) {
        warn!("generated invalid tool; check the ItemPT data");
        return Err(());
    }

    item[1] = 0;
    item[2] = 0;
    item[3] = 0;

    if item::is_stackable(item[0]) {
        item[1] = 1 << 8;
    }

    if item[0] == ITEM_DISK_LV01 {
        generate_tech(tech_freqs, tech_levels, area, item, rng)?;
    }

    Ok(())
}

fn generate_meseta(min: u16, max: u16, item: &mut [u32; 4], rng: &mut Mt19937) -> Result<(), ()> {
    let amount = if min < max {
        (rng.genrand_int32() % ((max as u32 + 1) - min as u32)) + min as u32
    } else {
        min as u32
    };

    if amount != 0 {
        item[0] = 0x0000_0004;
        item[1] = 0;
        item[2] = 0;
        item[3] = amount;
        return Ok(());
    }

    Err(())
}

/// Rare mags get fixed cosmetic stats; the v2 and v3 games disagree on the
/// exact dwords.
fn rare_mag(item: &mut [u32; 4], v3: bool) {
    if v3 {
        item[0] = 0x0005_0002;
        item[1] = 0x0000_01F4;
        item[2] = 0x0000_0000;
        item[3] = 0x2800_00FF;
    } else {
        item[0] = 0x0005_0002;
        item[1] = 0x0001_01F4;
        item[2] = 0x0001_0001;
        item[3] = 0x0028_0000;
    }
}

fn rare_tool(item: &mut [u32; 4]) {
    item[1] = 0;
    item[2] = 0;
    item[3] = 0;

    if item::is_stackable(item[0]) {
        item[1] = 1 << 8;
    }
}

/// Customise an RT-picked rare by its class. Returns `Err` when the RT
/// table produced something unusable.
fn customize_rare_v2(
    ent: &PtV2Entry,
    pmt: &PmtData,
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
    v1: bool,
) -> Result<(), ()> {
    match item[0] & 0xFF {
        0x00 => generate_weapon_v2(ent, area, item, rng, true, v1),
        0x01 => match (item[0] >> 8) & 0xFF {
            0x01 => generate_armor(
                &ent.armor_ranking,
                &ent.slot_ranking,
                ent.armor_level,
                pmt,
                area,
                item,
                rng,
                true,
            ),
            0x02 => generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, item, rng, true),
            0x03 => Ok(()),
            _ => {
                warn!("v2 ItemRT generated an invalid item: {:08x}", item[0]);
                Err(())
            }
        },
        0x02 => {
            rare_mag(item, false);
            Ok(())
        }
        0x03 => {
            rare_tool(item);
            Ok(())
        }
        _ => {
            warn!("v2 ItemRT generated an invalid item: {:08x}", item[0]);
            Err(())
        }
    }
}

fn customize_rare_v3(
    ent: &PtV3Entry,
    pmt: &PmtData,
    area: usize,
    item: &mut [u32; 4],
    rng: &mut Mt19937,
) -> Result<(), ()> {
    match item[0] & 0xFF {
        0x00 => generate_weapon_v3(ent, area, item, rng, true),
        0x01 => match (item[0] >> 8) & 0xFF {
            0x01 => generate_armor(
                &ent.armor_ranking,
                &ent.slot_ranking,
                ent.armor_level,
                pmt,
                area,
                item,
                rng,
                true,
            ),
            0x02 => generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, item, rng, true),
            0x03 => Ok(()),
            _ => {
                warn!("v3 ItemRT generated an invalid item: {:08x}", item[0]);
                Err(())
            }
        },
        0x02 => {
            rare_mag(item, true);
            Ok(())
        }
        0x03 => {
            rare_tool(item);
            Ok(())
        }
        _ => {
            warn!("v3 ItemRT generated an invalid item: {:08x}", item[0]);
            Err(())
        }
    }
}

// --- The drop entry points -----------------------------------------------

/// v2 enemy drop. Returns the generated dwords, or `None` for "no drop"
/// (already dropped, DAR miss, policy suppression, filter rejection...).
pub fn enemy_drop_v2(
    env: &DropEnv,
    st: &mut LobbyState,
    req: &DropRequest,
    rng: &mut Mt19937,
) -> Option<[u32; 4]> {
    if req.pt_index > 0x33 {
        return None;
    }

    if req.pt_index == 0x30 {
        return box_drop_v2(env, st, req, rng);
    }

    let pt = env.pt_v2?;
    let pmt = env.pmt_v2?;
    let ent = pt.entry(st.difficulty, req.section);

    let area = match fold_area(1, req.requester_area) {
        Some(a) => a,
        None => {
            warn!("enemy drop requested on Pioneer 2");
            return None;
        }
    };

    let enemies = st.map_enemies.as_mut()?;
    let enemy = match enemies.enemies.get_mut(req.entity_id as usize) {
        Some(e) => e,
        None => {
            warn!(
                "drop requested for invalid enemy ({} -- max {}, quest {})",
                req.entity_id,
                enemies.enemies.len(),
                st.qid
            );
            return None;
        }
    };

    if enemy.drop_done {
        return None;
    }

    enemy.drop_done = true;

    // Drop-anything gate.
    let rnd = rng.genrand_int32() % 100;
    if rnd >= ent.enemy_dar[req.pt_index as usize] as u32 {
        return None;
    }

    let gate = quest_gate_v2(env, st, Some(req.entity_id), req.pt_index);
    if gate.drop_nothing {
        return None;
    }

    let mut item = [0u32; 4];

    if gate.do_rare {
        if let Some(rtd) = env.rt_v2 {
            let set = rtd.set(st.difficulty, st.section);
            item[0] = rt::generate_rare(set, rng, req.pt_index as i32, 0);

            if item[0] != 0 {
                let v1 = st.version == Version::Dcv1;
                customize_rare_v2(ent, pmt, area, &mut item, rng, v1).ok()?;
                return filter_item(env, st, item, req.requester_version, gate.check_semirare);
            }
        }
    }

    // Uniform three-way split: designated class, tool, or meseta.
    match rng.genrand_int32() % 3 {
        0 => match ent.enemy_drop[req.pt_index as usize] {
            BOX_TYPE_WEAPON => {
                let v1 = st.version == Version::Dcv1;
                generate_weapon_v2(ent, area, &mut item, rng, false, v1).ok()?;
            }
            BOX_TYPE_ARMOR => {
                generate_armor(
                    &ent.armor_ranking,
                    &ent.slot_ranking,
                    ent.armor_level,
                    pmt,
                    area,
                    &mut item,
                    rng,
                    false,
                )
                .ok()?;
            }
            BOX_TYPE_SHIELD => {
                generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, &mut item, rng, false)
                    .ok()?;
            }
            BOX_TYPE_UNIT => {
                item = pmt.random_unit(ent.unit_level[area], rng);
            }
            -1 => return None,
            other => {
                warn!("unknown v2 enemy drop ({}) for index {}", other, req.pt_index);
                return None;
            }
        },
        1 => {
            generate_tool(
                &ent.tool_frequency,
                &ent.tech_frequency,
                &ent.tech_levels,
                area,
                &mut item,
                rng,
                false,
            )
            .ok()?;
        }
        _ => {
            let (min, max) = ent.enemy_meseta[req.pt_index as usize];
            generate_meseta(min, max, &mut item, rng).ok()?;
        }
    }

    filter_item(env, st, item, req.requester_version, gate.check_semirare)
}

/// The fixed-box decision: skins 0x92/0x161 with the first float at 1.0.
/// Fully fixed when the second float is also 1.0; the encoded item code is
/// stored byte-swapped in the object data.
enum FixedBox {
    No,
    Class(u32),
    Item([u32; 4]),
}

fn check_fixed_box(obj: &crate::map::MapObject) -> FixedBox {
    const EPSILON: f32 = 0.001;

    let f1 = obj.float(0);
    if (obj.skin != 0x92 && obj.skin != 0x161) || (f1 - 1.0).abs() > EPSILON {
        return FixedBox::No;
    }

    let f2 = obj.float(1);
    if (f2 - 1.0).abs() <= EPSILON {
        let code = obj.dwords[2].swap_bytes();
        let mut item = [code, 0, 0, 0];

        if item::is_stackable(code) {
            item[1] = 1 << 8;
        }

        // Vol Opt's meseta boxes encode tens of meseta in the high word.
        if code == 0x0000_0004 {
            item[3] = (obj.dwords[3] >> 16) * 10;
        }

        return FixedBox::Item(item);
    }

    FixedBox::Class(obj.dwords[2].swap_bytes())
}

pub fn box_drop_v2(
    env: &DropEnv,
    st: &mut LobbyState,
    req: &DropRequest,
    rng: &mut Mt19937,
) -> Option<[u32; 4]> {
    if req.pt_index != 0x30 {
        return None;
    }

    let pt = env.pt_v2?;
    let pmt = env.pmt_v2?;
    let ent = pt.entry(st.difficulty, req.section);

    let area = match fold_area(1, req.requester_area) {
        Some(a) => a,
        None => {
            warn!("box drop requested on Pioneer 2");
            return None;
        }
    };

    let objs = st.map_objects.as_mut()?;
    let gobj = match objs.objs.get_mut(req.entity_id as usize) {
        Some(o) => o,
        None => {
            warn!("drop requested from invalid box {}", req.entity_id);
            return None;
        }
    };

    if gobj.opened {
        return None;
    }

    gobj.opened = true;
    let obj = gobj.data;

    let gate = quest_gate_v2(env, st, None, 0x30);
    if gate.drop_nothing {
        return None;
    }

    let mut item = [0u32; 4];
    let v1 = st.version == Version::Dcv1;

    // Fixed boxes bypass the rare roll entirely.
    match check_fixed_box(&obj) {
        FixedBox::Item(fixed) => {
            return filter_item(env, st, fixed, req.requester_version, gate.check_semirare)
        }
        FixedBox::Class(code) => {
            match code & 0xFF {
                0x00 => generate_weapon_v2(ent, area, &mut item, rng, false, v1).ok()?,
                0x01 => generate_armor(
                    &ent.armor_ranking,
                    &ent.slot_ranking,
                    ent.armor_level,
                    pmt,
                    area,
                    &mut item,
                    rng,
                    false,
                )
                .ok()?,
                0x03 => generate_tool(
                    &ent.tool_frequency,
                    &ent.tech_frequency,
                    &ent.tech_levels,
                    area,
                    &mut item,
                    rng,
                    false,
                )
                .ok()?,
                0x04 => {
                    let (min, max) = ent.box_meseta[area];
                    generate_meseta(min, max, &mut item, rng).ok()?;
                }
                _ => {
                    warn!("invalid type detected from fixed-type box");
                    return None;
                }
            }

            return filter_item(env, st, item, req.requester_version, gate.check_semirare);
        }
        FixedBox::No => {}
    }

    if gate.do_rare {
        if let Some(rtd) = env.rt_v2 {
            let set = rtd.set(st.difficulty, st.section);
            item[0] = rt::generate_rare(set, rng, -1, (area + 1) as u8);

            if item[0] != 0 {
                customize_rare_v2(ent, pmt, area, &mut item, rng, v1).ok()?;
                return filter_item(env, st, item, req.requester_version, gate.check_semirare);
            }
        }
    }

    // Weighted box-kind roll.
    let mut rnd = rng.genrand_int32() % 100;

    if hits(&mut rnd, ent.box_drop[BOX_TYPE_WEAPON as usize][area] as u32, 100) {
        generate_weapon_v2(ent, area, &mut item, rng, false, v1).ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_ARMOR as usize][area] as u32, 100) {
        generate_armor(
            &ent.armor_ranking,
            &ent.slot_ranking,
            ent.armor_level,
            pmt,
            area,
            &mut item,
            rng,
            false,
        )
        .ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_SHIELD as usize][area] as u32, 100) {
        generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, &mut item, rng, false).ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_UNIT as usize][area] as u32, 100) {
        item = pmt.random_unit(ent.unit_level[area], rng);
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_TOOL as usize][area] as u32, 100) {
        generate_tool(
            &ent.tool_frequency,
            &ent.tech_frequency,
            &ent.tech_levels,
            area,
            &mut item,
            rng,
            false,
        )
        .ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_MESETA as usize][area] as u32, 100) {
        let (min, max) = ent.box_meseta[area];
        generate_meseta(min, max, &mut item, rng).ok()?;
    } else {
        return None;
    }

    filter_item(env, st, item, req.requester_version, gate.check_semirare)
}

/// GC enemy drop: the v3 tables, episode-aware area folding, ship-policy
/// quest gating only.
pub fn enemy_drop_gc(
    env: &DropEnv,
    st: &mut LobbyState,
    req: &DropRequest,
    rng: &mut Mt19937,
) -> Option<[u32; 4]> {
    if req.pt_index == 0x30 {
        return box_drop_gc(env, st, req, rng);
    }

    // The per-type tables only have a hundred rows.
    if req.pt_index >= 100 {
        return None;
    }

    let pt = env.pt_gc?;
    let pmt = env.pmt_gc?;
    let ent = pt.entry(st.episode, st.difficulty, req.section);

    let area = match fold_area(st.episode, req.requester_area) {
        Some(a) => a,
        None => {
            warn!("enemy drop requested on Pioneer 2");
            return None;
        }
    };

    let enemies = st.map_enemies.as_mut()?;
    let enemy = enemies.enemies.get_mut(req.entity_id as usize)?;

    if enemy.drop_done {
        return None;
    }

    enemy.drop_done = true;

    let rnd = rng.genrand_int32() % 100;
    if rnd >= ent.enemy_dar[req.pt_index as usize] as u32 {
        return None;
    }

    let gate = quest_gate_v3(env, st);

    let mut item = [0u32; 4];

    if gate.do_rare {
        if let Some(rtd) = env.rt_gc {
            let set = rtd.set(st.episode, st.difficulty, st.section);
            item[0] = rt::generate_rare(set, rng, req.pt_index as i32, 0);

            if item[0] != 0 {
                customize_rare_v3(ent, pmt, area, &mut item, rng).ok()?;
                return filter_item(env, st, item, req.requester_version, gate.check_semirare);
            }
        }
    }

    match rng.genrand_int32() % 3 {
        0 => match ent.enemy_drop[req.pt_index as usize] {
            BOX_TYPE_WEAPON => generate_weapon_v3(ent, area, &mut item, rng, false).ok()?,
            BOX_TYPE_ARMOR => generate_armor(
                &ent.armor_ranking,
                &ent.slot_ranking,
                ent.armor_level,
                pmt,
                area,
                &mut item,
                rng,
                false,
            )
            .ok()?,
            BOX_TYPE_SHIELD => {
                generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, &mut item, rng, false)
                    .ok()?
            }
            BOX_TYPE_UNIT => item = pmt.random_unit(ent.unit_level[area], rng),
            -1 => return None,
            other => {
                warn!("unknown GC enemy drop ({}) for index {}", other, req.pt_index);
                return None;
            }
        },
        1 => generate_tool(
            &ent.tool_frequency,
            &ent.tech_frequency,
            &ent.tech_levels,
            area,
            &mut item,
            rng,
            true,
        )
        .ok()?,
        _ => {
            let (min, max) = ent.enemy_meseta[req.pt_index as usize];
            generate_meseta(min, max, &mut item, rng).ok()?;
        }
    }

    filter_item(env, st, item, req.requester_version, gate.check_semirare)
}

pub fn box_drop_gc(
    env: &DropEnv,
    st: &mut LobbyState,
    req: &DropRequest,
    rng: &mut Mt19937,
) -> Option<[u32; 4]> {
    if req.pt_index != 0x30 {
        return None;
    }

    let pt = env.pt_gc?;
    let pmt = env.pmt_gc?;
    let ent = pt.entry(st.episode, st.difficulty, req.section);

    let area = fold_area(st.episode, req.requester_area)?;

    let objs = st.map_objects.as_mut()?;
    let gobj = objs.objs.get_mut(req.entity_id as usize)?;

    if gobj.opened {
        return None;
    }

    gobj.opened = true;
    let obj = gobj.data;

    let gate = quest_gate_v3(env, st);

    let mut item = [0u32; 4];

    match check_fixed_box(&obj) {
        FixedBox::Item(fixed) => {
            return filter_item(env, st, fixed, req.requester_version, gate.check_semirare)
        }
        FixedBox::Class(code) => {
            match code & 0xFF {
                0x00 => generate_weapon_v3(ent, area, &mut item, rng, false).ok()?,
                0x01 => generate_armor(
                    &ent.armor_ranking,
                    &ent.slot_ranking,
                    ent.armor_level,
                    pmt,
                    area,
                    &mut item,
                    rng,
                    false,
                )
                .ok()?,
                0x03 => generate_tool(
                    &ent.tool_frequency,
                    &ent.tech_frequency,
                    &ent.tech_levels,
                    area,
                    &mut item,
                    rng,
                    true,
                )
                .ok()?,
                0x04 => {
                    let (min, max) = ent.box_meseta[area];
                    generate_meseta(min, max, &mut item, rng).ok()?;
                }
                _ => {
                    warn!("invalid type detected from fixed-type box");
                    return None;
                }
            }

            return filter_item(env, st, item, req.requester_version, gate.check_semirare);
        }
        FixedBox::No => {}
    }

    if gate.do_rare {
        if let Some(rtd) = env.rt_gc {
            let set = rtd.set(st.episode, st.difficulty, st.section);
            item[0] = rt::generate_rare(set, rng, -1, (area + 1) as u8);

            if item[0] != 0 {
                customize_rare_v3(ent, pmt, area, &mut item, rng).ok()?;
                return filter_item(env, st, item, req.requester_version, gate.check_semirare);
            }
        }
    }

    let mut rnd = rng.genrand_int32() % 100;

    if hits(&mut rnd, ent.box_drop[BOX_TYPE_WEAPON as usize][area] as u32, 100) {
        generate_weapon_v3(ent, area, &mut item, rng, false).ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_ARMOR as usize][area] as u32, 100) {
        generate_armor(
            &ent.armor_ranking,
            &ent.slot_ranking,
            ent.armor_level,
            pmt,
            area,
            &mut item,
            rng,
            false,
        )
        .ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_SHIELD as usize][area] as u32, 100) {
        generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, &mut item, rng, false).ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_UNIT as usize][area] as u32, 100) {
        item = pmt.random_unit(ent.unit_level[area], rng);
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_TOOL as usize][area] as u32, 100) {
        generate_tool(
            &ent.tool_frequency,
            &ent.tech_frequency,
            &ent.tech_levels,
            area,
            &mut item,
            rng,
            true,
        )
        .ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_MESETA as usize][area] as u32, 100) {
        let (min, max) = ent.box_meseta[area];
        generate_meseta(min, max, &mut item, rng).ok()?;
    } else {
        return None;
    }

    filter_item(env, st, item, req.requester_version, gate.check_semirare)
}

/// Blue Burst drops use the BB PT tables with the GC rare table. The
/// caller owns enqueueing the result on the lobby floor. Episode 4 drops
/// are not generated, matching the original server.
pub fn enemy_drop_bb(
    env: &DropEnv,
    st: &mut LobbyState,
    req: &DropRequest,
    rng: &mut Mt19937,
) -> Option<[u32; 4]> {
    if st.episode == 3 {
        return None;
    }

    if req.pt_index == 0x30 {
        return box_drop_bb(env, st, req, rng);
    }

    if req.pt_index >= 100 {
        return None;
    }

    let pt = env.pt_bb?;
    let pmt = env.pmt_bb?;
    let ent = pt.entry(st.episode, st.difficulty, req.section);

    let area = fold_area(st.episode, req.requester_area)?;

    let enemies = st.map_enemies.as_mut()?;
    let enemy = enemies.enemies.get_mut(req.entity_id as usize)?;

    if enemy.drop_done {
        return None;
    }

    enemy.drop_done = true;

    let rnd = rng.genrand_int32() % 100;
    if rnd >= ent.enemy_dar[req.pt_index as usize] as u32 {
        return None;
    }

    let gate = quest_gate_v3(env, st);

    let mut item = [0u32; 4];

    if gate.do_rare {
        if let Some(rtd) = env.rt_gc {
            let set = rtd.set(st.episode, st.difficulty, st.section);
            item[0] = rt::generate_rare(set, rng, req.pt_index as i32, 0);

            if item[0] != 0 {
                customize_rare_v3(ent, pmt, area, &mut item, rng).ok()?;
                return filter_item(env, st, item, req.requester_version, gate.check_semirare);
            }
        }
    }

    match rng.genrand_int32() % 3 {
        0 => match ent.enemy_drop[req.pt_index as usize] {
            BOX_TYPE_WEAPON => generate_weapon_v3(ent, area, &mut item, rng, false).ok()?,
            BOX_TYPE_ARMOR => generate_armor(
                &ent.armor_ranking,
                &ent.slot_ranking,
                ent.armor_level,
                pmt,
                area,
                &mut item,
                rng,
                false,
            )
            .ok()?,
            BOX_TYPE_SHIELD => {
                generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, &mut item, rng, false)
                    .ok()?
            }
            BOX_TYPE_UNIT => item = pmt.random_unit(ent.unit_level[area], rng),
            -1 => return None,
            other => {
                warn!("unknown BB enemy drop ({}) for index {}", other, req.pt_index);
                return None;
            }
        },
        1 => generate_tool(
            &ent.tool_frequency,
            &ent.tech_frequency,
            &ent.tech_levels,
            area,
            &mut item,
            rng,
            true,
        )
        .ok()?,
        _ => {
            let (min, max) = ent.enemy_meseta[req.pt_index as usize];
            generate_meseta(min, max, &mut item, rng).ok()?;
        }
    }

    // BB has no limits lists attached; only the semi-rare gate applies.
    if gate.check_semirare {
        if let Some(stars) = pmt.lookup_stars(item[0]) {
            if stars >= 9 {
                return None;
            }
        }
    }

    Some(item)
}

pub fn box_drop_bb(
    env: &DropEnv,
    st: &mut LobbyState,
    req: &DropRequest,
    rng: &mut Mt19937,
) -> Option<[u32; 4]> {
    if st.episode == 3 || req.pt_index != 0x30 {
        return None;
    }

    let pt = env.pt_bb?;
    let pmt = env.pmt_bb?;
    let ent = pt.entry(st.episode, st.difficulty, req.section);

    let area = fold_area(st.episode, req.requester_area)?;

    let objs = st.map_objects.as_mut()?;
    let gobj = objs.objs.get_mut(req.entity_id as usize)?;

    if gobj.opened {
        return None;
    }

    gobj.opened = true;
    let obj = gobj.data;

    let gate = quest_gate_v3(env, st);

    let mut item = [0u32; 4];

    let semirare_gate = |pmt: &PmtData, item: [u32; 4]| -> Option<[u32; 4]> {
        if gate.check_semirare {
            if let Some(stars) = pmt.lookup_stars(item[0]) {
                if stars >= 9 {
                    return None;
                }
            }
        }
        Some(item)
    };

    match check_fixed_box(&obj) {
        FixedBox::Item(fixed) => return semirare_gate(pmt, fixed),
        FixedBox::Class(code) => {
            match code & 0xFF {
                0x00 => generate_weapon_v3(ent, area, &mut item, rng, false).ok()?,
                0x01 => generate_armor(
                    &ent.armor_ranking,
                    &ent.slot_ranking,
                    ent.armor_level,
                    pmt,
                    area,
                    &mut item,
                    rng,
                    false,
                )
                .ok()?,
                0x03 => generate_tool(
                    &ent.tool_frequency,
                    &ent.tech_frequency,
                    &ent.tech_levels,
                    area,
                    &mut item,
                    rng,
                    true,
                )
                .ok()?,
                0x04 => {
                    let (min, max) = ent.box_meseta[area];
                    generate_meseta(min, max, &mut item, rng).ok()?;
                }
                _ => return None,
            }

            return semirare_gate(pmt, item);
        }
        FixedBox::No => {}
    }

    if gate.do_rare {
        if let Some(rtd) = env.rt_gc {
            let set = rtd.set(st.episode, st.difficulty, st.section);
            item[0] = rt::generate_rare(set, rng, -1, (area + 1) as u8);

            if item[0] != 0 {
                customize_rare_v3(ent, pmt, area, &mut item, rng).ok()?;
                return semirare_gate(pmt, item);
            }
        }
    }

    let mut rnd = rng.genrand_int32() % 100;

    if hits(&mut rnd, ent.box_drop[BOX_TYPE_WEAPON as usize][area] as u32, 100) {
        generate_weapon_v3(ent, area, &mut item, rng, false).ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_ARMOR as usize][area] as u32, 100) {
        generate_armor(
            &ent.armor_ranking,
            &ent.slot_ranking,
            ent.armor_level,
            pmt,
            area,
            &mut item,
            rng,
            false,
        )
        .ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_SHIELD as usize][area] as u32, 100) {
        generate_shield(&ent.armor_ranking, ent.armor_level, pmt, area, &mut item, rng, false).ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_UNIT as usize][area] as u32, 100) {
        item = pmt.random_unit(ent.unit_level[area], rng);
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_TOOL as usize][area] as u32, 100) {
        generate_tool(
            &ent.tool_frequency,
            &ent.tech_frequency,
            &ent.tech_levels,
            area,
            &mut item,
            rng,
            true,
        )
        .ok()?;
    } else if hits(&mut rnd, ent.box_drop[BOX_TYPE_MESETA as usize][area] as u32, 100) {
        let (min, max) = ent.box_meseta[area];
        generate_meseta(min, max, &mut item, rng).ok()?;
    } else {
        return None;
    }

    semirare_gate(pmt, item)
}

/// The vestigial drop function a magic lobby name selects: a 1-in-16 gate
/// on a difficulty-masked meseta amount.
pub fn legacy_drop(st: &LobbyState, rng: &mut Mt19937) -> Option<[u32; 4]> {
    let r = rng.genrand_int32();

    if r & 15 != 2 {
        return None;
    }

    let r = rng.genrand_int32();

    let amount = match st.difficulty {
        0 => r & 0x1F,
        1 => r & 0x3F,
        2 => r & 0x7F,
        3 => r & 0xFF,
        _ => return None,
    };

    if amount != 0 {
        return Some([4, 0, 0, amount]);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::pt::{parse_v2_entry, PT_V2_ENTRY_SIZE};
    use crate::items::rt::{RtData, RtSet};
    use crate::lobby::{self, CreateGameParams};
    use crate::map::{GameEnemies, GameEnemy, GameObjects};

    fn test_pt_entry() -> PtV2Entry {
        let mut raw = vec![0u8; PT_V2_ENTRY_SIZE];

        // Sabers (type 0): always available, ratio 100.
        raw[0x00] = 100; // ratio
        raw[0x0C] = 0; // minrank
        raw[0x18] = 2; // upgfloor

        // Power pattern: grind column 3 (RT picks) puts everything on row 0.
        for warea in 0..4 {
            raw[0x24 + warea] = 100; // power_pattern[0][warea]
        }

        // DAR 100 for every type, designated drop weapon, meseta 10..20.
        for i in 0..100 {
            raw[0x5A8 + i] = 100;
            raw[0x79C + i] = 0;
        }

        parse_v2_entry(&raw)
    }

    fn test_pt_data() -> PtV2Data {
        PtV2Data {
            entries: (0..40).map(|_| test_pt_entry()).collect(),
        }
    }

    fn test_pmt() -> PmtData {
        PmtData::parse(
            &crate::items::pmt_test_image(),
            crate::items::pmt::PmtVersion::V2,
            true,
        )
        .unwrap()
    }

    fn rt_with_sure_drop(rt_index: usize, code: u32) -> RtV2Data {
        let mut set = RtSet::default();
        set.enemy_rares[rt_index] = RtData {
            prob: 1.1,
            item_data: code,
            area: 0,
        };

        RtV2Data {
            sets: (0..40).map(|_| set.clone()).collect(),
        }
    }

    /// A team with one enemy at rt_index 5, section id 9, normal difficulty.
    fn team_with_enemies(version: Version) -> std::sync::Arc<crate::lobby::Lobby> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let creator = std::sync::Arc::new(crate::client::Client::new(
            1,
            "127.0.0.1:1".parse().unwrap(),
            1,
            version,
            tx,
        ));

        let mut rng = Mt19937::new(9);
        let l = lobby::create_game(
            1,
            0x20,
            &mut rng,
            CreateGameParams {
                name: "Drops".into(),
                passwd: String::new(),
                difficulty: 0,
                battle: false,
                challenge: false,
                v2: version == Version::Dcv2,
                version,
                section: 9,
                event: 0,
                episode: 1,
                single_player: false,
            },
            &creator,
        );

        {
            let mut st = l.lock();
            st.map_enemies = Some(GameEnemies {
                enemies: vec![GameEnemy {
                    bp_entry: 0x49,
                    rt_index: 5,
                    clients_hit: 0,
                    last_client: 0,
                    drop_done: false,
                }],
            });
            st.map_objects = Some(GameObjects::default());
        }

        l
    }

    fn env<'a>(
        pt: &'a PtV2Data,
        pmt: &'a PmtData,
        rt: Option<&'a RtV2Data>,
    ) -> DropEnv<'a> {
        DropEnv {
            pt_v2: Some(pt),
            pt_gc: None,
            pt_bb: None,
            pmt_v2: Some(pmt),
            pmt_gc: None,
            pmt_bb: None,
            rt_v2: rt,
            rt_gc: None,
            quest_rares: false,
            quest_semirares: false,
        }
    }

    #[test]
    fn rare_enemy_drop_takes_its_grind_from_pattern_three() {
        let pt = test_pt_data();
        let pmt = test_pmt();
        // A rare weapon: type byte 0x33 is far past the common classes.
        let rt = rt_with_sure_drop(5, 0x0000_3300);
        let env = env(&pt, &pmt, Some(&rt));

        let l = team_with_enemies(Version::Dcv1);
        let mut st = l.lock();
        let mut rng = Mt19937::new(0xDEAD_BEEF);

        let req = DropRequest {
            pt_index: 5,
            entity_id: 0,
            requester_area: 1, // Forest 1
            requester_version: Version::Dcv1,
            section: 9,
        };

        let item = enemy_drop_v2(&env, &mut st, &req, &mut rng).unwrap();

        // The rare's code survives in dword 0 with the grind in the top
        // byte; power pattern row 0 always hits, so grind 0. Rares come
        // out untekked.
        assert_eq!(item[0] & 0x00FF_FFFF, 0x0000_3300);
        assert_eq!(item[0] >> 24, 0);
        assert_eq!(item[1], 0x80);

        // The enemy is spent: a second request yields nothing.
        assert!(st.map_enemies.as_ref().unwrap().enemies[0].drop_done);
        assert!(enemy_drop_v2(&env, &mut st, &req, &mut rng).is_none());
    }

    #[test]
    fn drops_are_reproducible_for_a_fixed_seed() {
        let pt = test_pt_data();
        let pmt = test_pmt();
        let env = env(&pt, &pmt, None);

        let req = DropRequest {
            pt_index: 5,
            entity_id: 0,
            requester_area: 1,
            requester_version: Version::Dcv2,
            section: 9,
        };

        let mut runs = Vec::new();
        for _ in 0..2 {
            let l = team_with_enemies(Version::Dcv2);
            let mut st = l.lock();
            let mut rng = Mt19937::new(0xDEAD_BEEF);
            runs.push(enemy_drop_v2(&env, &mut st, &req, &mut rng));
        }

        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn pioneer2_requests_are_rejected() {
        let pt = test_pt_data();
        let pmt = test_pmt();
        let env = env(&pt, &pmt, None);

        let l = team_with_enemies(Version::Dcv2);
        let mut st = l.lock();
        let mut rng = Mt19937::new(7);

        let req = DropRequest {
            pt_index: 5,
            entity_id: 0,
            requester_area: 0,
            requester_version: Version::Dcv2,
            section: 9,
        };

        assert!(enemy_drop_v2(&env, &mut st, &req, &mut rng).is_none());
        // And the enemy is NOT spent by an invalid request.
        assert!(!st.map_enemies.as_ref().unwrap().enemies[0].drop_done);
    }

    #[test]
    fn quest_policy_nothing_suppresses_the_drop() {
        let pt = test_pt_data();
        let pmt = test_pmt();
        let env = env(&pt, &pmt, None);

        let l = team_with_enemies(Version::Dcv2);
        let mut st = l.lock();
        st.qid = 42;
        st.mids = vec![crate::quests::QuestEnemy {
            id: 0,
            policy: DropPolicy::Nothing,
        }];

        let mut rng = Mt19937::new(7);
        let req = DropRequest {
            pt_index: 5,
            entity_id: 0,
            requester_area: 1,
            requester_version: Version::Dcv2,
            section: 9,
        };

        assert!(enemy_drop_v2(&env, &mut st, &req, &mut rng).is_none());
        // The enemy is still spent; the kill happened.
        assert!(st.map_enemies.as_ref().unwrap().enemies[0].drop_done);
    }

    #[test]
    fn boss_areas_fold_onto_their_episode_tables() {
        assert_eq!(fold_area(1, 11), Some(2)); // Dragon -> Cave 1
        assert_eq!(fold_area(1, 14), Some(9)); // Falz -> Ruins 3
        assert_eq!(fold_area(1, 17), Some(9));
        assert_eq!(fold_area(2, 14), Some(2)); // Barba Ray -> Spaceship Alpha
        assert_eq!(fold_area(2, 12), Some(8)); // Gryphon -> Seaside
        assert_eq!(fold_area(1, 0), None);
        assert_eq!(fold_area(2, 0), None);
    }

    #[test]
    fn legacy_drop_is_gated_and_masked() {
        let l = team_with_enemies(Version::Dcv2);
        let st = l.lock();

        // Walk a seed range; every produced amount must fit the normal
        // difficulty mask and be nonzero.
        let mut produced = 0;
        for seed in 0..64 {
            let mut rng = Mt19937::new(seed);
            if let Some(item) = legacy_drop(&st, &mut rng) {
                assert_eq!(item[0], 4);
                assert!(item[3] > 0 && item[3] <= 0x1F);
                produced += 1;
            }
        }

        assert!(produced > 0);
        assert!(produced < 64);
    }

    #[test]
    fn fixed_meseta_box_multiplies_by_ten() {
        let mut obj = crate::map::MapObject {
            skin: 0x92,
            obj_id: 0,
            dwords: [0; 6],
        };
        obj.dwords[0] = 1.0f32.to_bits();
        obj.dwords[1] = 1.0f32.to_bits();
        obj.dwords[2] = 0x0000_0004u32.swap_bytes();
        obj.dwords[3] = 25 << 16;

        match check_fixed_box(&obj) {
            FixedBox::Item(item) => {
                assert_eq!(item[0], 4);
                assert_eq!(item[3], 250);
            }
            _ => panic!("expected a fully fixed item"),
        }
    }
}
