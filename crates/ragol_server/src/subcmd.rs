//! The in-team sub-command router.
//!
//! Game events ride inside three envelope packets: 0x60 broadcasts to the
//! lobby, 0x62 and 0x6D are directed at one slot. The router validates the
//! declared size, tracks the handful of sub-commands the server cares
//! about (areas, drops, kills, synced registers), defers traffic around
//! bursts, and fans the rest out under the lobby mutex.

use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use ragol_common::packets::{self, SubcmdHeader};
use ragol_common::Version;

use crate::client::{self, Client};
use crate::items::drops::{self, DropRequest};
use crate::lobby::{self, DropMode, Lobby, LOBBY_FLAG_BURSTING};
use crate::quests;
use crate::send;
use crate::ship::{Block, Ship};

pub const SUBCMD_SET_AREA_1F: u8 = 0x1F;
pub const SUBCMD_SET_AREA_20: u8 = 0x20;
pub const SUBCMD_SET_AREA_21: u8 = 0x21;
pub const SUBCMD_SET_POS_3E: u8 = 0x3E;
pub const SUBCMD_SET_POS_3F: u8 = 0x3F;
pub const SUBCMD_MOVE_SLOW: u8 = 0x40;
pub const SUBCMD_MOVE_FAST: u8 = 0x42;
pub const SUBCMD_ITEMDROP: u8 = 0x5F;
pub const SUBCMD_ITEMREQ: u8 = 0x60;
pub const SUBCMD_SYNC_REG: u8 = 0x77;
pub const SUBCMD_BITEMREQ: u8 = 0xA2;
pub const SUBCMD_KILL_MONSTER: u8 = 0xC8;

#[derive(Debug, Error)]
pub enum SubcmdError {
    #[error("sub-command too short")]
    Truncated,
    #[error("sub-command size field disagrees with the packet length")]
    SizeMismatch,
}

/// Parse the common item-request layout shared by 0x60 and 0xA2.
struct ItemReq {
    area: u8,
    pt_index: u8,
    entity_id: u16,
}

fn parse_itemreq(body: &[u8]) -> Option<ItemReq> {
    if body.len() < 8 {
        return None;
    }

    Some(ItemReq {
        area: body[4],
        pt_index: body[5],
        entity_id: u16::from_le_bytes([body[6], body[7]]),
    })
}

/// The sender's slot rides in the sub-command parameter, but two header
/// shapes disagree on which byte. Normalise it to byte 2 before fan-out.
fn normalize_slot(body: &mut [u8], slot: u8) {
    if body.len() >= 4 && body[2] != slot && body[3] == slot {
        body.swap(2, 3);
    }
}

/// Read the leader's section id for the drop engine; falls back to the
/// lobby's stored section when the leader slot is somehow empty.
fn leader_section(st: &lobby::LobbyState) -> u8 {
    st.clients
        .get(st.leader_id as usize)
        .and_then(|c| c.as_ref())
        .map(|c| c.lock().player.section)
        .unwrap_or(st.section)
}

/// Handle a 0x60 broadcast envelope.
pub fn handle_bcast(
    ship: &Ship,
    block: &Arc<Block>,
    c: &Arc<Client>,
    l: &Arc<Lobby>,
    body: &[u8],
) -> Result<(), SubcmdError> {
    let hdr = SubcmdHeader::parse(body).ok_or(SubcmdError::Truncated)?;

    if !hdr.size_matches(body.len()) {
        return Err(SubcmdError::SizeMismatch);
    }

    let mut st = l.lock();

    // While someone is bursting, non-idempotent traffic from everyone else
    // waits in the packet queue and replays after the burst completes.
    if st.flags & LOBBY_FLAG_BURSTING != 0 {
        let sender_bursting = c.lock().flags & client::FLAG_BURSTING != 0;

        if !sender_bursting {
            let _ = lobby::enqueue_pkt(&mut st, c, packets::GAME_COMMAND0_TYPE, body, false);
            return Ok(());
        }
    }

    match hdr.sub_type {
        SUBCMD_SET_AREA_1F | SUBCMD_SET_AREA_20 | SUBCMD_SET_AREA_21 => {
            if body.len() >= 8 {
                let area = body[4] as u32;
                c.lock().cur_area = area;
            }
        }

        SUBCMD_SET_POS_3E | SUBCMD_SET_POS_3F | SUBCMD_MOVE_SLOW | SUBCMD_MOVE_FAST => {
            if body.len() >= 12 {
                let x = f32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let z = f32::from_le_bytes([body[8], body[9], body[10], body[11]]);
                let mut cs = c.lock();
                cs.pos.0 = x;
                cs.pos.2 = z;
            }
        }

        SUBCMD_ITEMREQ | SUBCMD_BITEMREQ => {
            if st.drop_mode != DropMode::ClientDrops {
                return handle_itemreq(ship, block, c, &mut st, body);
            }
        }

        SUBCMD_KILL_MONSTER => {
            track_kill(c, &st, hdr.param);
        }

        SUBCMD_SYNC_REG => {
            if body.len() >= 12 {
                let reg = body[4];
                let value = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
                quests::record_register(&mut st, reg, value);
                handle_quest_registers(ship, block, c, &mut st, reg, value);
            }
        }

        _ => {}
    }

    // Fan out to everyone else, skipping ignore lists.
    let mut out = body.to_vec();
    normalize_slot(&mut out, c.lock().client_id);
    send::send_to_lobby(&st, Some(c), packets::GAME_COMMAND0_TYPE, 0, &out, true);

    Ok(())
}

/// Handle a directed 0x62/0x6D envelope. `dest_slot` comes from the
/// packet header's flags byte.
pub fn handle_one(
    _ship: &Ship,
    _block: &Arc<Block>,
    c: &Arc<Client>,
    l: &Arc<Lobby>,
    pkt_type: u16,
    dest_slot: u8,
    body: &[u8],
) -> Result<(), SubcmdError> {
    let hdr = SubcmdHeader::parse(body).ok_or(SubcmdError::Truncated)?;

    if !hdr.size_matches(body.len()) {
        return Err(SubcmdError::SizeMismatch);
    }

    let mut st = l.lock();

    let dest = match st
        .clients
        .get(dest_slot as usize)
        .and_then(|x| x.as_ref())
    {
        Some(d) => d.clone(),
        None => {
            debug!("directed sub-command to empty slot {}", dest_slot);
            return Ok(());
        }
    };

    // Everything the bursting client sends during its burst is kept so the
    // next joiner can be replayed the same state.
    if st.flags & LOBBY_FLAG_BURSTING != 0 && c.lock().flags & client::FLAG_BURSTING != 0 {
        let _ = lobby::enqueue_pkt(&mut st, c, pkt_type, body, true);
    }

    drop(st);

    let version = dest.version();
    dest.send(send::build(version, pkt_type, dest_slot as u32, body));
    Ok(())
}

/// Writes to the quest's server registers turn into shipgate quest-flag
/// operations. The control register encodes the operation in its top
/// three bits (0 = get, 1 = set, 2 = delete) and the flag id in the low
/// sixteen; the value for a set comes from the last data-register write.
/// The short-flag register packs a 16-bit flag id and value into one
/// dword instead.
fn handle_quest_registers(
    ship: &Ship,
    block: &Arc<Block>,
    c: &Arc<Client>,
    st: &mut lobby::LobbyState,
    reg: u8,
    value: u32,
) {
    use ragol_common::shipgate::{QFLAG_DELETE_FLAG, QFLAG_LONG_FLAG};

    if st.qid == 0 {
        return;
    }

    let gc = c.guildcard();

    if st.q_flags & lobby::LOBBY_QFLAG_DATA != 0 {
        if reg == st.q_data_reg {
            st.q_data_val = value;
            return;
        }

        if reg == st.q_ctl_reg {
            let flag = value & 0xFFFF;

            match value >> 29 {
                0 => ship.sg.send_qflag(gc, block.b, false, flag, st.qid, 0, QFLAG_LONG_FLAG),
                1 => ship
                    .sg
                    .send_qflag(gc, block.b, true, flag, st.qid, st.q_data_val, QFLAG_LONG_FLAG),
                2 => ship.sg.send_qflag(
                    gc,
                    block.b,
                    true,
                    flag,
                    st.qid,
                    0,
                    QFLAG_LONG_FLAG | QFLAG_DELETE_FLAG,
                ),
                _ => {}
            }

            return;
        }
    }

    if st.q_flags & lobby::LOBBY_QFLAG_SHORT != 0 && reg == st.q_shortflag_reg {
        let flag = value >> 16;
        ship.sg
            .send_qflag(gc, block.b, true, flag, st.qid, value & 0xFFFF, 0);
    }
}

/// Server-side drop handling for an item request.
fn handle_itemreq(
    ship: &Ship,
    block: &Arc<Block>,
    c: &Arc<Client>,
    st: &mut lobby::LobbyState,
    body: &[u8],
) -> Result<(), SubcmdError> {
    let req = parse_itemreq(body).ok_or(SubcmdError::Truncated)?;

    // A GM-set /item override takes the next drop, whatever it is.
    let next = c.lock().next_item.take();
    if let Some(item) = next {
        emit_drop(st, c, req.area, req.entity_id, item);
        return Ok(());
    }

    let drop_req = DropRequest {
        pt_index: req.pt_index,
        entity_id: req.entity_id,
        requester_area: c.lock().cur_area,
        requester_version: c.version(),
        section: leader_section(st),
    };

    let env = ship.drop_env();
    let mut rng = block.rng.lock().unwrap_or_else(|e| e.into_inner());

    let generated = match st.drop_mode {
        DropMode::V2 => drops::enemy_drop_v2(&env, st, &drop_req, &mut rng),
        DropMode::Gc => drops::enemy_drop_gc(&env, st, &drop_req, &mut rng),
        DropMode::Bb => drops::enemy_drop_bb(&env, st, &drop_req, &mut rng),
        DropMode::Legacy => drops::legacy_drop(st, &mut rng),
        DropMode::ClientDrops => None,
    };

    drop(rng);

    if let Some(item) = generated {
        emit_drop(st, c, req.area, req.entity_id, item);
    }

    Ok(())
}

/// Broadcast a generated item. On Blue Burst the item first lands in the
/// lobby's authoritative floor queue and carries the queued id.
fn emit_drop(st: &mut lobby::LobbyState, _c: &Arc<Client>, area: u8, entity_id: u16, item: [u32; 4]) {
    let item_id = if st.version == Version::BlueBurst {
        match lobby::add_item_locked(st, item) {
            Some(it) => it.item_id,
            None => return,
        }
    } else {
        let id = st.item_id;
        st.item_id = st.item_id.wrapping_add(1);
        id
    };

    lobby::team_log(
        st,
        &format!(
            "drop: entity {} -> {:08x} {:08x} {:08x} {:08x} (id {:08x})",
            entity_id, item[0], item[1], item[2], item[3], item_id
        ),
    );

    let body = send::build_item_drop_subcmd(area, entity_id, item, item_id);
    send::send_to_lobby(st, None, packets::GAME_COMMAND0_TYPE, 0, &body, false);
}

/// Count a kill for everyone who asked for kill tracking.
fn track_kill(c: &Arc<Client>, st: &lobby::LobbyState, entity_id: u16) {
    let bp = st
        .map_enemies
        .as_ref()
        .and_then(|en| en.enemies.get(entity_id as usize))
        .map(|e| e.bp_entry);

    if let Some(bp) = bp {
        let mut cs = c.lock();
        if cs.flags & client::FLAG_TRACK_KILLS != 0 {
            if let Some(counter) = cs.enemy_kills.get_mut(bp as usize) {
                *counter = counter.saturating_add(1);
            } else {
                warn!("kill counter index {} out of range", bp);
            }
        }
    }
}

/// Replay the deferred packet queue after a burst completes; each entry is
/// re-handled as if it had just arrived. Also mirrors the synced quest
/// registers to the joiner.
pub fn finish_burst(
    ship: &Ship,
    block: &Arc<Block>,
    l: &Arc<Lobby>,
    joiner: Option<&Arc<Client>>,
) {
    let queued: Vec<lobby::QueuedPkt> = {
        let mut st = l.lock();
        st.pkt_queue.drain(..).collect()
    };

    for pkt in queued {
        let res = match pkt.pkt_type {
            packets::GAME_COMMAND0_TYPE => handle_bcast(ship, block, &pkt.src, l, &pkt.body),
            packets::GAME_COMMAND2_TYPE | packets::GAME_COMMANDD_TYPE => {
                // The destination slot was folded into the stored body's
                // parameter; replay as a broadcast-equivalent directed
                // packet to the original destination.
                let dest = pkt.body.get(2).copied().unwrap_or(0);
                handle_one(ship, block, &pkt.src, l, pkt.pkt_type, dest, &pkt.body)
            }
            _ => Ok(()),
        };

        if let Err(e) = res {
            warn!("error replaying queued packet after burst: {}", e);
        }
    }

    if let Some(joiner) = joiner {
        let regs = {
            let st = l.lock();
            quests::registers_for_joiner(&st)
        };

        for (reg, value) in regs {
            send::send_sync_register(joiner, reg, value);
        }
    }
}

/// Re-send the stored burst traffic to a fresh joiner, in arrival order.
pub fn resend_burst(l: &Arc<Lobby>, joiner: &Arc<Client>) {
    let stored: Vec<(u16, Vec<u8>)> = {
        let st = l.lock();
        st.burst_queue
            .iter()
            .map(|p| (p.pkt_type, p.body.clone()))
            .collect()
    };

    let version = joiner.version();
    for (pkt_type, body) in stored {
        joiner.send(send::build(version, pkt_type, 0, &body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itemreq_parses_the_game_layout() {
        let body = [
            SUBCMD_ITEMREQ,
            0x03,
            0x00,
            0x00, // header
            0x02, // area
            0x05, // pt index
            0x0A,
            0x00, // entity id
        ];

        let req = parse_itemreq(&body).unwrap();
        assert_eq!(req.area, 2);
        assert_eq!(req.pt_index, 5);
        assert_eq!(req.entity_id, 10);
    }

    #[test]
    fn slot_normalisation_swaps_the_misplaced_byte() {
        let mut body = [0x40u8, 0x02, 0x00, 0x03, 0, 0, 0, 0];
        normalize_slot(&mut body, 3);
        assert_eq!(body[2], 3);
        assert_eq!(body[3], 0);

        // Already normal: untouched.
        let mut body = [0x40u8, 0x02, 0x03, 0x00, 0, 0, 0, 0];
        normalize_slot(&mut body, 3);
        assert_eq!(body[2], 3);
    }

    #[test]
    fn size_mismatch_is_detected() {
        let body = [SUBCMD_SET_POS_3E, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let hdr = SubcmdHeader::parse(&body).unwrap();
        assert!(!hdr.size_matches(body.len()));
    }
}
