//! Lobbies and teams.
//!
//! A block owns its lobbies: the fixed default lobbies created at startup
//! and the dynamically created teams. All mutable lobby state sits behind
//! one mutex per lobby; broadcast fan-out and slot changes happen under it,
//! which is what gives observers a consistent ordering.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use ragol_common::item::ItemData;
use ragol_common::rng::Mt19937;
use ragol_common::Version;

use crate::client::{self, Client, SessionStage};
use crate::map::{GameEnemies, GameObjects};
use crate::quests::QuestEnemy;
use crate::ship::LimitsList;

pub const LOBBY_MAX_CLIENTS: usize = 12;
pub const LOBBY_MAX_IN_TEAM: usize = 4;

/// Lobby types.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LobbyType {
    Default,
    Game,
    Ep3Game,
}

/// Lobby flag bits.
pub const LOBBY_FLAG_BURSTING: u32 = 0x0000_0001;
pub const LOBBY_FLAG_QUESTING: u32 = 0x0000_0002;
pub const LOBBY_FLAG_QUESTSEL: u32 = 0x0000_0004;
pub const LOBBY_FLAG_TEMP_UNAVAIL: u32 = 0x0000_0008;
pub const LOBBY_FLAG_LEGIT_MODE: u32 = 0x0000_0010;
pub const LOBBY_FLAG_ONLY_ONE: u32 = 0x0000_0020;
pub const LOBBY_FLAG_DCONLY: u32 = 0x0000_0040;
pub const LOBBY_FLAG_PCONLY: u32 = 0x0000_0080;
pub const LOBBY_FLAG_V1ONLY: u32 = 0x0000_0100;
pub const LOBBY_FLAG_GC_ALLOWED: u32 = 0x0000_0200;
pub const LOBBY_FLAG_SINGLEPLAYER: u32 = 0x0000_0400;
pub const LOBBY_FLAG_EP3: u32 = 0x0000_0800;
pub const LOBBY_FLAG_SERVER_DROPS: u32 = 0x0000_1000;
pub const LOBBY_FLAG_NTE: u32 = 0x0000_4000;

/// Quest behavior bits for the running quest.
pub const LOBBY_QFLAG_SHORT: u8 = 1 << 0;
pub const LOBBY_QFLAG_DATA: u8 = 1 << 1;
pub const LOBBY_QFLAG_JOIN: u8 = 1 << 2;
pub const LOBBY_QFLAG_SYNC_REGS: u8 = 1 << 3;

/// Lobby decoration events.
pub const LOBBY_EVENT_NONE: u8 = 0;
pub const LOBBY_EVENT_CHRISTMAS: u8 = 1;
pub const LOBBY_EVENT_EASTER: u8 = 4;
pub const LOBBY_EVENT_HALLOWEEN: u8 = 5;

/// Required character level (displayed, one-based) per difficulty.
pub const GAME_REQUIRED_LEVEL: [u32; 4] = [1, 20, 40, 80];

/// The lobby-name checksum that selects the vestigial drop function. An
/// undocumented behavior of the original server, kept bit-for-bit.
const LEGACY_DROP_CRC: u32 = 0x9C35_0DD4;

/// Which drop engine the team runs, if any.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DropMode {
    #[default]
    ClientDrops,
    V2,
    Gc,
    Bb,
    Legacy,
}

/// Why a join was refused. The wire error the client sees is derived from
/// this; tests assert on the variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JoinError {
    Full,
    Internal,
    Bursting,
    LevelTooLow,
    LevelTooHigh,
    V2Only,
    Questing,
    QuestSel,
    Legit,
    TempUnavailable,
    DcOnly,
    V1Only,
    PcOnly,
    SinglePlayer,
    V1Class,
}

/// A packet deferred by a burst, with enough context to replay it.
pub struct QueuedPkt {
    pub src: Arc<Client>,
    pub pkt_type: u16,
    pub body: Vec<u8>,
}

pub struct LobbyState {
    pub flags: u32,
    pub version: Version,
    pub max_clients: usize,
    pub num_clients: usize,
    pub clients: [Option<Arc<Client>>; LOBBY_MAX_CLIENTS],
    pub leader_id: u8,

    pub name: String,
    pub passwd: String,
    pub difficulty: u8,
    pub battle: bool,
    pub challenge: bool,
    pub v2: bool,
    pub section: u8,
    pub event: u8,
    pub episode: u8,
    pub max_chal: u8,
    pub min_level: u32,
    pub max_level: u32,
    pub rand_seed: u32,

    pub maps: [u32; 0x20],
    pub map_enemies: Option<GameEnemies>,
    pub map_objects: Option<GameObjects>,

    pub drop_mode: DropMode,
    pub limits: Option<Arc<LimitsList>>,

    /// Next id for items the server synthesises in this team.
    pub item_id: u32,
    /// Floor items (Blue Burst keeps these authoritative on the server).
    pub item_queue: Vec<ItemData>,

    pub pkt_queue: VecDeque<QueuedPkt>,
    pub burst_queue: VecDeque<QueuedPkt>,

    pub qid: u32,
    pub qlang: u8,
    pub q_flags: u8,
    pub q_shortflag_reg: u8,
    pub q_data_reg: u8,
    pub q_ctl_reg: u8,
    /// Last value the quest wrote to the data register; consumed by the
    /// next control-register operation.
    pub q_data_val: u32,
    pub sync_regs: Vec<u8>,
    pub reg_vals: Vec<u32>,
    pub mtypes: Vec<QuestEnemy>,
    pub mids: Vec<QuestEnemy>,

    pub create_time: u64,
    /// Team log sink, opt-in via /log.
    pub log: Option<std::fs::File>,
}

pub struct Lobby {
    pub lobby_id: u32,
    pub lobby_type: LobbyType,
    pub block: u32,
    state: Mutex<LobbyState>,
}

impl Lobby {
    pub fn lock(&self) -> MutexGuard<'_, LobbyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_team(&self) -> bool {
        self.lobby_type != LobbyType::Default
    }
}

fn empty_slots() -> [Option<Arc<Client>>; LOBBY_MAX_CLIENTS] {
    std::array::from_fn(|_| None)
}

/// Create one of a block's fixed lobbies. Ids 1..=15 are the regular chat
/// lobbies; 16..=20 are the Episode 3 card lobbies.
pub fn create_default(block: u32, lobby_id: u32, event: u8) -> Arc<Lobby> {
    let (name, flags) = if lobby_id <= 15 {
        (format!("BLOCK{:02}-{:02}", block, lobby_id), 0)
    } else {
        (format!("BLOCK{:02}-C{}", block, lobby_id - 15), LOBBY_FLAG_EP3)
    };

    Arc::new(Lobby {
        lobby_id,
        lobby_type: LobbyType::Default,
        block,
        state: Mutex::new(LobbyState {
            flags,
            version: Version::Dcv1,
            max_clients: LOBBY_MAX_CLIENTS,
            num_clients: 0,
            clients: empty_slots(),
            leader_id: 0,
            name,
            passwd: String::new(),
            difficulty: 0,
            battle: false,
            challenge: false,
            v2: false,
            section: 0,
            event,
            episode: 0,
            max_chal: 0xFF,
            min_level: 0,
            max_level: 9001,
            rand_seed: 0,
            maps: [0; 0x20],
            map_enemies: None,
            map_objects: None,
            drop_mode: DropMode::ClientDrops,
            limits: None,
            item_id: 0,
            item_queue: Vec::new(),
            pkt_queue: VecDeque::new(),
            burst_queue: VecDeque::new(),
            qid: 0,
            qlang: 0,
            q_flags: 0,
            q_shortflag_reg: 0,
            q_data_reg: 0,
            q_ctl_reg: 0,
            q_data_val: 0,
            sync_regs: Vec::new(),
            reg_vals: Vec::new(),
            mtypes: Vec::new(),
            mids: Vec::new(),
            create_time: 0,
            log: None,
        }),
    })
}

pub struct CreateGameParams {
    pub name: String,
    pub passwd: String,
    pub difficulty: u8,
    pub battle: bool,
    pub challenge: bool,
    pub v2: bool,
    pub version: Version,
    pub section: u8,
    pub event: u8,
    pub episode: u8,
    pub single_player: bool,
}

/// Build a team lobby for `creator`. The caller (the block) supplies the
/// allocated lobby id and its RNG; enemy/object loading happens afterwards
/// so the registry code stays independent of the data files.
pub fn create_game(
    block: u32,
    lobby_id: u32,
    rng: &mut Mt19937,
    params: CreateGameParams,
    creator: &Arc<Client>,
) -> Arc<Lobby> {
    let mut cs = creator.lock();

    // A DCv2 creator who didn't ask for v2 mode makes a v1 team.
    let version = if params.version == Version::Dcv2 && !params.v2 {
        Version::Dcv1
    } else {
        params.version
    };

    let item_id = if version == Version::BlueBurst {
        0x0081_0000
    } else {
        0xF000_0000
    };

    let mut flags = LOBBY_FLAG_ONLY_ONE;

    if params.single_player {
        flags |= LOBBY_FLAG_SINGLEPLAYER;
    }

    if cs.flags & client::FLAG_IS_NTE != 0 {
        flags |= LOBBY_FLAG_NTE;
    }

    // Legit mode steals the creator's reference to the limits list.
    let mut limits = None;
    if cs.flags & client::FLAG_LEGIT != 0 {
        if let Some(l) = cs.legit_limits.take() {
            flags |= LOBBY_FLAG_LEGIT_MODE;
            limits = Some(l);
            cs.flags &= !client::FLAG_LEGIT;
        }
    }

    // Map selection needs episode 1-based even on versions that report 0.
    let table_ep = if version < Version::Gc || params.episode == 0 {
        1
    } else {
        params.episode
    };

    let nte = cs.flags & client::FLAG_IS_NTE != 0 && version == Version::Dcv1;
    let requested = cs.next_maps.take();
    let maps = crate::map::pick_variations(
        rng,
        table_ep,
        params.single_player,
        nte,
        requested.as_ref(),
    );

    drop(cs);

    let rand_seed = rng.genrand_int32();

    let mut name16 = [0u8; 16];
    for (dst, src) in name16.iter_mut().zip(params.name.as_bytes()) {
        *dst = *src;
    }
    let name_crc = crc::crc32::checksum_ieee(&name16);

    let lobby = Arc::new(Lobby {
        lobby_id,
        lobby_type: LobbyType::Game,
        block,
        state: Mutex::new(LobbyState {
            flags,
            version,
            max_clients: if params.single_player { 1 } else { LOBBY_MAX_IN_TEAM },
            num_clients: 0,
            clients: empty_slots(),
            leader_id: 1,
            name: params.name,
            passwd: params.passwd,
            difficulty: params.difficulty,
            battle: params.battle,
            challenge: params.challenge,
            v2: params.v2,
            section: params.section,
            event: params.event,
            episode: params.episode,
            max_chal: 0xFF,
            min_level: GAME_REQUIRED_LEVEL[params.difficulty as usize & 3],
            max_level: 200,
            rand_seed,
            maps,
            map_enemies: None,
            map_objects: None,
            drop_mode: DropMode::ClientDrops,
            limits,
            item_id,
            item_queue: Vec::new(),
            pkt_queue: VecDeque::new(),
            burst_queue: VecDeque::new(),
            qid: 0,
            qlang: 0,
            q_flags: 0,
            q_shortflag_reg: 0,
            q_data_reg: 0,
            q_ctl_reg: 0,
            q_data_val: 0,
            sync_regs: Vec::new(),
            reg_vals: Vec::new(),
            mtypes: Vec::new(),
            mids: Vec::new(),
            create_time: client::next_join_time(),
            log: None,
        }),
    });

    // Teams whose first 16 name bytes hash to the magic value get the
    // legacy drop function, before anything else is considered.
    if name_crc == LEGACY_DROP_CRC {
        let mut st = lobby.lock();
        st.drop_mode = DropMode::Legacy;
        st.flags |= LOBBY_FLAG_SERVER_DROPS;
    }

    lobby
}

/// An Episode 3 game lobby. Card battles are entirely client-driven; the
/// server only routes traffic, so no maps, enemies or drop engine.
pub fn create_ep3_game(
    block: u32,
    lobby_id: u32,
    rng: &mut Mt19937,
    name: String,
    passwd: String,
    section: u8,
    event: u8,
) -> Arc<Lobby> {
    let rand_seed = rng.genrand_int32();

    Arc::new(Lobby {
        lobby_id,
        lobby_type: LobbyType::Ep3Game,
        block,
        state: Mutex::new(LobbyState {
            flags: LOBBY_FLAG_ONLY_ONE | LOBBY_FLAG_EP3,
            version: Version::Ep3,
            max_clients: LOBBY_MAX_IN_TEAM,
            num_clients: 0,
            clients: empty_slots(),
            leader_id: 1,
            name,
            passwd,
            difficulty: 0,
            battle: false,
            challenge: false,
            v2: false,
            section,
            event,
            episode: 3,
            max_chal: 0xFF,
            min_level: 1,
            max_level: 200,
            rand_seed,
            maps: [0; 0x20],
            map_enemies: None,
            map_objects: None,
            drop_mode: DropMode::ClientDrops,
            limits: None,
            item_id: 0xF000_0000,
            item_queue: Vec::new(),
            pkt_queue: VecDeque::new(),
            burst_queue: VecDeque::new(),
            qid: 0,
            qlang: 0,
            q_flags: 0,
            q_shortflag_reg: 0,
            q_data_reg: 0,
            q_ctl_reg: 0,
            q_data_val: 0,
            sync_regs: Vec::new(),
            reg_vals: Vec::new(),
            mtypes: Vec::new(),
            mids: Vec::new(),
            create_time: client::next_join_time(),
            log: None,
        }),
    })
}

/// Decide the team's drop function, given what data the ship has loaded.
/// Call after `create_game`, with the creator still at hand. Battle and
/// challenge teams never get server drops.
pub struct DropDataAvailability {
    pub v2_complete: bool,
    pub gc_complete: bool,
}

pub fn setup_drops(l: &Lobby, creator: &Arc<Client>, avail: &DropDataAvailability) {
    let mut st = l.lock();

    if st.drop_mode == DropMode::Legacy {
        return;
    }

    if st.version == Version::BlueBurst {
        st.drop_mode = DropMode::Bb;
        st.flags |= LOBBY_FLAG_SERVER_DROPS;
        return;
    }

    if st.battle || st.challenge {
        return;
    }

    let cs = creator.lock();
    if cs.flags & client::FLAG_SERVER_DROPS == 0 {
        return;
    }

    match cs.version {
        Version::Dcv1 | Version::Dcv2 | Version::Pcv2 => {
            if avail.v2_complete {
                st.drop_mode = DropMode::V2;
                st.flags |= LOBBY_FLAG_SERVER_DROPS;
            }
        }
        Version::Gc => {
            if avail.gc_complete {
                st.drop_mode = DropMode::Gc;
                st.flags |= LOBBY_FLAG_SERVER_DROPS;
            }
        }
        _ => {}
    }
}

/// Join preconditions. `override_checks` is the GM override; it skips the
/// policy checks but never the burst/full/quest-select conditions.
pub fn check_join(st: &LobbyState, c: &Arc<Client>, override_checks: bool) -> Result<(), JoinError> {
    let cs = c.lock();

    if st.flags & LOBBY_FLAG_SINGLEPLAYER != 0 && st.num_clients > 0 {
        return Err(JoinError::SinglePlayer);
    }

    if st.flags & LOBBY_FLAG_PCONLY != 0 && cs.version != Version::Pcv2 && !override_checks {
        return Err(JoinError::PcOnly);
    }

    if st.flags & LOBBY_FLAG_V1ONLY != 0 && cs.version != Version::Dcv1 && !override_checks {
        return Err(JoinError::V1Only);
    }

    if st.flags & LOBBY_FLAG_DCONLY != 0
        && cs.version != Version::Dcv1
        && cs.version != Version::Dcv2
        && !override_checks
    {
        return Err(JoinError::DcOnly);
    }

    if st.flags & LOBBY_FLAG_TEMP_UNAVAIL != 0 {
        return Err(JoinError::TempUnavailable);
    }

    if st.flags & LOBBY_FLAG_BURSTING != 0 {
        return Err(JoinError::Bursting);
    }

    if st.flags & LOBBY_FLAG_QUESTING != 0 && st.q_flags & LOBBY_QFLAG_JOIN == 0 {
        return Err(JoinError::Questing);
    }

    if st.flags & LOBBY_FLAG_QUESTSEL != 0 {
        return Err(JoinError::QuestSel);
    }

    let level = cs.player.level + 1;
    if st.min_level > level && !override_checks {
        return Err(JoinError::LevelTooLow);
    }

    if st.max_level < level && !override_checks {
        return Err(JoinError::LevelTooHigh);
    }

    if cs.version == Version::Dcv1 && st.v2 {
        return Err(JoinError::V2Only);
    }

    if st.version == Version::Dcv1 && cs.player.ch_class > client::DCPC_CLASS_MAX {
        return Err(JoinError::V1Class);
    }

    if st.num_clients >= st.max_clients {
        return Err(JoinError::Full);
    }

    Ok(())
}

/// Whether every inventory item passes the lobby's limits list.
pub fn check_client_legit(st: &LobbyState, c: &Arc<Client>) -> bool {
    let limits = match (&st.limits, st.flags & LOBBY_FLAG_LEGIT_MODE != 0) {
        (Some(l), true) => l,
        _ => return true,
    };

    let cs = c.lock();
    let version = cs.version;

    for it in cs.player.inv.iter() {
        if !limits.check_item(it, version) {
            warn!(
                "potentially non-legit item in legit mode: {:08x} {:08x} {:08x} {:08x}",
                it.data[0], it.data[1], it.data[2], it.data2
            );
            return false;
        }
    }

    true
}

/// Put a client in a slot. The caller holds the lobby lock and has already
/// run `check_join`. Returns the slot used.
pub fn add_client_locked(
    st: &mut LobbyState,
    l: &Arc<Lobby>,
    lobby_type: LobbyType,
    c: &Arc<Client>,
) -> Result<u8, JoinError> {
    if st.num_clients >= st.max_clients {
        return Err(JoinError::Full);
    }

    if st.num_clients > 0 {
        st.flags &= !LOBBY_FLAG_ONLY_ONE;
    }

    // First client goes in slot 1, not 0, on DC/PC teams; slot 1 keeps
    // priority even when slot 0 is free. An original-game behavior.
    let slot = if lobby_type == LobbyType::Game
        && st.version < Version::Gc
        && st.clients[1].is_none()
    {
        1
    } else {
        match st.clients[..st.max_clients].iter().position(Option::is_none) {
            Some(s) => s,
            None => return Err(JoinError::Internal),
        }
    };

    st.clients[slot] = Some(c.clone());
    st.num_clients += 1;

    {
        let mut cs = c.lock();
        cs.cur_lobby = Arc::downgrade(l);
        cs.lobby_id = l.lobby_id;
        cs.client_id = slot as u8;
        cs.arrow = 0;
        cs.join_time = client::next_join_time();
        cs.stage = if lobby_type == LobbyType::Default {
            SessionStage::InLobby
        } else {
            SessionStage::InTeam
        };
    }

    if st.challenge {
        st.max_chal = find_max_challenge(st);
    }

    if st.num_clients == 1 {
        st.leader_id = slot as u8;
    }

    Ok(slot as u8)
}

/// Remove a client from its slot, electing a new leader as needed.
/// Returns true when the (team) lobby is now empty and should be removed.
pub fn remove_client_locked(st: &mut LobbyState, lobby_type: LobbyType, client_id: u8, c: &Arc<Client>) -> bool {
    let slot = client_id as usize;

    match &st.clients[slot] {
        Some(cur) if Arc::ptr_eq(cur, c) => {}
        _ => return false,
    }

    if client_id == st.leader_id {
        let new_leader = if st.version < Version::Gc && st.flags & LOBBY_FLAG_GC_ALLOWED != 0 {
            elect_leader_cross_locked(st)
        } else {
            elect_leader_locked(st)
        };

        st.leader_id = new_leader.unwrap_or(0);
    }

    st.clients[slot] = None;
    st.num_clients -= 1;

    if st.challenge {
        st.max_chal = find_max_challenge(st);
    }

    {
        let mut cs = c.lock();
        cs.cur_lobby = std::sync::Weak::new();
        cs.client_id = 0;
    }

    lobby_type != LobbyType::Default && st.num_clients == 0
}

/// Earliest-joined client other than the departing leader becomes leader.
fn elect_leader_locked(st: &LobbyState) -> Option<u8> {
    let mut best: Option<(u8, u64)> = None;

    for (i, c) in st.clients[..st.max_clients].iter().enumerate() {
        if i == st.leader_id as usize {
            continue;
        }

        if let Some(c) = c {
            let jt = c.lock().join_time;
            if best.map_or(true, |(_, t)| jt < t) {
                best = Some((i as u8, jt));
            }
        }
    }

    best.map(|(i, _)| i)
}

/// Cross-platform teams prefer a DC/PC leader. If only GC clients remain,
/// the team stops being cross-platform: clear the flag, pin to GC.
fn elect_leader_cross_locked(st: &mut LobbyState) -> Option<u8> {
    let mut best: Option<(u8, u64)> = None;

    for (i, c) in st.clients[..st.max_clients].iter().enumerate() {
        if i == st.leader_id as usize {
            continue;
        }

        if let Some(c) = c {
            let cs = c.lock();
            if cs.version < Version::Gc {
                if best.map_or(true, |(_, t)| cs.join_time < t) {
                    best = Some((i as u8, cs.join_time));
                }
            }
        }
    }

    if best.is_none() {
        st.flags &= !LOBBY_FLAG_GC_ALLOWED;
        st.version = Version::Gc;
        st.episode = 1;
        return elect_leader_locked(st);
    }

    best.map(|(i, _)| i)
}

/// The highest challenge stage everyone present has unlocked. Stored with
/// the Ep2 stage count in the high nibble on GC and BB.
fn find_max_challenge(st: &LobbyState) -> u8 {
    if !st.challenge {
        return 0;
    }

    let mut min_ep1 = 255u8;
    let mut min_ep2 = 255u8;

    for c in st.clients[..st.max_clients].iter().flatten() {
        let cs = c.lock();
        let (ep1, ep2) = (cs.player.challenge_ep1(), cs.player.challenge_ep2());

        min_ep1 = min_ep1.min(ep1);
        min_ep2 = min_ep2.min(ep2);
    }

    if st.version >= Version::Gc {
        min_ep1.wrapping_add(1) | (min_ep2.wrapping_add(1) << 4)
    } else {
        min_ep1.wrapping_add(1)
    }
}

/// Append a packet to one of the burst queues. Fails when no burst is in
/// progress or the packet isn't a game command.
pub fn enqueue_pkt(
    st: &mut LobbyState,
    c: &Arc<Client>,
    pkt_type: u16,
    body: &[u8],
    to_burst_queue: bool,
) -> Result<(), ()> {
    use ragol_common::packets::*;

    if st.flags & LOBBY_FLAG_BURSTING == 0 {
        return Err(());
    }

    if pkt_type != GAME_COMMAND0_TYPE
        && pkt_type != GAME_COMMAND2_TYPE
        && pkt_type != GAME_COMMANDD_TYPE
    {
        return Err(());
    }

    let q = QueuedPkt {
        src: c.clone(),
        pkt_type,
        body: body.to_vec(),
    };

    if to_burst_queue {
        st.burst_queue.push_back(q);
    } else {
        st.pkt_queue.push_back(q);
    }

    Ok(())
}

/// Append a line to the team's log, if one is running.
pub fn team_log(st: &mut LobbyState, line: &str) {
    use std::io::Write;

    if let Some(f) = st.log.as_mut() {
        let _ = writeln!(f, "{}", line);
    }
}

/// Add a server-generated item to the (Blue Burst) floor queue. Caller
/// holds the lobby lock.
pub fn add_item_locked(st: &mut LobbyState, dwords: [u32; 4]) -> Option<ItemData> {
    if st.version != Version::BlueBurst {
        return None;
    }

    let mut it = ItemData::from_dwords(dwords);
    it.item_id = st.item_id;
    st.item_id += 1;
    st.item_queue.push(it);
    Some(it)
}

/// Take an item off the floor queue by id. `Err(())` for non-BB teams.
pub fn remove_item_locked(st: &mut LobbyState, item_id: u32) -> Result<Option<ItemData>, ()> {
    if st.version != Version::BlueBurst {
        return Err(());
    }

    match st.item_queue.iter().position(|i| i.item_id == item_id) {
        Some(idx) => Ok(Some(st.item_queue.remove(idx))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client_with(version: Version, level: u32) -> Arc<Client> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let c = Arc::new(Client::new(
            client::next_join_time(),
            "127.0.0.1:1".parse().unwrap(),
            1,
            version,
            tx,
        ));
        c.lock().player.level = level;
        c
    }

    fn test_team(version: Version) -> Arc<Lobby> {
        let mut rng = Mt19937::new(1);
        create_game(
            1,
            0x20,
            &mut rng,
            CreateGameParams {
                name: "Test".into(),
                passwd: String::new(),
                difficulty: 0,
                battle: false,
                challenge: false,
                v2: version == Version::Dcv2,
                version,
                section: 0,
                event: 0,
                episode: 1,
                single_player: false,
            },
            &client_with(version, 10),
        )
    }

    #[test]
    fn dc_teams_fill_slot_one_first() {
        let l = test_team(Version::Dcv2);
        let a = client_with(Version::Dcv2, 10);
        let b = client_with(Version::Dcv2, 10);

        let mut st = l.lock();
        let slot_a = add_client_locked(&mut st, &l, LobbyType::Game, &a).unwrap();
        let slot_b = add_client_locked(&mut st, &l, LobbyType::Game, &b).unwrap();

        assert_eq!(slot_a, 1);
        assert_eq!(slot_b, 0);
        assert_eq!(st.leader_id, 1);
    }

    #[test]
    fn join_is_refused_outside_the_level_range() {
        let l = test_team(Version::Dcv2);
        {
            let mut st = l.lock();
            st.min_level = 20;
            st.max_level = 50;
        }

        let low = client_with(Version::Dcv2, 5);
        let high = client_with(Version::Dcv2, 120);
        let ok = client_with(Version::Dcv2, 30);

        let st = l.lock();
        assert_eq!(check_join(&st, &low, false), Err(JoinError::LevelTooLow));
        assert_eq!(check_join(&st, &high, false), Err(JoinError::LevelTooHigh));
        assert_eq!(check_join(&st, &ok, false), Ok(()));
        // GM override skips the level policy.
        assert_eq!(check_join(&st, &low, true), Ok(()));
    }

    #[test]
    fn v1_clients_cannot_enter_v2_games() {
        let l = test_team(Version::Dcv2);
        let v1 = client_with(Version::Dcv1, 50);

        let st = l.lock();
        assert_eq!(check_join(&st, &v1, false), Err(JoinError::V2Only));
    }

    #[test]
    fn pc_only_team_rejects_dc() {
        let l = test_team(Version::Pcv2);
        l.lock().flags |= LOBBY_FLAG_PCONLY;

        let dc = client_with(Version::Dcv2, 50);
        let st = l.lock();
        assert_eq!(check_join(&st, &dc, false), Err(JoinError::PcOnly));
    }

    #[test]
    fn bursting_lobby_is_closed() {
        let l = test_team(Version::Dcv2);
        l.lock().flags |= LOBBY_FLAG_BURSTING;

        let c = client_with(Version::Dcv2, 50);
        let st = l.lock();
        assert_eq!(check_join(&st, &c, false), Err(JoinError::Bursting));
    }

    #[test]
    fn leader_election_picks_the_earliest_joiner() {
        let l = test_team(Version::Gc);
        let a = client_with(Version::Gc, 10);
        let b = client_with(Version::Gc, 10);
        let c = client_with(Version::Gc, 10);

        let mut st = l.lock();
        for cl in [&a, &b, &c] {
            add_client_locked(&mut st, &l, LobbyType::Game, cl).unwrap();
        }

        let leader = st.leader_id;
        assert_eq!(leader, a.lock().client_id);

        let empty = remove_client_locked(&mut st, LobbyType::Game, leader, &a);
        assert!(!empty);
        assert_eq!(st.leader_id, b.lock().client_id);
    }

    #[test]
    fn cross_version_election_prefers_non_gc() {
        let l = test_team(Version::Dcv2);
        {
            let mut st = l.lock();
            st.flags |= LOBBY_FLAG_GC_ALLOWED;
        }

        let dc = client_with(Version::Dcv2, 10);
        let gc1 = client_with(Version::Gc, 10);
        let gc2 = client_with(Version::Gc, 10);

        let mut st = l.lock();
        let dc_slot = add_client_locked(&mut st, &l, LobbyType::Game, &dc).unwrap();
        add_client_locked(&mut st, &l, LobbyType::Game, &gc1).unwrap();
        add_client_locked(&mut st, &l, LobbyType::Game, &gc2).unwrap();

        // gc1 joined before gc2, but the DC client keeps the GC flag alive
        // when the leader (dc) leaves... first make dc leader.
        st.leader_id = dc_slot;

        remove_client_locked(&mut st, LobbyType::Game, dc_slot, &dc);
        // No non-GC candidate remains: flag cleared, version pinned.
        assert_eq!(st.flags & LOBBY_FLAG_GC_ALLOWED, 0);
        assert_eq!(st.version, Version::Gc);
        assert_eq!(st.leader_id, gc1.lock().client_id);
    }

    #[test]
    fn empty_team_reports_removal() {
        let l = test_team(Version::Dcv2);
        let a = client_with(Version::Dcv2, 10);

        let mut st = l.lock();
        let slot = add_client_locked(&mut st, &l, LobbyType::Game, &a).unwrap();
        assert!(remove_client_locked(&mut st, LobbyType::Game, slot, &a));
    }

    #[test]
    fn bb_floor_items_get_sequential_ids() {
        let l = test_team(Version::BlueBurst);
        let mut st = l.lock();

        let a = add_item_locked(&mut st, [4, 0, 0, 100]).unwrap();
        let b = add_item_locked(&mut st, [3, 0, 0, 0]).unwrap();
        assert_eq!(a.item_id, 0x0081_0000);
        assert_eq!(b.item_id, 0x0081_0001);

        let got = remove_item_locked(&mut st, a.item_id).unwrap().unwrap();
        assert_eq!(got.data2, 100);
        assert!(remove_item_locked(&mut st, a.item_id).unwrap().is_none());
    }

    #[test]
    fn non_bb_floor_queue_is_refused() {
        let l = test_team(Version::Gc);
        let mut st = l.lock();
        assert!(add_item_locked(&mut st, [4, 0, 0, 1]).is_none());
        assert!(remove_item_locked(&mut st, 1).is_err());
    }

    #[test]
    fn burst_queue_only_accepts_game_commands_mid_burst() {
        let l = test_team(Version::Dcv2);
        let c = client_with(Version::Dcv2, 10);
        let mut st = l.lock();

        assert!(enqueue_pkt(&mut st, &c, 0x60, &[0, 0, 0, 0], false).is_err());

        st.flags |= LOBBY_FLAG_BURSTING;
        assert!(enqueue_pkt(&mut st, &c, 0x60, &[0, 0, 0, 0], false).is_ok());
        assert!(enqueue_pkt(&mut st, &c, 0x06, &[0, 0, 0, 0], false).is_err());
        assert_eq!(st.pkt_queue.len(), 1);
    }
}
