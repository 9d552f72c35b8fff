//! The ship: the explicit context every handler receives.
//!
//! Owns the configuration snapshot, the blocks, the loaded data tables,
//! the ban lists, the quest table, the limits lists, the script hooks and
//! the shipgate handle. Data tables load once at boot; the limits and
//! quest tables can be swapped at runtime, with running teams keeping
//! their strong references to the old data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use ragol_common::rng::Mt19937;
use ragol_common::{ItemData, Version};

use crate::bans::BanList;
use crate::client::Client;
use crate::config_provider::ShipConfig;
use crate::items::drops::DropEnv;
use crate::items::pmt::{PmtData, PmtVersion};
use crate::items::pt::{PtV2Data, PtV3Data};
use crate::items::rt::{RtGcData, RtV2Data};
use crate::lobby::{DropDataAvailability, Lobby};
use crate::map::{BattleParamSet, BbLevelTable, BbMapData, GcMapData, V2MapData};
use crate::quests::QuestMap;
use crate::scheduler::Scheduler;
use crate::scripts::HookTable;
use crate::shipgate::ShipgateHandle;

/// Versions a limits-list rule can apply to.
pub const ITEM_VERSION_V1: u32 = 0x01;
pub const ITEM_VERSION_V2: u32 = 0x02;
pub const ITEM_VERSION_GC: u32 = 0x04;

/// One legit-mode rule set. Entries key on the item's three code bytes
/// and carry the versions the item is legitimate on; unknown items fall
/// back to the list default.
pub struct LimitsList {
    pub name: String,
    pub default_allow: bool,
    entries: HashMap<u32, u32>,
}

impl LimitsList {
    pub fn new(name: String, default_allow: bool) -> LimitsList {
        LimitsList {
            name,
            default_allow,
            entries: HashMap::new(),
        }
    }

    pub fn add_rule(&mut self, code: u32, version_mask: u32) {
        self.entries.insert(code & 0x00FF_FFFF, version_mask);
    }

    pub fn check_item(&self, it: &ItemData, version: Version) -> bool {
        let mask = match version {
            Version::DcNte | Version::Dcv1 => ITEM_VERSION_V1,
            Version::Dcv2 | Version::PcNte | Version::Pcv2 => ITEM_VERSION_V2,
            Version::Gc | Version::Ep3 | Version::Xbox => ITEM_VERSION_GC,
            // Blue Burst inventories aren't checked against limits lists.
            Version::BlueBurst => return true,
        };

        match self.entries.get(&(it.data[0] & 0x00FF_FFFF)) {
            Some(allowed) => allowed & mask != 0,
            None => self.default_allow,
        }
    }
}

/// The named limits lists configured on the ship. Reloadable as a whole;
/// teams keep their `Arc` until they end.
#[derive(Default)]
pub struct LimitsTable {
    pub lists: Vec<Arc<LimitsList>>,
    pub default_index: usize,
}

impl LimitsTable {
    pub fn by_name(&self, name: &str) -> Option<Arc<LimitsList>> {
        self.lists.iter().find(|l| l.name == name).cloned()
    }

    pub fn default_list(&self) -> Option<Arc<LimitsList>> {
        self.lists.get(self.default_index).cloned()
    }
}

/// A block: a shard of clients with its own lobbies and its own RNG.
pub struct Block {
    /// 1-based block number.
    pub b: u32,
    pub port: u16,
    pub lobbies: RwLock<Vec<Arc<Lobby>>>,
    pub clients: RwLock<Vec<Arc<Client>>>,
    pub rng: Mutex<Mt19937>,
    pub num_clients: AtomicU32,
    pub num_games: AtomicU32,
    next_lobby_id: Mutex<u32>,
}

impl Block {
    pub fn new(b: u32, port: u16, seed: u32, lobby_event: u8) -> Arc<Block> {
        let mut lobbies = Vec::with_capacity(20);

        // The fixed default lobbies; 16..=20 are the Episode 3 lobbies.
        for id in 1..=20u32 {
            lobbies.push(crate::lobby::create_default(b, id, lobby_event));
        }

        Arc::new(Block {
            b,
            port,
            lobbies: RwLock::new(lobbies),
            clients: RwLock::new(Vec::new()),
            rng: Mutex::new(Mt19937::new(seed)),
            num_clients: AtomicU32::new(0),
            num_games: AtomicU32::new(0),
            next_lobby_id: Mutex::new(0x20),
        })
    }

    pub fn get_lobby(&self, lobby_id: u32) -> Option<Arc<Lobby>> {
        self.lobbies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|l| l.lobby_id == lobby_id)
            .cloned()
    }

    /// Allocate the next unused team id, starting at 0x20 and wrapping at
    /// 0xFFFF.
    pub fn alloc_lobby_id(&self) -> u32 {
        let mut next = self.next_lobby_id.lock().unwrap_or_else(|e| e.into_inner());
        let mut id = *next;

        while self.get_lobby(id).is_some() {
            id += 1;
            if id > 0xFFFF {
                id = 0x20;
            }
        }

        *next = if id == 0xFFFF { 0x20 } else { id + 1 };
        id
    }

    pub fn add_lobby(&self, l: Arc<Lobby>) {
        self.lobbies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(l);
        self.num_games.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_lobby(&self, lobby_id: u32) {
        let mut lobbies = self.lobbies.write().unwrap_or_else(|e| e.into_inner());
        let before = lobbies.len();
        lobbies.retain(|l| l.lobby_id != lobby_id || !l.is_team());

        if lobbies.len() != before {
            self.num_games.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn find_client(&self, gc: u32) -> Option<Arc<Client>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.guildcard() == gc)
            .cloned()
    }

    pub fn add_client(&self, c: Arc<Client>) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(c);
        self.num_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_client(&self, c: &Arc<Client>) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let before = clients.len();
        clients.retain(|x| !Arc::ptr_eq(x, c));

        if clients.len() != before {
            self.num_clients.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

pub struct Ship {
    pub cfg: Arc<ShipConfig>,
    pub blocks: Vec<Arc<Block>>,

    pub limits: RwLock<Arc<LimitsTable>>,
    pub quests: RwLock<Arc<QuestMap>>,

    pub pt_v2: Option<Box<PtV2Data>>,
    pub pt_gc: Option<Box<PtV3Data>>,
    pub pt_bb: Option<Box<PtV3Data>>,
    pub pmt_v2: Option<Box<PmtData>>,
    pub pmt_gc: Option<Box<PmtData>>,
    pub pmt_bb: Option<Box<PmtData>>,
    pub rt_v2: Option<Box<RtV2Data>>,
    pub rt_gc: Option<Box<RtGcData>>,

    pub maps_v2: Option<Box<V2MapData>>,
    pub maps_gc: Option<Box<GcMapData>>,
    pub maps_bb: Option<Box<BbMapData>>,
    pub bb_params: Option<Vec<Box<BattleParamSet>>>,
    pub bb_levels: Option<Box<BbLevelTable>>,

    pub bans: BanList,
    pub hooks: HookTable,
    pub scheduler: Scheduler,
    pub sg: Arc<ShipgateHandle>,

    pub lobby_event: AtomicU32,
    pub game_event: AtomicU32,

    num_clients: AtomicU32,
    num_games: AtomicU32,
}

/// Per-block listener ports: one slot per client version family.
pub const PORTS_PER_BLOCK: u16 = 8;

impl Ship {
    pub fn new(cfg: Arc<ShipConfig>, sg: Arc<ShipgateHandle>, loaded: LoadedData) -> Arc<Ship> {
        let mut blocks = Vec::with_capacity(cfg.blocks as usize);

        for b in 1..=cfg.blocks {
            let seed = rand::random::<u32>() ^ b;
            let port = cfg.base_port + (b as u16) * PORTS_PER_BLOCK;
            blocks.push(Block::new(b, port, seed, cfg.events.lobby_event));
        }

        info!("ship {} starting with {} blocks", cfg.name, blocks.len());

        Arc::new(Ship {
            lobby_event: AtomicU32::new(cfg.events.lobby_event as u32),
            game_event: AtomicU32::new(cfg.events.game_event as u32),
            cfg,
            blocks,
            limits: RwLock::new(Arc::new(loaded.limits)),
            quests: RwLock::new(Arc::new(loaded.quests)),
            pt_v2: loaded.pt_v2,
            pt_gc: loaded.pt_gc,
            pt_bb: loaded.pt_bb,
            pmt_v2: loaded.pmt_v2,
            pmt_gc: loaded.pmt_gc,
            pmt_bb: loaded.pmt_bb,
            rt_v2: loaded.rt_v2,
            rt_gc: loaded.rt_gc,
            maps_v2: loaded.maps_v2,
            maps_gc: loaded.maps_gc,
            maps_bb: loaded.maps_bb,
            bb_params: loaded.bb_params,
            bb_levels: loaded.bb_levels,
            bans: BanList::default(),
            hooks: HookTable::default(),
            scheduler: Scheduler::default(),
            sg,
            num_clients: AtomicU32::new(0),
            num_games: AtomicU32::new(0),
        })
    }

    pub fn block(&self, b: u32) -> Option<&Arc<Block>> {
        self.blocks.get(b.wrapping_sub(1) as usize)
    }

    pub fn find_client(&self, gc: u32) -> Option<(Arc<Block>, Arc<Client>)> {
        for block in &self.blocks {
            if let Some(c) = block.find_client(gc) {
                return Some((block.clone(), c));
            }
        }

        None
    }

    pub fn inc_clients(&self) {
        self.num_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_clients(&self) {
        self.num_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_games(&self) {
        self.num_games.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_games(&self) {
        self.num_games.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> (u16, u16) {
        (
            self.num_clients.load(Ordering::Relaxed) as u16,
            self.num_games.load(Ordering::Relaxed) as u16,
        )
    }

    /// The drop engine's borrow of our tables.
    pub fn drop_env(&self) -> DropEnv<'_> {
        DropEnv {
            pt_v2: self.pt_v2.as_deref(),
            pt_gc: self.pt_gc.as_deref(),
            pt_bb: self.pt_bb.as_deref(),
            pmt_v2: self.pmt_v2.as_deref(),
            pmt_gc: self.pmt_gc.as_deref(),
            pmt_bb: self.pmt_bb.as_deref(),
            rt_v2: self.rt_v2.as_deref(),
            rt_gc: self.rt_gc.as_deref(),
            quest_rares: self.cfg.quest_rares,
            quest_semirares: self.cfg.quest_semirares,
        }
    }

    /// What `lobby::setup_drops` needs to know about the loaded data.
    pub fn drop_data_availability(&self) -> DropDataAvailability {
        DropDataAvailability {
            v2_complete: self.pt_v2.is_some()
                && self.maps_v2.is_some()
                && self.pmt_v2.is_some()
                && self.rt_v2.is_some(),
            gc_complete: self.pt_gc.is_some()
                && self.maps_gc.is_some()
                && self.pmt_gc.is_some()
                && self.rt_gc.is_some(),
        }
    }
}

/// Everything read from disk at boot, bundled so `Ship::new` stays tidy.
#[derive(Default)]
pub struct LoadedData {
    pub limits: LimitsTable,
    pub quests: QuestMap,
    pub pt_v2: Option<Box<PtV2Data>>,
    pub pt_gc: Option<Box<PtV3Data>>,
    pub pt_bb: Option<Box<PtV3Data>>,
    pub pmt_v2: Option<Box<PmtData>>,
    pub pmt_gc: Option<Box<PmtData>>,
    pub pmt_bb: Option<Box<PmtData>>,
    pub rt_v2: Option<Box<RtV2Data>>,
    pub rt_gc: Option<Box<RtGcData>>,
    pub maps_v2: Option<Box<V2MapData>>,
    pub maps_gc: Option<Box<GcMapData>>,
    pub maps_bb: Option<Box<BbMapData>>,
    pub bb_params: Option<Vec<Box<BattleParamSet>>>,
    pub bb_levels: Option<Box<BbLevelTable>>,
}

impl LoadedData {
    /// Load whatever the configuration points at. Missing optional data
    /// only disables the features needing it; a corrupt mandatory Blue
    /// Burst set clears the BB support flag rather than failing the boot.
    pub fn load(cfg: &ShipConfig) -> LoadedData {
        let mut data = LoadedData::default();

        if let Some(f) = &cfg.v2_ptdata_file {
            info!("reading v2 ItemPT file: {}", f.display());
            match crate::items::pt::read_v2(f) {
                Ok(pt) => data.pt_v2 = Some(Box::new(pt)),
                Err(e) => warn!("couldn't read v2 ItemPT data: {}", e),
            }
        }

        if let Some(f) = &cfg.gc_ptdata_file {
            info!("reading GC ItemPT file: {}", f.display());
            match crate::items::pt::read_v3(f) {
                Ok(pt) => data.pt_gc = Some(Box::new(pt)),
                Err(e) => warn!("couldn't read GC ItemPT data: {}", e),
            }
        }

        if let Some(f) = &cfg.bb_ptdata_file {
            info!("reading BB ItemPT file: {}", f.display());
            match crate::items::pt::read_v3(f) {
                Ok(pt) => data.pt_bb = Some(Box::new(pt)),
                Err(e) => warn!("couldn't read BB ItemPT data, disabling Blue Burst: {}", e),
            }
        }

        if let Some(f) = &cfg.v2_pmtdata_file {
            info!("reading v2 ItemPMT file: {}", f.display());
            match PmtData::read(f, PmtVersion::V2, !cfg.pmt_norestrict_v2) {
                Ok(pmt) => data.pmt_v2 = Some(Box::new(pmt)),
                Err(e) => warn!("couldn't read v2 ItemPMT file: {}", e),
            }
        }

        if let Some(f) = &cfg.gc_pmtdata_file {
            info!("reading GC ItemPMT file: {}", f.display());
            match PmtData::read(f, PmtVersion::Gc, !cfg.pmt_norestrict_gc) {
                Ok(pmt) => data.pmt_gc = Some(Box::new(pmt)),
                Err(e) => warn!("couldn't read GC ItemPMT file: {}", e),
            }
        }

        if let Some(f) = &cfg.bb_pmtdata_file {
            info!("reading BB ItemPMT file: {}", f.display());
            match PmtData::read(f, PmtVersion::Bb, !cfg.pmt_norestrict_bb) {
                Ok(pmt) => data.pmt_bb = Some(Box::new(pmt)),
                Err(e) => warn!("couldn't read BB ItemPMT file: {}", e),
            }
        }

        if let Some(f) = &cfg.v2_rtdata_file {
            info!("reading v2 ItemRT file: {}", f.display());
            match crate::items::rt::read_v2(f) {
                Ok(rt) => data.rt_v2 = Some(Box::new(rt)),
                Err(e) => warn!("couldn't read v2 ItemRT file: {}", e),
            }
        }

        if let Some(f) = &cfg.gc_rtdata_file {
            info!("reading GC ItemRT file: {}", f.display());
            match crate::items::rt::read_gc(f) {
                Ok(rt) => data.rt_gc = Some(Box::new(rt)),
                Err(e) => warn!("couldn't read GC ItemRT file: {}", e),
            }
        }

        if let Some(d) = &cfg.v2_map_dir {
            info!("loading v2 map enemy data");
            match crate::map::read_v2_map_files(d) {
                Ok(m) => data.maps_v2 = Some(Box::new(m)),
                Err(e) => warn!("error reading v2 map data, v2 server drops disabled: {}", e),
            }
        }

        if let Some(d) = &cfg.gc_map_dir {
            info!("loading GC map enemy data");
            match crate::map::read_gc_map_files(d) {
                Ok(m) => data.maps_gc = Some(Box::new(m)),
                Err(e) => warn!("error reading GC map data, GC server drops disabled: {}", e),
            }
        }

        if let Some(d) = &cfg.bb_map_dir {
            info!("loading Blue Burst map enemy data");
            match crate::map::read_bb_map_files(d) {
                Ok(m) => data.maps_bb = Some(Box::new(m)),
                Err(e) => warn!("error reading BB map data, disabling Blue Burst: {}", e),
            }
        }

        if let Some(d) = &cfg.bb_param_dir {
            info!("loading Blue Burst battle parameter data");

            let files = [
                "BattleParamEntry_on.dat",
                "BattleParamEntry_lab_on.dat",
                "BattleParamEntry_ep4_on.dat",
                "BattleParamEntry.dat",
                "BattleParamEntry_lab.dat",
                "BattleParamEntry_ep4.dat",
            ];

            let mut sets = Vec::with_capacity(files.len());
            let mut ok = true;

            for f in files {
                match crate::map::read_battle_param_file(&d.join(f)) {
                    Ok(s) => sets.push(s),
                    Err(e) => {
                        warn!("cannot read {}: {}", f, e);
                        ok = false;
                        break;
                    }
                }
            }

            if ok {
                data.bb_params = Some(sets);
            }

            info!("loading Blue Burst levelup table");
            match crate::map::read_level_table(&d.join("PlyLevelTbl.prs")) {
                Ok(t) => data.bb_levels = Some(t),
                Err(e) => warn!("cannot read level table: {}", e),
            }
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_ids_wrap_and_skip_used_ones() {
        let block = Block::new(1, 12008, 1, 0);

        let a = block.alloc_lobby_id();
        assert_eq!(a, 0x20);

        // Simulate the id being taken; the next allocation skips it.
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let creator = Arc::new(Client::new(
            1,
            "127.0.0.1:1".parse().unwrap(),
            1,
            Version::Gc,
            tx,
        ));

        let mut rng = Mt19937::new(1);
        let team = crate::lobby::create_game(
            1,
            a,
            &mut rng,
            crate::lobby::CreateGameParams {
                name: "T".into(),
                passwd: String::new(),
                difficulty: 0,
                battle: false,
                challenge: false,
                v2: false,
                version: Version::Gc,
                section: 0,
                event: 0,
                episode: 1,
                single_player: false,
            },
            &creator,
        );
        block.add_lobby(team);

        assert_eq!(block.alloc_lobby_id(), 0x21);
        assert_eq!(block.num_games.load(Ordering::Relaxed), 1);

        block.remove_lobby(a);
        assert_eq!(block.num_games.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn default_lobbies_exist_at_block_start() {
        let block = Block::new(2, 12016, 7, 1);
        assert!(block.get_lobby(1).is_some());
        assert!(block.get_lobby(15).is_some());
        assert!(block.get_lobby(20).is_some());
        assert!(block.get_lobby(0x20).is_none());

        // Ep3 lobbies carry the flag.
        let ep3 = block.get_lobby(16).unwrap();
        assert_ne!(ep3.lock().flags & crate::lobby::LOBBY_FLAG_EP3, 0);
    }

    #[test]
    fn limits_lists_check_by_version_mask() {
        let mut list = LimitsList::new("default".into(), true);
        list.add_rule(0x0000_3302, ITEM_VERSION_GC); // GC-only item

        let gc_item = ItemData::from_dwords([0x0000_3302, 0, 0, 0]);
        assert!(list.check_item(&gc_item, Version::Gc));
        assert!(!list.check_item(&gc_item, Version::Dcv2));
        // Unknown items follow the default.
        let other = ItemData::from_dwords([0x0000_0100, 0, 0, 0]);
        assert!(list.check_item(&other, Version::Dcv1));
    }
}
