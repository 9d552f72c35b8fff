//! Per-connection client state.
//!
//! A `Client` is shared between its reader task, its block and (through a
//! lobby slot) its teammates, so the mutable portion lives behind a mutex.
//! The lock hierarchy puts the client mutex innermost: it is safe to lock a
//! client while holding its lobby's mutex, never the other way around.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use ragol_common::item::{self, ItemData};
use ragol_common::version::{Language, Version};

use crate::lobby::Lobby;

/// Privilege bits, as delivered by the shipgate on a successful /login.
pub const PRIV_LOCAL_GM: u32 = 0x0000_0001;
pub const PRIV_LOCAL_ROOT: u32 = 0x0000_0002;
pub const PRIV_GLOBAL_GM: u32 = 0x0000_0004;
pub const PRIV_GLOBAL_ROOT: u32 = 0x0000_0008;

/// Client flag bits (a direct carry of the meanings the packet handlers
/// depend on; several are toggled from /commands).
pub const FLAG_BURSTING: u32 = 0x0000_0001;
pub const FLAG_LOGGED_IN: u32 = 0x0000_0002;
pub const FLAG_LEGIT: u32 = 0x0000_0004;
pub const FLAG_SERVER_DROPS: u32 = 0x0000_0008;
pub const FLAG_TRACK_KILLS: u32 = 0x0000_0010;
pub const FLAG_TRACK_INV: u32 = 0x0000_0020;
pub const FLAG_AUTO_BACKUP: u32 = 0x0000_0040;
pub const FLAG_WORD_CENSOR: u32 = 0x0000_0080;
pub const FLAG_GC_PROTECT: u32 = 0x0000_0100;
pub const FLAG_OVERRIDE_GAME: u32 = 0x0000_0200;
pub const FLAG_IS_NTE: u32 = 0x0000_0400;
pub const FLAG_STFU: u32 = 0x0000_0800;
pub const FLAG_SHOW_DCPC_ON_GC: u32 = 0x0000_1000;

pub const IGNORE_LIST_SIZE: usize = 6;
pub const KILL_COUNTERS: usize = 0x60;

/// The connection lifecycle. Packets legal in one stage are protocol errors
/// in another.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionStage {
    Handshake,
    /// Bounced to another block's port; the socket is about to close.
    Redirect,
    Login,
    CharacterLoad,
    InBlock,
    InLobby,
    InTeam,
    Disconnecting,
}

/// The fields the server actually reads out of the uploaded character blob;
/// the raw bytes are kept for forwarding and character saves.
#[derive(Debug, Clone, Default)]
pub struct PlayerData {
    pub raw: Vec<u8>,
    pub name: String,
    /// Zero-based, as on the wire; displayed level is this plus one.
    pub level: u32,
    pub ch_class: u8,
    pub section: u8,
    pub inv: Vec<ItemData>,
    /// Completed challenge stages, (Episode 1, Episode 2), from c-rank data.
    pub challenge_stages: (u8, u8),
}

impl PlayerData {
    pub fn challenge_ep1(&self) -> u8 {
        self.challenge_stages.0
    }

    pub fn challenge_ep2(&self) -> u8 {
        self.challenge_stages.1
    }
}

/// Character classes above this are v2-only; v1 games refuse them.
pub const DCPC_CLASS_MAX: u8 = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct BlocklistEntry {
    pub gc: u32,
    pub flags: u32,
}

pub struct ClientState {
    pub stage: SessionStage,
    pub version: Version,
    pub guildcard: u32,
    pub language: Language,
    pub quest_lang: Language,
    pub privilege: u32,
    pub flags: u32,
    pub cur_lobby: Weak<Lobby>,
    pub lobby_id: u32,
    pub client_id: u8,
    pub arrow: u8,
    pub cur_area: u32,
    pub pos: (f32, f32, f32, f32),
    pub player: PlayerData,
    pub items: Vec<ItemData>,
    pub next_item_id: u32,
    pub ignore_list: [u32; IGNORE_LIST_SIZE],
    pub blocklist: Vec<BlocklistEntry>,
    /// GM-set override consumed by the next server-side drop.
    pub next_item: Option<[u32; 4]>,
    /// Map variations requested via /maps for the next team created.
    pub next_maps: Option<[u32; 0x20]>,
    pub enemy_kills: [u32; KILL_COUNTERS],
    /// Monotonic join sequence used for leader election.
    pub join_time: u64,
    /// Limits list selected by /legit, stolen by the team on create.
    pub legit_limits: Option<std::sync::Arc<crate::ship::LimitsList>>,
    /// The Blue Burst bank shadow, capped at 200 entries.
    pub bank: Vec<ItemData>,
}

pub const BANK_MAX_ITEMS: usize = 200;

pub struct Client {
    /// Connection serial, unique for the process lifetime.
    pub id: u64,
    pub addr: SocketAddr,
    pub block: u32,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    disconnected: AtomicBool,
    state: Mutex<ClientState>,
}

static JOIN_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn next_join_time() -> u64 {
    JOIN_SEQ.fetch_add(1, Ordering::Relaxed)
}

impl Client {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        block: u32,
        version: Version,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Client {
        Client {
            id,
            addr,
            block,
            tx,
            disconnected: AtomicBool::new(false),
            state: Mutex::new(ClientState {
                stage: SessionStage::Handshake,
                version,
                guildcard: 0,
                language: Language::default(),
                quest_lang: Language::default(),
                privilege: 0,
                flags: if version.is_nte() { FLAG_IS_NTE } else { 0 },
                cur_lobby: Weak::new(),
                lobby_id: 0,
                client_id: 0,
                arrow: 0,
                cur_area: 0,
                pos: (0.0, 0.0, 0.0, 0.0),
                player: PlayerData::default(),
                items: Vec::new(),
                next_item_id: 0,
                ignore_list: [0; IGNORE_LIST_SIZE],
                blocklist: Vec::new(),
                next_item: None,
                next_maps: None,
                enemy_kills: [0; KILL_COUNTERS],
                join_time: 0,
                legit_limits: None,
                bank: Vec::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn version(&self) -> Version {
        self.lock().version
    }

    pub fn guildcard(&self) -> u32 {
        self.lock().guildcard
    }

    /// Queue a pre-built, padded packet for transmission. Errors (client
    /// writer already gone) just mark the client for disconnect.
    pub fn send(&self, pkt: Vec<u8>) {
        if self.tx.send(pkt).is_err() {
            self.disconnected.store(true, Ordering::Release);
        }
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl ClientState {
    pub fn is_local_gm(&self) -> bool {
        self.privilege & (PRIV_LOCAL_GM | PRIV_LOCAL_ROOT | PRIV_GLOBAL_GM | PRIV_GLOBAL_ROOT) != 0
    }

    pub fn is_local_root(&self) -> bool {
        self.privilege & (PRIV_LOCAL_ROOT | PRIV_GLOBAL_ROOT) != 0
    }

    pub fn is_global_gm(&self) -> bool {
        self.privilege & (PRIV_GLOBAL_GM | PRIV_GLOBAL_ROOT) != 0
    }

    pub fn ignores(&self, gc: u32) -> bool {
        gc != 0 && self.ignore_list.contains(&gc)
    }

    /// Add to the fixed ignore array. Returns false when full.
    pub fn add_ignore(&mut self, gc: u32) -> bool {
        if self.ignores(gc) {
            return true;
        }

        for slot in self.ignore_list.iter_mut() {
            if *slot == 0 {
                *slot = gc;
                return true;
            }
        }

        false
    }

    pub fn remove_ignore(&mut self, gc: u32) -> bool {
        for slot in self.ignore_list.iter_mut() {
            if *slot == gc {
                *slot = 0;
                return true;
            }
        }

        false
    }

    /// Does the blocklist kept at the shipgate suppress this kind of
    /// traffic from `gc`?
    pub fn blocklist_blocks(&self, gc: u32, what: u32) -> bool {
        self.blocklist
            .iter()
            .any(|e| e.gc == gc && e.flags & what != 0)
    }

    /// Add an item to the inventory shadow, merging stackables. Mirrors the
    /// client's own behavior so the shadow stays in sync.
    pub fn inv_add(&mut self, it: ItemData) -> Result<(), ()> {
        if self.items.len() >= 30 {
            return Err(());
        }

        if self.items.iter().any(|i| i.item_id == it.item_id) {
            return Err(());
        }

        if item::is_stackable(it.data[0]) {
            for existing in self.items.iter_mut() {
                if existing.data[0] == it.data[0] {
                    let qty = existing.quantity().saturating_add(it.quantity());
                    existing.set_quantity(qty);
                    return Ok(());
                }
            }
        }

        self.items.push(it);
        Ok(())
    }

    /// Remove `amt` of an item (0xFFFFFFFF removes the whole stack).
    pub fn inv_remove(&mut self, item_id: u32, amt: u32) -> Option<ItemData> {
        let idx = self.items.iter().position(|i| i.item_id == item_id)?;

        let it = &mut self.items[idx];
        if item::is_stackable(it.data[0]) && amt != 0xFFFF_FFFF {
            let have = it.quantity() as u32;
            if amt < have {
                it.set_quantity((have - amt) as u8);
                return Some(*it);
            }
        }

        Some(self.items.remove(idx))
    }

    /// Deposit an item into the Blue Burst bank, merging stackables.
    pub fn bank_deposit(&mut self, it: ItemData) -> Result<(), ()> {
        if self.bank.len() >= BANK_MAX_ITEMS {
            return Err(());
        }

        if item::is_stackable(it.data[0]) {
            for existing in self.bank.iter_mut() {
                if existing.data[0] == it.data[0] {
                    let qty = existing.quantity().saturating_add(it.quantity());
                    existing.set_quantity(qty);
                    return Ok(());
                }
            }
        }

        self.bank.push(it);
        Ok(())
    }

    /// Take `amt` of a banked item back out. Taking more than the stack
    /// holds fails; taking exactly all of it removes the entry.
    pub fn bank_take(&mut self, item_id: u32, amt: u8) -> Option<ItemData> {
        let idx = self.bank.iter().position(|i| i.item_id == item_id)?;

        let it = &mut self.bank[idx];
        if item::is_stackable(it.data[0]) {
            let have = it.quantity();

            if amt < have {
                it.set_quantity(have - amt);
                let mut out = *it;
                out.set_quantity(amt);
                return Some(out);
            }

            if amt > have {
                return None;
            }
        }

        Some(self.bank.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Client {
        let (tx, _rx) = mpsc::unbounded_channel();
        Client::new(1, "127.0.0.1:9000".parse().unwrap(), 1, Version::Dcv2, tx)
    }

    #[test]
    fn ignore_list_is_bounded() {
        let c = test_client();
        let mut st = c.lock();

        for gc in 1..=IGNORE_LIST_SIZE as u32 {
            assert!(st.add_ignore(gc));
        }

        assert!(!st.add_ignore(99));
        assert!(st.remove_ignore(3));
        assert!(st.add_ignore(99));
        assert!(st.ignores(99));
        assert!(!st.ignores(3));
    }

    #[test]
    fn stackables_merge_in_the_inventory_shadow() {
        let c = test_client();
        let mut st = c.lock();

        let mut mate = ItemData::from_dwords([item::ITEM_MONOMATE, 0, 0, 0]);
        mate.set_quantity(1);
        mate.item_id = 0x10;
        st.inv_add(mate).unwrap();

        let mut more = mate;
        more.item_id = 0x11;
        st.inv_add(more).unwrap();

        assert_eq!(st.items.len(), 1);
        assert_eq!(st.items[0].quantity(), 2);

        let taken = st.inv_remove(0x10, 1).unwrap();
        assert_eq!(taken.quantity(), 1);
        assert_eq!(st.items.len(), 1);

        st.inv_remove(0x10, 0xFFFF_FFFF).unwrap();
        assert!(st.items.is_empty());
    }

    #[test]
    fn bank_stacks_and_splits() {
        let c = test_client();
        let mut st = c.lock();

        let mut mates = ItemData::from_dwords([item::ITEM_MONOMATE, 0, 0, 0]);
        mates.set_quantity(5);
        mates.item_id = 0x30;
        st.bank_deposit(mates).unwrap();

        let mut more = mates;
        more.item_id = 0x31;
        more.set_quantity(2);
        st.bank_deposit(more).unwrap();
        assert_eq!(st.bank.len(), 1);
        assert_eq!(st.bank[0].quantity(), 7);

        // Partial withdrawal splits the stack.
        let taken = st.bank_take(0x30, 3).unwrap();
        assert_eq!(taken.quantity(), 3);
        assert_eq!(st.bank[0].quantity(), 4);

        // Overdraw fails, exact take empties the slot.
        assert!(st.bank_take(0x30, 9).is_none());
        assert!(st.bank_take(0x30, 4).is_some());
        assert!(st.bank.is_empty());
    }

    #[test]
    fn duplicate_item_ids_are_rejected() {
        let c = test_client();
        let mut st = c.lock();

        let mut sword = ItemData::from_dwords([0x0000_0100, 0, 0, 0]);
        sword.item_id = 0x20;
        st.inv_add(sword).unwrap();
        assert!(st.inv_add(sword).is_err());
    }
}
