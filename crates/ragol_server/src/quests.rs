//! Quest descriptors, the per-team quest state and the quest-flag
//! protocol.
//!
//! Quest bytecode runs on the clients; the server tracks which quest a team
//! is in, swaps the enemy/object arrays from the map cache, mirrors a set
//! of synced registers to late joiners, and round-trips persistent quest
//! flags through the shipgate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;

use ragol_common::Version;

use crate::lobby::{
    self, Lobby, LOBBY_FLAG_QUESTING, LOBBY_FLAG_QUESTSEL, LOBBY_FLAG_SERVER_DROPS,
    LOBBY_QFLAG_DATA, LOBBY_QFLAG_JOIN, LOBBY_QFLAG_SHORT, LOBBY_QFLAG_SYNC_REGS,
};

/// Drop behavior a quest can pin onto an enemy id or type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DropPolicy {
    /// Never drop anything.
    Nothing,
    /// Common drops only, and semi-rares are filtered.
    NoRare,
    /// Common drops including semi-rares, no true rares.
    Partial,
    /// Unrestricted.
    Free,
}

#[derive(Debug, Copy, Clone)]
pub struct QuestEnemy {
    pub id: u32,
    pub policy: DropPolicy,
}

pub fn search_enemy_list(list: &[QuestEnemy], id: u32) -> Option<DropPolicy> {
    list.iter().find(|e| e.id == id).map(|e| e.policy)
}

/// Quest behavior flags from the descriptor file.
pub const QUEST_FLAG16: u32 = 0x0000_0001;
pub const QUEST_DATAFL: u32 = 0x0000_0002;
pub const QUEST_JOINABLE: u32 = 0x0000_0004;
pub const QUEST_SYNC_REGS: u32 = 0x0000_0008;

/// One language/version variant of a quest.
#[derive(Debug, Clone, Default)]
pub struct QuestDescriptor {
    pub qid: u32,
    pub name: String,
    pub episode: u8,
    pub flags: u32,
    pub server_flag16_reg: u8,
    pub server_data_reg: u8,
    pub server_ctl_reg: u8,
    pub synced_regs: Vec<u8>,
    pub monster_ids: Vec<QuestEnemy>,
    pub monster_types: Vec<QuestEnemy>,
    /// Path of the quest's `.dat` blob, used to (re)build the map cache.
    pub dat_file: Option<PathBuf>,
}

/// The ship-wide quest table: qid -> per-(version, language) descriptors.
#[derive(Debug, Default)]
pub struct QuestMap {
    entries: HashMap<u32, QuestMapEntry>,
}

#[derive(Debug, Default)]
pub struct QuestMapEntry {
    /// Keyed by (version wire code, language code).
    variants: HashMap<(u8, u8), Arc<QuestDescriptor>>,
}

impl QuestMap {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, version: Version, language: u8, q: QuestDescriptor) {
        self.entries
            .entry(q.qid)
            .or_default()
            .variants
            .insert((version.wire_code(), language), Arc::new(q));
    }

    pub fn lookup(&self, qid: u32) -> Option<&QuestMapEntry> {
        self.entries.get(&qid)
    }
}

impl QuestMapEntry {
    pub fn variant(&self, version: Version, language: u8) -> Option<Arc<QuestDescriptor>> {
        self.variants
            .get(&(version.wire_code(), language))
            .cloned()
    }

    /// First variant for a version in any language. Several fields (flags,
    /// monster lists) only need to be present in one language.
    pub fn any_language(&self, version: Version) -> Option<Arc<QuestDescriptor>> {
        (0..5u8)
            .filter_map(|lang| self.variant(version, lang))
            .next()
    }

    /// The first variant, in any language, that carries a monster list.
    pub fn monster_lists(&self, version: Version) -> Option<Arc<QuestDescriptor>> {
        (0..5u8)
            .filter_map(|lang| self.variant(version, lang))
            .find(|q| !q.monster_ids.is_empty() || !q.monster_types.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuestError {
    #[error("quest {0} is not configured")]
    Unknown(u32),
    #[error("quest {0} has no usable variant")]
    NoVariant(u32),
    #[error(transparent)]
    Map(#[from] crate::map::MapError),
}

/// Set up a team for a quest: flags, episode, registers and the cached
/// enemy/object override. The caller broadcasts the quest files afterward
/// and flushes kill counters beforehand.
pub fn setup_quest(
    qmap: &QuestMap,
    quests_dir: Option<&PathBuf>,
    l: &Arc<Lobby>,
    qid: u32,
    lang: u8,
) -> Result<(), QuestError> {
    let entry = qmap.lookup(qid).ok_or(QuestError::Unknown(qid))?;

    let mut st = l.lock();

    let q = entry
        .variant(st.version, lang)
        .or_else(|| entry.any_language(st.version))
        .ok_or(QuestError::NoVariant(qid))?;

    // GC and BB quests pin the episode.
    if st.version >= Version::Gc {
        st.episode = q.episode;
    }

    st.flags |= LOBBY_FLAG_QUESTING;
    st.flags &= !LOBBY_FLAG_QUESTSEL;
    st.qid = qid;
    st.qlang = lang;

    st.q_flags = 0;
    st.sync_regs.clear();
    st.reg_vals.clear();

    if q.flags & QUEST_FLAG16 != 0 {
        st.q_shortflag_reg = q.server_flag16_reg;
        st.q_flags |= LOBBY_QFLAG_SHORT;
    }

    if q.flags & QUEST_DATAFL != 0 {
        st.q_data_reg = q.server_data_reg;
        st.q_ctl_reg = q.server_ctl_reg;
        st.q_flags |= LOBBY_QFLAG_DATA;
    }

    if q.flags & QUEST_JOINABLE != 0 {
        st.q_flags |= LOBBY_QFLAG_JOIN;

        if q.flags & QUEST_SYNC_REGS != 0 {
            st.q_flags |= LOBBY_QFLAG_SYNC_REGS;
            st.sync_regs = q.synced_regs.clone();
            st.reg_vals = vec![0; q.synced_regs.len()];
        }
    }

    // Swap in the quest's enemies and objects if we're doing server-side
    // drops in this team.
    if st.flags & LOBBY_FLAG_SERVER_DROPS != 0 {
        if let Some(dir) = quests_dir {
            // PC shares the v2 cache.
            let cache = crate::map::quest_cache_path(dir, st.version, qid);

            // Clear the flag while the arrays are inconsistent.
            st.flags &= !LOBBY_FLAG_SERVER_DROPS;

            match crate::map::load_quest_enemies(&cache, st.difficulty, st.event) {
                Ok((enemies, objects)) => {
                    st.map_enemies = Some(enemies);
                    st.map_objects = Some(objects);

                    if let Some(ml) = entry.monster_lists(st.version) {
                        st.mids = ml.monster_ids.clone();
                        st.mtypes = ml.monster_types.clone();
                    } else {
                        st.mids.clear();
                        st.mtypes.clear();
                    }

                    st.flags |= LOBBY_FLAG_SERVER_DROPS;
                }
                Err(e) => {
                    warn!("cannot load quest map cache for {:08x}: {}", qid, e);
                }
            }
        }
    }

    Ok(())
}

/// The register values a late joiner must observe, in sync-list order.
/// Zero-valued registers are skipped, as the game only sends changes.
pub fn registers_for_joiner(st: &lobby::LobbyState) -> Vec<(u8, u32)> {
    if st.q_flags & LOBBY_QFLAG_SYNC_REGS == 0 {
        return Vec::new();
    }

    st.sync_regs
        .iter()
        .zip(st.reg_vals.iter())
        .filter(|(_, v)| **v != 0)
        .map(|(r, v)| (*r, *v))
        .collect()
}

/// Record a synced register write from a client.
pub fn record_register(st: &mut lobby::LobbyState, reg: u8, value: u32) {
    if st.q_flags & LOBBY_QFLAG_SYNC_REGS == 0 {
        return;
    }

    if let Some(idx) = st.sync_regs.iter().position(|r| *r == reg) {
        st.reg_vals[idx] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::CreateGameParams;
    use ragol_common::rng::Mt19937;

    fn test_team() -> Arc<Lobby> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let creator = Arc::new(crate::client::Client::new(
            1,
            "127.0.0.1:1".parse().unwrap(),
            1,
            Version::Gc,
            tx,
        ));

        let mut rng = Mt19937::new(3);
        lobby::create_game(
            1,
            0x20,
            &mut rng,
            CreateGameParams {
                name: "Quest".into(),
                passwd: String::new(),
                difficulty: 1,
                battle: false,
                challenge: false,
                v2: false,
                version: Version::Gc,
                section: 2,
                event: 0,
                episode: 1,
                single_player: false,
            },
            &creator,
        )
    }

    fn joinable_quest(qid: u32) -> QuestDescriptor {
        QuestDescriptor {
            qid,
            name: "Test Quest".into(),
            episode: 2,
            flags: QUEST_JOINABLE | QUEST_SYNC_REGS,
            synced_regs: vec![10, 11, 12],
            ..Default::default()
        }
    }

    #[test]
    fn setting_up_a_quest_marks_the_team() {
        let mut qmap = QuestMap::default();
        qmap.insert(Version::Gc, 1, joinable_quest(0x123));

        let l = test_team();
        setup_quest(&qmap, None, &l, 0x123, 1).unwrap();

        let st = l.lock();
        assert_eq!(st.qid, 0x123);
        assert_ne!(st.flags & LOBBY_FLAG_QUESTING, 0);
        assert_eq!(st.episode, 2); // pinned from the descriptor on GC
        assert_ne!(st.q_flags & LOBBY_QFLAG_JOIN, 0);
        assert_eq!(st.sync_regs, vec![10, 11, 12]);
        assert_eq!(st.reg_vals, vec![0, 0, 0]);
    }

    #[test]
    fn unknown_quests_are_rejected() {
        let qmap = QuestMap::default();
        let l = test_team();
        assert!(matches!(
            setup_quest(&qmap, None, &l, 7, 0),
            Err(QuestError::Unknown(7))
        ));
    }

    #[test]
    fn falls_back_across_languages() {
        let mut qmap = QuestMap::default();
        qmap.insert(Version::Gc, 3, joinable_quest(0x55));

        let l = test_team();
        // Requested language 0 isn't registered; language 3 is.
        setup_quest(&qmap, None, &l, 0x55, 0).unwrap();
        assert_eq!(l.lock().qid, 0x55);
    }

    #[test]
    fn register_mirror_round_trips() {
        let mut qmap = QuestMap::default();
        qmap.insert(Version::Gc, 1, joinable_quest(1));

        let l = test_team();
        setup_quest(&qmap, None, &l, 1, 1).unwrap();

        let mut st = l.lock();
        record_register(&mut st, 11, 500);
        record_register(&mut st, 99, 7); // not a synced register

        assert_eq!(registers_for_joiner(&st), vec![(11, 500)]);

        // Deleting (zeroing) the register restores the initial view.
        record_register(&mut st, 11, 0);
        assert!(registers_for_joiner(&st).is_empty());
    }
}
